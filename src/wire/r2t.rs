// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! R2T ("Ready to Transfer") header.

use anyhow::{Result, anyhow, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U16, U32};

use crate::wire::common::{CommonHeaderRaw, PduType};

pub const R2T_HDR_LEN: usize = 24;

/// `r2t_hdr := common(type=0x09), u16 cccid, u16 ttag, u32 r2to, u32 r2tl`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct R2tHeader {
    pub common: CommonHeaderRaw,
    pub cccid: U16<zerocopy::LittleEndian>,
    pub ttag: U16<zerocopy::LittleEndian>,
    pub r2to: U32<zerocopy::LittleEndian>,
    pub r2tl: U32<zerocopy::LittleEndian>,
    pub reserved: U32<zerocopy::LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<R2tHeader>() == R2T_HDR_LEN);

impl R2tHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != R2T_HDR_LEN {
            bail!("R2T hlen must be {R2T_HDR_LEN}, got {}", buf.len());
        }
        let hdr: Self =
            Self::read_from_bytes(buf).map_err(|e| anyhow!("failed to decode R2T: {e}"))?;
        if hdr.common.pdu_type()? != PduType::R2t {
            bail!("expected R2T, got {:?}", hdr.common.pdu_type()?);
        }
        Ok(hdr)
    }

    pub fn new(cccid: u16, ttag: u16, r2to: u32, r2tl: u32) -> Self {
        Self {
            common: CommonHeaderRaw {
                pdu_type: PduType::R2t as u8,
                flags: 0,
                hlen: R2T_HDR_LEN as u8,
                pdo: 0,
                plen: U32::new(R2T_HDR_LEN as u32),
            },
            cccid: U16::new(cccid),
            ttag: U16::new(ttag),
            r2to: U32::new(r2to),
            r2tl: U32::new(r2tl),
            reserved: U32::new(0),
        }
    }
}
