// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! H2C_DATA / C2H_DATA headers.

use anyhow::{Result, anyhow, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U16, U32};

use crate::wire::common::{CommonHeaderRaw, PduType};

pub const DATA_HDR_LEN: usize = 24;

/// Shared layout for H2C_DATA and C2H_DATA:
/// `common, u16 cccid, u16 rsvd, u32 datao, u32 datal, u32 rsvd`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DataPduHeader {
    pub common: CommonHeaderRaw,
    pub cccid: U16<zerocopy::LittleEndian>,
    pub reserved1: U16<zerocopy::LittleEndian>,
    pub datao: U32<zerocopy::LittleEndian>,
    pub datal: U32<zerocopy::LittleEndian>,
    pub reserved2: U32<zerocopy::LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<DataPduHeader>() == DATA_HDR_LEN);

impl DataPduHeader {
    pub fn decode(buf: &[u8], expected: PduType) -> Result<Self> {
        if buf.len() != DATA_HDR_LEN {
            bail!("data PDU hlen must be {DATA_HDR_LEN}, got {}", buf.len());
        }
        let hdr: Self =
            Self::read_from_bytes(buf).map_err(|e| anyhow!("failed to decode {expected:?}: {e}"))?;
        if hdr.common.pdu_type()? != expected {
            bail!("expected {:?}, got {:?}", expected, hdr.common.pdu_type()?);
        }
        Ok(hdr)
    }

    pub fn new(ty: PduType, cccid: u16, datao: u32, datal: u32, pdo: u8, plen: u32, flags: u8) -> Self {
        Self {
            common: CommonHeaderRaw {
                pdu_type: ty as u8,
                flags,
                hlen: DATA_HDR_LEN as u8,
                pdo,
                plen: U32::new(plen),
            },
            cccid: U16::new(cccid),
            reserved1: U16::new(0),
            datao: U32::new(datao),
            datal: U32::new(datal),
            reserved2: U32::new(0),
        }
    }
}
