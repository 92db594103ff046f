// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Initial Connection request/response PDUs (ICReq/ICResp), used once per
//! TCP connection before the NVMe-oF fabric CONNECT exchange.

use anyhow::{Result, anyhow, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U16, U32};

use crate::wire::common::{COMMON_HDR_LEN, CommonHeaderRaw, PduType};

pub const IC_PDU_LEN: usize = 128;

/// `ic_req` wire layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IcReq {
    pub common: CommonHeaderRaw,
    pub pfv: U16<zerocopy::LittleEndian>,
    pub hpda: u8,
    pub digest: u8,
    pub maxr2t: U32<zerocopy::LittleEndian>,
    pub reserved: [u8; 112],
}

/// `ic_resp` wire layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IcResp {
    pub common: CommonHeaderRaw,
    pub pfv: U16<zerocopy::LittleEndian>,
    pub cpda: u8,
    pub digest: u8,
    pub maxh2cdata: U32<zerocopy::LittleEndian>,
    pub reserved: [u8; 112],
}

const HDGST_BIT: u8 = 0x01;
const DDGST_BIT: u8 = 0x02;

impl IcReq {
    pub fn new(hpda: u8, enable_hdgst: bool, enable_ddgst: bool, maxr2t: u32) -> Self {
        let mut digest = 0u8;
        if enable_hdgst {
            digest |= HDGST_BIT;
        }
        if enable_ddgst {
            digest |= DDGST_BIT;
        }
        Self {
            common: CommonHeaderRaw {
                pdu_type: PduType::IcReq as u8,
                flags: 0,
                hlen: IC_PDU_LEN as u8,
                pdo: 0,
                plen: U32::new(IC_PDU_LEN as u32),
            },
            pfv: U16::new(0),
            hpda,
            digest,
            maxr2t: U32::new(maxr2t),
            reserved: [0u8; 112],
        }
    }

    pub fn to_bytes(&self) -> [u8; IC_PDU_LEN] {
        let mut buf = [0u8; IC_PDU_LEN];
        buf.copy_from_slice(self.as_bytes());
        buf
    }
}

impl IcResp {
    /// Decode and validate an ICResp: `pfv==0`, `maxh2cdata>=4096`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != IC_PDU_LEN {
            bail!(
                "ICResp buffer length must be {IC_PDU_LEN}, got {}",
                buf.len()
            );
        }
        let resp = Self::read_from_bytes(buf)
            .map_err(|e| anyhow!("failed to decode ICResp: {e}"))?;
        if resp.pfv.get() != 0 {
            bail!("ICResp pfv must be 0, got {}", resp.pfv.get());
        }
        if resp.maxh2cdata.get() < 4096 {
            bail!(
                "ICResp maxh2cdata must be >= 4096, got {}",
                resp.maxh2cdata.get()
            );
        }
        Ok(resp)
    }

    pub fn header_digest_enabled(&self) -> bool {
        self.digest & HDGST_BIT != 0
    }

    pub fn data_digest_enabled(&self) -> bool {
        self.digest & DDGST_BIT != 0
    }
}

const _: () = assert!(core::mem::size_of::<IcReq>() == IC_PDU_LEN);
const _: () = assert!(core::mem::size_of::<IcResp>() == IC_PDU_LEN);
const _: () = assert!(COMMON_HDR_LEN == 8);
