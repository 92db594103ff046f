// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U32};

/// Length in bytes of the NVMe/TCP common PDU header.
pub const COMMON_HDR_LEN: usize = 8;

/// Wire values for `pdu_type` (byte 0 of the common header).
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    #[default]
    IcReq = 0x00,
    IcResp = 0x01,
    H2cTermReq = 0x02,
    C2hTermReq = 0x03,
    CapsuleCmd = 0x04,
    CapsuleResp = 0x05,
    H2cData = 0x06,
    C2hData = 0x07,
    R2t = 0x09,
}

impl PduType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::IcReq,
            0x01 => Self::IcResp,
            0x02 => Self::H2cTermReq,
            0x03 => Self::C2hTermReq,
            0x04 => Self::CapsuleCmd,
            0x05 => Self::CapsuleResp,
            0x06 => Self::H2cData,
            0x07 => Self::C2hData,
            0x09 => Self::R2t,
            _ => return None,
        })
    }

    /// Fixed `hlen` for PDU types whose header has a single known size.
    /// `CapsuleCmd`/`CapsuleResp` carry a variable AHS-free common(64B sqe)
    /// layout handled by their own builders.
    pub fn expected_hlen(self) -> Option<u8> {
        match self {
            PduType::IcReq | PduType::IcResp => Some(128),
            PduType::CapsuleCmd => Some(72),
            PduType::CapsuleResp => Some(24),
            PduType::H2cData | PduType::C2hData => Some(24),
            PduType::R2t => Some(24),
            PduType::H2cTermReq | PduType::C2hTermReq => None,
        }
    }

    /// Whether this PDU type is legal while the qpair is still `INVALID`
    /// (i.e. before the ICReq/ICResp exchange has completed).
    pub fn legal_in_invalid_state(self) -> bool {
        matches!(self, PduType::IcResp)
    }
}

bitflags! {
    /// Common-header flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u8 {
        const HDGSTF   = 0x01;
        const DDGSTF   = 0x02;
        const LAST_PDU = 0x04;
        const SUCCESS  = 0x08;
    }
}

/// The 8-byte NVMe/TCP common PDU header, little-endian on the wire.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CommonHeaderRaw {
    pub pdu_type: u8,
    pub flags: u8,
    pub hlen: u8,
    pub pdo: u8,
    pub plen: U32<zerocopy::LittleEndian>,
}

impl CommonHeaderRaw {
    pub fn decode(buf: &[u8; COMMON_HDR_LEN]) -> Result<Self> {
        Self::read_from_bytes(buf.as_slice())
            .map_err(|e| anyhow::anyhow!("failed to decode common header: {e}"))
    }

    pub fn encode(&self, buf: &mut [u8; COMMON_HDR_LEN]) {
        buf.copy_from_slice(self.as_bytes());
    }

    pub fn header_flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    pub fn pdu_type(&self) -> Result<PduType> {
        PduType::from_u8(self.pdu_type)
            .ok_or_else(|| anyhow::anyhow!("unknown pdu_type 0x{:02x}", self.pdu_type))
    }

    pub fn plen(&self) -> u32 {
        self.plen.get()
    }
}

/// Round `n` up to the next multiple of `align` (`align` must be a power of
/// two). Used for AHS/data padding and `pdo` computation.
#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// `pdo = ceil(plen_before_data, (cpda+1)<<2)`.
#[inline]
pub fn compute_pdo(plen_before_data: usize, cpda: u8) -> usize {
    let unit = ((cpda as usize) + 1) << 2;
    align_up(plen_before_data, unit)
}

/// Validate a decoded common header against expectations for its declared
/// type before any state advance.
pub fn validate_common_header(hdr: &CommonHeaderRaw) -> Result<PduType> {
    let ty = hdr.pdu_type()?;
    if let Some(expected) = ty.expected_hlen() {
        if hdr.hlen != expected {
            bail!(
                "hlen {} does not match expected {} for {:?}",
                hdr.hlen,
                expected,
                ty
            );
        }
    }
    if ty == PduType::C2hData && (hdr.plen() as usize) < hdr.pdo as usize {
        bail!("plen {} is shorter than pdo {}", hdr.plen(), hdr.pdo);
    }
    Ok(ty)
}
