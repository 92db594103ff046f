// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CAPSULE_CMD / CAPSULE_RESP: the NVMe SQE/CQE carried inside an
//! NVMe/TCP capsule. Only the fields this transport needs to route and
//! complete commands are modeled (full admin command set is a non-goal).

use anyhow::{Result, anyhow, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U16, U32, U64};

use crate::wire::common::{CommonHeaderRaw, PduType};

pub const CAPSULE_CMD_HLEN: usize = 72;
pub const CAPSULE_RESP_HLEN: usize = 24;
pub const SQE_LEN: usize = 64;
pub const CQE_LEN: usize = 16;

/// SGL descriptor subtype, set on the send path: whether the payload is
/// carried in-capsule or must be fetched via R2T/H2C.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglSubtype {
    /// `DATA_BLOCK` descriptor w/ `OFFSET` subtype: payload follows
    /// in-capsule.
    DataBlockOffset = 0x4,
    /// `TRANSPORT_DATA_BLOCK`: target must pull the payload via R2T.
    TransportDataBlock = 0x5,
}

/// A minimal 16-byte Keyed SGL Data Block descriptor: address, length, and
/// the type/subtype nibble pair that distinguishes in-capsule from R2T
/// payloads.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SglDescriptor {
    pub address: U64<zerocopy::LittleEndian>,
    pub length: U32<zerocopy::LittleEndian>,
    pub key: U16<zerocopy::LittleEndian>,
    pub type_subtype: u8,
    pub reserved: u8,
}

impl SglDescriptor {
    pub fn new(subtype: SglSubtype, address: u64, length: u32) -> Self {
        Self {
            address: U64::new(address),
            length: U32::new(length),
            key: U16::new(0),
            type_subtype: subtype as u8,
            reserved: 0,
        }
    }

    pub fn subtype(&self) -> Option<SglSubtype> {
        match self.type_subtype {
            0x4 => Some(SglSubtype::DataBlockOffset),
            0x5 => Some(SglSubtype::TransportDataBlock),
            _ => None,
        }
    }
}

/// 64-byte NVMe Submission Queue Entry, as carried inside a CAPSULE_CMD.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NvmeSqe {
    pub opcode: u8,
    pub flags: u8,
    pub cid: U16<zerocopy::LittleEndian>,
    pub nsid: U32<zerocopy::LittleEndian>,
    pub reserved1: U64<zerocopy::LittleEndian>,
    pub mptr: U64<zerocopy::LittleEndian>,
    pub sgl: SglDescriptor,
    pub cdw10: U32<zerocopy::LittleEndian>,
    pub cdw11: U32<zerocopy::LittleEndian>,
    pub cdw12: U32<zerocopy::LittleEndian>,
    pub cdw13: U32<zerocopy::LittleEndian>,
    pub cdw14: U32<zerocopy::LittleEndian>,
    pub cdw15: U32<zerocopy::LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<NvmeSqe>() == SQE_LEN);

/// 16-byte NVMe Completion Queue Entry, as carried inside a CAPSULE_RESP.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NvmeCqe {
    pub result: U32<zerocopy::LittleEndian>,
    pub reserved: U32<zerocopy::LittleEndian>,
    pub sq_head: U16<zerocopy::LittleEndian>,
    pub sq_id: U16<zerocopy::LittleEndian>,
    pub cid: U16<zerocopy::LittleEndian>,
    pub status: U16<zerocopy::LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<NvmeCqe>() == CQE_LEN);

impl NvmeCqe {
    /// `(sct, sc)` decoded from the status field (phase bit masked out).
    pub fn sct_sc(&self) -> (u8, u8) {
        let raw = self.status.get();
        (((raw >> 9) & 0x7) as u8, ((raw >> 1) & 0xff) as u8)
    }

    pub fn is_success(&self) -> bool {
        self.sct_sc() == (0, 0)
    }
}

/// CAPSULE_CMD common header + embedded SQE:
/// `common(type=0x04), sqe(64 bytes), optional in-capsule data`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CapsuleCmdHeader {
    pub common: CommonHeaderRaw,
    pub sqe: NvmeSqe,
}

const _: () = assert!(core::mem::size_of::<CapsuleCmdHeader>() == CAPSULE_CMD_HLEN);

/// CAPSULE_RESP common header + embedded CQE.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CapsuleRespHeader {
    pub common: CommonHeaderRaw,
    pub cqe: NvmeCqe,
}

const _: () = assert!(core::mem::size_of::<CapsuleRespHeader>() == CAPSULE_RESP_HLEN);

impl CapsuleCmdHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CAPSULE_CMD_HLEN {
            bail!("CapsuleCmd hlen must be {CAPSULE_CMD_HLEN}, got {}", buf.len());
        }
        Self::read_from_bytes(buf).map_err(|e| anyhow!("failed to decode CapsuleCmd: {e}"))
    }
}

impl CapsuleRespHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CAPSULE_RESP_HLEN {
            bail!(
                "CapsuleResp hlen must be {CAPSULE_RESP_HLEN}, got {}",
                buf.len()
            );
        }
        Self::read_from_bytes(buf)
            .map_err(|e| anyhow!("failed to decode CapsuleResp: {e}"))
    }

    pub fn new(cid: u16, common_pdo_plen: (u8, u32)) -> Self {
        let (pdo, plen) = common_pdo_plen;
        Self {
            common: CommonHeaderRaw {
                pdu_type: PduType::CapsuleResp as u8,
                flags: 0,
                hlen: CAPSULE_RESP_HLEN as u8,
                pdo,
                plen: U32::new(plen),
            },
            cqe: NvmeCqe {
                cid: U16::new(cid),
                ..Default::default()
            },
        }
    }
}
