// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-type dispatch over a decoded common header, mirroring the teacher's
//! `models::parse::Pdu` enum-dispatch but flattened to the PDU family this
//! transport actually receives on the qpair hot path.

use anyhow::{Result, bail};

use crate::wire::{
    capsule::{CapsuleRespHeader, NvmeCqe},
    common::{CommonHeaderRaw, PduType},
    data::DataPduHeader,
    ic::IcResp,
    r2t::R2tHeader,
    term::TermReqHeader,
};

/// A decoded PSH (per-type header) once the common header's type byte has
/// been read and dispatched on.
#[derive(Debug)]
pub enum DecodedPsh {
    IcResp(IcResp),
    CapsuleResp(CapsuleRespHeader),
    H2cData(DataPduHeader),
    C2hData(DataPduHeader),
    R2t(R2tHeader),
    C2hTermReq(TermReqHeader),
    H2cTermReq(TermReqHeader),
}

impl DecodedPsh {
    pub fn pdu_type(&self) -> PduType {
        match self {
            DecodedPsh::IcResp(_) => PduType::IcResp,
            DecodedPsh::CapsuleResp(_) => PduType::CapsuleResp,
            DecodedPsh::H2cData(_) => PduType::H2cData,
            DecodedPsh::C2hData(_) => PduType::C2hData,
            DecodedPsh::R2t(_) => PduType::R2t,
            DecodedPsh::C2hTermReq(_) => PduType::C2hTermReq,
            DecodedPsh::H2cTermReq(_) => PduType::H2cTermReq,
        }
    }

    pub fn common(&self) -> &CommonHeaderRaw {
        match self {
            DecodedPsh::IcResp(h) => &h.common,
            DecodedPsh::CapsuleResp(h) => &h.common,
            DecodedPsh::H2cData(h) | DecodedPsh::C2hData(h) => &h.common,
            DecodedPsh::R2t(h) => &h.common,
            DecodedPsh::C2hTermReq(h) | DecodedPsh::H2cTermReq(h) => &h.common,
        }
    }
}

/// Decode the PSH bytes (everything after the 8-byte common header, up to
/// `hlen`) given the already-decoded common header.
pub fn decode_psh(common: &CommonHeaderRaw, psh_bytes: &[u8]) -> Result<DecodedPsh> {
    let ty = common.pdu_type()?;
    // psh_bytes include the common header re-prefixed for types whose
    // zerocopy struct embeds it (all of ours do), so callers pass the full
    // `hlen`-sized buffer.
    Ok(match ty {
        PduType::IcResp => DecodedPsh::IcResp(IcResp::decode(psh_bytes)?),
        PduType::CapsuleResp => DecodedPsh::CapsuleResp(CapsuleRespHeader::decode(psh_bytes)?),
        PduType::H2cData => DecodedPsh::H2cData(DataPduHeader::decode(psh_bytes, PduType::H2cData)?),
        PduType::C2hData => DecodedPsh::C2hData(DataPduHeader::decode(psh_bytes, PduType::C2hData)?),
        PduType::R2t => DecodedPsh::R2t(R2tHeader::decode(psh_bytes)?),
        PduType::C2hTermReq => DecodedPsh::C2hTermReq(TermReqHeader::decode(psh_bytes)?),
        PduType::H2cTermReq => DecodedPsh::H2cTermReq(TermReqHeader::decode(psh_bytes)?),
        PduType::IcReq | PduType::CapsuleCmd => {
            bail!("{ty:?} is host-originated and never expected on the receive path")
        },
    })
}

pub fn default_cqe_for(cid: u16) -> NvmeCqe {
    NvmeCqe {
        cid: zerocopy::U16::new(cid),
        ..Default::default()
    }
}
