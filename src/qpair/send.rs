// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CAPSULE_CMD send-path framing.

use bytes::{Bytes, BytesMut};
use zerocopy::IntoBytes;

use crate::{
    qpair::request::{PayloadDescriptor, Request},
    wire::{
        capsule::{CAPSULE_CMD_HLEN, CapsuleCmdHeader, NvmeSqe, SglDescriptor, SglSubtype},
        common::{HeaderFlags, compute_pdo},
        digest::{compute_data_digest, compute_header_digest},
    },
};

/// A framed CAPSULE_CMD ready to hand to the socket as send segments.
pub struct FramedCapsule {
    pub header: BytesMut,
    /// In-capsule payload segments, empty when the payload goes via R2T.
    pub data_segments: Vec<Bytes>,
    /// Whether the payload was placed in-capsule (`false` means the
    /// caller must now wait for R2T).
    pub in_capsule: bool,
}

/// Builds the CAPSULE_CMD PDU for `request`, choosing in-capsule vs
/// TRANSPORT_DATA_BLOCK per the `ioccsz` threshold (or 8192 for
/// admin/fabric qpairs when `ioccsz` is `None`).
pub fn frame_capsule_cmd(request: &Request, mut sqe: NvmeSqe, cpda: u8, enable_hdgst: bool, enable_ddgst: bool, ioccsz: Option<u32>) -> FramedCapsule {
    let payload_len = request.payload.len();
    let in_capsule_limit = ioccsz.unwrap_or(8192) as usize;
    let in_capsule = payload_len > 0 && payload_len <= in_capsule_limit;

    sqe.sgl = if payload_len == 0 {
        SglDescriptor::default()
    } else if in_capsule {
        SglDescriptor::new(SglSubtype::DataBlockOffset, CAPSULE_CMD_HLEN as u64, payload_len as u32)
    } else {
        SglDescriptor::new(SglSubtype::TransportDataBlock, 0, payload_len as u32)
    };

    let plen_before_data = CAPSULE_CMD_HLEN + if enable_hdgst { 4 } else { 0 };
    let data_segments = if in_capsule { payload_segments(&request.payload) } else { Vec::new() };
    let data_len: usize = data_segments.iter().map(|b| b.len()).sum();
    let ddgst_len = if in_capsule && enable_ddgst && data_len > 0 { 4 } else { 0 };

    let pdo = if in_capsule { compute_pdo(plen_before_data, cpda) } else { plen_before_data };
    let plen = pdo + data_len + ddgst_len;

    let mut flags = HeaderFlags::empty();
    if enable_hdgst {
        flags |= HeaderFlags::HDGSTF;
    }
    if in_capsule && enable_ddgst && data_len > 0 {
        flags |= HeaderFlags::DDGSTF;
    }

    let mut capsule = CapsuleCmdHeader { common: Default::default(), sqe };
    capsule.common.pdu_type = crate::wire::common::PduType::CapsuleCmd as u8;
    capsule.common.flags = flags.bits();
    capsule.common.hlen = CAPSULE_CMD_HLEN as u8;
    capsule.common.pdo = pdo as u8;
    capsule.common.plen = zerocopy::U32::new(plen as u32);

    let mut header = BytesMut::with_capacity(pdo);
    header.extend_from_slice(capsule.as_bytes());
    if enable_hdgst {
        let hd = compute_header_digest(&header[..CAPSULE_CMD_HLEN]);
        header.extend_from_slice(&hd.to_le_bytes());
    }
    while header.len() < pdo {
        header.extend_from_slice(&[0u8]);
    }

    let mut data_segments = data_segments;
    if ddgst_len > 0 {
        let mut acc = Vec::with_capacity(data_len);
        for seg in &data_segments {
            acc.extend_from_slice(seg);
        }
        let dd = compute_data_digest(&acc);
        data_segments.push(Bytes::copy_from_slice(&dd.to_le_bytes()));
    }

    FramedCapsule { header, data_segments, in_capsule }
}

fn payload_segments(payload: &PayloadDescriptor) -> Vec<Bytes> {
    match payload {
        PayloadDescriptor::None => Vec::new(),
        PayloadDescriptor::Contig(b) => vec![b.clone()],
        PayloadDescriptor::Iov(v) => v.clone(),
        PayloadDescriptor::ZeroCopy(chunks) => chunks.iter().map(|p| p.bytes.clone()).collect(),
        PayloadDescriptor::WithMemoryDomain { bytes, .. } => vec![bytes.clone()],
    }
}
