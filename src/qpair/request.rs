// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request bookkeeping and the CID allocator. The allocator follows the
//! same `Slab`-plus-sequence-tag trick used for PCIe command identifiers
//! elsewhere in the ecosystem: the slab index supplies the low bits, a
//! monotonically incrementing generation supplies the high bits, so a
//! stale completion referencing a reused slot is never mistaken for the
//! current occupant.

use std::num::Wrapping;

use bytes::{Bytes, BytesMut};
use slab::Slab;

use crate::{error::CompletionStatus, mem::map::Translation, sock::PacketRef};

const CID_KEY_BITS: u32 = 12;
const CID_KEY_MASK: u16 = (1 << CID_KEY_BITS) - 1;
pub const MAX_OUTSTANDING: usize = 1 << CID_KEY_BITS;
const CID_SEQ_OFFSET: Wrapping<u16> = Wrapping(1 << CID_KEY_BITS);

/// How a request's payload is backed, decided once at submit time.
#[derive(Debug, Clone)]
pub enum PayloadDescriptor {
    /// No data phase.
    None,
    /// A single contiguous user buffer.
    Contig(Bytes),
    /// A scatter/gather list of user buffers.
    Iov(Vec<Bytes>),
    /// Kernel-owned zero-copy chunks received off the wire, still pinned
    /// by outstanding `PacketRef`s.
    ZeroCopy(Vec<PacketRef>),
    /// A buffer whose local/remote keys were already resolved through the
    /// memory registry.
    WithMemoryDomain { bytes: Bytes, translation: Translation },
}

impl PayloadDescriptor {
    pub fn len(&self) -> usize {
        match self {
            PayloadDescriptor::None => 0,
            PayloadDescriptor::Contig(b) => b.len(),
            PayloadDescriptor::Iov(v) => v.iter().map(|b| b.len()).sum(),
            PayloadDescriptor::ZeroCopy(v) => v.iter().map(|p| p.len()).sum(),
            PayloadDescriptor::WithMemoryDomain { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the `[offset, offset+len)` slice of the flattened payload.
    /// Only contiguous and memory-domain-backed payloads are sliced
    /// directly; other descriptors are flattened first since R2T offsets
    /// are defined over the logical byte stream, not per-iov.
    pub fn slice(&self, offset: usize, len: usize) -> Bytes {
        match self {
            PayloadDescriptor::None => Bytes::new(),
            PayloadDescriptor::Contig(b) => b.slice(offset..offset + len),
            PayloadDescriptor::WithMemoryDomain { bytes, .. } => bytes.slice(offset..offset + len),
            PayloadDescriptor::Iov(v) => {
                let flat: Vec<u8> = v.iter().flat_map(|b| b.iter().copied()).collect();
                Bytes::copy_from_slice(&flat[offset..offset + len])
            },
            PayloadDescriptor::ZeroCopy(chunks) => {
                let flat: Vec<u8> = chunks.iter().flat_map(|p| p.bytes.iter().copied()).collect();
                Bytes::copy_from_slice(&flat[offset..offset + len])
            },
        }
    }

    /// Lands `data` at byte `offset` into the underlying destination
    /// buffer, growing it with zeros if `data` extends past the current
    /// length. Used by the C2H_DATA receive path; `Iov`/`ZeroCopy`/`None`
    /// have no single contiguous destination to write into and are left
    /// untouched (their bytes arrive already chunked or aren't expected).
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let dst = match self {
            PayloadDescriptor::Contig(b) => b,
            PayloadDescriptor::WithMemoryDomain { bytes, .. } => bytes,
            PayloadDescriptor::Iov(_) | PayloadDescriptor::ZeroCopy(_) | PayloadDescriptor::None => return,
        };
        let end = offset + data.len();
        let mut buf = BytesMut::from(&dst[..]);
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        *dst = buf.freeze();
    }
}

pub type CompletionFn = Box<dyn FnOnce(CompletionStatus, [u8; 16]) + Send>;

/// Per-request R2T flow-control state, populated once the send path
/// decides the payload doesn't fit in-capsule.
#[derive(Debug, Default, Clone, Copy)]
pub struct R2tState {
    pub datao: u32,
    pub r2tl_remain: u32,
    pub active_r2ts: u32,
    pub h2c_wait_ack: bool,
    pub r2t_wait_h2c: bool,
    pub ttag_next: Option<u16>,
    pub r2tl_remain_next: u32,
    /// `sendmsg` sequence number of the in-flight H2C_DATA segment, when
    /// sent with zero-copy. `None` once acked, or always for a
    /// non-zero-copy socket (whose sends complete immediately).
    pub h2c_sendmsg_idx: Option<u32>,
}

pub struct Request {
    pub cid: u16,
    pub opc: u8,
    pub nsid: u32,
    pub payload: PayloadDescriptor,
    pub expected_datao: u32,
    pub send_acked: bool,
    pub data_recv: bool,
    pub sendmsg_idx: Option<u32>,
    pub r2t: R2tState,
    pub on_complete: Option<CompletionFn>,
}

impl Request {
    pub fn is_complete(&self) -> bool {
        self.send_acked && (self.payload.is_empty() || self.data_recv)
    }
}

/// CID-keyed outstanding-request table, bounded at `MAX_OUTSTANDING`.
#[derive(Default)]
pub struct PendingRequests {
    slots: Slab<Request>,
    next_cid_high_bits: Wrapping<u16>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_cid_high_bits: Wrapping(0),
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_OUTSTANDING
    }

    /// Inserts `request`, stamping it with a freshly minted CID and
    /// returning that CID. Caller must have checked `is_full` first (the
    /// spec's `submit` returns `AGAIN` rather than have this panic).
    pub fn insert(&mut self, mut request: Request) -> u16 {
        let entry = self.slots.vacant_entry();
        assert!(entry.key() < MAX_OUTSTANDING, "pending request table overflowed its CID key space");
        let low_bits = entry.key() as u16 & CID_KEY_MASK;
        // High bits are a running generation counter, so a stale CID from
        // a reused slot is distinguishable from the live occupant.
        let cid = low_bits | (self.next_cid_high_bits.0 & !CID_KEY_MASK);
        self.next_cid_high_bits += CID_SEQ_OFFSET;
        request.cid = cid;
        entry.insert(request);
        cid
    }

    pub fn get(&self, cid: u16) -> Option<&Request> {
        self.slots.get((cid & CID_KEY_MASK) as usize)
    }

    pub fn get_mut(&mut self, cid: u16) -> Option<&mut Request> {
        self.slots.get_mut((cid & CID_KEY_MASK) as usize)
    }

    pub fn remove(&mut self, cid: u16) -> Option<Request> {
        let key = (cid & CID_KEY_MASK) as usize;
        if self.slots.contains(key) {
            Some(self.slots.remove(key))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter_in_insertion_order(&self) -> impl Iterator<Item = (u16, &Request)> {
        self.slots.iter().map(|(_, r)| (r.cid, r))
    }
}

fn blank_request() -> Request {
    Request {
        cid: 0,
        opc: 0x01,
        nsid: 1,
        payload: PayloadDescriptor::None,
        expected_datao: 0,
        send_acked: false,
        data_recv: false,
        sendmsg_idx: None,
        r2t: R2tState::default(),
        on_complete: None,
    }
}
