// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference-counted packet buffers shared between a zero-copy send and
//! the kernel's deferred completion notification.

use std::sync::Arc;

use bytes::Bytes;

/// One outstanding zero-copy chunk: the bytes the kernel still holds a
/// reference to, tagged with the `sendmsg` sequence index the completion
/// notification will report back.
#[derive(Debug, Clone)]
pub struct PacketRef {
    pub seq: u32,
    pub bytes: Bytes,
}

impl PacketRef {
    pub fn new(seq: u32, bytes: Bytes) -> Self {
        Self { seq, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A small pool of reusable `BytesMut` scratch buffers for recv paths,
/// avoiding an allocation per poll iteration under steady-state traffic.
#[derive(Debug, Default)]
pub struct PacketPool {
    free: Vec<bytes::BytesMut>,
    chunk_len: usize,
}

impl PacketPool {
    pub fn new(chunk_len: usize) -> Self {
        Self {
            free: Vec::new(),
            chunk_len,
        }
    }

    pub fn acquire(&mut self) -> bytes::BytesMut {
        self.free
            .pop()
            .unwrap_or_else(|| bytes::BytesMut::with_capacity(self.chunk_len))
    }

    pub fn release(&mut self, mut buf: bytes::BytesMut) {
        buf.clear();
        self.free.push(buf);
    }
}

/// Shared ownership wrapper so in-flight send batches and the completion
/// tracker can both reference the same underlying chunk list without
/// cloning the payload bytes.
pub type SharedChunks = Arc<Vec<PacketRef>>;
