// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Accelerator-sequence stub: a one-shot copy-and-CRC task the send path
//! launches when an H2C_DATA segment needs a staging buffer. Real hardware
//! offload is a non-goal; this executes
//! the equivalent work inline but keeps the same suspend/resume shape so
//! the qpair's disconnect logic (`in_progress_accel`) doesn't need to care
//! which backend ran it.

use bytes::Bytes;

use crate::wire::digest::compute_data_digest;

/// Result of a completed accelerator sequence: the staged bytes plus the
/// CRC32C computed over them, ready to append as the segment's ddgst.
pub struct AccelResult {
    pub staged: Bytes,
    pub ddgst: u32,
}

/// Runs a copy-and-CRC sequence over `src`, producing a contiguous staging
/// buffer and its data digest. Modeled as a function returning immediately
/// since there is no real offload queue backing it, but kept separate from
/// the send path so a future hardware backend only has to replace this
/// function's body.
pub fn run_copy_and_crc(src: &[Bytes]) -> AccelResult {
    let total_len: usize = src.iter().map(|b| b.len()).sum();
    let mut staged = Vec::with_capacity(total_len);
    for chunk in src {
        staged.extend_from_slice(chunk);
    }
    let ddgst = compute_data_digest(&staged);
    AccelResult { staged: Bytes::from(staged), ddgst }
}
