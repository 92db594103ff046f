// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod c2h_read_with_data_digest;
    pub mod header_digest_mismatch;
    pub mod in_capsule_write;
    pub mod r2t_write_with_digests;
}
