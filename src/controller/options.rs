// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Configurable transport options.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Socket-implementation option set, deserialized from the `Config` YAML
/// file alongside the fsdev options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketImplOptions {
    pub recv_buf_size: u32,
    pub send_buf_size: u32,
    pub enable_zerocopy_send: bool,
    pub enable_zerocopy_recv: bool,
    pub zerocopy_threshold: u32,
    #[serde(default = "default_true")]
    pub enable_tcp_nodelay: bool,
    pub buffers_pool_size: u32,
    pub packets_pool_size: u32,
    pub flush_batch_timeout_us: u64,
    pub flush_batch_iovcnt_threshold: u32,
    pub flush_batch_bytes_threshold: u32,
    pub enable_quickack: bool,
}

impl Default for SocketImplOptions {
    fn default() -> Self {
        Self {
            recv_buf_size: 128 * 1024,
            send_buf_size: 128 * 1024,
            enable_zerocopy_send: true,
            enable_zerocopy_recv: false,
            zerocopy_threshold: 16 * 1024,
            enable_tcp_nodelay: true,
            buffers_pool_size: 64,
            packets_pool_size: 1024,
            flush_batch_timeout_us: 50,
            flush_batch_iovcnt_threshold: 8,
            flush_batch_bytes_threshold: 256 * 1024,
            enable_quickack: true,
        }
    }
}

/// Fsdev-facing options: live here purely so their types
/// type-check against something concrete — the façade itself does no
/// real work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsdevOptions {
    pub fsdev_io_pool_size: u32,
    pub fsdev_io_cache_size: u32,
    pub max_write: u32,
    pub writeback_cache_enabled: bool,
}

impl Default for FsdevOptions {
    fn default() -> Self {
        Self {
            fsdev_io_pool_size: 64,
            fsdev_io_cache_size: 32,
            max_write: 1 << 20,
            writeback_cache_enabled: true,
        }
    }
}

/// Full transport option set a `Controller` is constructed with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub socket: SocketImplOptions,
    pub fsdev: FsdevOptions,
}
