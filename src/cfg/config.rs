// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{cfg::enums::TransportFamily, controller::options::TransportOptions};

/// TLS 1.3 PSK identity the controller presents during the handshake.
/// Fixed: the wire side does not negotiate an identity string.
pub const PSK_IDENTITY: &str = "psk.spdk.io";

const DEFAULT_NVMF_PORT: u16 = 4420;
const MIN_QUEUE_ENTRIES: u32 = 2;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Where the admin qpair dials.
    pub transport: TransportConfig,
    /// Present iff the controller should negotiate TLS with a PSK.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Socket-impl and fsdev options.
    #[serde(default)]
    pub options: TransportOptions,
    /// Implementation parameters outside the wire protocol.
    pub runtime: RuntimeConfig,
}

/// Transport ID: address the admin qpair's fabric CONNECT targets.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub family: TransportFamily,
    /// Hostname or literal IP address.
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_NVMF_PORT
}

/// TLS PSK material. The identity string is never configurable: it is
/// always [`PSK_IDENTITY`].
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TlsConfig {
    /// Pre-shared key, hex-encoded as it would appear in `nvme connect
    /// --tls_key`.
    pub psk_hex: String,
}

impl TlsConfig {
    pub fn identity(&self) -> &'static str {
        PSK_IDENTITY
    }
}

/// Runtime-only settings that never cross the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of I/O qpairs to create alongside the admin qpair.
    #[serde(rename = "NumIoQueues", default = "default_num_io_queues")]
    pub num_io_queues: u16,
    /// Entries per I/O qpair (including the one reserved slot).
    #[serde(rename = "IoQueueSize", default = "default_queue_size")]
    pub io_queue_size: u32,
    /// Keep-alive timeout (KATO), advertised during fabric CONNECT.
    #[serde(rename = "KeepAliveTimeout", with = "serde_secs")]
    pub keep_alive_timeout: Duration,
    /// Timeout for establishing the TCP connection.
    #[serde(rename = "ConnectTimeout", with = "serde_secs")]
    pub connect_timeout: Duration,
}

fn default_num_io_queues() -> u16 {
    1
}

fn default_queue_size() -> u32 {
    128
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.transport.address.is_empty(), "transport.address must not be empty");
        ensure!(self.transport.port != 0, "transport.port must not be 0");

        ensure!(self.runtime.num_io_queues >= 1, "NumIoQueues must be >= 1");
        ensure!(
            self.runtime.io_queue_size >= MIN_QUEUE_ENTRIES,
            "IoQueueSize must be >= {MIN_QUEUE_ENTRIES}"
        );

        if let Some(tls) = &self.tls {
            ensure!(!tls.psk_hex.is_empty(), "tls.psk_hex must not be empty when tls is set");
            ensure!(
                tls.psk_hex.len() % 2 == 0 && tls.psk_hex.bytes().all(|b| b.is_ascii_hexdigit()),
                "tls.psk_hex must be an even-length hex string"
            );
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
