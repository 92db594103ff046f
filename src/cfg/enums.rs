// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Transport family a [`crate::cfg::config::TransportConfig`] dials.
///
/// Only `Tcp` is implemented; the variant exists so the config shape mirrors
/// `nvme_transport_id.trtype` rather than hard-coding a single protocol.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportFamily {
    #[default]
    Tcp,
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportFamily::Tcp => "TCP",
        })
    }
}
