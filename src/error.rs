// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error leaves shared across the transport.
//!
//! Call sites use `anyhow::Result`; these enums exist for the places a
//! caller needs to match on *why* something failed (completion status,
//! submit tri-state, digest mismatches).

use thiserror::Error;

/// Generic-status / status-code pair carried in a completion record.
///
/// Mirrors the subset of NVMe status codes this transport actually
/// produces on its own (as opposed to codes relayed verbatim from the
/// target's CQE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// `SCT=GENERIC, SC=0x00`.
    Success,
    /// `SCT=GENERIC, SC=ABORTED_SQ_DELETION (0x08)`.
    AbortedSqDeletion,
    /// `SCT=GENERIC, SC=INTERNAL_DEVICE_ERROR (0x06)`.
    InternalDeviceError,
    /// `SCT=GENERIC, SC=COMMAND_TRANSIENT_TRANSPORT_ERROR (0x22)`.
    CommandTransientTransportError,
    /// Status relayed verbatim from the target's CQE `status` field.
    Relayed(u16),
}

impl CompletionStatus {
    /// `(sct, sc)` pair the way it would appear in a CQE `DW3` status field
    /// (sct in bits 9:11, sc in bits 1:8, phase/other bits cleared).
    pub fn as_sct_sc(self) -> (u8, u8) {
        match self {
            CompletionStatus::Success => (0x0, 0x00),
            CompletionStatus::AbortedSqDeletion => (0x0, 0x08),
            CompletionStatus::InternalDeviceError => (0x0, 0x06),
            CompletionStatus::CommandTransientTransportError => (0x0, 0x22),
            CompletionStatus::Relayed(raw) => {
                (((raw >> 9) & 0x7) as u8, ((raw >> 1) & 0xff) as u8)
            },
        }
    }
}

/// Result of `submit`: `Ok` advances the request, `Again` asks the caller
/// to queue and retry, `Fatal` tears the qpair down.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// CID pool exhausted, staging buffer unavailable, or the socket send
    /// buffer is full. No state changed; caller should queue and retry.
    #[error("resource temporarily unavailable: {0}")]
    Again(&'static str),
    /// Transport-fatal condition; the qpair must be disconnected.
    #[error("fatal transport error: {0}")]
    Fatal(#[from] TransportError),
}

/// Transport-fatal conditions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("header digest mismatch")]
    HeaderDigestMismatch,
    #[error("data digest mismatch")]
    DataDigestMismatch,
    #[error("unexpected PDU type or ordering")]
    UnexpectedPdu,
    #[error("oversize terminate-request diagnostic data")]
    OversizeTermReq,
    #[error("socket disconnected")]
    SocketDisconnected,
    #[error("fabric connect negotiation failed")]
    FabricConnectFailed,
    #[error("ICReq timed out")]
    IcReqTimeout,
}

/// Memory-registry failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemRegistryError {
    #[error("translation does not cover the full requested range")]
    ShortTranslation,
    #[error("no memory region registered for this address range")]
    NoRegion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_status_sct_sc_matches_fixed_codes() {
        assert_eq!(CompletionStatus::Success.as_sct_sc(), (0x0, 0x00));
        assert_eq!(CompletionStatus::AbortedSqDeletion.as_sct_sc(), (0x0, 0x08));
        assert_eq!(CompletionStatus::InternalDeviceError.as_sct_sc(), (0x0, 0x06));
        assert_eq!(CompletionStatus::CommandTransientTransportError.as_sct_sc(), (0x0, 0x22));
    }

    #[test]
    fn relayed_status_decodes_sct_sc_from_the_raw_field() {
        // sct=1, sc=0x02: bits 9:11 = sct, bits 1:8 = sc.
        let raw = (1u16 << 9) | (0x02 << 1);
        assert_eq!(CompletionStatus::Relayed(raw).as_sct_sc(), (1, 0x02));
    }

    #[test]
    fn submit_error_wraps_transport_error_via_from() {
        let err: SubmitError = TransportError::IcReqTimeout.into();
        match err {
            SubmitError::Fatal(inner) => assert_eq!(inner, TransportError::IcReqTimeout),
            SubmitError::Again(_) => panic!("expected Fatal variant"),
        }
    }
}
