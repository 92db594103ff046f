// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The qpair's receive-side PDU state machine.
//!
//! Driven from a non-blocking socket polled by a [`crate::pollgroup::PollGroup`]
//! rather than an async task, so unlike the teacher's `StateMachine` trait
//! this steps synchronously off whatever bytes are already available and
//! returns `Progress::WouldBlock` instead of suspending a future.

use bytes::BytesMut;

use crate::{
    error::TransportError,
    wire::{
        common::{COMMON_HDR_LEN, CommonHeaderRaw, HeaderFlags, validate_common_header},
        digest::{compute_data_digest, compute_header_digest},
        parse::{DecodedPsh, decode_psh},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    AwaitPduReady,
    AwaitPduCh,
    AwaitPduPsh,
    AwaitPduPayload,
    Quiescing,
    Error,
}

/// What the caller should do after one `step` call.
pub enum Progress {
    /// No complete unit is ready yet; come back after more bytes arrive.
    WouldBlock,
    /// The common + per-type header decoded; caller should set up a
    /// payload destination (iov or packet chain) before the next step.
    HeaderReady(DecodedPsh),
    /// A full PDU (including payload, if any) is ready.
    PduComplete { psh: DecodedPsh, payload: BytesMut },
    /// A fatal protocol error occurred; the qpair must emit H2C_TERM_REQ
    /// and move to QUIESCING.
    Fatal(TransportError),
}

pub struct RecvMachine {
    state: RecvState,
    ch_buf: [u8; COMMON_HDR_LEN],
    ch_filled: usize,
    common: Option<CommonHeaderRaw>,
    psh_buf: BytesMut,
    psh: Option<DecodedPsh>,
    payload_buf: BytesMut,
    payload_needed: usize,
}

impl RecvMachine {
    pub fn new() -> Self {
        Self {
            state: RecvState::AwaitPduReady,
            ch_buf: [0u8; COMMON_HDR_LEN],
            ch_filled: 0,
            common: None,
            psh_buf: BytesMut::new(),
            psh: None,
            payload_buf: BytesMut::new(),
            payload_needed: 0,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Feeds newly-arrived bytes into the machine, advancing it as far as
    /// `data` allows. Returns the unconsumed tail of `data` alongside the
    /// progress made, so the caller can feed the remainder back in on the
    /// next readiness event.
    pub fn feed<'a>(&mut self, mut data: &'a [u8], header_digest_enabled: bool, data_digest_enabled: bool) -> (Progress, &'a [u8]) {
        loop {
            match self.state {
                RecvState::AwaitPduReady => {
                    self.reset_for_next_pdu();
                    self.state = RecvState::AwaitPduCh;
                },
                RecvState::AwaitPduCh => {
                    let need = COMMON_HDR_LEN - self.ch_filled;
                    let take = need.min(data.len());
                    self.ch_buf[self.ch_filled..self.ch_filled + take].copy_from_slice(&data[..take]);
                    self.ch_filled += take;
                    data = &data[take..];
                    if self.ch_filled < COMMON_HDR_LEN {
                        return (Progress::WouldBlock, data);
                    }
                    let common = match CommonHeaderRaw::decode(&self.ch_buf) {
                        Ok(c) => c,
                        Err(_) => {
                            self.state = RecvState::Error;
                            return (Progress::Fatal(TransportError::UnexpectedPdu), data);
                        },
                    };
                    if let Err(_e) = validate_common_header(&common) {
                        self.state = RecvState::Error;
                        return (Progress::Fatal(TransportError::UnexpectedPdu), data);
                    }
                    self.psh_buf = BytesMut::from(&self.ch_buf[..]);
                    self.common = Some(common);
                    self.state = RecvState::AwaitPduPsh;
                },
                RecvState::AwaitPduPsh => {
                    let common = self.common.expect("common header decoded before AWAIT_PDU_PSH");
                    let psh_len = common.hlen as usize;
                    let need = psh_len.saturating_sub(self.psh_buf.len());
                    let take = need.min(data.len());
                    self.psh_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.psh_buf.len() < psh_len {
                        return (Progress::WouldBlock, data);
                    }

                    if header_digest_enabled && common.header_flags().contains(HeaderFlags::HDGSTF) {
                        let expected = compute_header_digest(&self.psh_buf[..psh_len]);
                        let need = 4usize.min(data.len());
                        let mut hd_buf = [0u8; 4];
                        hd_buf[..need].copy_from_slice(&data[..need]);
                        data = &data[need..];
                        if need < 4 {
                            return (Progress::WouldBlock, data);
                        }
                        let got = u32::from_le_bytes(hd_buf);
                        if got != expected {
                            self.state = RecvState::Error;
                            return (Progress::Fatal(TransportError::HeaderDigestMismatch), data);
                        }
                    }

                    let psh = match decode_psh(&common, &self.psh_buf[..psh_len]) {
                        Ok(p) => p,
                        Err(_) => {
                            self.state = RecvState::Error;
                            return (Progress::Fatal(TransportError::UnexpectedPdu), data);
                        },
                    };

                    let plen = common.plen() as usize;
                    let pdo = common.pdo as usize;
                    self.payload_needed = plen.saturating_sub(pdo);
                    self.psh = Some(psh);
                    self.state = RecvState::AwaitPduPayload;
                    if self.payload_needed == 0 {
                        let psh = self.psh.take().expect("psh set above");
                        self.state = RecvState::AwaitPduReady;
                        return (Progress::PduComplete { psh, payload: BytesMut::new() }, data);
                    }
                    let psh_ref = self.psh.clone();
                    return (Progress::HeaderReady(psh_ref.expect("psh set above")), data);
                },
                RecvState::AwaitPduPayload => {
                    let need = self.payload_needed - self.payload_buf.len();
                    let take = need.min(data.len());
                    self.payload_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.payload_buf.len() < self.payload_needed {
                        return (Progress::WouldBlock, data);
                    }
                    let common = self.common.expect("common header decoded before AWAIT_PDU_PAYLOAD");
                    let mut payload = std::mem::take(&mut self.payload_buf);
                    if data_digest_enabled && common.header_flags().contains(HeaderFlags::DDGSTF) && payload.len() >= 4 {
                        let ddgst_offset = payload.len() - 4;
                        let expected = compute_data_digest(&payload[..ddgst_offset]);
                        let got = u32::from_le_bytes(payload[ddgst_offset..].try_into().expect("4 bytes"));
                        if got != expected {
                            self.state = RecvState::Error;
                            return (Progress::Fatal(TransportError::DataDigestMismatch), data);
                        }
                        payload.truncate(ddgst_offset);
                    }
                    let psh = self.psh.take().expect("psh set in AWAIT_PDU_PSH");
                    self.state = RecvState::AwaitPduReady;
                    return (Progress::PduComplete { psh, payload }, data);
                },
                RecvState::Quiescing | RecvState::Error => {
                    return (Progress::WouldBlock, data);
                },
            }
        }
    }

    fn reset_for_next_pdu(&mut self) {
        self.ch_filled = 0;
        self.common = None;
        self.psh_buf.clear();
        self.psh = None;
        self.payload_buf.clear();
        self.payload_needed = 0;
    }

    pub fn quiesce(&mut self) {
        self.state = RecvState::Quiescing;
    }
}

impl Default for RecvMachine {
    fn default() -> Self {
        Self::new()
    }
}

// `DecodedPsh` only needs to be cloneable for the `HeaderReady` / payload
// hand-off above; all of its variants are plain zerocopy structs.
impl Clone for DecodedPsh {
    fn clone(&self) -> Self {
        match self {
            DecodedPsh::IcResp(h) => DecodedPsh::IcResp(*h),
            DecodedPsh::CapsuleResp(h) => DecodedPsh::CapsuleResp(*h),
            DecodedPsh::H2cData(h) => DecodedPsh::H2cData(*h),
            DecodedPsh::C2hData(h) => DecodedPsh::C2hData(*h),
            DecodedPsh::R2t(h) => DecodedPsh::R2t(*h),
            DecodedPsh::C2hTermReq(h) => DecodedPsh::C2hTermReq(*h),
            DecodedPsh::H2cTermReq(h) => DecodedPsh::H2cTermReq(*h),
        }
    }
}
