// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The qpair engine: connection lifecycle, request submission, the recv
//! state machine, and R2T flow control.

pub mod accel;
pub mod r2t;
pub mod recv_state;
pub mod request;
pub mod send;
pub mod stats;

use std::{io::IoSlice, net::SocketAddr, time::Instant};

use tracing::{debug, warn};

use crate::{
    error::{CompletionStatus, SubmitError, TransportError},
    qpair::{
        recv_state::{Progress, RecvMachine},
        request::{PayloadDescriptor, PendingRequests, Request},
        send::frame_capsule_cmd,
        stats::QpairStats,
    },
    sock::ZeroCopySocket,
    wire::{
        capsule::NvmeSqe,
        common::PduType,
        ic::{IcReq, IcResp},
        parse::DecodedPsh,
        term::{FatalErrorStatus, TermReqHeader},
    },
};

const ICREQ_TIMEOUT_MS: u64 = 2000;
const MIN_QUEUE_ENTRIES: u32 = 2;
pub const RECV_BUF_FACTOR: usize = 4;

/// Fabric command opcode and fctype for the NVMe-oF CONNECT command. The
/// data-bearing SQSIZE/subnqn/hostnqn payload is out of scope (full admin
/// command set is a non-goal); only enough of the capsule is framed to
/// drive the qpair's own lifecycle to RUNNING.
const FABRIC_CMD_OPCODE: u8 = 0x7f;
const FABRIC_FCTYPE_CONNECT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpairState {
    Invalid,
    Initializing,
    FabricConnectSend,
    FabricConnectPoll,
    Running,
    Quiescing,
    Disconnected,
    Error,
}

/// Negotiated parameters adopted from IC_RESP.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiatedParams {
    pub maxh2cdata: u32,
    pub cpda: u8,
    pub header_digest: bool,
    pub data_digest: bool,
}

pub struct Qpair {
    pub qid: u16,
    pub qsize: u32,
    state: QpairState,
    sock: Option<ZeroCopySocket>,
    recv: RecvMachine,
    pending: PendingRequests,
    negotiated: NegotiatedParams,
    icreq_deadline: Option<Instant>,
    in_progress_accel: u32,
    /// CID of the outstanding fabric CONNECT command, set by
    /// `fabric_connect_send` and cleared once its CAPSULE_RESP arrives.
    fabric_connect_cid: Option<u16>,
    stats: QpairStats,
}

impl Qpair {
    pub fn new(qid: u16, qsize: u32) -> Self {
        Self {
            qid,
            qsize: qsize.max(MIN_QUEUE_ENTRIES),
            state: QpairState::Invalid,
            sock: None,
            recv: RecvMachine::new(),
            pending: PendingRequests::new(),
            negotiated: NegotiatedParams::default(),
            icreq_deadline: None,
            in_progress_accel: 0,
            fabric_connect_cid: None,
            stats: QpairStats::default(),
        }
    }

    pub fn state(&self) -> QpairState {
        self.state
    }

    pub fn stats(&self) -> QpairStats {
        self.stats
    }

    /// Exposes the qpair's socket for a poll group to register/deregister;
    /// `None` before `connect_sock` or after `disconnect`.
    pub fn sock_mut(&mut self) -> Option<&mut ZeroCopySocket> {
        self.sock.as_mut()
    }

    /// Usable submission entries, reserving one slot per the fabric
    /// contract.
    pub fn usable_entries(&self) -> u32 {
        self.qsize - 1
    }

    /// `connect_sock`: resolve address, create the zero-copy socket,
    /// non-blocking. TLS/PSK negotiation is out of scope for this initial
    /// connect step and layered on by the caller if configured.
    pub fn connect_sock(&mut self, addr: SocketAddr, want_zerocopy: bool, recv_chunk_len: usize) -> Result<(), TransportError> {
        let sock = ZeroCopySocket::connect(addr, want_zerocopy, recv_chunk_len).map_err(|_| TransportError::FabricConnectFailed)?;
        self.sock = Some(sock);
        self.state = QpairState::Initializing;
        Ok(())
    }

    /// `icreq_send`: emit IC_REQ and start the 2-second timer.
    pub fn icreq_send(&mut self, hpda: u8, enable_hdgst: bool, enable_ddgst: bool, maxr2t: u32) -> Result<(), TransportError> {
        let sock = self.sock.as_mut().ok_or(TransportError::SocketDisconnected)?;
        let req = IcReq::new(hpda, enable_hdgst, enable_ddgst, maxr2t);
        let bytes = req.to_bytes();
        let iov = [IoSlice::new(&bytes)];
        sock.send_async(&iov)?;
        self.icreq_deadline = Some(Instant::now() + std::time::Duration::from_millis(ICREQ_TIMEOUT_MS));
        Ok(())
    }

    /// Checks the IC_REQ timer; call once per poll iteration while still
    /// `INVALID`/`INITIALIZING`.
    pub fn check_icreq_timeout(&self) -> Result<(), TransportError> {
        if let Some(deadline) = self.icreq_deadline {
            if Instant::now() >= deadline && self.state == QpairState::Initializing {
                return Err(TransportError::IcReqTimeout);
            }
        }
        Ok(())
    }

    fn adopt_ic_resp(&mut self, resp: &IcResp) {
        self.negotiated = NegotiatedParams {
            maxh2cdata: resp.maxh2cdata.get(),
            cpda: resp.cpda,
            header_digest: resp.header_digest_enabled(),
            data_digest: resp.data_digest_enabled(),
        };
        let recv_buf_len = RECV_BUF_FACTOR * (4096 + crate::wire::data::DATA_HDR_LEN + 4);
        debug!(qid = self.qid, recv_buf_len, "adopted IC_RESP negotiated parameters");
        self.state = if self.icreq_deadline.is_some() {
            QpairState::FabricConnectSend
        } else {
            QpairState::Initializing
        };
    }

    /// `fabric_connect_send`: emits the NVMe-oF fabric CONNECT command,
    /// moving the qpair from `FABRIC_CONNECT_SEND` to `FABRIC_CONNECT_POLL`.
    /// Call once per qpair right after adopting IC_RESP.
    pub fn fabric_connect_send(&mut self) -> Result<(), TransportError> {
        if self.state != QpairState::FabricConnectSend {
            return Err(TransportError::FabricConnectFailed);
        }
        if self.pending.is_full() {
            return Err(TransportError::FabricConnectFailed);
        }
        let req = Request {
            cid: 0,
            opc: FABRIC_CMD_OPCODE,
            nsid: FABRIC_FCTYPE_CONNECT as u32,
            payload: crate::qpair::request::PayloadDescriptor::None,
            expected_datao: 0,
            send_acked: false,
            data_recv: false,
            sendmsg_idx: None,
            r2t: Default::default(),
            on_complete: None,
        };
        let cid = self.pending.insert(req);
        let mut sqe = NvmeSqe { opcode: FABRIC_CMD_OPCODE, ..Default::default() };
        sqe.cid = zerocopy::U16::new(cid);
        sqe.nsid = zerocopy::U32::new(FABRIC_FCTYPE_CONNECT as u32);
        sqe.cdw10 = zerocopy::U32::new(((self.qid as u32) << 16) | self.usable_entries());

        let req_ref = self.pending.get(cid).expect("just inserted");
        let framed = frame_capsule_cmd(req_ref, sqe, self.negotiated.cpda, self.negotiated.header_digest, self.negotiated.data_digest, None);

        let sock = self.sock.as_mut().ok_or(TransportError::SocketDisconnected)?;
        sock.send_async(&[IoSlice::new(&framed.header)])?;

        self.fabric_connect_cid = Some(cid);
        self.state = QpairState::FabricConnectPoll;
        Ok(())
    }

    /// `submit(request) -> {OK | AGAIN | FATAL}`.
    pub fn submit(&mut self, request: Request, sqe_template: NvmeSqe, ioccsz: Option<u32>) -> Result<u16, SubmitError> {
        if self.state != QpairState::Running {
            return Err(SubmitError::Fatal(TransportError::SocketDisconnected));
        }
        if self.pending.is_full() {
            return Err(SubmitError::Again("pending request table at capacity"));
        }
        let cid = self.pending.insert(request);
        let req_ref = self.pending.get(cid).expect("just inserted");
        let mut sqe = sqe_template;
        sqe.cid = zerocopy::U16::new(cid);

        let framed = frame_capsule_cmd(req_ref, sqe, self.negotiated.cpda, self.negotiated.header_digest, self.negotiated.data_digest, ioccsz);

        let sock = self.sock.as_mut().ok_or(SubmitError::Fatal(TransportError::SocketDisconnected))?;
        let mut iovs = vec![IoSlice::new(&framed.header)];
        for seg in &framed.data_segments {
            iovs.push(IoSlice::new(seg));
        }
        let (_, seq) = sock.send_async(&iovs)?;

        // A plain (non-zero-copy) `sendmsg` has already copied the bytes
        // into the kernel by the time it returns, so the send is acked
        // immediately; only `MSG_ZEROCOPY` sends need `flush()` to confirm
        // completion via the error queue.
        let immediately_acked = seq.is_none();
        if let Some(req) = self.pending.get_mut(cid) {
            req.sendmsg_idx = seq;
            req.send_acked = immediately_acked;
            if !framed.in_capsule {
                req.r2t.datao = 0;
            }
        }
        self.stats.submitted_requests += 1;
        self.stats.outstanding_reqs = self.pending.len() as u64;
        if immediately_acked {
            self.complete_if_ready(cid);
        }
        Ok(cid)
    }

    /// `free_request`: release a zero-copy request's packet references.
    pub fn free_request(&mut self, cid: u16) {
        if let Some(req) = self.pending.remove(cid) {
            drop(req);
            self.stats.outstanding_reqs = self.pending.len() as u64;
        }
    }

    /// `abort(cid)`: synthesize ABORTED_SQ_DELETION for the matching
    /// outstanding request.
    pub fn abort(&mut self, cid: u16) {
        if let Some(mut req) = self.pending.remove(cid) {
            if let Some(cb) = req.on_complete.take() {
                cb(CompletionStatus::AbortedSqDeletion, [0u8; 16]);
            }
        }
        self.stats.outstanding_reqs = self.pending.len() as u64;
    }

    /// `process_completions(max) -> reaped`: drains the recv
    /// stream, advances the state machine, fires completions up to `max`.
    pub fn process_completions(&mut self, max: usize) -> Result<usize, TransportError> {
        let Some(sock) = self.sock.as_mut() else {
            return Ok(0);
        };
        let chunks = sock.recv_chunks(4)?;
        let mut reaped = 0usize;
        for chunk in chunks {
            let mut data: &[u8] = &chunk.bytes;
            while !data.is_empty() && reaped < max {
                let (progress, rest) = self.recv.feed(data, self.negotiated.header_digest, self.negotiated.data_digest);
                data = rest;
                match progress {
                    Progress::WouldBlock => break,
                    Progress::HeaderReady(_) => continue,
                    Progress::PduComplete { psh, payload } => {
                        reaped += self.dispatch_pdu(psh, payload)?;
                    },
                    Progress::Fatal(e) => {
                        self.terminate(e);
                        return Err(e);
                    },
                }
            }
        }
        Ok(reaped)
    }

    fn dispatch_pdu(&mut self, psh: DecodedPsh, payload: bytes::BytesMut) -> Result<usize, TransportError> {
        match psh {
            DecodedPsh::IcResp(resp) => {
                self.adopt_ic_resp(&resp);
                Ok(1)
            },
            DecodedPsh::CapsuleResp(resp) => {
                let cid = resp.cqe.cid.get();
                if self.state == QpairState::FabricConnectPoll && self.fabric_connect_cid == Some(cid) {
                    self.pending.remove(cid);
                    self.fabric_connect_cid = None;
                    self.state = if resp.cqe.is_success() { QpairState::Running } else { QpairState::Error };
                    return Ok(1);
                }
                if let Some(req) = self.pending.get_mut(cid) {
                    req.data_recv = true;
                    if req.is_complete() {
                        if let Some(mut req) = self.pending.remove(cid) {
                            if let Some(cb) = req.on_complete.take() {
                                let (sct, sc) = resp.cqe.sct_sc();
                                let status = if resp.cqe.is_success() {
                                    CompletionStatus::Success
                                } else {
                                    CompletionStatus::Relayed(((sct as u16) << 8) | sc as u16)
                                };
                                cb(status, [0u8; 16]);
                            }
                        }
                    }
                }
                Ok(1)
            },
            DecodedPsh::C2hData(hdr) => {
                self.stats.record_data_pdu(1);
                if hdr.common.header_flags().contains(crate::wire::common::HeaderFlags::DDGSTF) {
                    self.stats.recv_ddgsts += 1;
                }
                let cccid = hdr.cccid.get();
                let datao = hdr.datao.get();
                if let Some(req) = self.pending.get_mut(cccid) {
                    req.payload.write_at(datao as usize, &payload);
                    req.expected_datao = datao + hdr.datal.get();
                    if hdr.common.header_flags().contains(crate::wire::common::HeaderFlags::SUCCESS) {
                        req.send_acked = true;
                        req.data_recv = true;
                    }
                }
                Ok(1)
            },
            DecodedPsh::R2t(hdr) => {
                let cccid = hdr.cccid.get();
                let maxr2t = 1u32;
                let maxh2cdata = self.negotiated.maxh2cdata.max(4096);
                let payload_size = self
                    .pending
                    .get(cccid)
                    .map(|r| r.payload.len() as u32)
                    .unwrap_or(0);
                let segment = {
                    let Some(req) = self.pending.get_mut(cccid) else {
                        return Ok(1);
                    };
                    crate::qpair::r2t::admit_r2t(req, &hdr, maxr2t, maxh2cdata, payload_size)?
                };
                if let Some(segment) = segment {
                    self.send_h2c_segment(cccid, hdr.ttag.get(), segment)?;
                }
                Ok(1)
            },
            DecodedPsh::C2hTermReq(term) => {
                warn!(fes = term.fatal_error_status(), "received C2H_TERM_REQ, quiescing qpair");
                self.state = QpairState::Quiescing;
                Ok(1)
            },
            DecodedPsh::H2cData(_) | DecodedPsh::H2cTermReq(_) => Err(TransportError::UnexpectedPdu),
        }
    }

    /// Serializes and sends one H2C_DATA segment for an admitted R2T.
    fn send_h2c_segment(&mut self, cccid: u16, ttag: u16, segment: crate::qpair::r2t::H2cSegment) -> Result<(), TransportError> {
        let data = self
            .pending
            .get(cccid)
            .map(|r| r.payload.slice(segment.datao as usize, segment.datal as usize))
            .unwrap_or_default();

        let hdgst_len = if self.negotiated.header_digest { 4 } else { 0 };
        let plen_before_data = crate::wire::data::DATA_HDR_LEN + hdgst_len;
        let pdo = crate::wire::common::compute_pdo(plen_before_data, self.negotiated.cpda);
        let ddgst_len = if self.negotiated.data_digest { 4 } else { 0 };
        let plen = pdo + data.len() + ddgst_len;

        let mut flags = crate::wire::common::HeaderFlags::empty();
        if segment.last {
            flags |= crate::wire::common::HeaderFlags::LAST_PDU;
        }
        if self.negotiated.header_digest {
            flags |= crate::wire::common::HeaderFlags::HDGSTF;
        }
        if self.negotiated.data_digest {
            flags |= crate::wire::common::HeaderFlags::DDGSTF;
        }

        let hdr = crate::wire::data::DataPduHeader::new(
            PduType::H2cData,
            ttag,
            segment.datao,
            segment.datal,
            pdo as u8,
            plen as u32,
            flags.bits(),
        );

        let mut buf = bytes::BytesMut::with_capacity(pdo);
        use zerocopy::IntoBytes;
        buf.extend_from_slice(hdr.as_bytes());
        if self.negotiated.header_digest {
            let hd = crate::wire::digest::compute_header_digest(&buf[..crate::wire::data::DATA_HDR_LEN]);
            buf.extend_from_slice(&hd.to_le_bytes());
        }
        while buf.len() < pdo {
            buf.extend_from_slice(&[0u8]);
        }

        let sock = self.sock.as_mut().ok_or(TransportError::SocketDisconnected)?;
        let mut iovs = vec![IoSlice::new(&buf), IoSlice::new(&data)];
        let ddgst_bytes;
        if ddgst_len > 0 {
            ddgst_bytes = crate::wire::digest::compute_data_digest(&data).to_le_bytes();
            iovs.push(IoSlice::new(&ddgst_bytes));
        }
        let (_, seq) = sock.send_async(&iovs)?;

        let next = if let Some(req) = self.pending.get_mut(cccid) {
            req.r2t.h2c_wait_ack = true;
            req.r2t.h2c_sendmsg_idx = seq;
            if seq.is_none() {
                // Plain `sendmsg` already copied the segment into the
                // kernel, so the ack is immediate rather than waiting on a
                // zero-copy completion.
                let next_ttag = req.r2t.ttag_next;
                crate::qpair::r2t::on_h2c_acked(&mut req.r2t, self.negotiated.maxh2cdata.max(4096)).map(|seg| (next_ttag.unwrap_or(ttag), seg))
            } else {
                None
            }
        } else {
            None
        };
        if let Some((next_ttag, next_segment)) = next {
            self.send_h2c_segment(cccid, next_ttag, next_segment)?;
        }
        Ok(())
    }

    fn terminate(&mut self, reason: TransportError) {
        warn!(?reason, "qpair recv state machine hit a fatal error, sending H2C_TERM_REQ");
        if let Some(sock) = &mut self.sock {
            if let Ok(term) = TermReqHeader::new(true, FatalErrorStatus::InvalidPduHeader, 0, 0) {
                let bytes = {
                    let mut b = [0u8; crate::wire::term::TERM_REQ_HDR_LEN];
                    use zerocopy::IntoBytes;
                    b.copy_from_slice(term.as_bytes());
                    b
                };
                let _ = sock.send_async(&[IoSlice::new(&bytes)]);
            }
        }
        self.recv.quiesce();
        self.state = QpairState::Quiescing;
    }

    /// `flush()`: push queued sends and reclaim zero-copy completions.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        let Some(sock) = self.sock.as_mut() else {
            return Ok(());
        };
        let completions = sock.poll_send_completions().map_err(|_| TransportError::SocketDisconnected)?;
        if completions.is_empty() {
            return Ok(());
        }
        let mut newly_acked = Vec::new();
        let mut h2c_acked = Vec::new();
        for (cid, req) in self.pending.iter_in_insertion_order() {
            if let Some(idx) = req.sendmsg_idx {
                if completions.iter().any(|c| idx >= c.lo && idx <= c.hi) {
                    newly_acked.push(cid);
                }
            }
            if req.r2t.h2c_wait_ack {
                if let Some(idx) = req.r2t.h2c_sendmsg_idx {
                    if completions.iter().any(|c| idx >= c.lo && idx <= c.hi) {
                        h2c_acked.push((cid, req.cid));
                    }
                }
            }
        }
        for cid in newly_acked {
            if let Some(req) = self.pending.get_mut(cid) {
                req.send_acked = true;
            }
            self.complete_if_ready(cid);
        }
        let maxh2cdata = self.negotiated.maxh2cdata.max(4096);
        for (cid, _) in h2c_acked {
            let Some(req) = self.pending.get_mut(cid) else { continue };
            // `ttag_next` belongs to the parked R2T that `on_h2c_acked` is
            // about to admit, if any; read it before the call clears it.
            let ttag = req.r2t.ttag_next;
            if let Some(segment) = crate::qpair::r2t::on_h2c_acked(&mut req.r2t, maxh2cdata) {
                self.send_h2c_segment(cid, ttag.expect("on_h2c_acked only returns Some when a ttag was parked"), segment)?;
            }
        }
        Ok(())
    }

    fn complete_if_ready(&mut self, cid: u16) {
        let ready = self.pending.get(cid).map(Request::is_complete).unwrap_or(false);
        if !ready {
            return;
        }
        if let Some(mut req) = self.pending.remove(cid) {
            if let Some(cb) = req.on_complete.take() {
                cb(CompletionStatus::Success, [0u8; 16]);
            }
        }
        self.stats.outstanding_reqs = self.pending.len() as u64;
    }

    /// `disconnect()`: defers closing while zero-copy refs or an
    /// in-flight accelerator sequence remain; aborts outstanding requests.
    pub fn disconnect(&mut self) {
        if self.in_progress_accel > 0 {
            debug!(qid = self.qid, "disconnect deferred: accelerator sequence in flight");
            self.state = QpairState::Quiescing;
            return;
        }
        let zero_copy_refs_held = self
            .pending
            .iter_in_insertion_order()
            .any(|(_, req)| matches!(req.payload, PayloadDescriptor::ZeroCopy(_)));
        if zero_copy_refs_held {
            debug!(qid = self.qid, "disconnect deferred: zero-copy receive buffers still referenced");
            self.state = QpairState::Quiescing;
            return;
        }
        let cids: Vec<u16> = self.pending.iter_in_insertion_order().map(|(cid, _)| cid).collect();
        for cid in cids {
            self.abort(cid);
        }
        if let Some(sock) = self.sock.take() {
            match sock.close(false) {
                None => {},
                Some(sock) => {
                    // Outstanding zero-copy sends haven't been acked by the
                    // kernel yet; keep the socket and retry on the next
                    // disconnect call.
                    self.sock = Some(sock);
                    self.state = QpairState::Quiescing;
                    return;
                },
            }
        }
        self.state = QpairState::Disconnected;
    }
}
