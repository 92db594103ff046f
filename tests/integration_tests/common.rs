// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared loopback mock-target plumbing for the end-to-end scenarios:
//! a real `TcpListener` on a background thread stands in for the NVMe/TCP
//! target, and these helpers speak just enough of the wire protocol to
//! drive a [`Qpair`] through ICReq/ICResp and fabric CONNECT.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use nvmf_tcp_rs::{
    qpair::{Qpair, QpairState},
    wire::{
        capsule::{CAPSULE_CMD_HLEN, CAPSULE_RESP_HLEN, CapsuleCmdHeader, CapsuleRespHeader},
        common::{CommonHeaderRaw, HeaderFlags, PduType},
        digest::compute_header_digest,
        ic::{IC_PDU_LEN, IcResp},
    },
};
use zerocopy::IntoBytes;

/// Binds a loopback listener, hands the accepted stream to `handler` on a
/// background thread, and returns the address to connect to plus the
/// thread's `JoinHandle` so the caller can `join()` once the scenario is
/// done.
pub fn spawn_target<F>(handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        handler(stream);
    });
    (addr, handle)
}

pub fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}

/// Reads the client's IC_REQ off `stream` and answers with an IC_RESP
/// carrying the given negotiated parameters.
pub fn reply_ic_resp(stream: &mut TcpStream, cpda: u8, maxh2cdata: u32, hdgst: bool, ddgst: bool) {
    let _icreq = read_exact(stream, IC_PDU_LEN);

    let mut digest = 0u8;
    if hdgst {
        digest |= 0x01;
    }
    if ddgst {
        digest |= 0x02;
    }
    let resp = IcResp {
        common: CommonHeaderRaw {
            pdu_type: PduType::IcResp as u8,
            flags: 0,
            hlen: IC_PDU_LEN as u8,
            pdo: 0,
            plen: zerocopy::U32::new(IC_PDU_LEN as u32),
        },
        pfv: zerocopy::U16::new(0),
        cpda,
        digest,
        maxh2cdata: zerocopy::U32::new(maxh2cdata),
        reserved: [0u8; 112],
    };
    stream.write_all(resp.as_bytes()).expect("write IC_RESP");
}

/// Encodes a CAPSULE_RESP for `cid`, appending a correct header digest when
/// `hdgst` is set. Exposed (rather than folded into `reply_fabric_connect`)
/// so a scenario can corrupt the trailing digest bytes itself.
pub fn capsule_resp_bytes(cid: u16, success: bool, hdgst: bool) -> Vec<u8> {
    let pdo = CAPSULE_RESP_HLEN + if hdgst { 4 } else { 0 };
    let mut resp = CapsuleRespHeader::new(cid, (pdo as u8, pdo as u32));
    if hdgst {
        resp.common.flags |= HeaderFlags::HDGSTF.bits();
    }
    if !success {
        resp.cqe.status = zerocopy::U16::new(0b0000_0010); // sct=0, sc=1
    }
    let mut bytes = Vec::with_capacity(pdo);
    bytes.extend_from_slice(resp.as_bytes());
    if hdgst {
        let hd = compute_header_digest(&resp.as_bytes()[..CAPSULE_RESP_HLEN]);
        bytes.extend_from_slice(&hd.to_le_bytes());
    }
    bytes
}

/// Reads the client's fabric CONNECT CAPSULE_CMD and answers with a
/// successful CAPSULE_RESP, returning the CONNECT command's CID.
pub fn reply_fabric_connect(stream: &mut TcpStream, hdgst: bool) -> u16 {
    let total = CAPSULE_CMD_HLEN + if hdgst { 4 } else { 0 };
    let buf = read_exact(stream, total);
    let hdr = CapsuleCmdHeader::decode(&buf[..CAPSULE_CMD_HLEN]).expect("decode fabric connect capsule");
    let cid = hdr.sqe.cid.get();
    stream.write_all(&capsule_resp_bytes(cid, true, hdgst)).expect("write fabric connect resp");
    cid
}

/// Drives `qpair` through `connect_sock`/`icreq_send`/`fabric_connect_send`
/// until it reaches `Running`, polling `process_completions` in between.
/// Panics if it never gets there within the loop budget.
pub fn drive_to_running(qpair: &mut Qpair, addr: SocketAddr, recv_chunk_len: usize, hpda: u8, hdgst: bool, ddgst: bool, maxr2t: u32) {
    qpair.connect_sock(addr, false, recv_chunk_len).expect("connect_sock");
    qpair.icreq_send(hpda, hdgst, ddgst, maxr2t).expect("icreq_send");

    for _ in 0..400 {
        if qpair.state() == QpairState::Running {
            return;
        }
        qpair.check_icreq_timeout().expect("ICReq must not time out");
        let _ = qpair.process_completions(16);
        if qpair.state() == QpairState::FabricConnectSend {
            qpair.fabric_connect_send().expect("fabric_connect_send");
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("qpair never reached RUNNING, stuck in {:?}", qpair.state());
}
