// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use bytes::Bytes;
use nvmf_tcp_rs::{
    error::CompletionStatus,
    qpair::{
        Qpair,
        request::{PayloadDescriptor, Request},
    },
    wire::{
        capsule::{CAPSULE_CMD_HLEN, CapsuleCmdHeader, NvmeSqe},
        common::HeaderFlags,
        data::DataPduHeader,
        digest::compute_data_digest,
    },
};

use super::common::{capsule_resp_bytes, drive_to_running, read_exact, reply_fabric_connect, reply_ic_resp, spawn_target};

/// A read whose destination buffer exceeds the in-capsule threshold: the
/// command goes out as a bare CAPSULE_CMD (no in-capsule data for a read),
/// the target answers with two data-digest-bearing C2H_DATA PDUs, and a
/// trailing CAPSULE_RESP finalizes the completion. `received_data_pdus`/
/// `received_data_iovs` confirm the C2H data phase happened at the PDU
/// level; the per-PDU data-digest unit tests in `qpair::recv_state::tests`
/// cover the byte-for-byte landing and digest validation this test can't
/// observe from outside (the completion callback only carries a status,
/// not the request's backing buffer).
#[test]
fn c2h_read_with_data_digest_completes_and_counts_data_pdus() {
    const READ_LEN: usize = 10_000; // > the 8192 in-capsule default, forcing TRANSPORT_DATA_BLOCK

    let (addr, target) = spawn_target(move |mut stream| {
        reply_ic_resp(&mut stream, 0, 8192, false, true);
        reply_fabric_connect(&mut stream, false);

        let cmd_buf = read_exact(&mut stream, CAPSULE_CMD_HLEN);
        let cmd = CapsuleCmdHeader::decode(&cmd_buf).expect("decodes read capsule cmd");
        let read_cid = cmd.sqe.cid.get();

        let mut offset = 0u32;
        for chunk_len in [5_000u32, 5_000u32] {
            let data: Vec<u8> = (0..chunk_len).map(|i| ((offset + i) % 251) as u8).collect();
            let ddgst = compute_data_digest(&data);
            let hdr = DataPduHeader::new(
                nvmf_tcp_rs::wire::common::PduType::C2hData,
                read_cid,
                offset,
                chunk_len,
                24,
                24 + chunk_len + 4,
                HeaderFlags::DDGSTF.bits(),
            );
            let mut bytes = Vec::with_capacity(24 + chunk_len as usize + 4);
            use zerocopy::IntoBytes;
            bytes.extend_from_slice(hdr.as_bytes());
            bytes.extend_from_slice(&data);
            bytes.extend_from_slice(&ddgst.to_le_bytes());
            stream.write_all(&bytes).expect("write c2h_data");
            offset += chunk_len;
        }

        stream.write_all(&capsule_resp_bytes(read_cid, true, false)).expect("write capsule_resp");
    });

    let mut qpair = Qpair::new(1, 32);
    drive_to_running(&mut qpair, addr, 16_384, 0, false, true, 4);

    let status: Arc<Mutex<Option<CompletionStatus>>> = Arc::new(Mutex::new(None));
    let status_cb = status.clone();
    let req = Request {
        cid: 0,
        opc: 0x02,
        nsid: 1,
        payload: PayloadDescriptor::Contig(Bytes::from(vec![0u8; READ_LEN])),
        expected_datao: 0,
        send_acked: false,
        data_recv: false,
        sendmsg_idx: None,
        r2t: Default::default(),
        on_complete: Some(Box::new(move |status, _cqe_dw0_dw3| {
            *status_cb.lock().expect("lock") = Some(status);
        })),
    };
    qpair
        .submit(req, NvmeSqe { opcode: 0x02, ..Default::default() }, None)
        .expect("submit");

    for _ in 0..400 {
        if status.lock().expect("lock").is_some() {
            break;
        }
        let _ = qpair.process_completions(16);
        let _ = qpair.flush();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*status.lock().expect("lock"), Some(CompletionStatus::Success));
    assert_eq!(qpair.stats().received_data_pdus, 2);
    assert_eq!(qpair.stats().received_data_iovs, 2);

    target.join().expect("target thread");
}
