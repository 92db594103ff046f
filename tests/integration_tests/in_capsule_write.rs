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
    wire::capsule::{CAPSULE_CMD_HLEN, CAPSULE_RESP_HLEN, CapsuleCmdHeader, CapsuleRespHeader, NvmeSqe},
};
use zerocopy::IntoBytes;

use super::common::{drive_to_running, read_exact, reply_fabric_connect, reply_ic_resp, spawn_target};

/// A payload small enough to fit entirely within the CAPSULE_CMD: submit,
/// write completes off the single in-capsule send with no R2T round trip.
#[test]
fn in_capsule_write_completes_with_success() {
    let payload = Bytes::from_static(b"hello nvme/tcp in-capsule payload!!!");
    let payload_len = payload.len();

    let (addr, target) = spawn_target(move |mut stream| {
        reply_ic_resp(&mut stream, 0, 8192, false, false);
        reply_fabric_connect(&mut stream, false);

        let hdr_buf = read_exact(&mut stream, CAPSULE_CMD_HLEN);
        let hdr = CapsuleCmdHeader::decode(&hdr_buf).expect("decodes capsule cmd");
        let data = read_exact(&mut stream, payload_len);
        assert_eq!(data, b"hello nvme/tcp in-capsule payload!!!");

        let resp = CapsuleRespHeader::new(hdr.sqe.cid.get(), (0, CAPSULE_RESP_HLEN as u32));
        stream.write_all(resp.as_bytes()).expect("write capsule_resp");
    });

    let mut qpair = Qpair::new(1, 32);
    drive_to_running(&mut qpair, addr, 4096, 0, false, false, 4);

    let status: Arc<Mutex<Option<CompletionStatus>>> = Arc::new(Mutex::new(None));
    let status_cb = status.clone();
    let req = Request {
        cid: 0,
        opc: 0x01,
        nsid: 1,
        payload: PayloadDescriptor::Contig(payload),
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
        .submit(req, NvmeSqe { opcode: 0x01, ..Default::default() }, Some(8192))
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

    target.join().expect("target thread");
}
