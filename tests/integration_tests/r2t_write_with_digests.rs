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
        capsule::{CAPSULE_CMD_HLEN, CapsuleCmdHeader},
        common::HeaderFlags,
        data::DataPduHeader,
        digest::{compute_data_digest, compute_header_digest},
        r2t::R2tHeader,
    },
};
use zerocopy::IntoBytes;

use super::common::{capsule_resp_bytes, drive_to_running, read_exact, reply_fabric_connect, reply_ic_resp, spawn_target};

/// A payload larger than the in-capsule threshold forces the target to
/// pull it via R2T/H2C_DATA; both header and data digests are negotiated.
#[test]
fn r2t_write_with_digests_completes_with_success() {
    let payload: Bytes = Bytes::from((0u8..200u8).collect::<Vec<u8>>());
    let payload_len = payload.len() as u32;
    let expected_payload = payload.clone();

    let (addr, target) = spawn_target(move |mut stream| {
        let payload = expected_payload;
        reply_ic_resp(&mut stream, 0, 8192, true, true);
        reply_fabric_connect(&mut stream, true);

        let write_hdr_buf = read_exact(&mut stream, CAPSULE_CMD_HLEN + 4);
        let write_hdr = CapsuleCmdHeader::decode(&write_hdr_buf[..CAPSULE_CMD_HLEN]).expect("decodes write capsule cmd");
        let write_cid = write_hdr.sqe.cid.get();

        let ttag = 42u16;
        let mut r2t = R2tHeader::new(write_cid, ttag, 0, payload_len);
        r2t.common.flags = HeaderFlags::HDGSTF.bits();
        r2t.common.pdo = 28;
        r2t.common.plen = zerocopy::U32::new(28);
        let mut r2t_bytes = Vec::with_capacity(28);
        r2t_bytes.extend_from_slice(r2t.as_bytes());
        r2t_bytes.extend_from_slice(&compute_header_digest(r2t.as_bytes()).to_le_bytes());
        stream.write_all(&r2t_bytes).expect("write r2t");

        // Header and data digests are both negotiated, so H2C_DATA carries
        // HDGSTF too: hdr(24) + hdgst(4) + data + ddgst(4), pdo already
        // 4-byte aligned at 28 bytes since cpda is 0.
        let pdo = 28usize;
        let h2c_total = pdo + payload_len as usize + 4;
        let h2c_buf = read_exact(&mut stream, h2c_total);
        let h2c_hdr = DataPduHeader::decode(&h2c_buf[..24], nvmf_tcp_rs::wire::common::PduType::H2cData).expect("decodes h2c_data");
        assert_eq!(h2c_hdr.cccid.get(), ttag, "h2c_data's cccid field carries the ttag");
        assert_eq!(h2c_hdr.datao.get(), 0);
        assert_eq!(h2c_hdr.datal.get(), payload_len);

        let got_hdgst = u32::from_le_bytes(h2c_buf[24..28].try_into().expect("4 bytes"));
        assert_eq!(got_hdgst, compute_header_digest(&h2c_buf[..24]));

        let data = &h2c_buf[pdo..pdo + payload_len as usize];
        assert_eq!(data, &payload[..]);
        let got_ddgst = u32::from_le_bytes(h2c_buf[pdo + payload_len as usize..].try_into().expect("4 bytes"));
        assert_eq!(got_ddgst, compute_data_digest(data));

        stream.write_all(&capsule_resp_bytes(write_cid, true, true)).expect("write capsule_resp");
    });

    let mut qpair = Qpair::new(1, 32);
    drive_to_running(&mut qpair, addr, 4096, 0, true, true, 4);

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
        .submit(req, nvmf_tcp_rs::wire::capsule::NvmeSqe { opcode: 0x01, ..Default::default() }, Some(64))
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
