// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io::Write, thread, time::Duration};

use nvmf_tcp_rs::{
    error::TransportError,
    qpair::{Qpair, QpairState, request::{PayloadDescriptor, Request}},
    wire::capsule::NvmeSqe,
};

use super::common::{capsule_resp_bytes, drive_to_running, reply_fabric_connect, reply_ic_resp, spawn_target};

/// A CAPSULE_RESP whose trailing header digest doesn't match its header
/// bytes must fail the qpair shut: `process_completions` surfaces
/// `HeaderDigestMismatch` and the qpair quiesces rather than completing
/// the request or panicking.
#[test]
fn corrupt_header_digest_quiesces_the_qpair() {
    let (addr, target) = spawn_target(move |mut stream| {
        reply_ic_resp(&mut stream, 0, 8192, true, false);
        reply_fabric_connect(&mut stream, true);

        let read_hdr = super::common::read_exact(&mut stream, nvmf_tcp_rs::wire::capsule::CAPSULE_CMD_HLEN + 4);
        let cmd = nvmf_tcp_rs::wire::capsule::CapsuleCmdHeader::decode(&read_hdr[..nvmf_tcp_rs::wire::capsule::CAPSULE_CMD_HLEN]).expect("decodes capsule cmd");
        let cid = cmd.sqe.cid.get();

        let mut resp = capsule_resp_bytes(cid, true, true);
        // Flip the last digest byte so it no longer matches the header.
        let last = resp.len() - 1;
        resp[last] ^= 0xff;
        stream.write_all(&resp).expect("write corrupt capsule_resp");
    });

    let mut qpair = Qpair::new(1, 32);
    drive_to_running(&mut qpair, addr, 4096, 0, true, false, 4);

    let req = Request {
        cid: 0,
        opc: 0x02,
        nsid: 1,
        payload: PayloadDescriptor::None,
        expected_datao: 0,
        send_acked: false,
        data_recv: false,
        sendmsg_idx: None,
        r2t: Default::default(),
        on_complete: None,
    };
    qpair.submit(req, NvmeSqe { opcode: 0x02, ..Default::default() }, None).expect("submit");

    let mut observed = None;
    for _ in 0..400 {
        match qpair.process_completions(16) {
            Ok(0) => {},
            Ok(_) => {},
            Err(e) => {
                observed = Some(e);
                break;
            },
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(observed, Some(TransportError::HeaderDigestMismatch));
    assert_eq!(qpair.state(), QpairState::Quiescing);

    target.join().expect("target thread");
}
