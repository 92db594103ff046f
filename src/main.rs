// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use mio::Interest;
use nvmf_tcp_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    controller::{Controller, TransportId, options::TransportOptions},
    qpair::QpairState,
};
use tracing::info;

fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path(None, "config/nvmf-tcp-host.yaml")
        .and_then(|p| Config::load_from_file(p).context("failed to load config"))
        .context("failed to resolve or load config")?;

    let addr: SocketAddr = format!("{}:{}", cfg.transport.address, cfg.transport.port)
        .parse()
        .context("invalid transport address")?;

    let mut ctrl = Controller::construct(
        TransportId { addr },
        TransportOptions { socket: cfg.options.socket.clone(), fsdev: cfg.options.fsdev.clone() },
    );
    info!(?addr, caps = ?ctrl.caps, "dialing admin qpair");

    let want_zerocopy = ctrl.caps.zerocopy;
    ctrl.admin_qpair_mut().connect_sock(addr, want_zerocopy, 64 * 1024)?;
    ctrl.admin_qpair_mut().icreq_send(0, true, true, 4)?;
    ctrl.register_qpair(0, Interest::READABLE | Interest::WRITABLE).context("register admin qpair with poll group")?;

    while ctrl.admin_qpair_mut().state() != QpairState::Running {
        ctrl.admin_qpair_mut().check_icreq_timeout()?;
        ctrl.admin_qpair_mut().process_completions(16)?;
        if ctrl.admin_qpair_mut().state() == QpairState::FabricConnectSend {
            ctrl.admin_qpair_mut().fabric_connect_send()?;
        }
        ctrl.poll_group_mut().context("poll group")?.poll(Some(Duration::from_millis(50))).context("poll admin qpair socket")?;
    }
    info!("admin qpair negotiated, controller ready");

    for qid in 1..=cfg.runtime.num_io_queues {
        ctrl.create_io_qpair(qid, cfg.runtime.io_queue_size, 0);
    }

    Ok(())
}
