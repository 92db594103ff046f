// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Controller façade: the admin qpair, capability probing, and I/O qpair
//! construction.

pub mod options;
pub mod stats;

use std::{io, net::SocketAddr, sync::Arc};

use mio::{Interest, Token};
use tracing::info;

use crate::{
    controller::{options::TransportOptions, stats::ControllerStats},
    mem::{
        domain::DomainType,
        pd::{ProtectionDomain, get_pd},
    },
    pollgroup::PollGroup,
    qpair::{Qpair, QpairState},
};

const MIN_QUEUE_ENTRIES: u32 = 2;
/// The initiator always writes through a single SGL descriptor per
/// request; fan-out SGLs are a target-side concern.
const MAX_SGES: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub zerocopy: bool,
    pub memory_domain: bool,
    /// Whether a registered memory domain should advertise itself as
    /// `DomainType::Tcp` rather than `DomainType::Rdma`; mirrors the
    /// `USE_TCP_MEM_DOMAIN` env toggle `probe_capabilities` read it from.
    pub use_tcp_mem_domain: bool,
    pub accel_seq: bool,
}

/// A transport ID: where the admin qpair's fabric CONNECT dials.
#[derive(Debug, Clone, Copy)]
pub struct TransportId {
    pub addr: SocketAddr,
}

pub struct Controller {
    pub trid: TransportId,
    pub opts: TransportOptions,
    pub caps: Capabilities,
    pd: Arc<ProtectionDomain>,
    admin_qpair: Qpair,
    io_qpairs: Vec<Qpair>,
    poll_group: Option<PollGroup>,
}

impl Controller {
    /// `construct(trid, opts) -> controller`: creates the admin
    /// qpair (qid 0), probes capabilities, registers the process's
    /// protection domain.
    pub fn construct(trid: TransportId, opts: TransportOptions) -> Self {
        let caps = probe_capabilities(&opts);
        let pd = get_pd(trid.addr.port() as u64);
        info!(?caps, "controller constructed");
        Self {
            trid,
            opts,
            caps,
            pd,
            admin_qpair: Qpair::new(0, 32),
            io_qpairs: Vec::new(),
            poll_group: None,
        }
    }

    pub fn admin_qpair_mut(&mut self) -> &mut Qpair {
        &mut self.admin_qpair
    }

    /// Returns the qpair owning `qid` (0 is the admin qpair), if any.
    pub fn qpair_mut(&mut self, qid: u16) -> Option<&mut Qpair> {
        if qid == 0 {
            Some(&mut self.admin_qpair)
        } else {
            self.io_qpairs.iter_mut().find(|q| q.qid == qid)
        }
    }

    /// Lazily constructs this controller's poll group on first use, so
    /// `construct` stays infallible even though `mio::Poll::new` isn't.
    pub fn poll_group_mut(&mut self) -> io::Result<&mut PollGroup> {
        if self.poll_group.is_none() {
            self.poll_group = Some(PollGroup::new()?);
        }
        Ok(self.poll_group.as_mut().expect("just constructed"))
    }

    /// Registers `qid`'s socket with this controller's poll group under
    /// `Token(qid as usize)`. Borrows `admin_qpair`/`io_qpairs` and
    /// `poll_group` as disjoint fields directly, rather than through
    /// `qpair_mut`/`poll_group_mut`, so both can be held mutably at once.
    pub fn register_qpair(&mut self, qid: u16, interest: Interest) -> io::Result<()> {
        if self.poll_group.is_none() {
            self.poll_group = Some(PollGroup::new()?);
        }
        let qpair = if qid == 0 { Some(&mut self.admin_qpair) } else { self.io_qpairs.iter_mut().find(|q| q.qid == qid) };
        let sock = qpair
            .and_then(|q| q.sock_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "qpair has no connected socket"))?;
        self.poll_group.as_mut().expect("just constructed").add_sock(sock, Token(qid as usize), interest)
    }

    /// Deregisters `qid`'s socket from this controller's poll group.
    pub fn deregister_qpair(&mut self, qid: u16) -> io::Result<()> {
        let group = match self.poll_group.as_mut() {
            Some(g) => g,
            None => return Ok(()),
        };
        let qpair = if qid == 0 { Some(&mut self.admin_qpair) } else { self.io_qpairs.iter_mut().find(|q| q.qid == qid) };
        let sock = qpair
            .and_then(|q| q.sock_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "qpair has no connected socket"))?;
        group.remove_sock(sock, Token(qid as usize))
    }

    /// `create_io_qpair(qid, qsize, qprio)`: `qsize >= MIN_QUEUE_ENTRIES`.
    pub fn create_io_qpair(&mut self, qid: u16, qsize: u32, _qprio: u8) -> &mut Qpair {
        let qsize = qsize.max(MIN_QUEUE_ENTRIES);
        self.io_qpairs.push(Qpair::new(qid, qsize));
        self.io_qpairs.last_mut().expect("just pushed")
    }

    pub fn io_qpairs(&self) -> &[Qpair] {
        &self.io_qpairs
    }

    pub fn io_qpairs_mut(&mut self) -> &mut [Qpair] {
        &mut self.io_qpairs
    }

    /// `get_memory_domains(buf) -> count`: populates `buf` with this
    /// controller's memory domain iff memory-domain mode is enabled,
    /// returning how many entries were written.
    pub fn get_memory_domains(&self, buf: &mut Vec<DomainType>) -> usize {
        if !self.caps.memory_domain {
            return 0;
        }
        buf.push(if self.caps.use_tcp_mem_domain { DomainType::Tcp } else { DomainType::Rdma });
        1
    }

    pub fn get_max_xfer_size(&self) -> u32 {
        u32::MAX
    }

    pub fn get_max_sges(&self) -> u32 {
        MAX_SGES
    }

    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats { poll_group: self.poll_group.as_ref().map(|pg| pg.stats()).unwrap_or_default() }
    }

    /// True once the admin qpair has completed its fabric CONNECT.
    pub fn is_connected(&self) -> bool {
        self.admin_qpair.state() == QpairState::Running
    }
}

fn probe_capabilities(opts: &TransportOptions) -> Capabilities {
    let disable_mem_domain = env_flag("DISABLE_MEM_DOMAIN");
    let disable_accel_seq = env_flag("DISABLE_ACCEL_SEQ");
    let use_tcp_mem_domain = env_flag("USE_TCP_MEM_DOMAIN");

    Capabilities {
        zerocopy: opts.socket.enable_zerocopy_send || opts.socket.enable_zerocopy_recv,
        memory_domain: !disable_mem_domain,
        use_tcp_mem_domain,
        accel_seq: !disable_accel_seq,
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}
