// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Poll group: the epoll-equivalent scheduling unit a qpair is assigned
//! to. One poll group drives many qpairs' sockets from a single
//! `mio::Poll` instance and cooperative loop.

use std::{collections::HashSet, io, time::Duration};

use mio::{Events, Interest, Token};
use tracing::trace;

use crate::sock::ZeroCopySocket;

const MAX_EVENTS_PER_POLL: usize = 256;

/// Running counters a caller can surface as transport stats.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollGroupStats {
    pub polls: u64,
    pub idle_polls: u64,
    pub socket_completions: u64,
    pub nvme_completions: u64,
}

/// Drives readiness polling for every socket registered under it. A socket
/// joins via [`PollGroup::add_sock`] (which registers it with the
/// underlying `mio::Poll` under a caller-chosen [`Token`]) and leaves via
/// [`PollGroup::remove_sock`]; `poll` reports which tokens became ready
/// without owning the sockets themselves — ownership stays with the qpair
/// the token belongs to.
pub struct PollGroup {
    poll: mio::Poll,
    events: Events,
    /// Tokens currently registered, so double add/remove is caught rather
    /// than silently clobbering mio's own registration state.
    registered: HashSet<Token>,
    /// Tokens with a zero-copy completion queue or outbound backlog that
    /// still needs servicing even without a fresh readiness event —
    /// mirrors `pending_send` in the spec's concurrency model.
    pending_send: HashSet<Token>,
    /// Tokens whose qpair has inbound bytes already buffered (e.g. left
    /// over from a prior short read) and should be revisited even without
    /// a fresh readiness event — `pending_recv`.
    pending_recv: HashSet<Token>,
    /// Tokens whose qpair asked to be revisited on the next poll
    /// regardless of socket readiness (`needs_poll`).
    needs_poll: HashSet<Token>,
    stats: PollGroupStats,
}

impl PollGroup {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS_PER_POLL),
            registered: HashSet::new(),
            pending_send: HashSet::new(),
            pending_recv: HashSet::new(),
            needs_poll: HashSet::new(),
            stats: PollGroupStats::default(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Registers `sock` under `token` with this poll group's readiness
    /// source. Errors if `token` is already registered here.
    pub fn add_sock(&mut self, sock: &mut ZeroCopySocket, token: Token, interest: Interest) -> io::Result<()> {
        if self.registered.contains(&token) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "token already registered with this poll group"));
        }
        sock.register(self.poll.registry(), token, interest)?;
        self.registered.insert(token);
        Ok(())
    }

    /// Deregisters `sock`'s `token` and clears any pending marks left for
    /// it, so a later reused token doesn't inherit stale state.
    pub fn remove_sock(&mut self, sock: &mut ZeroCopySocket, token: Token) -> io::Result<()> {
        sock.deregister(self.poll.registry())?;
        self.registered.remove(&token);
        self.pending_send.remove(&token);
        self.pending_recv.remove(&token);
        self.needs_poll.remove(&token);
        Ok(())
    }

    pub fn mark_pending_send(&mut self, token: Token) {
        self.pending_send.insert(token);
    }

    pub fn mark_pending_recv(&mut self, token: Token) {
        self.pending_recv.insert(token);
    }

    pub fn mark_needs_poll(&mut self, token: Token) {
        self.needs_poll.insert(token);
    }

    pub fn stats(&self) -> PollGroupStats {
        self.stats
    }

    /// One poll-group iteration: drains `pending_send`/`pending_recv`/
    /// `needs_poll` tokens first (they don't need a fresh readiness event
    /// to make progress), then blocks on `mio::Poll::poll` up to `timeout`
    /// and appends any newly ready tokens. Returns the set of tokens the
    /// caller should drive this iteration; duplicates are coalesced.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Token>> {
        self.stats.polls += 1;
        let mut ready: Vec<Token> = self.pending_send.drain().collect();
        ready.extend(self.pending_recv.drain());
        ready.extend(self.needs_poll.drain());

        self.poll.poll(&mut self.events, timeout)?;
        if self.events.iter().next().is_none() && ready.is_empty() {
            self.stats.idle_polls += 1;
        }
        for event in self.events.iter() {
            let token = event.token();
            if !ready.contains(&token) {
                ready.push(token);
            }
            self.stats.socket_completions += 1;
            trace!(?token, readable = event.is_readable(), writable = event.is_writable(), "poll event");
        }
        Ok(ready)
    }

    pub fn record_nvme_completion(&mut self) {
        self.stats.nvme_completions += 1;
    }
}
