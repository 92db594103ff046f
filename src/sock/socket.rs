// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A non-blocking TCP socket wrapper with optional `MSG_ZEROCOPY` sends,
//! registered with a [`crate::pollgroup::PollGroup`] rather than driven by
//! a tokio reactor — the qpair engine polls it directly from its own
//! cooperative loop.

use std::{
    collections::VecDeque,
    io::{self, IoSlice},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use bytes::{Bytes, BytesMut};
use mio::{Interest, Token, net::TcpStream as MioTcpStream};
use socket2::{Domain, Socket, TcpKeepalive, Type};
use tracing::{debug, trace};

use crate::{error::TransportError, sock::packet::PacketRef};

// Not exposed by `libc` on every target triple; the numeric value is
// stable across Linux architectures.
const MSG_ZEROCOPY: i32 = 0x4000_0000;
const SO_ZEROCOPY: i32 = 60;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

/// A completed range of zero-copy sends, reported by the kernel as
/// `[lo, hi]` inclusive `sendmsg` sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZcCompletion {
    pub lo: u32,
    pub hi: u32,
    /// Set when the kernel fell back to a copy for this range (`SO_EE_CODE
    /// == SO_EE_CODE_ZEROCOPY_COPIED`); the caller's buffers are free to
    /// reuse regardless, this is purely a statistics signal.
    pub copied: bool,
}

pub struct ZeroCopySocket {
    stream: MioTcpStream,
    zerocopy_enabled: bool,
    next_send_seq: u32,
    /// Highest `sendmsg` sequence number acked by a zero-copy completion
    /// notification so far, used by `close` to tell whether any zero-copy
    /// send still has a kernel-held reference to its buffer.
    highest_acked_seq: Option<u32>,
    next_recv_seq: u32,
    recv_chunk_len: usize,
    pending_completions: VecDeque<ZcCompletion>,
}

impl ZeroCopySocket {
    /// Connects to `addr`, optionally requesting `SO_ZEROCOPY`. Falls back
    /// to ordinary copying sends if the kernel rejects the socket option
    /// (older kernels, or a socket family that doesn't support it).
    pub fn connect(addr: SocketAddr, want_zerocopy: bool, recv_chunk_len: usize) -> io::Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::STREAM, None)?;
        sock.set_nodelay(true)?;
        sock.set_nonblocking(true)?;
        sock.set_keepalive(true)?;
        let _ = sock.set_tcp_keepalive(&TcpKeepalive::new());

        let zerocopy_enabled = want_zerocopy && Self::try_enable_zerocopy(&sock);

        match sock.connect(&addr.into()) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => return Err(e),
        }

        let std_stream: std::net::TcpStream = sock.into();
        let stream = MioTcpStream::from_std(std_stream);

        Ok(Self {
            stream,
            zerocopy_enabled,
            next_send_seq: 0,
            highest_acked_seq: None,
            next_recv_seq: 0,
            recv_chunk_len,
            pending_completions: VecDeque::new(),
        })
    }

    fn try_enable_zerocopy(sock: &Socket) -> bool {
        let fd = sock.as_raw_fd();
        let one: libc::c_int = 1;
        // SAFETY: `fd` is a valid, open socket owned by `sock`; the option
        // value is a plain `c_int` whose size matches `optlen`.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                SO_ZEROCOPY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        rc == 0
    }

    pub fn zerocopy_enabled(&self) -> bool {
        self.zerocopy_enabled
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn register(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    pub fn reregister(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    pub fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Sets the socket's receive buffer size (`SO_RCVBUF`) and the chunk
    /// size `recv_chunks` reads at a time.
    pub fn set_recv_buf(&mut self, size: u32) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        let val: libc::c_int = size as libc::c_int;
        // SAFETY: `fd` is a valid, open socket owned by `self.stream`.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.recv_chunk_len = size as usize;
        Ok(())
    }

    /// Toggles `O_NONBLOCK` on the underlying file descriptor.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        // SAFETY: `fd` is owned by `self.stream` and valid for this call.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let new_flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        // SAFETY: same `fd`, setting flags just read from it above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sends `iovs` as a single `sendmsg`, using `MSG_ZEROCOPY` when
    /// enabled. Returns the byte count written and, when zero-copy was
    /// used, the sequence number the eventual completion notification will
    /// report. A `WouldBlock` surfaces as `Ok(None)` worth of bytes (0)
    /// rather than an error, matching non-blocking socket conventions.
    pub fn send_async(&mut self, iovs: &[IoSlice<'_>]) -> Result<(usize, Option<u32>), TransportError> {
        if iovs.is_empty() {
            return Ok((0, None));
        }
        let fd = self.stream.as_raw_fd();
        let flags = if self.zerocopy_enabled { MSG_ZEROCOPY } else { 0 };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovs.len();

        // SAFETY: `msg` describes `iovs`, which outlive this call; `fd` is
        // valid for the lifetime of `self`.
        let n = unsafe { libc::sendmsg(fd, &msg, flags) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok((0, None));
            }
            if err.raw_os_error() == Some(libc::ECONNRESET) || err.raw_os_error() == Some(libc::EPIPE) {
                return Err(TransportError::SocketDisconnected);
            }
            return Err(TransportError::SocketDisconnected);
        }

        let seq = if self.zerocopy_enabled {
            let s = self.next_send_seq;
            self.next_send_seq = self.next_send_seq.wrapping_add(1);
            Some(s)
        } else {
            None
        };
        Ok((n as usize, seq))
    }

    /// Drains `MSG_ERRQUEUE` for zero-copy completion notifications,
    /// returning any newly observed `[lo, hi]` ranges. Safe to call even
    /// when zero-copy is disabled (it will simply find nothing).
    pub fn poll_send_completions(&mut self) -> io::Result<Vec<ZcCompletion>> {
        if !self.zerocopy_enabled {
            return Ok(Vec::new());
        }
        let fd = self.stream.as_raw_fd();
        let mut out = Vec::new();
        let mut cbuf = [0u8; 128];

        loop {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cbuf.len();

            // SAFETY: `msg` owns a control buffer of `cbuf`'s length and no
            // data iovecs; `fd` is valid for the lifetime of `self`.
            let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }

            if let Some(completion) = Self::parse_zerocopy_cmsg(&msg) {
                trace!(lo = completion.lo, hi = completion.hi, "zerocopy completion");
                self.highest_acked_seq = Some(self.highest_acked_seq.map_or(completion.hi, |prev| prev.max(completion.hi)));
                out.push(completion);
            } else {
                break;
            }
        }
        self.pending_completions.extend(out.iter().copied());
        Ok(out)
    }

    /// Whether any `MSG_ZEROCOPY` send is still awaiting its completion
    /// notification, i.e. the kernel may still hold a reference to its
    /// buffer.
    fn zcopy_sends_outstanding(&self) -> bool {
        if !self.zerocopy_enabled || self.next_send_seq == 0 {
            return false;
        }
        match self.highest_acked_seq {
            Some(acked) => acked + 1 < self.next_send_seq,
            None => true,
        }
    }

    fn parse_zerocopy_cmsg(msg: &libc::msghdr) -> Option<ZcCompletion> {
        // SAFETY: `msg` was populated by a successful `recvmsg` call above
        // and its control buffer is valid for `msg_controllen` bytes.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::SOL_IP || hdr.cmsg_level == libc::SOL_IPV6 {
                    let data = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                    let ee = &*data;
                    if ee.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        return Some(ZcCompletion {
                            lo: ee.ee_info,
                            hi: ee.ee_data,
                            copied: ee.ee_code != 0,
                        });
                    }
                }
                cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
            }
        }
        None
    }

    /// Reads up to `max_chunks` chunks of `recv_chunk_len` bytes each, each
    /// wrapped in a ref-counted [`PacketRef`] so a qpair can hand one off
    /// as a zero-copy receive buffer without an extra copy. Stops early on
    /// `WouldBlock`; an empty read signals peer shutdown.
    pub fn recv_chunks(&mut self, max_chunks: usize) -> Result<Vec<PacketRef>, TransportError> {
        let mut chunks = Vec::with_capacity(max_chunks);
        for _ in 0..max_chunks {
            let mut buf = BytesMut::zeroed(self.recv_chunk_len);
            match io::Read::read(&mut self.stream, &mut buf) {
                Ok(0) => return Err(TransportError::SocketDisconnected),
                Ok(n) => {
                    buf.truncate(n);
                    let seq = self.next_recv_seq;
                    self.next_recv_seq = self.next_recv_seq.wrapping_add(1);
                    chunks.push(PacketRef::new(seq, buf.freeze()));
                    if n < self.recv_chunk_len {
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return Err(TransportError::SocketDisconnected),
            }
        }
        Ok(chunks)
    }

    /// Reads up to `max_len` bytes as a single contiguous buffer, bypassing
    /// the packet-chunk ref-counting `recv_chunks` does. For control-plane
    /// callers (IC_REQ/IC_RESP, the fabric CONNECT capsule) that have no
    /// use for zero-copy chaining.
    pub fn recv_bytes(&mut self, max_len: usize) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::zeroed(max_len);
        match io::Read::read(&mut self.stream, &mut buf) {
            Ok(0) => Err(TransportError::SocketDisconnected),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf.freeze())
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Bytes::new()),
            Err(_) => Err(TransportError::SocketDisconnected),
        }
    }

    /// Releases chunks back to the source. A [`PacketRef`] wraps a `Bytes`,
    /// which is itself refcounted, so freeing just drops this reference;
    /// any other holder (e.g. a request's `ZeroCopy` payload) keeps the
    /// underlying buffer alive until its own drop.
    pub fn free_chunks(&mut self, chunks: Vec<PacketRef>) {
        drop(chunks);
    }

    /// Closes the socket. With `force_if_no_zcopy_refs` cleared, a zero-copy
    /// send still awaiting its kernel completion notification defers the
    /// close — the socket is handed back to the caller instead of being
    /// dropped out from under that send. Set it to skip the check and
    /// close unconditionally.
    pub fn close(self, force_if_no_zcopy_refs: bool) -> Option<Self> {
        if !force_if_no_zcopy_refs && self.zcopy_sends_outstanding() {
            return Some(self);
        }
        debug!(fd = self.stream.as_raw_fd(), "closing zero-copy socket");
        let mut this = self;
        let _ = io::Write::flush(&mut this.stream);
        None
    }
}
