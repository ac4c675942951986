// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Selectable UDP datagram channel.
//!
//! # Locking
//!
//! Four locks, always taken in this order when more than one is held:
//!
//! 1. `reg_lock` - blocking mode and selector registration (reentrant)
//! 2. `read_lock` - serialises readers
//! 3. `write_lock` - serialises writers
//! 4. `state` - socket handle, addresses, registry, thread slots
//!
//! `bind`, `connect` and `disconnect` take read, write and state. `send` and
//! `receive` take their side lock and only touch `state` briefly before and
//! after the syscall; the state lock is never held across a blocking call.
//! Multicast operations and `close` take `state` alone.
//!
//! # Closing
//!
//! `close` marks the channel closed, dups a reserved descriptor over the fd
//! and signals any reader/writer thread parked in a syscall. The operation
//! then observes the closed flag in its retry loop and fails with
//! [`Error::AsynchronousClose`]. In-flight operations hold their own
//! `Arc<Socket>`, so the descriptor number is only released once they are
//! done. While the channel is registered with a selector the final close
//! (`kill`) waits for the last `deregister`.

pub mod membership;
pub mod select;

use self::membership::{MembershipKey, MembershipRegistry};
use self::select::{Ops, SelectionKey};
use crate::config::{MAX_TRAFFIC_CLASS, MAX_TTL};
use crate::error::{Error, Result};
use crate::netif::NetworkInterface;
use crate::sys::options::{self, OptionValue, SocketOptionId};
use crate::sys::thread::NativeThread;
use crate::sys::{multicast, socket as prim, Status};
use mio::unix::SourceFd;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use socket2::Socket;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Address family of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// IPv4; the only family that supports multicast membership.
    Inet,
    /// IPv6 (unicast). IPv4 peers are reached through mapped addresses.
    Inet6,
}

impl ProtocolFamily {
    pub fn is_ipv6(self) -> bool {
        self == ProtocolFamily::Inet6
    }

    fn wildcard(self) -> SocketAddr {
        match self {
            ProtocolFamily::Inet => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            ProtocolFamily::Inet6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Unconnected,
    Connected,
    Killed,
}

struct ChannelState {
    /// `None` once killed.
    socket: Option<Arc<Socket>>,
    state: State,
    local: Option<SocketAddr>,
    /// Set iff `state == Connected`.
    remote: Option<SocketAddr>,
    /// Sender of the most recently received datagram.
    cached_sender: Option<SocketAddr>,
    reader: Option<NativeThread>,
    writer: Option<NativeThread>,
    registry: Option<MembershipRegistry>,
    /// Milliseconds, 0 = infinite. Only the socket adaptor consults it.
    so_timeout: i32,
    registrations: usize,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            socket: None,
            state: State::Uninitialized,
            local: None,
            remote: None,
            cached_sender: None,
            reader: None,
            writer: None,
            registry: None,
            so_timeout: 0,
            registrations: 0,
        }
    }

    fn socket(&self) -> Result<Arc<Socket>> {
        self.socket.clone().ok_or(Error::ClosedChannel)
    }
}

pub(crate) struct ChannelInner {
    family: ProtocolFamily,
    open: AtomicBool,
    /// Written only with `reg_lock` held.
    blocking: AtomicBool,
    reg_lock: ReentrantMutex<()>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    state: Mutex<ChannelState>,
}

/// A UDP endpoint that can be used in blocking mode or registered with a
/// `mio` selector in non-blocking mode.
///
/// Handles are cheap to clone and share one underlying socket. The socket is
/// closed by [`close`](Self::close) or when the last handle is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use nio_udp::DatagramChannel;
///
/// let server = DatagramChannel::open()?;
/// server.bind(Some("127.0.0.1:0".parse().unwrap()))?;
/// let addr = server.local_addr()?.unwrap();
///
/// let client = DatagramChannel::open()?;
/// client.send(b"ping", Some(addr))?;
///
/// let mut buf = [0u8; 16];
/// if let Some((n, from)) = server.receive(&mut buf)? {
///     println!("{} bytes from {}: {:?}", n, from, &buf[..n]);
/// }
/// # Ok::<(), nio_udp::Error>(())
/// ```
#[derive(Clone)]
pub struct DatagramChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// One I/O operation in flight: a socket snapshot plus, in blocking mode,
/// the calling thread recorded in the reader/writer slot. The slot is cleared
/// on drop.
struct IoScope<'a> {
    inner: &'a ChannelInner,
    direction: Direction,
    socket: Arc<Socket>,
    remote: Option<SocketAddr>,
    tracked: bool,
}

impl<'a> IoScope<'a> {
    fn begin(inner: &'a ChannelInner, direction: Direction, track: bool) -> Result<Self> {
        let mut st = inner.state.lock();
        inner.ensure_open()?;
        let socket = st.socket()?;
        if track {
            let me = Some(NativeThread::current());
            match direction {
                Direction::Read => st.reader = me,
                Direction::Write => st.writer = me,
            }
        }
        Ok(Self {
            inner,
            direction,
            socket,
            remote: st.remote,
            tracked: track,
        })
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// An operation that did not complete on a channel that has since been
    /// closed failed because of the close.
    fn end(&self, completed: bool) -> Result<()> {
        if !completed && !self.inner.is_open() {
            return Err(Error::AsynchronousClose);
        }
        Ok(())
    }
}

impl Drop for IoScope<'_> {
    fn drop(&mut self) {
        if self.tracked {
            let mut st = self.inner.state.lock();
            match self.direction {
                Direction::Read => st.reader = None,
                Direction::Write => st.writer = None,
            }
        }
    }
}

/// Address as reported to callers: IPv4-mapped IPv6 addresses become IPv4.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

impl ChannelInner {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ClosedChannel)
        }
    }

    fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Address in the channel's family.
    fn check_address(&self, addr: SocketAddr) -> Result<SocketAddr> {
        match (self.family, addr) {
            (ProtocolFamily::Inet, SocketAddr::V4(_)) | (ProtocolFamily::Inet6, SocketAddr::V6(_)) => {
                Ok(addr)
            }
            (ProtocolFamily::Inet6, SocketAddr::V4(v4)) => Ok(SocketAddr::new(
                IpAddr::V6(v4.ip().to_ipv6_mapped()),
                v4.port(),
            )),
            (ProtocolFamily::Inet, SocketAddr::V6(_)) => Err(Error::UnsupportedAddressType),
        }
    }

    fn io_error(&self, e: io::Error, connected: bool) -> Error {
        if connected && e.kind() == io::ErrorKind::ConnectionRefused {
            Error::PortUnreachable
        } else {
            Error::Io(e)
        }
    }

    /// Bind with read, write and state locks held.
    fn bind_locked(&self, st: &mut ChannelState, addr: Option<SocketAddr>) -> Result<()> {
        self.ensure_open()?;
        if st.local.is_some() {
            return Err(Error::AlreadyBound);
        }
        let addr = match addr {
            Some(addr) => self.check_address(addr)?,
            None => self.family.wildcard(),
        };
        let socket = st.socket()?;
        prim::bind(&socket, addr)?;
        let local = prim::local_addr(&socket)?;
        st.local = Some(local);
        log::debug!("[DGRAM] fd={} bound to {}", socket.as_raw_fd(), local);
        Ok(())
    }

    /// Pick up the kernel-assigned local address after an implicit bind.
    fn refresh_local(&self, socket: &Socket) {
        let mut st = self.state.lock();
        if st.local.is_none() {
            st.local = prim::local_addr(socket).ok();
        }
    }

    fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(socket) = &st.socket {
            if let Err(e) = prim::preclose(socket.as_raw_fd()) {
                log::warn!("[DGRAM] pre-close of fd={} failed: {}", socket.as_raw_fd(), e);
                result = Err(Error::Io(e));
            }
        }
        if let Some(registry) = st.registry.as_mut() {
            if !registry.is_empty() {
                log::debug!("[MCAST] close invalidates {} membership(s)", registry.len());
            }
            registry.invalidate_all();
        }
        if let Some(reader) = st.reader {
            reader.signal();
        }
        if let Some(writer) = st.writer {
            writer.signal();
        }

        if st.registrations == 0 {
            self.kill_locked(&mut st);
        } else {
            log::debug!(
                "[DGRAM] close deferred, {} selector registration(s) remain",
                st.registrations
            );
        }
        result
    }

    fn kill_locked(&self, st: &mut ChannelState) {
        if st.state == State::Killed {
            return;
        }
        st.state = State::Killed;
        st.remote = None;
        st.cached_sender = None;
        // In-flight operations still hold the socket; the fd is released
        // when the last of them finishes.
        if let Some(socket) = st.socket.take() {
            log::debug!("[DGRAM] killed fd={}", socket.as_raw_fd());
        }
    }

    fn drop_membership(self: &Arc<Self>, key: &MembershipKey) -> Result<()> {
        let mut st = self.state.lock();
        if !key.is_valid() || !key.belongs_to(self) {
            return Ok(());
        }

        let result = match st.socket.clone() {
            Some(socket) if self.is_open() => multicast::join_leave4(
                &socket,
                false,
                key.raw_group(),
                key.raw_interface(),
                key.raw_source(),
            )
            .map(|_| ())
            .map_err(Error::Io),
            _ => Ok(()),
        };

        key.invalidate();
        if let Some(registry) = st.registry.as_mut() {
            registry.remove(key);
        }
        log::debug!("[MCAST] dropped {}", key);
        result
    }

    fn block(self: &Arc<Self>, key: &MembershipKey, source: IpAddr) -> Result<()> {
        let source = match source {
            IpAddr::V4(s) if !s.is_unspecified() && !s.is_multicast() => s,
            IpAddr::V4(_) => {
                return Err(Error::illegal_argument(
                    "source address is a wildcard or multicast address",
                ))
            }
            IpAddr::V6(_) => return Err(Error::illegal_argument("source address is not IPv4")),
        };

        let st = self.state.lock();
        if !key.is_valid() || !key.belongs_to(self) {
            return Err(Error::illegal_state("key is no longer valid"));
        }
        if key.is_blocked(source) {
            return Ok(());
        }
        let socket = st.socket()?;
        match multicast::block_unblock4(&socket, true, key.raw_group(), key.raw_interface(), source)? {
            Status::Ready(()) => {}
            _ => return Err(Error::Unsupported("source filtering not supported".into())),
        }
        key.add_blocked(source);
        log::debug!("[MCAST] {} blocked source {}", key, source);
        Ok(())
    }

    fn unblock(self: &Arc<Self>, key: &MembershipKey, source: IpAddr) -> Result<()> {
        let st = self.state.lock();
        if !key.is_valid() || !key.belongs_to(self) {
            return Err(Error::illegal_state("key is no longer valid"));
        }
        let source = match source {
            IpAddr::V4(s) if key.is_blocked(s) => s,
            _ => return Err(Error::illegal_state("not blocked")),
        };
        let socket = st.socket()?;
        match multicast::block_unblock4(&socket, false, key.raw_group(), key.raw_interface(), source)? {
            Status::Ready(()) => {}
            _ => return Err(Error::Unsupported("source filtering not supported".into())),
        }
        key.remove_blocked(source);
        log::debug!("[MCAST] {} unblocked source {}", key, source);
        Ok(())
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if self.open.swap(false, Ordering::AcqRel) {
            if let Some(registry) = st.registry.as_mut() {
                registry.invalidate_all();
            }
            log::trace!("[DGRAM] last handle dropped, closing");
        }
        st.state = State::Killed;
        st.socket = None;
    }
}

impl DatagramChannel {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open an unbound IPv4 channel in blocking mode.
    pub fn open() -> Result<Self> {
        Self::open_with_family(ProtocolFamily::Inet)
    }

    pub fn open_with_family(family: ProtocolFamily) -> Result<Self> {
        let mut st = ChannelState::new();
        let socket = prim::create(family.is_ipv6())?;
        log::debug!("[DGRAM] opened fd={} family={:?}", socket.as_raw_fd(), family);
        st.socket = Some(Arc::new(socket));
        st.state = State::Unconnected;

        Ok(Self {
            inner: Arc::new(ChannelInner {
                family,
                open: AtomicBool::new(true),
                blocking: AtomicBool::new(true),
                reg_lock: ReentrantMutex::new(()),
                read_lock: Mutex::new(()),
                write_lock: Mutex::new(()),
                state: Mutex::new(st),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.inner.family
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the channel. Idempotent.
    ///
    /// Every membership key is invalidated and threads blocked in this
    /// channel fail with [`Error::AsynchronousClose`]. If the channel is
    /// still registered with a selector the socket is released by the last
    /// [`deregister`](Self::deregister).
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Release the socket of a closed channel that is no longer registered.
    ///
    /// `close` and `deregister` do this automatically.
    pub fn kill(&self) -> Result<()> {
        let mut st = self.inner.state.lock();
        if self.inner.is_open() {
            return Err(Error::illegal_state("channel is still open"));
        }
        if st.registrations > 0 {
            return Err(Error::illegal_state("channel is still registered"));
        }
        self.inner.kill_locked(&mut st);
        Ok(())
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Bind to `addr`, or to an ephemeral port on the wildcard address.
    pub fn bind(&self, addr: Option<SocketAddr>) -> Result<()> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let _w = inner.write_lock.lock();
        let mut st = inner.state.lock();
        inner.bind_locked(&mut st, addr)
    }

    /// Resolve `host` and bind to the first address of the channel's family.
    pub fn bind_host(&self, host: &str, port: u16) -> Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .find(|a| self.inner.check_address(*a).is_ok())
            .ok_or(Error::UnsupportedAddressType)?;
        self.bind(Some(addr))
    }

    /// Only accept datagrams from, and only send to, `addr`.
    ///
    /// Datagrams queued before the connect are discarded.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let _w = inner.write_lock.lock();
        let mut st = inner.state.lock();
        inner.ensure_open()?;
        if st.state != State::Unconnected {
            return Err(Error::illegal_state("already connected"));
        }
        let addr = inner.check_address(addr)?;
        let socket = st.socket()?;

        prim::connect(&socket, addr)?;
        st.state = State::Connected;
        st.remote = Some(addr);
        st.cached_sender = Some(addr);
        if let Ok(local) = prim::local_addr(&socket) {
            st.local = Some(local);
        }

        let dropped = prim::drain(socket.as_raw_fd())?;
        log::debug!(
            "[DGRAM] fd={} connected to {} (discarded {} queued)",
            socket.as_raw_fd(),
            addr,
            dropped
        );
        Ok(())
    }

    /// Remove the peer filter. No-op unless connected and open.
    pub fn disconnect(&self) -> Result<()> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let _w = inner.write_lock.lock();
        let mut st = inner.state.lock();
        if !inner.is_open() || st.state != State::Connected {
            return Ok(());
        }
        let socket = st.socket()?;

        prim::disconnect(&socket, inner.family.is_ipv6())?;
        st.state = State::Unconnected;
        st.remote = None;
        st.cached_sender = None;
        st.local = prim::local_addr(&socket).ok();
        log::debug!("[DGRAM] fd={} disconnected", socket.as_raw_fd());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().state == State::Connected
    }

    /// Local address, `None` while unbound.
    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.inner.state.lock();
        self.inner.ensure_open()?;
        Ok(st.local.map(canonical))
    }

    /// Connected peer, `None` while unconnected.
    pub fn remote_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.inner.state.lock();
        self.inner.ensure_open()?;
        Ok(st.remote.map(canonical))
    }

    // ========================================================================
    // Datagram I/O
    // ========================================================================

    /// Send one datagram.
    ///
    /// On a connected channel `target` must be `None` or the peer address.
    /// Returns 0 when a non-blocking channel has no room for the datagram.
    pub fn send(&self, buf: &[u8], target: Option<SocketAddr>) -> Result<usize> {
        let inner = &*self.inner;
        let _w = inner.write_lock.lock();
        inner.ensure_open()?;
        let target = target.map(|t| inner.check_address(t)).transpose()?;
        let scope = IoScope::begin(inner, Direction::Write, inner.is_blocking())?;

        let dest = match (scope.remote, target) {
            (Some(peer), Some(t)) if t != peer => {
                return Err(Error::illegal_argument(
                    "connected address not equal to target address",
                ))
            }
            (Some(_), _) => None,
            (None, Some(t)) => Some(t),
            (None, None) => return Err(Error::NotYetConnected),
        };

        let result = loop {
            let status = match &dest {
                Some(t) => prim::send_to(scope.fd(), buf, t),
                None => prim::send(scope.fd(), buf),
            };
            match status {
                Ok(Status::Interrupted) if inner.is_open() => continue,
                other => break other,
            }
        };

        let completed = matches!(result, Ok(Status::Ready(_)) | Ok(Status::Unavailable));
        scope.end(completed)?;
        let n = match result {
            Ok(Status::Ready(n)) => n,
            Ok(Status::Unavailable) => 0,
            Ok(Status::Interrupted) => return Err(Error::AsynchronousClose),
            Err(e) => return Err(inner.io_error(e, scope.remote.is_some())),
        };
        inner.refresh_local(&scope.socket);
        Ok(n)
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns the number of bytes stored and the sender, or `None` when a
    /// non-blocking channel has nothing queued. A datagram larger than `buf`
    /// is truncated. An empty `buf` still consumes one datagram and reports
    /// its sender. An unbound channel is first bound to an ephemeral port.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        self.receive_with(buf, self.inner.is_blocking())
    }

    /// Receive without waiting, whatever the blocking mode.
    pub(crate) fn try_receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        self.receive_with(buf, false)
    }

    fn receive_with(&self, buf: &mut [u8], blocking: bool) -> Result<Option<(usize, SocketAddr)>> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        inner.ensure_open()?;
        self.bind_if_unbound()?;

        let flags = if blocking { 0 } else { libc::MSG_DONTWAIT };
        let scope = IoScope::begin(inner, Direction::Read, blocking)?;
        let empty = buf.is_empty();
        let mut probe = [0u8; 1];
        let mut completed = false;

        let result = loop {
            let target: &mut [u8] = if empty { &mut probe[..] } else { &mut buf[..] };
            match prim::recv_from(scope.fd(), target, flags) {
                Ok(Status::Ready((n, Some(from)))) => {
                    inner.state.lock().cached_sender = Some(from);
                    if scope.remote.map_or(false, |peer| peer != from) {
                        log::trace!("[DGRAM] dropped datagram from unexpected sender {}", from);
                        if blocking {
                            continue;
                        }
                        completed = true;
                        break Ok(None);
                    }
                    completed = true;
                    break Ok(Some((if empty { 0 } else { n }, canonical(from))));
                }
                // End-of-file from the reserved descriptor after pre-close.
                Ok(Status::Ready((_, None))) => break Ok(None),
                Ok(Status::Unavailable) => {
                    completed = true;
                    break Ok(None);
                }
                Ok(Status::Interrupted) if inner.is_open() => continue,
                Ok(Status::Interrupted) => break Ok(None),
                Err(e) => break Err(inner.io_error(e, scope.remote.is_some())),
            }
        };

        scope.end(completed)?;
        result
    }

    /// Bind to the wildcard address if nothing is bound yet. Called with the
    /// read lock held.
    fn bind_if_unbound(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.state.lock().local.is_some() {
            return Ok(());
        }
        let _w = inner.write_lock.lock();
        let mut st = inner.state.lock();
        if st.local.is_none() {
            inner.bind_locked(&mut st, None)?;
        }
        Ok(())
    }

    // ========================================================================
    // Byte-channel I/O (connected only)
    // ========================================================================

    /// Read one datagram from the connected peer.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let scope = IoScope::begin(inner, Direction::Read, inner.is_blocking())?;
        if scope.remote.is_none() {
            return Err(Error::NotYetConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let result = loop {
            match prim::recv(scope.fd(), buf) {
                Ok(Status::Interrupted) if inner.is_open() => continue,
                other => break other,
            }
        };
        self.finish_byte_io(&scope, result)
    }

    /// Scatter one datagram from the connected peer across `bufs`.
    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let scope = IoScope::begin(inner, Direction::Read, inner.is_blocking())?;
        if scope.remote.is_none() {
            return Err(Error::NotYetConnected);
        }
        let result = loop {
            match prim::readv(scope.fd(), bufs) {
                Ok(Status::Interrupted) if inner.is_open() => continue,
                other => break other,
            }
        };
        self.finish_byte_io(&scope, result)
    }

    /// Write one datagram to the connected peer.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let inner = &*self.inner;
        let _w = inner.write_lock.lock();
        let scope = IoScope::begin(inner, Direction::Write, inner.is_blocking())?;
        if scope.remote.is_none() {
            return Err(Error::NotYetConnected);
        }
        let result = loop {
            match prim::send(scope.fd(), buf) {
                Ok(Status::Interrupted) if inner.is_open() => continue,
                other => break other,
            }
        };
        self.finish_byte_io(&scope, result)
    }

    /// Gather `bufs` into one datagram to the connected peer.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let inner = &*self.inner;
        let _w = inner.write_lock.lock();
        let scope = IoScope::begin(inner, Direction::Write, inner.is_blocking())?;
        if scope.remote.is_none() {
            return Err(Error::NotYetConnected);
        }
        let result = loop {
            match prim::writev(scope.fd(), bufs) {
                Ok(Status::Interrupted) if inner.is_open() => continue,
                other => break other,
            }
        };
        self.finish_byte_io(&scope, result)
    }

    fn finish_byte_io(&self, scope: &IoScope<'_>, result: io::Result<Status<usize>>) -> Result<usize> {
        let completed = matches!(result, Ok(Status::Ready(n)) if n > 0)
            || matches!(result, Ok(Status::Unavailable));
        scope.end(completed)?;
        match result {
            Ok(Status::Ready(n)) => Ok(n),
            Ok(Status::Unavailable) => Ok(0),
            Ok(Status::Interrupted) => Err(Error::AsynchronousClose),
            Err(e) => Err(self.inner.io_error(e, true)),
        }
    }

    /// Wait up to `timeout_ms` (negative = forever) for `events` on the
    /// socket. Returns the ready events, 0 on timeout or interruption.
    pub fn poll(&self, events: i16, timeout_ms: i32) -> Result<i16> {
        let inner = &*self.inner;
        let _r = inner.read_lock.lock();
        let scope = IoScope::begin(inner, Direction::Read, true)?;
        let revents = match prim::poll(scope.fd(), events, timeout_ms) {
            Ok(Status::Ready(revents)) => revents,
            Ok(_) => 0,
            Err(e) => {
                scope.end(false)?;
                return Err(Error::Io(e));
            }
        };
        scope.end(revents != 0)?;
        Ok(revents)
    }

    // ========================================================================
    // Multicast
    // ========================================================================

    /// Join `group` on `interface` to receive datagrams from every source.
    ///
    /// Joining again with the same arguments returns the existing key.
    pub fn join(&self, group: IpAddr, interface: &NetworkInterface) -> Result<MembershipKey> {
        self.join_internal(group, interface, None)
    }

    /// Join `group` on `interface` to receive datagrams from `source` only.
    pub fn join_source(
        &self,
        group: IpAddr,
        interface: &NetworkInterface,
        source: IpAddr,
    ) -> Result<MembershipKey> {
        self.join_internal(group, interface, Some(source))
    }

    fn join_internal(
        &self,
        group: IpAddr,
        interface: &NetworkInterface,
        source: Option<IpAddr>,
    ) -> Result<MembershipKey> {
        let inner = &*self.inner;
        let group = match group {
            IpAddr::V4(g) if g.is_multicast() => g,
            _ => {
                return Err(Error::illegal_argument(
                    "group is not an IPv4 multicast address",
                ))
            }
        };
        if inner.family.is_ipv6() {
            return Err(Error::illegal_argument(
                "IPv6 channel cannot join an IPv4 multicast group",
            ));
        }
        let source = match source {
            None => None,
            Some(IpAddr::V4(s)) if !s.is_unspecified() && !s.is_multicast() => Some(s),
            Some(_) => {
                return Err(Error::illegal_argument(
                    "source address is not an IPv4 unicast address",
                ))
            }
        };

        let mut st = inner.state.lock();
        inner.ensure_open()?;
        let socket = st.socket()?;
        let registry = st.registry.get_or_insert_with(MembershipRegistry::new);
        if let Some(existing) = registry.check_membership(group, interface, source)? {
            return Ok(existing);
        }

        let iface_addr = interface.first_ipv4().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("network interface {} not configured for IPv4", interface.name()),
            ))
        })?;

        match multicast::join_leave4(&socket, true, group, iface_addr, source)? {
            Status::Ready(()) => {}
            _ => {
                let what = if source.is_some() {
                    "source-specific multicast not supported"
                } else {
                    "multicast membership not supported"
                };
                return Err(Error::Unsupported(what.into()));
            }
        }

        let key = MembershipKey::new(
            Arc::downgrade(&self.inner),
            group,
            interface.clone(),
            iface_addr,
            source,
        );
        registry.add(key.clone());
        log::debug!("[MCAST] joined {}", key);
        Ok(key)
    }

    /// Number of active memberships.
    pub fn membership_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .registry
            .as_ref()
            .map_or(0, MembershipRegistry::len)
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Set a socket option.
    ///
    /// `SO_TIMEOUT` is stored on the channel and only used by the blocking
    /// socket adaptor. `IP_ADD_MEMBERSHIP` / `IP_DROP_MEMBERSHIP` join or
    /// drop an any-source membership.
    pub fn set_option(&self, id: SocketOptionId, value: OptionValue) -> Result<()> {
        self.inner.ensure_open()?;
        if value.kind() != id.kind() {
            return Err(Error::illegal_argument(format!("invalid value for {}", id)));
        }
        match (id, value) {
            (SocketOptionId::SoTimeout, OptionValue::Int(ms)) => {
                if ms < 0 {
                    return Err(Error::illegal_argument("timeout can't be negative"));
                }
                let mut st = self.inner.state.lock();
                self.inner.ensure_open()?;
                st.so_timeout = ms;
                Ok(())
            }
            (SocketOptionId::IpAddMembership, OptionValue::Membership(req)) => {
                let iface = membership_interface(req.interface)?;
                self.join(req.group, &iface).map(|_| ())
            }
            (SocketOptionId::IpDropMembership, OptionValue::Membership(req)) => {
                let iface = membership_interface(req.interface)?;
                let group = match req.group {
                    IpAddr::V4(g) if g.is_multicast() => g,
                    _ => {
                        return Err(Error::illegal_argument(
                            "group is not an IPv4 multicast address",
                        ))
                    }
                };
                let key = {
                    let st = self.inner.state.lock();
                    self.inner.ensure_open()?;
                    st.registry
                        .as_ref()
                        .and_then(|r| r.find_any_source(group, &iface))
                };
                match key {
                    Some(key) => key.drop_membership(),
                    None => Err(Error::illegal_state("not a member of the group")),
                }
            }
            (id, value) => self.set_os_option(id, &value),
        }
    }

    fn set_os_option(&self, id: SocketOptionId, value: &OptionValue) -> Result<()> {
        self.check_option_family(id)?;
        let int = value.as_int();
        match id {
            SocketOptionId::SoRcvBuf | SocketOptionId::SoSndBuf if int.map_or(false, |n| n <= 0) => {
                return Err(Error::illegal_argument(format!("invalid {} size", id)));
            }
            SocketOptionId::IpTos if int.map_or(false, |n| !(0..=MAX_TRAFFIC_CLASS).contains(&n)) => {
                return Err(Error::illegal_argument("traffic class out of range"));
            }
            SocketOptionId::IpMulticastTtl if int.map_or(false, |n| !(0..=MAX_TTL).contains(&n)) => {
                return Err(Error::illegal_argument("ttl out of range"));
            }
            _ => {}
        }

        let ops = options::lookup(id)
            .ok_or_else(|| Error::Unsupported(format!("{} cannot be set", id)))?;
        let st = self.inner.state.lock();
        self.inner.ensure_open()?;
        let socket = st.socket()?;
        (ops.set)(&socket, self.inner.family.is_ipv6(), value)?;
        log::trace!("[DGRAM] fd={} {} = {:?}", socket.as_raw_fd(), id, value);
        Ok(())
    }

    /// Read a socket option. The membership options are write-only.
    pub fn get_option(&self, id: SocketOptionId) -> Result<OptionValue> {
        self.inner.ensure_open()?;
        match id {
            SocketOptionId::SoTimeout => {
                let st = self.inner.state.lock();
                self.inner.ensure_open()?;
                Ok(OptionValue::Int(st.so_timeout))
            }
            SocketOptionId::IpAddMembership | SocketOptionId::IpDropMembership => {
                Err(Error::illegal_argument(format!("{} is write-only", id)))
            }
            _ => {
                self.check_option_family(id)?;
                let ops = options::lookup(id)
                    .ok_or_else(|| Error::Unsupported(format!("{} cannot be read", id)))?;
                let st = self.inner.state.lock();
                self.inner.ensure_open()?;
                let socket = st.socket()?;
                Ok((ops.get)(&socket, self.inner.family.is_ipv6())?)
            }
        }
    }

    fn check_option_family(&self, id: SocketOptionId) -> Result<()> {
        if id.is_multicast() && self.inner.family.is_ipv6() {
            return Err(Error::Unsupported(format!("{} requires an IPv4 channel", id)));
        }
        Ok(())
    }

    // ========================================================================
    // Blocking mode and selector integration
    // ========================================================================

    pub fn is_blocking(&self) -> bool {
        self.inner.is_blocking()
    }

    /// Switch between blocking and non-blocking mode. Waits for in-flight
    /// reads and writes to finish. A registered channel cannot be made
    /// blocking.
    pub fn configure_blocking(&self, block: bool) -> Result<()> {
        let inner = &*self.inner;
        let _g = inner.reg_lock.lock();
        let _r = inner.read_lock.lock();
        let _w = inner.write_lock.lock();
        let st = inner.state.lock();
        inner.ensure_open()?;
        if inner.is_blocking() == block {
            return Ok(());
        }
        if block && st.registrations > 0 {
            return Err(Error::IllegalBlockingMode);
        }
        let socket = st.socket()?;
        prim::configure_blocking(&socket, block)?;
        inner.blocking.store(block, Ordering::Release);
        Ok(())
    }

    /// Lock guarding the blocking mode; the socket adaptor holds it while it
    /// checks the mode, never across the I/O itself.
    pub(crate) fn blocking_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.reg_lock.lock()
    }

    /// Ops a datagram channel can be selected for.
    pub fn valid_ops(&self) -> Ops {
        Ops::READ | Ops::WRITE
    }

    pub fn translate_interest_ops(&self, ops: Ops) -> i16 {
        select::translate_interest_ops(ops)
    }

    pub fn translate_ready_ops(&self, revents: i16, initial: Ops, key: &SelectionKey) -> bool {
        select::translate_ready_ops(revents, initial, key)
    }

    pub fn translate_and_set_ready_ops(&self, revents: i16, key: &SelectionKey) -> bool {
        select::translate_and_set_ready_ops(revents, key)
    }

    pub fn translate_and_update_ready_ops(&self, revents: i16, key: &SelectionKey) -> bool {
        select::translate_and_update_ready_ops(revents, key)
    }

    fn check_interest(&self, ops: Ops) -> Result<mio::Interest> {
        if !self.valid_ops().contains(ops) {
            return Err(Error::illegal_argument(format!("invalid interest set {:?}", ops)));
        }
        select::interest_for(ops).ok_or_else(|| Error::illegal_argument("empty interest set"))
    }

    /// Register with a selector. The channel must be non-blocking.
    pub fn register(&self, registry: &mio::Registry, token: mio::Token, ops: Ops) -> Result<SelectionKey> {
        let inner = &*self.inner;
        let _g = inner.reg_lock.lock();
        inner.ensure_open()?;
        if inner.is_blocking() {
            return Err(Error::IllegalBlockingMode);
        }
        let interest = self.check_interest(ops)?;
        let mut st = inner.state.lock();
        inner.ensure_open()?;
        let fd = st.socket()?.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, interest)?;
        st.registrations += 1;
        log::debug!("[DGRAM] fd={} registered token={:?} ops={:?}", fd, token, ops);
        Ok(SelectionKey::new(token, ops))
    }

    /// Change the interest set of an existing registration.
    pub fn reregister(&self, registry: &mio::Registry, key: &SelectionKey, ops: Ops) -> Result<()> {
        let inner = &*self.inner;
        let _g = inner.reg_lock.lock();
        inner.ensure_open()?;
        if !key.is_valid() {
            return Err(Error::illegal_state("selection key is cancelled"));
        }
        let interest = self.check_interest(ops)?;
        let st = inner.state.lock();
        inner.ensure_open()?;
        let fd = st.socket()?.as_raw_fd();
        registry.reregister(&mut SourceFd(&fd), key.token(), interest)?;
        key.set_interest_ops(ops);
        Ok(())
    }

    /// Cancel a registration. The last deregistration of a closed channel
    /// releases its socket.
    pub fn deregister(&self, registry: &mio::Registry, key: &SelectionKey) -> Result<()> {
        let inner = &*self.inner;
        let _g = inner.reg_lock.lock();
        let mut st = inner.state.lock();
        if !key.cancel() {
            return Ok(());
        }

        // A pre-closed fd is no longer in the selector.
        let result = match &st.socket {
            Some(socket) if inner.is_open() => registry
                .deregister(&mut SourceFd(&socket.as_raw_fd()))
                .map_err(Error::Io),
            _ => Ok(()),
        };
        st.registrations = st.registrations.saturating_sub(1);
        if !inner.is_open() && st.registrations == 0 {
            inner.kill_locked(&mut st);
        }
        result
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().registrations > 0
    }

    #[cfg(test)]
    fn cached_sender(&self) -> Option<SocketAddr> {
        self.inner.state.lock().cached_sender
    }

    #[cfg(test)]
    fn is_killed(&self) -> bool {
        self.inner.state.lock().state == State::Killed
    }
}

fn membership_interface(interface: Option<NetworkInterface>) -> Result<NetworkInterface> {
    match interface {
        Some(iface) => Ok(iface),
        None => NetworkInterface::default_multicast()?.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no multicast-capable network interface",
            ))
        }),
    }
}

impl fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("DatagramChannel")
            .field("family", &self.inner.family)
            .field("open", &self.inner.is_open())
            .field("blocking", &self.inner.is_blocking())
            .field("state", &st.state)
            .field("local", &st.local)
            .field("remote", &st.remote)
            .field("cached_sender", &st.cached_sender)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback(channel: &DatagramChannel) -> SocketAddr {
        channel
            .bind(Some("127.0.0.1:0".parse().expect("addr")))
            .expect("bind failed");
        channel
            .local_addr()
            .expect("local_addr failed")
            .expect("bound")
    }

    #[test]
    fn test_open_defaults() {
        let ch = DatagramChannel::open().expect("open failed");
        assert!(ch.is_open());
        assert!(ch.is_blocking());
        assert!(!ch.is_connected());
        assert_eq!(ch.local_addr().expect("local"), None);
        assert_eq!(ch.remote_addr().expect("remote"), None);
        assert_eq!(ch.family(), ProtocolFamily::Inet);
    }

    #[test]
    fn test_closed_channel_rejects_everything() {
        let ch = DatagramChannel::open().expect("open failed");
        ch.close().expect("close failed");
        ch.close().expect("second close is a no-op");
        assert!(!ch.is_open());
        assert!(ch.is_killed());

        let peer: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        assert!(matches!(ch.bind(None), Err(Error::ClosedChannel)));
        assert!(matches!(ch.connect(peer), Err(Error::ClosedChannel)));
        assert!(matches!(ch.send(b"x", Some(peer)), Err(Error::ClosedChannel)));
        assert!(matches!(ch.receive(&mut [0u8; 4]), Err(Error::ClosedChannel)));
        assert!(matches!(ch.local_addr(), Err(Error::ClosedChannel)));
        assert!(matches!(
            ch.get_option(SocketOptionId::SoRcvBuf),
            Err(Error::ClosedChannel)
        ));
        assert!(matches!(
            ch.get_option(SocketOptionId::IpAddMembership),
            Err(Error::ClosedChannel)
        ));
        assert!(matches!(
            ch.set_option(SocketOptionId::SoRcvBuf, OptionValue::Bool(true)),
            Err(Error::ClosedChannel)
        ));

        let poll = mio::Poll::new().expect("poll");
        assert!(matches!(
            ch.register(poll.registry(), mio::Token(0), Ops::READ),
            Err(Error::ClosedChannel)
        ));
    }

    #[test]
    fn test_bind_twice_fails() {
        let ch = DatagramChannel::open().expect("open failed");
        loopback(&ch);
        assert!(matches!(ch.bind(None), Err(Error::AlreadyBound)));
    }

    #[test]
    fn test_bind_wrong_family() {
        let ch = DatagramChannel::open().expect("open failed");
        let v6: SocketAddr = "[::1]:0".parse().expect("addr");
        assert!(matches!(ch.bind(Some(v6)), Err(Error::UnsupportedAddressType)));
    }

    #[test]
    fn test_bind_host_resolves() {
        let ch = DatagramChannel::open().expect("open failed");
        ch.bind_host("localhost", 0).expect("bind_host failed");
        let local = ch.local_addr().expect("local").expect("bound");
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_send_receive_and_cached_sender() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);

        assert_eq!(b.send(b"ping", Some(a_addr)).expect("send"), 4);
        let b_addr = b.local_addr().expect("local").expect("implicitly bound");

        let mut buf = [0u8; 16];
        let (n, from) = a.receive(&mut buf).expect("receive").expect("datagram");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), b_addr.port());
        assert_eq!(a.cached_sender(), Some(from));
    }

    #[test]
    fn test_zero_length_buffer_consumes_datagram() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);
        let b_addr = loopback(&b);
        b.send(b"first", Some(a_addr)).expect("send");
        b.send(b"second", Some(a_addr)).expect("send");

        let (n, from) = a.receive(&mut []).expect("receive").expect("datagram");
        assert_eq!(n, 0);
        assert_eq!(from, b_addr);

        let mut buf = [0u8; 16];
        let (n, _) = a.receive(&mut buf).expect("receive").expect("datagram");
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_truncates_large_datagram() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);
        b.send(b"0123456789", Some(a_addr)).expect("send");

        let mut buf = [0u8; 4];
        let (n, _) = a.receive(&mut buf).expect("receive").expect("datagram");
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn test_nonblocking_receive_empty_queue() {
        let a = DatagramChannel::open().expect("open");
        loopback(&a);
        a.configure_blocking(false).expect("nonblocking");
        let mut buf = [7u8; 8];
        assert!(a.receive(&mut buf).expect("receive").is_none());
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn test_receive_binds_unbound_channel() {
        let a = DatagramChannel::open().expect("open");
        a.configure_blocking(false).expect("nonblocking");
        assert!(a.receive(&mut [0u8; 8]).expect("receive").is_none());
        let local = a.local_addr().expect("local").expect("bound by receive");
        assert!(local.ip().is_unspecified());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_connected_send_mismatch() {
        let a = DatagramChannel::open().expect("open");
        let peer = DatagramChannel::open().expect("open peer");
        let peer_addr = loopback(&peer);
        let other: SocketAddr = SocketAddr::new(peer_addr.ip(), peer_addr.port().wrapping_add(1));

        a.connect(peer_addr).expect("connect");
        assert!(matches!(
            a.send(b"x", Some(other)),
            Err(Error::IllegalArgument(_))
        ));
        assert_eq!(a.send(b"ok", Some(peer_addr)).expect("send to peer"), 2);
        assert_eq!(a.send(b"ok", None).expect("send implicit"), 2);
    }

    #[test]
    fn test_unconnected_send_requires_target() {
        let a = DatagramChannel::open().expect("open");
        assert!(matches!(a.send(b"x", None), Err(Error::NotYetConnected)));
    }

    #[test]
    fn test_connected_receive_filters_other_senders() {
        let a = DatagramChannel::open().expect("open a");
        let peer = DatagramChannel::open().expect("open peer");
        let stranger = DatagramChannel::open().expect("open stranger");
        let a_addr = loopback(&a);
        let peer_addr = loopback(&peer);
        loopback(&stranger);

        a.connect(peer_addr).expect("connect");
        stranger.send(b"noise", Some(a_addr)).expect("send noise");
        peer.send(b"signal", Some(a_addr)).expect("send signal");

        let mut buf = [0u8; 16];
        let (n, from) = a.receive(&mut buf).expect("receive").expect("datagram");
        assert_eq!(&buf[..n], b"signal");
        assert_eq!(from, peer_addr);
    }

    #[test]
    fn test_connect_state_machine() {
        let a = DatagramChannel::open().expect("open");
        let x: SocketAddr = "127.0.0.1:45002".parse().expect("addr");
        let y: SocketAddr = "127.0.0.1:45003".parse().expect("addr");

        a.connect(x).expect("connect");
        assert!(a.is_connected());
        assert_eq!(a.remote_addr().expect("remote"), Some(x));
        assert!(matches!(a.connect(y), Err(Error::IllegalState(_))));

        let port = a.local_addr().expect("local").expect("bound").port();
        a.disconnect().expect("disconnect");
        assert!(!a.is_connected());
        assert_eq!(a.remote_addr().expect("remote"), None);
        assert_eq!(a.local_addr().expect("local").expect("bound").port(), port);

        a.connect(y).expect("reconnect");
        assert_eq!(a.remote_addr().expect("remote"), Some(y));

        // Disconnect when not connected is a no-op.
        a.disconnect().expect("disconnect");
        a.disconnect().expect("disconnect again");
    }

    #[test]
    fn test_connect_discards_queued() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);
        let b_addr = loopback(&b);
        b.send(b"stale", Some(a_addr)).expect("send");
        std::thread::sleep(Duration::from_millis(20));

        a.connect(b_addr).expect("connect");
        a.configure_blocking(false).expect("nonblocking");
        assert!(a.receive(&mut [0u8; 8]).expect("receive").is_none());
    }

    #[test]
    fn test_byte_channel_requires_connect() {
        let a = DatagramChannel::open().expect("open");
        assert!(matches!(a.read(&mut [0u8; 4]), Err(Error::NotYetConnected)));
        assert!(matches!(a.write(b"x"), Err(Error::NotYetConnected)));
    }

    #[test]
    fn test_read_write_vectored() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);
        let b_addr = loopback(&b);
        a.connect(b_addr).expect("connect a");
        b.connect(a_addr).expect("connect b");

        let n = b
            .write_vectored(&[IoSlice::new(b"he"), IoSlice::new(b"llo")])
            .expect("writev");
        assert_eq!(n, 5);

        let mut head = [0u8; 2];
        let mut tail = [0u8; 8];
        let n = a
            .read_vectored(&mut [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)])
            .expect("readv");
        assert_eq!(n, 5);
        assert_eq!(&head, b"he");
        assert_eq!(&tail[..3], b"llo");

        assert_eq!(a.write(b"back").expect("write"), 4);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"back");
    }

    #[test]
    fn test_port_unreachable_on_connected_read() {
        let a = DatagramChannel::open().expect("open");
        // Bind then close a socket to get a port nobody listens on.
        let dead = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
            s.local_addr().expect("addr")
        };
        a.connect(dead).expect("connect");
        a.write(b"hello?").expect("write");
        a.configure_blocking(false).expect("nonblocking");
        std::thread::sleep(Duration::from_millis(50));
        match a.read(&mut [0u8; 8]) {
            Err(Error::PortUnreachable) | Ok(0) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_option_round_trips() {
        let ch = DatagramChannel::open().expect("open");
        ch.set_option(SocketOptionId::SoReuseAddr, OptionValue::Bool(true))
            .expect("set reuse");
        assert_eq!(
            ch.get_option(SocketOptionId::SoReuseAddr).expect("get"),
            OptionValue::Bool(true)
        );
        ch.set_option(SocketOptionId::SoTimeout, OptionValue::Int(250))
            .expect("set timeout");
        assert_eq!(
            ch.get_option(SocketOptionId::SoTimeout).expect("get"),
            OptionValue::Int(250)
        );
        ch.set_option(SocketOptionId::IpMulticastTtl, OptionValue::Int(0))
            .expect("ttl 0");
        assert_eq!(
            ch.get_option(SocketOptionId::IpMulticastTtl).expect("get"),
            OptionValue::Int(0)
        );
        ch.set_option(SocketOptionId::IpTos, OptionValue::Int(0x10))
            .expect("tos");
        assert_eq!(
            ch.get_option(SocketOptionId::IpTos).expect("get"),
            OptionValue::Int(0x10)
        );
    }

    #[test]
    fn test_option_validation() {
        let ch = DatagramChannel::open().expect("open");
        assert!(matches!(
            ch.set_option(SocketOptionId::IpMulticastTtl, OptionValue::Int(256)),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.set_option(SocketOptionId::IpMulticastTtl, OptionValue::Int(-1)),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.set_option(SocketOptionId::SoRcvBuf, OptionValue::Int(0)),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.set_option(SocketOptionId::SoBroadcast, OptionValue::Int(1)),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.set_option(SocketOptionId::SoTimeout, OptionValue::Int(-5)),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.get_option(SocketOptionId::IpAddMembership),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_join_validation() {
        let ch = DatagramChannel::open().expect("open");
        let iface = match NetworkInterface::loopback().expect("lookup") {
            Some(lo) => lo,
            None => return,
        };
        let unicast: IpAddr = "10.1.2.3".parse().expect("ip");
        let group: IpAddr = "239.9.9.9".parse().expect("ip");
        assert!(matches!(ch.join(unicast, &iface), Err(Error::IllegalArgument(_))));
        assert!(matches!(
            ch.join("ff02::1".parse().expect("ip"), &iface),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.join_source(group, &iface, "0.0.0.0".parse().expect("ip")),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            ch.join_source(group, &iface, "239.1.1.1".parse().expect("ip")),
            Err(Error::IllegalArgument(_))
        ));
        assert_eq!(ch.membership_count(), 0);
    }

    #[test]
    fn test_ipv6_channel_rejects_multicast() {
        let ch = match DatagramChannel::open_with_family(ProtocolFamily::Inet6) {
            Ok(ch) => ch,
            Err(_) => return,
        };
        assert!(matches!(
            ch.set_option(SocketOptionId::IpMulticastTtl, OptionValue::Int(1)),
            Err(Error::Unsupported(_))
        ));
        if let Some(lo) = NetworkInterface::loopback().expect("lookup") {
            assert!(matches!(
                ch.join("239.1.1.1".parse().expect("ip"), &lo),
                Err(Error::IllegalArgument(_))
            ));
        }
    }

    #[test]
    fn test_close_interrupts_blocking_receive() {
        let ch = DatagramChannel::open().expect("open");
        loopback(&ch);
        let reader = ch.clone();
        let handle = std::thread::spawn(move || reader.receive(&mut [0u8; 16]));

        std::thread::sleep(Duration::from_millis(100));
        ch.close().expect("close");

        let result = handle.join().expect("join");
        assert!(matches!(result, Err(Error::AsynchronousClose)), "{:?}", result);
    }

    #[test]
    fn test_register_requires_nonblocking() {
        let poll = mio::Poll::new().expect("poll");
        let ch = DatagramChannel::open().expect("open");
        loopback(&ch);
        assert!(matches!(
            ch.register(poll.registry(), mio::Token(0), Ops::READ),
            Err(Error::IllegalBlockingMode)
        ));

        ch.configure_blocking(false).expect("nonblocking");
        assert!(matches!(
            ch.register(poll.registry(), mio::Token(0), Ops::ACCEPT),
            Err(Error::IllegalArgument(_))
        ));
        let key = ch
            .register(poll.registry(), mio::Token(0), Ops::READ)
            .expect("register");
        assert!(ch.is_registered());
        assert!(matches!(ch.configure_blocking(true), Err(Error::IllegalBlockingMode)));

        ch.reregister(poll.registry(), &key, Ops::READ | Ops::WRITE)
            .expect("reregister");
        assert_eq!(key.interest_ops(), Ops::READ | Ops::WRITE);

        ch.deregister(poll.registry(), &key).expect("deregister");
        assert!(!ch.is_registered());
        ch.configure_blocking(true).expect("blocking again");
    }

    #[test]
    fn test_kill_deferred_until_deregistered() {
        let poll = mio::Poll::new().expect("poll");
        let ch = DatagramChannel::open().expect("open");
        ch.configure_blocking(false).expect("nonblocking");
        let key = ch
            .register(poll.registry(), mio::Token(3), Ops::READ)
            .expect("register");

        ch.close().expect("close");
        assert!(!ch.is_open());
        assert!(!ch.is_killed());
        assert!(matches!(ch.kill(), Err(Error::IllegalState(_))));

        ch.deregister(poll.registry(), &key).expect("deregister");
        assert!(ch.is_killed());
        // A second deregister of the same key is a no-op.
        ch.deregister(poll.registry(), &key).expect("deregister again");
    }

    #[test]
    fn test_kill_open_channel_rejected() {
        let ch = DatagramChannel::open().expect("open");
        assert!(matches!(ch.kill(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_poll_timeout_and_readiness() {
        let a = DatagramChannel::open().expect("open a");
        let b = DatagramChannel::open().expect("open b");
        let a_addr = loopback(&a);
        assert_eq!(a.poll(select::POLLIN, 20).expect("poll"), 0);

        b.send(b"wake", Some(a_addr)).expect("send");
        let revents = a.poll(select::POLLIN, 1000).expect("poll");
        assert_ne!(revents & select::POLLIN, 0);
    }
}
