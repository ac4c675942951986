// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Datagram socket lifecycle and I/O primitives.
//!
//! Sockets are created through `socket2`. The I/O calls go straight to libc
//! and work on a raw fd snapshot: after pre-close that fd refers to the
//! reserved stream socket, whose end-of-file shows up here as a receive with
//! no sender address. `EINTR` is reported as [`Status::Interrupted`] and the
//! channel decides whether to retry.

use super::addr::RawAddr;
use super::{cvt, cvt_size, normalize, Status};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::OnceLock;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Poll event bits, re-exported with a stable `i16` type.
pub(crate) const POLLIN: i16 = libc::POLLIN;
pub(crate) const POLLOUT: i16 = libc::POLLOUT;
pub(crate) const POLLERR: i16 = libc::POLLERR;
pub(crate) const POLLHUP: i16 = libc::POLLHUP;
pub(crate) const POLLNVAL: i16 = libc::POLLNVAL;

/// Create a UDP socket for the given family.
///
/// On Linux `IP_MULTICAST_ALL` is cleared so that a socket bound to a wildcard
/// address only receives the groups it explicitly joined. A kernel without the
/// option leaves the socket usable.
pub(crate) fn create(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    #[cfg(target_os = "linux")]
    if !ipv6 {
        if let Err(e) = super::options::set_int(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_ALL,
            0,
        ) {
            log::debug!("[SYS] IP_MULTICAST_ALL not cleared (non-fatal): {}", e);
        }
    }

    log::trace!("[SYS] created UDP socket fd={} ipv6={}", socket.as_raw_fd(), ipv6);
    Ok(socket)
}

pub(crate) fn bind(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    socket.bind(&SockAddr::from(addr))
}

pub(crate) fn connect(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    socket.connect(&SockAddr::from(addr))
}

/// Effective local address (`getsockname`).
pub(crate) fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket.local_addr()?.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "local address is not an IP address")
    })
}

/// Dissolve the peer binding of a connected datagram socket.
///
/// On Linux the kernel also forgets an auto-assigned local port; the socket is
/// re-bound to the port it had so the local endpoint survives the disconnect.
pub(crate) fn disconnect(socket: &Socket, ipv6: bool) -> io::Result<()> {
    let before = local_addr(socket).ok();
    let unspec = RawAddr::unspecified(ipv6);

    // SAFETY:
    // - the fd is owned by `socket` and open for the duration of the call
    // - `unspec` is a fully initialised AF_UNSPEC address of the reported length
    let ret = unsafe { libc::connect(socket.as_raw_fd(), unspec.as_ptr(), unspec.len()) };
    if let Err(e) = cvt(ret) {
        // BSD-derived stacks reject AF_UNSPEC but still drop the association.
        if cfg!(target_os = "linux") || e.raw_os_error() != Some(libc::EAFNOSUPPORT) {
            return Err(e);
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(prev) = before {
        let now = local_addr(socket)?;
        if now.port() == 0 && prev.port() != 0 {
            let rebind = SocketAddr::new(now.ip(), prev.port());
            log::debug!("[SYS] disconnect cleared local port, re-binding to {}", rebind);
            bind(socket, rebind)?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = before;

    Ok(())
}

/// Toggle `O_NONBLOCK`.
pub(crate) fn configure_blocking(socket: &Socket, blocking: bool) -> io::Result<()> {
    socket.set_nonblocking(!blocking)
}

/// `sendto` on an unconnected socket.
pub(crate) fn send_to(fd: RawFd, buf: &[u8], target: &SocketAddr) -> io::Result<Status<usize>> {
    let raw = RawAddr::from(target);
    // SAFETY:
    // - buf is a valid readable slice of buf.len() bytes
    // - raw holds an initialised sockaddr of raw.len() bytes
    // - fd validity is the caller's responsibility (kept alive by an Arc<Socket>)
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr().cast(),
            buf.len(),
            SEND_FLAGS,
            raw.as_ptr(),
            raw.len(),
        )
    };
    normalize(cvt_size(ret))
}

/// `send` on a connected socket.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<Status<usize>> {
    // SAFETY: buf is a valid readable slice; see send_to for the fd contract.
    let ret = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
    normalize(cvt_size(ret))
}

/// `recvfrom`; a datagram larger than `buf` is truncated by the kernel.
///
/// The sender is `None` when the fd no longer refers to a datagram socket
/// (after pre-close the reserved stream socket reports end-of-file).
pub(crate) fn recv_from(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<Status<(usize, Option<SocketAddr>)>> {
    let mut raw = RawAddr::empty();
    // SAFETY:
    // - buf is a valid writable slice of buf.len() bytes
    // - raw provides sockaddr_storage-sized space and its length in/out param
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            flags,
            raw.as_mut_ptr(),
            raw.len_mut(),
        )
    };
    Ok(normalize(cvt_size(ret))?.map(|n| (n, raw.to_socket_addr())))
}

/// `recv` on a connected socket.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<Status<usize>> {
    // SAFETY: buf is a valid writable slice of buf.len() bytes.
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    normalize(cvt_size(ret))
}

/// Scatter read (`readv`) on a connected socket.
pub(crate) fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<Status<usize>> {
    let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY:
    // - IoSliceMut is ABI compatible with struct iovec on Unix
    // - every slice is a valid writable region for its length
    let ret = unsafe { libc::readv(fd, bufs.as_ptr() as *const libc::iovec, count) };
    normalize(cvt_size(ret))
}

/// Gather write (`writev`) on a connected socket.
pub(crate) fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<Status<usize>> {
    let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY:
    // - IoSlice is ABI compatible with struct iovec on Unix
    // - every slice is a valid readable region for its length
    let ret = unsafe { libc::writev(fd, bufs.as_ptr() as *const libc::iovec, count) };
    normalize(cvt_size(ret))
}

/// Discard every datagram already queued on the socket without blocking.
///
/// Returns the number of datagrams dropped.
pub(crate) fn drain(fd: RawFd) -> io::Result<usize> {
    let mut scratch = [0u8; crate::config::DRAIN_SCRATCH_SIZE];
    let mut dropped = 0;
    loop {
        match recv_from(fd, &mut scratch, libc::MSG_DONTWAIT) {
            Ok(Status::Ready(_)) => dropped += 1,
            Ok(Status::Interrupted) => continue,
            Ok(Status::Unavailable) => return Ok(dropped),
            // ICMP errors queued before the connect are stale too.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Wait for `events` on `fd`.
///
/// `Ready(0)` means the timeout expired. A negative timeout waits forever.
pub(crate) fn poll(fd: RawFd, events: i16, timeout_ms: i32) -> io::Result<Status<i16>> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd on the stack and nfds is 1.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    Ok(normalize(cvt(ret))?.map(|n| if n == 0 { 0 } else { pfd.revents }))
}

/// Process-wide reserved descriptor: one end of a socket pair whose other end
/// is closed. Reads from it return end-of-file and writes fail immediately.
fn reserved_fd() -> io::Result<RawFd> {
    static RESERVED: OnceLock<Result<RawFd, i32>> = OnceLock::new();
    let slot = RESERVED.get_or_init(|| {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid two-element array for socketpair to fill.
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let _ = super::options::set_int(fds[0], libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
        }
        // SAFETY: fds[1] was just returned by socketpair and is owned here.
        unsafe { libc::close(fds[1]) };
        log::debug!("[SYS] reserved pre-close fd={}", fds[0]);
        Ok(fds[0])
    });
    (*slot).map_err(io::Error::from_raw_os_error)
}

/// Replace `fd` with the reserved descriptor so that blocked and future
/// syscalls on it return promptly. The fd number stays allocated until the
/// owning `Socket` is dropped.
pub(crate) fn preclose(fd: RawFd) -> io::Result<()> {
    let reserved = reserved_fd()?;
    loop {
        // SAFETY:
        // - both descriptors are open: `reserved` lives for the whole process and
        //   `fd` is owned by a Socket the caller keeps alive
        // - dup2 atomically closes the old description behind `fd`
        let ret = unsafe { libc::dup2(reserved, fd) };
        match cvt(ret) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
