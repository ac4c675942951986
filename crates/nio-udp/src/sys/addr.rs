// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Conversion between `std::net::SocketAddr` and raw `sockaddr` storage.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Raw socket address ready to be passed to `sendto`/`connect`.
pub(crate) struct RawAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawAddr {
    /// Empty storage for `recvfrom`/`getsockname` to fill in.
    pub(crate) fn empty() -> Self {
        Self {
            // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// An `AF_UNSPEC` address sized for the given family, used to dissolve a
    /// UDP peer binding.
    pub(crate) fn unspecified(ipv6: bool) -> Self {
        let mut raw = Self::empty();
        raw.storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
        raw.len = if ipv6 {
            mem::size_of::<libc::sockaddr_in6>()
        } else {
            mem::size_of::<libc::sockaddr_in>()
        } as libc::socklen_t;
        raw
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        (&self.storage as *const libc::sockaddr_storage).cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        (&mut self.storage as *mut libc::sockaddr_storage).cast()
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    /// Decode the storage; `None` for non-IP families or a zero length
    /// (stream sockets report no peer address).
    pub(crate) fn to_socket_addr(&self) -> Option<SocketAddr> {
        if (self.len as usize) < mem::size_of::<libc::sa_family_t>() {
            return None;
        }
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // SAFETY:
                // - ss_family == AF_INET guarantees the storage holds a sockaddr_in
                // - sockaddr_storage is large enough and suitably aligned for sockaddr_in
                let sin: &libc::sockaddr_in =
                    unsafe { &*(&self.storage as *const libc::sockaddr_storage).cast() };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                // SAFETY:
                // - ss_family == AF_INET6 guarantees the storage holds a sockaddr_in6
                // - sockaddr_storage is large enough and suitably aligned for sockaddr_in6
                let sin6: &libc::sockaddr_in6 =
                    unsafe { &*(&self.storage as *const libc::sockaddr_storage).cast() };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

impl From<&SocketAddr> for RawAddr {
    fn from(addr: &SocketAddr) -> Self {
        let mut raw = Self::empty();
        match addr {
            SocketAddr::V4(v4) => {
                // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                // SAFETY:
                // - the storage is large enough and aligned for sockaddr_in
                // - sin is fully initialised and copied by value
                unsafe {
                    std::ptr::write(
                        (&mut raw.storage as *mut libc::sockaddr_storage).cast(),
                        sin,
                    );
                }
                raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                // SAFETY: sockaddr_in6 is plain old data; all-zero is a valid value.
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                // SAFETY:
                // - the storage is large enough and aligned for sockaddr_in6
                // - sin6 is fully initialised and copied by value
                unsafe {
                    std::ptr::write(
                        (&mut raw.storage as *mut libc::sockaddr_storage).cast(),
                        sin6,
                    );
                }
                raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        raw
    }
}

/// IPv4 address in the network-order `u32` form used by `ip_mreq` and friends.
pub(crate) fn in_addr(addr: Ipv4Addr) -> libc::in_addr {
    libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    }
}
