// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! IPv4 group membership and source filtering.
//!
//! Any-source joins go through `socket2`. Source-specific joins and source
//! blocking use `ip_mreq_source`, which only Linux exposes with a stable
//! layout; elsewhere those calls report [`Status::Unavailable`].

use super::Status;
use socket2::Socket;
use std::io;
use std::net::Ipv4Addr;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod source {
    use super::super::{addr::in_addr, cvt};
    use std::io;
    use std::net::Ipv4Addr;
    use std::os::unix::io::RawFd;

    // <linux/in.h>
    pub(super) const IP_UNBLOCK_SOURCE: libc::c_int = 37;
    pub(super) const IP_BLOCK_SOURCE: libc::c_int = 38;
    pub(super) const IP_ADD_SOURCE_MEMBERSHIP: libc::c_int = 39;
    pub(super) const IP_DROP_SOURCE_MEMBERSHIP: libc::c_int = 40;

    #[repr(C)]
    struct IpMreqSource {
        imr_multiaddr: libc::in_addr,
        imr_interface: libc::in_addr,
        imr_sourceaddr: libc::in_addr,
    }

    pub(super) fn setsockopt(
        fd: RawFd,
        name: libc::c_int,
        group: Ipv4Addr,
        iface: Ipv4Addr,
        source: Ipv4Addr,
    ) -> io::Result<()> {
        let mreq = IpMreqSource {
            imr_multiaddr: in_addr(group),
            imr_interface: in_addr(iface),
            imr_sourceaddr: in_addr(source),
        };
        // SAFETY:
        // - mreq is a repr(C) struct matching the kernel's ip_mreq_source
        // - the length passed is exactly size_of::<IpMreqSource>()
        // - setsockopt only reads the struct
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                name,
                &mreq as *const IpMreqSource as *const libc::c_void,
                std::mem::size_of::<IpMreqSource>() as libc::socklen_t,
            )
        };
        cvt(ret).map(|_| ())
    }
}

/// Kernel lacks the requested capability.
fn unsupported_errno(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOPROTOOPT) | Some(libc::EOPNOTSUPP)
    )
}

fn classify(result: io::Result<()>) -> io::Result<Status<()>> {
    match result {
        Ok(()) => Ok(Status::Ready(())),
        Err(e) if unsupported_errno(&e) => Ok(Status::Unavailable),
        Err(e) => Err(e),
    }
}

/// Join (`join == true`) or leave an IPv4 group on the interface identified by
/// `iface`, optionally restricted to a single `source`.
pub(crate) fn join_leave4(
    socket: &Socket,
    join: bool,
    group: Ipv4Addr,
    iface: Ipv4Addr,
    source: Option<Ipv4Addr>,
) -> io::Result<Status<()>> {
    let result = match source {
        None if join => socket.join_multicast_v4(&group, &iface),
        None => socket.leave_multicast_v4(&group, &iface),
        Some(src) => return source_specific(socket, join, group, iface, src),
    };
    log::trace!(
        "[MCAST] {} {} on {} -> {:?}",
        if join { "join" } else { "leave" },
        group,
        iface,
        result.as_ref().map_err(|e| e.kind())
    );
    classify(result)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn source_specific(
    socket: &Socket,
    join: bool,
    group: Ipv4Addr,
    iface: Ipv4Addr,
    src: Ipv4Addr,
) -> io::Result<Status<()>> {
    use std::os::unix::io::AsRawFd;
    let name = if join {
        source::IP_ADD_SOURCE_MEMBERSHIP
    } else {
        source::IP_DROP_SOURCE_MEMBERSHIP
    };
    classify(source::setsockopt(socket.as_raw_fd(), name, group, iface, src))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn source_specific(
    _socket: &Socket,
    _join: bool,
    _group: Ipv4Addr,
    _iface: Ipv4Addr,
    _src: Ipv4Addr,
) -> io::Result<Status<()>> {
    Ok(Status::Unavailable)
}

/// Block (`block == true`) or unblock datagrams from `source` on an
/// any-source membership.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn block_unblock4(
    socket: &Socket,
    block: bool,
    group: Ipv4Addr,
    iface: Ipv4Addr,
    source: Ipv4Addr,
) -> io::Result<Status<()>> {
    use std::os::unix::io::AsRawFd;
    let name = if block {
        source::IP_BLOCK_SOURCE
    } else {
        source::IP_UNBLOCK_SOURCE
    };
    classify(source::setsockopt(socket.as_raw_fd(), name, group, iface, source))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn block_unblock4(
    _socket: &Socket,
    _block: bool,
    _group: Ipv4Addr,
    _iface: Ipv4Addr,
    _source: Ipv4Addr,
) -> io::Result<Status<()>> {
    Ok(Status::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_maps_missing_capability() {
        let enoprotoopt = Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT));
        assert_eq!(classify(enoprotoopt).expect("classify"), Status::Unavailable);

        let eperm = Err(io::Error::from_raw_os_error(libc::EPERM));
        assert!(classify(eperm).is_err());
    }

    #[test]
    fn test_join_leave_loopback() {
        let socket = crate::sys::socket::create(false).expect("create");
        let group = Ipv4Addr::new(239, 255, 77, 1);
        let lo = Ipv4Addr::LOCALHOST;
        match join_leave4(&socket, true, group, lo, None) {
            Ok(Status::Ready(())) => {}
            other => {
                eprintln!("loopback multicast unavailable, skipping: {:?}", other);
                return;
            }
        }
        assert_eq!(
            join_leave4(&socket, false, group, lo, None).expect("leave"),
            Status::Ready(())
        );
    }

    #[test]
    fn test_leave_without_join_fails() {
        let socket = crate::sys::socket::create(false).expect("create");
        let group = Ipv4Addr::new(239, 255, 77, 2);
        assert!(join_leave4(&socket, false, group, Ipv4Addr::LOCALHOST, None).is_err());
    }
}
