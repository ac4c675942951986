// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Socket primitives: thin wrappers over the OS socket API.
//!
//! Everything `unsafe` in the crate lives below this module. The channel core
//! only sees safe functions returning [`Status`] or `io::Error`.
//!
//! # Modules
//!
//! - `addr` - `SocketAddr` <-> `sockaddr` conversion
//! - `socket` - create/bind/connect/send/receive/poll/pre-close
//! - `options` - socket option identifiers and their get/set pairs
//! - `multicast` - IPv4 join/leave and source block/unblock
//! - `thread` - native thread identity and interrupt signal

pub(crate) mod addr;
pub(crate) mod multicast;
pub mod options;
pub(crate) mod socket;
pub(crate) mod thread;

use std::io;

/// Outcome of a primitive that may not complete.
///
/// Errors other than "would block" and "interrupted" are reported through the
/// surrounding `io::Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status<T> {
    /// The call completed with a value.
    Ready(T),
    /// Nothing available (EAGAIN/EWOULDBLOCK), or the kernel lacks the
    /// requested capability (multicast source filtering).
    Unavailable,
    /// The syscall was interrupted by a signal (EINTR).
    Interrupted,
}

impl<T> Status<T> {
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Status<U> {
        match self {
            Status::Ready(v) => Status::Ready(f(v)),
            Status::Unavailable => Status::Unavailable,
            Status::Interrupted => Status::Interrupted,
        }
    }
}

/// Fold EAGAIN and EINTR into [`Status`]; every other error stays an error.
pub(crate) fn normalize<T>(result: io::Result<T>) -> io::Result<Status<T>> {
    match result {
        Ok(v) => Ok(Status::Ready(v)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Status::Unavailable),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Status::Interrupted),
        Err(e) => Err(e),
    }
}

/// Convert a `-1`-on-error libc return into an `io::Result`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Same as [`cvt`] for `ssize_t` returning calls.
pub(crate) fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}
