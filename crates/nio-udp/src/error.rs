// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Error types for channel, membership and socket-facade operations.

use std::io;

/// Errors returned by `nio-udp` operations.
///
/// The variants mirror the failure classes of a selectable datagram channel:
/// lifecycle errors (closed, already bound, not connected), argument and state
/// validation, kernel capability gaps, and everything else from the OS.
///
/// # Example
///
/// ```rust,no_run
/// use nio_udp::{DatagramChannel, Error};
///
/// let channel = DatagramChannel::open()?;
/// channel.close()?;
///
/// match channel.receive(&mut [0u8; 64]) {
///     Err(Error::ClosedChannel) => println!("closed, as expected"),
///     other => println!("unexpected: {:?}", other),
/// }
/// # Ok::<(), nio_udp::Error>(())
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Operation attempted on a closed channel.
    ClosedChannel,
    /// Another thread closed the channel while this operation was in progress.
    AsynchronousClose,
    /// `bind` on a channel that already has a local address.
    AlreadyBound,
    /// Byte-channel `read`/`write` on a channel that is not connected.
    NotYetConnected,

    // ========================================================================
    // Validation
    // ========================================================================
    /// Operation is not legal in the current state (membership conflicts,
    /// invalid keys, connect on a connected channel).
    IllegalState(String),
    /// Argument rejected (bad source address, ttl out of range, peer mismatch).
    IllegalArgument(String),
    /// Operation requires a different blocking mode, or a registered channel
    /// was asked to switch to blocking mode.
    IllegalBlockingMode,
    /// Address family does not match the channel's protocol family.
    UnsupportedAddressType,

    // ========================================================================
    // Kernel / network
    // ========================================================================
    /// Feature not available on this kernel (source-specific multicast).
    Unsupported(String),
    /// ICMP port unreachable reported on a connected socket.
    PortUnreachable,
    /// Blocking-socket receive timed out.
    SocketTimeout,
    /// Error surfaced by the blocking socket facades.
    Socket(String),
    /// Any other I/O error from the operating system.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Lifecycle
            Error::ClosedChannel => write!(f, "Channel is closed"),
            Error::AsynchronousClose => write!(f, "Channel closed by another thread"),
            Error::AlreadyBound => write!(f, "Already bound"),
            Error::NotYetConnected => write!(f, "Not yet connected"),
            // Validation
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            Error::IllegalBlockingMode => write!(f, "Illegal blocking mode"),
            Error::UnsupportedAddressType => write!(f, "Unsupported address type"),
            // Kernel / network
            Error::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
            Error::PortUnreachable => write!(f, "ICMP port unreachable"),
            Error::SocketTimeout => write!(f, "Receive timed out"),
            Error::Socket(msg) => write!(f, "Socket error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    /// Whether the error reports that the channel is (or became) closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ClosedChannel | Error::AsynchronousClose)
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn illegal_argument(msg: impl Into<String>) -> Self {
        Error::IllegalArgument(msg.into())
    }
}

/// Convenient alias for API results using the crate `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
