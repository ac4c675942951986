// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Readiness translation between selection keys and poll events.
//!
//! The selector itself is external (`mio`). A channel registers its fd with a
//! `mio::Registry`, and the application feeds the events it gets back through
//! [`revents_from_event`] and the `translate_*` hooks to maintain a
//! [`SelectionKey`]'s ready set.
//!
//! # Example
//!
//! ```rust,no_run
//! use mio::{Events, Poll, Token};
//! use nio_udp::{DatagramChannel, Ops};
//! use nio_udp::channel::select::revents_from_event;
//!
//! let mut poll = Poll::new()?;
//! let channel = DatagramChannel::open()?;
//! channel.bind(Some("127.0.0.1:0".parse().unwrap()))?;
//! channel.configure_blocking(false)?;
//! let key = channel.register(poll.registry(), Token(7), Ops::READ)?;
//!
//! let mut events = Events::with_capacity(8);
//! poll.poll(&mut events, None)?;
//! for event in events.iter() {
//!     if channel.translate_and_set_ready_ops(revents_from_event(event), &key) {
//!         let mut buf = [0u8; 1500];
//!         while let Some((n, from)) = channel.receive(&mut buf)? {
//!             println!("{} bytes from {}", n, from);
//!         }
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::sys::socket;
use mio::{Interest, Token};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Poll event bits accepted by [`DatagramChannel::poll`](super::DatagramChannel::poll)
/// and produced by [`revents_from_event`].
pub const POLLIN: i16 = socket::POLLIN;
pub const POLLOUT: i16 = socket::POLLOUT;
pub const POLLERR: i16 = socket::POLLERR;
pub const POLLHUP: i16 = socket::POLLHUP;
pub const POLLNVAL: i16 = socket::POLLNVAL;

/// Set of selection operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const READ: Ops = Ops(1);
    pub const WRITE: Ops = Ops(1 << 2);
    /// Connect completion; maps to `POLLIN` for datagram channels.
    pub const CONNECT: Ops = Ops(1 << 3);
    pub const ACCEPT: Ops = Ops(1 << 4);

    pub const fn empty() -> Ops {
        Ops(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Ops {
        Ops(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every op in `other` is also in `self`.
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share any op.
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Ops {
    type Output = Ops;
    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;
    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl Not for Ops {
    type Output = Ops;
    fn not(self) -> Ops {
        Ops(!self.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
            (Ops::CONNECT, "CONNECT"),
            (Ops::ACCEPT, "ACCEPT"),
        ];
        let mut first = true;
        for (op, name) in names {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// Registration of one channel with one selector.
///
/// Interest and ready sets are atomics so that the selecting thread and the
/// application can update them without further locking.
#[derive(Debug)]
pub struct SelectionKey {
    token: Token,
    interest: AtomicU8,
    ready: AtomicU8,
    valid: AtomicBool,
}

impl SelectionKey {
    pub fn new(token: Token, interest: Ops) -> Self {
        Self {
            token,
            interest: AtomicU8::new(interest.bits()),
            ready: AtomicU8::new(0),
            valid: AtomicBool::new(true),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest_ops(&self) -> Ops {
        Ops(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_interest_ops(&self, ops: Ops) {
        self.interest.store(ops.bits(), Ordering::Release);
    }

    pub fn ready_ops(&self) -> Ops {
        Ops(self.ready.load(Ordering::Acquire))
    }

    /// Overwrite the ready set.
    pub fn set_ready_ops(&self, ops: Ops) {
        self.ready.store(ops.bits(), Ordering::Release);
    }

    pub fn is_readable(&self) -> bool {
        self.ready_ops().contains(Ops::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.ready_ops().contains(Ops::WRITE)
    }

    /// False once the key has been deregistered.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the key cancelled; returns whether it was valid before.
    pub(crate) fn cancel(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

/// Poll events to wait for, given a set of interest ops.
pub fn translate_interest_ops(ops: Ops) -> i16 {
    let mut events = 0;
    if ops.contains(Ops::READ) {
        events |= POLLIN;
    }
    if ops.contains(Ops::WRITE) {
        events |= POLLOUT;
    }
    if ops.contains(Ops::CONNECT) {
        events |= POLLIN;
    }
    events
}

/// `mio` interest for a set of ops; `None` when the set maps to no event.
pub(crate) fn interest_for(ops: Ops) -> Option<Interest> {
    let events = translate_interest_ops(ops);
    match (events & POLLIN != 0, events & POLLOUT != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Fold `revents` into `key`'s ready set, starting from `initial`.
///
/// Returns true when an op became ready that was not ready before.
pub fn translate_ready_ops(revents: i16, initial: Ops, key: &SelectionKey) -> bool {
    let interest = key.interest_ops();
    let old = key.ready_ops();
    let mut new = initial;

    if revents & POLLNVAL != 0 {
        // Only seen while the channel is being pre-closed.
        return false;
    }

    if revents & (POLLERR | POLLHUP) != 0 {
        new = interest;
        key.set_ready_ops(new);
        return !(new & !old).is_empty();
    }

    if revents & POLLIN != 0 && interest.contains(Ops::READ) {
        new |= Ops::READ;
    }
    if revents & POLLOUT != 0 && interest.contains(Ops::WRITE) {
        new |= Ops::WRITE;
    }

    key.set_ready_ops(new);
    !(new & !old).is_empty()
}

/// Replace the ready set with the ops signalled by `revents`.
pub fn translate_and_set_ready_ops(revents: i16, key: &SelectionKey) -> bool {
    translate_ready_ops(revents, Ops::empty(), key)
}

/// Add the ops signalled by `revents` to the current ready set.
pub fn translate_and_update_ready_ops(revents: i16, key: &SelectionKey) -> bool {
    translate_ready_ops(revents, key.ready_ops(), key)
}

/// Poll-style event bits for a `mio` event.
pub fn revents_from_event(event: &mio::event::Event) -> i16 {
    let mut revents = 0;
    if event.is_readable() {
        revents |= POLLIN;
    }
    if event.is_writable() {
        revents |= POLLOUT;
    }
    if event.is_error() {
        revents |= POLLERR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        revents |= POLLHUP;
    }
    revents
}
