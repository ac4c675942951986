// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! # nio-udp - selectable UDP channels with IPv4 multicast
//!
//! A UDP endpoint usable in blocking mode or registered with a `mio`
//! selector, with IPv4 multicast membership (any-source and source-specific,
//! plus per-source blocking), asynchronous close, and classical blocking
//! socket facades on top.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nio_udp::{DatagramChannel, NetworkInterface, OptionValue, SocketOptionId};
//!
//! fn main() -> nio_udp::Result<()> {
//!     let channel = DatagramChannel::open()?;
//!     channel.set_option(SocketOptionId::SoReuseAddr, OptionValue::Bool(true))?;
//!     channel.bind(Some("0.0.0.0:45004".parse().unwrap()))?;
//!
//!     let iface = NetworkInterface::default_multicast()?.expect("multicast interface");
//!     let key = channel.join("225.4.5.6".parse().unwrap(), &iface)?;
//!
//!     let mut buf = [0u8; 1500];
//!     if let Some((n, from)) = channel.receive(&mut buf)? {
//!         println!("{} bytes from {}", n, from);
//!     }
//!     key.drop_membership()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |  MulticastSocket  ->  DatagramSocket (blocking, SO_TIMEOUT)   |
//! +---------------------------------------------------------------+
//! |  DatagramChannel: state machine, locks, send/receive loops    |
//! |  MembershipKey / registry        Ops / SelectionKey (mio)     |
//! +---------------------------------------------------------------+
//! |  sys: socket primitives, options, multicast, thread signal    |
//! +---------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`DatagramChannel`] | Selectable UDP channel, the core of the crate |
//! | [`MembershipKey`] | Handle to one multicast subscription |
//! | [`SelectionKey`] | Interest and ready sets of a selector registration |
//! | [`DatagramSocket`] | Blocking socket with receive timeout |
//! | [`MulticastSocket`] | Blocking socket with group management |
//! | [`DatagramPacket`] | Buffer window plus address for the socket facades |
//!
//! ## Platform
//!
//! Unix only. Asynchronous close interrupts blocked threads with a realtime
//! signal; the library installs a no-op handler for it on first use.

pub mod channel;
pub mod config;
mod error;
pub mod netif;
pub mod packet;
pub mod socket;
mod sys;

pub use channel::membership::MembershipKey;
pub use channel::select::{Ops, SelectionKey};
pub use channel::{DatagramChannel, ProtocolFamily};
pub use config::SocketConfig;
pub use error::{Error, Result};
pub use netif::NetworkInterface;
pub use packet::DatagramPacket;
pub use socket::{DatagramSocket, MulticastSocket};
pub use sys::options::{MembershipRequest, OptionValue, SocketOptionId, ValueKind};
