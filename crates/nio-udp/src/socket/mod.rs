// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Blocking socket facades over [`DatagramChannel`](crate::DatagramChannel).

mod adaptor;
mod multicast;

pub use adaptor::DatagramSocket;
pub use multicast::MulticastSocket;
