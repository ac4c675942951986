// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Library constants and socket facade configuration.
//!
//! # Environment Variables
//!
//! `SocketConfig::from_env()` starts from the defaults and applies:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `NIO_UDP_SO_TIMEOUT_MS` | receive timeout in ms (0 = wait forever) |
//! | `NIO_UDP_RCVBUF` | `SO_RCVBUF` in bytes |
//! | `NIO_UDP_SNDBUF` | `SO_SNDBUF` in bytes |
//! | `NIO_UDP_MULTICAST_TTL` | multicast TTL (0-255) |
//! | `NIO_UDP_REUSEADDR` | `1`/`true` to set `SO_REUSEADDR` |
//! | `NIO_UDP_BROADCAST` | `1`/`true` to set `SO_BROADCAST` |
//!
//! Nothing reads the environment unless `from_env` is called.

use std::time::Duration;

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Default multicast TTL (link-local only).
pub const DEFAULT_MULTICAST_TTL: u8 = 1;

/// Largest accepted multicast TTL.
pub const MAX_TTL: i32 = 255;

/// Largest accepted `IP_TOS` / traffic class value.
pub const MAX_TRAFFIC_CLASS: i32 = 255;

/// Scratch size for the datagram drain performed after `connect`.
pub const DRAIN_SCRATCH_SIZE: usize = 128;

/// Configuration applied by `DatagramSocket::with_config`.
///
/// `None` fields leave the OS default untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Receive timeout; `Duration::ZERO` waits forever.
    pub so_timeout: Duration,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub reuse_address: bool,
    pub broadcast: bool,
    pub multicast_ttl: Option<u8>,
    pub traffic_class: Option<u8>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            so_timeout: Duration::ZERO,
            recv_buffer_size: None,
            send_buffer_size: None,
            reuse_address: false,
            broadcast: false,
            multicast_ttl: None,
            traffic_class: None,
        }
    }
}

impl SocketConfig {
    #[must_use]
    pub fn so_timeout(mut self, timeout: Duration) -> Self {
        self.so_timeout = timeout;
        self
    }

    #[must_use]
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    #[must_use]
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    #[must_use]
    pub fn reuse_address(mut self, on: bool) -> Self {
        self.reuse_address = on;
        self
    }

    #[must_use]
    pub fn broadcast(mut self, on: bool) -> Self {
        self.broadcast = on;
        self
    }

    #[must_use]
    pub fn multicast_ttl(mut self, ttl: u8) -> Self {
        self.multicast_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn traffic_class(mut self, tc: u8) -> Self {
        self.traffic_class = Some(tc);
        self
    }

    /// Defaults overridden by `NIO_UDP_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "NIO_UDP_SO_TIMEOUT_MS") {
            config.so_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "NIO_UDP_RCVBUF") {
            config.recv_buffer_size = Some(size);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "NIO_UDP_SNDBUF") {
            config.send_buffer_size = Some(size);
        }
        if let Some(ttl) = parse_var::<u8>(&lookup, "NIO_UDP_MULTICAST_TTL") {
            config.multicast_ttl = Some(ttl);
        }
        if let Some(on) = flag_var(&lookup, "NIO_UDP_REUSEADDR") {
            config.reuse_address = on;
        }
        if let Some(on) = flag_var(&lookup, "NIO_UDP_BROADCAST") {
            config.broadcast = on;
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("[CONFIG] ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn flag_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("[CONFIG] ignoring {}={:?}: expected a boolean", key, raw);
            None
        }
    }
}
