// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Blocking datagram socket driven by a [`DatagramChannel`].
//!
//! The receive timeout lives here: with a non-zero `SO_TIMEOUT` the socket
//! alternates between a non-waiting receive and `poll(POLLIN, remaining)`
//! until a datagram arrives or the deadline passes. The channel stays in
//! blocking mode throughout, so a sender on another thread is never held up
//! by a parked receiver.

use crate::channel::select::POLLIN;
use crate::channel::{DatagramChannel, ProtocolFamily};
use crate::config::SocketConfig;
use crate::error::{Error, Result};
use crate::packet::DatagramPacket;
use crate::sys::options::{OptionValue, SocketOptionId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Classical blocking UDP socket.
///
/// Channel errors are reported the way a plain socket would: a closed channel
/// becomes `Socket("socket is closed")`, other OS errors become
/// [`Error::Socket`] with the OS message.
///
/// # Example
///
/// ```rust,no_run
/// use nio_udp::{DatagramPacket, DatagramSocket};
/// use std::time::Duration;
///
/// let socket = DatagramSocket::bind_to("127.0.0.1:0".parse().unwrap())?;
/// socket.set_so_timeout(Duration::from_millis(250))?;
///
/// let mut packet = DatagramPacket::with_capacity(1500);
/// match socket.receive(&mut packet) {
///     Ok(()) => println!("{:?} from {:?}", packet.payload(), packet.socket_address()),
///     Err(nio_udp::Error::SocketTimeout) => println!("nothing within 250ms"),
///     Err(e) => return Err(e),
/// }
/// # Ok::<(), nio_udp::Error>(())
/// ```
#[derive(Debug)]
pub struct DatagramSocket {
    channel: DatagramChannel,
}

/// Map channel errors onto the socket API's error surface.
pub(crate) fn translate(err: Error) -> Error {
    match err {
        Error::ClosedChannel | Error::AsynchronousClose => Error::Socket("socket is closed".into()),
        Error::AlreadyBound => Error::Socket("already bound".into()),
        Error::Io(e) => Error::Socket(e.to_string()),
        other => other,
    }
}

fn family_of(addr: Option<SocketAddr>) -> ProtocolFamily {
    match addr {
        Some(SocketAddr::V6(_)) => ProtocolFamily::Inet6,
        _ => ProtocolFamily::Inet,
    }
}

impl DatagramSocket {
    /// Socket bound to an ephemeral port on the wildcard address.
    pub fn new() -> Result<Self> {
        Self::with_config(None, &SocketConfig::default())
    }

    /// Socket that is not bound yet.
    pub fn unbound() -> Result<Self> {
        DatagramChannel::open()
            .map(Self::from_channel)
            .map_err(translate)
    }

    /// Socket bound to `addr`.
    pub fn bind_to(addr: SocketAddr) -> Result<Self> {
        Self::with_config(Some(addr), &SocketConfig::default())
    }

    /// Socket with `config` applied before binding to `addr` (or an
    /// ephemeral wildcard address).
    pub fn with_config(addr: Option<SocketAddr>, config: &SocketConfig) -> Result<Self> {
        let channel = DatagramChannel::open_with_family(family_of(addr)).map_err(translate)?;
        let socket = Self::from_channel(channel);
        socket.apply(config)?;
        socket.bind(addr)?;
        Ok(socket)
    }

    /// Wrap an existing channel. Send and receive need it in blocking mode.
    pub fn from_channel(channel: DatagramChannel) -> Self {
        Self { channel }
    }

    fn apply(&self, config: &SocketConfig) -> Result<()> {
        self.set_so_timeout(config.so_timeout)?;
        if let Some(size) = config.recv_buffer_size {
            self.set_receive_buffer_size(size)?;
        }
        if let Some(size) = config.send_buffer_size {
            self.set_send_buffer_size(size)?;
        }
        if config.reuse_address {
            self.set_reuse_address(true)?;
        }
        if config.broadcast {
            self.set_broadcast(true)?;
        }
        if let Some(ttl) = config.multicast_ttl {
            self.set_int(SocketOptionId::IpMulticastTtl, i32::from(ttl))?;
        }
        if let Some(tc) = config.traffic_class {
            self.set_traffic_class(i32::from(tc))?;
        }
        Ok(())
    }

    /// Underlying channel.
    pub fn channel(&self) -> &DatagramChannel {
        &self.channel
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    pub fn bind(&self, addr: Option<SocketAddr>) -> Result<()> {
        self.channel.bind(addr).map_err(translate)
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.channel.connect(addr).map_err(translate)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.channel.disconnect().map_err(translate)
    }

    /// Local address; `None` when unbound or closed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.local_addr().ok().flatten()
    }

    /// Connected peer; `None` when unconnected or closed.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr().ok().flatten()
    }

    pub fn is_bound(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Send `packet`'s payload to its address.
    ///
    /// On a connected socket a packet without an address goes to the peer and
    /// is stamped with the peer address.
    pub fn send(&self, packet: &mut DatagramPacket) -> Result<()> {
        self.ensure_blocking()?;
        self.send_blocking(packet).map_err(translate)
    }

    fn ensure_blocking(&self) -> Result<()> {
        let _mode = self.channel.blocking_lock();
        if self.channel.is_open() && !self.channel.is_blocking() {
            return Err(Error::IllegalBlockingMode);
        }
        Ok(())
    }

    fn send_blocking(&self, packet: &mut DatagramPacket) -> Result<()> {
        match packet.socket_address() {
            Some(target) => {
                self.channel.send(packet.payload(), Some(target))?;
            }
            None => {
                let peer = self
                    .channel
                    .remote_addr()?
                    .ok_or_else(|| Error::illegal_argument("address not set"))?;
                packet.set_socket_address(peer);
                self.channel.write(packet.payload())?;
            }
        }
        Ok(())
    }

    /// Receive one datagram into `packet`, waiting at most `so_timeout`.
    ///
    /// On success the packet's length and address describe the datagram.
    /// When the timeout expires [`Error::SocketTimeout`] is returned and the
    /// socket stays usable.
    pub fn receive(&self, packet: &mut DatagramPacket) -> Result<()> {
        self.ensure_blocking()?;
        let timeout = self.so_timeout()?;
        let received = if timeout.is_zero() {
            self.receive_blocking(packet.receive_window())
        } else {
            self.receive_timed(packet.receive_window(), timeout)
        };
        let (n, from) = received.map_err(translate)?;
        packet.set_received(n, from);
        Ok(())
    }

    fn receive_blocking(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            if let Some(received) = self.channel.receive(buf)? {
                return Ok(received);
            }
        }
    }

    fn receive_timed(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(received) = self.channel.try_receive(buf)? {
                return Ok(received);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::trace!("[ADAPTOR] receive timed out after {:?}", timeout);
                return Err(Error::SocketTimeout);
            }
            let ms = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX).max(1);
            self.channel.poll(POLLIN, ms)?;
        }
    }

    pub fn close(&self) -> Result<()> {
        self.channel.close().map_err(translate)
    }

    pub fn is_closed(&self) -> bool {
        !self.channel.is_open()
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Receive timeout; `Duration::ZERO` waits forever. Sub-millisecond
    /// timeouts round up to 1ms.
    pub fn set_so_timeout(&self, timeout: Duration) -> Result<()> {
        let mut ms = i32::try_from(timeout.as_millis())
            .map_err(|_| Error::illegal_argument("timeout too large"))?;
        if ms == 0 && !timeout.is_zero() {
            ms = 1;
        }
        self.set_int(SocketOptionId::SoTimeout, ms)
    }

    pub fn so_timeout(&self) -> Result<Duration> {
        let ms = self.get_int(SocketOptionId::SoTimeout)?;
        Ok(Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> Result<()> {
        self.set_int(SocketOptionId::SoRcvBuf, buffer_size(size)?)
    }

    pub fn receive_buffer_size(&self) -> Result<usize> {
        Ok(usize::try_from(self.get_int(SocketOptionId::SoRcvBuf)?).unwrap_or(0))
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.set_int(SocketOptionId::SoSndBuf, buffer_size(size)?)
    }

    pub fn send_buffer_size(&self) -> Result<usize> {
        Ok(usize::try_from(self.get_int(SocketOptionId::SoSndBuf)?).unwrap_or(0))
    }

    pub fn set_reuse_address(&self, on: bool) -> Result<()> {
        self.set_bool(SocketOptionId::SoReuseAddr, on)
    }

    pub fn reuse_address(&self) -> Result<bool> {
        self.get_bool(SocketOptionId::SoReuseAddr)
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.set_bool(SocketOptionId::SoBroadcast, on)
    }

    pub fn broadcast(&self) -> Result<bool> {
        self.get_bool(SocketOptionId::SoBroadcast)
    }

    /// `IP_TOS` (or the IPv6 traffic class), 0-255.
    pub fn set_traffic_class(&self, tc: i32) -> Result<()> {
        self.set_int(SocketOptionId::IpTos, tc)
    }

    pub fn traffic_class(&self) -> Result<i32> {
        self.get_int(SocketOptionId::IpTos)
    }

    pub(crate) fn set_option(&self, id: SocketOptionId, value: OptionValue) -> Result<()> {
        self.channel.set_option(id, value).map_err(translate)
    }

    pub(crate) fn get_option(&self, id: SocketOptionId) -> Result<OptionValue> {
        self.channel.get_option(id).map_err(translate)
    }

    pub(crate) fn set_int(&self, id: SocketOptionId, value: i32) -> Result<()> {
        self.set_option(id, OptionValue::Int(value))
    }

    pub(crate) fn get_int(&self, id: SocketOptionId) -> Result<i32> {
        self.get_option(id)?
            .as_int()
            .ok_or_else(|| Error::Socket(format!("{} is not an integer option", id)))
    }

    pub(crate) fn set_bool(&self, id: SocketOptionId, value: bool) -> Result<()> {
        self.set_option(id, OptionValue::Bool(value))
    }

    pub(crate) fn get_bool(&self, id: SocketOptionId) -> Result<bool> {
        self.get_option(id)?
            .as_bool()
            .ok_or_else(|| Error::Socket(format!("{} is not a boolean option", id)))
    }
}

fn buffer_size(size: usize) -> Result<i32> {
    i32::try_from(size).map_err(|_| Error::illegal_argument("buffer size too large"))
}
