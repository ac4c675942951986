// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Multicast socket facade.

use super::adaptor::{translate, DatagramSocket};
use crate::channel::membership::MembershipKey;
use crate::config::{SocketConfig, DEFAULT_MULTICAST_TTL, MAX_TTL};
use crate::error::{Error, Result};
use crate::netif::NetworkInterface;
use crate::packet::DatagramPacket;
use crate::sys::options::{OptionValue, SocketOptionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// IPv4 multicast socket: a [`DatagramSocket`] bound with `SO_REUSEADDR`
/// plus group membership by address and interface.
///
/// # Example
///
/// ```rust,no_run
/// use nio_udp::{DatagramPacket, MulticastSocket};
///
/// let socket = MulticastSocket::bind_port(45004)?;
/// socket.join_group("239.255.0.1".parse().unwrap())?;
///
/// let mut packet = DatagramPacket::with_capacity(1500);
/// socket.receive(&mut packet)?;
/// socket.leave_group("239.255.0.1".parse().unwrap())?;
/// # Ok::<(), nio_udp::Error>(())
/// ```
#[derive(Debug)]
pub struct MulticastSocket {
    socket: DatagramSocket,
    state: Mutex<McastState>,
}

#[derive(Debug, Default)]
struct McastState {
    /// (group, interface name) -> key
    memberships: HashMap<(Ipv4Addr, String), MembershipKey>,
    /// Resolved on first interface-less join/leave.
    default_iface: Option<NetworkInterface>,
    /// Last address given to `set_interface`.
    interface_addr: Option<Ipv4Addr>,
}

fn group_v4(group: IpAddr) -> Result<Ipv4Addr> {
    match group {
        IpAddr::V4(g) if g.is_multicast() => Ok(g),
        _ => Err(Error::illegal_argument(format!("{} is not an IPv4 multicast address", group))),
    }
}

impl MulticastSocket {
    /// Socket bound to an ephemeral port on the IPv4 wildcard address.
    pub fn new() -> Result<Self> {
        Self::bind_port(0)
    }

    /// Socket bound to `port` on the IPv4 wildcard address.
    pub fn bind_port(port: u16) -> Result<Self> {
        Self::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Socket bound to `addr`, which must be IPv4.
    pub fn bind_to(addr: SocketAddr) -> Result<Self> {
        if addr.is_ipv6() {
            return Err(Error::UnsupportedAddressType);
        }
        let config = SocketConfig::default()
            .reuse_address(true)
            .multicast_ttl(DEFAULT_MULTICAST_TTL);
        let socket = DatagramSocket::with_config(Some(addr), &config)?;
        log::debug!("[ADAPTOR] multicast socket bound to {:?}", socket.local_addr());
        Ok(Self {
            socket,
            state: Mutex::new(McastState::default()),
        })
    }

    /// Plain datagram view of this socket.
    pub fn as_datagram_socket(&self) -> &DatagramSocket {
        &self.socket
    }

    // ========================================================================
    // TTL
    // ========================================================================

    /// Multicast TTL, 0-255. 0 keeps datagrams on this host.
    pub fn set_time_to_live(&self, ttl: i32) -> Result<()> {
        if !(0..=MAX_TTL).contains(&ttl) {
            return Err(Error::illegal_argument(format!("ttl {} out of range", ttl)));
        }
        self.socket.set_int(SocketOptionId::IpMulticastTtl, ttl)
    }

    pub fn time_to_live(&self) -> Result<i32> {
        self.socket.get_int(SocketOptionId::IpMulticastTtl)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Join `group` on the default multicast interface.
    pub fn join_group(&self, group: IpAddr) -> Result<()> {
        let iface = self.default_interface()?;
        self.join_group_on(group, &iface)
    }

    /// Leave `group` on the default multicast interface.
    pub fn leave_group(&self, group: IpAddr) -> Result<()> {
        let iface = self.default_interface()?;
        self.leave_group_on(group, &iface)
    }

    pub fn join_group_on(&self, group: IpAddr, interface: &NetworkInterface) -> Result<()> {
        let group4 = group_v4(group)?;
        let mut st = self.state.lock();
        let id = (group4, interface.name().to_string());
        if st.memberships.get(&id).map_or(false, MembershipKey::is_valid) {
            return Err(Error::Socket("already a member of group".into()));
        }
        let key = self
            .socket
            .channel()
            .join(group, interface)
            .map_err(translate)?;
        log::debug!("[ADAPTOR] joined {}", key);
        st.memberships.insert(id, key);
        Ok(())
    }

    pub fn leave_group_on(&self, group: IpAddr, interface: &NetworkInterface) -> Result<()> {
        let group4 = group_v4(group)?;
        let mut st = self.state.lock();
        let key = st
            .memberships
            .remove(&(group4, interface.name().to_string()))
            .filter(MembershipKey::is_valid)
            .ok_or_else(|| Error::Socket("not a member".into()))?;
        log::debug!("[ADAPTOR] leaving {}", key);
        key.drop_membership().map_err(translate)
    }

    fn default_interface(&self) -> Result<NetworkInterface> {
        let mut st = self.state.lock();
        if let Some(iface) = &st.default_iface {
            return Ok(iface.clone());
        }
        let iface = NetworkInterface::default_multicast()
            .map_err(|e| translate(Error::Io(e)))?
            .ok_or_else(|| Error::Socket("no multicast-capable network interface".into()))?;
        log::debug!("[ADAPTOR] default multicast interface {}", iface);
        st.default_iface = Some(iface.clone());
        Ok(iface)
    }

    // ========================================================================
    // Outgoing interface and loopback
    // ========================================================================

    /// Send multicast datagrams through the interface owning `addr`.
    pub fn set_interface(&self, addr: Ipv4Addr) -> Result<()> {
        let mut st = self.state.lock();
        self.socket
            .set_option(SocketOptionId::IpMulticastIf, OptionValue::Addr(addr))?;
        st.interface_addr = Some(addr);
        Ok(())
    }

    /// Address of the outgoing multicast interface.
    ///
    /// When the kernel reports a different address of the same interface than
    /// the one passed to [`set_interface`](Self::set_interface), the latter
    /// is returned.
    pub fn interface(&self) -> Result<Ipv4Addr> {
        let st = self.state.lock();
        let current = self
            .socket
            .get_option(SocketOptionId::IpMulticastIf)?
            .as_addr()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let remembered = match st.interface_addr {
            Some(addr) => addr,
            None => return Ok(current),
        };
        if remembered == current {
            return Ok(remembered);
        }
        let owner = NetworkInterface::by_inet_addr(IpAddr::V4(current))
            .map_err(|e| translate(Error::Io(e)))?;
        match owner {
            Some(iface) if iface.addrs().contains(&IpAddr::V4(remembered)) => Ok(remembered),
            _ => Ok(current),
        }
    }

    /// Send multicast datagrams through `interface`.
    pub fn set_network_interface(&self, interface: &NetworkInterface) -> Result<()> {
        let mut st = self.state.lock();
        self.socket.set_option(
            SocketOptionId::IpMulticastIf2,
            OptionValue::Interface(Some(interface.clone())),
        )?;
        st.interface_addr = None;
        Ok(())
    }

    /// Outgoing multicast interface; `None` when the kernel picks one.
    pub fn network_interface(&self) -> Result<Option<NetworkInterface>> {
        match self.socket.get_option(SocketOptionId::IpMulticastIf2)? {
            OptionValue::Interface(iface) => Ok(iface),
            other => Err(Error::Socket(format!("unexpected interface value {:?}", other))),
        }
    }

    /// `true` disables delivery of our own datagrams to local members.
    pub fn set_loopback_mode(&self, disable: bool) -> Result<()> {
        self.socket.set_bool(SocketOptionId::IpMulticastLoop, !disable)
    }

    /// Whether loopback of our own datagrams is disabled.
    pub fn loopback_mode(&self) -> Result<bool> {
        Ok(!self.socket.get_bool(SocketOptionId::IpMulticastLoop)?)
    }

    // ========================================================================
    // Forwarded socket operations
    // ========================================================================

    pub fn send(&self, packet: &mut DatagramPacket) -> Result<()> {
        self.socket.send(packet)
    }

    pub fn receive(&self, packet: &mut DatagramPacket) -> Result<()> {
        self.socket.receive(packet)
    }

    pub fn set_so_timeout(&self, timeout: Duration) -> Result<()> {
        self.socket.set_so_timeout(timeout)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    /// Close the socket; every membership is dropped with it.
    pub fn close(&self) -> Result<()> {
        self.state.lock().memberships.clear();
        self.socket.close()
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_iface() -> Option<NetworkInterface> {
        NetworkInterface::loopback()
            .ok()
            .flatten()
            .filter(|lo| lo.first_ipv4().is_some())
    }

    #[test]
    fn test_ttl_bounds() {
        let socket = MulticastSocket::new().expect("new");
        assert!(matches!(socket.set_time_to_live(-1), Err(Error::IllegalArgument(_))));
        assert!(matches!(socket.set_time_to_live(256), Err(Error::IllegalArgument(_))));
        socket.set_time_to_live(0).expect("ttl 0");
        assert_eq!(socket.time_to_live().expect("ttl"), 0);
        socket.set_time_to_live(255).expect("ttl 255");
        assert_eq!(socket.time_to_live().expect("ttl"), 255);
    }

    #[test]
    fn test_default_ttl_and_reuse() {
        let socket = MulticastSocket::new().expect("new");
        assert_eq!(
            socket.time_to_live().expect("ttl"),
            i32::from(DEFAULT_MULTICAST_TTL)
        );
        assert!(socket.as_datagram_socket().reuse_address().expect("reuse"));
    }

    #[test]
    fn test_loopback_mode_inverted() {
        let socket = MulticastSocket::new().expect("new");
        socket.set_loopback_mode(true).expect("disable loopback");
        assert!(socket.loopback_mode().expect("mode"));
        assert!(!socket
            .as_datagram_socket()
            .get_bool(SocketOptionId::IpMulticastLoop)
            .expect("raw"));
        socket.set_loopback_mode(false).expect("enable loopback");
        assert!(!socket.loopback_mode().expect("mode"));
    }

    #[test]
    fn test_join_leave_on_loopback() {
        let lo = match loopback_iface() {
            Some(lo) => lo,
            None => return,
        };
        let socket = MulticastSocket::new().expect("new");
        let group: IpAddr = "239.255.77.1".parse().expect("group");
        if let Err(e) = socket.join_group_on(group, &lo) {
            log::debug!("loopback multicast unavailable: {}", e);
            return;
        }
        assert!(matches!(
            socket.join_group_on(group, &lo),
            Err(Error::Socket(ref m)) if m.contains("already a member")
        ));
        socket.leave_group_on(group, &lo).expect("leave");
        assert!(matches!(
            socket.leave_group_on(group, &lo),
            Err(Error::Socket(ref m)) if m == "not a member"
        ));
        // Joining again after leaving is allowed.
        socket.join_group_on(group, &lo).expect("rejoin");
    }

    #[test]
    fn test_rejects_non_multicast_group() {
        let socket = MulticastSocket::new().expect("new");
        let lo = match loopback_iface() {
            Some(lo) => lo,
            None => return,
        };
        assert!(matches!(
            socket.join_group_on("127.0.0.1".parse().expect("ip"), &lo),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_set_interface_remembered() {
        let socket = MulticastSocket::new().expect("new");
        socket.set_interface(Ipv4Addr::LOCALHOST).expect("set_interface");
        assert_eq!(socket.interface().expect("interface"), Ipv4Addr::LOCALHOST);

        if let Some(lo) = loopback_iface() {
            socket.set_network_interface(&lo).expect("set_network_interface");
            let iface = socket.network_interface().expect("get").expect("set");
            assert_eq!(iface.name(), lo.name());
        }
    }

    #[test]
    fn test_bind_to_rejects_ipv6() {
        assert!(matches!(
            MulticastSocket::bind_to("[::1]:0".parse().expect("addr")),
            Err(Error::UnsupportedAddressType)
        ));
    }
}
