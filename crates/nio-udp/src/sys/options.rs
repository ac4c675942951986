// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Socket option identifiers, values, and the registry mapping each
//! OS-backed identifier to its get/set pair.
//!
//! | Identifier | Value | Backing |
//! |------------|-------|---------|
//! | `SO_RCVBUF` / `SO_SNDBUF` | `Int` (bytes) | `SOL_SOCKET` |
//! | `SO_BROADCAST` / `SO_REUSEADDR` | `Bool` | `SOL_SOCKET` |
//! | `IP_TOS` | `Int` (0-255) | `IP_TOS` / `IPV6_TCLASS` |
//! | `SO_TIMEOUT` | `Int` (ms, 0 = infinite) | channel-side storage |
//! | `IP_MULTICAST_TTL` | `Int` (0-255) | `IPPROTO_IP` |
//! | `IP_MULTICAST_IF` | `Addr` | `IPPROTO_IP` |
//! | `IP_MULTICAST_IF2` | `Interface` | `IP_MULTICAST_IF` via first IPv4 address |
//! | `IP_MULTICAST_LOOP` | `Bool` (enable) | `IPPROTO_IP` |
//! | `IP_ADD_MEMBERSHIP` / `IP_DROP_MEMBERSHIP` | `Membership` | channel join/drop (write-only) |

use crate::netif::NetworkInterface;
use socket2::Socket;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::{AsRawFd, RawFd};

/// Socket option identifiers. The numeric values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SocketOptionId {
    /// Receive buffer size.
    SoRcvBuf = 0x1002,
    /// Send buffer size.
    SoSndBuf = 0x1001,
    /// Permit sending to broadcast addresses.
    SoBroadcast = 0x0020,
    /// Allow several sockets to bind the same address.
    SoReuseAddr = 0x0004,
    /// IP type-of-service / traffic class octet.
    IpTos = 0x0003,
    /// Blocking-socket receive timeout in milliseconds.
    SoTimeout = 0x1006,
    /// Multicast time-to-live.
    IpMulticastTtl = 0x0011,
    /// Outgoing multicast interface, by address.
    IpMulticastIf = 0x0010,
    /// Outgoing multicast interface, by interface descriptor.
    IpMulticastIf2 = 0x001f,
    /// Loop outgoing multicast back to local receivers.
    IpMulticastLoop = 0x0012,
    /// Join a group on an interface (write-only).
    IpAddMembership = 0x0013,
    /// Leave a group on an interface (write-only).
    IpDropMembership = 0x0014,
}

impl SocketOptionId {
    /// Every identifier, in declaration order.
    pub const ALL: [SocketOptionId; 12] = [
        SocketOptionId::SoRcvBuf,
        SocketOptionId::SoSndBuf,
        SocketOptionId::SoBroadcast,
        SocketOptionId::SoReuseAddr,
        SocketOptionId::IpTos,
        SocketOptionId::SoTimeout,
        SocketOptionId::IpMulticastTtl,
        SocketOptionId::IpMulticastIf,
        SocketOptionId::IpMulticastIf2,
        SocketOptionId::IpMulticastLoop,
        SocketOptionId::IpAddMembership,
        SocketOptionId::IpDropMembership,
    ];

    /// Fixed numeric value of the identifier.
    pub const fn value(self) -> u32 {
        self as u32
    }

    /// Look an identifier up by numeric value.
    pub fn from_value(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.value() == value)
    }

    /// Kind of value the option takes.
    pub const fn kind(self) -> ValueKind {
        match self {
            SocketOptionId::SoRcvBuf
            | SocketOptionId::SoSndBuf
            | SocketOptionId::IpTos
            | SocketOptionId::SoTimeout
            | SocketOptionId::IpMulticastTtl => ValueKind::Int,
            SocketOptionId::SoBroadcast
            | SocketOptionId::SoReuseAddr
            | SocketOptionId::IpMulticastLoop => ValueKind::Bool,
            SocketOptionId::IpMulticastIf => ValueKind::Addr,
            SocketOptionId::IpMulticastIf2 => ValueKind::Interface,
            SocketOptionId::IpAddMembership | SocketOptionId::IpDropMembership => {
                ValueKind::Membership
            }
        }
    }

    /// Whether the option only applies to IPv4 multicast.
    pub const fn is_multicast(self) -> bool {
        matches!(
            self,
            SocketOptionId::IpMulticastTtl
                | SocketOptionId::IpMulticastIf
                | SocketOptionId::IpMulticastIf2
                | SocketOptionId::IpMulticastLoop
                | SocketOptionId::IpAddMembership
                | SocketOptionId::IpDropMembership
        )
    }

    /// Conventional option name.
    pub const fn name(self) -> &'static str {
        match self {
            SocketOptionId::SoRcvBuf => "SO_RCVBUF",
            SocketOptionId::SoSndBuf => "SO_SNDBUF",
            SocketOptionId::SoBroadcast => "SO_BROADCAST",
            SocketOptionId::SoReuseAddr => "SO_REUSEADDR",
            SocketOptionId::IpTos => "IP_TOS",
            SocketOptionId::SoTimeout => "SO_TIMEOUT",
            SocketOptionId::IpMulticastTtl => "IP_MULTICAST_TTL",
            SocketOptionId::IpMulticastIf => "IP_MULTICAST_IF",
            SocketOptionId::IpMulticastIf2 => "IP_MULTICAST_IF2",
            SocketOptionId::IpMulticastLoop => "IP_MULTICAST_LOOP",
            SocketOptionId::IpAddMembership => "IP_ADD_MEMBERSHIP",
            SocketOptionId::IpDropMembership => "IP_DROP_MEMBERSHIP",
        }
    }
}

impl fmt::Display for SocketOptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bool,
    Addr,
    Interface,
    Membership,
}

/// Group/interface pair carried by the membership options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRequest {
    /// IPv4 multicast group.
    pub group: IpAddr,
    /// Interface to join on; `None` selects the default multicast interface.
    pub interface: Option<NetworkInterface>,
}

/// Value of a socket option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i32),
    Bool(bool),
    Addr(Ipv4Addr),
    /// `None` when no specific interface is selected.
    Interface(Option<NetworkInterface>),
    Membership(MembershipRequest),
}

impl OptionValue {
    /// Kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            OptionValue::Int(_) => ValueKind::Int,
            OptionValue::Bool(_) => ValueKind::Bool,
            OptionValue::Addr(_) => ValueKind::Addr,
            OptionValue::Interface(_) => ValueKind::Interface,
            OptionValue::Membership(_) => ValueKind::Membership,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_addr(&self) -> Option<Ipv4Addr> {
        match self {
            OptionValue::Addr(v) => Some(*v),
            _ => None,
        }
    }
}

// ============================================================================
// Registry of OS-backed options
// ============================================================================

type Getter = fn(&Socket, bool) -> io::Result<OptionValue>;
type Setter = fn(&Socket, bool, &OptionValue) -> io::Result<()>;

/// Get/set pair for one OS-backed option. The `bool` argument tells whether
/// the socket is IPv6.
pub(crate) struct OptionOps {
    pub(crate) id: SocketOptionId,
    pub(crate) get: Getter,
    pub(crate) set: Setter,
}

static REGISTRY: [OptionOps; 9] = [
    OptionOps {
        id: SocketOptionId::SoRcvBuf,
        get: get_rcvbuf,
        set: set_rcvbuf,
    },
    OptionOps {
        id: SocketOptionId::SoSndBuf,
        get: get_sndbuf,
        set: set_sndbuf,
    },
    OptionOps {
        id: SocketOptionId::SoBroadcast,
        get: |s, _| Ok(OptionValue::Bool(s.broadcast()?)),
        set: |s, _, v| s.set_broadcast(bool_value(v)?),
    },
    OptionOps {
        id: SocketOptionId::SoReuseAddr,
        get: |s, _| Ok(OptionValue::Bool(s.reuse_address()?)),
        set: |s, _, v| s.set_reuse_address(bool_value(v)?),
    },
    OptionOps {
        id: SocketOptionId::IpTos,
        get: get_tos,
        set: set_tos,
    },
    OptionOps {
        id: SocketOptionId::IpMulticastTtl,
        get: |s, _| Ok(OptionValue::Int(s.multicast_ttl_v4()? as i32)),
        set: |s, _, v| s.set_multicast_ttl_v4(int_value(v)? as u32),
    },
    OptionOps {
        id: SocketOptionId::IpMulticastIf,
        get: |s, _| Ok(OptionValue::Addr(s.multicast_if_v4()?)),
        set: |s, _, v| match v {
            OptionValue::Addr(addr) => s.set_multicast_if_v4(addr),
            _ => Err(invalid_value()),
        },
    },
    OptionOps {
        id: SocketOptionId::IpMulticastIf2,
        get: get_multicast_if2,
        set: set_multicast_if2,
    },
    OptionOps {
        id: SocketOptionId::IpMulticastLoop,
        get: |s, _| Ok(OptionValue::Bool(s.multicast_loop_v4()?)),
        set: |s, _, v| s.set_multicast_loop_v4(bool_value(v)?),
    },
];

/// Get/set pair for an OS-backed option; `None` for channel-side options.
pub(crate) fn lookup(id: SocketOptionId) -> Option<&'static OptionOps> {
    REGISTRY.iter().find(|ops| ops.id == id)
}

fn invalid_value() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "option value has the wrong type")
}

fn int_value(v: &OptionValue) -> io::Result<i32> {
    v.as_int().ok_or_else(invalid_value)
}

fn bool_value(v: &OptionValue) -> io::Result<bool> {
    v.as_bool().ok_or_else(invalid_value)
}

// Linux reports twice the requested buffer size.
#[cfg(any(target_os = "linux", target_os = "android"))]
const BUFFER_SIZE_FACTOR: usize = 2;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const BUFFER_SIZE_FACTOR: usize = 1;

fn get_rcvbuf(s: &Socket, _ipv6: bool) -> io::Result<OptionValue> {
    let size = s.recv_buffer_size()? / BUFFER_SIZE_FACTOR;
    Ok(OptionValue::Int(size.min(i32::MAX as usize) as i32))
}

fn set_rcvbuf(s: &Socket, _ipv6: bool, v: &OptionValue) -> io::Result<()> {
    s.set_recv_buffer_size(int_value(v)?.max(0) as usize)
}

fn get_sndbuf(s: &Socket, _ipv6: bool) -> io::Result<OptionValue> {
    let size = s.send_buffer_size()? / BUFFER_SIZE_FACTOR;
    Ok(OptionValue::Int(size.min(i32::MAX as usize) as i32))
}

fn set_sndbuf(s: &Socket, _ipv6: bool, v: &OptionValue) -> io::Result<()> {
    s.set_send_buffer_size(int_value(v)?.max(0) as usize)
}

fn get_tos(s: &Socket, ipv6: bool) -> io::Result<OptionValue> {
    if ipv6 {
        let tclass = get_int(s.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_TCLASS)?;
        Ok(OptionValue::Int(tclass))
    } else {
        Ok(OptionValue::Int(s.tos()? as i32))
    }
}

fn set_tos(s: &Socket, ipv6: bool, v: &OptionValue) -> io::Result<()> {
    let tos = int_value(v)?;
    if ipv6 {
        set_int(s.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos)
    } else {
        s.set_tos(tos as u32)
    }
}

fn get_multicast_if2(s: &Socket, _ipv6: bool) -> io::Result<OptionValue> {
    let addr = s.multicast_if_v4()?;
    if addr.is_unspecified() {
        return Ok(OptionValue::Interface(None));
    }
    Ok(OptionValue::Interface(NetworkInterface::by_inet_addr(
        IpAddr::V4(addr),
    )?))
}

fn set_multicast_if2(s: &Socket, _ipv6: bool, v: &OptionValue) -> io::Result<()> {
    let addr = match v {
        OptionValue::Interface(Some(iface)) => iface.first_ipv4().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("interface {} has no IPv4 address", iface.name()),
            )
        })?,
        OptionValue::Interface(None) => Ipv4Addr::UNSPECIFIED,
        _ => return Err(invalid_value()),
    };
    s.set_multicast_if_v4(&addr)
}

// ============================================================================
// Raw integer options
// ============================================================================

/// `setsockopt` with an `int` value.
pub(crate) fn set_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY:
    // - fd is a socket descriptor owned by the caller
    // - value is a stack-allocated c_int, properly aligned
    // - size_of::<c_int>() correctly describes the option length
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    super::cvt(ret).map(|_| ())
}

/// `getsockopt` with an `int` value.
pub(crate) fn get_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY:
    // - value and len are valid, aligned stack locations
    // - len is initialised to the size of value
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    super::cvt(ret).map(|_| value)
}
