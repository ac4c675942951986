// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Network interface descriptors, enumerated with `getifaddrs`.
//!
//! Only what multicast membership needs: the name, the kernel index, the
//! addresses and the up/loopback/multicast flags.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Snapshot of one network interface.
///
/// Two descriptors are equal when they name the same kernel interface
/// (same name and index); the address list is informational.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    name: String,
    index: u32,
    addrs: Vec<IpAddr>,
    flags: u32,
}

impl NetworkInterface {
    /// Interface name, e.g. `lo` or `eth0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel interface index (0 if the kernel did not report one).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Addresses bound to the interface, IPv4 first.
    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// First IPv4 address of the interface, used to identify it in
    /// `ip_mreq`-style requests.
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn is_up(&self) -> bool {
        self.flags & libc::IFF_UP as u32 != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & libc::IFF_LOOPBACK as u32 != 0
    }

    pub fn supports_multicast(&self) -> bool {
        self.flags & libc::IFF_MULTICAST as u32 != 0
    }

    /// Every interface that has at least one IP address.
    pub fn list() -> io::Result<Vec<NetworkInterface>> {
        let mut by_name: BTreeMap<String, NetworkInterface> = BTreeMap::new();
        for (name, flags, addr) in system_addresses()? {
            let entry = by_name.entry(name.clone()).or_insert_with(|| NetworkInterface {
                index: name_to_index(&name),
                name,
                addrs: Vec::new(),
                flags,
            });
            entry.flags |= flags;
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
        }

        let mut ifaces: Vec<NetworkInterface> = by_name.into_values().collect();
        for iface in &mut ifaces {
            iface.addrs.sort_by_key(|a| a.is_ipv6());
        }
        ifaces.sort_by_key(|i| i.index);
        Ok(ifaces)
    }

    /// Interface with the given name.
    pub fn by_name(name: &str) -> io::Result<Option<NetworkInterface>> {
        Ok(Self::list()?.into_iter().find(|i| i.name == name))
    }

    /// Interface with the given kernel index.
    pub fn by_index(index: u32) -> io::Result<Option<NetworkInterface>> {
        Ok(Self::list()?.into_iter().find(|i| i.index == index))
    }

    /// Interface that owns `addr`.
    pub fn by_inet_addr(addr: IpAddr) -> io::Result<Option<NetworkInterface>> {
        Ok(Self::list()?.into_iter().find(|i| i.addrs.contains(&addr)))
    }

    /// First loopback interface with an IPv4 address.
    pub fn loopback() -> io::Result<Option<NetworkInterface>> {
        Ok(Self::list()?
            .into_iter()
            .find(|i| i.is_loopback() && i.first_ipv4().is_some()))
    }

    /// First interface that is up, multicast-capable and not loopback.
    pub fn default_multicast() -> io::Result<Option<NetworkInterface>> {
        Ok(Self::list()?.into_iter().find(|i| {
            i.is_up() && i.supports_multicast() && !i.is_loopback() && i.first_ipv4().is_some()
        }))
    }
}

impl PartialEq for NetworkInterface {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.index == other.index
    }
}

impl Eq for NetworkInterface {}

impl Hash for NetworkInterface {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

fn name_to_index(name: &str) -> u32 {
    match CString::new(name) {
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
        Ok(c_name) => unsafe { libc::if_nametoindex(c_name.as_ptr()) },
        Err(_) => 0,
    }
}

/// `(interface name, flags, address)` for every IP address on the host.
fn system_addresses() -> io::Result<Vec<(String, u32, IpAddr)>> {
    let mut out = Vec::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY:
    // - `ifaddrs` is a valid pointer to a null pointer, which getifaddrs will populate
    // - the returned list is freed with freeifaddrs below
    let ret = unsafe { libc::getifaddrs(&mut ifaddrs) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY:
        // - `ifa` is non-null and comes from the getifaddrs list
        // - the list stays valid until freeifaddrs
        let entry = unsafe { &*ifa };
        ifa = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }

        // SAFETY: ifa_name is non-null and NUL-terminated; copied out immediately.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        // SAFETY: ifa_addr is non-null; only sa_family is read here.
        let family = unsafe { (*entry.ifa_addr).sa_family } as libc::c_int;
        let ip = match family {
            libc::AF_INET => {
                // SAFETY: sa_family == AF_INET guarantees a sockaddr_in.
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                // SAFETY: sa_family == AF_INET6 guarantees a sockaddr_in6.
                let sin6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
            }
            _ => continue,
        };

        out.push((name, entry.ifa_flags as u32, ip));
    }

    // SAFETY: ifaddrs was allocated by getifaddrs and is not used after this.
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(out)
}
