// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Multicast membership keys and the per-channel registry that indexes them.
//!
//! Keys hold a weak reference to their channel. Every mutation of a key's
//! validity or blocked-source set happens with the owning channel's state
//! lock held; the key's own lock is always taken second.

use super::{ChannelInner, DatagramChannel};
use crate::error::{Error, Result};
use crate::netif::NetworkInterface;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One active multicast subscription of a [`DatagramChannel`].
///
/// Created by [`DatagramChannel::join`] / [`DatagramChannel::join_source`].
/// A key becomes invalid when it is dropped with
/// [`drop_membership`](Self::drop_membership) or when its channel closes, and
/// never becomes valid again. Clones share the same subscription.
#[derive(Clone)]
pub struct MembershipKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    channel: Weak<ChannelInner>,
    group: Ipv4Addr,
    interface: NetworkInterface,
    /// First IPv4 address of `interface`, as used for the join.
    interface_addr: Ipv4Addr,
    source: Option<Ipv4Addr>,
    valid: AtomicBool,
    /// Allocated on the first `block`.
    blocked: Mutex<Option<HashSet<Ipv4Addr>>>,
}

impl MembershipKey {
    pub(super) fn new(
        channel: Weak<ChannelInner>,
        group: Ipv4Addr,
        interface: NetworkInterface,
        interface_addr: Ipv4Addr,
        source: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                channel,
                group,
                interface,
                interface_addr,
                source,
                valid: AtomicBool::new(true),
                blocked: Mutex::new(None),
            }),
        }
    }

    /// Whether the membership is still active.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Leave the group. Does nothing if the key is already invalid.
    ///
    /// The key is invalidated and removed from its channel even when the
    /// kernel reports an error; that error is returned as [`Error::Io`].
    pub fn drop_membership(&self) -> Result<()> {
        match self.inner.channel.upgrade() {
            Some(channel) => channel.drop_membership(self),
            None => {
                self.invalidate();
                Ok(())
            }
        }
    }

    /// Stop receiving datagrams from `source` on this any-source membership.
    ///
    /// Blocking an already blocked source is a no-op.
    pub fn block(&self, source: IpAddr) -> Result<&Self> {
        if self.inner.source.is_some() {
            return Err(Error::illegal_state("key is source-specific"));
        }
        let channel = self.live_channel()?;
        channel.block(self, source)?;
        Ok(self)
    }

    /// Resume receiving datagrams from a previously blocked `source`.
    pub fn unblock(&self, source: IpAddr) -> Result<&Self> {
        let channel = self.live_channel()?;
        channel.unblock(self, source)?;
        Ok(self)
    }

    /// Channel that created the key, if it still exists.
    pub fn channel(&self) -> Option<DatagramChannel> {
        self.inner.channel.upgrade().map(DatagramChannel::from_inner)
    }

    pub fn group(&self) -> IpAddr {
        IpAddr::V4(self.inner.group)
    }

    pub fn network_interface(&self) -> &NetworkInterface {
        &self.inner.interface
    }

    /// Source of a source-specific membership; `None` for any-source.
    pub fn source_address(&self) -> Option<IpAddr> {
        self.inner.source.map(IpAddr::V4)
    }

    /// Sources currently blocked, in no particular order.
    pub fn blocked_sources(&self) -> Vec<IpAddr> {
        self.inner
            .blocked
            .lock()
            .as_ref()
            .map(|set| set.iter().copied().map(IpAddr::V4).collect())
            .unwrap_or_default()
    }

    fn live_channel(&self) -> Result<Arc<ChannelInner>> {
        if !self.is_valid() {
            return Err(Error::illegal_state("key is no longer valid"));
        }
        self.inner
            .channel
            .upgrade()
            .ok_or_else(|| Error::illegal_state("key is no longer valid"))
    }

    // ------------------------------------------------------------------------
    // Bookkeeping, called by the channel with its state lock held
    // ------------------------------------------------------------------------

    pub(super) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }

    pub(super) fn raw_group(&self) -> Ipv4Addr {
        self.inner.group
    }

    pub(super) fn raw_interface(&self) -> Ipv4Addr {
        self.inner.interface_addr
    }

    pub(super) fn raw_source(&self) -> Option<Ipv4Addr> {
        self.inner.source
    }

    pub(super) fn belongs_to(&self, channel: &Arc<ChannelInner>) -> bool {
        std::ptr::eq(self.inner.channel.as_ptr(), Arc::as_ptr(channel))
    }

    pub(super) fn is_blocked(&self, source: Ipv4Addr) -> bool {
        self.inner
            .blocked
            .lock()
            .as_ref()
            .map_or(false, |set| set.contains(&source))
    }

    pub(super) fn add_blocked(&self, source: Ipv4Addr) {
        self.inner
            .blocked
            .lock()
            .get_or_insert_with(HashSet::new)
            .insert(source);
    }

    pub(super) fn remove_blocked(&self, source: Ipv4Addr) {
        if let Some(set) = self.inner.blocked.lock().as_mut() {
            set.remove(&source);
        }
    }

    fn same(&self, other: &MembershipKey) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MembershipKey {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for MembershipKey {}

impl fmt::Display for MembershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}", self.inner.group, self.inner.interface.name())?;
        if let Some(source) = self.inner.source {
            write!(f, ",{}", source)?;
        }
        f.write_str(">")
    }
}

impl fmt::Debug for MembershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipKey")
            .field("key", &format_args!("{}", self))
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Group -> keys index of one channel.
///
/// Not synchronised: only used with the owning channel's state lock held.
#[derive(Default)]
pub(crate) struct MembershipRegistry {
    groups: HashMap<Ipv4Addr, Vec<MembershipKey>>,
}

impl MembershipRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Existing key for `(group, interface, source)`, `None` if there is
    /// none, or `IllegalState` if the request conflicts with an existing
    /// membership of the other kind on the same interface.
    pub(crate) fn check_membership(
        &self,
        group: Ipv4Addr,
        interface: &NetworkInterface,
        source: Option<Ipv4Addr>,
    ) -> Result<Option<MembershipKey>> {
        let keys = match self.groups.get(&group) {
            Some(keys) => keys,
            None => return Ok(None),
        };
        for key in keys.iter().filter(|k| k.network_interface() == interface) {
            match (source, key.raw_source()) {
                (None, None) => return Ok(Some(key.clone())),
                (None, Some(_)) => {
                    return Err(Error::illegal_state(
                        "already have source-specific membership",
                    ))
                }
                (Some(_), None) => {
                    return Err(Error::illegal_state(
                        "already a member to receive all packets",
                    ))
                }
                (Some(wanted), Some(existing)) if wanted == existing => {
                    return Ok(Some(key.clone()))
                }
                (Some(_), Some(_)) => {}
            }
        }
        Ok(None)
    }

    pub(crate) fn add(&mut self, key: MembershipKey) {
        self.groups.entry(key.raw_group()).or_default().push(key);
    }

    pub(crate) fn remove(&mut self, key: &MembershipKey) {
        let group = key.raw_group();
        if let Some(keys) = self.groups.get_mut(&group) {
            keys.retain(|k| !k.same(key));
            if keys.is_empty() {
                self.groups.remove(&group);
            }
        }
    }

    /// Invalidate every key; the registry is left empty.
    pub(crate) fn invalidate_all(&mut self) {
        for key in self.groups.drain().flat_map(|(_, keys)| keys) {
            key.invalidate();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Any-source key for `(group, interface)`, used by the write-only
    /// drop-membership option.
    pub(crate) fn find_any_source(
        &self,
        group: Ipv4Addr,
        interface: &NetworkInterface,
    ) -> Option<MembershipKey> {
        self.groups.get(&group)?.iter().find_map(|k| {
            (k.raw_source().is_none() && k.network_interface() == interface).then(|| k.clone())
        })
    }
}
