// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! End-to-end multicast scenarios on the loopback interface.
//!
//! Each test picks a random administratively-scoped group so tests can run in
//! parallel. Hosts (and containers) without loopback multicast delivery skip
//! the receive checks.

use nio_udp::channel::select::POLLIN;
use nio_udp::{
    DatagramChannel, DatagramPacket, Error, MembershipKey, MembershipRequest, MulticastSocket,
    NetworkInterface, OptionValue, SocketOptionId,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn random_group() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(
        239,
        255,
        fastrand::u8(1..255),
        fastrand::u8(1..255),
    ))
}

fn loopback() -> Option<NetworkInterface> {
    NetworkInterface::loopback().ok().flatten()
}

/// Receiver bound to the wildcard address on an ephemeral port.
fn receiver() -> (DatagramChannel, u16) {
    let ch = DatagramChannel::open().expect("open receiver");
    ch.set_option(SocketOptionId::SoReuseAddr, OptionValue::Bool(true))
        .expect("reuse");
    ch.bind(Some("0.0.0.0:0".parse().expect("addr")))
        .expect("bind receiver");
    let port = ch.local_addr().expect("local").expect("bound").port();
    ch.configure_blocking(false).expect("nonblocking");
    (ch, port)
}

/// Sender whose multicast traffic leaves through loopback.
fn sender() -> DatagramChannel {
    let ch = DatagramChannel::open().expect("open sender");
    ch.bind(Some("127.0.0.1:0".parse().expect("addr")))
        .expect("bind sender");
    ch.set_option(
        SocketOptionId::IpMulticastIf,
        OptionValue::Addr(Ipv4Addr::LOCALHOST),
    )
    .expect("multicast if");
    ch.set_option(SocketOptionId::IpMulticastLoop, OptionValue::Bool(true))
        .expect("loop");
    ch
}

/// Wait up to `timeout` for a datagram on a non-blocking channel.
fn receive_within(
    ch: &DatagramChannel,
    buf: &mut [u8],
    timeout: Duration,
) -> Option<(usize, SocketAddr)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(got) = ch.receive(buf).expect("receive") {
            return Some(got);
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return None;
        }
        ch.poll(POLLIN, left.as_millis().max(1) as i32).expect("poll");
    }
}

/// Join `group` on loopback and check that a probe datagram arrives.
fn join_and_probe(
    rx: &DatagramChannel,
    tx: &DatagramChannel,
    group: IpAddr,
    port: u16,
) -> Option<MembershipKey> {
    let lo = loopback()?;
    let key = match rx.join(group, &lo) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("skipping: cannot join {} on {}: {}", group, lo, e);
            return None;
        }
    };
    tx.send(b"probe", Some(SocketAddr::new(group, port)))
        .expect("send probe");
    let mut buf = [0u8; 16];
    match receive_within(rx, &mut buf, Duration::from_millis(500)) {
        Some(_) => Some(key),
        None => {
            eprintln!("skipping: no loopback multicast delivery on this host");
            None
        }
    }
}

#[test]
fn test_join_receive_drop() {
    let (rx, port) = receiver();
    let tx = sender();
    let group = random_group();
    let key = match join_and_probe(&rx, &tx, group, port) {
        Some(key) => key,
        None => return,
    };
    assert!(key.is_valid());
    assert_eq!(key.group(), group);
    assert_eq!(key.source_address(), None);
    assert!(key.channel().is_some());

    let target = SocketAddr::new(group, port);
    tx.send(b"hello group", Some(target)).expect("send");
    let mut buf = [0u8; 32];
    let (n, _) = receive_within(&rx, &mut buf, Duration::from_secs(1)).expect("delivered");
    assert_eq!(&buf[..n], b"hello group");

    key.drop_membership().expect("drop");
    assert!(!key.is_valid());
    assert_eq!(rx.membership_count(), 0);

    tx.send(b"after drop", Some(target)).expect("send");
    assert!(receive_within(&rx, &mut buf, Duration::from_millis(200)).is_none());
}

/// A wildcard socket sharing the port with a member only sees groups it
/// joined itself.
#[cfg(target_os = "linux")]
#[test]
fn test_unjoined_socket_on_shared_port_sees_nothing() {
    let (member, port) = receiver();
    let bystander = DatagramChannel::open().expect("open bystander");
    bystander
        .set_option(SocketOptionId::SoReuseAddr, OptionValue::Bool(true))
        .expect("reuse");
    bystander
        .bind(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)))
        .expect("bind shared port");
    bystander.configure_blocking(false).expect("nonblocking");

    let tx = sender();
    let group = random_group();
    if join_and_probe(&member, &tx, group, port).is_none() {
        return;
    }

    tx.send(b"members only", Some(SocketAddr::new(group, port)))
        .expect("send");
    let mut buf = [0u8; 32];
    let (n, _) = receive_within(&member, &mut buf, Duration::from_secs(1)).expect("delivered");
    assert_eq!(&buf[..n], b"members only");
    assert!(receive_within(&bystander, &mut buf, Duration::from_millis(200)).is_none());
    assert_eq!(bystander.membership_count(), 0);
}

#[test]
fn test_block_and_unblock_source() {
    let (rx, port) = receiver();
    let tx = sender();
    let group = random_group();
    let key = match join_and_probe(&rx, &tx, group, port) {
        Some(key) => key,
        None => return,
    };
    let target = SocketAddr::new(group, port);
    let source = IpAddr::V4(Ipv4Addr::LOCALHOST);

    match key.block(source) {
        Ok(_) => {}
        Err(Error::Unsupported(_)) => return,
        Err(e) => panic!("block failed: {:?}", e),
    }
    // Blocking twice is the same as blocking once.
    key.block(source).expect("block again");
    assert_eq!(key.blocked_sources(), vec![source]);

    let mut buf = [0u8; 32];
    tx.send(b"blocked", Some(target)).expect("send");
    assert!(receive_within(&rx, &mut buf, Duration::from_millis(200)).is_none());

    key.unblock(source).expect("unblock");
    assert!(key.blocked_sources().is_empty());
    assert!(matches!(key.unblock(source), Err(Error::IllegalState(_))));

    tx.send(b"unblocked", Some(target)).expect("send");
    let (n, _) = receive_within(&rx, &mut buf, Duration::from_secs(1)).expect("delivered");
    assert_eq!(&buf[..n], b"unblocked");
}

#[test]
fn test_join_is_idempotent_and_rejoin_is_fresh() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let (rx, _) = receiver();
    let group = random_group();
    let first = match rx.join(group, &lo) {
        Ok(key) => key,
        Err(_) => return,
    };
    let again = rx.join(group, &lo).expect("join again");
    assert_eq!(first, again);
    assert_eq!(rx.membership_count(), 1);

    first.drop_membership().expect("drop");
    let fresh = rx.join(group, &lo).expect("rejoin");
    assert!(fresh.is_valid());
    assert_ne!(fresh, first);
    assert_eq!(rx.membership_count(), 1);
}

#[test]
fn test_membership_conflicts() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let (rx, _) = receiver();
    let group = random_group();
    let any = match rx.join(group, &lo) {
        Ok(key) => key,
        Err(_) => return,
    };
    assert!(matches!(
        rx.join_source(group, &lo, IpAddr::V4(Ipv4Addr::LOCALHOST)),
        Err(Error::IllegalState(_))
    ));
    any.drop_membership().expect("drop");

    let ssm = match rx.join_source(group, &lo, IpAddr::V4(Ipv4Addr::LOCALHOST)) {
        Ok(key) => key,
        Err(Error::Unsupported(_)) => return,
        Err(e) => panic!("join_source failed: {:?}", e),
    };
    assert_eq!(ssm.source_address(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert!(matches!(rx.join(group, &lo), Err(Error::IllegalState(_))));
    assert!(matches!(
        ssm.block(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_close_invalidates_keys() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let (rx, _) = receiver();
    let keys: Vec<MembershipKey> = (0..3)
        .filter_map(|_| rx.join(random_group(), &lo).ok())
        .collect();
    if keys.is_empty() {
        return;
    }
    assert!(keys.iter().all(MembershipKey::is_valid));

    rx.close().expect("close");
    assert!(keys.iter().all(|k| !k.is_valid()));
    // Dropping an invalid key is a no-op.
    keys[0].drop_membership().expect("drop after close");
}

#[test]
fn test_dropping_channel_invalidates_keys() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let (rx, _) = receiver();
    let key = match rx.join(random_group(), &lo) {
        Ok(key) => key,
        Err(_) => return,
    };
    drop(rx);
    assert!(!key.is_valid());
    assert!(key.channel().is_none());
}

#[test]
fn test_membership_options() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let (rx, _) = receiver();
    let group = random_group();
    let request = MembershipRequest {
        group,
        interface: Some(lo.clone()),
    };
    if rx
        .set_option(
            SocketOptionId::IpAddMembership,
            OptionValue::Membership(request.clone()),
        )
        .is_err()
    {
        return;
    }
    assert_eq!(rx.membership_count(), 1);

    rx.set_option(
        SocketOptionId::IpDropMembership,
        OptionValue::Membership(request.clone()),
    )
    .expect("drop membership");
    assert_eq!(rx.membership_count(), 0);
    assert!(matches!(
        rx.set_option(
            SocketOptionId::IpDropMembership,
            OptionValue::Membership(request)
        ),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_multicast_socket_round_trip() {
    let lo = match loopback() {
        Some(lo) => lo,
        None => return,
    };
    let rx = MulticastSocket::new().expect("rx");
    rx.set_so_timeout(Duration::from_millis(500)).expect("timeout");
    let port = rx.local_addr().expect("bound").port();
    let group = random_group();
    if rx.join_group_on(group, &lo).is_err() {
        return;
    }

    let tx = MulticastSocket::new().expect("tx");
    tx.set_interface(Ipv4Addr::LOCALHOST).expect("interface");
    tx.set_time_to_live(0).expect("ttl");
    assert_eq!(tx.interface().expect("interface"), Ipv4Addr::LOCALHOST);

    let mut out = DatagramPacket::to(b"facade".to_vec(), SocketAddr::new(group, port));
    tx.send(&mut out).expect("send");

    let mut packet = DatagramPacket::with_capacity(64);
    match rx.receive(&mut packet) {
        Ok(()) => assert_eq!(packet.payload(), b"facade"),
        Err(Error::SocketTimeout) => eprintln!("skipping: no loopback multicast delivery"),
        Err(e) => panic!("receive failed: {:?}", e),
    }
    rx.leave_group_on(group, &lo).expect("leave");
}
