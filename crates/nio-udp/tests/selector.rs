// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Selector integration through `mio`.

use mio::{Events, Poll, Token};
use nio_udp::channel::select::revents_from_event;
use nio_udp::{DatagramChannel, Error, Ops};
use std::net::SocketAddr;
use std::time::Duration;

fn nonblocking_channel() -> (DatagramChannel, SocketAddr) {
    let ch = DatagramChannel::open().expect("open");
    ch.bind(Some("127.0.0.1:0".parse().expect("addr")))
        .expect("bind");
    ch.configure_blocking(false).expect("nonblocking");
    let addr = ch.local_addr().expect("local").expect("bound");
    (ch, addr)
}

#[test]
fn test_readable_event_sets_ready_ops() {
    let mut poll = Poll::new().expect("poll");
    let (rx, rx_addr) = nonblocking_channel();
    let key = rx
        .register(poll.registry(), Token(1), Ops::READ)
        .expect("register");

    let tx = DatagramChannel::open().expect("open tx");
    tx.send(b"event", Some(rx_addr)).expect("send");

    let mut events = Events::with_capacity(4);
    let mut readable = false;
    for _ in 0..10 {
        poll.poll(&mut events, Some(Duration::from_millis(100)))
            .expect("poll");
        for event in events.iter() {
            assert_eq!(event.token(), Token(1));
            if rx.translate_and_set_ready_ops(revents_from_event(event), &key) {
                readable = key.is_readable();
            }
        }
        if readable {
            break;
        }
    }
    assert!(readable, "no readable event");
    assert!(!key.is_writable());

    let mut buf = [0u8; 16];
    let (n, _) = rx.receive(&mut buf).expect("receive").expect("datagram");
    assert_eq!(&buf[..n], b"event");
    assert!(rx.receive(&mut buf).expect("receive").is_none());

    rx.deregister(poll.registry(), &key).expect("deregister");
}

#[test]
fn test_writable_interest() {
    let mut poll = Poll::new().expect("poll");
    let (ch, _) = nonblocking_channel();
    let key = ch
        .register(poll.registry(), Token(2), Ops::WRITE)
        .expect("register");

    let mut events = Events::with_capacity(4);
    poll.poll(&mut events, Some(Duration::from_millis(500)))
        .expect("poll");
    let mut writable = false;
    for event in events.iter() {
        ch.translate_and_update_ready_ops(revents_from_event(event), &key);
        writable |= key.is_writable();
    }
    assert!(writable);
    ch.deregister(poll.registry(), &key).expect("deregister");
}

#[test]
fn test_close_while_registered_defers_release() {
    let poll = Poll::new().expect("poll");
    let (ch, _) = nonblocking_channel();
    let key = ch
        .register(poll.registry(), Token(3), Ops::READ)
        .expect("register");

    ch.close().expect("close");
    assert!(!ch.is_open());
    assert!(ch.is_registered());
    assert!(matches!(ch.kill(), Err(Error::IllegalState(_))));

    ch.deregister(poll.registry(), &key).expect("deregister");
    assert!(!ch.is_registered());
    assert!(!key.is_valid());
    ch.kill().expect("kill is idempotent once released");
}

#[test]
fn test_registration_rules() {
    let poll = Poll::new().expect("poll");
    let blocking = DatagramChannel::open().expect("open");
    assert!(matches!(
        blocking.register(poll.registry(), Token(4), Ops::READ),
        Err(Error::IllegalBlockingMode)
    ));

    let (ch, _) = nonblocking_channel();
    assert_eq!(ch.valid_ops(), Ops::READ | Ops::WRITE);
    assert!(matches!(
        ch.register(poll.registry(), Token(5), Ops::empty()),
        Err(Error::IllegalArgument(_))
    ));
    assert!(matches!(
        ch.register(poll.registry(), Token(5), Ops::READ | Ops::ACCEPT),
        Err(Error::IllegalArgument(_))
    ));

    let key = ch
        .register(poll.registry(), Token(5), Ops::READ)
        .expect("register");
    assert!(matches!(ch.configure_blocking(true), Err(Error::IllegalBlockingMode)));
    ch.deregister(poll.registry(), &key).expect("deregister");
    assert!(matches!(
        ch.reregister(poll.registry(), &key, Ops::WRITE),
        Err(Error::IllegalState(_))
    ));
    ch.configure_blocking(true).expect("blocking after deregister");
}
