// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Datagram packet record used by the blocking socket facades.

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};

/// Buffer window plus remote address, for `DatagramSocket::send`/`receive`.
///
/// `offset..offset + length` is the payload. On receive the window capacity
/// is the last length set explicitly (`buf_length`); `length` is then set to
/// the number of bytes actually received, which is smaller than the datagram
/// when it was truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramPacket {
    buf: Vec<u8>,
    offset: usize,
    length: usize,
    buf_length: usize,
    address: Option<IpAddr>,
    port: Option<u16>,
}

impl DatagramPacket {
    /// Packet covering the whole buffer, no address.
    pub fn new(buf: Vec<u8>) -> Self {
        let length = buf.len();
        Self {
            buf,
            offset: 0,
            length,
            buf_length: length,
            address: None,
            port: None,
        }
    }

    /// Packet covering `buf[offset..offset + length]`.
    pub fn with_range(buf: Vec<u8>, offset: usize, length: usize) -> Result<Self> {
        check_range(buf.len(), offset, length)?;
        Ok(Self {
            buf,
            offset,
            length,
            buf_length: length,
            address: None,
            port: None,
        })
    }

    /// Packet covering the whole buffer, addressed to `target`.
    pub fn to(buf: Vec<u8>, target: SocketAddr) -> Self {
        let mut packet = Self::new(buf);
        packet.set_socket_address(target);
        packet
    }

    /// Empty packet with room for `capacity` bytes, ready to receive into.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(vec![0u8; capacity])
    }

    /// Whole backing buffer.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// `data()[offset..offset + length]`.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.length]
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Address and port, when both are set.
    pub fn socket_address(&self) -> Option<SocketAddr> {
        match (self.address, self.port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// Replace the buffer; the window becomes the whole buffer.
    pub fn set_data(&mut self, buf: Vec<u8>) {
        self.length = buf.len();
        self.buf_length = buf.len();
        self.offset = 0;
        self.buf = buf;
    }

    /// Replace the buffer and window.
    pub fn set_data_range(&mut self, buf: Vec<u8>, offset: usize, length: usize) -> Result<()> {
        check_range(buf.len(), offset, length)?;
        self.buf = buf;
        self.offset = offset;
        self.length = length;
        self.buf_length = length;
        Ok(())
    }

    /// Set the window length; also the capacity used by the next receive.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        check_range(self.buf.len(), self.offset, length)?;
        self.length = length;
        self.buf_length = length;
        Ok(())
    }

    pub fn set_address(&mut self, address: Option<IpAddr>) {
        self.address = address;
    }

    pub fn set_port(&mut self, port: Option<u16>) {
        self.port = port;
    }

    pub fn set_socket_address(&mut self, addr: SocketAddr) {
        self.address = Some(addr.ip());
        self.port = Some(addr.port());
    }

    /// Give the buffer back.
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }

    /// Receive window (`buf_length` bytes from `offset`).
    pub(crate) fn receive_window(&mut self) -> &mut [u8] {
        let end = self.offset + self.buf_length;
        &mut self.buf[self.offset..end]
    }

    /// Record a completed receive.
    pub(crate) fn set_received(&mut self, n: usize, from: SocketAddr) {
        self.length = n.min(self.buf_length);
        self.set_socket_address(from);
    }
}

fn check_range(buf_len: usize, offset: usize, length: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= buf_len => Ok(()),
        _ => Err(Error::illegal_argument(format!(
            "illegal offset {} / length {} for buffer of {}",
            offset, length, buf_len
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_covers_buffer() {
        let p = DatagramPacket::new(b"hello".to_vec());
        assert_eq!(p.offset(), 0);
        assert_eq!(p.length(), 5);
        assert_eq!(p.payload(), b"hello");
        assert_eq!(p.socket_address(), None);
    }

    #[test]
    fn test_with_range_validates() {
        assert!(DatagramPacket::with_range(vec![0; 8], 4, 4).is_ok());
        assert!(matches!(
            DatagramPacket::with_range(vec![0; 8], 4, 5),
            Err(Error::IllegalArgument(_))
        ));
        assert!(DatagramPacket::with_range(vec![0; 8], usize::MAX, 2).is_err());
    }

    #[test]
    fn test_set_length_bounds() {
        let mut p = DatagramPacket::with_range(vec![0; 10], 2, 4).expect("range");
        p.set_length(8).expect("fits");
        assert!(p.set_length(9).is_err());
        assert_eq!(p.length(), 8);
    }

    #[test]
    fn test_received_keeps_capacity() {
        let mut p = DatagramPacket::with_capacity(16);
        let from: SocketAddr = "127.0.0.1:9000".parse().expect("addr");
        p.receive_window()[..4].copy_from_slice(b"ping");
        p.set_received(4, from);
        assert_eq!(p.payload(), b"ping");
        assert_eq!(p.socket_address(), Some(from));
        // Capacity for the next receive is unchanged.
        assert_eq!(p.receive_window().len(), 16);
    }

    #[test]
    fn test_address_and_port_are_independent() {
        let mut p = DatagramPacket::new(vec![1, 2, 3]);
        p.set_address(Some("10.0.0.1".parse().expect("ip")));
        assert_eq!(p.socket_address(), None);
        p.set_port(Some(53));
        assert_eq!(
            p.socket_address(),
            Some("10.0.0.1:53".parse().expect("addr"))
        );
    }
}
