//! UDP (C7): datagram socket backed by a bounded inbox, and the RX/TX
//! framers that move payloads between `ip.rs` and that inbox.
//!
//! Grounded on `udp/udp_rx.rs`/`udp/udp_tx.rs` in the teacher tree for the
//! header/pseudo-header-checksum conventions (`ipv4_checksum` from
//! `pnet::packet::udp`), rebuilt around `socket.rs`'s `ConnectionTable`
//! instead of the teacher's per-port listener map and `mpsc` socket reader.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::udp::{ipv4_checksum, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;

use crate::buffer::PacketBuffer;
use crate::device::{Fifo, ETHERNET_HEADER_LEN};
use crate::error::{Error, Result, TxResult};
use crate::ip::IP_HEADER_LEN;
use crate::socket::{ConnectionKey, TransportProtocol};
use crate::stack::{send_ip_packet, StackShared};

pub const UDP_HEADER_LEN: usize = 8;

/// A bound (and optionally connected) UDP socket. Holds its own demux key
/// and a bounded inbox that `handle_rx` pushes into and `recvfrom` pops
/// from, same division of labor as every other socket flavor in the crate.
pub struct UdpSocket {
    key: Mutex<ConnectionKey>,
    inbox: Fifo<(Vec<u8>, Ipv4Addr, u16)>,
    nonblocking: AtomicBool,
    stack: Weak<StackShared>,
}

impl UdpSocket {
    pub fn new(stack: Weak<StackShared>) -> Self {
        UdpSocket {
            key: Mutex::new(ConnectionKey::new(TransportProtocol::Udp)),
            inbox: Fifo::new(256),
            nonblocking: AtomicBool::new(false),
            stack,
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        UdpSocket::new(Weak::new())
    }

    pub fn key(&self) -> ConnectionKey {
        *self.key.lock().unwrap()
    }

    pub fn bind(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let mut key = self.key.lock().unwrap();
        key.local_ip = ip;
        key.local_port = port;
        Ok(())
    }

    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let mut key = self.key.lock().unwrap();
        key.remote_ip = ip;
        key.remote_port = port;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub(crate) fn deliver(&self, data: Vec<u8>, from_ip: Ipv4Addr, from_port: u16) {
        self.inbox.push((data, from_ip, from_port));
    }

    pub fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr, u16)> {
        let (data, ip, port) = if self.nonblocking.load(Ordering::Relaxed) {
            self.inbox.try_pop().ok_or(Error::WouldBlock)?
        } else {
            self.inbox.pop().ok_or(Error::ConnectionClosed)?
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, ip, port))
    }

    pub fn sendto(&self, payload: &[u8], dst_ip: Ipv4Addr, dst_port: u16) -> Result<usize> {
        let stack = self.stack.upgrade().ok_or(Error::NotConnected)?;
        let key = self.key();
        let src_ip = if key.local_ip.is_unspecified() {
            stack.config.claimed_ipv4
        } else {
            key.local_ip
        };
        send(&stack, src_ip, key.local_port, dst_ip, dst_port, payload)?;
        Ok(payload.len())
    }
}

/// Builds and sends one UDP datagram, header budget reserved up front the
/// way every other framer in the crate does it.
pub fn send(
    stack: &Arc<StackShared>,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> TxResult {
    let budget = ETHERNET_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN;
    let mut pb = PacketBuffer::new(budget + payload.len());
    pb.reserve(budget);
    pb.put(payload.len());
    pb.payload_mut().copy_from_slice(payload);
    pb.push(UDP_HEADER_LEN);
    {
        let mut header = MutableUdpPacket::new(pb.payload_mut()).unwrap();
        header.set_source(src_port);
        header.set_destination(dst_port);
        header.set_length((UDP_HEADER_LEN + payload.len()) as u16);
        header.set_checksum(0);
    }
    let csum = ipv4_checksum(&UdpPacket::new(pb.payload()).unwrap(), &src_ip, &dst_ip);
    {
        let mut header = MutableUdpPacket::new(pb.payload_mut()).unwrap();
        header.set_checksum(csum);
    }
    pb.endpoint.local_ip = src_ip;
    pb.endpoint.remote_ip = dst_ip;
    send_ip_packet(stack, IpNextHeaderProtocols::Udp, pb)
}

pub fn handle_rx(mut pb: PacketBuffer, stack: &Arc<StackShared>) {
    let bytes = pb.payload();
    let Some(packet) = UdpPacket::new(bytes) else {
        trace!("udp: frame too short to contain a udp header");
        return;
    };
    let length = packet.get_length() as usize;
    if length < UDP_HEADER_LEN || length > bytes.len() {
        trace!("udp: dropping datagram with inconsistent length field");
        return;
    }
    let checksum = packet.get_checksum();
    if checksum != 0 {
        let valid = ipv4_checksum(&packet, &pb.endpoint.remote_ip, &pb.endpoint.local_ip) == checksum;
        if !valid {
            trace!("udp: dropping datagram with invalid checksum");
            return;
        }
    }

    let src_port = packet.get_source();
    let dst_port = packet.get_destination();
    let key = ConnectionKey {
        local_ip: pb.endpoint.local_ip,
        local_port: dst_port,
        remote_ip: pb.endpoint.remote_ip,
        remote_port: src_port,
        protocol: TransportProtocol::Udp,
    };
    let Some(sock) = stack.udp_table.lookup(&key) else {
        trace!("udp: no socket bound to {:?}, dropping datagram", key);
        return;
    };
    pb.pull(UDP_HEADER_LEN);
    sock.deliver(pb.payload().to_vec(), pb.endpoint.remote_ip, src_port);
}
