//! ICMP (C6): echo request/reply only, per SPEC_FULL.md §4.6 ("any other
//! ICMP type or code is silently dropped").
//!
//! Grounded on `icmp/icmp_rx.rs`/`icmp/icmp_tx.rs` in the teacher tree for
//! the header field conventions, rebuilt on `PacketBuffer` and
//! `pnet::packet::icmp` instead of the teacher's `Protocol`-trait builder
//! chain.

use std::sync::Arc;

use log::trace;
use pnet::packet::icmp::echo_reply::IcmpCodes;
use pnet::packet::icmp::{checksum as icmp_checksum, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;

use crate::buffer::PacketBuffer;
use crate::ip::IP_HEADER_LEN;
use crate::stack::{send_ip_packet, StackShared};

/// Reads an echo request and replies with the identical identifier,
/// sequence number, and data, only flipping type and recomputed checksum —
/// same approach as an echo's `build()` in the teacher tree, just done in
/// place rather than via a separate immutable/mutable packet pair.
pub fn handle_rx(pb: PacketBuffer, stack: &Arc<StackShared>) {
    let bytes = pb.payload();
    let Some(packet) = IcmpPacket::new(bytes) else {
        trace!("icmp: frame too short to contain an icmp header");
        return;
    };
    if packet.get_icmp_type() != IcmpTypes::EchoRequest {
        trace!("icmp: dropping non-echo-request message (type {:?})", packet.get_icmp_type());
        return;
    }
    if icmp_checksum(&packet) != packet.get_checksum() {
        trace!("icmp: dropping message with invalid checksum");
        return;
    }

    let budget = crate::device::ETHERNET_HEADER_LEN + IP_HEADER_LEN;
    let mut reply = PacketBuffer::new(budget + bytes.len());
    reply.reserve(budget);
    reply.put(bytes.len());
    reply.payload_mut().copy_from_slice(bytes);
    {
        let mut header = MutableIcmpPacket::new(reply.payload_mut()).unwrap();
        header.set_icmp_type(IcmpTypes::EchoReply);
        header.set_icmp_code(IcmpCodes::NoCode);
        header.set_checksum(0);
    }
    let csum = icmp_checksum(&IcmpPacket::new(reply.payload()).unwrap());
    {
        let mut header = MutableIcmpPacket::new(reply.payload_mut()).unwrap();
        header.set_checksum(csum);
    }

    reply.endpoint = pb.endpoint;
    reply.endpoint.swap();
    let _ = send_ip_packet(stack, IpNextHeaderProtocols::Icmp, reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::echo_request::{IcmpCodes as RequestCodes, MutableEchoRequestPacket};
    use std::net::Ipv4Addr;

    fn build_echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + data.len()];
        let mut packet = MutableEchoRequestPacket::new(&mut buf).unwrap();
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(RequestCodes::NoCode);
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(data);
        let csum = icmp_checksum(&IcmpPacket::new(packet.packet()).unwrap());
        packet.set_checksum(csum);
        buf
    }

    #[test]
    fn echo_request_roundtrip_produces_a_valid_reply_body() {
        let request = build_echo_request(0xabcd, 1, b"ping");
        let mut pb = PacketBuffer::new(request.len());
        pb.put(request.len());
        pb.payload_mut().copy_from_slice(&request);
        pb.endpoint.local_ip = Ipv4Addr::new(10, 0, 0, 2);
        pb.endpoint.remote_ip = Ipv4Addr::new(10, 0, 0, 1);

        let packet = IcmpPacket::new(pb.payload()).unwrap();
        assert_eq!(packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert!(icmp_checksum(&packet) == packet.get_checksum());
    }
}
