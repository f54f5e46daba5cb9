//! ARP (C4): neighbor-table learning on every observed request/reply, a
//! reply to who-has probes for our claimed address, and broadcast request
//! construction.
//!
//! Grounded on `arp/arp_rx.rs` and `arp/arp_tx.rs` in the teacher tree for
//! the packet field conventions; the table itself lives in `neighbor.rs`
//! rather than the teacher's `ArpTable`/listener-channel design, since this
//! spec has no per-caller blocking `get()` — lookups go through
//! `stack::route_and_send` and a miss just issues a request and drops the
//! packet for the caller to retry.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::trace;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::EtherTypes;
use pnet::packet::Packet;
use pnet::util::MacAddr;

use crate::buffer::{PacketBuffer, Protocol};
use crate::neighbor::NeighborEntry;
use crate::stack::StackShared;

pub const ARP_PACKET_LEN: usize = 28;

pub fn handle_rx(pb: PacketBuffer, stack: &Arc<StackShared>) {
    let Some(packet) = ArpPacket::new(pb.payload()) else {
        trace!("arp: frame too short to contain an arp packet");
        return;
    };
    if packet.get_hardware_type() != ArpHardwareTypes::Ethernet
        || packet.get_protocol_type() != EtherTypes::Ipv4
    {
        return;
    }

    let sender_ip = packet.get_sender_proto_addr();
    let sender_mac = packet.get_sender_hw_addr();
    let operation = packet.get_operation();
    let target_ip = packet.get_target_proto_addr();

    stack.neighbors.insert(
        sender_ip,
        NeighborEntry {
            mac: sender_mac,
            device: stack.device.clone(),
        },
        false,
    );

    if operation == ArpOperations::Request && target_ip == stack.config.claimed_ipv4 {
        send_reply(stack, sender_ip, sender_mac);
    }
}

fn build_packet(
    mut pb: PacketBuffer,
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> PacketBuffer {
    pb.put(ARP_PACKET_LEN);
    {
        let mut packet = MutableArpPacket::new(pb.payload_mut()).unwrap();
        packet.set_hardware_type(ArpHardwareTypes::Ethernet);
        packet.set_protocol_type(EtherTypes::Ipv4);
        packet.set_hw_addr_len(6);
        packet.set_proto_addr_len(4);
        packet.set_operation(operation);
        packet.set_sender_hw_addr(sender_mac);
        packet.set_sender_proto_addr(sender_ip);
        packet.set_target_hw_addr(target_mac);
        packet.set_target_proto_addr(target_ip);
    }
    pb.protocol = Protocol::Arp;
    pb
}

fn send_reply(stack: &Arc<StackShared>, target_ip: Ipv4Addr, target_mac: MacAddr) {
    let mut pb = build_packet(
        PacketBuffer::new(crate::device::ETHERNET_HEADER_LEN + ARP_PACKET_LEN),
        ArpOperations::Reply,
        stack.device.mac,
        stack.config.claimed_ipv4,
        target_mac,
        target_ip,
    );
    pb.endpoint.local_mac = stack.device.mac;
    pb.endpoint.remote_mac = target_mac;
    stack.device.write_to_device(pb);
}

/// Broadcasts a who-has probe for `target_ip`. Never blocks; any answer
/// arrives later through `handle_rx`'s neighbor-table learning.
pub fn send_request(stack: &Arc<StackShared>, target_ip: Ipv4Addr) {
    let mut pb = build_packet(
        PacketBuffer::new(crate::device::ETHERNET_HEADER_LEN + ARP_PACKET_LEN),
        ArpOperations::Request,
        stack.device.mac,
        stack.config.claimed_ipv4,
        MacAddr::new(0, 0, 0, 0, 0, 0),
        target_ip,
    );
    pb.endpoint.local_mac = stack.device.mac;
    pb.endpoint.remote_mac = MacAddr::broadcast();
    stack.device.write_to_device(pb);
}
