//! IPv4 (C5): header validation, fragmentation on send, reassembly on
//! receive, and the demux to ICMP/UDP/TCP.
//!
//! Grounded on `ipv4/ipv4_rx.rs` and `ipv4/ipv4_tx.rs` in the teacher tree
//! for the header field conventions and the `max_payload_per_fragment`
//! rounding-to-a-multiple-of-8 rule, reworked onto `PacketBuffer`'s cursor
//! model instead of the teacher's `Protocol`-trait builder chain and its
//! `(Buffer, total_length)` reassembly map.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::trace;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{checksum as ipv4_checksum, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::Packet;

use crate::buffer::{PacketBuffer, Protocol};
use crate::stack::{route_and_send, StackShared};

pub const IP_HEADER_LEN: usize = 20;
const MORE_FRAGMENTS: u8 = 0b001;
const DEFAULT_TTL: u8 = 64;

fn protocol_tag(proto: IpNextHeaderProtocol) -> Protocol {
    match proto {
        IpNextHeaderProtocols::Icmp => Protocol::Icmp,
        IpNextHeaderProtocols::Udp => Protocol::Udp,
        IpNextHeaderProtocols::Tcp => Protocol::Tcp,
        _ => Protocol::Unknown,
    }
}

fn dispatch_upward(stack: &Arc<StackShared>, protocol: IpNextHeaderProtocol, pb: PacketBuffer) {
    match protocol {
        IpNextHeaderProtocols::Icmp => crate::icmp::handle_rx(pb, stack),
        IpNextHeaderProtocols::Udp => crate::udp::handle_rx(pb, stack),
        IpNextHeaderProtocols::Tcp => crate::tcp::handle_rx(pb, stack),
        _ => trace!("ip: no handler registered for ip protocol {}", protocol.0),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

#[derive(Default)]
struct FragmentBucket {
    parts: BTreeMap<u32, Vec<u8>>,
    total_len: Option<u32>,
}

/// Keyed by `(src_ip, dst_ip, identification, protocol)` (SPEC_FULL.md
/// §4.5). A bucket is complete, and evicted, the moment its parts form a
/// gapless run from `0` up to a `total_len` learned from whichever fragment
/// arrived without `MORE_FRAGMENTS` set.
#[derive(Default)]
pub struct ReassemblyTable {
    buckets: Mutex<HashMap<FragmentKey, FragmentBucket>>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        ReassemblyTable::default()
    }

    fn insert(&self, key: FragmentKey, byte_offset: u32, more: bool, payload: &[u8]) -> Option<Vec<u8>> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key).or_default();
        bucket.parts.insert(byte_offset, payload.to_vec());
        if !more {
            bucket.total_len = Some(byte_offset + payload.len() as u32);
        }
        let total_len = bucket.total_len?;

        let mut expected = 0u32;
        for (&offset, chunk) in bucket.parts.iter() {
            if offset != expected {
                return None;
            }
            expected += chunk.len() as u32;
        }
        if expected != total_len {
            return None;
        }

        let bucket = buckets.remove(&key).unwrap();
        let mut assembled = Vec::with_capacity(total_len as usize);
        for (_, chunk) in bucket.parts {
            assembled.extend_from_slice(&chunk);
        }
        Some(assembled)
    }
}

/// Parses, validates and either dispatches or reassembles an inbound
/// datagram. Malformed input is dropped silently; this is the RX path, and
/// SPEC_FULL.md never surfaces drops to a caller.
pub fn handle_rx(mut pb: PacketBuffer, stack: &Arc<StackShared>) {
    let bytes = pb.payload();
    let Some(packet) = Ipv4Packet::new(bytes) else {
        trace!("ip: frame too short to contain an ipv4 header");
        return;
    };

    let header_len = packet.get_header_length() as usize * 4;
    let total_len = packet.get_total_length() as usize;
    if header_len < IP_HEADER_LEN || total_len < header_len || total_len > bytes.len() {
        trace!("ip: dropping datagram with inconsistent length fields");
        return;
    }
    if ipv4_checksum(&packet) != packet.get_checksum() {
        trace!("ip: dropping datagram with invalid header checksum");
        return;
    }

    let src = packet.get_source();
    let dst = packet.get_destination();
    let next_level_protocol = packet.get_next_level_protocol();
    let more = (packet.get_flags() & MORE_FRAGMENTS) != 0;
    let frag_offset = packet.get_fragment_offset();
    let identification = packet.get_identification();

    pb.endpoint.local_ip = dst;
    pb.endpoint.remote_ip = src;
    pb.protocol = protocol_tag(next_level_protocol);

    if !more && frag_offset == 0 {
        pb.set_len(total_len);
        pb.pull(header_len);
        dispatch_upward(stack, next_level_protocol, pb);
        return;
    }

    let byte_offset = frag_offset as u32 * 8;
    let payload = &bytes[header_len..total_len];
    let key = FragmentKey {
        src,
        dst,
        identification,
        protocol: next_level_protocol.0,
    };
    if let Some(assembled) = stack.reassembly.insert(key, byte_offset, more, payload) {
        let mut out = PacketBuffer::new(assembled.len());
        out.put(assembled.len());
        out.payload_mut().copy_from_slice(&assembled);
        out.endpoint.local_ip = dst;
        out.endpoint.remote_ip = src;
        out.protocol = protocol_tag(next_level_protocol);
        dispatch_upward(stack, next_level_protocol, out);
    }
}

/// `(mtu - header) & !0b111`: all but the last fragment of a datagram must
/// carry a payload that is a multiple of 8 bytes, since `fragment_offset` is
/// counted in 8-byte units.
fn max_payload_per_fragment(mtu: usize) -> usize {
    (mtu - IP_HEADER_LEN) & !0b111
}

fn stamp_header(
    pb: &mut PacketBuffer,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    fragment_offset: u16,
    more: bool,
    next_level_protocol: IpNextHeaderProtocol,
) {
    let payload_len = pb.len();
    pb.push(IP_HEADER_LEN);
    {
        let mut header = MutableIpv4Packet::new(pb.payload_mut()).unwrap();
        header.set_version(4);
        header.set_header_length(5);
        header.set_dscp(0);
        header.set_ecn(0);
        header.set_total_length((IP_HEADER_LEN + payload_len) as u16);
        header.set_identification(identification);
        header.set_flags(if more { MORE_FRAGMENTS } else { 0 });
        header.set_fragment_offset(fragment_offset);
        header.set_ttl(DEFAULT_TTL);
        header.set_next_level_protocol(next_level_protocol);
        header.set_source(src);
        header.set_destination(dst);
        header.set_checksum(0);
    }
    let csum = ipv4_checksum(&Ipv4Packet::new(pb.payload()).unwrap());
    let mut header = MutableIpv4Packet::new(pb.payload_mut()).unwrap();
    header.set_checksum(csum);
    drop(header);

    pb.protocol = Protocol::Ipv4;
    pb.endpoint.local_ip = src;
    pb.endpoint.remote_ip = dst;
}

fn fragment_slow_path(
    pb: &PacketBuffer,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    max_payload: usize,
    next_level_protocol: IpNextHeaderProtocol,
) -> Vec<PacketBuffer> {
    let total = pb.payload();
    let mut fragments = Vec::new();
    let mut offset = 0usize;
    while offset < total.len() {
        let chunk_len = std::cmp::min(max_payload, total.len() - offset);
        let more = offset + chunk_len < total.len();
        let mut frag = PacketBuffer::new(IP_HEADER_LEN + chunk_len);
        frag.reserve(IP_HEADER_LEN);
        frag.put(chunk_len);
        frag.payload_mut().copy_from_slice(&total[offset..offset + chunk_len]);
        stamp_header(
            &mut frag,
            src,
            dst,
            identification,
            (offset / 8) as u16,
            more,
            next_level_protocol,
        );
        fragments.push(frag);
        offset += chunk_len;
    }
    fragments
}

/// Frames `pb`'s live window as one or more IPv4 datagrams and hands them to
/// the neighbor/device TX path. Three cases, per SPEC_FULL.md §4.5: a
/// transport handler that pre-fragmented its own payload (`pb.fragments`
/// non-empty) is stamped sibling-by-sibling and passed through unchanged; a
/// payload within one MTU goes out as a single datagram; anything larger is
/// fragmented here.
pub fn send(
    stack: &Arc<StackShared>,
    next_level_protocol: IpNextHeaderProtocol,
    mut pb: PacketBuffer,
) -> crate::error::TxResult {
    let src = pb.endpoint.local_ip;
    let dst = pb.endpoint.remote_ip;
    let identification = stack.next_ip_identification();
    let max_payload = max_payload_per_fragment(stack.device.mtu);

    let mut carrier = PacketBuffer::new(0);
    carrier.endpoint = pb.endpoint;

    if !pb.fragments.is_empty() {
        let children = std::mem::take(&mut pb.fragments);
        let count = children.len();
        let mut offset = 0u32;
        for (i, mut frag) in children.into_iter().enumerate() {
            let more = i + 1 < count;
            let payload_len = frag.len() as u32;
            stamp_header(
                &mut frag,
                src,
                dst,
                identification,
                (offset / 8) as u16,
                more,
                next_level_protocol,
            );
            offset += payload_len;
            carrier.fragments.push(frag);
        }
    } else if pb.len() > max_payload {
        carrier.fragments = fragment_slow_path(&pb, src, dst, identification, max_payload, next_level_protocol);
    } else {
        stamp_header(&mut pb, src, dst, identification, 0, false, next_level_protocol);
        carrier = pb;
    }

    route_and_send(stack, dst, carrier)
}
