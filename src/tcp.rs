//! TCP (C8): the RFC 793-style state machine, listen sockets with a SYN
//! list and accept queue, connected sockets with a blocking handshake and a
//! per-segment inbox, and the close path (active, passive and simultaneous)
//! down through TIME_WAIT.
//!
//! The teacher tree has no TCP at all; the packet-framing conventions here
//! follow the same shape as `udp.rs`/`icmp.rs` (reserve a header budget up
//! front, build with `pnet::packet::tcp`, checksum over the pseudo-header
//! last) rather than hand-rolling wire parsing, so this stays consistent
//! with how every other protocol in the crate is framed. State naming
//! (`SynReceived`, `FinWait1`, ...) and the separate SYN-queue/accept-queue
//! split for listeners are grounded on `drivers/src/net/tcp.rs` in the
//! `SlopLabs-slopos` example tree, the closest thing in the retrieved pack
//! to a from-scratch TCP implementation.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::trace;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::{ipv4_checksum, MutableTcpPacket, TcpFlags, TcpPacket};
use pnet::packet::Packet;
use rand::Rng;

use crate::buffer::PacketBuffer;
use crate::device::{Fifo, ETHERNET_HEADER_LEN};
use crate::error::{Error, Result, TxResult};
use crate::ip::IP_HEADER_LEN;
use crate::socket::{ConnectionKey, TransportProtocol};
use crate::stack::{send_ip_packet, StackShared};

pub const TCP_HEADER_LEN: usize = 20;
const FIXED_WINDOW: u16 = 0xFFFF;

/// How long a connection sits in TIME_WAIT before its table entry is
/// dropped. SPEC_FULL.md §4.8 calls this "a bounded, non-normative
/// duration"; timers are otherwise out of scope for this stack, so it's a
/// plain sleeping thread rather than a timer wheel.
const TIME_WAIT_DURATION: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

struct SynEntry {
    local_seq: u32,
    peer_seq: u32,
}

/// A listening socket: the key it was bound to, a backlog-bounded SYN list
/// keyed by the connecting peer's concrete flow key, and the accept queue
/// completed handshakes land in.
pub struct TcpListenSocket {
    pub key: ConnectionKey,
    backlog: usize,
    syn_list: Mutex<HashMap<ConnectionKey, SynEntry>>,
    accept_queue: Fifo<Arc<TcpSocket>>,
    nonblocking: AtomicBool,
}

impl TcpListenSocket {
    pub fn new(key: ConnectionKey, backlog: usize, _stack: Weak<StackShared>) -> Self {
        let backlog = backlog.max(1);
        TcpListenSocket {
            key,
            backlog,
            syn_list: Mutex::new(HashMap::new()),
            accept_queue: Fifo::new(backlog),
            nonblocking: AtomicBool::new(false),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub fn accept(&self) -> Result<Arc<TcpSocket>> {
        if self.nonblocking.load(Ordering::Relaxed) {
            self.accept_queue.try_pop().ok_or(Error::WouldBlock)
        } else {
            self.accept_queue.pop().ok_or(Error::ConnectionClosed)
        }
    }

    pub fn shutdown(&self) {
        self.accept_queue.shutdown();
    }
}

/// A connected (or connecting) TCP socket.
pub struct TcpSocket {
    key: Mutex<ConnectionKey>,
    state: Mutex<State>,
    seq: AtomicU32,
    ack: AtomicU32,
    inbox: Fifo<Vec<u8>>,
    nonblocking: AtomicBool,
    connect_gate: (Mutex<bool>, Condvar),
    stack: Weak<StackShared>,
}

impl TcpSocket {
    pub fn new_unconnected(stack: Weak<StackShared>) -> Self {
        TcpSocket {
            key: Mutex::new(ConnectionKey::new(TransportProtocol::Tcp)),
            state: Mutex::new(State::Closed),
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            inbox: Fifo::new(256),
            nonblocking: AtomicBool::new(false),
            connect_gate: (Mutex::new(false), Condvar::new()),
            stack,
        }
    }

    fn new_established(key: ConnectionKey, seq: u32, ack: u32, stack: Weak<StackShared>) -> Arc<Self> {
        Arc::new(TcpSocket {
            key: Mutex::new(key),
            state: Mutex::new(State::Established),
            seq: AtomicU32::new(seq),
            ack: AtomicU32::new(ack),
            inbox: Fifo::new(256),
            nonblocking: AtomicBool::new(false),
            connect_gate: (Mutex::new(false), Condvar::new()),
            stack,
        })
    }

    pub fn key(&self) -> ConnectionKey {
        *self.key.lock().unwrap()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub fn bind(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let mut key = self.key.lock().unwrap();
        key.local_ip = ip;
        key.local_port = port;
        Ok(())
    }

    /// Fills in the remote half of the key (and an ephemeral local port, if
    /// none was bound) and returns the finalized key so `Stack::connect` can
    /// install this socket into the established table before the SYN goes
    /// out, closing the race against an early SYN+ACK.
    pub fn finalize_connect_key(&self, ip: Ipv4Addr, port: u16) -> Result<ConnectionKey> {
        let stack = self.stack.upgrade().ok_or(Error::NotConnected)?;
        let mut key = self.key.lock().unwrap();
        if key.local_port == 0 {
            key.local_port = stack.allocate_ephemeral_port(TransportProtocol::Tcp)?;
        }
        if key.local_ip.is_unspecified() {
            key.local_ip = stack.config.claimed_ipv4;
        }
        key.remote_ip = ip;
        key.remote_port = port;
        Ok(*key)
    }

    /// Sends the initial SYN and blocks until the handshake completes (or
    /// the connection dies before it does).
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let stack = self.stack.upgrade().ok_or(Error::NotConnected)?;
        let initial_seq: u32 = rand::thread_rng().gen();
        self.seq.store(initial_seq, Ordering::SeqCst);
        *self.state.lock().unwrap() = State::SynSent;

        let key = self.key();
        if let Err(e) = send_segment(&stack, key, initial_seq, 0, TcpFlags::SYN, &[]) {
            // `Stack::connect` already installed this key in the established
            // table before calling us, to close the race against an early
            // SYN+ACK; undo that so a caller retrying after NoRoute (the
            // same contract as every other send path in the crate) doesn't
            // find its own previous attempt blocking the retry.
            stack.tcp_established_table.remove(&key);
            *self.state.lock().unwrap() = State::Closed;
            return Err(e.into());
        }
        self.seq.store(initial_seq.wrapping_add(1), Ordering::SeqCst);

        let (lock, cvar) = &self.connect_gate;
        let mut ready = lock.lock().unwrap();
        while !*ready {
            ready = cvar.wait(ready).unwrap();
        }
        drop(ready);

        match *self.state.lock().unwrap() {
            State::Established => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let data = if self.nonblocking.load(Ordering::Relaxed) {
            self.inbox.try_pop().ok_or(Error::WouldBlock)?
        } else {
            self.inbox.pop().ok_or(Error::ConnectionClosed)?
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        let stack = self.stack.upgrade().ok_or(Error::NotConnected)?;
        if *self.state.lock().unwrap() != State::Established {
            return Err(Error::NotConnected);
        }
        let key = self.key();
        let seq = self.seq.load(Ordering::SeqCst);
        let ack = self.ack.load(Ordering::SeqCst);
        let flags = if payload.is_empty() {
            TcpFlags::ACK
        } else {
            TcpFlags::ACK | TcpFlags::PSH
        };
        send_segment(&stack, key, seq, ack, flags, payload)?;
        self.seq.fetch_add(payload.len() as u32, Ordering::SeqCst);
        Ok(payload.len())
    }

    /// Active-close entry point: sends a FIN from `Established` or
    /// `CloseWait`, or just drops the table entry from anywhere else (a
    /// handshake that never completed, or a connection already on its way
    /// down from the peer's FIN).
    pub fn close(self: &Arc<Self>) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Established => {
                let key = self.key();
                let seq = self.seq.load(Ordering::SeqCst);
                let ack = self.ack.load(Ordering::SeqCst);
                let _ = send_segment(&stack, key, seq, ack, TcpFlags::FIN | TcpFlags::ACK, &[]);
                self.seq.fetch_add(1, Ordering::SeqCst);
                *state = State::FinWait1;
            }
            State::CloseWait => {
                let key = self.key();
                let seq = self.seq.load(Ordering::SeqCst);
                let ack = self.ack.load(Ordering::SeqCst);
                let _ = send_segment(&stack, key, seq, ack, TcpFlags::FIN | TcpFlags::ACK, &[]);
                self.seq.fetch_add(1, Ordering::SeqCst);
                *state = State::LastAck;
            }
            _ => {
                let key = self.key();
                drop(state);
                stack.tcp_established_table.remove(&key);
            }
        }
    }
}

fn send_segment(
    stack: &Arc<StackShared>,
    key: ConnectionKey,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> TxResult {
    let budget = ETHERNET_HEADER_LEN + IP_HEADER_LEN + TCP_HEADER_LEN;
    let mut pb = PacketBuffer::new(budget + payload.len());
    pb.reserve(budget);
    pb.put(payload.len());
    if !payload.is_empty() {
        pb.payload_mut().copy_from_slice(payload);
    }
    pb.push(TCP_HEADER_LEN);
    {
        let mut header = MutableTcpPacket::new(pb.payload_mut()).unwrap();
        header.set_source(key.local_port);
        header.set_destination(key.remote_port);
        header.set_sequence(seq);
        header.set_acknowledgement(ack);
        header.set_data_offset(5);
        header.set_reserved(0);
        header.set_flags(flags);
        header.set_window(FIXED_WINDOW);
        header.set_urgent_ptr(0);
        header.set_options(&[]);
        header.set_checksum(0);
    }
    let csum = ipv4_checksum(&TcpPacket::new(pb.payload()).unwrap(), &key.local_ip, &key.remote_ip);
    {
        let mut header = MutableTcpPacket::new(pb.payload_mut()).unwrap();
        header.set_checksum(csum);
    }
    pb.endpoint.local_ip = key.local_ip;
    pb.endpoint.remote_ip = key.remote_ip;
    send_ip_packet(stack, IpNextHeaderProtocols::Tcp, pb)
}

pub fn handle_rx(mut pb: PacketBuffer, stack: &Arc<StackShared>) {
    let bytes = pb.payload();
    let Some(packet) = TcpPacket::new(bytes) else {
        trace!("tcp: frame too short to contain a tcp header");
        return;
    };
    let data_offset = packet.get_data_offset() as usize * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > bytes.len() {
        trace!("tcp: dropping segment with inconsistent data offset");
        return;
    }
    if ipv4_checksum(&packet, &pb.endpoint.remote_ip, &pb.endpoint.local_ip) != packet.get_checksum() {
        trace!("tcp: dropping segment with invalid checksum");
        return;
    }

    let src_port = packet.get_source();
    let dst_port = packet.get_destination();
    let seq = packet.get_sequence();
    let ack = packet.get_acknowledgement();
    let flags = packet.get_flags();

    let concrete_key = ConnectionKey {
        local_ip: pb.endpoint.local_ip,
        local_port: dst_port,
        remote_ip: pb.endpoint.remote_ip,
        remote_port: src_port,
        protocol: TransportProtocol::Tcp,
    };

    if let Some(sock) = stack.tcp_established_table.lookup(&concrete_key) {
        pb.pull(data_offset);
        let payload = pb.payload().to_vec();
        process_established(stack, &sock, flags, seq, ack, payload);
        return;
    }

    if let Some(listener) = stack.tcp_listen_table.lookup(&concrete_key) {
        process_listen(stack, &listener, concrete_key, flags, seq);
        return;
    }

    trace!("tcp: no socket for {:?}, dropping segment", concrete_key);
}

fn process_listen(
    stack: &Arc<StackShared>,
    listener: &Arc<TcpListenSocket>,
    key: ConnectionKey,
    flags: u8,
    seq: u32,
) {
    if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK == 0 {
        let mut syn_list = listener.syn_list.lock().unwrap();
        if syn_list.len() >= listener.backlog {
            trace!("tcp: syn list full for {:?}, dropping syn", listener.key);
            return;
        }
        let local_seq: u32 = rand::thread_rng().gen();
        syn_list.insert(key, SynEntry { local_seq, peer_seq: seq });
        drop(syn_list);
        let _ = send_segment(stack, key, local_seq, seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK, &[]);
        return;
    }

    if flags & TcpFlags::ACK != 0 && flags & TcpFlags::SYN == 0 {
        let entry = listener.syn_list.lock().unwrap().remove(&key);
        let Some(entry) = entry else {
            trace!("tcp: ack for unknown syn entry {:?}, dropping", key);
            return;
        };
        if seq != entry.peer_seq.wrapping_add(1) {
            trace!("tcp: unexpected seq completing handshake for {:?}", key);
            return;
        }
        let child = TcpSocket::new_established(
            key,
            entry.local_seq.wrapping_add(1),
            entry.peer_seq.wrapping_add(1),
            Arc::downgrade(stack),
        );
        if stack.tcp_established_table.insert(key, child.clone()).is_ok() {
            listener.accept_queue.push(child);
        }
    }
}

fn process_established(stack: &Arc<StackShared>, sock: &Arc<TcpSocket>, flags: u8, peer_seq: u32, peer_ack: u32, payload: Vec<u8>) {
    let mut state = *sock.state.lock().unwrap();

    if state == State::SynSent {
        if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK != 0 {
            sock.ack.store(peer_seq.wrapping_add(1), Ordering::SeqCst);
            *sock.state.lock().unwrap() = State::Established;
            let key = sock.key();
            let seq = sock.seq.load(Ordering::SeqCst);
            let ack = sock.ack.load(Ordering::SeqCst);
            let _ = send_segment(stack, key, seq, ack, TcpFlags::ACK, &[]);
            let (lock, cvar) = &sock.connect_gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        return;
    }

    if !payload.is_empty() && matches!(state, State::Established | State::FinWait1 | State::FinWait2) {
        sock.ack.store(peer_seq.wrapping_add(payload.len() as u32), Ordering::SeqCst);
        sock.inbox.push(payload);
        let key = sock.key();
        let seq = sock.seq.load(Ordering::SeqCst);
        let ack = sock.ack.load(Ordering::SeqCst);
        let _ = send_segment(stack, key, seq, ack, TcpFlags::ACK, &[]);
    }

    if flags & TcpFlags::FIN != 0 {
        // A FIN can ride on the same segment as data (PSH+FIN+ACK); the
        // byte the FIN itself consumes comes after whatever payload this
        // segment carried, not straight off `peer_seq`.
        let base = peer_seq.wrapping_add(payload.len() as u32);
        let new_ack = base.wrapping_add(1);
        sock.ack.store(new_ack, Ordering::SeqCst);
        let key = sock.key();
        let seq = sock.seq.load(Ordering::SeqCst);
        state = *sock.state.lock().unwrap();
        match state {
            State::Established => {
                *sock.state.lock().unwrap() = State::CloseWait;
                let _ = send_segment(stack, key, seq, new_ack, TcpFlags::ACK, &[]);
                sock.inbox.shutdown();
            }
            State::FinWait1 => {
                *sock.state.lock().unwrap() = State::Closing;
                let _ = send_segment(stack, key, seq, new_ack, TcpFlags::ACK, &[]);
            }
            State::FinWait2 => {
                *sock.state.lock().unwrap() = State::TimeWait;
                let _ = send_segment(stack, key, seq, new_ack, TcpFlags::ACK, &[]);
                schedule_time_wait_eviction(stack, key);
            }
            _ => {}
        }
        return;
    }

    if flags & TcpFlags::ACK != 0 {
        let our_seq = sock.seq.load(Ordering::SeqCst);
        match state {
            State::FinWait1 if peer_ack == our_seq => {
                *sock.state.lock().unwrap() = State::FinWait2;
            }
            State::Closing if peer_ack == our_seq => {
                *sock.state.lock().unwrap() = State::TimeWait;
                let key = sock.key();
                schedule_time_wait_eviction(stack, key);
            }
            State::LastAck if peer_ack == our_seq => {
                *sock.state.lock().unwrap() = State::Closed;
                stack.tcp_established_table.remove(&sock.key());
            }
            _ => {
                // duplicate ack or a bare ack for our last send: no action.
            }
        }
    }
}

fn schedule_time_wait_eviction(stack: &Arc<StackShared>, key: ConnectionKey) {
    let weak = Arc::downgrade(stack);
    std::thread::spawn(move || {
        std::thread::sleep(TIME_WAIT_DURATION);
        if let Some(stack) = weak.upgrade() {
            stack.tcp_established_table.remove(&key);
        }
    });
}
