//! The device adapter (C2): a raw L2 socket wrapped in a pair of
//! byte-oriented blocking queues, one per direction. This is treated as an
//! external collaborator by the rest of the stack (see SPEC_FULL.md §1) —
//! the production backend is `pnet::datalink`, but anything implementing
//! `DeviceTransport` plugs in the same way, which is how `testing.rs` feeds
//! synthetic frames through the whole stack without a real NIC.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};
use pnet::datalink;
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;

use crate::buffer::{PacketBuffer, Protocol};

/// How long a FIFO consumer blocks before re-checking for shutdown. The
/// source this was distilled from used roughly 10s; any positive bound is
/// correct, this one just keeps test teardown snappy.
const FIFO_GRACE: Duration = Duration::from_secs(10);

/// A single-producer/single-consumer (per direction) bounded FIFO backed by
/// a mutex and a condition variable, exactly as required by the concurrency
/// model: "Each FIFO is paired with a mutex and a condition variable; the
/// consumer waits with timeout ... to allow shutdown polling."
pub struct Fifo<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Self {
        Fifo {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            not_empty: Condvar::new(),
            capacity,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues `item`, dropping the oldest entry if the FIFO is already at
    /// capacity (a slow consumer should not be able to grow memory use
    /// without bound).
    pub fn push(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the FIFO is shut down, in which
    /// case `None` is returned so a waiting thread can unwind cleanly.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _timeout_result) =
                self.not_empty.wait_timeout(queue, FIFO_GRACE).unwrap();
            queue = guard;
        }
    }

    /// Non-blocking pop used by non-blocking sockets: returns immediately.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

/// Seam between the device adapter and whatever moves raw Ethernet frames
/// on and off the wire. Implemented for `pnet::datalink` in production and
/// for an in-memory channel pair in tests (`testing::MockTransport`).
pub trait DeviceTransport: Send {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    fn recv(&mut self) -> io::Result<Vec<u8>>;
}

/// Production transport: a raw L2 socket opened through `pnet::datalink`.
pub struct PnetTransport {
    tx: Box<dyn datalink::DataLinkSender>,
    rx: Box<dyn datalink::DataLinkReceiver>,
}

impl PnetTransport {
    pub fn open(interface_name: &str) -> io::Result<(Self, MacAddr)> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface_name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such interface"))?;
        let mac = interface
            .mac
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "interface has no MAC"))?;
        let config = datalink::Config::default();
        match datalink::channel(&interface, config)? {
            datalink::Channel::Ethernet(tx, rx) => Ok((PnetTransport { tx, rx }, mac)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not an ethernet channel")),
        }
    }
}

impl DeviceTransport for PnetTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(io::ErrorKind::Other, "insufficient buffer space")),
        }
    }

    fn recv(&mut self) -> io::Result<Vec<u8>> {
        self.rx.next().map(|frame| frame.to_vec())
    }
}

pub const ETHERNET_HEADER_LEN: usize = 14;

/// Default MTU used by `StackConfig` when the embedder doesn't override it.
pub const DEFAULT_MTU: usize = 1500;

/// One physical (or mock) interface the stack is attached to. Owns the two
/// FIFOs and the pair of threads that move bytes across them; everything
/// above this layer only ever touches the FIFOs.
pub struct Device {
    pub name: String,
    pub mac: MacAddr,
    pub mtu: usize,
    up: AtomicBool,
    pub rx_queue: Fifo<PacketBuffer>,
    pub tx_queue: Fifo<PacketBuffer>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    tx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Opens the device and spawns its RX and TX threads. `transport` is
    /// consumed by the two threads; `DeviceTransport::send`/`recv` are the
    /// only operations either thread performs on it.
    pub fn up(
        name: String,
        mac: MacAddr,
        mtu: usize,
        transport: Box<dyn DeviceTransport>,
    ) -> Arc<Device> {
        let device = Arc::new(Device {
            name: name.clone(),
            mac,
            mtu,
            up: AtomicBool::new(true),
            rx_queue: Fifo::new(1024),
            tx_queue: Fifo::new(1024),
            rx_thread: Mutex::new(None),
            tx_thread: Mutex::new(None),
        });

        // RX and TX run on separate threads but share the one transport:
        // our trait exposes `send`/`recv` on a single object rather than a
        // pre-split sender/receiver pair, so the two threads coordinate
        // through a mutex instead. Actual raw-socket backends (pnet) make
        // this effectively uncontended since send and recv touch disjoint
        // kernel buffers.
        let transport = Arc::new(Mutex::new(transport));

        let rx_device = device.clone();
        let rx_transport = transport.clone();
        let rx_name = name.clone();
        let rx_handle = thread::spawn(move || run_rx(rx_device, rx_transport, rx_name));

        let tx_device = device.clone();
        let tx_handle = thread::spawn(move || run_tx(tx_device, transport, name));

        *device.rx_thread.lock().unwrap() = Some(rx_handle);
        *device.tx_thread.lock().unwrap() = Some(tx_handle);
        device
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Proactively tears the device down: stops accepting new work on
    /// either FIFO and wakes any thread blocked on them. Called by the
    /// stack façade on shutdown, in addition to the same thing happening
    /// implicitly if an RX/TX thread hits an I/O error on its own.
    pub fn shutdown(&self) {
        self.mark_down();
    }

    fn mark_down(&self) {
        self.up.store(false, Ordering::Release);
        self.rx_queue.shutdown();
        self.tx_queue.shutdown();
    }

    /// Hands a packet (and, in order, every pre-built child fragment) to the
    /// TX FIFO for the TX thread to stamp an Ethernet header onto and send.
    pub fn write_to_device(&self, mut pb: PacketBuffer) {
        let fragments = std::mem::take(&mut pb.fragments);
        if fragments.is_empty() {
            self.tx_queue.push(pb);
        } else {
            for fragment in fragments {
                self.tx_queue.push(fragment);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.mark_down();
        if let Some(handle) = self.rx_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tx_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_rx(device: Arc<Device>, transport: Arc<Mutex<Box<dyn DeviceTransport>>>, name: String) {
    loop {
        if !device.is_up() {
            break;
        }
        let frame = {
            let mut transport = transport.lock().unwrap();
            transport.recv()
        };
        match frame {
            Ok(bytes) => {
                if let Some(pb) = parse_ethernet_frame(&bytes, device.mac) {
                    device.rx_queue.push(pb);
                }
            }
            Err(e) => {
                error!("device {}: rx error, marking down: {}", name, e);
                device.mark_down();
                break;
            }
        }
    }
    debug!("device {} rx thread exiting", name);
}

fn run_tx(device: Arc<Device>, transport: Arc<Mutex<Box<dyn DeviceTransport>>>, name: String) {
    loop {
        let Some(pb) = device.tx_queue.pop() else {
            break;
        };
        let frame = build_ethernet_frame(&device, &pb);
        let result = {
            let mut transport = transport.lock().unwrap();
            transport.send(&frame)
        };
        if let Err(e) = result {
            error!("device {}: tx error, marking down: {}", name, e);
            device.mark_down();
            break;
        }
        trace!("device {}: sent {} byte frame", name, frame.len());
    }
    debug!("device {} tx thread exiting", name);
}

/// Parses a raw Ethernet frame read off the wire into a `PacketBuffer` with
/// the 14-byte header already pulled off. Frames not addressed to us
/// (unicast or broadcast) are discarded here, same as the device RX thread
/// contract in SPEC_FULL.md §4.2.
fn parse_ethernet_frame(bytes: &[u8], our_mac: MacAddr) -> Option<PacketBuffer> {
    let eth = EthernetPacket::new(bytes)?;
    let dst = eth.get_destination();
    if dst != our_mac && dst != MacAddr::broadcast() {
        return None;
    }
    let ethertype = eth.get_ethertype();
    let mut pb = PacketBuffer::new(bytes.len());
    pb.put(bytes.len());
    pb.payload_mut().copy_from_slice(bytes);
    pb.endpoint.remote_mac = eth.get_source();
    pb.endpoint.local_mac = dst;
    pb.protocol = protocol_for_ethertype(ethertype);
    pb.pull(ETHERNET_HEADER_LEN);
    Some(pb)
}

fn protocol_for_ethertype(ethertype: EtherType) -> Protocol {
    match ethertype {
        EtherTypes::Arp => Protocol::Arp,
        EtherTypes::Ipv4 => Protocol::Ipv4,
        _ => Protocol::Unknown,
    }
}

fn ethertype_for_protocol(protocol: Protocol) -> EtherType {
    match protocol {
        Protocol::Arp => EtherTypes::Arp,
        Protocol::Ipv4 | Protocol::Icmp | Protocol::Udp | Protocol::Tcp => EtherTypes::Ipv4,
        Protocol::Unknown => EtherTypes::Ipv4,
    }
}

/// Builds the final on-wire frame for a packet waiting in the TX FIFO: push
/// a 14-byte Ethernet header in front of the live window (dst taken from the
/// packet's endpoint, src from the device's own MAC) and return the whole
/// thing as owned bytes ready to hand to the transport.
fn build_ethernet_frame(device: &Device, pb: &PacketBuffer) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + pb.len()];
    {
        let mut header = MutableEthernetPacket::new(&mut frame[..]).unwrap();
        header.set_destination(pb.endpoint.remote_mac);
        header.set_source(device.mac);
        header.set_ethertype(ethertype_for_protocol(pb.protocol));
    }
    frame[ETHERNET_HEADER_LEN..].copy_from_slice(pb.payload());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unicast_frame_and_strips_header() {
        let our_mac = MacAddr::new(0xf6, 0x34, 0x95, 0x26, 0x90, 0x66);
        let mut frame = vec![0u8; 18];
        {
            let mut header = MutableEthernetPacket::new(&mut frame[..]).unwrap();
            header.set_destination(our_mac);
            header.set_source(MacAddr::new(1, 2, 3, 4, 5, 6));
            header.set_ethertype(EtherTypes::Ipv4);
        }
        let pb = parse_ethernet_frame(&frame, our_mac).unwrap();
        assert_eq!(pb.len(), 4);
        assert_eq!(pb.protocol, Protocol::Ipv4);
        assert_eq!(pb.endpoint.remote_mac, MacAddr::new(1, 2, 3, 4, 5, 6));
    }

    #[test]
    fn drops_frame_for_other_unicast() {
        let our_mac = MacAddr::new(0xf6, 0x34, 0x95, 0x26, 0x90, 0x66);
        let other_mac = MacAddr::new(1, 1, 1, 1, 1, 1);
        let mut frame = vec![0u8; 18];
        {
            let mut header = MutableEthernetPacket::new(&mut frame[..]).unwrap();
            header.set_destination(other_mac);
            header.set_source(MacAddr::new(1, 2, 3, 4, 5, 6));
            header.set_ethertype(EtherTypes::Ipv4);
        }
        assert!(parse_ethernet_frame(&frame, our_mac).is_none());
    }

    #[test]
    fn accepts_broadcast_frame() {
        let our_mac = MacAddr::new(0xf6, 0x34, 0x95, 0x26, 0x90, 0x66);
        let mut frame = vec![0u8; 18];
        {
            let mut header = MutableEthernetPacket::new(&mut frame[..]).unwrap();
            header.set_destination(MacAddr::broadcast());
            header.set_source(MacAddr::new(1, 2, 3, 4, 5, 6));
            header.set_ethertype(EtherTypes::Arp);
        }
        let pb = parse_ethernet_frame(&frame, our_mac).unwrap();
        assert_eq!(pb.protocol, Protocol::Arp);
    }

    #[test]
    fn fifo_blocks_then_delivers() {
        let fifo: Arc<Fifo<u32>> = Arc::new(Fifo::new(4));
        let consumer = fifo.clone();
        let handle = thread::spawn(move || consumer.pop());
        thread::sleep(Duration::from_millis(20));
        fifo.push(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn fifo_pop_returns_none_after_shutdown() {
        let fifo: Fifo<u32> = Fifo::new(4);
        fifo.shutdown();
        assert_eq!(fifo.pop(), None);
    }
}
