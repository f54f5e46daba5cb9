//! The stack façade (C10): wires the device, neighbor table, socket tables
//! and fd table together, spawns the per-device dispatch thread, and
//! exposes the POSIX-flavored socket API described in SPEC_FULL.md §6.
//!
//! Grounded on `StackInterface`/`NetworkStack` in the teacher's `stack.rs`
//! for the overall shape (one struct owning every table, a background
//! thread driving RX, `Drop` tearing the threads down), generalized from
//! "per attached IPv4 network" to the single claimed address this spec
//! calls for (see SPEC_FULL.md §6, "a single Ethernet interface by name").

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI32, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{trace, warn};
use pnet::util::MacAddr;

use crate::arp;
use crate::buffer::{PacketBuffer, Protocol};
use crate::device::{Device, DeviceTransport, PnetTransport};
use crate::error::{Error, Result};
use crate::icmp;
use crate::ip;
use crate::neighbor::NeighborTable;
use crate::socket::{ConnectionKey, ConnectionTable, FdTable, SocketHandle, TransportProtocol};
use crate::tcp::{self, TcpListenSocket, TcpSocket};
use crate::udp::{self, UdpSocket};
use crate::util::{EPHEMERAL_PORT_END, EPHEMERAL_PORT_START};

/// `(interface_name, claimed_ipv4, synthesized_mac, mtu)` — constructed
/// directly by the embedder, per SPEC_FULL.md §3 "Stack configuration
/// (ambient)". No config-file parsing; that belongs to the out-of-scope
/// bootstrap shim.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub interface_name: String,
    pub claimed_ipv4: Ipv4Addr,
    pub mac: MacAddr,
    pub mtu: usize,
}

impl StackConfig {
    pub fn new(interface_name: impl Into<String>, claimed_ipv4: Ipv4Addr, mac: MacAddr) -> Self {
        StackConfig {
            interface_name: interface_name.into(),
            claimed_ipv4,
            mac,
            mtu: crate::device::DEFAULT_MTU,
        }
    }
}

/// Everything the stack owns, shared by `Arc` with every child (socket,
/// handler) holding only a `Weak` back-reference to it (see SPEC_FULL.md
/// §9 "Cyclic references" — the façade is the single root).
pub struct StackShared {
    pub config: StackConfig,
    pub device: Arc<Device>,
    pub neighbors: NeighborTable,
    pub udp_table: ConnectionTable<Arc<UdpSocket>>,
    pub tcp_listen_table: ConnectionTable<Arc<TcpListenSocket>>,
    pub tcp_established_table: ConnectionTable<Arc<TcpSocket>>,
    pub fds: FdTable,
    pub reassembly: ip::ReassemblyTable,
    ip_ident: AtomicU16,
    next_ephemeral_port: AtomicU16,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StackShared {
    pub fn next_ip_identification(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Picks an unused local port in the ephemeral range for `protocol`,
    /// same range the teacher's `stack.rs` used for UDP
    /// (`LOCAL_PORT_RANGE_START..LOCAL_PORT_RANGE_END`), generalized to
    /// also cover TCP.
    pub fn allocate_ephemeral_port(&self, protocol: TransportProtocol) -> Result<u16> {
        let table_has_port = |port: u16| match protocol {
            TransportProtocol::Udp => self.udp_table.contains_local_port(protocol, port),
            TransportProtocol::Tcp => {
                self.tcp_established_table.contains_local_port(protocol, port)
                    || self.tcp_listen_table.contains_local_port(protocol, port)
            }
        };
        let span = EPHEMERAL_PORT_END - EPHEMERAL_PORT_START;
        for _ in 0..span {
            let port = EPHEMERAL_PORT_START
                + (self.next_ephemeral_port.fetch_add(1, Ordering::Relaxed) % span);
            if !table_has_port(port) {
                return Ok(port);
            }
        }
        Err(Error::AddrInUse)
    }
}

impl Drop for StackShared {
    fn drop(&mut self) {
        self.device.shutdown();
        if let Some(handle) = self.dispatch_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// A handle to a running stack. Cloning shares the same underlying
/// `StackShared`; the last clone to drop tears down the dispatch thread
/// and the device.
#[derive(Clone)]
pub struct Stack(Arc<StackShared>);

impl Stack {
    /// Opens the named interface through `pnet::datalink` and brings the
    /// stack up on it.
    pub fn up(config: StackConfig) -> io::Result<Stack> {
        let (transport, _mac) = PnetTransport::open(&config.interface_name)?;
        Ok(Self::up_with_transport(config, Box::new(transport)))
    }

    /// Brings the stack up on an arbitrary `DeviceTransport`; production
    /// code uses `up`, tests plug in an in-memory transport here.
    pub fn up_with_transport(config: StackConfig, transport: Box<dyn DeviceTransport>) -> Stack {
        let device = Device::up(
            config.interface_name.clone(),
            config.mac,
            config.mtu,
            transport,
        );
        let shared = Arc::new(StackShared {
            config,
            device,
            neighbors: NeighborTable::new(),
            udp_table: ConnectionTable::new(),
            tcp_listen_table: ConnectionTable::new(),
            tcp_established_table: ConnectionTable::new(),
            fds: FdTable::new(),
            reassembly: ip::ReassemblyTable::new(),
            ip_ident: AtomicU16::new(1),
            next_ephemeral_port: AtomicU16::new(0),
            dispatch_thread: Mutex::new(None),
        });

        let dispatch_shared = shared.clone();
        let handle = thread::spawn(move || run_dispatch(dispatch_shared));
        *shared.dispatch_thread.lock().unwrap() = Some(handle);

        Stack(shared)
    }

    pub fn shared(&self) -> &Arc<StackShared> {
        &self.0
    }

    pub fn claimed_ipv4(&self) -> Ipv4Addr {
        self.0.config.claimed_ipv4
    }

    // ---- Socket registry (C9) -------------------------------------------

    pub fn socket_udp(&self) -> i32 {
        let sock = Arc::new(UdpSocket::new(Arc::downgrade(&self.0)));
        self.0.fds.insert(SocketHandle::Udp(sock))
    }

    pub fn socket_tcp(&self) -> i32 {
        let sock = Arc::new(TcpSocket::new_unconnected(Arc::downgrade(&self.0)));
        self.0.fds.insert(SocketHandle::Tcp(sock))
    }

    pub fn bind(&self, fd: i32, ip: Ipv4Addr, port: u16) -> Result<()> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Udp(sock) => {
                sock.bind(ip, port)?;
                self.0.udp_table.insert(sock.key(), sock)
            }
            SocketHandle::Tcp(sock) => {
                sock.bind(ip, port)?;
                Ok(())
            }
            SocketHandle::TcpListen(_) => Err(Error::InvalidArgument),
        }
    }

    /// Turns a bound TCP fd into a listener, materializing its SYN list
    /// and accept queue and replacing its fd-table entry (SPEC_FULL.md
    /// §4.9: "for TCP, also materializes a LISTEN sock").
    pub fn listen(&self, fd: i32, backlog: usize) -> Result<()> {
        let sock = match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Tcp(sock) => sock,
            _ => return Err(Error::InvalidArgument),
        };
        let listener = Arc::new(TcpListenSocket::new(
            sock.key(),
            backlog,
            Arc::downgrade(&self.0),
        ));
        self.0.tcp_listen_table.insert(listener.key, listener.clone())?;
        self.0
            .fds
            .replace(fd, SocketHandle::TcpListen(listener));
        Ok(())
    }

    pub fn accept(&self, fd: i32) -> Result<i32> {
        let listener = match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::TcpListen(listener) => listener,
            _ => return Err(Error::InvalidArgument),
        };
        let child = listener.accept()?;
        Ok(self.0.fds.insert(SocketHandle::Tcp(child)))
    }

    pub fn connect(&self, fd: i32, ip: Ipv4Addr, port: u16) -> Result<()> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Udp(sock) => sock.connect(ip, port),
            SocketHandle::Tcp(sock) => {
                self.0.tcp_established_table.insert(sock.finalize_connect_key(ip, port)?, sock.clone())?;
                sock.connect()
            }
            SocketHandle::TcpListen(_) => Err(Error::InvalidArgument),
        }
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Tcp(sock) => sock.read(buf),
            SocketHandle::Udp(sock) => sock.recvfrom(buf).map(|(n, _, _)| n),
            SocketHandle::TcpListen(_) => Err(Error::NotConnected),
        }
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Tcp(sock) => sock.write(buf),
            SocketHandle::Udp(_) => Err(Error::NotConnected),
            SocketHandle::TcpListen(_) => Err(Error::NotConnected),
        }
    }

    pub fn recvfrom(&self, fd: i32, buf: &mut [u8]) -> Result<(usize, Ipv4Addr, u16)> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Udp(sock) => sock.recvfrom(buf),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn sendto(&self, fd: i32, buf: &[u8], ip: Ipv4Addr, port: u16) -> Result<usize> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Udp(sock) => sock.sendto(buf, ip, port),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn set_nonblocking(&self, fd: i32, nonblocking: bool) -> Result<()> {
        match self.0.fds.get(fd).ok_or(Error::InvalidArgument)? {
            SocketHandle::Udp(sock) => sock.set_nonblocking(nonblocking),
            SocketHandle::Tcp(sock) => sock.set_nonblocking(nonblocking),
            SocketHandle::TcpListen(sock) => sock.set_nonblocking(nonblocking),
        }
        Ok(())
    }

    pub fn close(&self, fd: i32) -> Result<()> {
        let handle = self.0.fds.remove(fd).ok_or(Error::InvalidArgument)?;
        match handle {
            SocketHandle::Udp(sock) => {
                self.0.udp_table.remove(&sock.key());
            }
            SocketHandle::Tcp(sock) => sock.close(),
            SocketHandle::TcpListen(listener) => {
                self.0.tcp_listen_table.remove(&listener.key);
                listener.shutdown();
            }
        }
        Ok(())
    }

    /// Sends a next-hop-resolved Ethernet/ARP probe as a side effect of a
    /// failed neighbor lookup; never blocks (SPEC_FULL.md §4.4).
    pub fn send_arp_request(&self, target_ip: Ipv4Addr) {
        arp::send_request(&self.0, target_ip);
    }
}

fn run_dispatch(shared: Arc<StackShared>) {
    let weak: Weak<StackShared> = Arc::downgrade(&shared);
    loop {
        let Some(mut pb) = shared.device.rx_queue.pop() else {
            break;
        };
        pb.stack = Some(weak.clone());
        dispatch_rx(&shared, pb);
    }
}

/// Ethernet demux (the second stage of "Device → Ethernet demux → (ARP |
/// IP)" in SPEC_FULL.md §2).
fn dispatch_rx(shared: &Arc<StackShared>, pb: PacketBuffer) {
    match pb.protocol {
        Protocol::Arp => arp::handle_rx(pb, shared),
        Protocol::Ipv4 => ip::handle_rx(pb, shared),
        Protocol::Icmp | Protocol::Udp | Protocol::Tcp | Protocol::Unknown => {
            trace!("dispatch_rx: dropping frame with no ethernet-level handler");
        }
    }
}

/// Transport → IP → neighbor lookup → device, i.e. the mirror of
/// `dispatch_rx` for the TX side. Shared by `icmp.rs`, `udp.rs`, `tcp.rs`
/// so each framer only ever builds its own header before handing off here.
pub fn send_ip_packet(
    shared: &Arc<StackShared>,
    next_level_protocol: pnet::packet::ip::IpNextHeaderProtocol,
    pb: PacketBuffer,
) -> crate::error::TxResult {
    ip::send(shared, next_level_protocol, pb)
}

/// Looks up (or requests) the next-hop MAC for `dst_ip` and, on success,
/// stamps it into `pb.endpoint.remote_mac` and hands the frame to the
/// device TX FIFO. On a miss, issues an ARP request and drops `pb`
/// (SPEC_FULL.md §7(d): "the caller must retry").
pub fn route_and_send(
    shared: &Arc<StackShared>,
    dst_ip: Ipv4Addr,
    mut pb: PacketBuffer,
) -> crate::error::TxResult {
    match shared.neighbors.get(dst_ip) {
        Some(entry) => {
            if pb.fragments.is_empty() {
                pb.endpoint.remote_mac = entry.mac;
            } else {
                for fragment in pb.fragments.iter_mut() {
                    fragment.endpoint.remote_mac = entry.mac;
                }
            }
            entry.device.write_to_device(pb);
            Ok(())
        }
        None => {
            warn!("route_and_send: no neighbor for {}, issuing arp request", dst_ip);
            arp::send_request(shared, dst_ip);
            Err(crate::error::TxError::NoRoute)
        }
    }
}
