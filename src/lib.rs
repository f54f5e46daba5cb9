// Copyright (c) 2016 Linus Färnstrand <faern@faern.net>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A userspace TCP/IP stack over a raw Ethernet device: ARP, IPv4 with
//! fragmentation and reassembly, ICMP echo, UDP, and TCP, exposed through a
//! small BSD-socket-flavored API (`Stack::socket_udp`, `bind`, `listen`,
//! `accept`, `connect`, `read`/`write`, `recvfrom`/`sendto`, `close`).
//!
//! ## Layering
//!
//! A `Device` owns the raw L2 socket and runs RX/TX on their own threads,
//! moving frames through bounded FIFOs. A per-stack dispatch thread drains
//! the RX FIFO and demultiplexes: Ethernet to ARP or IP, IP to ICMP/UDP/TCP.
//! Every layer operates on the same `PacketBuffer` allocation in place
//! rather than copying between per-layer buffers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use pnet::util::MacAddr;
//! use rawstack::{Stack, StackConfig};
//!
//! let config = StackConfig::new(
//!     "eth0",
//!     Ipv4Addr::new(192, 168, 1, 50),
//!     MacAddr::new(0x02, 0, 0, 0, 0, 1),
//! );
//! let stack = Stack::up(config).expect("failed to bring interface up");
//! let fd = stack.socket_udp();
//! stack.bind(fd, Ipv4Addr::new(192, 168, 1, 50), 9000).unwrap();
//! ```

mod arp;
mod buffer;
mod device;
mod error;
mod icmp;
mod ip;
mod neighbor;
mod socket;
mod stack;
mod tcp;
mod udp;
mod util;

/// An in-memory `DeviceTransport` for driving a whole `Stack` without a
/// real NIC. Public so downstream integration tests (and this crate's own,
/// under `tests/`) can use it; not part of the socket-facing API proper.
pub mod testing;

pub use buffer::{checksum, checksum_valid};
pub use device::DeviceTransport;
pub use error::{Error, Result, RxError, TxError, TxResult};
pub use socket::TransportProtocol;
pub use stack::{Stack, StackConfig};
