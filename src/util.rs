//! Small shared helpers: byte order conversions used at the socket API
//! boundary, address parsing, and the Jenkins one-at-a-time hash used to key
//! connections and defrag buckets without pulling in `std`'s randomized
//! `SipHash` for data that is already attacker-influenced-but-bounded (a
//! handful of connections, not an external hashmap DoS surface).

use std::hash::Hasher;
use std::net::Ipv4Addr;

/// `std::hash::Hasher` implementation of Bob Jenkins' "one-at-a-time" hash.
/// Deterministic across runs, which also makes the wildcard-lookup tests in
/// `socket.rs` reproducible.
#[derive(Default)]
pub struct JenkinsHasher(u64);

impl Hasher for JenkinsHasher {
    fn finish(&self) -> u64 {
        let mut hash = self.0;
        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        hash
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut hash = self.0;
        for &byte in bytes {
            hash = hash.wrapping_add(byte as u64);
            hash = hash.wrapping_add(hash << 10);
            hash ^= hash >> 6;
        }
        self.0 = hash;
    }
}

pub type JenkinsBuildHasher = std::hash::BuildHasherDefault<JenkinsHasher>;

/// Parses an IPv4 + port pair out of the 6 bytes POSIX would put in a
/// `sockaddr_in` (address, then port, both network byte order).
pub fn parse_ipv4_sockaddr(bytes: &[u8; 6]) -> (Ipv4Addr, u16) {
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    (ip, port)
}

pub fn write_ipv4_sockaddr(ip: Ipv4Addr, port: u16) -> [u8; 6] {
    let octets = ip.octets();
    let port_bytes = port.to_be_bytes();
    [
        octets[0], octets[1], octets[2], octets[3], port_bytes[0], port_bytes[1],
    ]
}

pub const EPHEMERAL_PORT_START: u16 = 32768;
pub const EPHEMERAL_PORT_END: u16 = 61000;
