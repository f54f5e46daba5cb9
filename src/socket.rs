//! The socket registry (C9): connection keys, the wildcard-aware demux
//! tables UDP and TCP listen sockets are looked up through, and the
//! file-descriptor table the public socket API is built on top of in
//! `stack.rs`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::tcp::{TcpListenSocket, TcpSocket};
use crate::udp::UdpSocket;
use crate::util::JenkinsBuildHasher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// The 5-tuple identifying a flow. Equality as a plain `HashMap` key (used
/// by the concrete tier of `ConnectionTable`) is the full tuple; wildcard
/// matching (used by the secondary tier) is `matches`, below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub protocol: TransportProtocol,
}

impl ConnectionKey {
    pub fn new(protocol: TransportProtocol) -> Self {
        ConnectionKey {
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            protocol,
        }
    }

    /// A key with any wildcard field (`0.0.0.0` on either IP, or port `0`
    /// on the remote side) is stored in the secondary, linearly-scanned
    /// tier of `ConnectionTable` rather than the exact-match `HashMap`.
    pub fn has_wildcard(&self) -> bool {
        self.local_ip.is_unspecified() || self.remote_ip.is_unspecified() || self.remote_port == 0
    }

    /// `self` is a stored (possibly wildcarded) key; `concrete` is the key
    /// of an arriving packet. A zero field in `self` matches anything in
    /// `concrete`; `local_port` is never a wildcard.
    pub fn matches(&self, concrete: &ConnectionKey) -> bool {
        self.protocol == concrete.protocol
            && self.local_port == concrete.local_port
            && (self.local_ip.is_unspecified() || self.local_ip == concrete.local_ip)
            && (self.remote_ip.is_unspecified() || self.remote_ip == concrete.remote_ip)
            && (self.remote_port == 0 || self.remote_port == concrete.remote_port)
    }
}

/// Demux table keyed by `ConnectionKey` with wildcard-aware lookup: exact
/// keys live in a `HashMap` (hashed with the Jenkins hasher, see `util.rs`);
/// keys carrying a wildcard field live in a small linearly-scanned list,
/// checked only once the concrete tier misses. In practice the wildcard
/// tier only ever holds a handful of listening sockets, so the two-tier
/// split the spec calls for (rather than a single hash bucketed on the
/// non-wildcard quadruple) stays cheap and avoids false positives.
pub struct ConnectionTable<V> {
    concrete: RwLock<HashMap<ConnectionKey, V, JenkinsBuildHasher>>,
    wildcard: RwLock<Vec<(ConnectionKey, V)>>,
}

impl<V: Clone> ConnectionTable<V> {
    pub fn new() -> Self {
        ConnectionTable {
            concrete: RwLock::new(HashMap::default()),
            wildcard: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, key: ConnectionKey, value: V) -> Result<(), Error> {
        if key.has_wildcard() {
            let mut wildcard = self.wildcard.write().unwrap();
            if wildcard.iter().any(|(k, _)| *k == key) {
                return Err(Error::AddrInUse);
            }
            wildcard.push((key, value));
        } else {
            let mut concrete = self.concrete.write().unwrap();
            if concrete.contains_key(&key) {
                return Err(Error::AddrInUse);
            }
            concrete.insert(key, value);
        }
        Ok(())
    }

    /// Concrete-first lookup: an exact match always wins over a wildcard
    /// one, same precedence POSIX stacks give a connected socket over a
    /// listening one on the same port.
    pub fn lookup(&self, key: &ConnectionKey) -> Option<V> {
        if let Some(v) = self.concrete.read().unwrap().get(key) {
            return Some(v.clone());
        }
        self.wildcard
            .read()
            .unwrap()
            .iter()
            .find(|(k, _)| k.matches(key))
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &ConnectionKey) -> Option<V> {
        if let Some(v) = self.concrete.write().unwrap().remove(key) {
            return Some(v);
        }
        let mut wildcard = self.wildcard.write().unwrap();
        if let Some(pos) = wildcard.iter().position(|(k, _)| k == key) {
            return Some(wildcard.remove(pos).1);
        }
        None
    }

    pub fn contains_local_port(&self, protocol: TransportProtocol, port: u16) -> bool {
        let concrete_hit = self
            .concrete
            .read()
            .unwrap()
            .keys()
            .any(|k| k.protocol == protocol && k.local_port == port);
        if concrete_hit {
            return true;
        }
        self.wildcard
            .read()
            .unwrap()
            .iter()
            .any(|(k, _)| k.protocol == protocol && k.local_port == port)
    }
}

impl<V: Clone> Default for ConnectionTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Any one of the three socket flavors a file descriptor can refer to.
#[derive(Clone)]
pub enum SocketHandle {
    Udp(Arc<UdpSocket>),
    TcpListen(Arc<TcpListenSocket>),
    Tcp(Arc<TcpSocket>),
}

/// Maps the small integer file descriptors handed to callers back to the
/// socket object backing them. The key itself lives inside each socket
/// object (`UdpSocket::key`/`TcpSocket::key`); this table is purely the
/// fd-to-object direction.
#[derive(Default)]
pub struct FdTable {
    next_fd: std::sync::atomic::AtomicI32,
    entries: RwLock<HashMap<i32, SocketHandle>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            next_fd: std::sync::atomic::AtomicI32::new(3),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: SocketHandle) -> i32 {
        let fd = self
            .next_fd
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.entries.write().unwrap().insert(fd, handle);
        fd
    }

    pub fn get(&self, fd: i32) -> Option<SocketHandle> {
        self.entries.read().unwrap().get(&fd).cloned()
    }

    /// Swaps the handle backing an existing fd in place, used by `listen`
    /// to turn a bound TCP socket into a `TcpListenSocket` without handing
    /// the caller a new fd.
    pub fn replace(&self, fd: i32, handle: SocketHandle) {
        self.entries.write().unwrap().insert(fd, handle);
    }

    pub fn remove(&self, fd: i32) -> Option<SocketHandle> {
        self.entries.write().unwrap().remove(&fd)
    }
}
