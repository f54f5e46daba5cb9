//! Error taxonomy for the stack, layered by where each kind of failure
//! becomes visible.
//!
//! `RxError` never crosses the socket API boundary: it only classifies why a
//! packet was silently dropped on the receive path (see `errors.rs` in the
//! original librips tree for the shape this is grounded on). `TxError` is
//! returned by internal send paths. `Error` is the crate-level enum returned
//! by the public socket-facing API.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Why an inbound packet was dropped. Logged and counted, never propagated
/// to a caller.
#[derive(Debug, Eq, PartialEq)]
pub enum RxError {
    /// Nothing is listening for this packet (unknown ether type, protocol,
    /// port, or connection key).
    NoListener(String),
    /// A checksum in the packet did not match the computed value.
    InvalidChecksum,
    /// A length field did not match the amount of data actually present.
    InvalidLength,
    /// Other structurally invalid content (bad fragment sequencing, etc).
    InvalidContent,
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RxError::NoListener(s) => write!(f, "no listener for packet: {}", s),
            RxError::InvalidChecksum => write!(f, "invalid checksum in packet"),
            RxError::InvalidLength => write!(f, "invalid length field in packet"),
            RxError::InvalidContent => write!(f, "invalid content in packet"),
        }
    }
}

impl StdError for RxError {}

/// Errors from the internal send path (building and handing a packet to a
/// device).
#[derive(Debug)]
pub enum TxError {
    /// There is no known MAC address for the next hop. An ARP request has
    /// been issued as a side effect; the caller must retry.
    NoRoute,
    /// The payload does not fit the protocol's length field.
    TooLargePayload,
    /// The originating device is down.
    DeviceDown,
    /// An I/O error occurred while writing to the device.
    Io(io::Error),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxError::NoRoute => write!(f, "no route to host (arp pending)"),
            TxError::TooLargePayload => write!(f, "payload too large for protocol"),
            TxError::DeviceDown => write!(f, "device is down"),
            TxError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl StdError for TxError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TxError {
    fn from(e: io::Error) -> Self {
        TxError::Io(e)
    }
}

/// Crate-level error returned at the socket API boundary.
#[derive(Debug)]
pub enum Error {
    /// The non-blocking socket has nothing ready right now.
    WouldBlock,
    /// The socket is not in a state where this operation is legal
    /// (e.g. `write` before `connect`/`accept`).
    NotConnected,
    /// The requested local address is already bound by another socket.
    AddrInUse,
    /// An argument was structurally invalid (e.g. binding an unknown fd).
    InvalidArgument,
    /// No device exists for the destination address.
    NoRoute,
    /// The remote end reset or closed the connection.
    ConnectionClosed,
    /// Low-level I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::NotConnected => write!(f, "socket not connected"),
            Error::AddrInUse => write!(f, "address already in use"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NoRoute => write!(f, "no route to host"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        match e {
            TxError::NoRoute => Error::NoRoute,
            TxError::TooLargePayload => Error::InvalidArgument,
            TxError::DeviceDown => Error::Io(io::Error::new(io::ErrorKind::NotConnected, "device down")),
            TxError::Io(e) => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, "would block"),
            Error::NotConnected => io::Error::new(io::ErrorKind::NotConnected, "not connected"),
            Error::AddrInUse => io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            Error::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, "invalid argument"),
            Error::NoRoute => io::Error::new(io::ErrorKind::NotFound, "no route to host"),
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::ConnectionReset, "connection closed"),
            Error::Io(e) => e,
        }
    }
}

pub type RxResult = Result<(), RxError>;
pub type TxResult = Result<(), TxError>;
pub type Result<T> = std::result::Result<T, Error>;
