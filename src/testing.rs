//! An in-memory `DeviceTransport` used by this crate's own integration
//! tests to drive the whole stack without a real NIC, plus a pair-wiring
//! helper so two `Stack`s can talk to each other across a mock wire.
//!
//! Grounded on `tests/mockpnet/mod.rs` in the teacher tree (a channel-backed
//! fake `EthernetProvider`) and `testing/ethernet.rs`'s channel-backed fake
//! `EthernetTx`, both reworked against this crate's `DeviceTransport` trait
//! instead of a `pnet::datalink::Channel` substitute.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::device::DeviceTransport;

/// How long `MockTransport::recv` waits for a frame before returning an
/// empty one. The device's RX loop only checks `is_up()` between calls to
/// `recv`, so this is what lets a shut-down stack's RX thread notice and
/// exit instead of blocking forever on a channel nothing will ever send on
/// again (the real `pnet::datalink` backend doesn't need this: closing the
/// fd interrupts its blocking read directly).
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One end of an in-memory Ethernet wire: frames `send` puts on this end
/// arrive as `recv` results on the paired `MockTransport`.
pub struct MockTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MockTransport {
    /// Builds a connected pair, as if two `Device`s shared a crossover
    /// cable: frames sent on `a` are received on `b` and vice versa.
    pub fn pair() -> (MockTransport, MockTransport) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            MockTransport { tx: a_tx, rx: a_rx },
            MockTransport { tx: b_tx, rx: b_rx },
        )
    }
}

impl DeviceTransport for MockTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))
    }

    fn recv(&mut self) -> io::Result<Vec<u8>> {
        match self.rx.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(frame) => Ok(frame),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))
            }
        }
    }
}
