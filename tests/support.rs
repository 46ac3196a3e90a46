//! `std`-only test doubles for this crate's two external collaborator
//! traits. Grounded on the sibling DHCP crate's `tests/end_to_end.rs`
//! convention of driving the FSM
//! against an in-process fake of the hardware boundary rather than real
//! hardware or a real socket.
//!
//! Run with `cargo test --features std` — this crate is `no_std` by
//! default and these mocks need an allocator.

use std::collections::VecDeque;
use tabby::iface::{EthPhy, NvConfig, StaticConfig};
use tabby::MacAddr;

/// An in-memory `EthPhy`: frames handed to [`MockPhy::inject`] come back out
/// of `recv`, one per call; frames passed to `send` land in `sent` for the
/// test to inspect.
pub struct MockPhy {
    mac: MacAddr,
    link_up: bool,
    inbox: VecDeque<Vec<u8>>,
    /// Every frame this mock has been asked to transmit, oldest first.
    pub sent: Vec<Vec<u8>>,
}

impl MockPhy {
    /// A link-up mock with an empty inbox and outbox.
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            link_up: true,
            inbox: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// Queue a frame to be returned by the next `recv` call.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbox.push_back(frame);
    }

    /// Set whether the link reports up.
    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }

    /// Pop the oldest sent frame, if any.
    pub fn take_sent(&mut self) -> Option<Vec<u8>> {
        if self.sent.is_empty() {
            None
        } else {
            Some(self.sent.remove(0))
        }
    }
}

impl EthPhy for MockPhy {
    fn mac_address(&self) -> MacAddr {
        self.mac
    }

    fn link_up(&self) -> bool {
        self.link_up
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let frame = self.inbox.pop_front()?;
        let len = frame.len();
        buf[..len].copy_from_slice(&frame);
        Some(len)
    }

    fn send(&mut self, frame: &[u8]) {
        self.sent.push(frame.to_vec());
    }
}

/// A fixed-answer `NvConfig`.
pub struct MockNvConfig(pub StaticConfig);

impl NvConfig for MockNvConfig {
    fn load(&self) -> StaticConfig {
        self.0
    }
}

/// A monotonic second counter driven by the test instead of a real clock,
/// mirroring the sibling DHCP crate's `MockMonotonic`.
#[derive(Default)]
pub struct MockClock {
    secs: u32,
}

impl MockClock {
    /// Advance by `secs` seconds, returning the new total.
    pub fn advance(&mut self, secs: u32) -> u32 {
        self.secs = self.secs.saturating_add(secs);
        self.secs
    }
}
