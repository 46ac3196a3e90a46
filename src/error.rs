//! Error types shared by the frame codec, the option codec, and the DHCP
//! client's fatal-event path.
//!
//! None of these are `std::error::Error` — this crate is `no_std` by
//! default — but all are plain `Clone + Copy + Debug` enums so a caller can
//! match on them without pulling in an allocator.

use ufmt::derive::uDebug;

/// Failure modes from parsing a raw Ethernet/IPv4/UDP/TCP frame.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer was shorter than the fixed header it was asked to hold.
    Truncated,
    /// The Ethernet frame's ethertype is not one this crate handles.
    UnsupportedEtherType,
    /// The IP header's protocol field is not one this crate handles.
    UnsupportedIpProtocol,
    /// A checksum did not fold to zero.
    ChecksumMismatch,
}

/// Failure modes from scanning a DHCP options TLV list.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
pub enum OptionError {
    /// The requested option tag was not present before the `0xFF` sentinel.
    Missing,
    /// A length byte claimed more data than remains in the buffer.
    Truncated,
}

/// Fatal DHCP events per §9's "reboot as an error path" redesign: the FSM
/// never resets the platform itself, it returns one of these from
/// [`crate::dhcp::DhcpClient::advance`] for the caller to bind to a reset.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
pub enum DhcpFatal {
    /// `discovery_timeout` fired twice with no OFFER accepted.
    DiscoverExhausted,
    /// The lease's total duration elapsed without a renewal succeeding.
    LeaseExpired,
}
