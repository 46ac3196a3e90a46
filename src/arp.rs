//! Address Resolution Protocol.
//!
//! Used here for two things: resolving the default gateway's MAC address
//! before a TCP client can address its first segment to it, and ARP-probing
//! a DHCP-offered address for conflicts before accepting the lease.

use crate::{IpV4Addr, MacAddr};

use byte_struct::*;
use static_assertions::const_assert;
use ufmt::derive::uDebug;

const_assert!(ArpPayload::BYTE_LEN == 46); // minimum Ethernet payload size

/// An ARP request or response with IPv4 addresses and standard 6-byte MAC
/// addresses. Padded with trailing zeroes out to the minimum Ethernet
/// payload size (46 bytes), since the 28-byte ARP payload alone is shorter
/// than that minimum.
///
/// See <https://en.wikipedia.org/wiki/Address_Resolution_Protocol>.
#[derive(ByteStruct, Clone, Copy, uDebug, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[byte_struct_be]
pub struct ArpPayload {
    /// Hardware type (1 for Ethernet)
    pub htype: u16,
    /// Protocol type (same as ethertype from the Ethernet header)
    pub ptype: crate::EtherType,
    /// Hardware address length (6 for standard MAC)
    pub hlen: u8,
    /// Protocol address length (4 for IPv4)
    pub plen: u8,
    /// ARP operation type
    pub operation: ArpOperation,
    /// Source MAC address
    pub src_mac: MacAddr,
    /// Source IP address
    pub src_ipaddr: IpV4Addr,
    /// Destination MAC address
    pub dst_mac: MacAddr,
    /// Destination IP address
    pub dst_ipaddr: IpV4Addr,
    /// Pad to minimum frame size
    _pad0: u128,
    _pad1: u16,
}

impl ArpPayload {
    /// Create a new ARP payload for IPv4 on Ethernet.
    pub fn new(
        src_mac: MacAddr,
        src_ipaddr: IpV4Addr,
        dst_mac: MacAddr,
        dst_ipaddr: IpV4Addr,
        operation: ArpOperation,
    ) -> Self {
        ArpPayload {
            htype: 1,
            ptype: crate::EtherType::IpV4,
            hlen: 6,
            plen: 4,
            operation,
            src_mac,
            src_ipaddr,
            dst_mac,
            dst_ipaddr,
            _pad0: 0,
            _pad1: 0,
        }
    }

    /// A probe for `target_ipaddr`: sender and target protocol address both
    /// equal `target_ipaddr`, so a reply unambiguously means someone else
    /// already holds the address.
    pub fn new_probe(src_mac: MacAddr, target_ipaddr: IpV4Addr) -> Self {
        ArpPayload::new(
            src_mac,
            target_ipaddr,
            MacAddr::ANY,
            target_ipaddr,
            ArpOperation::Request,
        )
    }

    /// A request to resolve `target_ipaddr`'s (e.g. the gateway's) MAC
    /// address, advertising our own bound address as the sender.
    pub fn new_request(src_mac: MacAddr, src_ipaddr: IpV4Addr, target_ipaddr: IpV4Addr) -> Self {
        ArpPayload::new(
            src_mac,
            src_ipaddr,
            MacAddr::ANY,
            target_ipaddr,
            ArpOperation::Request,
        )
    }

    /// Whether this payload is a probe (sender and target protocol address
    /// equal), as opposed to a normal request or gratuitous announcement.
    pub fn is_probe(&self) -> bool {
        self.operation == ArpOperation::Request && self.src_ipaddr == self.dst_ipaddr
    }

    /// Convert to a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

/// ARP request or response operation values.
#[derive(Clone, Copy, uDebug, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ArpOperation {
    /// A request to confirm the target IP address and acquire its MAC address
    Request = 1,
    /// A response confirming an IP address and providing its MAC address
    Response = 2,
    /// Invalid operation
    Unimplemented,
}

impl From<u16> for ArpOperation {
    fn from(value: u16) -> Self {
        match value {
            x if x == ArpOperation::Request as u16 => ArpOperation::Request,
            x if x == ArpOperation::Response as u16 => ArpOperation::Response,
            _ => ArpOperation::Unimplemented,
        }
    }
}

impl ByteStructLen for ArpOperation {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ArpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut bytes_read = [0_u8; 2];
        bytes_read.copy_from_slice(&bytes[0..=1]);
        ArpOperation::from(u16::from_be_bytes(bytes_read))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        let bytes_to_write = self.to_be_bytes();
        bytes[0] = bytes_to_write[0];
        bytes[1] = bytes_to_write[1];
    }
}

impl ArpOperation {
    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        (*self as u16).to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_loop() {
        let msg = ArpPayload::new(
            MacAddr::new([7_u8; 6]),
            IpV4Addr::new([8_u8; 4]),
            MacAddr::new([9_u8; 6]),
            IpV4Addr::new([10_u8; 4]),
            ArpOperation::Request,
        );
        let bytes: [u8; 46] = msg.to_be_bytes();
        let msg_parsed = ArpPayload::read_bytes(&bytes);
        assert_eq!(msg, msg_parsed);
    }

    #[test]
    fn test_probe_detection() {
        let probe = ArpPayload::new_probe(MacAddr::new([1_u8; 6]), IpV4Addr::new([10, 0, 0, 5]));
        assert!(probe.is_probe());

        let request = ArpPayload::new_request(
            MacAddr::new([1_u8; 6]),
            IpV4Addr::new([10, 0, 0, 9]),
            IpV4Addr::new([10, 0, 0, 1]),
        );
        assert!(!request.is_probe());
    }
}
