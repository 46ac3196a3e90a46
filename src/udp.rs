//! Transport layer: User Datagram Protocol.
//!
//! Used for DHCP only (client port 68, server port 67) — this crate is not a
//! general-purpose UDP socket implementation.

use crate::IpV4Addr;
use byte_struct::*;

/// DHCP's well-known client port.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// DHCP's well-known server port.
pub const DHCP_SERVER_PORT: u16 = 67;

/// UDP datagram header.
///
/// value `[0:1]` source port
///
/// value `[2:3]` destination port
///
/// value `[4:5]` total length in bytes, header + data
///
/// value `[6:7]` checksum
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Total length including header and data, in bytes
    pub length: u16,
    /// Checksum over the pseudo-header and segment (optional in IPv4, but we always compute it)
    pub checksum: u16,
}

impl UdpHeader {
    /// Header length in bytes (fixed — UDP has no options).
    pub const BYTE_LEN: usize = 8;

    /// A header for a DHCP client-to-server datagram of `payload_len` bytes.
    pub fn new_dhcp(payload_len: usize) -> Self {
        UdpHeader {
            src_port: DHCP_CLIENT_PORT,
            dst_port: DHCP_SERVER_PORT,
            length: (Self::BYTE_LEN + payload_len) as u16,
            checksum: 0,
        }
    }

    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut header_bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut header_bytes);
        header_bytes
    }
}

/// Compute the UDP checksum over the IPv4 pseudo-header, the UDP header
/// (with its checksum field zeroed), and the payload, per IETF-RFC-768.
///
/// The pseudo-header and segment sums are accumulated separately and then
/// combined, relying on the additivity of the one's-complement running sum
/// (see [`crate::calc_ip_checksum_incomplete`]) rather than materializing a
/// single contiguous buffer — this crate has no allocator to join them with.
pub fn calc_udp_checksum(
    src_ipaddr: IpV4Addr,
    dst_ipaddr: IpV4Addr,
    header: &UdpHeader,
    payload: &[u8],
) -> u16 {
    let mut pseudo_header = [0_u8; 12];
    pseudo_header[0..4].copy_from_slice(&src_ipaddr.to_be_bytes());
    pseudo_header[4..8].copy_from_slice(&dst_ipaddr.to_be_bytes());
    pseudo_header[8] = 0;
    pseudo_header[9] = crate::Protocol::Udp as u8;
    pseudo_header[10..12].copy_from_slice(&header.length.to_be_bytes());

    let mut zeroed_header = *header;
    zeroed_header.checksum = 0;

    let sum = crate::calc_ip_checksum_incomplete(&pseudo_header)
        + crate::calc_ip_checksum_incomplete(&zeroed_header.to_be_bytes())
        + crate::calc_ip_checksum_incomplete(payload);
    crate::fold_and_complement(sum)
}
