//! Internet layer: IPv4 header construction and parsing.

use crate::{IpV4Addr, Protocol, DSCP};
use byte_struct::*;

bitfields!(
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    Fragmentation: u16 {
        unused: 1,
        pub do_not_fragment: 1,
        pub more_fragments: 1,
        pub offset: 13
    }
);

bitfields!(
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    VersionAndHeaderLength: u8 {
        pub version: 4,
        pub header_length: 4
    }
);

/// IPv4 header per IETF-RFC-791, with no Options section.
///
/// See <https://en.wikipedia.org/wiki/IPv4#Header>.
///
/// first 32-bit word
///
/// value `[0]` Version `[4 bits]`, Header Length `[4 bits]`
///
/// value `[1]` Type-of-Service / DSCP
///
/// value `[2:3]` Total Length `[u16]` in bytes
///
/// second 32-bit word
///
/// value `[4:5]` Identification `[u16]`
///
/// value `[6:7]` Flags `[3 bits]`, Fragmentation Offset `[13 bits]`
///
/// third 32-bit word
///
/// value `[8]` Time-to-Live
///
/// value `[9]` Protocol
///
/// value `[10:11]` Checksum `[u16]`
///
/// fourth 32-bit word
///
/// value `[12:15]` Source IP Address
///
/// fifth 32-bit word
///
/// value `[16:19]` Destination IP Address
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct IpV4Header {
    /// IP version (always 4) and header length in 32-bit words (always 5 — no options)
    pub version_and_length: VersionAndHeaderLength,
    /// Differentiated services / type-of-service
    pub dscp: DSCP,
    /// Total length of header + payload, in bytes
    pub total_length: u16,
    /// Datagram identification, used for fragment reassembly (unused here — no fragmentation)
    pub identification: u16,
    /// Fragmentation flags and offset (always unfragmented here)
    pub fragmentation: Fragmentation,
    /// Time-to-live
    pub time_to_live: u8,
    /// Encapsulated protocol
    pub protocol: Protocol,
    /// Header checksum
    pub checksum: u16,
    /// Source IPv4 address
    pub src_ipaddr: IpV4Addr,
    /// Destination IPv4 address
    pub dst_ipaddr: IpV4Addr,
}

impl IpV4Header {
    /// Header length with no options section, in bytes.
    pub const BYTE_LEN: usize = 20;

    /// Header length with no options section, in 32-bit words. This is the
    /// value this crate always places in `version_and_length.header_length`,
    /// since it never emits or parses an IP options section.
    pub const IHL_WORDS: u8 = (Self::BYTE_LEN / 4) as u8;

    /// A header suitable as a starting point for any outgoing frame this
    /// crate builds: version 4, IHL 5, standard DSCP, unfragmented, TTL 128.
    pub fn new(protocol: Protocol, src_ipaddr: IpV4Addr, dst_ipaddr: IpV4Addr) -> Self {
        IpV4Header {
            version_and_length: VersionAndHeaderLength::new()
                .with_version(4)
                .with_header_length(Self::IHL_WORDS),
            dscp: DSCP::Standard,
            total_length: 0,
            identification: 0,
            fragmentation: Fragmentation::default(),
            time_to_live: 128,
            protocol,
            checksum: 0,
            src_ipaddr,
            dst_ipaddr,
        }
    }

    /// Header length in bytes, per the wire `header_length` field (IHL * 4).
    pub fn header_len_bytes(&self) -> usize {
        self.version_and_length.header_length() as usize * 4
    }

    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut header_bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut header_bytes);
        header_bytes
    }

    /// Zero the checksum field and recompute it over the (fixed-length, no
    /// options) header bytes, storing the result back into `self.checksum`.
    pub fn calc_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_be_bytes();
        self.checksum = crate::calc_ip_checksum(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = IpV4Header::new(
            Protocol::Udp,
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([10, 0, 0, 2]),
        );
        header.total_length = IpV4Header::BYTE_LEN as u16;
        header.calc_checksum();

        let bytes = header.to_be_bytes();
        let parsed = IpV4Header::read_bytes(&bytes);
        assert_eq!(parsed, header);
        assert_eq!(parsed.header_len_bytes(), 20);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut header = IpV4Header::new(
            Protocol::Tcp,
            IpV4Addr::new([192, 168, 1, 50]),
            IpV4Addr::new([192, 168, 1, 1]),
        );
        header.total_length = 40;
        header.calc_checksum();
        let bytes = header.to_be_bytes();
        assert_eq!(crate::calc_ip_checksum(&bytes), 0);
    }
}
