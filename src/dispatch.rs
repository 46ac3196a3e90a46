//! Dispatcher (C6): classify an inbound Ethernet frame and route it to the
//! ARP/DHCP/TCP handlers, or report it back to the caller for the handful
//! of things this crate deliberately does not own (ICMP echo replies, ARP
//! replies to requests aimed at us).
//!
//! This is the one place in the crate that looks at more than one protocol
//! layer at once; everything else here is a thin call-through into
//! [`crate::dhcp`] and [`crate::tcp`].

use crate::arp::ArpPayload;
use crate::dhcp::DhcpClient;
use crate::enet::{EthernetHeader, EtherType};
use crate::error::FrameError;
use crate::ip::IpV4Header;
use crate::tcp::TcpClient;
use crate::udp::{UdpHeader, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::iface::EthPhy;
use crate::{ByteStruct, ByteStructLen, IpV4Addr, MacAddr, Protocol};

/// ICMP echo request type, per IETF-RFC-792. This crate parses only enough
/// of ICMP to recognize this one message — building the reply is the
/// caller's job (§6, ICMP is an external collaborator).
const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

const ETH_HEADER_LEN: usize = 14;

/// Things this crate noticed in an inbound frame that it cannot act on
/// itself and hands back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    /// An ARP request whose target IP is ours. The caller owns building and
    /// sending the reply (this crate already forwarded the same payload to
    /// the DHCP/TCP ARP handlers for their own IP-match checks).
    ArpRequestForUs {
        /// The requester's MAC address.
        sender_mac: MacAddr,
        /// The requester's IP address.
        sender_ip: IpV4Addr,
    },
    /// An ICMP echo request addressed to us. The caller owns building and
    /// sending the echo reply.
    IcmpEchoRequest {
        /// The sender's IP address, to address the reply to.
        sender_ip: IpV4Addr,
    },
}

/// Classify `frame` (a full Ethernet frame, starting at the destination MAC
/// address) and route it to `dhcp`/`tcp`, or return an [`InboundEvent`] for
/// the caller.
///
/// `my_ip` is the interface's current IP (or [`IpV4Addr::ANY`] before a
/// lease is held) — used only to recognize unicast traffic addressed to us;
/// this crate does not own the interface's IP and never attempts to divine
/// it from state other than what the caller passes in.
///
/// Returns `Ok(None)` for frames that were handled (or silently ignored, as
/// the DHCP and TCP state machines do for validation failures) with nothing
/// left for the caller to do. Returns `Err` only for frames malformed enough
/// that no handler was invoked at all.
pub fn dispatch_frame<P: EthPhy>(
    frame: &[u8],
    my_ip: IpV4Addr,
    dhcp: &mut DhcpClient,
    tcp: &mut TcpClient,
    phy: &mut P,
) -> Result<Option<InboundEvent>, FrameError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let eth = EthernetHeader::read_bytes(&frame[..ETH_HEADER_LEN]);
    let payload = &frame[ETH_HEADER_LEN..];

    match eth.ethertype {
        EtherType::Arp => dispatch_arp(payload, my_ip, dhcp, tcp, phy),
        EtherType::IpV4 => dispatch_ipv4(payload, my_ip, dhcp, tcp, phy),
        _ => Err(FrameError::UnsupportedEtherType),
    }
}

fn dispatch_arp<P: EthPhy>(
    payload: &[u8],
    my_ip: IpV4Addr,
    dhcp: &mut DhcpClient,
    tcp: &mut TcpClient,
    phy: &mut P,
) -> Result<Option<InboundEvent>, FrameError> {
    if payload.len() < ArpPayload::BYTE_LEN {
        return Err(FrameError::Truncated);
    }
    let arp = ArpPayload::read_bytes(&payload[..ArpPayload::BYTE_LEN]);

    dhcp.process_arp_response(&arp, phy);
    tcp.process_arp_response(&arp);

    if arp.operation == crate::arp::ArpOperation::Request && arp.dst_ipaddr == my_ip {
        return Ok(Some(InboundEvent::ArpRequestForUs {
            sender_mac: arp.src_mac,
            sender_ip: arp.src_ipaddr,
        }));
    }
    Ok(None)
}

fn dispatch_ipv4<P: EthPhy>(
    payload: &[u8],
    my_ip: IpV4Addr,
    dhcp: &mut DhcpClient,
    tcp: &mut TcpClient,
    phy: &mut P,
) -> Result<Option<InboundEvent>, FrameError> {
    if payload.len() < IpV4Header::BYTE_LEN {
        return Err(FrameError::Truncated);
    }
    let ip = IpV4Header::read_bytes(&payload[..IpV4Header::BYTE_LEN]);
    let header_len = ip.header_len_bytes();
    if payload.len() < header_len || (ip.total_length as usize) < header_len {
        return Err(FrameError::Truncated);
    }
    // Bound by the IP header's own declared length, not the physical frame's
    // length — the MAC pads short frames out to the 60-byte Ethernet
    // minimum, and those pad bytes must not be fed into a checksum or a
    // PSH data-length calculation.
    let ip_end = (ip.total_length as usize).min(payload.len());
    let segment = &payload[header_len..ip_end];
    let is_unicast = ip.dst_ipaddr == my_ip;

    match ip.protocol {
        Protocol::Icmp => {
            if is_unicast && !segment.is_empty() && segment[0] == ICMP_TYPE_ECHO_REQUEST {
                return Ok(Some(InboundEvent::IcmpEchoRequest {
                    sender_ip: ip.src_ipaddr,
                }));
            }
            Ok(None)
        }
        Protocol::Udp => {
            if segment.len() < UdpHeader::BYTE_LEN {
                return Err(FrameError::Truncated);
            }
            let udp = UdpHeader::read_bytes(&segment[..UdpHeader::BYTE_LEN]);
            if udp.src_port != DHCP_SERVER_PORT || udp.dst_port != DHCP_CLIENT_PORT {
                trace!("dispatch: udp {}->{}, not DHCP, dropping", udp.src_port, udp.dst_port);
                return Ok(None);
            }
            if udp.checksum != 0 && !verify_udp_checksum(&ip, &segment[..udp.length as usize]) {
                return Err(FrameError::ChecksumMismatch);
            }
            dhcp.process_response(&segment[UdpHeader::BYTE_LEN..]);
            Ok(None)
        }
        Protocol::Tcp => {
            if !is_unicast {
                return Ok(None);
            }
            if segment.len() < crate::tcp::TcpHeader::BYTE_LEN {
                return Err(FrameError::Truncated);
            }
            if !verify_tcp_checksum(&ip, segment) {
                return Err(FrameError::ChecksumMismatch);
            }
            tcp.process_tcp_response(segment, phy);
            Ok(None)
        }
        Protocol::Unimplemented => Err(FrameError::UnsupportedIpProtocol),
    }
}

fn verify_udp_checksum(ip: &IpV4Header, udp_segment: &[u8]) -> bool {
    let mut pseudo_header = [0_u8; 12];
    pseudo_header[0..4].copy_from_slice(&ip.src_ipaddr.to_be_bytes());
    pseudo_header[4..8].copy_from_slice(&ip.dst_ipaddr.to_be_bytes());
    pseudo_header[9] = Protocol::Udp as u8;
    pseudo_header[10..12].copy_from_slice(&(udp_segment.len() as u16).to_be_bytes());
    let sum =
        crate::calc_ip_checksum_incomplete(&pseudo_header) + crate::calc_ip_checksum_incomplete(udp_segment);
    crate::fold_and_complement(sum) == 0
}

fn verify_tcp_checksum(ip: &IpV4Header, tcp_segment: &[u8]) -> bool {
    let mut pseudo_header = [0_u8; 12];
    pseudo_header[0..4].copy_from_slice(&ip.src_ipaddr.to_be_bytes());
    pseudo_header[4..8].copy_from_slice(&ip.dst_ipaddr.to_be_bytes());
    pseudo_header[9] = Protocol::Tcp as u8;
    pseudo_header[10..12].copy_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    let sum =
        crate::calc_ip_checksum_incomplete(&pseudo_header) + crate::calc_ip_checksum_incomplete(tcp_segment);
    crate::fold_and_complement(sum) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enet::EthernetHeader;
    use crate::tcp::{Socket, TcpClient};

    extern crate std;

    struct NullPhy {
        mac: MacAddr,
    }

    impl EthPhy for NullPhy {
        fn mac_address(&self) -> MacAddr {
            self.mac
        }
        fn link_up(&self) -> bool {
            true
        }
        fn recv(&mut self, _buf: &mut [u8]) -> Option<usize> {
            None
        }
        fn send(&mut self, _frame: &[u8]) {}
    }

    fn new_fixtures() -> (DhcpClient, TcpClient, NullPhy) {
        let dhcp = DhcpClient::new(1);
        let socket = Socket::new(
            IpV4Addr::new([192, 168, 1, 50]),
            50234,
            IpV4Addr::new([52, 54, 110, 50]),
            1883,
        );
        let tcp = TcpClient::new(socket, IpV4Addr::new([192, 168, 1, 1]), 2);
        let phy = NullPhy {
            mac: MacAddr::new([0x02, 0, 0, 0, 0, 9]),
        };
        (dhcp, tcp, phy)
    }

    #[test]
    fn test_arp_request_for_us_is_reported() {
        let (mut dhcp, mut tcp, mut phy) = new_fixtures();
        let my_ip = IpV4Addr::new([192, 168, 1, 50]);
        let arp = ArpPayload::new(
            MacAddr::new([0xAA; 6]),
            IpV4Addr::new([192, 168, 1, 77]),
            MacAddr::ANY,
            my_ip,
            crate::arp::ArpOperation::Request,
        );
        let mut frame = std::vec![0_u8; ETH_HEADER_LEN + ArpPayload::BYTE_LEN];
        let eth = EthernetHeader {
            dst_macaddr: phy.mac,
            src_macaddr: MacAddr::new([0xAA; 6]),
            ethertype: EtherType::Arp,
        };
        eth.write_bytes(&mut frame[..ETH_HEADER_LEN]);
        arp.write_bytes(&mut frame[ETH_HEADER_LEN..]);

        let event = dispatch_frame(&frame, my_ip, &mut dhcp, &mut tcp, &mut phy).unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::ArpRequestForUs {
                sender_mac: MacAddr::new([0xAA; 6]),
                sender_ip: IpV4Addr::new([192, 168, 1, 77]),
            })
        );
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let (mut dhcp, mut tcp, mut phy) = new_fixtures();
        let frame = [0_u8; 4];
        let result = dispatch_frame(&frame, IpV4Addr::ANY, &mut dhcp, &mut tcp, &mut phy);
        assert_eq!(result, Err(FrameError::Truncated));
    }

    #[test]
    fn test_unimplemented_ip_protocol_is_rejected() {
        let (mut dhcp, mut tcp, mut phy) = new_fixtures();
        let my_ip = IpV4Addr::new([192, 168, 1, 50]);
        let mut ip = IpV4Header::new(Protocol::Unimplemented, IpV4Addr::new([10, 0, 0, 9]), my_ip);
        ip.total_length = IpV4Header::BYTE_LEN as u16;
        ip.calc_checksum();

        let mut frame = std::vec![0_u8; ETH_HEADER_LEN + IpV4Header::BYTE_LEN];
        let eth = EthernetHeader {
            dst_macaddr: phy.mac,
            src_macaddr: MacAddr::new([0xBB; 6]),
            ethertype: EtherType::IpV4,
        };
        eth.write_bytes(&mut frame[..ETH_HEADER_LEN]);
        ip.write_bytes(&mut frame[ETH_HEADER_LEN..]);

        let result = dispatch_frame(&frame, my_ip, &mut dhcp, &mut tcp, &mut phy);
        assert_eq!(result, Err(FrameError::UnsupportedIpProtocol));
    }
}
