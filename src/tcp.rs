//! Transport layer: TCP client (C5).
//!
//! Just enough of RFC 793 for a client that dials out, exchanges a handful
//! of segments, and closes: the three-way handshake, ACKing inbound PSH
//! data, and a FIN-initiated shutdown. No retransmission queue, no
//! congestion control, no listening side.
//! Shaped after [`crate::dhcp`]'s `poll`/`process_*` split: a tick that
//! drains pending flags, and foreground handlers fed frames by
//! [`crate::dispatch`].

use crate::iface::EthPhy;
use crate::{ArpPayload, IpV4Addr, MacAddr};
use byte_struct::*;
use ufmt::derive::uDebug;

bitfields!(
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    TcpOffsetFlags: u16 {
        pub data_offset: 4,
        reserved: 6,
        pub flags: 6
    }
);

/// FIN control bit.
pub const TCP_FIN: u8 = 0x01;
/// SYN control bit.
pub const TCP_SYN: u8 = 0x02;
/// RST control bit.
pub const TCP_RST: u8 = 0x04;
/// PSH control bit.
pub const TCP_PSH: u8 = 0x08;
/// ACK control bit.
pub const TCP_ACK: u8 = 0x10;
/// URG control bit.
pub const TCP_URG: u8 = 0x20;

/// The fixed 20-byte TCP header (no options).
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number of the first octet of this segment (or, for a
    /// SYN, the initial sequence number itself).
    pub seq: u32,
    /// Acknowledgement number, valid only when [`TCP_ACK`] is set.
    pub ack: u32,
    /// Header length (4-octet units, high 4 bits) and control bits (low
    /// 6 bits). Reserved bits in between are always 0.
    pub offset_flags: TcpOffsetFlags,
    /// Receive window. Always 1024 here — no window scaling.
    pub window: u16,
    /// Checksum over the pseudo-header and the segment.
    pub checksum: u16,
    /// Urgent pointer. Always 0 — [`TCP_URG`] is never set by this client.
    pub urgent_pointer: u16,
}

impl TcpHeader {
    /// Header length in bytes (fixed — this client never emits options).
    pub const BYTE_LEN: usize = 20;
    const HEADER_WORDS: u8 = (Self::BYTE_LEN / 4) as u8;

    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }

    /// Header length in bytes as carried on the wire (data_offset * 4).
    pub fn header_len_bytes(&self) -> usize {
        self.offset_flags.data_offset() as usize * 4
    }
}

/// Compute the TCP checksum over the IPv4 pseudo-header (src, dst, zero,
/// protocol 6, TCP length) and the segment, per IETF-RFC-793 §3.1.
pub fn calc_tcp_checksum(
    src_ipaddr: IpV4Addr,
    dst_ipaddr: IpV4Addr,
    header: &TcpHeader,
    payload: &[u8],
) -> u16 {
    let segment_len = TcpHeader::BYTE_LEN + payload.len();
    let mut pseudo_header = [0_u8; 12];
    pseudo_header[0..4].copy_from_slice(&src_ipaddr.to_be_bytes());
    pseudo_header[4..8].copy_from_slice(&dst_ipaddr.to_be_bytes());
    pseudo_header[8] = 0;
    pseudo_header[9] = crate::Protocol::Tcp as u8;
    pseudo_header[10..12].copy_from_slice(&(segment_len as u16).to_be_bytes());

    let mut zeroed_header = *header;
    zeroed_header.checksum = 0;

    let sum = crate::calc_ip_checksum_incomplete(&pseudo_header)
        + crate::calc_ip_checksum_incomplete(&zeroed_header.to_be_bytes())
        + crate::calc_ip_checksum_incomplete(payload);
    crate::fold_and_complement(sum)
}

/// TCP connection states per IETF-RFC-793 §3.2. Only a subset is ever
/// produced by this client's path (`CLOSED -> SYN_SENT -> ESTABLISHED ->
/// CLOSE_WAIT -> CLOSED`); the rest are retained so [`TcpState`] can name a
/// real RFC state rather than inventing a smaller enum, and so a future
/// extension toward the unexercised states (e.g. simultaneous close) has
/// somewhere to land.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
pub enum TcpState {
    /// No connection.
    Closed,
    /// Listening for a connection request. Never entered by this client.
    Listen,
    /// SYN sent, awaiting SYN|ACK.
    SynSent,
    /// SYN received, awaiting ACK. Never entered by this client (that is
    /// the server-side half of the handshake).
    SynReceived,
    /// Connection open for data transfer.
    Established,
    /// Our FIN sent, awaiting ACK. Never entered by this client (it goes
    /// straight to CLOSE_WAIT, the passive-close side, since this client
    /// never sends the connection's first FIN).
    FinWait1,
    /// Our FIN acked, awaiting the peer's FIN. Never entered by this client.
    FinWait2,
    /// The peer's FIN was received and acked; waiting for the application
    /// (here, `fin_req`) to close its own half.
    CloseWait,
    /// Both sides sent FIN before either was acked. Never entered.
    Closing,
    /// Our FIN sent after CLOSE_WAIT, awaiting the final ACK.
    LastAck,
    /// Final ACK sent, waiting out 2*MSL. Never entered — this client
    /// transitions CLOSE_WAIT -> CLOSED directly on that ACK rather than
    /// modeling the full passive-close tail.
    TimeWait,
}

impl Default for TcpState {
    fn default() -> Self {
        TcpState::Closed
    }
}

/// The client's connection record: local and remote addressing plus the
/// running sequence/ack counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Socket {
    /// This host's IP (normally the DHCP-bound address).
    pub local_ip: IpV4Addr,
    /// This host's ephemeral source port.
    pub local_port: u16,
    /// The remote host's IP.
    pub remote_ip: IpV4Addr,
    /// The remote host's port.
    pub remote_port: u16,
    /// The next-hop MAC address segments are sent to: the default
    /// gateway's, resolved by [`TcpClient::gateway_req`] — the remote host
    /// here is assumed off-subnet, as in the grounding source's usage
    /// (a broker reached only through a router). Broadcast until resolved.
    pub next_hop_mac: MacAddr,
    /// Our next sequence number to send.
    pub seq: u32,
    /// The next sequence number we expect from the peer (our outbound ack).
    pub ack_expected: u32,
}

impl Socket {
    /// A socket with static remote coordinates and an unresolved next hop.
    pub fn new(local_ip: IpV4Addr, local_port: u16, remote_ip: IpV4Addr, remote_port: u16) -> Self {
        Self {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            next_hop_mac: MacAddr::BROADCAST,
            seq: 0,
            ack_expected: 0,
        }
    }
}

/// Independent booleans set by public requests and cleared by [`TcpClient::poll`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct TcpPendingFlags {
    syn: bool,
    fin: bool,
    gw: bool,
}

/// Largest frame this client ever builds: 14 (Ethernet) + 20 (IPv4) + 20
/// (TCP, no options, no payload — this client never sends application data).
const MAX_FRAME_LEN: usize = 14 + crate::ip::IpV4Header::BYTE_LEN + TcpHeader::BYTE_LEN;

/// TCP client state machine (C5): dial out, handshake, ack data, close.
pub struct TcpClient {
    state: TcpState,
    socket: Socket,
    gateway_ip: IpV4Addr,
    rand: crate::rand::Rand,
    flags: TcpPendingFlags,
}

impl TcpClient {
    /// A new, closed client for the given connection coordinates. `seed`
    /// feeds the initial-sequence-number PRNG (see [`crate::rand`]).
    pub fn new(socket: Socket, gateway_ip: IpV4Addr, seed: u64) -> Self {
        Self {
            state: TcpState::Closed,
            socket,
            gateway_ip,
            rand: crate::rand::Rand::new(seed),
            flags: TcpPendingFlags::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// The current connection record.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Ask for a SYN on the next poll.
    pub fn syn_req(&mut self) {
        self.flags.syn = true;
    }

    /// Ask for a FIN|ACK on the next poll.
    pub fn fin_req(&mut self) {
        self.flags.fin = true;
    }

    /// Ask for an ARP request to the configured gateway on the next poll.
    pub fn gateway_req(&mut self) {
        self.flags.gw = true;
    }

    fn validate_ack(&self, ack: u32) -> bool {
        ack == self.socket.seq
    }

    fn send<P: EthPhy>(&self, phy: &mut P, flags: u8) {
        let mac = phy.mac_address();
        let mut buf = [0_u8; MAX_FRAME_LEN];
        const ETH_LEN: usize = 14;
        const IP_LEN: usize = crate::ip::IpV4Header::BYTE_LEN;
        const TCP_LEN: usize = TcpHeader::BYTE_LEN;

        let mut tcp_header = TcpHeader {
            src_port: self.socket.local_port,
            dst_port: self.socket.remote_port,
            seq: self.socket.seq,
            ack: self.socket.ack_expected,
            offset_flags: TcpOffsetFlags::new()
                .with_data_offset(TcpHeader::HEADER_WORDS)
                .with_flags(flags),
            window: 1024,
            checksum: 0,
            urgent_pointer: 0,
        };
        let checksum = calc_tcp_checksum(self.socket.local_ip, self.socket.remote_ip, &tcp_header, &[]);
        tcp_header.checksum = checksum;
        tcp_header.write_bytes(&mut buf[ETH_LEN + IP_LEN..ETH_LEN + IP_LEN + TCP_LEN]);

        let mut ip_header =
            crate::ip::IpV4Header::new(crate::Protocol::Tcp, self.socket.local_ip, self.socket.remote_ip);
        ip_header.total_length = (IP_LEN + TCP_LEN) as u16;
        ip_header.calc_checksum();
        ip_header.write_bytes(&mut buf[ETH_LEN..ETH_LEN + IP_LEN]);

        let eth_header = crate::enet::EthernetHeader {
            dst_macaddr: self.socket.next_hop_mac,
            src_macaddr: mac,
            ethertype: crate::enet::EtherType::IpV4,
        };
        eth_header.write_bytes(&mut buf[0..ETH_LEN]);

        debug!("tcp: tx flags={:#x}", flags);
        phy.send(&buf[..ETH_LEN + IP_LEN + TCP_LEN]);
    }

    /// The per-main-loop "send pending" step. Unlike the DHCP FSM's
    /// mutually-exclusive flag chain, these three checks are independent —
    /// each is its own `if`, not an `else if` chain.
    pub fn poll<P: EthPhy>(&mut self, phy: &mut P) {
        if self.flags.syn {
            self.socket.seq = self.rand.next_u32();
            self.socket.ack_expected = 0;
            self.send(phy, TCP_SYN);
            self.state = TcpState::SynSent;
            self.socket.seq = self.socket.seq.wrapping_add(1);
            self.flags.syn = false;
        }

        if self.flags.gw {
            let mac = phy.mac_address();
            let request = ArpPayload::new_request(mac, self.socket.local_ip, self.gateway_ip);
            let mut buf = [0_u8; 14 + ArpPayload::BYTE_LEN];
            let eth_header = crate::enet::EthernetHeader {
                dst_macaddr: MacAddr::BROADCAST,
                src_macaddr: mac,
                ethertype: crate::enet::EtherType::Arp,
            };
            eth_header.write_bytes(&mut buf[0..14]);
            request.write_bytes(&mut buf[14..]);
            phy.send(&buf);
            self.flags.gw = false;
        }

        if self.flags.fin {
            self.send(phy, TCP_FIN | TCP_ACK);
            self.state = TcpState::CloseWait;
            self.flags.fin = false;
        }
    }

    /// Handle an inbound ARP. Records the gateway's MAC into the socket's
    /// next-hop field when the sender IP matches the configured gateway.
    pub fn process_arp_response(&mut self, arp: &ArpPayload) {
        if arp.src_ipaddr == self.gateway_ip {
            debug!("tcp: resolved gateway MAC");
            self.socket.next_hop_mac = arp.src_mac;
        }
    }

    /// Handle an inbound TCP segment. `tcp_segment` starts at the TCP
    /// header and runs to the end of the IP datagram (the caller —
    /// [`crate::dispatch`] — has already confirmed this is a unicast IPv4
    /// TCP datagram and sliced it to the IP header's declared length).
    pub fn process_tcp_response<P: EthPhy>(&mut self, tcp_segment: &[u8], phy: &mut P) {
        if tcp_segment.len() < TcpHeader::BYTE_LEN {
            trace!("tcp: segment too short to hold a header, dropping");
            return;
        }
        let header = TcpHeader::read_bytes(&tcp_segment[..TcpHeader::BYTE_LEN]);
        let flags = header.offset_flags.flags();

        if flags & TCP_RST != 0 && self.state != TcpState::Closed {
            warn!("tcp: RST received, closing");
            self.state = TcpState::Closed;
            return;
        }

        if !self.validate_ack(header.ack) {
            trace!("tcp: ack mismatch, dropping");
            return;
        }

        match self.state {
            TcpState::SynSent if flags & (TCP_SYN | TCP_ACK) == (TCP_SYN | TCP_ACK) => {
                self.socket.ack_expected = header.seq.wrapping_add(1);
                self.send(phy, TCP_ACK);
                self.state = TcpState::Established;
                debug!("tcp: ESTABLISHED");
            }
            TcpState::Established if flags & TCP_ACK != 0 => {
                self.socket.seq = header.ack;
                if flags & TCP_PSH != 0 {
                    let header_len = header.header_len_bytes();
                    let data_len = tcp_segment.len().saturating_sub(header_len);
                    self.socket.ack_expected = self.socket.ack_expected.wrapping_add(data_len as u32);
                    self.send(phy, TCP_ACK);
                } else if flags & TCP_FIN != 0 {
                    self.socket.ack_expected = self.socket.ack_expected.wrapping_add(1);
                    self.send(phy, TCP_ACK);
                    self.state = TcpState::Closed;
                    debug!("tcp: CLOSED (peer FIN)");
                }
            }
            TcpState::CloseWait if flags & TCP_ACK != 0 => {
                self.state = TcpState::Closed;
                debug!("tcp: CLOSED (our FIN acked)");
            }
            _ => {
                trace!("tcp: ignoring flags={:#x} in state {:?}", flags, self.state);
            }
        }
    }
}
