//! Dynamic Host Configuration Protocol client (C2 option codec + C4 FSM).
//!
//! Partial implementation per IETF-RFC-2131, scoped to what a client needs:
//! discover/offer/request/ack, renew/rebind, decline-on-conflict, and
//! release. The Ethernet destination stays broadcast for every DHCP message
//! regardless of client state — only the IP destination goes unicast, and
//! only while renewing. Shaped after the sibling `w5500-dhcp` crate in this
//! family: a `poll` entry point returning a fatal event, named timer fields
//! rather than a generic event queue.

use crate::iface::EthPhy;
use crate::timer::{TimerId, TimerRegistry};
use crate::{DhcpFatal, IpV4Addr, MacAddr, OptionError};
use byte_struct::*;
use ufmt::derive::uDebug;

/// DHCP's "magic cookie", the four bytes that separate the fixed BOOTP
/// header from the options area.
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Option tag: subnet mask.
pub const OPT_SUBNET_MASK: u8 = 1;
/// Option tag: router (gateway).
pub const OPT_ROUTER: u8 = 3;
/// Option tag: domain name server.
pub const OPT_DNS: u8 = 6;
/// Option tag: requested IP address (client to server).
pub const OPT_REQUESTED_IP: u8 = 50;
/// Option tag: IP address lease time, seconds.
pub const OPT_LEASE_TIME: u8 = 51;
/// Option tag: DHCP message type.
pub const OPT_MSG_TYPE: u8 = 53;
/// Option tag: server identifier.
pub const OPT_SERVER_ID: u8 = 54;
/// Option tag: parameter request list.
pub const OPT_PARAM_REQUEST_LIST: u8 = 55;
/// Option tag: renewal (T1) time, seconds.
pub const OPT_RENEWAL_T1: u8 = 58;
/// Option tag: rebinding (T2) time, seconds.
pub const OPT_REBINDING_T2: u8 = 59;
/// Option tag: client identifier.
pub const OPT_CLIENT_ID: u8 = 61;
/// Sentinel tag that ends the options area.
pub const OPT_END: u8 = 0xFF;
/// Pad tag, skipped without a length byte.
pub const OPT_PAD: u8 = 0x00;

/// Parameters this client always asks a server for, in the order the
/// original source lists them: subnet mask, router, DNS, T1, T2.
pub const PARAMETER_REQUEST_LIST: [u8; 5] = [
    OPT_SUBNET_MASK,
    OPT_ROUTER,
    OPT_DNS,
    OPT_RENEWAL_T1,
    OPT_REBINDING_T2,
];

/// How long a re-probe of the offered address waits before resending, and
/// how long the whole conflict-resolution window stays open. Picked short
/// enough to exercise in a test suite that advances a simulated clock one
/// second at a time; see DESIGN.md.
pub const ARP_PROBE_RESEND_SECS: u32 = 1;
/// Total time the client waits for a conflicting ARP reply before
/// committing the offered address.
pub const ARP_CONFLICT_WINDOW_SECS: u32 = 2;
/// Period of the periodic discover/request retry timers.
pub const RETRY_TIMER_SECS: u32 = 5;

/// Failed-discover count at which the client gives up and asks the caller
/// to reboot.
pub const MAX_FAILED_DISCOVERS: u8 = 2;
/// Failed-request count at which the client restarts from `INIT` rather
/// than rebooting.
pub const MAX_FAILED_REQUESTS: u8 = 4;

/// BOOTP `op` values.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
#[repr(u8)]
pub enum BootpOp {
    /// Anything coming from the client.
    Request = 1,
    /// Anything coming from the server.
    Reply = 2,
    /// Not a valid BOOTP op.
    Unimplemented,
}

impl ByteStructLen for BootpOp {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for BootpOp {
    fn read_bytes(bytes: &[u8]) -> Self {
        match bytes[0] {
            x if x == BootpOp::Request as u8 => BootpOp::Request,
            x if x == BootpOp::Reply as u8 => BootpOp::Reply,
            _ => BootpOp::Unimplemented,
        }
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

/// DHCP message kinds (option 53's value).
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpMessageType {
    /// Client broadcast to locate available servers.
    Discover = 1,
    /// Server offer of configuration parameters.
    Offer = 2,
    /// Client request for offered or previously-bound parameters.
    Request = 3,
    /// Client notice that the offered address is already in use.
    Decline = 4,
    /// Server acknowledgement with the committed address.
    Ack = 5,
    /// Server refusal.
    Nak = 6,
    /// Client relinquishment of the address and remaining lease.
    Release = 7,
    /// Not a recognized message type.
    Unimplemented,
}

impl From<u8> for DhcpMessageType {
    fn from(value: u8) -> Self {
        match value {
            x if x == DhcpMessageType::Discover as u8 => DhcpMessageType::Discover,
            x if x == DhcpMessageType::Offer as u8 => DhcpMessageType::Offer,
            x if x == DhcpMessageType::Request as u8 => DhcpMessageType::Request,
            x if x == DhcpMessageType::Decline as u8 => DhcpMessageType::Decline,
            x if x == DhcpMessageType::Ack as u8 => DhcpMessageType::Ack,
            x if x == DhcpMessageType::Nak as u8 => DhcpMessageType::Nak,
            x if x == DhcpMessageType::Release as u8 => DhcpMessageType::Release,
            _ => DhcpMessageType::Unimplemented,
        }
    }
}

/// The fixed 236-byte BOOTP header plus the 4-byte magic cookie (240 bytes
/// total), per IETF-RFC-2131 §2. The options area that follows is variable
/// length and is handled by [`get_option`] rather than as a struct field.
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct DhcpHeader {
    /// Message op code. 1 = BOOTREQUEST, 2 = BOOTREPLY.
    pub op: BootpOp,
    /// Hardware type, always 1 (Ethernet) here.
    pub htype: u8,
    /// Hardware address length, always 6 (standard MAC) here.
    pub hlen: u8,
    /// Relay-agent hop count; always 0, this client never relays.
    pub hops: u8,
    /// Transaction id correlating a request with its response.
    pub xid: u32,
    /// Seconds elapsed since the client began the transaction. Unused.
    pub secs: u16,
    /// Bit 15 is the broadcast flag; the rest are reserved.
    pub flags: u16,
    /// Client's own IP, when it already has one (renew/rebind).
    pub ciaddr: IpV4Addr,
    /// "Your" IP, filled in by the server.
    pub yiaddr: IpV4Addr,
    /// Next-server IP. Unused by this client.
    pub siaddr: IpV4Addr,
    /// Relay-agent IP. Unused by this client.
    pub giaddr: IpV4Addr,
    /// Client hardware address.
    pub chaddr: MacAddr,
    _chaddr_pad: crate::ByteArray<10>,
    _sname: crate::ByteArray<64>,
    _file: crate::ByteArray<128>,
    /// Must equal [`MAGIC_COOKIE`] for the options area to be well-formed.
    pub magic_cookie: u32,
}

impl DhcpHeader {
    /// Size of the fixed header plus magic cookie, in bytes (240).
    pub const BYTE_LEN: usize = 240;

    const BROADCAST_FLAG: u16 = 0x8000;

    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

/// Scan a DHCP options area (the bytes immediately following the magic
/// cookie) for `tag`, returning the byte offset of its value and its
/// length. Reads tag, then length, then advances `tag + len + 2` bytes,
/// stops at the [`OPT_END`] sentinel.
pub fn get_option(options: &[u8], tag: u8) -> Result<(usize, u8), OptionError> {
    let mut idx = 0_usize;
    while idx < options.len() {
        let this_tag = options[idx];
        if this_tag == OPT_END {
            return Err(OptionError::Missing);
        }
        if this_tag == OPT_PAD {
            idx += 1;
            continue;
        }
        let len = *options.get(idx + 1).ok_or(OptionError::Truncated)? as usize;
        let value_start = idx + 2;
        let value_end = value_start.checked_add(len).ok_or(OptionError::Truncated)?;
        if value_end > options.len() {
            return Err(OptionError::Truncated);
        }
        if this_tag == tag {
            return Ok((value_start, len as u8));
        }
        idx = value_end;
    }
    Err(OptionError::Missing)
}

/// Read a one-byte option's value (e.g. the message type, option 53).
pub fn get_option_u8(options: &[u8], tag: u8) -> Result<u8, OptionError> {
    let (start, len) = get_option(options, tag)?;
    if len != 1 {
        return Err(OptionError::Truncated);
    }
    Ok(options[start])
}

/// Read a four-byte big-endian integer option (e.g. the lease time).
pub fn get_option_u32(options: &[u8], tag: u8) -> Result<u32, OptionError> {
    let (start, len) = get_option(options, tag)?;
    if len != 4 {
        return Err(OptionError::Truncated);
    }
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(&options[start..start + 4]);
    Ok(u32::from_be_bytes(buf))
}

/// Read a four-octet IPv4 address option (subnet mask, router, DNS, server
/// identifier, requested IP).
pub fn get_option_ipv4(options: &[u8], tag: u8) -> Result<IpV4Addr, OptionError> {
    let (start, len) = get_option(options, tag)?;
    if len != 4 {
        return Err(OptionError::Truncated);
    }
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(&options[start..start + 4]);
    Ok(IpV4Addr::new(buf))
}

/// A small cursor for appending TLV options into a caller-supplied buffer,
/// mirroring the write-side of the sibling `w5500-dhcp` crate's `PktSer`
/// but scoped to just the options area (the fixed header is filled in
/// separately via [`DhcpHeader`]).
struct OptionWriter<'a> {
    buf: &'a mut [u8],
    ptr: usize,
}

impl<'a> OptionWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, ptr: 0 }
    }

    fn put(&mut self, tag: u8, value: &[u8]) {
        self.buf[self.ptr] = tag;
        self.buf[self.ptr + 1] = value.len() as u8;
        self.buf[self.ptr + 2..self.ptr + 2 + value.len()].copy_from_slice(value);
        self.ptr += 2 + value.len();
    }

    fn msg_type(&mut self, kind: DhcpMessageType) {
        self.put(OPT_MSG_TYPE, &[kind as u8]);
    }

    fn param_request_list(&mut self) {
        self.put(OPT_PARAM_REQUEST_LIST, &PARAMETER_REQUEST_LIST);
    }

    fn server_id(&mut self, ip: IpV4Addr) {
        self.put(OPT_SERVER_ID, &ip.to_be_bytes());
    }

    fn requested_ip(&mut self, ip: IpV4Addr) {
        self.put(OPT_REQUESTED_IP, &ip.to_be_bytes());
    }

    fn client_id(&mut self, mac: MacAddr) {
        let mut value = [0_u8; 7];
        value[0] = 1; // htype: Ethernet
        value[1..].copy_from_slice(&mac.to_be_bytes());
        self.put(OPT_CLIENT_ID, &value);
    }

    fn end(&mut self) -> usize {
        self.buf[self.ptr] = OPT_END;
        self.ptr += 1;
        self.ptr
    }
}

/// DHCP client states. Exactly one value holds at any time.
#[derive(Clone, Copy, Debug, uDebug, PartialEq, Eq)]
pub enum DhcpState {
    /// Not running; no timers armed, no lease held.
    Disabled,
    /// About to (re-)send DISCOVER.
    Init,
    /// DISCOVER sent, waiting for an OFFER.
    Selecting,
    /// REQUEST sent in response to an OFFER, waiting for ACK/NAK.
    Requesting,
    /// ACK accepted; probing the offered address for a conflict before
    /// committing it.
    TestingIp,
    /// Holding a confirmed, conflict-free lease.
    Bound,
    /// T1 elapsed; re-requesting the same address from the same server.
    Renewing,
    /// T2 elapsed; re-requesting the address by broadcast.
    Rebinding,
}

impl Default for DhcpState {
    fn default() -> Self {
        DhcpState::Disabled
    }
}

/// The client's view of its current binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhcpLease {
    /// The address offered and (once bound) held.
    pub offered: IpV4Addr,
    /// The server that offered/acked it.
    pub server: IpV4Addr,
    /// Total lease duration, seconds.
    pub total: u32,
    /// Renewal timer, seconds from lease start.
    pub t1: u32,
    /// Rebinding timer, seconds from lease start.
    pub t2: u32,
    /// Subnet mask, if the server supplied one.
    pub subnet: Option<IpV4Addr>,
    /// Default gateway, if the server supplied one.
    pub gateway: Option<IpV4Addr>,
    /// DNS server, if the server supplied one.
    pub dns: Option<IpV4Addr>,
}

/// Failed-attempt counters, reset to zero on progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhcpCounters {
    /// Consecutive `discovery_timeout` firings with no OFFER accepted.
    pub failed_discovers: u8,
    /// Consecutive `request_timeout` firings with no ACK accepted.
    pub failed_requests: u8,
}

/// Independent booleans set by timer callbacks or inbound-frame handlers
/// and cleared by the foreground consumer once the corresponding action has
/// been taken.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingFlags {
    /// T1 fired; renew the lease with the same server.
    pub renew: bool,
    /// T2 fired; rebind by broadcast.
    pub rebind: bool,
    /// The caller asked to give up the lease.
    pub release: bool,
    /// A REQUEST (or its retry) is due.
    pub request: bool,
    /// Set when a DISCOVER retry is about to go out with a fresh xid;
    /// cleared on the next accepted OFFER. Informational — see
    /// [`TimerRegistry`]'s "unless already present" timer-arming rule,
    /// which this flag does not gate (DESIGN.md).
    pub extra_discover_needed: bool,
    /// The ARP conflict-resolution window closed with no conflict found.
    pub arp_all_clear: bool,
    /// While true, inbound ARPs are inspected for an address conflict.
    pub conflict_resolution_mode: bool,
    /// An ARP probe of the offered address is due.
    pub send_test_arp: bool,
}

/// DHCPv4 client state machine (C4).
pub struct DhcpClient {
    state: DhcpState,
    lease: DhcpLease,
    counters: DhcpCounters,
    flags: PendingFlags,
    xid: u32,
    rand: crate::rand::Rand,
    timers: TimerRegistry<7>,
    discovery_timer: Option<TimerId>,
    request_timer: Option<TimerId>,
    t1_timer: Option<TimerId>,
    t2_timer: Option<TimerId>,
    lease_timer: Option<TimerId>,
    arp_timer: Option<TimerId>,
    test_arp_timer: Option<TimerId>,
}

/// Largest frame this client ever builds: 14 (Ethernet) + 20 (IPv4) + 8
/// (UDP) + 240 (DHCP fixed header) + options (message type 3 + param list 7
/// + server id 6 + requested ip 6 + client id 9 + end 1 = 32, rounded up).
const MAX_FRAME_LEN: usize = 14 + 20 + 8 + DhcpHeader::BYTE_LEN + 40;

impl DhcpClient {
    /// A new, disabled client. `seed` feeds the xid/sequence PRNG (this
    /// crate has no hardware RNG of its own — see [`crate::rand`]).
    pub fn new(seed: u64) -> Self {
        let mut rand = crate::rand::Rand::new(seed);
        let xid = rand.next_u32();
        Self {
            state: DhcpState::Disabled,
            lease: DhcpLease::default(),
            counters: DhcpCounters::default(),
            flags: PendingFlags::default(),
            xid,
            rand,
            timers: TimerRegistry::new(),
            discovery_timer: None,
            request_timer: None,
            t1_timer: None,
            t2_timer: None,
            lease_timer: None,
            arp_timer: None,
            test_arp_timer: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DhcpState {
        self.state
    }

    /// The current lease record, if one is held. `Some` only while
    /// `state()` is `Bound`, `Renewing`, or `Rebinding`; `None` at every
    /// other state, even if a stale lease record is still sitting in
    /// `self.lease` from before a release or conflict.
    pub fn lease(&self) -> Option<&DhcpLease> {
        match self.state {
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding => Some(&self.lease),
            _ => None,
        }
    }

    /// Total lease duration in seconds.
    pub fn lease_seconds(&self) -> u32 {
        self.lease.total
    }

    /// Whether the client is doing anything at all.
    pub fn is_enabled(&self) -> bool {
        self.state != DhcpState::Disabled
    }

    /// `DISABLED -> INIT`.
    pub fn enable(&mut self) {
        if self.state == DhcpState::Disabled {
            debug!("dhcp: enabling");
            self.state = DhcpState::Init;
        }
    }

    /// Stop all timers, clear every flag, drop the lease, and go
    /// `DISABLED`. This does not itself write an
    /// interface IP — the caller observes the edge into `Disabled` and
    /// applies `0.0.0.0` to its own interface.
    pub fn disable(&mut self) {
        debug!("dhcp: disabling");
        self.timers.stop_all();
        self.discovery_timer = None;
        self.request_timer = None;
        self.t1_timer = None;
        self.t2_timer = None;
        self.lease_timer = None;
        self.arp_timer = None;
        self.test_arp_timer = None;
        self.flags = PendingFlags::default();
        self.lease = DhcpLease::default();
        self.counters = DhcpCounters::default();
        self.state = DhcpState::Disabled;
    }

    /// Ask for a renew on the next poll. Never blocks, never transmits
    /// directly.
    pub fn request_renew(&mut self) {
        self.flags.renew = true;
    }

    /// Ask for a rebind on the next poll.
    pub fn request_rebind(&mut self) {
        self.flags.rebind = true;
    }

    /// Ask for a release on the next poll.
    pub fn request_release(&mut self) {
        self.flags.release = true;
    }

    fn rearm_oneshot(&mut self, current: Option<TimerId>, seconds: u32) -> Option<TimerId> {
        if let Some(existing) = current {
            if self.timers.restart_oneshot_with(existing, seconds) {
                return Some(existing);
            }
        }
        self.timers.start_oneshot(seconds)
    }

    fn arm_request_timer(&mut self) {
        match self.request_timer {
            Some(id) if self.timers.restart(id) => {}
            _ => self.request_timer = self.timers.start_periodic(RETRY_TIMER_SECS),
        }
    }

    /// Advance the internal clock by `elapsed_secs` and process any timers
    /// that fire as a result. Returns a fatal event if the lease expired or
    /// discovery was exhausted — the caller binds that to a platform reset
    /// rather than this module resetting anything itself.
    pub fn advance(&mut self, elapsed_secs: u32) -> Option<DhcpFatal> {
        if elapsed_secs == 0 {
            return None;
        }
        self.timers.advance(elapsed_secs);

        let discovery_timer = self.discovery_timer;
        let request_timer = self.request_timer;
        let t1_timer = self.t1_timer;
        let t2_timer = self.t2_timer;
        let lease_timer = self.lease_timer;
        let arp_timer = self.arp_timer;
        let test_arp_timer = self.test_arp_timer;

        let mut fired = [None; 7];
        let mut n = 0;
        self.timers.poll_expired(|id| {
            if n < fired.len() {
                fired[n] = Some(id);
                n += 1;
            }
        });

        for id in fired.iter().take(n).filter_map(|x| *x) {
            if Some(id) == discovery_timer {
                self.counters.failed_discovers = self.counters.failed_discovers.saturating_add(1);
                warn!("dhcp: discovery_timeout ({})", self.counters.failed_discovers);
                if self.counters.failed_discovers >= MAX_FAILED_DISCOVERS {
                    error!("dhcp: discovery exhausted, giving up");
                    self.state = DhcpState::Disabled;
                    return Some(DhcpFatal::DiscoverExhausted);
                }
                self.flags.extra_discover_needed = true;
                self.state = DhcpState::Init;
            } else if Some(id) == request_timer {
                self.flags.request = true;
                self.counters.failed_requests = self.counters.failed_requests.saturating_add(1);
                warn!("dhcp: request_timeout ({})", self.counters.failed_requests);
                if self.counters.failed_requests >= MAX_FAILED_REQUESTS {
                    self.state = DhcpState::Init;
                }
            } else if Some(id) == t1_timer {
                debug!("dhcp: t1_timeout");
                self.flags.renew = true;
            } else if Some(id) == t2_timer {
                debug!("dhcp: t2_timeout");
                self.flags.rebind = true;
            } else if Some(id) == lease_timer {
                error!("dhcp: lease expired with no renewal");
                self.state = DhcpState::Disabled;
                return Some(DhcpFatal::LeaseExpired);
            } else if Some(id) == arp_timer {
                debug!("dhcp: arp_timeout");
                self.flags.arp_all_clear = true;
                self.flags.conflict_resolution_mode = false;
                if let Some(tid) = self.test_arp_timer.take() {
                    self.timers.stop(tid);
                }
            } else if Some(id) == test_arp_timer {
                if self.flags.conflict_resolution_mode {
                    self.flags.send_test_arp = true;
                }
            }
        }
        None
    }

    fn encode_frame(&self, buf: &mut [u8; MAX_FRAME_LEN], mac: MacAddr, kind: DhcpMessageType) -> usize {
        let unicast_to_server = self.state == DhcpState::Renewing || kind == DhcpMessageType::Release;
        let src_ip = match self.state {
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding => self.lease.offered,
            _ => IpV4Addr::ANY,
        };
        let dst_ip = if unicast_to_server {
            self.lease.server
        } else {
            IpV4Addr::BROADCAST
        };
        let ciaddr = if matches!(self.state, DhcpState::Renewing | DhcpState::Rebinding) {
            self.lease.offered
        } else {
            IpV4Addr::ANY
        };
        let flags = if self.state == DhcpState::Renewing {
            0
        } else {
            DhcpHeader::BROADCAST_FLAG
        };

        let header = DhcpHeader {
            op: BootpOp::Request,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags,
            ciaddr,
            yiaddr: IpV4Addr::ANY,
            siaddr: IpV4Addr::ANY,
            giaddr: IpV4Addr::ANY,
            chaddr: mac,
            _chaddr_pad: crate::ByteArray([0; 10]),
            _sname: crate::ByteArray([0; 64]),
            _file: crate::ByteArray([0; 128]),
            magic_cookie: MAGIC_COOKIE,
        };

        const ETH_LEN: usize = 14;
        const IP_LEN: usize = crate::ip::IpV4Header::BYTE_LEN;
        const UDP_LEN: usize = crate::udp::UdpHeader::BYTE_LEN;
        const DHCP_HDR_OFFSET: usize = ETH_LEN + IP_LEN + UDP_LEN;

        header.write_bytes(&mut buf[DHCP_HDR_OFFSET..DHCP_HDR_OFFSET + DhcpHeader::BYTE_LEN]);

        let mut writer = OptionWriter::new(&mut buf[DHCP_HDR_OFFSET + DhcpHeader::BYTE_LEN..]);
        writer.msg_type(kind);
        writer.param_request_list();

        let include_server_id = (self.state == DhcpState::Selecting
            && kind == DhcpMessageType::Request)
            || kind == DhcpMessageType::Decline
            || kind == DhcpMessageType::Release;
        if include_server_id {
            writer.server_id(self.lease.server);
        }

        let include_requested_ip =
            (self.state == DhcpState::Selecting && kind == DhcpMessageType::Request)
                || kind == DhcpMessageType::Decline;
        if include_requested_ip {
            writer.requested_ip(self.lease.offered);
        }

        if self.state == DhcpState::Renewing {
            writer.client_id(mac);
        }

        let options_len = writer.end();
        let dhcp_len = DhcpHeader::BYTE_LEN + options_len;

        let mut udp_header = crate::udp::UdpHeader::new_dhcp(dhcp_len);
        let udp_checksum = crate::udp::calc_udp_checksum(
            src_ip,
            dst_ip,
            &udp_header,
            &buf[DHCP_HDR_OFFSET..DHCP_HDR_OFFSET + dhcp_len],
        );
        udp_header.checksum = udp_checksum;
        udp_header.write_bytes(&mut buf[ETH_LEN + IP_LEN..ETH_LEN + IP_LEN + UDP_LEN]);

        let mut ip_header = crate::ip::IpV4Header::new(crate::Protocol::Udp, src_ip, dst_ip);
        ip_header.total_length = (IP_LEN + UDP_LEN + dhcp_len) as u16;
        ip_header.calc_checksum();
        ip_header.write_bytes(&mut buf[ETH_LEN..ETH_LEN + IP_LEN]);

        let eth_header = crate::enet::EthernetHeader {
            dst_macaddr: MacAddr::BROADCAST,
            src_macaddr: mac,
            ethertype: crate::enet::EtherType::IpV4,
        };
        eth_header.write_bytes(&mut buf[0..ETH_LEN]);

        ETH_LEN + IP_LEN + UDP_LEN + dhcp_len
    }

    fn send<P: EthPhy>(&mut self, phy: &mut P, kind: DhcpMessageType) {
        let mac = phy.mac_address();
        let mut buf = [0_u8; MAX_FRAME_LEN];
        let len = self.encode_frame(&mut buf, mac, kind);
        debug!("dhcp: tx {:?}", kind);
        phy.send(&buf[..len]);
    }

    /// The per-main-loop "send pending" step. Emits at most one frame;
    /// flags are mutually exclusive per-iteration by construction.
    pub fn poll<P: EthPhy>(&mut self, phy: &mut P) {
        if self.flags.send_test_arp {
            self.flags.send_test_arp = false;
            let mac = phy.mac_address();
            let probe = crate::arp::ArpPayload::new_probe(mac, self.lease.offered);
            send_arp(phy, mac, probe);
            return;
        }

        if self.state == DhcpState::Init {
            self.xid = self.rand.next_u32();
            self.send(phy, DhcpMessageType::Discover);
            self.state = DhcpState::Selecting;
            if self.discovery_timer.is_none() {
                self.discovery_timer = self.timers.start_periodic(RETRY_TIMER_SECS);
            }
            return;
        }

        if self.flags.release {
            self.send(phy, DhcpMessageType::Release);
            self.lease = DhcpLease::default();
            self.timers.stop_all();
            self.discovery_timer = None;
            self.request_timer = None;
            self.t1_timer = None;
            self.t2_timer = None;
            self.lease_timer = None;
            self.arp_timer = None;
            self.test_arp_timer = None;
            self.flags.release = false;
            return;
        }

        if self.flags.renew {
            self.state = DhcpState::Renewing;
            self.send(phy, DhcpMessageType::Request);
            self.arm_request_timer();
            self.flags.renew = false;
            self.flags.request = false;
            return;
        }

        if self.flags.rebind {
            self.state = DhcpState::Rebinding;
            self.send(phy, DhcpMessageType::Request);
            self.arm_request_timer();
            self.flags.rebind = false;
            return;
        }

        if self.flags.request {
            match self.state {
                DhcpState::Selecting => {
                    self.send(phy, DhcpMessageType::Request);
                    self.state = DhcpState::Requesting;
                }
                DhcpState::Renewing | DhcpState::Rebinding => {
                    self.send(phy, DhcpMessageType::Request);
                }
                _ => {}
            }
            self.arm_request_timer();
            self.flags.request = false;
            return;
        }

        if self.flags.arp_all_clear && self.state == DhcpState::TestingIp {
            debug!("dhcp: committing lease, BOUND");
            self.state = DhcpState::Bound;
            self.lease_timer = self.timers.start_oneshot(self.lease.total);
            self.t1_timer = self.timers.start_oneshot(self.lease.t1);
            self.t2_timer = self.timers.start_oneshot(self.lease.t2);
        }
    }

    /// Handle an inbound DHCP reply. `dhcp_payload` starts at the BOOTP
    /// `op` byte (the caller — [`crate::dispatch`] — has already confirmed
    /// this is a UDP 67->68 datagram before calling).
    pub fn process_response(&mut self, dhcp_payload: &[u8]) {
        if dhcp_payload.len() < DhcpHeader::BYTE_LEN {
            trace!("dhcp: response too short to hold a header, dropping");
            return;
        }
        let header = DhcpHeader::read_bytes(&dhcp_payload[..DhcpHeader::BYTE_LEN]);
        if header.op != BootpOp::Reply {
            trace!("dhcp: not a BOOTREPLY, dropping");
            return;
        }
        if header.xid != self.xid {
            trace!("dhcp: xid mismatch, dropping");
            return;
        }
        if header.magic_cookie != MAGIC_COOKIE {
            trace!("dhcp: bad magic cookie, dropping");
            return;
        }
        let options = &dhcp_payload[DhcpHeader::BYTE_LEN..];
        let msg_type = match get_option_u8(options, OPT_MSG_TYPE) {
            Ok(v) => DhcpMessageType::from(v),
            Err(_) => {
                trace!("dhcp: missing option 53, dropping");
                return;
            }
        };

        match (self.state, msg_type) {
            (DhcpState::Selecting, DhcpMessageType::Offer) => {
                if let Some(id) = self.discovery_timer.take() {
                    self.timers.stop(id);
                }
                self.flags.extra_discover_needed = false;
                self.counters.failed_discovers = 0;
                self.lease.offered = header.yiaddr;
                if let Ok(sid) = get_option_ipv4(options, OPT_SERVER_ID) {
                    self.lease.server = sid;
                }
                debug!("dhcp: offer accepted");
                self.flags.request = true;
            }
            (DhcpState::Requesting, DhcpMessageType::Ack) => {
                if let Some(id) = self.request_timer.take() {
                    self.timers.stop(id);
                }
                match get_option_u32(options, OPT_LEASE_TIME) {
                    Ok(total) => {
                        self.commit_ack_fields(&header, options, total);
                        self.state = DhcpState::TestingIp;
                        self.flags.conflict_resolution_mode = true;
                        self.arp_timer = self.rearm_oneshot(self.arp_timer, ARP_CONFLICT_WINDOW_SECS);
                        self.test_arp_timer = match self.test_arp_timer {
                            Some(id) if self.timers.restart(id) => Some(id),
                            _ => self.timers.start_periodic(ARP_PROBE_RESEND_SECS),
                        };
                        // Fire the first probe on the very next poll rather than
                        // waiting a full ARP_PROBE_RESEND_SECS for the periodic
                        // timer's first tick.
                        self.flags.send_test_arp = true;
                    }
                    Err(_) => {
                        warn!("dhcp: ACK missing lease time, not committing");
                    }
                }
            }
            (DhcpState::Renewing | DhcpState::Rebinding, DhcpMessageType::Ack) => {
                if let Some(id) = self.request_timer.take() {
                    self.timers.stop(id);
                }
                if let Ok(total) = get_option_u32(options, OPT_LEASE_TIME) {
                    self.commit_ack_fields(&header, options, total);
                    self.lease_timer = self.rearm_oneshot(self.lease_timer, self.lease.total);
                    self.t1_timer = self.rearm_oneshot(self.t1_timer, self.lease.t1);
                    self.t2_timer = self.rearm_oneshot(self.t2_timer, self.lease.t2);
                }
                self.state = DhcpState::Bound;
            }
            (
                DhcpState::Selecting | DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding,
                DhcpMessageType::Nak,
            ) => {
                warn!("dhcp: NAK received, restarting from INIT");
                self.lease = DhcpLease::default();
                self.state = DhcpState::Init;
            }
            _ => {
                trace!("dhcp: ignoring {:?} in state {:?}", msg_type, self.state);
            }
        }
    }

    fn commit_ack_fields(&mut self, header: &DhcpHeader, options: &[u8], total: u32) {
        self.lease.offered = header.yiaddr;
        if let Ok(sid) = get_option_ipv4(options, OPT_SERVER_ID) {
            self.lease.server = sid;
        }
        self.lease.subnet = get_option_ipv4(options, OPT_SUBNET_MASK).ok();
        self.lease.gateway = get_option_ipv4(options, OPT_ROUTER).ok();
        self.lease.dns = get_option_ipv4(options, OPT_DNS).ok();
        self.lease.total = total;
        self.lease.t1 = get_option_u32(options, OPT_RENEWAL_T1).unwrap_or(total / 2);
        self.lease.t2 = get_option_u32(options, OPT_REBINDING_T2).unwrap_or(total * 7 / 8);
    }

    /// Handle an inbound ARP during the conflict-resolution window.
    pub fn process_arp_response<P: EthPhy>(&mut self, arp: &crate::arp::ArpPayload, phy: &mut P) {
        if self.flags.arp_all_clear || !self.flags.conflict_resolution_mode {
            return;
        }
        if let Some(id) = self.arp_timer.take() {
            self.timers.stop(id);
        }
        let mac = phy.mac_address();
        if arp.src_mac == mac {
            trace!("dhcp: ARP loopback of our own probe");
            self.arp_timer = self.timers.start_oneshot(ARP_CONFLICT_WINDOW_SECS);
            return;
        }
        if arp.src_ipaddr == self.lease.offered {
            warn!("dhcp: address conflict detected, declining");
            self.send(phy, DhcpMessageType::Decline);
            self.lease = DhcpLease::default();
            self.state = DhcpState::Init;
            self.flags.conflict_resolution_mode = false;
            if let Some(id) = self.test_arp_timer.take() {
                self.timers.stop(id);
            }
        } else {
            self.arp_timer = self.timers.start_oneshot(ARP_CONFLICT_WINDOW_SECS);
        }
    }
}

fn send_arp<P: EthPhy>(phy: &mut P, mac: MacAddr, payload: crate::arp::ArpPayload) {
    let mut buf = [0_u8; 14 + crate::arp::ArpPayload::BYTE_LEN];
    let eth_header = crate::enet::EthernetHeader {
        dst_macaddr: MacAddr::BROADCAST,
        src_macaddr: mac,
        ethertype: crate::enet::EtherType::Arp,
    };
    eth_header.write_bytes(&mut buf[0..14]);
    payload.write_bytes(&mut buf[14..]);
    phy.send(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_buf_with(tags: &[(u8, &[u8])]) -> [u8; 64] {
        let mut buf = [0_u8; 64];
        let mut w = OptionWriter::new(&mut buf);
        for (tag, value) in tags {
            w.put(*tag, value);
        }
        w.end();
        buf
    }

    #[test]
    fn test_option_round_trip_every_permutation() {
        // Encode a list of known tags in every order; decode must still match.
        let orderings: [[(u8, &[u8]); 3]; 3] = [
            [
                (OPT_SUBNET_MASK, &[255, 255, 255, 0]),
                (OPT_ROUTER, &[192, 168, 1, 1]),
                (OPT_LEASE_TIME, &[0, 0, 14, 16]),
            ],
            [
                (OPT_ROUTER, &[192, 168, 1, 1]),
                (OPT_LEASE_TIME, &[0, 0, 14, 16]),
                (OPT_SUBNET_MASK, &[255, 255, 255, 0]),
            ],
            [
                (OPT_LEASE_TIME, &[0, 0, 14, 16]),
                (OPT_SUBNET_MASK, &[255, 255, 255, 0]),
                (OPT_ROUTER, &[192, 168, 1, 1]),
            ],
        ];
        for ordering in orderings {
            let buf = options_buf_with(&ordering);
            for (tag, value) in ordering {
                let (start, len) = get_option(&buf, tag).unwrap();
                assert_eq!(len as usize, value.len());
                assert_eq!(&buf[start..start + value.len()], value);
            }
        }
    }

    #[test]
    fn test_option_missing() {
        let buf = options_buf_with(&[(OPT_SUBNET_MASK, &[255, 255, 255, 0])]);
        assert_eq!(get_option(&buf, OPT_ROUTER), Err(OptionError::Missing));
    }

    #[test]
    fn test_option_pad_is_skipped() {
        let mut buf = [0_u8; 16];
        buf[0] = OPT_PAD;
        buf[1] = OPT_PAD;
        buf[2] = OPT_ROUTER;
        buf[3] = 4;
        buf[4..8].copy_from_slice(&[10, 0, 0, 1]);
        buf[8] = OPT_END;
        let (start, len) = get_option(&buf, OPT_ROUTER).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&buf[start..start + 4], &[10, 0, 0, 1]);
    }

    #[test]
    fn test_lease_defaults_t1_t2_when_absent() {
        let mut client = DhcpClient::new(1);
        client.state = DhcpState::Requesting;
        client.xid = 0xABCD;
        let mut payload = vec![0_u8; DhcpHeader::BYTE_LEN];
        let header = DhcpHeader {
            op: BootpOp::Reply,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0xABCD,
            secs: 0,
            flags: 0,
            ciaddr: IpV4Addr::ANY,
            yiaddr: IpV4Addr::new([192, 168, 1, 50]),
            siaddr: IpV4Addr::ANY,
            giaddr: IpV4Addr::ANY,
            chaddr: MacAddr::ANY,
            _chaddr_pad: crate::ByteArray([0; 10]),
            _sname: crate::ByteArray([0; 64]),
            _file: crate::ByteArray([0; 128]),
            magic_cookie: MAGIC_COOKIE,
        };
        header.write_bytes(&mut payload);
        let mut opt_buf = [0_u8; 64];
        let mut w = OptionWriter::new(&mut opt_buf);
        w.msg_type(DhcpMessageType::Ack);
        w.server_id(IpV4Addr::new([192, 168, 1, 1]));
        w.put(OPT_LEASE_TIME, &3600_u32.to_be_bytes());
        w.end();
        payload.extend_from_slice(&opt_buf);

        client.process_response(&payload);
        assert_eq!(client.lease.total, 3600);
        assert_eq!(client.lease.t1, 1800);
        assert_eq!(client.lease.t2, 3150);
        assert_eq!(client.state(), DhcpState::TestingIp);
    }
}
