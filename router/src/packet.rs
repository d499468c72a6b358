//! Ethernet, ARP, IPv4, TCP, UDP and ICMP framing.
//!
//! Every header is parsed into an owned struct after its length has been
//! validated, and serialized back with freshly computed checksums.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use thiserror::Error;

pub const ETH_HEADER_LEN: usize = 14;
pub const ARP_PACKET_LEN: usize = 28;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;
/// Transport bytes an ICMP error quotes after the IP header (RFC 792).
pub const ICMP_QUOTED_TRANSPORT_LEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETER_PROBLEM: u8 = 12;

const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated {what}: need {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("unsupported IP version {0}")]
    Version(u8),

    #[error("invalid {what} header length {len}")]
    HeaderLength { what: &'static str, len: usize },

    #[error("IPv4 header checksum mismatch")]
    Checksum,

    #[error("invalid MAC address: {0}")]
    MacAddr(String),
}

fn need(what: &'static str, buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::Truncated {
            what,
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    fn from_slice(b: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&b[..6]);
        MacAddr(mac)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in mac.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| PacketError::MacAddr(s.to_string()))?;
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| PacketError::MacAddr(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(PacketError::MacAddr(s.to_string()));
        }
        Ok(MacAddr(mac))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        need("ethernet header", frame, ETH_HEADER_LEN)?;
        let hdr = EthernetHeader {
            dst: MacAddr::from_slice(&frame[0..6]),
            src: MacAddr::from_slice(&frame[6..12]),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        };
        Ok((hdr, &frame[ETH_HEADER_LEN..]))
    }

    pub fn to_bytes(&self) -> [u8; ETH_HEADER_LEN] {
        let mut hdr = [0u8; ETH_HEADER_LEN];
        hdr[0..6].copy_from_slice(&self.dst.0);
        hdr[6..12].copy_from_slice(&self.src.0);
        hdr[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        hdr
    }
}

/// ARP over Ethernet/IPv4. Fields past the header are read at the fixed
/// 6/4 offsets; callers check `hw_len`/`proto_len` before trusting them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_len: u8,
    pub proto_len: u8,
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub const OP_REQUEST: u16 = 1;
    pub const OP_REPLY: u16 = 2;
    pub const HW_ETHERNET: u16 = 1;

    pub fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        need("ARP packet", payload, ARP_PACKET_LEN)?;
        Ok(ArpPacket {
            hw_type: u16::from_be_bytes([payload[0], payload[1]]),
            proto_type: u16::from_be_bytes([payload[2], payload[3]]),
            hw_len: payload[4],
            proto_len: payload[5],
            op: u16::from_be_bytes([payload[6], payload[7]]),
            sender_mac: MacAddr::from_slice(&payload[8..14]),
            sender_ip: ipv4_at(payload, 14),
            target_mac: MacAddr::from_slice(&payload[18..24]),
            target_ip: ipv4_at(payload, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut arp = [0u8; ARP_PACKET_LEN];
        arp[0..2].copy_from_slice(&self.hw_type.to_be_bytes());
        arp[2..4].copy_from_slice(&self.proto_type.to_be_bytes());
        arp[4] = self.hw_len;
        arp[5] = self.proto_len;
        arp[6..8].copy_from_slice(&self.op.to_be_bytes());
        arp[8..14].copy_from_slice(&self.sender_mac.0);
        arp[14..18].copy_from_slice(&self.sender_ip.octets());
        arp[18..24].copy_from_slice(&self.target_mac.0);
        arp[24..28].copy_from_slice(&self.target_ip.octets());
        arp
    }
}

fn ipv4_at(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    /// Checksum as received. Serialization always recomputes it.
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// A gateway-originated header with no options.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize, ident: u16, ttl: u8) -> Self {
        Ipv4Header {
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            ident,
            flags_fragment: 0,
            ttl,
            protocol,
            checksum: 0,
            src,
            dst,
            options: Vec::new(),
        }
    }

    /// Parses the header and returns the payload trimmed to `total_len`,
    /// which drops any Ethernet padding after the datagram.
    pub fn parse(packet: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        need("IPv4 header", packet, IPV4_HEADER_LEN)?;
        let version = packet[0] >> 4;
        if version != 4 {
            return Err(PacketError::Version(version));
        }
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
            return Err(PacketError::HeaderLength {
                what: "IPv4",
                len: header_len,
            });
        }
        let total_len = u16::from_be_bytes([packet[2], packet[3]]);
        if (total_len as usize) < header_len {
            return Err(PacketError::HeaderLength {
                what: "IPv4 total",
                len: total_len as usize,
            });
        }
        need("IPv4 datagram", packet, total_len as usize)?;

        let hdr = Ipv4Header {
            tos: packet[1],
            total_len,
            ident: u16::from_be_bytes([packet[4], packet[5]]),
            flags_fragment: u16::from_be_bytes([packet[6], packet[7]]),
            ttl: packet[8],
            protocol: packet[9],
            checksum: u16::from_be_bytes([packet[10], packet[11]]),
            src: ipv4_at(packet, 12),
            dst: ipv4_at(packet, 16),
            options: packet[IPV4_HEADER_LEN..header_len].to_vec(),
        };
        Ok((hdr, &packet[header_len..total_len as usize]))
    }

    pub fn header_len(&self) -> usize {
        IPV4_HEADER_LEN + self.options.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = self.header_len();
        let mut hdr = vec![0u8; header_len];
        hdr[0] = 0x40 | ((header_len / 4) as u8 & 0x0f);
        hdr[1] = self.tos;
        hdr[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        hdr[4..6].copy_from_slice(&self.ident.to_be_bytes());
        hdr[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        hdr[8] = self.ttl;
        hdr[9] = self.protocol;
        // Checksum at [10..12] - computed below
        hdr[12..16].copy_from_slice(&self.src.octets());
        hdr[16..20].copy_from_slice(&self.dst.octets());
        hdr[IPV4_HEADER_LEN..].copy_from_slice(&self.options);

        let cksum = checksum(&hdr);
        hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
        hdr
    }
}

/// Returns true when the header bytes sum to zero, i.e. the stored checksum is valid.
pub fn ipv4_checksum_valid(header: &[u8]) -> bool {
    checksum(header) == 0
}

/// A validated IPv4 datagram, copied out of its frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub header: Ipv4Header,
    bytes: Vec<u8>,
    received_ttl: u8,
}

impl Ipv4Packet {
    /// Parses and copies the datagram, rejecting a bad header checksum.
    pub fn parse(raw: &[u8]) -> Result<Self, PacketError> {
        let (header, _) = Ipv4Header::parse(raw)?;
        if !ipv4_checksum_valid(&raw[..header.header_len()]) {
            return Err(PacketError::Checksum);
        }
        let bytes = raw[..header.total_len as usize].to_vec();
        let received_ttl = header.ttl;
        Ok(Ipv4Packet {
            header,
            bytes,
            received_ttl,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header.header_len()..]
    }

    pub fn is_fragment(&self) -> bool {
        // MF flag or a non-zero offset
        self.header.flags_fragment & 0x3fff != 0
    }

    /// The header as it arrived, before any TTL rewrite, followed by the
    /// first eight transport bytes. This is the body of an ICMP error.
    pub fn quote(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.ttl = self.received_ttl;
        let mut quote = header.to_bytes();
        let transport = self.payload();
        quote.extend_from_slice(&transport[..transport.len().min(ICMP_QUOTED_TRANSPORT_LEN)]);
        quote
    }

    /// Rewrites the TTL and the header checksum together.
    pub fn set_ttl(&mut self, ttl: u8) {
        self.header.ttl = ttl;
        let header = self.header.to_bytes();
        self.header.checksum = u16::from_be_bytes([header[10], header[11]]);
        self.bytes[..header.len()].copy_from_slice(&header);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: TcpFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        need("TCP header", segment, TCP_HEADER_LEN)?;
        let data_offset = ((segment[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
            return Err(PacketError::HeaderLength {
                what: "TCP",
                len: data_offset,
            });
        }
        let hdr = TcpHeader {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            flags: TcpFlags(segment[13] & 0x3f),
            window: u16::from_be_bytes([segment[14], segment[15]]),
            urgent: u16::from_be_bytes([segment[18], segment[19]]),
            options: segment[TCP_HEADER_LEN..data_offset].to_vec(),
        };
        Ok((hdr, &segment[data_offset..]))
    }

    /// Maximum segment size announced in the options, if any.
    pub fn mss(&self) -> Option<u16> {
        let options = &self.options;
        let mut i = 0usize;
        while i < options.len() {
            match options[i] {
                TCP_OPT_EOL => break,
                TCP_OPT_NOP => {
                    i += 1;
                    continue;
                }
                kind => {
                    if i + 1 >= options.len() {
                        break;
                    }
                    let len = options[i + 1] as usize;
                    if len < 2 || i + len > options.len() {
                        break;
                    }
                    if kind == TCP_OPT_MSS && len == 4 {
                        return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                    }
                    i += len;
                }
            }
        }
        None
    }

    pub fn mss_option(mss: u16) -> Vec<u8> {
        let mss = mss.to_be_bytes();
        vec![TCP_OPT_MSS, 4, mss[0], mss[1]]
    }

    /// Serializes header and payload, checksummed against the pseudo-header.
    pub fn to_bytes(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        debug_assert!(self.options.len() % 4 == 0);
        let header_len = TCP_HEADER_LEN + self.options.len();
        let mut seg = Vec::with_capacity(header_len + payload.len());
        seg.extend_from_slice(&self.src_port.to_be_bytes());
        seg.extend_from_slice(&self.dst_port.to_be_bytes());
        seg.extend_from_slice(&self.seq.to_be_bytes());
        seg.extend_from_slice(&self.ack.to_be_bytes());
        seg.push(((header_len / 4) as u8) << 4);
        seg.push(self.flags.0);
        seg.extend_from_slice(&self.window.to_be_bytes());
        seg.extend_from_slice(&[0, 0]); // checksum placeholder
        seg.extend_from_slice(&self.urgent.to_be_bytes());
        seg.extend_from_slice(&self.options);
        seg.extend_from_slice(payload);

        let cksum = Checksum::pseudo_header(src, dst, IP_PROTO_TCP, seg.len()).add(&seg).finish();
        seg[16..18].copy_from_slice(&cksum.to_be_bytes());
        seg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses the header and returns the payload bounded by the length field.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        need("UDP header", datagram, UDP_HEADER_LEN)?;
        let length = u16::from_be_bytes([datagram[4], datagram[5]]);
        if (length as usize) < UDP_HEADER_LEN || length as usize > datagram.len() {
            return Err(PacketError::HeaderLength {
                what: "UDP",
                len: length as usize,
            });
        }
        let hdr = UdpHeader {
            src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
            dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
            length,
            checksum: u16::from_be_bytes([datagram[6], datagram[7]]),
        };
        Ok((hdr, &datagram[UDP_HEADER_LEN..length as usize]))
    }

    pub fn build(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let length = (UDP_HEADER_LEN + payload.len()) as u16;
        let mut dgram = Vec::with_capacity(length as usize);
        dgram.extend_from_slice(&src_port.to_be_bytes());
        dgram.extend_from_slice(&dst_port.to_be_bytes());
        dgram.extend_from_slice(&length.to_be_bytes());
        dgram.extend_from_slice(&[0, 0]);
        dgram.extend_from_slice(payload);

        // A computed zero is transmitted as all ones (RFC 768).
        let cksum = match Checksum::pseudo_header(src, dst, IP_PROTO_UDP, dgram.len()).add(&dgram).finish() {
            0 => 0xffff,
            c => c,
        };
        dgram[6..8].copy_from_slice(&cksum.to_be_bytes());
        dgram
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Type-specific second word (identifier/sequence, unused, pointer, ...).
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub fn parse(message: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        need("ICMP header", message, ICMP_HEADER_LEN)?;
        let hdr = IcmpHeader {
            icmp_type: message[0],
            code: message[1],
            checksum: u16::from_be_bytes([message[2], message[3]]),
            rest: [message[4], message[5], message[6], message[7]],
        };
        Ok((hdr, &message[ICMP_HEADER_LEN..]))
    }

    /// Error types whose body quotes the offending datagram.
    pub fn is_error(icmp_type: u8) -> bool {
        matches!(
            icmp_type,
            ICMP_DEST_UNREACHABLE
                | ICMP_SOURCE_QUENCH
                | ICMP_REDIRECT
                | ICMP_TIME_EXCEEDED
                | ICMP_PARAMETER_PROBLEM
        )
    }

    pub fn to_bytes(&self, body: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + body.len());
        msg.push(self.icmp_type);
        msg.push(self.code);
        msg.extend_from_slice(&[0, 0]);
        msg.extend_from_slice(&self.rest);
        msg.extend_from_slice(body);
        let cksum = checksum(&msg);
        msg[2..4].copy_from_slice(&cksum.to_be_bytes());
        msg
    }
}

/// Recomputes the checksum of an ICMP message in place.
pub fn refresh_icmp_checksum(message: &mut [u8]) {
    if message.len() < ICMP_HEADER_LEN {
        return;
    }
    message[2..4].copy_from_slice(&[0, 0]);
    let cksum = checksum(message);
    message[2..4].copy_from_slice(&cksum.to_be_bytes());
}

/// Builds an Ethernet frame carrying `ip` followed by `transport`.
pub fn ipv4_frame(dst_mac: MacAddr, src_mac: MacAddr, ip: &Ipv4Header, transport: &[u8]) -> Vec<u8> {
    let eth = EthernetHeader {
        dst: dst_mac,
        src: src_mac,
        ethertype: ETHERTYPE_IPV4,
    };
    let ip = ip.to_bytes();
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + ip.len() + transport.len());
    frame.extend_from_slice(&eth.to_bytes());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(transport);
    frame
}

/// Internet checksum accumulator (RFC 1071): a ones-complement sum of
/// big-endian 16-bit words. Input may arrive in pieces of any length.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
    odd: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a TCP or UDP checksum with the 12-byte pseudo-header.
    pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> Self {
        Self::new()
            .add(&src.octets())
            .add(&dst.octets())
            .add(&[0, protocol])
            .add(&(len as u16).to_be_bytes())
    }

    pub fn add(mut self, bytes: &[u8]) -> Self {
        let mut rest = bytes;
        if let Some(high) = self.odd.take() {
            match rest.split_first() {
                Some((&low, tail)) => {
                    self.fold(u16::from_be_bytes([high, low]));
                    rest = tail;
                }
                None => {
                    self.odd = Some(high);
                    return self;
                }
            }
        }
        let mut words = rest.chunks_exact(2);
        for word in &mut words {
            self.fold(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
        self
    }

    fn fold(&mut self, word: u16) {
        self.sum += word as u32;
        if self.sum > 0xffff {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
    }

    /// Pads a trailing odd byte with zero and returns the complemented sum.
    pub fn finish(mut self) -> u16 {
        if let Some(high) = self.odd.take() {
            self.fold(u16::from_be_bytes([high, 0]));
        }
        !(self.sum as u16)
    }
}

pub fn checksum(data: &[u8]) -> u16 {
    Checksum::new().add(data).finish()
}
