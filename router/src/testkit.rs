//! Test doubles shared by the protocol table tests.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use crate::config::RouterConfig;
use crate::context::{Context, FrameSink};
use crate::host::{DatagramHost, TcpHost};
use crate::packet::{
    ArpPacket, ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader, IP_PROTO_TCP,
    Ipv4Header, Ipv4Packet, MacAddr, TcpFlags, TcpHeader,
};
use crate::registry::{ConnId, ListenerId, SessionId};

pub const GUEST_MAC: MacAddr = MacAddr([0x00, 0x05, 0x02, 0x11, 0x22, 0x33]);
pub const ROUTER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

/// Frame sink that keeps everything sent to the guest.
#[derive(Clone, Default)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn as_sink(&self) -> Arc<dyn FrameSink> {
        let frames = self.frames.clone();
        Arc::new(move |frame: Vec<u8>| frames.lock().unwrap().push(frame))
    }

    /// Drains and returns the collected frames.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }
}

pub fn context_with(sink: &CollectingSink) -> Arc<Context> {
    Arc::new(Context::new(&RouterConfig::default(), ROUTER_IP, sink.as_sink()))
}

/// A complete IPv4 datagram with TTL 64.
pub fn ipv4_datagram(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut raw = Ipv4Header::new(src, dst, protocol, payload.len(), 1, 64).to_bytes();
    raw.extend_from_slice(payload);
    raw
}

/// A guest TCP segment. SYNs carry an MSS option of 1460.
pub fn tcp_packet(
    from: SocketAddrV4,
    to: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Ipv4Packet {
    let options = if flags.contains(TcpFlags::SYN) {
        TcpHeader::mss_option(1460)
    } else {
        Vec::new()
    };
    let tcp = TcpHeader {
        src_port: from.port(),
        dst_port: to.port(),
        seq,
        ack,
        flags,
        window: 1460,
        urgent: 0,
        options,
    };
    let segment = tcp.to_bytes(*from.ip(), *to.ip(), payload);
    Ipv4Packet::parse(&ipv4_datagram(*from.ip(), *to.ip(), IP_PROTO_TCP, &segment)).unwrap()
}

/// Splits a guest-bound Ethernet frame carrying TCP.
pub fn parse_tcp_frame(frame: &[u8]) -> (Ipv4Header, TcpHeader, Vec<u8>) {
    let (ip, transport) = Ipv4Header::parse(&frame[ETH_HEADER_LEN..]).unwrap();
    assert_eq!(ip.protocol, IP_PROTO_TCP);
    let (tcp, payload) = TcpHeader::parse(transport).unwrap();
    (ip, tcp, payload.to_vec())
}

/// Broadcast ARP request from [`GUEST_MAC`].
pub fn arp_request(sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let eth = EthernetHeader {
        dst: MacAddr::BROADCAST,
        src: GUEST_MAC,
        ethertype: ETHERTYPE_ARP,
    };
    let arp = ArpPacket {
        hw_type: ArpPacket::HW_ETHERNET,
        proto_type: ETHERTYPE_IPV4,
        hw_len: 6,
        proto_len: 4,
        op: ArpPacket::OP_REQUEST,
        sender_mac: GUEST_MAC,
        sender_ip,
        target_mac: MacAddr::ZERO,
        target_ip,
    };
    let mut frame = eth.to_bytes().to_vec();
    frame.extend_from_slice(&arp.to_bytes());
    frame
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOp {
    Connect(ConnId, SocketAddrV4, u8),
    Send(ConnId, Vec<u8>),
    Recv(ConnId, usize),
    ShutdownWrite(ConnId),
    SetTtl(ConnId, u8),
    Close(ConnId),
    Abort(ConnId),
    Listen(ListenerId, SocketAddrV4),
    CloseListener(ListenerId),
}

/// Records every host operation the TCP table issues.
#[derive(Debug, Default)]
pub struct RecordingTcpHost {
    pub ops: Vec<TcpOp>,
    /// Ports whose `listen` fails with `AddrInUse`.
    pub busy_ports: Vec<u16>,
    next_ephemeral: u16,
}

impl TcpHost for RecordingTcpHost {
    fn connect(&mut self, conn: ConnId, remote: SocketAddrV4, ttl: u8) {
        self.ops.push(TcpOp::Connect(conn, remote, ttl));
    }

    fn send(&mut self, conn: ConnId, data: Vec<u8>) {
        self.ops.push(TcpOp::Send(conn, data));
    }

    fn recv(&mut self, conn: ConnId, max: usize) {
        self.ops.push(TcpOp::Recv(conn, max));
    }

    fn shutdown_write(&mut self, conn: ConnId) {
        self.ops.push(TcpOp::ShutdownWrite(conn));
    }

    fn set_ttl(&mut self, conn: ConnId, ttl: u8) {
        self.ops.push(TcpOp::SetTtl(conn, ttl));
    }

    fn close(&mut self, conn: ConnId) {
        self.ops.push(TcpOp::Close(conn));
    }

    fn abort(&mut self, conn: ConnId) {
        self.ops.push(TcpOp::Abort(conn));
    }

    fn listen(&mut self, listener: ListenerId, addr: SocketAddrV4) -> io::Result<u16> {
        self.ops.push(TcpOp::Listen(listener, addr));
        if self.busy_ports.contains(&addr.port()) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        if addr.port() == 0 {
            self.next_ephemeral += 1;
            return Ok(40000 + self.next_ephemeral);
        }
        Ok(addr.port())
    }

    fn close_listener(&mut self, listener: ListenerId) {
        self.ops.push(TcpOp::CloseListener(listener));
    }
}

/// Records datagram-side host operations; failures are injectable.
#[derive(Debug, Default)]
pub struct RecordingDatagramHost {
    pub opened: Vec<SessionId>,
    pub sent: Vec<(SessionId, SocketAddrV4, u8, Vec<u8>)>,
    pub receiving: Vec<SessionId>,
    pub closed: Vec<SessionId>,
    /// Raw OS error returned by every UDP send.
    pub send_error: Option<i32>,
    pub icmp_listening: Vec<SessionId>,
    pub icmp_sent: Vec<(Ipv4Addr, u8, Vec<u8>)>,
    pub icmp_closed: Vec<SessionId>,
    pub icmp_listen_error: Option<io::ErrorKind>,
}

impl DatagramHost for RecordingDatagramHost {
    fn udp_open(&mut self, session: SessionId) -> io::Result<()> {
        self.opened.push(session);
        Ok(())
    }

    fn udp_send_to(&mut self, session: SessionId, dst: SocketAddrV4, ttl: u8, payload: &[u8]) -> io::Result<()> {
        if let Some(code) = self.send_error {
            return Err(io::Error::from_raw_os_error(code));
        }
        self.sent.push((session, dst, ttl, payload.to_vec()));
        Ok(())
    }

    fn udp_start_recv(&mut self, session: SessionId) {
        self.receiving.push(session);
    }

    fn udp_close(&mut self, session: SessionId) {
        self.closed.push(session);
    }

    fn icmp_listen(&mut self, session: SessionId) -> io::Result<()> {
        if let Some(kind) = self.icmp_listen_error {
            return Err(io::Error::from(kind));
        }
        self.icmp_listening.push(session);
        Ok(())
    }

    fn icmp_send(&mut self, dst: Ipv4Addr, ttl: u8, message: &[u8]) -> io::Result<()> {
        self.icmp_sent.push((dst, ttl, message.to_vec()));
        Ok(())
    }

    fn icmp_close(&mut self, session: SessionId) {
        self.icmp_closed.push(session);
    }
}
