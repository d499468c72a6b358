//! State shared by every protocol handler.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::config::RouterConfig;
use crate::packet::{Ipv4Header, MacAddr, ipv4_frame};

/// TTL of every datagram the gateway synthesizes toward the guest.
pub const SYNTHETIC_TTL: u8 = 128;

/// Receives frames addressed to the guest.
pub trait FrameSink: Send + Sync {
    fn enqueue_frame_to_guest(&self, frame: Vec<u8>);
}

impl<F> FrameSink for F
where
    F: Fn(Vec<u8>) + Send + Sync,
{
    fn enqueue_frame_to_guest(&self, frame: Vec<u8>) {
        self(frame)
    }
}

pub struct Context {
    gateway_mac: MacAddr,
    router_ip: Ipv4Addr,
    guest_mac: AtomicU64,
    guest_mac_pinned: bool,
    guest_ip: AtomicU32,
    ident: AtomicU16,
    ftp_ports: Vec<u16>,
    shutting_down: AtomicBool,
    sink: Arc<dyn FrameSink>,
}

impl Context {
    pub fn new(config: &RouterConfig, router_ip: Ipv4Addr, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            gateway_mac: config.gateway_mac,
            router_ip,
            guest_mac: AtomicU64::new(mac_to_u64(config.guest_mac.unwrap_or(MacAddr::ZERO))),
            guest_mac_pinned: config.guest_mac.is_some(),
            guest_ip: AtomicU32::new(config.guest_ip.map(u32::from).unwrap_or(0)),
            ident: AtomicU16::new(1),
            ftp_ports: config.ftp_ports.clone(),
            shutting_down: AtomicBool::new(false),
            sink,
        }
    }

    pub fn gateway_mac(&self) -> MacAddr {
        self.gateway_mac
    }

    /// Host address used as the source of synthesized ICMP errors.
    pub fn router_ip(&self) -> Ipv4Addr {
        self.router_ip
    }

    /// The guest's IP once learned (or configured).
    pub fn guest_ip(&self) -> Option<Ipv4Addr> {
        match self.guest_ip.load(Ordering::Acquire) {
            0 => None,
            ip => Some(Ipv4Addr::from(ip)),
        }
    }

    pub fn set_guest_ip(&self, ip: Ipv4Addr) {
        let prev = self.guest_ip.swap(u32::from(ip), Ordering::AcqRel);
        if prev != u32::from(ip) {
            tracing::info!(guest_ip = %ip, "Learned guest address");
        }
    }

    /// Destination MAC for guest-bound frames; broadcast until learned.
    pub fn guest_mac(&self) -> MacAddr {
        let mac = u64_to_mac(self.guest_mac.load(Ordering::Acquire));
        if mac.is_zero() { MacAddr::BROADCAST } else { mac }
    }

    pub fn learn_guest_mac(&self, mac: MacAddr) {
        if self.guest_mac_pinned || mac.is_zero() || mac == MacAddr::BROADCAST {
            return;
        }
        self.guest_mac.store(mac_to_u64(mac), Ordering::Release);
    }

    /// Next IP identification number; wraps silently.
    pub fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_ftp_port(&self, port: u16) -> bool {
        self.ftp_ports.contains(&port)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn send_to_guest(&self, frame: Vec<u8>) {
        self.sink.enqueue_frame_to_guest(frame);
    }

    /// Wraps a transport payload in fresh IPv4 and Ethernet headers.
    pub fn ipv4_frame_to_guest(&self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, transport: &[u8]) -> Vec<u8> {
        let ip = Ipv4Header::new(src, dst, protocol, transport.len(), self.next_ident(), SYNTHETIC_TTL);
        ipv4_frame(self.guest_mac(), self.gateway_mac, &ip, transport)
    }

    pub fn send_ipv4_to_guest(&self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, transport: &[u8]) {
        let frame = self.ipv4_frame_to_guest(src, dst, protocol, transport);
        self.send_to_guest(frame);
    }
}

fn mac_to_u64(mac: MacAddr) -> u64 {
    let mut b = [0u8; 8];
    b[2..].copy_from_slice(&mac.0);
    u64::from_be_bytes(b)
}

fn u64_to_mac(v: u64) -> MacAddr {
    let b = v.to_be_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&b[2..]);
    MacAddr(mac)
}
