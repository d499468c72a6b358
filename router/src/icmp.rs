//! ICMP proxy and host-error translation.
//!
//! Guest echo traffic leaves through a short-lived raw socket; everything the
//! host's permanent raw socket receives is re-addressed to the guest. Host
//! socket failures become synthetic ICMP errors quoting the guest datagram
//! that caused them.

use std::io;
use std::net::Ipv4Addr;

use crate::context::Context;
use crate::host::DatagramHost;
use crate::packet::{
    ICMP_DEST_UNREACHABLE, ICMP_HEADER_LEN, ICMP_QUOTED_TRANSPORT_LEN, ICMP_TIME_EXCEEDED,
    IP_PROTO_ICMP, IPV4_HEADER_LEN, IcmpHeader, Ipv4Header, Ipv4Packet, checksum, ipv4_frame,
    refresh_icmp_checksum,
};
use crate::registry::SessionId;
use crate::udp::{DatagramTable, MAX_DATAGRAM, Session};

/// Host failures that have an ICMP equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFailure {
    HostUnreachable,
    NetworkUnreachable,
    TtlExceeded,
}

impl HostFailure {
    /// Maps a host socket error; `None` when ICMP has no matching message.
    pub fn classify(err: &io::Error) -> Option<HostFailure> {
        match err.raw_os_error() {
            Some(libc::EHOSTUNREACH) | Some(libc::ETIMEDOUT) => {
                return Some(HostFailure::HostUnreachable);
            }
            Some(libc::ENETDOWN) | Some(libc::ENETUNREACH) => {
                return Some(HostFailure::NetworkUnreachable);
            }
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::HostUnreachable => {
                Some(HostFailure::HostUnreachable)
            }
            io::ErrorKind::NetworkDown | io::ErrorKind::NetworkUnreachable => {
                Some(HostFailure::NetworkUnreachable)
            }
            _ => None,
        }
    }

    pub fn type_code(self) -> (u8, u8) {
        match self {
            HostFailure::HostUnreachable => (ICMP_DEST_UNREACHABLE, 1),
            HostFailure::NetworkUnreachable => (ICMP_DEST_UNREACHABLE, 0),
            HostFailure::TtlExceeded => (ICMP_TIME_EXCEEDED, 0),
        }
    }
}

/// Builds the ICMP error frame for `failure`, quoting the IP header and the
/// first eight transport bytes of `datagram`. Returns `None` when the quoted
/// datagram is not IPv4.
pub fn error_frame(ctx: &Context, failure: HostFailure, datagram: &[u8]) -> Option<Vec<u8>> {
    let (quoted_hdr, _) = match Ipv4Header::parse(datagram) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "cannot quote datagram in ICMP error");
            return None;
        }
    };
    let quoted_len = (quoted_hdr.header_len() + ICMP_QUOTED_TRANSPORT_LEN).min(datagram.len());
    let (icmp_type, code) = failure.type_code();
    let message = IcmpHeader {
        icmp_type,
        code,
        checksum: 0,
        rest: [0; 4],
    }
    .to_bytes(&datagram[..quoted_len]);

    let dst = ctx.guest_ip().unwrap_or(quoted_hdr.src);
    Some(ctx.ipv4_frame_to_guest(ctx.router_ip(), dst, IP_PROTO_ICMP, &message))
}

pub fn send_error(ctx: &Context, failure: HostFailure, datagram: &[u8]) {
    if let Some(frame) = error_frame(ctx, failure, datagram) {
        tracing::debug!(?failure, "sending ICMP error to guest");
        ctx.send_to_guest(frame);
    }
}

/// Lifecycle of the permanent raw ICMP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpState {
    Idle,
    Listening(SessionId),
    /// Raw sockets are unavailable; inbound ICMP is not proxied.
    Unsupported,
}

impl DatagramTable {
    /// Opens the permanent raw socket on first use.
    pub fn start_icmp_listener(&mut self, host: &mut impl DatagramHost) {
        if self.icmp != IcmpState::Idle {
            return;
        }
        let (id, evicted) = self.sessions.insert(Session::icmp_listener());
        if let Some((old, session)) = evicted {
            self.close_session(host, old, session);
        }
        match host.icmp_listen(id) {
            Ok(()) => {
                tracing::info!(session = %id, "ICMP listener started");
                self.icmp = IcmpState::Listening(id);
            }
            Err(e) => {
                tracing::warn!(error = %e, "raw ICMP unavailable, inbound ICMP disabled");
                self.sessions.remove(id);
                self.icmp = IcmpState::Unsupported;
            }
        }
    }

    pub fn icmp_state(&self) -> IcmpState {
        self.icmp
    }

    /// Forwards a guest ICMP message. The dispatcher has already
    /// decremented the TTL.
    pub fn handle_icmp(&mut self, host: &mut impl DatagramHost, packet: &Ipv4Packet) {
        let ip = &packet.header;
        if ip.src == ip.dst {
            // Self-addressed probe: it only tells us who the guest is.
            self.ctx.set_guest_ip(ip.src);
            return;
        }
        let mut message = packet.payload().to_vec();
        if message.len() < ICMP_HEADER_LEN {
            tracing::debug!(len = message.len(), "dropping short ICMP message");
            return;
        }
        self.start_icmp_listener(host);
        refresh_icmp_checksum(&mut message);

        tracing::trace!(dst = %ip.dst, icmp_type = message[0], "forwarding guest ICMP");
        if let Err(e) = host.icmp_send(ip.dst, ip.ttl, &message) {
            tracing::debug!(dst = %ip.dst, error = %e, "ICMP send failed");
            if let Some(failure) = HostFailure::classify(&e) {
                send_error(&self.ctx, failure, &packet.quote());
            }
        }
    }

    /// Re-addresses a datagram received on the permanent raw socket to the
    /// guest.
    pub fn on_icmp_packet(&mut self, raw: &[u8]) {
        if raw.len() > MAX_DATAGRAM {
            tracing::debug!(len = raw.len(), "dropping oversized inbound ICMP");
            return;
        }
        let Some(guest_ip) = self.ctx.guest_ip() else {
            tracing::debug!("dropping inbound ICMP, guest address unknown");
            return;
        };
        let (ip, payload) = match Ipv4Header::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed inbound ICMP");
                return;
            }
        };
        if ip.protocol != IP_PROTO_ICMP || payload.len() < ICMP_HEADER_LEN {
            return;
        }
        let ttl = ip.ttl.saturating_sub(1);
        if ttl == 0 {
            return;
        }

        let mut message = payload.to_vec();
        if IcmpHeader::is_error(message[0]) {
            patch_quoted_source(&mut message[ICMP_HEADER_LEN..], guest_ip);
        }
        refresh_icmp_checksum(&mut message);

        let mut out = Ipv4Header::new(ip.src, guest_ip, IP_PROTO_ICMP, message.len(), ip.ident, ttl);
        out.tos = ip.tos;
        let frame = ipv4_frame(self.ctx.guest_mac(), self.ctx.gateway_mac(), &out, &message);
        tracing::trace!(src = %ip.src, icmp_type = message[0], "delivering ICMP to guest");
        self.ctx.send_to_guest(frame);
    }
}

/// Points the datagram quoted by an ICMP error back at the guest, which
/// sent it before translation.
fn patch_quoted_source(quoted: &mut [u8], guest_ip: Ipv4Addr) {
    if quoted.len() < IPV4_HEADER_LEN || quoted[0] >> 4 != 4 {
        return;
    }
    let header_len = ((quoted[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > quoted.len() {
        return;
    }
    quoted[12..16].copy_from_slice(&guest_ip.octets());
    quoted[10..12].copy_from_slice(&[0, 0]);
    let cksum = checksum(&quoted[..header_len]);
    quoted[10..12].copy_from_slice(&cksum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ETH_HEADER_LEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ipv4_checksum_valid};
    use crate::testkit::{CollectingSink, RecordingDatagramHost, context_with, ipv4_datagram};

    const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn echo_request() -> Vec<u8> {
        IcmpHeader {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: 0,
            rest: [0, 7, 0, 1],
        }
        .to_bytes(b"abcdefgh")
    }

    #[test]
    fn test_classify_host_errors() {
        let err = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(HostFailure::classify(&err), Some(HostFailure::HostUnreachable));
        let err = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(HostFailure::classify(&err), Some(HostFailure::NetworkUnreachable));
        let err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
        assert_eq!(HostFailure::classify(&err), Some(HostFailure::HostUnreachable));
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(HostFailure::classify(&err), None);
    }

    #[test]
    fn test_error_frame_quotes_header_and_eight_bytes() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        ctx.set_guest_ip(GUEST);
        let datagram = ipv4_datagram(GUEST, REMOTE, 6, &[0xaa; 40]);

        let frame = error_frame(&ctx, HostFailure::HostUnreachable, &datagram).unwrap();
        let (ip, icmp) = Ipv4Header::parse(&frame[ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip.src, ctx.router_ip());
        assert_eq!(ip.dst, GUEST);
        assert!(ipv4_checksum_valid(&frame[ETH_HEADER_LEN..ETH_HEADER_LEN + 20]));

        let (hdr, body) = IcmpHeader::parse(icmp).unwrap();
        assert_eq!((hdr.icmp_type, hdr.code), (3, 1));
        assert_eq!(hdr.rest, [0; 4]);
        assert_eq!(body, &datagram[..28]);
        assert_eq!(checksum(icmp), 0);
    }

    #[test]
    fn test_error_frame_falls_back_to_quoted_source() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        let datagram = ipv4_datagram(GUEST, REMOTE, 17, &[0; 12]);
        let frame = error_frame(&ctx, HostFailure::TtlExceeded, &datagram).unwrap();
        let (ip, icmp) = Ipv4Header::parse(&frame[ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip.dst, GUEST);
        assert_eq!((icmp[0], icmp[1]), (11, 0));
    }

    #[test]
    fn test_self_ping_records_guest_ip() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        let mut table = DatagramTable::new(ctx.clone(), 16);
        let mut host = RecordingDatagramHost::default();

        let packet = Ipv4Packet::parse(&ipv4_datagram(GUEST, GUEST, 1, &echo_request())).unwrap();
        table.handle_icmp(&mut host, &packet);
        assert_eq!(ctx.guest_ip(), Some(GUEST));
        assert!(host.icmp_sent.is_empty());
    }

    #[test]
    fn test_echo_request_goes_out_raw() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        let mut table = DatagramTable::new(ctx, 16);
        let mut host = RecordingDatagramHost::default();

        let mut request = echo_request();
        request[2] = 0xde; // stale checksum
        let packet = Ipv4Packet::parse(&ipv4_datagram(GUEST, REMOTE, 1, &request)).unwrap();
        table.handle_icmp(&mut host, &packet);

        assert_eq!(host.icmp_sent.len(), 1);
        let (dst, ttl, message) = &host.icmp_sent[0];
        assert_eq!(*dst, REMOTE);
        assert_eq!(*ttl, 64);
        assert_eq!(checksum(message), 0);
        assert!(matches!(table.icmp_state(), IcmpState::Listening(_)));
    }

    #[test]
    fn test_listener_degrades_without_privilege() {
        let sink = CollectingSink::new();
        let mut table = DatagramTable::new(context_with(&sink), 16);
        let mut host = RecordingDatagramHost {
            icmp_listen_error: Some(io::ErrorKind::PermissionDenied),
            ..Default::default()
        };
        table.start_icmp_listener(&mut host);
        assert_eq!(table.icmp_state(), IcmpState::Unsupported);
        assert_eq!(table.session_count(), 0);
    }

    #[test]
    fn test_inbound_reply_readdressed_to_guest() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        ctx.set_guest_ip(GUEST);
        let mut table = DatagramTable::new(ctx, 16);

        let reply = IcmpHeader {
            icmp_type: ICMP_ECHO_REPLY,
            code: 0,
            checksum: 0,
            rest: [0, 7, 0, 1],
        }
        .to_bytes(b"abcdefgh");
        let host_ip = Ipv4Addr::new(192, 168, 1, 20);
        table.on_icmp_packet(&ipv4_datagram(REMOTE, host_ip, 1, &reply));

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        let (ip, icmp) = Ipv4Header::parse(&frames[0][ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip.src, REMOTE);
        assert_eq!(ip.dst, GUEST);
        assert_eq!(ip.ttl, 63);
        assert_eq!(icmp, &reply[..]);
    }

    #[test]
    fn test_inbound_error_patches_quoted_source() {
        let sink = CollectingSink::new();
        let ctx = context_with(&sink);
        ctx.set_guest_ip(GUEST);
        let mut table = DatagramTable::new(ctx, 16);

        let host_ip = Ipv4Addr::new(192, 168, 1, 20);
        let quoted = ipv4_datagram(host_ip, REMOTE, 17, &[0x11; 8]);
        let error = IcmpHeader {
            icmp_type: ICMP_TIME_EXCEEDED,
            code: 0,
            checksum: 0,
            rest: [0; 4],
        }
        .to_bytes(&quoted);
        table.on_icmp_packet(&ipv4_datagram(Ipv4Addr::new(10, 9, 9, 1), host_ip, 1, &error));

        let frames = sink.frames();
        let (_, icmp) = Ipv4Header::parse(&frames[0][ETH_HEADER_LEN..]).unwrap();
        let inner = &icmp[ICMP_HEADER_LEN..];
        let (inner_hdr, _) = Ipv4Header::parse(inner).unwrap();
        assert_eq!(inner_hdr.src, GUEST);
        assert!(ipv4_checksum_valid(&inner[..20]));
        assert_eq!(checksum(icmp), 0);
    }

    #[test]
    fn test_inbound_dropped_until_guest_known() {
        let sink = CollectingSink::new();
        let mut table = DatagramTable::new(context_with(&sink), 16);
        table.on_icmp_packet(&ipv4_datagram(REMOTE, GUEST, 1, &echo_request()));
        assert!(sink.frames().is_empty());
    }
}
