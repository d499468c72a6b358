//! UDP relay: one host datagram socket per guest flow.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::host::DatagramHost;
use crate::icmp::{HostFailure, IcmpState, send_error};
use crate::packet::{IP_PROTO_UDP, Ipv4Packet, UdpHeader};
use crate::registry::{Claim, Flow, FlowKey, Registry, SessionId};

pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest payload relayed toward the guest.
pub const MAX_DATAGRAM: usize = 1460;

#[derive(Debug)]
pub struct Session {
    key: FlowKey,
    expires_at: Option<Instant>,
}

impl Session {
    fn udp(local_port: u16, remote_port: u16) -> Self {
        Session {
            key: FlowKey::udp(local_port, remote_port),
            expires_at: None,
        }
    }

    pub(crate) fn icmp_listener() -> Self {
        Session {
            key: FlowKey::icmp(),
            expires_at: None,
        }
    }
}

impl Flow for Session {
    fn key(&self) -> FlowKey {
        self.key
    }

    fn permanent(&self) -> bool {
        self.key == FlowKey::icmp()
    }
}

/// UDP sessions plus the permanent ICMP listener, which share one table.
pub struct DatagramTable {
    pub(crate) ctx: Arc<Context>,
    pub(crate) sessions: Registry<Session>,
    pub(crate) icmp: IcmpState,
}

impl DatagramTable {
    pub fn new(ctx: Arc<Context>, capacity: usize) -> Self {
        Self {
            ctx,
            sessions: Registry::with_capacity(capacity),
            icmp: IcmpState::Idle,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Relays one guest datagram. The dispatcher has already decremented
    /// the TTL, which is applied to the host socket.
    pub fn handle_udp(&mut self, host: &mut impl DatagramHost, packet: &Ipv4Packet, now: Instant) {
        let (udp, payload) = match UdpHeader::parse(packet.payload()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed UDP datagram");
                return;
            }
        };
        let key = FlowKey::udp(udp.src_port, udp.dst_port);

        let (id, fresh) = match self.sessions.claim(key) {
            Claim::Existing(id) => (id, false),
            Claim::Vacant { stale } => {
                for (old, session) in stale {
                    tracing::debug!(session = %old, local_port = udp.src_port, "guest reused local port");
                    self.close_session(host, old, session);
                }
                let (id, evicted) = self.sessions.insert(Session::udp(udp.src_port, udp.dst_port));
                if let Some((old, session)) = evicted {
                    tracing::debug!(session = %old, "session table full, evicting oldest");
                    self.close_session(host, old, session);
                }
                if let Err(e) = host.udp_open(id) {
                    tracing::debug!(local_port = udp.src_port, error = %e, "UDP socket open failed");
                    self.sessions.remove(id);
                    return;
                }
                tracing::debug!(session = %id, local_port = udp.src_port, remote_port = udp.dst_port, "UDP session opened");
                (id, true)
            }
        };

        let dst = SocketAddrV4::new(packet.header.dst, udp.dst_port);
        tracing::trace!(session = %id, remote = %dst, len = payload.len(), "guest UDP datagram");
        match host.udp_send_to(id, dst, packet.header.ttl, payload) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.expires_at = Some(now + UDP_IDLE_TIMEOUT);
                }
                if fresh {
                    host.udp_start_recv(id);
                }
            }
            Err(e) => {
                tracing::debug!(session = %id, remote = %dst, error = %e, "UDP send failed");
                if let Some(failure) = HostFailure::classify(&e) {
                    send_error(&self.ctx, failure, &packet.quote());
                }
                if let Some(session) = self.sessions.remove(id) {
                    self.close_session(host, id, session);
                }
            }
        }
    }

    /// A datagram arrived on a session's host socket.
    pub fn on_datagram(&mut self, session: SessionId, from: SocketAddrV4, data: &[u8], now: Instant) {
        let Some(entry) = self.sessions.get_mut(session) else {
            return;
        };
        if data.is_empty() || data.len() > MAX_DATAGRAM {
            tracing::debug!(%session, len = data.len(), "dropping inbound datagram");
            return;
        }
        let Some(guest_ip) = self.ctx.guest_ip() else {
            tracing::debug!(%session, "dropping inbound datagram, guest address unknown");
            return;
        };
        entry.expires_at = Some(now + UDP_IDLE_TIMEOUT);
        let local_port = entry.key.local_port;

        let dgram = UdpHeader::build(*from.ip(), guest_ip, from.port(), local_port, data);
        tracing::trace!(%session, remote = %from, len = data.len(), "delivering datagram to guest");
        self.ctx.send_ipv4_to_guest(*from.ip(), guest_ip, IP_PROTO_UDP, &dgram);
    }

    /// The receive loop of a session failed; the session is finished.
    pub fn on_datagram_failed(&mut self, host: &mut impl DatagramHost, session: SessionId, error: &std::io::Error) {
        if !self.ctx.is_shutting_down() {
            tracing::debug!(%session, %error, "UDP receive failed");
        }
        if let Some(entry) = self.sessions.remove(session) {
            self.close_session(host, session, entry);
        }
    }

    /// Expires idle sessions. The permanent ICMP session never expires.
    pub fn sweep(&mut self, host: &mut impl DatagramHost, now: Instant) {
        for id in self.sessions.ids() {
            let expired = self
                .sessions
                .get(id)
                .is_some_and(|s| !s.permanent() && s.expires_at.is_some_and(|at| at <= now));
            if expired {
                if let Some(session) = self.sessions.remove(id) {
                    tracing::debug!(session = %id, "UDP session idle, closing");
                    self.close_session(host, id, session);
                }
            }
        }
    }

    pub fn close_all(&mut self, host: &mut impl DatagramHost) {
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.remove(id) {
                self.close_session(host, id, session);
            }
        }
        if matches!(self.icmp, IcmpState::Listening(_)) {
            self.icmp = IcmpState::Idle;
        }
    }

    /// Releases the host resources of a session already removed from the
    /// table.
    pub(crate) fn close_session(&mut self, host: &mut impl DatagramHost, id: SessionId, session: Session) {
        if session.permanent() {
            host.icmp_close(id);
            if self.icmp == IcmpState::Listening(id) {
                self.icmp = IcmpState::Idle;
            }
        } else {
            host.udp_close(id);
        }
    }
}
