//! TCP proxy state machine.
//!
//! Each guest connection is terminated here and re-opened as a host byte
//! stream. The gateway speaks real TCP toward the guest (sequencing,
//! acknowledgment, retransmission, half-close) and plain reads and writes
//! toward the host.
//!
//! State names describe the guest-facing link as seen from the gateway's
//! proxy socket, which mirrors ordinary TCP: a connection accepted on a host
//! listener is in `SYN_SENT` while its SYN waits for the guest's answer.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ListenPort;
use crate::context::Context;
use crate::ftp::{self, FtpDirection};
use crate::host::TcpHost;
use crate::icmp::{HostFailure, send_error};
use crate::packet::{IP_PROTO_TCP, Ipv4Packet, TcpFlags, TcpHeader};
use crate::registry::{Claim, ConnId, Flow, FlowKey, ListenerId, Registry};

pub const MAX_SEGMENT_SIZE: usize = 1460;
/// Receive window advertised to the guest.
const OUR_WINDOW: u16 = MAX_SEGMENT_SIZE as u16;
pub const RESEND_INTERVAL: Duration = Duration::from_millis(750);
/// How long an accepted connection may wait for the guest's handshake.
pub const SYN_FLOOD_GUARD: Duration = Duration::from_secs(5);
/// Deliberately short; TIME_WAIT lasts twice this.
pub const MSL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::FinWait1 => "FINWAIT_1",
            TcpState::FinWait2 => "FINWAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// `a` precedes `b` in sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// The last segment sent toward the guest, kept for verbatim retransmission.
#[derive(Debug, Clone)]
struct Sent {
    seq: u32,
    flags: TcpFlags,
    payload: Vec<u8>,
}

#[derive(Debug)]
pub struct TcpConnection {
    key: FlowKey,
    guest_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
    state: TcpState,
    /// Next sequence number presented to the guest.
    seq_out: u32,
    /// Next sequence number expected from the guest.
    seq_in: u32,
    /// Highest acknowledgment received from the guest.
    guest_ack: u32,
    guest_window: u16,
    mss: usize,
    /// One guest segment at a time is written to the host.
    accept_data: bool,
    /// Guest length of the segment being written; an ALG rewrite may change
    /// the host length, never this.
    bytes_to_send: u32,
    fin_pending: bool,
    fin_sent: bool,
    read_pending: bool,
    read_deferred: bool,
    host_eof: bool,
    host_open: bool,
    remote_closed: bool,
    last_sent: Option<Sent>,
    stalled_until: Option<Instant>,
    /// TIME_WAIT or SYN-flood-guard deadline.
    expires_at: Option<Instant>,
    /// IP header plus leading transport bytes of the guest's SYN.
    syn_quote: Vec<u8>,
    host_local: Option<SocketAddrV4>,
    child_listener: Option<ListenerId>,
    /// Created by a host listener; several share the guest's service port.
    accepted: bool,
}

impl Flow for TcpConnection {
    fn key(&self) -> FlowKey {
        self.key
    }

    fn yields_local_port(&self) -> bool {
        !self.accepted
    }
}

impl TcpConnection {
    fn new(key: FlowKey, guest_ip: Ipv4Addr, remote_ip: Ipv4Addr) -> Self {
        TcpConnection {
            key,
            guest_ip,
            remote_ip,
            state: TcpState::Closed,
            seq_out: 1,
            seq_in: 0,
            guest_ack: 0,
            guest_window: OUR_WINDOW,
            mss: MAX_SEGMENT_SIZE,
            accept_data: false,
            bytes_to_send: 0,
            fin_pending: false,
            fin_sent: false,
            read_pending: false,
            read_deferred: false,
            host_eof: false,
            host_open: false,
            remote_closed: false,
            last_sent: None,
            stalled_until: None,
            expires_at: None,
            syn_quote: Vec::new(),
            host_local: None,
            child_listener: None,
            accepted: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[cfg(test)]
    pub fn seq_out(&self) -> u32 {
        self.seq_out
    }

    #[cfg(test)]
    pub fn seq_in(&self) -> u32 {
        self.seq_in
    }

    /// Everything sent so far has been acknowledged and the guest has room.
    fn has_read_space(&self) -> bool {
        self.seq_out == self.guest_ack && self.guest_window > 0
    }

    fn read_limit(&self) -> usize {
        self.mss.min(self.guest_window as usize).max(1)
    }

    fn reads_from_host(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::CloseWait) && !self.host_eof
    }

    fn our_fin_acked(&self) -> bool {
        self.fin_sent && self.guest_ack == self.seq_out
    }

    fn segment(&self, ctx: &Context, seq: u32, flags: TcpFlags, options: Vec<u8>, payload: &[u8]) {
        let tcp = TcpHeader {
            src_port: self.key.remote_port,
            dst_port: self.key.local_port,
            seq,
            ack: self.seq_in,
            flags,
            window: OUR_WINDOW,
            urgent: 0,
            options,
        };
        tracing::trace!(
            local_port = self.key.local_port,
            remote_port = self.key.remote_port,
            ?flags,
            seq,
            ack = self.seq_in,
            len = payload.len(),
            "segment to guest"
        );
        let bytes = tcp.to_bytes(self.remote_ip, self.guest_ip, payload);
        ctx.send_ipv4_to_guest(self.remote_ip, self.guest_ip, IP_PROTO_TCP, &bytes);
    }

    fn reply(&self, ctx: &Context, flags: TcpFlags) {
        self.segment(ctx, self.seq_out, flags, Vec::new(), &[]);
    }

    /// SYN or SYN|ACK carrying our MSS; `seq` is the SYN's own number.
    fn syn(&self, ctx: &Context, seq: u32, flags: TcpFlags) {
        self.segment(ctx, seq, flags, TcpHeader::mss_option(MAX_SEGMENT_SIZE as u16), &[]);
    }

    /// Sends a FIN-bearing or data segment that must be acknowledged.
    fn send_tracked(&mut self, ctx: &Context, flags: TcpFlags, payload: Vec<u8>, now: Instant) {
        self.segment(ctx, self.seq_out, flags, Vec::new(), &payload);
        let seq = self.seq_out;
        self.seq_out = self
            .seq_out
            .wrapping_add(payload.len() as u32)
            .wrapping_add(flags.contains(TcpFlags::FIN) as u32);
        if flags.contains(TcpFlags::FIN) {
            self.fin_sent = true;
        }
        self.last_sent = Some(Sent { seq, flags, payload });
        self.stalled_until = Some(now + RESEND_INTERVAL);
    }

    fn retransmit(&mut self, ctx: &Context, now: Instant) {
        if let Some(sent) = &self.last_sent {
            tracing::debug!(local_port = self.key.local_port, seq = sent.seq, "retransmitting to guest");
            self.segment(ctx, sent.seq, sent.flags, Vec::new(), &sent.payload);
        }
        self.stalled_until = Some(now + RESEND_INTERVAL);
    }

    /// Issues the next host read, or defers it until the guest catches up.
    fn request_read(&mut self, host: &mut impl TcpHost, id: ConnId, now: Instant) {
        if self.read_pending || !self.reads_from_host() {
            return;
        }
        if !self.has_read_space() {
            self.read_deferred = true;
            self.stalled_until.get_or_insert(now + RESEND_INTERVAL);
            return;
        }
        self.read_deferred = false;
        self.read_pending = true;
        host.recv(id, self.read_limit());
    }

    /// Closes the host socket once both directions are finished, otherwise
    /// only our write side.
    fn close_or_shutdown(&mut self, host: &mut impl TcpHost, id: ConnId) {
        if self.remote_closed || self.host_eof {
            host.close(id);
            self.host_open = false;
        } else {
            host.shutdown_write(id);
        }
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.state = TcpState::TimeWait;
        self.expires_at = Some(now + 2 * MSL);
        self.stalled_until = None;
    }
}

/// A host listening socket whose connections are forwarded to a guest port.
#[derive(Debug)]
pub struct Listener {
    guest_port: u16,
    bind: SocketAddrV4,
    /// Only connections from this peer are accepted.
    allowed_peer: Option<Ipv4Addr>,
    /// Stops after its first connection.
    once: bool,
    parent: Option<ConnId>,
}

impl Flow for Listener {
    fn key(&self) -> FlowKey {
        FlowKey::tcp(self.guest_port, 0)
    }

    fn permanent(&self) -> bool {
        !self.once
    }
}

enum Disposition {
    Keep,
    Release,
    Abort,
}

pub struct TcpTable {
    ctx: Arc<Context>,
    conns: Registry<TcpConnection>,
    listeners: Registry<Listener>,
}

impl TcpTable {
    pub fn new(ctx: Arc<Context>, capacity: usize) -> Self {
        Self {
            ctx,
            conns: Registry::with_capacity(capacity),
            listeners: Registry::with_capacity(capacity),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    pub fn connection(&self, key: FlowKey) -> Option<&TcpConnection> {
        self.conns.find(key).and_then(|id| self.conns.get(id))
    }

    /// Registers the configured inbound ports. A port that cannot be bound
    /// is logged and skipped.
    pub fn open_static_listeners(&mut self, host: &mut impl TcpHost, ports: &[ListenPort]) {
        for port in ports {
            let bind = SocketAddrV4::new(port.bind.unwrap_or(Ipv4Addr::UNSPECIFIED), port.port);
            let listener = Listener {
                guest_port: port.port,
                bind,
                allowed_peer: None,
                once: false,
                parent: None,
            };
            let (id, _) = self.listeners.insert(listener);
            match host.listen(id, bind) {
                Ok(_) => tracing::info!(listener = %id, %bind, "listener registered"),
                Err(e) => {
                    tracing::warn!(%bind, error = %e, "could not listen");
                    self.listeners.remove(id);
                }
            }
        }
    }

    /// Runs one guest segment through the state machine. The dispatcher has
    /// already decremented the TTL.
    pub fn handle_segment(&mut self, host: &mut impl TcpHost, packet: &Ipv4Packet, now: Instant) {
        let (tcp, payload) = match TcpHeader::parse(packet.payload()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed TCP segment");
                return;
            }
        };
        let flags = tcp.flags;
        let key = FlowKey::tcp(tcp.src_port, tcp.dst_port);
        let opening = flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK);

        let id = match self.conns.claim(key) {
            Claim::Existing(id) => {
                let finished = self
                    .conns
                    .get(id)
                    .is_some_and(|c| matches!(c.state, TcpState::TimeWait | TcpState::Closed));
                if opening && finished {
                    if let Some(old) = self.conns.remove(id) {
                        tracing::debug!(conn = %id, "new SYN reclaims finished connection");
                        self.discard(host, id, old, false);
                    }
                    self.create(host, key, packet)
                } else {
                    id
                }
            }
            Claim::Vacant { stale } => {
                for (old, conn) in stale {
                    tracing::debug!(conn = %old, local_port = key.local_port, "guest reused local port");
                    self.discard(host, old, conn, true);
                }
                if flags.contains(TcpFlags::RST) {
                    return;
                }
                if !opening {
                    tracing::debug!(local_port = key.local_port, ?flags, "segment for unknown connection");
                    reset_unknown(&self.ctx, packet, &tcp, payload.len());
                    return;
                }
                self.create(host, key, packet)
            }
        };

        let disposition = self.drive(host, id, packet, &tcp, payload, now);
        self.finish(host, id, disposition);
    }

    fn create(&mut self, host: &mut impl TcpHost, key: FlowKey, packet: &Ipv4Packet) -> ConnId {
        let conn = TcpConnection::new(key, packet.header.src, packet.header.dst);
        let (id, evicted) = self.conns.insert(conn);
        if let Some((old, conn)) = evicted {
            tracing::debug!(conn = %old, "connection table full, evicting oldest");
            self.discard(host, old, conn, true);
        }
        id
    }

    fn drive(
        &mut self,
        host: &mut impl TcpHost,
        id: ConnId,
        packet: &Ipv4Packet,
        tcp: &TcpHeader,
        payload: &[u8],
        now: Instant,
    ) -> Disposition {
        let TcpTable { ctx, conns, listeners } = &mut *self;
        let Some(conn) = conns.get_mut(id) else {
            return Disposition::Keep;
        };
        let flags = tcp.flags;

        if flags.contains(TcpFlags::RST) {
            tracing::debug!(conn = %id, state = %conn.state, "guest reset connection");
            return Disposition::Abort;
        }

        conn.guest_window = tcp.window;
        if flags.contains(TcpFlags::SYN) {
            if let Some(mss) = tcp.mss() {
                conn.mss = (mss as usize).clamp(1, MAX_SEGMENT_SIZE);
            }
        }
        if flags.contains(TcpFlags::ACK) {
            conn.guest_ack = tcp.ack;
        }
        if conn.guest_ack == conn.seq_out {
            conn.last_sent = None;
            conn.stalled_until = None;
            if conn.read_deferred {
                conn.request_read(host, id, now);
            }
        }

        let before = conn.state;
        match conn.state {
            TcpState::Closed => {
                conn.seq_in = tcp.seq.wrapping_add(1);
                conn.seq_out = 1;
                conn.syn_quote = packet.quote();
                conn.state = TcpState::Listen;
                conn.host_open = true;
                let remote = SocketAddrV4::new(conn.remote_ip, conn.key.remote_port);
                tracing::debug!(conn = %id, %remote, "connecting for guest");
                host.connect(id, remote, packet.header.ttl);
            }
            TcpState::Listen => {}
            TcpState::SynSent => {
                if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
                    conn.seq_in = tcp.seq.wrapping_add(1);
                    conn.state = TcpState::Established;
                    conn.expires_at = None;
                    conn.reply(ctx, TcpFlags::ACK);
                    conn.accept_data = true;
                    conn.request_read(host, id, now);
                } else if flags.contains(TcpFlags::SYN) {
                    // Simultaneous open.
                    conn.seq_in = tcp.seq.wrapping_add(1);
                    conn.state = TcpState::SynRcvd;
                    conn.expires_at = None;
                    conn.syn(ctx, conn.seq_out.wrapping_sub(1), TcpFlags::SYN | TcpFlags::ACK);
                }
            }
            TcpState::SynRcvd => {
                if flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK) {
                    conn.syn(ctx, conn.seq_out.wrapping_sub(1), TcpFlags::SYN | TcpFlags::ACK);
                } else if flags.contains(TcpFlags::ACK) && conn.guest_ack == conn.seq_out {
                    conn.state = TcpState::Established;
                    conn.accept_data = true;
                    conn.request_read(host, id, now);
                }
            }
            TcpState::LastAck => {
                if conn.our_fin_acked() {
                    tracing::debug!(conn = %id, "LAST_ACK acknowledged, closing");
                    return Disposition::Release;
                }
            }
            TcpState::FinWait1 => {
                if conn.our_fin_acked() {
                    conn.state = TcpState::FinWait2;
                    conn.stalled_until = None;
                }
            }
            TcpState::Closing => {
                if conn.our_fin_acked() {
                    conn.enter_time_wait(now);
                }
            }
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait2
            | TcpState::TimeWait => {}
        }
        if conn.state != before {
            tracing::debug!(conn = %id, from = %before, to = %conn.state, "state change");
        }

        // Guest data toward the host.
        let mut forwarded = false;
        let carries_data = !payload.is_empty()
            && matches!(
                conn.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
        if carries_data {
            if conn.accept_data && tcp.seq == conn.seq_in {
                let len = payload.len().min(MAX_SEGMENT_SIZE);
                let mut data = payload[..len].to_vec();
                if let Some(rewritten) = ftp_alg(ctx, listeners, host, id, conn, &data) {
                    data = rewritten;
                }
                conn.accept_data = false;
                conn.bytes_to_send = len as u32;
                host.set_ttl(id, packet.header.ttl);
                tracing::trace!(conn = %id, len, "forwarding guest data");
                host.send(id, data);
                forwarded = true;
            } else if seq_lt(tcp.seq, conn.seq_in) {
                // Already written; the guest missed our ACK.
                conn.reply(ctx, TcpFlags::ACK);
            } else {
                tracing::trace!(conn = %id, seq = tcp.seq, expected = conn.seq_in, "dropping segment");
            }
        }

        if flags.contains(TcpFlags::FIN) {
            let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
            let accepting = matches!(
                conn.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
            if forwarded {
                conn.fin_pending = true;
            } else if accepting
                && conn.bytes_to_send > 0
                && fin_seq == conn.seq_in.wrapping_add(conn.bytes_to_send)
            {
                // Data ahead of this FIN is still being written.
                conn.fin_pending = true;
            } else if accepting && fin_seq == conn.seq_in && !conn.fin_pending {
                return accept_fin(ctx, host, id, conn, now);
            } else if fin_seq.wrapping_add(1) == conn.seq_in {
                conn.reply(ctx, TcpFlags::ACK);
            }
        }
        Disposition::Keep
    }

    /// The host connect issued for a guest SYN completed.
    pub fn on_connected(&mut self, host: &mut impl TcpHost, id: ConnId, result: io::Result<SocketAddrV4>) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.state != TcpState::Listen {
            return;
        }
        match result {
            Ok(local) => {
                conn.host_local = Some(local);
                conn.syn(&self.ctx, conn.seq_out, TcpFlags::SYN | TcpFlags::ACK);
                conn.seq_out = conn.seq_out.wrapping_add(1);
                conn.state = TcpState::SynRcvd;
                tracing::debug!(conn = %id, %local, "connected, LISTEN -> SYN_RCVD");
            }
            Err(e) => {
                tracing::debug!(conn = %id, error = %e, "connect failed");
                conn.host_open = false;
                match HostFailure::classify(&e) {
                    Some(failure) => send_error(&self.ctx, failure, &conn.syn_quote),
                    None => conn.reply(&self.ctx, TcpFlags::RST | TcpFlags::ACK),
                }
                self.finish(host, id, Disposition::Release);
            }
        }
    }

    pub fn on_read(&mut self, host: &mut impl TcpHost, id: ConnId, result: io::Result<Vec<u8>>, now: Instant) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.read_pending = false;
        if self.ctx.is_shutting_down() {
            return;
        }
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(conn = %id, state = %conn.state, error = %e, "host read failed");
                conn.reply(&self.ctx, TcpFlags::RST | TcpFlags::ACK);
                self.finish(host, id, Disposition::Abort);
                return;
            }
        };

        if data.is_empty() {
            conn.host_eof = true;
            match conn.state {
                TcpState::SynRcvd | TcpState::Established => {
                    conn.send_tracked(&self.ctx, TcpFlags::FIN | TcpFlags::ACK, Vec::new(), now);
                    conn.state = TcpState::FinWait1;
                    tracing::debug!(conn = %id, "host closed, -> FINWAIT_1");
                }
                TcpState::CloseWait => {
                    conn.send_tracked(&self.ctx, TcpFlags::FIN | TcpFlags::ACK, Vec::new(), now);
                    conn.state = TcpState::LastAck;
                    host.close(id);
                    conn.host_open = false;
                    tracing::debug!(conn = %id, "host closed, CLOSE_WAIT -> LAST_ACK");
                }
                _ => {}
            }
            return;
        }

        if !matches!(conn.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        let flags = if data.len() >= conn.mss {
            TcpFlags::ACK
        } else {
            TcpFlags::ACK | TcpFlags::PSH
        };
        conn.send_tracked(&self.ctx, flags, data, now);
        conn.request_read(host, id, now);
    }

    pub fn on_written(&mut self, host: &mut impl TcpHost, id: ConnId, result: io::Result<()>, now: Instant) {
        let TcpTable { ctx, conns, .. } = &mut *self;
        let Some(conn) = conns.get_mut(id) else {
            return;
        };
        if ctx.is_shutting_down() {
            return;
        }
        if let Err(e) = result {
            tracing::debug!(conn = %id, state = %conn.state, error = %e, "host write failed");
            conn.reply(ctx, TcpFlags::RST | TcpFlags::ACK);
            self.finish(host, id, Disposition::Abort);
            return;
        }

        conn.seq_in = conn.seq_in.wrapping_add(conn.bytes_to_send);
        conn.bytes_to_send = 0;
        let disposition = if conn.fin_pending {
            conn.fin_pending = false;
            accept_fin(ctx, host, id, conn, now)
        } else {
            conn.reply(ctx, TcpFlags::ACK);
            Disposition::Keep
        };
        if matches!(
            conn.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) {
            conn.accept_data = true;
        }
        self.finish(host, id, disposition);
    }

    pub fn on_remote_closed(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id) {
            tracing::debug!(conn = %id, state = %conn.state, "remote closed");
            conn.remote_closed = true;
        }
    }

    /// A host listener accepted a connection. Returns the connection that
    /// should own the stream, or `None` when it must be dropped.
    pub fn on_accepted(
        &mut self,
        host: &mut impl TcpHost,
        listener: ListenerId,
        peer: SocketAddrV4,
        local: SocketAddrV4,
        now: Instant,
    ) -> Option<ConnId> {
        let entry = self.listeners.get(listener)?;
        let guest_port = entry.guest_port;
        let refused = entry.allowed_peer.is_some_and(|ip| ip != *peer.ip());
        if entry.once {
            self.close_listener(host, listener);
        }
        if refused {
            tracing::debug!(%listener, %peer, "refusing unauthorized peer");
            return None;
        }
        let Some(guest_ip) = self.ctx.guest_ip() else {
            tracing::debug!(%listener, %peer, "guest address unknown, dropping connection");
            return None;
        };

        // Only an exact match is stale: other peers on the same listener
        // share `guest_port`.
        let key = FlowKey::tcp(guest_port, peer.port());
        if let Some(old) = self.conns.find(key) {
            if let Some(conn) = self.conns.remove(old) {
                tracing::debug!(conn = %old, %peer, "peer reused its port");
                self.discard(host, old, conn, true);
            }
        }

        let mut conn = TcpConnection::new(key, guest_ip, *peer.ip());
        conn.state = TcpState::SynSent;
        conn.guest_ack = conn.seq_out;
        conn.host_local = Some(local);
        conn.host_open = true;
        conn.accepted = true;
        conn.expires_at = Some(now + SYN_FLOOD_GUARD);
        conn.syn(&self.ctx, conn.seq_out, TcpFlags::SYN);
        conn.seq_out = conn.seq_out.wrapping_add(1);

        let (id, evicted) = self.conns.insert(conn);
        if let Some((old, conn)) = evicted {
            self.discard(host, old, conn, true);
        }
        tracing::debug!(conn = %id, %peer, guest_port, "accepted, -> SYN_SENT");
        Some(id)
    }

    /// Fires resend timers and reclaims TIME_WAIT and half-open slots.
    pub fn tick(&mut self, host: &mut impl TcpHost, now: Instant) {
        for id in self.conns.ids() {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            if conn.expires_at.is_some_and(|at| at <= now) {
                if conn.state == TcpState::SynSent {
                    tracing::debug!(conn = %id, "SYN flood guard expired");
                    self.finish(host, id, Disposition::Abort);
                } else {
                    tracing::debug!(conn = %id, state = %conn.state, "TIME_WAIT expired");
                    self.finish(host, id, Disposition::Release);
                }
                continue;
            }
            if !conn.stalled_until.is_some_and(|at| at <= now) {
                continue;
            }
            let unacked = conn.guest_ack != conn.seq_out && conn.last_sent.is_some();
            let resendable = matches!(
                conn.state,
                TcpState::Established
                    | TcpState::CloseWait
                    | TcpState::FinWait1
                    | TcpState::LastAck
                    | TcpState::Closing
            );
            if unacked && resendable {
                conn.retransmit(&self.ctx, now);
            } else if conn.read_deferred {
                conn.stalled_until = None;
                conn.request_read(host, id, now);
            } else {
                conn.stalled_until = None;
            }
        }
    }

    /// Closes every connection and listener.
    pub fn close_all(&mut self, host: &mut impl TcpHost) {
        for id in self.conns.ids() {
            if let Some(conn) = self.conns.remove(id) {
                self.discard(host, id, conn, false);
            }
        }
        for id in self.listeners.ids() {
            self.close_listener(host, id);
        }
    }

    fn finish(&mut self, host: &mut impl TcpHost, id: ConnId, disposition: Disposition) {
        let abortive = match disposition {
            Disposition::Keep => return,
            Disposition::Release => false,
            Disposition::Abort => true,
        };
        if let Some(conn) = self.conns.remove(id) {
            self.discard(host, id, conn, abortive);
        }
    }

    /// Releases the host resources of a connection already removed from the
    /// table, including its FTP data listener.
    fn discard(&mut self, host: &mut impl TcpHost, id: ConnId, conn: TcpConnection, abortive: bool) {
        if conn.host_open {
            if abortive {
                host.abort(id);
            } else {
                host.close(id);
            }
        }
        if let Some(child) = conn.child_listener {
            self.close_listener(host, child);
        }
        tracing::debug!(conn = %id, state = %conn.state, "connection released");
    }

    fn close_listener(&mut self, host: &mut impl TcpHost, id: ListenerId) {
        let Some(listener) = self.listeners.remove(id) else {
            return;
        };
        host.close_listener(id);
        if let Some(parent) = listener.parent.and_then(|p| self.conns.get_mut(p)) {
            if parent.child_listener == Some(id) {
                parent.child_listener = None;
            }
        }
        tracing::debug!(%id, bind = %listener.bind, "listener closed");
    }
}

/// Consumes an in-order FIN from the guest.
fn accept_fin(
    ctx: &Context,
    host: &mut impl TcpHost,
    id: ConnId,
    conn: &mut TcpConnection,
    now: Instant,
) -> Disposition {
    conn.seq_in = conn.seq_in.wrapping_add(1);
    conn.reply(ctx, TcpFlags::ACK);
    let before = conn.state;
    match conn.state {
        TcpState::Established => {
            host.shutdown_write(id);
            conn.state = TcpState::CloseWait;
        }
        TcpState::FinWait1 => {
            conn.close_or_shutdown(host, id);
            conn.state = TcpState::Closing;
        }
        TcpState::FinWait2 => {
            conn.close_or_shutdown(host, id);
            conn.enter_time_wait(now);
        }
        _ => {}
    }
    tracing::debug!(conn = %id, from = %before, to = %conn.state, "guest FIN");
    Disposition::Keep
}

/// Rewrites a PORT command or PASV reply and opens the matching single-use
/// data listener. Returns the replacement payload.
fn ftp_alg(
    ctx: &Context,
    listeners: &mut Registry<Listener>,
    host: &mut impl TcpHost,
    id: ConnId,
    conn: &mut TcpConnection,
    data: &[u8],
) -> Option<Vec<u8>> {
    let direction = if ctx.is_ftp_port(conn.key.local_port) {
        FtpDirection::PassiveReply
    } else if ctx.is_ftp_port(conn.key.remote_port) {
        FtpDirection::PortCommand
    } else {
        return None;
    };
    let endpoint = ftp::parse(data, direction)?;
    let local_ip = *conn.host_local?.ip();

    if let Some(previous) = conn.child_listener.take() {
        if listeners.remove(previous).is_some() {
            host.close_listener(previous);
        }
    }

    let (lid, evicted) = listeners.insert(Listener {
        guest_port: endpoint.addr.port(),
        bind: SocketAddrV4::new(local_ip, endpoint.addr.port()),
        allowed_peer: Some(conn.remote_ip),
        once: true,
        parent: Some(id),
    });
    if let Some((old, _)) = evicted {
        host.close_listener(old);
    }
    let bound = host
        .listen(lid, SocketAddrV4::new(local_ip, endpoint.addr.port()))
        .or_else(|_| host.listen(lid, SocketAddrV4::new(local_ip, 0)));
    let port = match bound {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!(conn = %id, error = %e, "FTP data listener failed");
            listeners.remove(lid);
            return None;
        }
    };
    if let Some(listener) = listeners.get_mut(lid) {
        listener.bind = SocketAddrV4::new(local_ip, port);
    }
    conn.child_listener = Some(lid);

    let advertised = SocketAddrV4::new(local_ip, port);
    tracing::debug!(conn = %id, ?direction, guest = %endpoint.addr, %advertised, "FTP data endpoint rewritten");
    Some(ftp::rewrite(data, &endpoint, advertised))
}

/// Answers a segment that matches no connection.
fn reset_unknown(ctx: &Context, packet: &Ipv4Packet, tcp: &TcpHeader, payload_len: usize) {
    let (seq, ack, flags) = if tcp.flags.contains(TcpFlags::ACK) {
        (tcp.ack, 0, TcpFlags::RST)
    } else {
        let len = payload_len as u32
            + tcp.flags.contains(TcpFlags::SYN) as u32
            + tcp.flags.contains(TcpFlags::FIN) as u32;
        (0, tcp.seq.wrapping_add(len), TcpFlags::RST | TcpFlags::ACK)
    };
    let rst = TcpHeader {
        src_port: tcp.dst_port,
        dst_port: tcp.src_port,
        seq,
        ack,
        flags,
        window: 0,
        urgent: 0,
        options: Vec::new(),
    };
    let bytes = rst.to_bytes(packet.header.dst, packet.header.src, &[]);
    ctx.send_ipv4_to_guest(packet.header.dst, packet.header.src, IP_PROTO_TCP, &bytes);
}
