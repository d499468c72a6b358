//! Frame dispatcher and gateway lifecycle.
//!
//! [`Gateway`] owns both protocol tables, each behind its own mutex together
//! with the tokio driver that performs its host I/O. Guest frames enter
//! through [`Gateway::deliver_frame_from_guest`]; host completions enter
//! through the watcher task; timers are driven by the sweep task.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::arp::{ArpOutcome, handle_arp};
use crate::config::RouterConfig;
use crate::context::{Context, FrameSink};
use crate::error::{Result, RouterError};
use crate::host::{HostEvent, TokioDatagramHost, TokioTcpHost};
use crate::icmp::{HostFailure, send_error};
use crate::packet::{
    ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, EthernetHeader, IP_PROTO_ICMP, IP_PROTO_TCP,
    IP_PROTO_UDP, Ipv4Packet,
};
use crate::tcp::TcpTable;
use crate::udp::DatagramTable;

pub const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

struct TcpSide {
    table: TcpTable,
    io: TokioTcpHost,
}

struct DatagramSide {
    table: DatagramTable,
    io: TokioDatagramHost,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table occupancy, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub tcp_connections: usize,
    pub tcp_listeners: usize,
    pub datagram_sessions: usize,
}

pub struct Gateway {
    ctx: Arc<Context>,
    tcp: Arc<Mutex<TcpSide>>,
    datagrams: Arc<Mutex<DatagramSide>>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Starts the gateway on the current tokio runtime. Frames for the guest
    /// are handed to `sink`.
    pub fn start(config: RouterConfig, sink: Arc<dyn FrameSink>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| RouterError::Runtime(e.to_string()))?;
        let router_ip = config.resolve_router_ip();
        let ctx = Arc::new(Context::new(&config, router_ip, sink));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut tcp = TcpSide {
            table: TcpTable::new(ctx.clone(), config.max_tcp_connections),
            io: TokioTcpHost::new(runtime.clone(), events_tx.clone()),
        };
        tcp.table.open_static_listeners(&mut tcp.io, &config.tcp_ports);
        let datagrams = DatagramSide {
            table: DatagramTable::new(ctx.clone(), config.max_sessions),
            io: TokioDatagramHost::new(runtime.clone(), events_tx),
        };

        let tcp = Arc::new(Mutex::new(tcp));
        let datagrams = Arc::new(Mutex::new(datagrams));
        let (stop, stopped) = watch::channel(false);
        let watcher = runtime.spawn(watch_events(
            events_rx,
            tcp.clone(),
            datagrams.clone(),
            stopped.clone(),
        ));
        let sweeper = runtime.spawn(sweep(tcp.clone(), datagrams.clone(), stopped));

        tracing::info!(
            %router_ip,
            gateway_mac = %ctx.gateway_mac(),
            listeners = config.tcp_ports.len(),
            "gateway started"
        );
        Ok(Self {
            ctx,
            tcp,
            datagrams,
            stop,
            tasks: Mutex::new(vec![watcher, sweeper]),
        })
    }

    pub fn guest_ip(&self) -> Option<Ipv4Addr> {
        self.ctx.guest_ip()
    }

    pub fn stats(&self) -> GatewayStats {
        let (tcp_connections, tcp_listeners) = {
            let side = lock(&self.tcp);
            (side.table.connection_count(), side.table.listener_count())
        };
        GatewayStats {
            tcp_connections,
            tcp_listeners,
            datagram_sessions: lock(&self.datagrams).table.session_count(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Consumes one Ethernet frame sent by the guest. Returns whether the
    /// gateway handled it; unhandled frames may go to the real interface.
    pub fn deliver_frame_from_guest(&self, frame: &[u8]) -> bool {
        if self.ctx.is_shutting_down() {
            return false;
        }
        let (eth, payload) = match EthernetHeader::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "dropping short frame");
                return false;
            }
        };
        self.ctx.learn_guest_mac(eth.src);

        match eth.ethertype {
            ETHERTYPE_ARP => {
                let outcome = handle_arp(&self.ctx, &eth, payload);
                if !outcome.handled() {
                    return false;
                }
                {
                    let mut side = lock(&self.datagrams);
                    let side = &mut *side;
                    side.table.start_icmp_listener(&mut side.io);
                }
                if let ArpOutcome::Reply(reply) = outcome {
                    self.ctx.send_to_guest(reply);
                }
                true
            }
            ETHERTYPE_IPV4 => {
                self.route_ipv4(payload);
                true
            }
            ETHERTYPE_IPV6 => true,
            _ => false,
        }
    }

    fn route_ipv4(&self, raw: &[u8]) {
        let mut packet = match Ipv4Packet::parse(raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed IPv4 datagram");
                return;
            }
        };
        if packet.is_fragment() {
            tracing::debug!(dst = %packet.header.dst, "dropping IPv4 fragment");
            return;
        }
        let ttl = packet.header.ttl;
        if ttl <= 1 {
            tracing::debug!(dst = %packet.header.dst, "TTL expired in transit");
            send_error(&self.ctx, HostFailure::TtlExceeded, &packet.quote());
            return;
        }
        packet.set_ttl(ttl - 1);

        let now = Instant::now();
        match packet.header.protocol {
            IP_PROTO_TCP => {
                let mut side = lock(&self.tcp);
                let side = &mut *side;
                side.table.handle_segment(&mut side.io, &packet, now);
            }
            IP_PROTO_UDP => {
                let mut side = lock(&self.datagrams);
                let side = &mut *side;
                side.table.handle_udp(&mut side.io, &packet, now);
            }
            IP_PROTO_ICMP => {
                let mut side = lock(&self.datagrams);
                let side = &mut *side;
                side.table.handle_icmp(&mut side.io, &packet);
            }
            protocol => tracing::debug!(protocol, "dropping unsupported IP protocol"),
        }
    }

    /// Frames from the real interface that the gateway stands in for and
    /// that must not also reach the guest.
    pub fn intercepts_host_frame(&self, frame: &[u8]) -> bool {
        EthernetHeader::parse(frame).is_ok_and(|(eth, _)| {
            matches!(eth.ethertype, ETHERTYPE_ARP | ETHERTYPE_IPV4 | ETHERTYPE_IPV6)
        })
    }

    /// Closes every socket and waits for the background tasks.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        if tasks.is_empty() {
            return;
        }
        self.close_everything();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "gateway task failed");
            }
        }
        tracing::info!("gateway stopped");
    }

    fn close_everything(&self) {
        self.ctx.begin_shutdown();
        {
            let mut side = lock(&self.tcp);
            let side = &mut *side;
            side.table.close_all(&mut side.io);
        }
        {
            let mut side = lock(&self.datagrams);
            let side = &mut *side;
            side.table.close_all(&mut side.io);
        }
        let _ = self.stop.send(true);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        if tasks.is_empty() {
            return;
        }
        self.close_everything();
        for task in tasks {
            task.abort();
        }
    }
}

/// Applies host completions to the tables.
async fn watch_events(
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    tcp: Arc<Mutex<TcpSide>>,
    datagrams: Arc<Mutex<DatagramSide>>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let now = Instant::now();
        match event {
            HostEvent::Connected { conn, result } => {
                let mut side = lock(&tcp);
                let side = &mut *side;
                side.table.on_connected(&mut side.io, conn, result);
            }
            HostEvent::Read { conn, result } => {
                let mut side = lock(&tcp);
                let side = &mut *side;
                side.table.on_read(&mut side.io, conn, result, now);
            }
            HostEvent::Written { conn, result } => {
                let mut side = lock(&tcp);
                let side = &mut *side;
                side.table.on_written(&mut side.io, conn, result, now);
            }
            HostEvent::RemoteClosed { conn } => {
                lock(&tcp).table.on_remote_closed(conn);
            }
            HostEvent::Accepted {
                listener,
                stream,
                peer,
                local,
            } => {
                let mut side = lock(&tcp);
                let side = &mut *side;
                match side.table.on_accepted(&mut side.io, listener, peer, local, now) {
                    Some(conn) => side.io.adopt(conn, stream),
                    None => drop(stream),
                }
            }
            HostEvent::Datagram {
                session,
                from,
                data,
            } => {
                lock(&datagrams).table.on_datagram(session, from, &data, now);
            }
            HostEvent::DatagramFailed { session, error } => {
                let mut side = lock(&datagrams);
                let side = &mut *side;
                side.table.on_datagram_failed(&mut side.io, session, &error);
            }
            HostEvent::Icmp { packet } => {
                lock(&datagrams).table.on_icmp_packet(&packet);
            }
        }
    }
    tracing::debug!("event watcher stopped");
}

/// Expires idle sessions, fires resend timers and reclaims closed slots.
async fn sweep(
    tcp: Arc<Mutex<TcpSide>>,
    datagrams: Arc<Mutex<DatagramSide>>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = interval.tick() => {}
        }
        let now = Instant::now();
        {
            let mut side = lock(&tcp);
            let side = &mut *side;
            side.table.tick(&mut side.io, now);
        }
        {
            let mut side = lock(&datagrams);
            let side = &mut *side;
            side.table.sweep(&mut side.io, now);
        }
    }
    tracing::debug!("sweep stopped");
}
