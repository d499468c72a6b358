//! Host socket boundary.
//!
//! The protocol tables never touch a socket. They issue operations through
//! [`TcpHost`] and [`DatagramHost`]; completions come back as
//! [`HostEvent`]s that the gateway's watcher task feeds into the tables.
//!
//! ```text
//! TcpTable ──connect/send/recv──▶ TokioTcpHost ──command──▶ connection task
//!    ▲                                                          │
//!    └────────── watcher ◀──── HostEvent (mpsc) ◀───────────────┘
//! ```

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::{ConnId, ListenerId, SessionId};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const RECV_BUFFER_SIZE: usize = 65535;

/// Byte-stream operations on behalf of the TCP table.
///
/// Each connection has at most one outstanding `recv` and one outstanding
/// `send`; their completions arrive as [`HostEvent::Read`] and
/// [`HostEvent::Written`].
pub trait TcpHost: Send {
    fn connect(&mut self, conn: ConnId, remote: SocketAddrV4, ttl: u8);
    fn send(&mut self, conn: ConnId, data: Vec<u8>);
    fn recv(&mut self, conn: ConnId, max: usize);
    fn shutdown_write(&mut self, conn: ConnId);
    fn set_ttl(&mut self, conn: ConnId, ttl: u8);
    /// Graceful close.
    fn close(&mut self, conn: ConnId);
    /// Close with a reset toward the remote peer.
    fn abort(&mut self, conn: ConnId);
    /// Binds and starts accepting; returns the bound port.
    fn listen(&mut self, listener: ListenerId, addr: SocketAddrV4) -> io::Result<u16>;
    fn close_listener(&mut self, listener: ListenerId);
}

/// Datagram and raw ICMP operations on behalf of the datagram table.
pub trait DatagramHost: Send {
    fn udp_open(&mut self, session: SessionId) -> io::Result<()>;
    /// Non-blocking send; errors are reported synchronously.
    fn udp_send_to(
        &mut self,
        session: SessionId,
        dst: SocketAddrV4,
        ttl: u8,
        payload: &[u8],
    ) -> io::Result<()>;
    /// Starts delivering [`HostEvent::Datagram`]s for the session.
    fn udp_start_recv(&mut self, session: SessionId);
    fn udp_close(&mut self, session: SessionId);
    /// Opens the permanent raw ICMP socket.
    fn icmp_listen(&mut self, session: SessionId) -> io::Result<()>;
    fn icmp_send(&mut self, dst: Ipv4Addr, ttl: u8, message: &[u8]) -> io::Result<()>;
    fn icmp_close(&mut self, session: SessionId);
}

#[derive(Debug)]
pub enum HostEvent {
    Connected {
        conn: ConnId,
        result: io::Result<SocketAddrV4>,
    },
    /// An empty buffer means the remote closed its side.
    Read {
        conn: ConnId,
        result: io::Result<Vec<u8>>,
    },
    Written {
        conn: ConnId,
        result: io::Result<()>,
    },
    RemoteClosed {
        conn: ConnId,
    },
    Accepted {
        listener: ListenerId,
        stream: TcpStream,
        peer: SocketAddrV4,
        local: SocketAddrV4,
    },
    Datagram {
        session: SessionId,
        from: SocketAddrV4,
        data: Vec<u8>,
    },
    DatagramFailed {
        session: SessionId,
        error: io::Error,
    },
    Icmp {
        packet: Vec<u8>,
    },
}

pub type EventSender = mpsc::UnboundedSender<HostEvent>;

#[derive(Debug)]
enum ConnCommand {
    Recv(usize),
    Send(Vec<u8>),
    ShutdownWrite,
    SetTtl(u8),
    Close,
    Abort,
}

enum Origin {
    Connect { remote: SocketAddrV4, ttl: u8 },
    Accepted(TcpStream),
}

pub struct TokioTcpHost {
    runtime: Handle,
    events: EventSender,
    conns: HashMap<ConnId, mpsc::UnboundedSender<ConnCommand>>,
    listeners: HashMap<ListenerId, JoinHandle<()>>,
}

impl TokioTcpHost {
    pub fn new(runtime: Handle, events: EventSender) -> Self {
        Self {
            runtime,
            events,
            conns: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Hands an accepted stream to a new connection task.
    pub fn adopt(&mut self, conn: ConnId, stream: TcpStream) {
        self.spawn_connection(conn, Origin::Accepted(stream));
    }

    fn spawn_connection(&mut self, conn: ConnId, origin: Origin) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.insert(conn, tx);
        self.runtime
            .spawn(run_connection(conn, origin, rx, self.events.clone()));
    }

    fn command(&mut self, conn: ConnId, cmd: ConnCommand) {
        match self.conns.get(&conn) {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    tracing::trace!(%conn, "connection task already gone");
                }
            }
            None => tracing::trace!(%conn, ?cmd, "no connection task"),
        }
    }
}

impl TcpHost for TokioTcpHost {
    fn connect(&mut self, conn: ConnId, remote: SocketAddrV4, ttl: u8) {
        self.spawn_connection(conn, Origin::Connect { remote, ttl });
    }

    fn send(&mut self, conn: ConnId, data: Vec<u8>) {
        self.command(conn, ConnCommand::Send(data));
    }

    fn recv(&mut self, conn: ConnId, max: usize) {
        self.command(conn, ConnCommand::Recv(max));
    }

    fn shutdown_write(&mut self, conn: ConnId) {
        self.command(conn, ConnCommand::ShutdownWrite);
    }

    fn set_ttl(&mut self, conn: ConnId, ttl: u8) {
        self.command(conn, ConnCommand::SetTtl(ttl));
    }

    fn close(&mut self, conn: ConnId) {
        self.command(conn, ConnCommand::Close);
        self.conns.remove(&conn);
    }

    fn abort(&mut self, conn: ConnId) {
        self.command(conn, ConnCommand::Abort);
        self.conns.remove(&conn);
    }

    fn listen(&mut self, listener: ListenerId, addr: SocketAddrV4) -> io::Result<u16> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();
        let tcp_listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let task = self
            .runtime
            .spawn(run_acceptor(listener, tcp_listener, self.events.clone()));
        self.listeners.insert(listener, task);
        Ok(port)
    }

    fn close_listener(&mut self, listener: ListenerId) {
        if let Some(task) = self.listeners.remove(&listener) {
            task.abort();
        }
    }
}

async fn connect_stream(remote: SocketAddrV4, ttl: u8) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    let stream = socket.connect(SocketAddr::V4(remote)).await?;
    stream.set_nodelay(true)?;
    stream.set_ttl(ttl as u32)?;
    Ok(stream)
}

fn local_v4(stream: &TcpStream) -> SocketAddrV4 {
    match stream.local_addr() {
        Ok(SocketAddr::V4(addr)) => addr,
        _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    }
}

enum Inbound {
    Read(io::Result<Vec<u8>>),
    Peeked(io::Result<usize>),
}

async fn inbound(rd: &mut OwnedReadHalf, read_max: Option<usize>) -> Inbound {
    match read_max {
        Some(max) => {
            let mut buf = vec![0u8; max.max(1)];
            let result = rd.read(&mut buf).await.map(|n| {
                buf.truncate(n);
                buf
            });
            Inbound::Read(result)
        }
        None => {
            let mut probe = [0u8; 1];
            Inbound::Peeked(rd.peek(&mut probe).await)
        }
    }
}

async fn write_some(wr: &mut OwnedWriteHalf, pending: &Option<(Vec<u8>, usize)>) -> io::Result<usize> {
    match pending {
        Some((data, offset)) => wr.write(&data[*offset..]).await,
        None => std::future::pending().await,
    }
}

/// Owns one host stream. Serves one read and one write at a time and,
/// while no read is requested, watches for the remote closing.
async fn run_connection(
    conn: ConnId,
    origin: Origin,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
    events: EventSender,
) {
    let stream = match origin {
        Origin::Accepted(stream) => stream,
        Origin::Connect { remote, ttl } => {
            let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_stream(remote, ttl));
            tokio::select! {
                res = connect => {
                    let result = match res {
                        Ok(Ok(stream)) => Ok(stream),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                    };
                    match result {
                        Ok(stream) => {
                            let local = local_v4(&stream);
                            if events.send(HostEvent::Connected { conn, result: Ok(local) }).is_err() {
                                return;
                            }
                            stream
                        }
                        Err(e) => {
                            let _ = events.send(HostEvent::Connected { conn, result: Err(e) });
                            return;
                        }
                    }
                }
                // Any command before the connect completes is a close.
                _ = commands.recv() => return,
            }
        }
    };

    let (mut rd, mut wr) = stream.into_split();
    let mut read_max: Option<usize> = None;
    let mut pending: Option<(Vec<u8>, usize)> = None;
    let mut watch_close = true;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(ConnCommand::Close) => break,
                Some(ConnCommand::Abort) => {
                    let _ = SockRef::from(wr.as_ref()).set_linger(Some(Duration::ZERO));
                    break;
                }
                Some(ConnCommand::Recv(max)) => read_max = Some(max),
                Some(ConnCommand::Send(data)) => pending = Some((data, 0)),
                Some(ConnCommand::ShutdownWrite) => {
                    if let Err(e) = wr.shutdown().await {
                        tracing::debug!(%conn, error = %e, "shutdown failed");
                    }
                }
                Some(ConnCommand::SetTtl(ttl)) => {
                    if let Err(e) = wr.as_ref().set_ttl(ttl as u32) {
                        tracing::debug!(%conn, error = %e, "set TTL failed");
                    }
                }
            },
            res = inbound(&mut rd, read_max), if read_max.is_some() || watch_close => match res {
                Inbound::Read(result) => {
                    read_max = None;
                    watch_close = true;
                    if events.send(HostEvent::Read { conn, result }).is_err() {
                        break;
                    }
                }
                Inbound::Peeked(result) => {
                    // Data or an error is left for the next read to report.
                    watch_close = false;
                    if matches!(result, Ok(0)) && events.send(HostEvent::RemoteClosed { conn }).is_err() {
                        break;
                    }
                }
            },
            res = write_some(&mut wr, &pending), if pending.is_some() => {
                let result = match res {
                    Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => {
                        let done = match pending.as_mut() {
                            Some((data, offset)) => {
                                *offset += n;
                                *offset >= data.len()
                            }
                            None => true,
                        };
                        if !done {
                            continue;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                pending = None;
                if events.send(HostEvent::Written { conn, result }).is_err() {
                    break;
                }
            }
        }
    }
    tracing::trace!(%conn, "connection task finished");
}

async fn run_acceptor(id: ListenerId, listener: TcpListener, events: EventSender) {
    loop {
        match listener.accept().await {
            Ok((stream, SocketAddr::V4(peer))) => {
                let local = local_v4(&stream);
                let event = HostEvent::Accepted {
                    listener: id,
                    stream,
                    peer,
                    local,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok((_, peer)) => tracing::debug!(listener = %id, %peer, "ignoring non-IPv4 peer"),
            Err(e) => {
                tracing::debug!(listener = %id, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    recv_task: Option<JoinHandle<()>>,
}

pub struct TokioDatagramHost {
    runtime: Handle,
    events: EventSender,
    udp: HashMap<SessionId, UdpEndpoint>,
    icmp: Option<(SessionId, JoinHandle<()>)>,
}

impl TokioDatagramHost {
    pub fn new(runtime: Handle, events: EventSender) -> Self {
        Self {
            runtime,
            events,
            udp: HashMap::new(),
            icmp: None,
        }
    }
}

impl DatagramHost for TokioDatagramHost {
    fn udp_open(&mut self, session: SessionId) -> io::Result<()> {
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = self.runtime.enter();
            UdpSocket::from_std(std_socket)?
        };
        self.udp.insert(
            session,
            UdpEndpoint {
                socket: Arc::new(socket),
                recv_task: None,
            },
        );
        Ok(())
    }

    fn udp_send_to(
        &mut self,
        session: SessionId,
        dst: SocketAddrV4,
        ttl: u8,
        payload: &[u8],
    ) -> io::Result<()> {
        let endpoint = self
            .udp
            .get(&session)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        endpoint.socket.set_ttl(ttl as u32)?;
        match endpoint.socket.try_send_to(payload, SocketAddr::V4(dst)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Datagram semantics: a full send buffer drops the packet.
                tracing::debug!(%session, "UDP send buffer full, dropping datagram");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn udp_start_recv(&mut self, session: SessionId) {
        let Some(endpoint) = self.udp.get_mut(&session) else {
            return;
        };
        let socket = endpoint.socket.clone();
        let events = self.events.clone();
        endpoint.recv_task = Some(self.runtime.spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, SocketAddr::V4(from))) => {
                        let event = HostEvent::Datagram {
                            session,
                            from,
                            data: buf[..n].to_vec(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        let _ = events.send(HostEvent::DatagramFailed { session, error });
                        return;
                    }
                }
            }
        }));
    }

    fn udp_close(&mut self, session: SessionId) {
        if let Some(endpoint) = self.udp.remove(&session) {
            if let Some(task) = endpoint.recv_task {
                task.abort();
            }
        }
    }

    fn icmp_listen(&mut self, session: SessionId) -> io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        let async_fd = {
            let _guard = self.runtime.enter();
            AsyncFd::new(socket)?
        };
        let events = self.events.clone();
        let task = self.runtime.spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::warn!(error = %e, "ICMP listener stopped");
                        return;
                    }
                };
                match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                    Ok(Ok(n)) if n > 0 => {
                        let event = HostEvent::Icmp {
                            packet: buf[..n].to_vec(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => tracing::debug!(error = %e, "ICMP receive failed"),
                    Err(_would_block) => continue,
                }
            }
        });
        self.icmp = Some((session, task));
        Ok(())
    }

    fn icmp_send(&mut self, dst: Ipv4Addr, ttl: u8, message: &[u8]) -> io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_ttl(ttl as u32)?;
        socket.send_to(message, &SockAddr::from(SocketAddrV4::new(dst, 0)))?;
        Ok(())
    }

    fn icmp_close(&mut self, session: SessionId) {
        if let Some((id, task)) = self.icmp.take() {
            if id == session {
                task.abort();
            } else {
                self.icmp = Some((id, task));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FlowKey, Flow, Registry};
    use tokio::io::AsyncReadExt;

    struct Dummy;

    impl Flow for Dummy {
        fn key(&self) -> FlowKey {
            FlowKey::tcp(1, 1)
        }
    }

    fn ids(n: usize) -> Vec<ConnId> {
        let mut reg = Registry::with_capacity(n);
        (0..n).map(|_| reg.insert(Dummy).0).collect()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for host event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_send_and_read() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match server.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = TokioTcpHost::new(Handle::current(), tx);
        let conn = ids(1)[0];

        host.connect(conn, addr, 64);
        let (mut peer, _) = server.accept().await.unwrap();
        match next_event(&mut rx).await {
            HostEvent::Connected { result, .. } => {
                assert_eq!(*result.unwrap().ip(), Ipv4Addr::LOCALHOST)
            }
            other => panic!("unexpected event {:?}", other),
        }

        host.send(conn, b"hello".to_vec());
        match next_event(&mut rx).await {
            HostEvent::Written { result, .. } => assert!(result.is_ok()),
            other => panic!("unexpected event {:?}", other),
        }
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        host.recv(conn, 1460);
        peer.write_all(b"world").await.unwrap();
        match next_event(&mut rx).await {
            HostEvent::Read { result, .. } => assert_eq!(result.unwrap(), b"world"),
            other => panic!("unexpected event {:?}", other),
        }

        // Remote close while no read is outstanding.
        drop(peer);
        match next_event(&mut rx).await {
            HostEvent::RemoteClosed { conn: c } => assert_eq!(c, conn),
            other => panic!("unexpected event {:?}", other),
        }
        host.close(conn);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = TokioTcpHost::new(Handle::current(), tx);
        host.connect(ids(1)[0], SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), 64);
        match next_event(&mut rx).await {
            HostEvent::Connected { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_reports_accepted_streams() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = TokioTcpHost::new(Handle::current(), tx);
        let listener = ids(1)[0];
        let port = host
            .listen(listener, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        assert_ne!(port, 0);

        let _client = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        match next_event(&mut rx).await {
            HostEvent::Accepted { listener: l, local, .. } => {
                assert_eq!(l, listener);
                assert_eq!(local.port(), port);
            }
            other => panic!("unexpected event {:?}", other),
        }
        host.close_listener(listener);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = TokioDatagramHost::new(Handle::current(), tx);
        let session = ids(1)[0];

        host.udp_open(session).unwrap();
        host.udp_send_to(session, echo_addr, 64, b"ping").unwrap();
        host.udp_start_recv(session);

        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        echo.send_to(b"pong", from).await.unwrap();

        match next_event(&mut rx).await {
            HostEvent::Datagram { from, data, .. } => {
                assert_eq!(from, echo_addr);
                assert_eq!(data, b"pong");
            }
            other => panic!("unexpected event {:?}", other),
        }
        host.udp_close(session);
    }
}
