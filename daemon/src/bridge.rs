//! Unix datagram link to the emulator: one Ethernet frame per datagram.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::socket::{setsockopt, sockopt};
use nubus_router::Gateway;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;

/// Largest frame accepted from the emulator, with room for a VLAN tag.
const MAX_FRAME: usize = 1518;
const SOCKET_BUFFER: usize = 1 << 20;

/// Binds the link socket, replacing a stale one left by an earlier run.
pub fn bind(path: &Path) -> io::Result<UnixDatagram> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let socket = UnixDatagram::bind(path)?;
    for (name, result) in [
        ("SO_RCVBUF", setsockopt(&socket, sockopt::RcvBuf, &SOCKET_BUFFER)),
        ("SO_SNDBUF", setsockopt(&socket, sockopt::SndBuf, &SOCKET_BUFFER)),
    ] {
        if let Err(e) = result {
            tracing::warn!(option = name, error = %e, "could not size socket buffer");
        }
    }
    Ok(socket)
}

/// Moves frames between the emulator and the gateway until `shutdown`
/// resolves. Guest-bound frames go to whichever peer sent last.
pub async fn run(
    gateway: &Gateway,
    socket: &UnixDatagram,
    mut to_guest: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    let mut peer: Option<PathBuf> = None;
    let mut buf = vec![0u8; MAX_FRAME];

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(error = %e, "link receive failed");
                        continue;
                    }
                };
                match from.as_pathname() {
                    Some(path) if peer.as_deref() != Some(path) => {
                        tracing::info!(peer = %path.display(), "emulator attached");
                        peer = Some(path.to_path_buf());
                    }
                    Some(_) => {}
                    None => tracing::trace!("frame from unbound peer"),
                }
                if !gateway.deliver_frame_from_guest(&buf[..n]) {
                    tracing::trace!(len = n, "frame not handled");
                }
            }
            Some(frame) = to_guest.recv() => {
                let Some(path) = &peer else {
                    tracing::trace!(len = frame.len(), "no emulator attached, dropping frame");
                    continue;
                };
                if let Err(e) = socket.send_to(&frame, path).await {
                    tracing::debug!(peer = %path.display(), error = %e, "could not deliver frame");
                }
            }
        }
    }
}
