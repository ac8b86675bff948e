use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use super::framing::LineFrames;
use super::{parse_message, IngestError, LogRecord};
use crate::config::IngestConfig;

/// Largest syslog datagram or TCP frame accepted
const MAX_DATAGRAM: usize = 64 * 1024;

/// Running syslog listeners.
///
/// Records from every listener are merged, in arrival order, into the single
/// channel returned by [`IngestServer::start`]. [`IngestServer::kill`] stops
/// all listeners at once; anything still buffered in the sockets is dropped.
pub struct IngestServer {
    tasks: Vec<JoinHandle<()>>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    unix_socket: Option<PathBuf>,
}

impl IngestServer {
    /// Bind every configured listener. A bind failure is fatal to startup.
    pub async fn start(
        config: &IngestConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LogRecord>), IngestError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut server =
            Self { tasks: Vec::new(), udp_addr: None, tcp_addr: None, unix_socket: None };

        if !config.unix_only {
            let udp = UdpSocket::bind(config.listen)
                .await
                .map_err(|source| IngestError::Bind { addr: format!("udp://{}", config.listen), source })?;
            let tcp = TcpListener::bind(config.listen)
                .await
                .map_err(|source| IngestError::Bind { addr: format!("tcp://{}", config.listen), source })?;
            server.udp_addr = Some(udp.local_addr()?);
            server.tcp_addr = Some(tcp.local_addr()?);
            info!(udp = ?server.udp_addr, tcp = ?server.tcp_addr, "syslog listeners bound");

            server.tasks.push(tokio::spawn(run_udp(udp, tx.clone())));
            server.tasks.push(tokio::spawn(run_tcp(tcp, tx.clone())));
        }

        if !config.unix_socket.as_os_str().is_empty() {
            let socket = bind_unix(&config.unix_socket)?;
            info!(path = %config.unix_socket.display(), "syslog unix socket bound");
            server.unix_socket = Some(config.unix_socket.clone());
            server.tasks.push(tokio::spawn(run_unix(socket, tx)));
        }

        Ok((server, rx))
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn unix_socket(&self) -> Option<&Path> {
        self.unix_socket.as_deref()
    }

    /// Stop every listener and remove the unix socket file.
    pub fn kill(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(path) = self.unix_socket.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove syslog socket");
                }
            }
        }
    }
}

impl Drop for IngestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

fn bind_unix(path: &Path) -> Result<UnixDatagram, IngestError> {
    // A socket file left by an unclean shutdown makes bind fail with EADDRINUSE.
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale syslog socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(IngestError::Io(e)),
    }
    let socket = UnixDatagram::bind(path)
        .map_err(|source| IngestError::Bind { addr: format!("unix://{}", path.display()), source })?;
    // nginx workers run unprivileged and must be able to write.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(socket)
}

async fn run_udp(socket: UdpSocket, tx: mpsc::UnboundedSender<LogRecord>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "udp syslog receive error");
                continue;
            }
        };
        let mut record = parse_message(buf.get(..len).unwrap_or_default());
        record.received_from = Some(peer.to_string());
        if tx.send(record).is_err() {
            break;
        }
    }
}

async fn run_unix(socket: UnixDatagram, tx: mpsc::UnboundedSender<LogRecord>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "unix syslog receive error");
                continue;
            }
        };
        if tx.send(parse_message(buf.get(..len).unwrap_or_default())).is_err() {
            break;
        }
    }
}

async fn run_tcp(listener: TcpListener, tx: mpsc::UnboundedSender<LogRecord>) {
    // Dropping the set (when this task is aborted) aborts every connection.
    let mut connections = JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}

        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "syslog accept error");
                continue;
            }
        };
        debug!(%peer, "syslog tcp connection accepted");
        connections.spawn(run_tcp_connection(stream, peer, tx.clone()));
    }
}

/// Newline-delimited frames, each capped at [`MAX_DATAGRAM`] bytes.
async fn run_tcp_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::UnboundedSender<LogRecord>) {
    let mut frames = FramedRead::new(stream, LineFrames::new(MAX_DATAGRAM));
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, error = %e, "syslog tcp connection closed");
                return;
            }
        };
        if frame.is_empty() {
            continue;
        }
        let mut record = parse_message(&frame);
        record.received_from = Some(peer.to_string());
        if tx.send(record).is_err() {
            return;
        }
    }
}
