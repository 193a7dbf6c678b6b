//! Failure detection via multicast heartbeats.
//!
//! Both nodes of the pair join one multicast group. Each one broadcasts an identity
//! datagram every `interval` and listens for the other's:
//!
//! ```text
//! node A ── HEARTBEAT 10.0.0.1:8080 ──► group ──► node B   (resets B's deadline)
//! node A ◄──────────── own echo ──────── group              (ignored)
//! ```
//!
//! The watchdog is idle until the first peer datagram arrives. From then on every
//! datagram pushes the deadline out by `deadline`; when it elapses a silence signal
//! is emitted once and the watchdog goes back to idle, waiting for the peer to
//! reappear. Repeated failures and recoveries therefore keep producing signals.

use crate::{Error, Result};
use nix::sys::socket::sockopt::{ReuseAddr, ReusePort};
use nix::sys::socket::{AddressFamily, InetAddr, SockAddr, SockFlag, SockProtocol, SockType};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 512;
const BEAT_PREFIX: &str = "HEARTBEAT";

/// Heartbeat settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Run the broadcaster and watchdog at all
    pub enabled: bool,
    /// Multicast group and port
    pub group: SocketAddrV4,
    /// Local interface used to join the group
    pub interface: Ipv4Addr,
    /// Time between broadcasts
    pub interval: Duration,
    /// Peer silence tolerated before failover
    pub deadline: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 42, 99), 8123),
            interface: Ipv4Addr::UNSPECIFIED,
            interval: Duration::from_secs(1),
            deadline: Duration::from_millis(2500),
        }
    }
}

impl HeartbeatConfig {
    /// Validate timing and addressing
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.group.ip().is_multicast() {
            return Err(format!("{} is not a multicast address", self.group.ip()));
        }
        if self.interval.is_zero() {
            return Err("heartbeat interval must be greater than zero".into());
        }
        if self.deadline <= self.interval {
            return Err("heartbeat deadline must be longer than the interval".into());
        }
        Ok(())
    }
}

/// Identity datagram: `HEARTBEAT host:port`
pub fn encode_beat(addr: &str) -> Vec<u8> {
    format!("{} {}", BEAT_PREFIX, addr).into_bytes()
}

/// Sender address of a datagram, or `None` if it is not a heartbeat
pub fn parse_beat(datagram: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(BEAT_PREFIX), Some(addr), None) => Some(addr),
        _ => None,
    }
}

/// Watch a stream of peer beats and emit one silence signal per missed deadline.
///
/// Returns when either channel closes.
pub async fn watch(
    mut beats: mpsc::Receiver<()>,
    deadline: Duration,
    silence: mpsc::UnboundedSender<()>,
) {
    let mut expires: Option<Instant> = None;

    loop {
        let wake = expires.unwrap_or_else(|| Instant::now() + deadline);
        tokio::select! {
            beat = beats.recv() => match beat {
                Some(()) => expires = Some(Instant::now() + deadline),
                None => return,
            },
            _ = sleep_until(wake), if expires.is_some() => {
                expires = None;
                warn!(deadline_ms = deadline.as_millis() as u64, "Peer heartbeat missed");
                if silence.send(()).is_err() {
                    return;
                }
            }
        }
    }
}

/// Running broadcaster, listener and watchdog; stopped on drop
pub struct HeartbeatMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Join the group and start beating as `self_addr`.
    ///
    /// The receiver yields one item each time the peer falls silent.
    pub fn start(
        config: &HeartbeatConfig,
        self_addr: String,
    ) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let socket = Arc::new(bind_group(config)?);
        let (beat_tx, beat_rx) = mpsc::channel(16);
        let (silence_tx, silence_rx) = mpsc::unbounded_channel();

        let broadcaster = tokio::spawn(broadcast(
            socket.clone(),
            config.group,
            config.interval,
            encode_beat(&self_addr),
        ));
        let listener = tokio::spawn(listen(socket, self_addr.clone(), beat_tx));
        let watchdog = tokio::spawn(watch(beat_rx, config.deadline, silence_tx));

        info!(
            group = %config.group,
            addr = %self_addr,
            interval_ms = config.interval.as_millis() as u64,
            "Heartbeat started"
        );
        Ok((
            Self {
                tasks: vec![broadcaster, listener, watchdog],
            },
            silence_rx,
        ))
    }

    /// Stop all heartbeat tasks
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn broadcast(socket: Arc<UdpSocket>, group: SocketAddrV4, every: Duration, beat: Vec<u8>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&beat, group).await {
            debug!(error = %e, "Heartbeat send failed");
        }
    }
}

async fn listen(socket: Arc<UdpSocket>, self_addr: String, beats: mpsc::Sender<()>) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _)) => n,
            Err(e) => {
                warn!(error = %e, "Heartbeat receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        match parse_beat(&buf[..n]) {
            Some(addr) if addr == self_addr => {}
            Some(addr) => {
                debug!(peer = addr, "Peer heartbeat");
                if beats.send(()).await.is_err() {
                    return;
                }
            }
            None => debug!(bytes = n, "Ignoring foreign datagram"),
        }
    }
}

/// Bind the group port with address/port reuse so both nodes can share a host
fn bind_group(config: &HeartbeatConfig) -> Result<UdpSocket> {
    let sock_err = |what: &str, e: nix::Error| Error::heartbeat(format!("{}: {}", what, e));

    let fd = nix::sys::socket::socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(|e| sock_err("socket", e))?;
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    // Must precede bind() so a second node on the same host can bind the port
    nix::sys::socket::setsockopt(socket.as_raw_fd(), ReusePort, &true)
        .map_err(|e| sock_err("SO_REUSEPORT", e))?;
    nix::sys::socket::setsockopt(socket.as_raw_fd(), ReuseAddr, &true)
        .map_err(|e| sock_err("SO_REUSEADDR", e))?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port()));
    nix::sys::socket::bind(
        socket.as_raw_fd(),
        &SockAddr::Inet(InetAddr::from_std(&bind_addr)),
    )
    .map_err(|e| sock_err("bind", e))?;

    socket
        .join_multicast_v4(config.group.ip(), &config.interface)
        .map_err(|e| Error::heartbeat(format!("join {}: {}", config.group, e)))?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket)?)
}
