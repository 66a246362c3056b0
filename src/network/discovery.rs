//! Peer discovery and link establishment.
//!
//! Discovery is a UDP identity broadcast plus two TCP paths:
//!
//! - Hearing a UDP identity from an unknown device, we connect to its
//!   announced TCP port, send our identity, and upgrade as TLS server.
//! - A device that heard our broadcast connects to our control listener;
//!   we read its identity frame and upgrade as TLS client.
//!
//! Either way the secured stream becomes a [`PeerLink`] handed to the
//! delegate. Broadcasts are rate-limited to one per interval with a deferred
//! timer, and unicast copies go to the remembered addresses of paired peers
//! whose ARP entries may have gone stale.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::message::{Identity, WireMessage, MAX_FRAME_LEN};
use crate::network::link::{LinkContext, PeerLink};
use crate::network::tls::LinkStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDENTITY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Delayed re-announcements after startup; neighbour tables on other hosts
/// warm up late and the first broadcast is often lost.
const SPECULATIVE_ANNOUNCE_DELAYS: [u64; 3] = [40, 80, 120];

/// Receives every link that completes its handshake.
pub trait DiscoveryDelegate: Send + Sync {
    /// Attach an observer and start the link, or drop it to refuse.
    fn link_established(&self, link: Arc<PeerLink>);

    /// Gate connection attempts; used to refuse our own announcements
    /// bounced back and devices that already have a live link.
    fn should_connect(&self, device_id: &str) -> bool;
}

pub struct Discovery {
    config: Config,
    ctx: Arc<LinkContext>,
    incoming_caps: Vec<String>,
    outgoing_caps: Vec<String>,
    delegate: parking_lot::Mutex<Weak<dyn DiscoveryDelegate>>,
    cancel: CancellationToken,
    udp: parking_lot::Mutex<Option<Arc<UdpSocket>>>,
    tcp_port: parking_lot::Mutex<Option<u16>>,
    last_announce: parking_lot::Mutex<Option<Instant>>,
    announce_scheduled: AtomicBool,
}

impl Discovery {
    pub fn new(
        config: Config,
        ctx: Arc<LinkContext>,
        incoming_caps: Vec<String>,
        outgoing_caps: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ctx,
            incoming_caps,
            outgoing_caps,
            delegate: parking_lot::Mutex::new(Weak::<NullDelegate>::new()),
            cancel: CancellationToken::new(),
            udp: parking_lot::Mutex::new(None),
            tcp_port: parking_lot::Mutex::new(None),
            last_announce: parking_lot::Mutex::new(None),
            announce_scheduled: AtomicBool::new(false),
        })
    }

    pub fn set_delegate(&self, delegate: Weak<dyn DiscoveryDelegate>) {
        *self.delegate.lock() = delegate;
    }

    fn delegate(&self) -> Option<Arc<dyn DiscoveryDelegate>> {
        self.delegate.lock().upgrade()
    }

    /// The bound control port, once started.
    pub fn control_port(&self) -> Option<u16> {
        *self.tcp_port.lock()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Our identity as sent in UDP announcements (with the control port).
    fn announced_identity(&self) -> Identity {
        self.config.host_identity(
            self.control_port(),
            self.incoming_caps.iter().cloned(),
            self.outgoing_caps.iter().cloned(),
        )
    }

    /// Our identity as sent over an established TCP stream (no port).
    fn stream_identity(&self) -> Identity {
        self.config.host_identity(
            None,
            self.incoming_caps.iter().cloned(),
            self.outgoing_caps.iter().cloned(),
        )
    }

    /// Bind the sockets and spawn the listen loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        let listener = self.bind_control_listener().await?;
        let port = listener.local_addr()?.port();
        *self.tcp_port.lock() = Some(port);

        let udp = Arc::new(self.bind_udp_socket()?);
        *self.udp.lock() = Some(Arc::clone(&udp));
        info!(
            "Discovery up: control port {}, UDP port {}",
            port, self.config.network.discovery_port
        );

        let discovery = Arc::clone(self);
        tokio::spawn(async move { discovery.accept_loop(listener).await });

        let discovery = Arc::clone(self);
        tokio::spawn(async move { discovery.udp_loop(udp).await });

        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            for delay in SPECULATIVE_ANNOUNCE_DELAYS {
                tokio::select! {
                    _ = discovery.cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => discovery.announce(),
                }
            }
        });

        self.announce();
        Ok(())
    }

    async fn bind_control_listener(&self) -> Result<TcpListener, AppError> {
        let (first, last) = self.config.network.control_ports;
        for port in first..=last {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("Control port {} unavailable: {}", port, e),
            }
        }
        Err(AppError::Network(format!(
            "no control port available in {first}..={last}"
        )))
    }

    fn bind_udp_socket(&self) -> Result<UdpSocket, AppError> {
        let port = self.config.network.discovery_port;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Broadcast our identity, rate-limited to one per configured interval.
    /// A call inside the window schedules one deferred announcement at the
    /// window's end instead of dropping the request.
    pub fn announce(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.network.min_announcement_interval_secs);
        let elapsed = self.last_announce.lock().map(|t| t.elapsed());
        match elapsed {
            Some(elapsed) if elapsed < interval => {
                if !self.announce_scheduled.swap(true, Ordering::AcqRel) {
                    let discovery = Arc::clone(self);
                    let wait = interval - elapsed;
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = discovery.cancel.cancelled() => {}
                            _ = tokio::time::sleep(wait) => {
                                discovery.announce_scheduled.store(false, Ordering::Release);
                                discovery.announce();
                            }
                        }
                    });
                }
            }
            _ => {
                *self.last_announce.lock() = Some(Instant::now());
                let discovery = Arc::clone(self);
                tokio::spawn(async move { discovery.send_announcements().await });
            }
        }
    }

    async fn send_announcements(&self) {
        let Some(udp) = self.udp.lock().clone() else { return };
        let message = match self.announced_identity().to_message().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode identity announcement: {}", e);
                return;
            }
        };

        let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, self.config.network.discovery_port));
        if let Err(e) = udp.send_to(&message, broadcast).await {
            debug!("Broadcast announcement failed: {}", e);
        }
        // Paired peers whose broadcasts we might miss get a direct copy.
        for mut addr in self.ctx.peers.remembered_addresses() {
            addr.set_port(self.config.network.discovery_port);
            if let Err(e) = udp.send_to(&message, addr).await {
                debug!("Unicast announcement to {} failed: {}", addr, e);
            }
        }
        debug!("Announced identity on UDP port {}", self.config.network.discovery_port);
    }

    async fn udp_loop(self: Arc<Self>, udp: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = udp.recv_from(&mut buf) => received,
            };
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    continue;
                }
            };
            let Ok(text) = std::str::from_utf8(&buf[..len]) else { continue };
            let identity = match WireMessage::decode(text.trim_end())
                .map_err(|_| ())
                .and_then(|m| Identity::from_message(&m).map_err(|_| ()))
            {
                Ok(identity) => identity,
                Err(()) => {
                    debug!("Ignoring malformed announcement from {}", from);
                    continue;
                }
            };

            if identity.device_id == self.config.device.id {
                continue;
            }
            let Some(port) = identity.tcp_port else {
                debug!("Announcement from {} lacks a TCP port", identity.device_id);
                continue;
            };
            let proceed = self
                .delegate()
                .map(|d| d.should_connect(&identity.device_id))
                .unwrap_or(false);
            if !proceed {
                continue;
            }

            debug!("Discovered {} at {}", identity.device_name, from);
            let discovery = Arc::clone(&self);
            let target = SocketAddr::new(from.ip(), port);
            tokio::spawn(async move {
                if let Err(e) = discovery.connect_to_peer(target, identity.clone()).await {
                    warn!("Connection to {} ({}) failed: {}", identity.device_name, target, e);
                }
            });
        }
    }

    /// Outbound path: connect, send our identity, upgrade as TLS server.
    async fn connect_to_peer(&self, addr: SocketAddr, identity: Identity) -> Result<(), AppError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| AppError::Network(format!("connect to {addr} timed out")))??;
        enable_keepalive(&stream)?;

        let hello = self.stream_identity().to_message().encode()?;
        let mut stream = stream;
        tokio::io::AsyncWriteExt::write_all(&mut stream, &hello).await?;

        let stream = if identity.supports_tls() {
            let pinned = self.ctx.trust.trusted_certificate(&identity.device_id);
            self.ctx.tls.upgrade_server(stream, pinned).await?
        } else {
            LinkStream::Plain(stream)
        };

        let link = PeerLink::new(Arc::clone(&self.ctx), stream, identity)?;
        if let Some(delegate) = self.delegate() {
            delegate.link_established(link);
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, from) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("Control accept error: {}", e);
                    continue;
                }
            };
            debug!("Inbound control connection from {}", from);
            let discovery = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = discovery.handle_inbound(stream).await {
                    debug!("Inbound handshake from {} failed: {}", from, e);
                }
            });
        }
    }

    /// Inbound path: read one identity frame, upgrade as TLS client.
    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<(), AppError> {
        enable_keepalive(&stream)?;
        let line = tokio::time::timeout(IDENTITY_READ_TIMEOUT, read_frame_unbuffered(&mut stream))
            .await
            .map_err(|_| AppError::Network("identity frame timed out".into()))??;
        let message = WireMessage::decode(line.trim_end())
            .map_err(|e| AppError::Network(format!("bad identity frame: {e}")))?;
        let identity = Identity::from_message(&message)
            .map_err(|e| AppError::Network(format!("bad identity frame: {e}")))?;

        if identity.device_id == self.config.device.id {
            return Err(AppError::Network("connection from own device id".into()));
        }
        let proceed = self
            .delegate()
            .map(|d| d.should_connect(&identity.device_id))
            .unwrap_or(false);
        if !proceed {
            return Ok(());
        }

        let stream = if identity.supports_tls() {
            let pinned = self.ctx.trust.trusted_certificate(&identity.device_id);
            self.ctx.tls.upgrade_client(stream, pinned).await?
        } else {
            LinkStream::Plain(stream)
        };

        let link = PeerLink::new(Arc::clone(&self.ctx), stream, identity)?;
        if let Some(delegate) = self.delegate() {
            delegate.link_established(link);
        }
        Ok(())
    }
}

/// Read exactly one `\n`-terminated frame, one byte at a time. The stream
/// switches to TLS right after this frame, so nothing past the newline may
/// be consumed.
async fn read_frame_unbuffered(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before identity frame",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "identity frame too large",
            ));
        }
    }
    String::from_utf8(line)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame is not UTF-8"))
}

/// TCP keepalive stands in for a protocol-level liveness timeout on the
/// control channel.
pub fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(
        &socket2::TcpKeepalive::new().with_time(Duration::from_secs(10)),
    )
}

struct NullDelegate;

impl DiscoveryDelegate for NullDelegate {
    fn link_established(&self, _link: Arc<PeerLink>) {}
    fn should_connect(&self, _device_id: &str) -> bool {
        false
    }
}
