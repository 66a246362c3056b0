//! One live connection to a peer device.
//!
//! A link owns a secured stream, the pairing engine for that stream, and an
//! ordered queue of outbound messages drained by a single writer task. The
//! read loop parses one newline frame at a time; malformed frames are
//! counted and dropped without killing the link. Everything above (the
//! logical peer, the registry) hears about the link through [`LinkObserver`],
//! held as a weak reference so links never keep their owners alive.

use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KnownPeers;
use crate::message::{Body, Identity, WireMessage, IDENTITY_TYPE, KEEPALIVE_TYPE, MAX_FRAME_LEN};
use crate::network::pairing::{PairingAction, PairingEngine, PairingError, PairingState};
use crate::network::payload::{PayloadDownload, PayloadError, PayloadSource, PayloadUpload, UploadHandle};
use crate::network::port_pool::{PortPool, PortPoolError};
use crate::network::tls::{LinkStream, TlsStack};
use crate::truststore::{fingerprint, TrustStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Initializing,
    Open,
    Closed,
}

/// Shared dependencies handed to every link.
pub struct LinkContext {
    pub trust: Arc<dyn TrustStore>,
    pub tls: Arc<TlsStack>,
    pub pool: PortPool,
    pub peers: Arc<KnownPeers>,
    pub pairing_timeout: Duration,
    /// How long a payload upload listens for its receiver.
    pub payload_timeout: Duration,
}

/// Fires exactly once per accepted send: `(control_ok, payload_ok)`.
/// `payload_ok` is true only when a payload existed and transferred
/// completely; messages without payload report `payload_ok = false`.
pub type SendCompletion = Box<dyn FnOnce(bool, bool) + Send + 'static>;

pub struct OutboundMessage {
    pub message: WireMessage,
    pub payload: Option<(PayloadSource, Option<u64>)>,
}

impl OutboundMessage {
    pub fn plain(message: WireMessage) -> Self {
        Self { message, payload: None }
    }

    pub fn with_payload(message: WireMessage, source: PayloadSource, size: Option<u64>) -> Self {
        Self { message, payload: Some((source, size)) }
    }
}

/// An inbound message, with the payload retrieval handle attached when the
/// sender advertised one.
pub struct InboundMessage {
    pub message: WireMessage,
    pub download: Option<PayloadDownload>,
}

/// Why a send was not accepted. The message and completion come back to
/// the caller untouched for requeueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Link is not (or no longer) open.
    NotOpen,
    /// A message with the same id is already queued.
    DuplicateId,
    /// All payload ports are reserved; retry after `capacity_changed`.
    Busy,
}

pub struct RejectedSend {
    pub outbound: OutboundMessage,
    pub completion: Option<SendCompletion>,
    pub reason: RejectReason,
}

/// A send taken back from a closing link, ready to re-submit elsewhere.
pub struct ReclaimedSend {
    pub message: WireMessage,
    pub payload: Option<(PayloadSource, Option<u64>)>,
    pub completion: Option<SendCompletion>,
}

impl ReclaimedSend {
    pub fn into_outbound(self) -> (OutboundMessage, Option<SendCompletion>) {
        (
            OutboundMessage { message: self.message, payload: self.payload },
            self.completion,
        )
    }
}

#[allow(unused_variables)]
pub trait LinkObserver: Send + Sync {
    fn link_opened(&self, link: &Arc<PeerLink>);
    fn link_closed(&self, link: &Arc<PeerLink>, reclaimed: Vec<ReclaimedSend>);
    fn link_received(&self, link: &Arc<PeerLink>, message: InboundMessage);
    fn link_sent(&self, link: &Arc<PeerLink>, message: &WireMessage) {}
    /// A payload port was released; queued payload sends may retry now.
    fn capacity_changed(&self, link: &Arc<PeerLink>) {}
    fn pairing_request(&self, link: &Arc<PeerLink>);
    fn pairing_failed(&self, link: &Arc<PeerLink>, error: PairingError);
    fn pairing_changed(&self, link: &Arc<PeerLink>, state: PairingState);
}

struct PayloadProgress {
    control_written: bool,
    payload_done: Option<bool>,
    completion: Option<SendCompletion>,
}

impl PayloadProgress {
    fn maybe_fire(&mut self) {
        if self.control_written {
            if let Some(ok) = self.payload_done {
                if let Some(completion) = self.completion.take() {
                    completion(true, ok);
                }
            }
        }
    }
}

struct PayloadEntry {
    handle: UploadHandle,
    declared_size: Option<u64>,
    progress: Arc<Mutex<PayloadProgress>>,
}

struct QueueEntry {
    message: WireMessage,
    line: Arc<Vec<u8>>,
    completion: Option<SendCompletion>,
    payload: Option<PayloadEntry>,
}

pub struct PeerLink {
    ctx: Arc<LinkContext>,
    identity: Identity,
    peer_addr: SocketAddr,
    encrypted: bool,
    peer_cert: Option<CertificateDer<'static>>,
    state: Mutex<LinkState>,
    io: Mutex<Option<LinkStream>>,
    observer: Mutex<Weak<dyn LinkObserver>>,
    pairing: Mutex<PairingEngine>,
    queue: Mutex<VecDeque<QueueEntry>>,
    write_wake: Notify,
    close_after_write: AtomicBool,
    cancel: CancellationToken,
    malformed_frames: AtomicU64,
}

impl PeerLink {
    /// Wrap an already-secured stream whose identity handshake completed.
    pub fn new(
        ctx: Arc<LinkContext>,
        stream: LinkStream,
        identity: Identity,
    ) -> std::io::Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let peer_cert = stream.peer_certificate();
        let encrypted = stream.is_encrypted();

        ctx.peers
            .update_identity(&identity.device_id, &identity.device_name, identity.device_type);
        // A paired peer only gets here after the pinned-certificate
        // handshake succeeded, so the stored pairing carries over.
        let initial = if ctx.peers.is_paired(&identity.device_id) && peer_cert.is_some() {
            ctx.peers.remember_address(&identity.device_id, peer_addr);
            PairingState::Paired
        } else {
            PairingState::Unpaired
        };

        Ok(Arc::new(Self {
            ctx,
            identity,
            peer_addr,
            encrypted,
            peer_cert,
            state: Mutex::new(LinkState::Initializing),
            io: Mutex::new(Some(stream)),
            observer: Mutex::new(Weak::<NullObserver>::new()),
            pairing: Mutex::new(PairingEngine::new(initial)),
            queue: Mutex::new(VecDeque::new()),
            write_wake: Notify::new(),
            close_after_write: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            malformed_frames: AtomicU64::new(0),
        }))
    }

    pub fn set_observer(&self, observer: Weak<dyn LinkObserver>) {
        *self.observer.lock() = observer;
    }

    fn observer(&self) -> Option<Arc<dyn LinkObserver>> {
        self.observer.lock().upgrade()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.lock().state()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Spawn the reader, writer and capacity watcher. The observer should
    /// be attached first; events start flowing immediately.
    pub fn start(self: &Arc<Self>) {
        let Some(stream) = self.io.lock().take() else { return };
        {
            let mut state = self.state.lock();
            if *state != LinkState::Initializing {
                return;
            }
            *state = LinkState::Open;
        }
        info!(
            "Link to {} ({}) open, encrypted={}",
            self.identity.device_name, self.peer_addr, self.encrypted
        );
        if let Some(observer) = self.observer() {
            observer.link_opened(self);
        }

        let link = Arc::clone(self);
        let mut released = self.ctx.pool.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => return,
                    received = released.recv() => match received {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Some(observer) = link.observer() {
                                observer.capacity_changed(&link);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let writer = tokio::spawn(write_loop(Arc::clone(&link), write_half));
            read_loop(Arc::clone(&link), read_half).await;
            link.cancel.cancel();
            let _ = writer.await;
            link.finish_close();
        });
    }

    /// Queue a message for sending. A rejected send hands the message and
    /// completion back untouched so the caller can requeue them. An
    /// accepted payload send whose port range is permanently exhausted
    /// completes immediately with `(false, false)`.
    pub fn send(
        self: &Arc<Self>,
        outbound: OutboundMessage,
        completion: Option<SendCompletion>,
    ) -> Result<(), RejectedSend> {
        if self.state() != LinkState::Open {
            return Err(RejectedSend { outbound, completion, reason: RejectReason::NotOpen });
        }
        // One critical section covers the duplicate check and the enqueue,
        // so two racing sends of the same id cannot both pass the check.
        let mut queue = self.queue.lock();
        if queue.iter().any(|e| e.message.id == outbound.message.id) {
            warn!("Rejecting duplicate message id {} on link queue", outbound.message.id);
            return Err(RejectedSend { outbound, completion, reason: RejectReason::DuplicateId });
        }
        let OutboundMessage { mut message, payload } = outbound;
        let mut completion = completion;

        let payload_entry = if let Some((source, size)) = payload {
            let reserved = match self.ctx.pool.reserve() {
                Ok(reserved) => reserved,
                Err(PortPoolError::Busy) => {
                    return Err(RejectedSend {
                        outbound: OutboundMessage { message, payload: Some((source, size)) },
                        completion,
                        reason: RejectReason::Busy,
                    })
                }
                Err(PortPoolError::Exhausted) => {
                    drop(queue);
                    warn!("Payload port range exhausted, failing send {}", message.id);
                    if let Some(completion) = completion.take() {
                        completion(false, false);
                    }
                    return Ok(());
                }
            };
            let mut info = Body::new();
            info.insert("port".into(), Value::from(reserved.port()));
            message.payload_info = Some(info);
            message.payload_size = size.map(|s| s as i64);

            let upload = PayloadUpload::new(reserved, source, size, self.ctx.payload_timeout);
            let handle = upload.handle();
            let progress = Arc::new(Mutex::new(PayloadProgress {
                control_written: false,
                payload_done: None,
                completion: completion.take(),
            }));
            let on_done = {
                let progress = Arc::clone(&progress);
                move |ok: bool| {
                    let mut guard = progress.lock();
                    guard.payload_done = Some(ok);
                    guard.maybe_fire();
                }
            };
            upload.spawn(Arc::clone(&self.ctx.tls), self.pinned_certificate(), on_done);
            Some(PayloadEntry { handle, declared_size: size, progress })
        } else {
            None
        };

        let line = match message.encode() {
            Ok(line) => Arc::new(line),
            Err(e) => {
                drop(queue);
                warn!("Failed to encode message {}: {}", message.id, e);
                if let Some(completion) = completion.take() {
                    completion(false, false);
                }
                return Ok(());
            }
        };

        queue.push_back(QueueEntry {
            message,
            line,
            completion,
            payload: payload_entry,
        });
        drop(queue);
        self.write_wake.notify_one();
        Ok(())
    }

    fn pinned_certificate(&self) -> Option<CertificateDer<'static>> {
        self.ctx.trust.trusted_certificate(&self.identity.device_id)
    }

    /// Retrieve an inbound payload over a fresh connection to the peer.
    pub async fn retrieve_payload<W>(
        &self,
        download: PayloadDownload,
        sink: &mut W,
    ) -> Result<u64, PayloadError>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        download
            .retrieve(&self.ctx.tls, self.pinned_certificate(), sink)
            .await
    }

    /// Abortive close. In-flight payload uploads keep running on their own
    /// tasks; everything unwritten is reclaimed.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Drain the send queue, then close.
    pub fn close_after_writing(&self) {
        self.close_after_write.store(true, Ordering::Release);
        self.write_wake.notify_one();
    }

    fn finish_close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }
        info!("Link to {} ({}) closed", self.identity.device_name, self.peer_addr);
        let reclaimed = self.reclaim_unsent();
        if let Some(observer) = self.observer() {
            observer.link_closed(self, reclaimed);
        }
    }

    /// Everything queued but not yet written, with payload sources taken
    /// back from uploads that no receiver connected to. Uploads that
    /// already started are left to settle on their own tasks.
    fn reclaim_unsent(&self) -> Vec<ReclaimedSend> {
        let mut queue = self.queue.lock();
        let mut reclaimed = Vec::new();
        while let Some(entry) = queue.pop_front() {
            match entry.payload {
                None => reclaimed.push(ReclaimedSend {
                    message: entry.message,
                    payload: None,
                    completion: entry.completion,
                }),
                Some(payload) => {
                    if payload.handle.has_started() {
                        continue;
                    }
                    let source = payload.handle.reclaim_source();
                    let completion = payload.progress.lock().completion.take();
                    reclaimed.push(ReclaimedSend {
                        message: entry.message,
                        payload: source.map(|s| (s, payload.declared_size)),
                        completion,
                    });
                }
            }
        }
        reclaimed
    }

    // Pairing API, delegated to the engine; actions run here.

    pub fn request_pairing(self: &Arc<Self>) {
        let actions = self.pairing.lock().request_pairing(self.peer_cert.is_some());
        self.apply_pairing_actions(actions);
    }

    pub fn accept_pairing(self: &Arc<Self>) {
        let actions = self.pairing.lock().accept_pairing(self.peer_cert.is_some());
        self.apply_pairing_actions(actions);
    }

    pub fn decline_pairing(self: &Arc<Self>) {
        let actions = self.pairing.lock().decline_pairing();
        self.apply_pairing_actions(actions);
    }

    pub fn unpair(self: &Arc<Self>) {
        let actions = self.pairing.lock().unpair();
        self.apply_pairing_actions(actions);
    }

    /// Adopt the pairing status the owning peer reconciled across its
    /// links.
    pub(crate) fn reconcile_pairing(self: &Arc<Self>, status: PairingState) {
        let actions = self.pairing.lock().reconcile(status);
        self.apply_pairing_actions(actions);
    }

    fn apply_pairing_actions(self: &Arc<Self>, actions: Vec<PairingAction>) {
        for action in actions {
            match action {
                PairingAction::SendPair(flag) => {
                    let _ = self.send(OutboundMessage::plain(WireMessage::pair(flag)), None);
                }
                PairingAction::PinCertificate => {
                    let id = self.device_id();
                    if let Some(cert) = &self.peer_cert {
                        if let Err(e) = self.ctx.trust.pin(id, cert) {
                            warn!("Failed to pin certificate for {}: {}", id, e);
                        }
                        self.ctx.peers.set_paired(id, true, Some(fingerprint(cert)));
                        self.ctx.peers.remember_address(id, self.peer_addr);
                    }
                }
                PairingAction::UnpinCertificate => {
                    let id = self.device_id();
                    if let Err(e) = self.ctx.trust.unpin(id) {
                        warn!("Failed to unpin certificate for {}: {}", id, e);
                    }
                    self.ctx.peers.set_paired(id, false, None);
                }
                PairingAction::NotifyRequest => {
                    info!("Pairing requested by {}", self.identity.device_name);
                    if let Some(observer) = self.observer() {
                        observer.pairing_request(self);
                    }
                }
                PairingAction::NotifyFailure(error) => {
                    warn!("Pairing with {} failed: {}", self.identity.device_name, error);
                    if let Some(observer) = self.observer() {
                        observer.pairing_failed(self, error);
                    }
                }
                PairingAction::NotifyStateChanged(state) => {
                    if let Some(observer) = self.observer() {
                        observer.pairing_changed(self, state);
                    }
                }
                PairingAction::StartTimer(generation) => {
                    let link = Arc::clone(self);
                    let timeout = self.ctx.pairing_timeout;
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = link.cancel.cancelled() => {}
                            _ = tokio::time::sleep(timeout) => {
                                let actions = link.pairing.lock().timer_fired(generation);
                                link.apply_pairing_actions(actions);
                            }
                        }
                    });
                }
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: &str) {
        if frame.is_empty() {
            return;
        }
        let message = match WireMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed frame from {}: {}", self.peer_addr, e);
                return;
            }
        };

        if message.ty == IDENTITY_TYPE {
            // Identity is applied once during initialization.
            debug!("Ignoring identity re-announcement from {}", self.device_id());
            return;
        }
        if message.is_pairing() {
            match message.pair_flag() {
                Ok(flag) => {
                    let actions = self
                        .pairing
                        .lock()
                        .handle_pair_message(flag, self.peer_cert.is_some());
                    self.apply_pairing_actions(actions);
                }
                Err(e) => {
                    self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping malformed pair message: {}", e);
                }
            }
            return;
        }
        if message.ty == KEEPALIVE_TYPE {
            debug!("Keepalive from {}", self.device_id());
            return;
        }

        let (allowed, actions) = self.pairing.lock().gate_inbound();
        self.apply_pairing_actions(actions);
        if !allowed {
            debug!("Swallowing {} from unpaired {}", message.ty, self.device_id());
            return;
        }

        let download = match self.build_download(&message) {
            Ok(download) => download,
            Err(()) => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping message {} with invalid payload info", message.id);
                return;
            }
        };
        if let Some(observer) = self.observer() {
            observer.link_received(self, InboundMessage { message, download });
        }
    }

    fn build_download(&self, message: &WireMessage) -> Result<Option<PayloadDownload>, ()> {
        let Some(info) = &message.payload_info else {
            return Ok(None);
        };
        let port = info
            .get("port")
            .and_then(Value::as_i64)
            .filter(|p| (1..=i64::from(u16::MAX)).contains(p))
            .ok_or(())? as u16;
        let size = message.payload_size.map(|s| s as u64);
        Ok(Some(PayloadDownload::new(self.peer_addr.ip(), port, size)))
    }
}

async fn read_loop(link: Arc<PeerLink>, read_half: ReadHalf<LinkStream>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // The frame cap applies while reading, so an endless line cannot
        // buffer unbounded memory.
        let mut limited = (&mut reader).take(MAX_FRAME_LEN as u64 + 1);
        let read = tokio::select! {
            _ = link.cancel.cancelled() => return,
            read = limited.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("Peer {} closed the stream", link.peer_addr);
                return;
            }
            Ok(_) if buf.last() != Some(&b'\n') => {
                if buf.len() > MAX_FRAME_LEN {
                    warn!(
                        "Frame from {} exceeds {} bytes, closing link",
                        link.peer_addr, MAX_FRAME_LEN
                    );
                } else {
                    debug!("Peer {} closed mid-frame", link.peer_addr);
                }
                return;
            }
            Ok(_) => match std::str::from_utf8(&buf) {
                Ok(text) => link.handle_frame(text.trim_end()),
                Err(_) => {
                    link.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping non-UTF-8 frame from {}", link.peer_addr);
                }
            },
            Err(e) => {
                debug!("Read error on link to {}: {}", link.peer_addr, e);
                return;
            }
        }
    }
}

async fn write_loop(link: Arc<PeerLink>, mut write_half: WriteHalf<LinkStream>) {
    loop {
        loop {
            let next = link.queue.lock().front().map(|e| Arc::clone(&e.line));
            let Some(line) = next else { break };
            if let Err(e) = write_half.write_all(&line).await {
                debug!("Write error on link to {}: {}", link.peer_addr, e);
                link.cancel.cancel();
                return;
            }
            if let Err(e) = write_half.flush().await {
                debug!("Flush error on link to {}: {}", link.peer_addr, e);
                link.cancel.cancel();
                return;
            }
            let entry = link.queue.lock().pop_front();
            if let Some(entry) = entry {
                if let Some(observer) = link.observer() {
                    observer.link_sent(&link, &entry.message);
                }
                match entry.payload {
                    None => {
                        if let Some(completion) = entry.completion {
                            completion(true, false);
                        }
                    }
                    Some(payload) => {
                        let mut guard = payload.progress.lock();
                        guard.control_written = true;
                        guard.maybe_fire();
                    }
                }
            }
        }
        if link.close_after_write.load(Ordering::Acquire) && link.queue.lock().is_empty() {
            let _ = write_half.shutdown().await;
            link.cancel.cancel();
            return;
        }
        tokio::select! {
            _ = link.cancel.cancelled() => return,
            _ = link.write_wake.notified() => {}
        }
    }
}

/// Placeholder target for the observer slot before anything attaches.
struct NullObserver;

impl LinkObserver for NullObserver {
    fn link_opened(&self, _link: &Arc<PeerLink>) {}
    fn link_closed(&self, _link: &Arc<PeerLink>, _reclaimed: Vec<ReclaimedSend>) {}
    fn link_received(&self, _link: &Arc<PeerLink>, _message: InboundMessage) {}
    fn pairing_request(&self, _link: &Arc<PeerLink>) {}
    fn pairing_failed(&self, _link: &Arc<PeerLink>, _error: PairingError) {}
    fn pairing_changed(&self, _link: &Arc<PeerLink>, _state: PairingState) {}
}
