//! The logical device a user sees: one identity, any number of links.
//!
//! A [`LogicalPeer`] aggregates the live links to one device id, reconciles
//! pairing status across them, and owns the FIFO queue of sends that could
//! not be delivered yet. Superseded links linger until their streams close
//! so in-flight payload channels can drain.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::message::{DeviceType, WireMessage};
use crate::network::link::{
    InboundMessage, LinkContext, LinkObserver, LinkState, OutboundMessage, PeerLink,
    ReclaimedSend, RejectReason, SendCompletion,
};
use crate::network::pairing::{PairingError, PairingState};

/// Registry-facing events. Held as a weak reference by the peer.
pub trait PeerObserver: Send + Sync {
    /// Edge-triggered: the peer gained its first link or lost its last.
    fn peer_reachability_changed(&self, peer: &Arc<LogicalPeer>, reachable: bool);
    fn peer_pairing_changed(&self, peer: &Arc<LogicalPeer>, state: PairingState);
    fn peer_pairing_request(&self, peer: &Arc<LogicalPeer>);
    fn peer_pairing_failed(&self, peer: &Arc<LogicalPeer>, error: PairingError);
    fn peer_message(&self, peer: &Arc<LogicalPeer>, link: &Arc<PeerLink>, message: InboundMessage);
}

#[derive(Debug, Clone, Default)]
pub struct PeerProfile {
    pub name: String,
    pub device_type: DeviceType,
    pub incoming_capabilities: HashSet<String>,
    pub outgoing_capabilities: HashSet<String>,
}

pub struct LogicalPeer {
    device_id: String,
    ctx: Arc<LinkContext>,
    self_ref: Weak<LogicalPeer>,
    profile: Mutex<PeerProfile>,
    links: Mutex<Vec<Arc<PeerLink>>>,
    lingering: Mutex<Vec<Arc<PeerLink>>>,
    pending: Mutex<VecDeque<(OutboundMessage, Option<SendCompletion>)>>,
    observer: Mutex<Weak<dyn PeerObserver>>,
    reported_reachable: AtomicBool,
    reported_pairing: Mutex<PairingState>,
}

impl LogicalPeer {
    pub fn new(device_id: impl Into<String>, ctx: Arc<LinkContext>) -> Arc<Self> {
        let device_id = device_id.into();
        let record = ctx.peers.record(&device_id);
        let profile = PeerProfile {
            name: record.name.clone(),
            device_type: DeviceType::parse(&record.device_type),
            ..Default::default()
        };
        let initial = if record.paired { PairingState::Paired } else { PairingState::Unpaired };
        Arc::new_cyclic(|self_ref| Self {
            device_id,
            ctx,
            self_ref: self_ref.clone(),
            profile: Mutex::new(profile),
            links: Mutex::new(Vec::new()),
            lingering: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            observer: Mutex::new(Weak::<NullPeerObserver>::new()),
            reported_reachable: AtomicBool::new(false),
            reported_pairing: Mutex::new(initial),
        })
    }

    fn strong(&self) -> Option<Arc<LogicalPeer>> {
        self.self_ref.upgrade()
    }

    pub fn set_observer(&self, observer: Weak<dyn PeerObserver>) {
        *self.observer.lock() = observer;
    }

    fn observer(&self) -> Option<Arc<dyn PeerObserver>> {
        self.observer.lock().upgrade()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn profile(&self) -> PeerProfile {
        self.profile.lock().clone()
    }

    pub fn is_reachable(&self) -> bool {
        !self.links.lock().is_empty()
    }

    pub fn active_links(&self) -> usize {
        self.links.lock().len()
    }

    pub fn lingering_links(&self) -> usize {
        self.lingering.lock().len()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.lock().len()
    }

    /// Reconciled pairing status: the strongest state over the active
    /// links, or the persisted flag when no link is up.
    pub fn pairing_state(&self) -> PairingState {
        let links = self.links.lock();
        if links.is_empty() {
            return if self.ctx.peers.is_paired(&self.device_id) {
                PairingState::Paired
            } else {
                PairingState::Unpaired
            };
        }
        links
            .iter()
            .map(|l| l.pairing_state())
            .max_by_key(|s| s.rank())
            .unwrap_or(PairingState::Unpaired)
    }

    pub fn is_paired(&self) -> bool {
        self.pairing_state() == PairingState::Paired
    }

    /// Adopt a freshly established link. A previous link to the same
    /// device is superseded: it drains its queue and lingers until its
    /// payload channels close.
    pub fn attach_link(self: &Arc<Self>, link: Arc<PeerLink>) {
        {
            let identity = link.identity();
            let mut profile = self.profile.lock();
            profile.name = identity.device_name.clone();
            profile.device_type = identity.device_type;
            profile.incoming_capabilities = identity.incoming_capabilities.clone();
            profile.outgoing_capabilities = identity.outgoing_capabilities.clone();
        }

        let superseded: Vec<Arc<PeerLink>> = {
            let mut links = self.links.lock();
            let old = std::mem::take(&mut *links);
            links.push(Arc::clone(&link));
            old
        };
        for old in superseded {
            debug!("Superseding link to {} at {}", self.device_id, old.peer_addr());
            self.lingering.lock().push(Arc::clone(&old));
            old.close_after_writing();
        }

        let weak = Arc::downgrade(self);
        link.set_observer(weak);
        link.start();
        self.report_edges();
    }

    /// Queue or deliver a message. Delivery requires a paired open link;
    /// anything that cannot go out right now waits in FIFO order.
    pub fn send(self: &Arc<Self>, outbound: OutboundMessage, completion: Option<SendCompletion>) {
        self.pending.lock().push_back((outbound, completion));
        self.flush_pending();
    }

    fn sendable_link(&self) -> Option<Arc<PeerLink>> {
        self.links
            .lock()
            .iter()
            .find(|l| l.state() == LinkState::Open && l.pairing_state() == PairingState::Paired)
            .cloned()
    }

    fn flush_pending(self: &Arc<Self>) {
        loop {
            let Some(link) = self.sendable_link() else { return };
            let Some((outbound, completion)) = self.pending.lock().pop_front() else { return };
            match link.send(outbound, completion) {
                Ok(()) => {}
                Err(rejected) => {
                    let requeue = (rejected.outbound, rejected.completion);
                    match rejected.reason {
                        // The capacity watcher retries these.
                        RejectReason::Busy => {
                            self.pending.lock().push_front(requeue);
                            return;
                        }
                        RejectReason::NotOpen | RejectReason::DuplicateId => {
                            self.pending.lock().push_front(requeue);
                            return;
                        }
                    }
                }
            }
        }
    }

    // Local pairing API, delegated to the best link.

    fn preferred_link(&self) -> Option<Arc<PeerLink>> {
        let links = self.links.lock();
        links
            .iter()
            .filter(|l| l.state() == LinkState::Open)
            .max_by_key(|l| l.pairing_state().rank())
            .cloned()
    }

    pub fn request_pairing(&self) {
        if let Some(link) = self.preferred_link() {
            link.request_pairing();
        }
    }

    pub fn accept_pairing(&self) {
        if let Some(link) = self.preferred_link() {
            link.accept_pairing();
        }
    }

    pub fn decline_pairing(&self) {
        if let Some(link) = self.preferred_link() {
            link.decline_pairing();
        }
    }

    /// Unpair, reachable or not. Without a link the persisted state is
    /// cleared directly.
    pub fn unpair(self: &Arc<Self>) {
        match self.preferred_link() {
            Some(link) => link.unpair(),
            None => {
                if let Err(e) = self.ctx.trust.unpin(&self.device_id) {
                    tracing::warn!("Failed to unpin certificate for {}: {}", self.device_id, e);
                }
                self.ctx.peers.set_paired(&self.device_id, false, None);
                self.report_edges();
            }
        }
    }

    /// Nudge the peer over every link; services ignore these. Sent
    /// automatically when the peer first becomes reachable.
    pub fn send_keepalive(&self) {
        for link in self.links.lock().iter() {
            let _ = link.send(OutboundMessage::plain(WireMessage::keepalive()), None);
        }
    }

    pub fn close_all_links(&self) {
        for link in self.links.lock().iter() {
            link.close();
        }
        for link in self.lingering.lock().iter() {
            link.close();
        }
    }

    /// Report reachability and pairing edges exactly once per change, and
    /// push the reconciled pairing status back down to every link.
    fn report_edges(self: &Arc<Self>) {
        let reachable = self.is_reachable();
        if self.reported_reachable.swap(reachable, Ordering::AcqRel) != reachable {
            info!("Peer {} is now {}", self.device_id, if reachable { "reachable" } else { "unreachable" });
            if reachable {
                self.send_keepalive();
            }
            if let Some(observer) = self.observer() {
                observer.peer_reachability_changed(self, reachable);
            }
        }

        let pairing = self.pairing_state();
        if matches!(pairing, PairingState::Paired | PairingState::Unpaired) {
            let links: Vec<Arc<PeerLink>> = self.links.lock().clone();
            for link in &links {
                link.reconcile_pairing(pairing);
            }
        }
        let changed = {
            let mut reported = self.reported_pairing.lock();
            if *reported != pairing {
                *reported = pairing;
                true
            } else {
                false
            }
        };
        if changed {
            if let Some(observer) = self.observer() {
                observer.peer_pairing_changed(self, pairing);
            }
        }
    }

    fn drop_link(&self, link: &Arc<PeerLink>) {
        self.links.lock().retain(|l| !Arc::ptr_eq(l, link));
        self.lingering.lock().retain(|l| !Arc::ptr_eq(l, link));
    }
}

impl LinkObserver for LogicalPeer {
    fn link_opened(&self, _link: &Arc<PeerLink>) {
        if let Some(peer) = self.strong() {
            peer.flush_pending();
        }
    }

    fn link_closed(&self, link: &Arc<PeerLink>, reclaimed: Vec<ReclaimedSend>) {
        self.drop_link(link);
        if !reclaimed.is_empty() {
            debug!(
                "Reclaimed {} unsent messages from link to {}",
                reclaimed.len(),
                self.device_id
            );
            let mut pending = self.pending.lock();
            // Reclaimed sends go to the front, oldest first.
            for send in reclaimed.into_iter().rev() {
                let (outbound, completion) = send.into_outbound();
                pending.push_front((outbound, completion));
            }
        }
        if let Some(peer) = self.strong() {
            peer.report_edges();
            peer.flush_pending();
        }
    }

    fn link_received(&self, link: &Arc<PeerLink>, message: InboundMessage) {
        let Some(peer) = self.strong() else { return };
        if let Some(observer) = self.observer() {
            observer.peer_message(&peer, link, message);
        }
    }

    fn capacity_changed(&self, _link: &Arc<PeerLink>) {
        if let Some(peer) = self.strong() {
            peer.flush_pending();
        }
    }

    fn pairing_request(&self, _link: &Arc<PeerLink>) {
        let Some(peer) = self.strong() else { return };
        if let Some(observer) = self.observer() {
            observer.peer_pairing_request(&peer);
        }
    }

    fn pairing_failed(&self, _link: &Arc<PeerLink>, error: PairingError) {
        let Some(peer) = self.strong() else { return };
        if let Some(observer) = self.observer() {
            observer.peer_pairing_failed(&peer, error);
        }
    }

    fn pairing_changed(&self, _link: &Arc<PeerLink>, _state: PairingState) {
        if let Some(peer) = self.strong() {
            peer.report_edges();
            peer.flush_pending();
        }
    }
}

struct NullPeerObserver;

impl PeerObserver for NullPeerObserver {
    fn peer_reachability_changed(&self, _peer: &Arc<LogicalPeer>, _reachable: bool) {}
    fn peer_pairing_changed(&self, _peer: &Arc<LogicalPeer>, _state: PairingState) {}
    fn peer_pairing_request(&self, _peer: &Arc<LogicalPeer>) {}
    fn peer_pairing_failed(&self, _peer: &Arc<LogicalPeer>, _error: PairingError) {}
    fn peer_message(&self, _peer: &Arc<LogicalPeer>, _link: &Arc<PeerLink>, _message: InboundMessage) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnownPeers;
    use crate::message::{Identity, KEEPALIVE_TYPE};
    use crate::network::port_pool::PortPool;
    use crate::network::tls::{LinkStream, TlsStack};
    use crate::truststore::{MemoryTrustStore, TrustStore};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn test_ctx() -> Arc<LinkContext> {
        let trust = Arc::new(MemoryTrustStore::new("host"));
        let tls = Arc::new(TlsStack::new(trust.host_identity().unwrap()));
        Arc::new(LinkContext {
            trust,
            tls,
            pool: PortPool::new(42450..=42451),
            peers: Arc::new(KnownPeers::ephemeral()),
            pairing_timeout: Duration::from_millis(200),
            payload_timeout: Duration::from_secs(5),
        })
    }

    fn test_identity(id: &str) -> Identity {
        Identity {
            device_id: id.to_string(),
            device_name: format!("device-{id}"),
            device_type: DeviceType::Phone,
            protocol_version: crate::message::PROTOCOL_VERSION,
            tcp_port: None,
            incoming_capabilities: HashSet::new(),
            outgoing_capabilities: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn fresh_reachability_sends_a_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let connected = connect.await.unwrap();

        let ctx = test_ctx();
        let link = PeerLink::new(
            Arc::clone(&ctx),
            LinkStream::Plain(connected),
            test_identity("p1"),
        )
        .unwrap();
        let peer = LogicalPeer::new("p1", ctx);
        peer.attach_link(link);

        let mut reader = BufReader::new(accepted);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let message = WireMessage::decode(line.trim_end()).unwrap();
        assert_eq!(message.ty, KEEPALIVE_TYPE);
    }
}
