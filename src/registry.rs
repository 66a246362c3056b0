//! The device registry: every peer this host knows about, live or not.
//!
//! The registry claims a [`LogicalPeer`] for each established link, refuses
//! connections carrying our own device id, seeds placeholder peers for
//! paired devices from the persisted store, and routes service lifecycle
//! (setup exactly once per reachable-and-paired edge, cleanup on the way
//! down) plus inbound message dispatch by capability.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::discovery::{Discovery, DiscoveryDelegate};
use crate::network::link::{InboundMessage, LinkContext, PeerLink};
use crate::network::pairing::{PairingError, PairingState};
use crate::peer::{LogicalPeer, PeerObserver, PeerProfile};
use crate::service::Service;

/// How long an unpaired peer may sit without links before eviction.
const EVICTION_GRACE: Duration = Duration::from_secs(60);

pub struct DeviceRegistry {
    config: Config,
    ctx: Arc<LinkContext>,
    services: Vec<Arc<dyn Service>>,
    peers: DashMap<String, Arc<LogicalPeer>>,
    /// Devices whose services are currently set up.
    active: DashSet<String>,
    /// Asked to re-announce when a peer drops off the network.
    announcer: Mutex<Weak<Discovery>>,
    self_ref: Weak<DeviceRegistry>,
    cancel: CancellationToken,
}

impl DeviceRegistry {
    pub fn new(
        config: Config,
        ctx: Arc<LinkContext>,
        services: Vec<Arc<dyn Service>>,
    ) -> Arc<Self> {
        let registry = Arc::new_cyclic(|self_ref| Self {
            config,
            ctx,
            services,
            peers: DashMap::new(),
            active: DashSet::new(),
            announcer: Mutex::new(Weak::new()),
            self_ref: self_ref.clone(),
            cancel: CancellationToken::new(),
        });
        registry.seed_known_peers();
        registry
    }

    /// Paired devices from the persisted store appear as unreachable peers
    /// right away, so they are listable and unpairable before any link.
    fn seed_known_peers(self: &Arc<Self>) {
        for (device_id, record) in self.ctx.peers.paired_peers() {
            debug!("Seeding known peer {} ({})", record.name, device_id);
            self.claim_peer(&device_id);
        }
    }

    fn claim_peer(self: &Arc<Self>, device_id: &str) -> Arc<LogicalPeer> {
        self.peers
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let peer = LogicalPeer::new(device_id, Arc::clone(&self.ctx));
                let weak = Arc::downgrade(self);
                peer.set_observer(weak);
                peer
            })
            .clone()
    }

    pub fn set_announcer(&self, discovery: Weak<Discovery>) {
        *self.announcer.lock() = discovery;
    }

    pub fn peer(&self, device_id: &str) -> Option<Arc<LogicalPeer>> {
        self.peers.get(device_id).map(|p| p.clone())
    }

    pub fn all_peers(&self) -> Vec<Arc<LogicalPeer>> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    pub fn paired_peers(&self) -> Vec<Arc<LogicalPeer>> {
        self.peers
            .iter()
            .filter(|p| p.is_paired())
            .map(|p| p.clone())
            .collect()
    }

    pub fn unpaired_reachable_peers(&self) -> Vec<Arc<LogicalPeer>> {
        self.peers
            .iter()
            .filter(|p| !p.is_paired() && p.is_reachable())
            .map(|p| p.clone())
            .collect()
    }

    /// Paired in the persisted store but currently without any link.
    pub fn unreachable_peers(&self) -> Vec<Arc<LogicalPeer>> {
        self.peers
            .iter()
            .filter(|p| p.is_paired() && !p.is_reachable())
            .map(|p| p.clone())
            .collect()
    }

    /// Capability union across services, announced in the host identity.
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> =
            self.services.iter().flat_map(|s| s.incoming_capabilities()).collect();
        caps.sort();
        caps.dedup();
        caps
    }

    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> =
            self.services.iter().flat_map(|s| s.outgoing_capabilities()).collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Services relevant to a peer: any capability overlap in either
    /// direction.
    fn applicable_services(&self, profile: &PeerProfile) -> Vec<Arc<dyn Service>> {
        self.services
            .iter()
            .filter(|s| {
                s.incoming_capabilities()
                    .iter()
                    .any(|c| profile.outgoing_capabilities.contains(c))
                    || s.outgoing_capabilities()
                        .iter()
                        .any(|c| profile.incoming_capabilities.contains(c))
            })
            .cloned()
            .collect()
    }

    fn sync_services(&self, peer: &Arc<LogicalPeer>) {
        let should_be_active = peer.is_reachable() && peer.is_paired();
        let device_id = peer.device_id().to_string();
        if should_be_active {
            if self.active.insert(device_id) {
                info!("Activating services for {}", peer.profile().name);
                for service in self.applicable_services(&peer.profile()) {
                    service.setup(peer);
                }
            }
        } else if self.active.remove(&device_id).is_some() {
            info!("Deactivating services for {}", peer.profile().name);
            for service in self.applicable_services(&peer.profile()) {
                service.cleanup(peer);
            }
        }
    }

    fn schedule_eviction(self: &Arc<Self>, device_id: &str) {
        let registry = Arc::clone(self);
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = registry.cancel.cancelled() => return,
                _ = tokio::time::sleep(EVICTION_GRACE) => {}
            }
            let evict = registry
                .peer(&device_id)
                .map(|p| !p.is_reachable() && !p.is_paired())
                .unwrap_or(false);
            if evict {
                debug!("Evicting idle unpaired peer {}", device_id);
                registry.peers.remove(&device_id);
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        for peer in self.all_peers() {
            peer.close_all_links();
        }
    }
}

impl DiscoveryDelegate for DeviceRegistry {
    fn link_established(&self, link: Arc<PeerLink>) {
        let Some(registry) = self.self_ref.upgrade() else { return };
        let device_id = link.device_id().to_string();
        if device_id == registry.config.device.id {
            warn!("Refusing link carrying our own device id");
            link.close();
            return;
        }
        let peer = registry.claim_peer(&device_id);
        peer.attach_link(link);
    }

    fn should_connect(&self, device_id: &str) -> bool {
        if device_id == self.config.device.id {
            return false;
        }
        // A device with a live link does not need a second one; its own
        // re-announcements are handled by superseding on the inbound path.
        !self.peer(device_id).map(|p| p.is_reachable()).unwrap_or(false)
    }
}

impl PeerObserver for DeviceRegistry {
    fn peer_reachability_changed(&self, peer: &Arc<LogicalPeer>, reachable: bool) {
        self.sync_services(peer);
        if !reachable {
            // Losing a peer is the cue to go looking for it again.
            if let Some(discovery) = self.announcer.lock().upgrade() {
                discovery.announce();
            }
            if let Some(registry) = self.self_ref.upgrade() {
                registry.schedule_eviction(peer.device_id());
            }
        }
    }

    fn peer_pairing_changed(&self, peer: &Arc<LogicalPeer>, state: PairingState) {
        info!("Peer {} pairing state: {:?}", peer.profile().name, state);
        self.sync_services(peer);
    }

    fn peer_pairing_request(&self, peer: &Arc<LogicalPeer>) {
        info!(
            "Pairing requested by {} ({}); accept or decline via the peer API",
            peer.profile().name,
            peer.device_id()
        );
    }

    fn peer_pairing_failed(&self, peer: &Arc<LogicalPeer>, error: PairingError) {
        warn!("Pairing with {} failed: {}", peer.profile().name, error);
    }

    fn peer_message(&self, peer: &Arc<LogicalPeer>, link: &Arc<PeerLink>, message: InboundMessage) {
        let Some(registry) = self.self_ref.upgrade() else { return };
        let peer = Arc::clone(peer);
        let link = Arc::clone(link);
        tokio::spawn(async move {
            let mut message = message;
            for service in registry.services.iter() {
                if !service
                    .incoming_capabilities()
                    .contains(&message.message.ty)
                {
                    continue;
                }
                if service.handle_message(&peer, &link, &mut message).await {
                    return;
                }
            }
            debug!(
                "No service consumed {} from {}",
                message.message.ty,
                peer.device_id()
            );
        });
    }
}
