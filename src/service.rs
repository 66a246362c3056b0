//! Collaborator contract for message-level functionality.
//!
//! Services declare the message types they consume and produce; the registry
//! announces the union of those in the host identity and routes inbound
//! messages to services by capability. Everything below this trait (links,
//! pairing, payload channels) is transport plumbing the services never see.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::message::{Body, WireMessage, PING_TYPE};
use crate::network::link::{InboundMessage, OutboundMessage, PeerLink};
use crate::peer::LogicalPeer;

#[async_trait]
pub trait Service: Send + Sync {
    fn id(&self) -> &'static str;

    /// Message types this service consumes.
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Message types this service may send.
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Handle one inbound message. Return `true` when consumed; the
    /// registry stops routing it further. The download handle, if any, can
    /// be taken out of the message.
    async fn handle_message(
        &self,
        peer: &Arc<LogicalPeer>,
        link: &Arc<PeerLink>,
        message: &mut InboundMessage,
    ) -> bool;

    /// The peer became reachable and paired.
    fn setup(&self, _peer: &Arc<LogicalPeer>) {}

    /// The peer unpaired or lost its last link.
    fn cleanup(&self, _peer: &Arc<LogicalPeer>) {}
}

/// Smallest possible service: answers pings and can emit one.
pub struct PingService;

impl PingService {
    pub fn send_ping(peer: &Arc<LogicalPeer>) {
        let message = WireMessage::new(PING_TYPE, Body::new());
        peer.send(OutboundMessage::plain(message), None);
    }
}

#[async_trait]
impl Service for PingService {
    fn id(&self) -> &'static str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING_TYPE.to_string()]
    }

    async fn handle_message(
        &self,
        peer: &Arc<LogicalPeer>,
        _link: &Arc<PeerLink>,
        message: &mut InboundMessage,
    ) -> bool {
        if message.message.ty != PING_TYPE {
            return false;
        }
        let text = message
            .message
            .body_str("message")
            .map(str::to_string)
            .unwrap_or_else(|_| "Ping!".to_string());
        info!("Ping from {}: {}", peer.profile().name, text);
        true
    }
}
