//! Payload side-channel transfers between two paired hosts.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tetherd::config::KnownPeers;
use tetherd::message::{Body, DeviceType, Identity, WireMessage, PROTOCOL_VERSION};
use tetherd::network::link::{InboundMessage, LinkContext, OutboundMessage, PeerLink};
use tetherd::network::pairing::{PairingError, PairingState};
use tetherd::network::port_pool::PortPool;
use tetherd::network::tls::TlsStack;
use tetherd::peer::{LogicalPeer, PeerObserver};
use tetherd::truststore::{MemoryTrustStore, TrustStore};

const FILE_TYPE: &str = "tether.ping";

struct Host {
    ctx: Arc<LinkContext>,
    device_id: String,
}

fn make_host(device_id: &str, pool: std::ops::RangeInclusive<u16>) -> Host {
    let trust = Arc::new(MemoryTrustStore::new(device_id));
    let tls = Arc::new(TlsStack::new(trust.host_identity().unwrap()));
    Host {
        ctx: Arc::new(LinkContext {
            trust,
            tls,
            pool: PortPool::new(pool),
            peers: Arc::new(KnownPeers::ephemeral()),
            pairing_timeout: Duration::from_secs(5),
            payload_timeout: Duration::from_secs(5),
        }),
        device_id: device_id.to_string(),
    }
}

fn identity_of(host: &Host) -> Identity {
    Identity {
        device_id: host.device_id.clone(),
        device_name: format!("host-{}", host.device_id),
        device_type: DeviceType::Laptop,
        protocol_version: PROTOCOL_VERSION,
        tcp_port: None,
        incoming_capabilities: [FILE_TYPE.to_string()].into_iter().collect::<HashSet<_>>(),
        outgoing_capabilities: [FILE_TYPE.to_string()].into_iter().collect::<HashSet<_>>(),
    }
}

/// Pre-pair both hosts, then build a TLS link pair with pinned certificates.
async fn paired_link_pair(a: &Host, b: &Host) -> (Arc<PeerLink>, Arc<PeerLink>) {
    let cert_a = a.ctx.trust.host_identity().unwrap().cert;
    let cert_b = b.ctx.trust.host_identity().unwrap().cert;
    a.ctx.trust.pin(&b.device_id, &cert_b).unwrap();
    b.ctx.trust.pin(&a.device_id, &cert_a).unwrap();
    a.ctx.peers.set_paired(&b.device_id, true, None);
    b.ctx.peers.set_paired(&a.device_id, true, None);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    let connected = connect.await.unwrap();

    let (stream_a, stream_b) = tokio::join!(
        a.ctx.tls.upgrade_server(connected, Some(cert_b)),
        b.ctx.tls.upgrade_client(accepted, Some(cert_a)),
    );
    let link_a = PeerLink::new(Arc::clone(&a.ctx), stream_a.unwrap(), identity_of(b)).unwrap();
    let link_b = PeerLink::new(Arc::clone(&b.ctx), stream_b.unwrap(), identity_of(a)).unwrap();
    assert_eq!(link_a.pairing_state(), PairingState::Paired);
    assert_eq!(link_b.pairing_state(), PairingState::Paired);
    (link_a, link_b)
}

enum Event {
    Message(Arc<PeerLink>, InboundMessage),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl PeerObserver for Recorder {
    fn peer_reachability_changed(&self, _peer: &Arc<LogicalPeer>, _reachable: bool) {}
    fn peer_pairing_changed(&self, _peer: &Arc<LogicalPeer>, _state: PairingState) {}
    fn peer_pairing_request(&self, _peer: &Arc<LogicalPeer>) {}
    fn peer_pairing_failed(&self, _peer: &Arc<LogicalPeer>, _error: PairingError) {}
    fn peer_message(&self, _peer: &Arc<LogicalPeer>, link: &Arc<PeerLink>, message: InboundMessage) {
        let _ = self.tx.send(Event::Message(Arc::clone(link), message));
    }
}

fn attach(
    host: &Host,
    remote_id: &str,
    link: Arc<PeerLink>,
) -> (Arc<LogicalPeer>, Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder { tx });
    let peer = LogicalPeer::new(remote_id, Arc::clone(&host.ctx));
    let weak = Arc::downgrade(&recorder);
    peer.set_observer(weak);
    peer.attach_link(link);
    (peer, recorder, rx)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn recv_message(rx: &mut mpsc::UnboundedReceiver<Event>) -> (Arc<PeerLink>, InboundMessage) {
    let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("event channel closed");
    let Event::Message(link, inbound) = event;
    (link, inbound)
}

#[tokio::test]
async fn ten_megabyte_payload_arrives_intact() {
    let a = make_host("alpha", 42700..=42703);
    let b = make_host("beta", 42704..=42707);
    let (link_a, link_b) = paired_link_pair(&a, &b).await;
    let (peer_a, _rec_a, _events_a) = attach(&a, "beta", link_a);
    let (_peer_b, _rec_b, mut events_b) = attach(&b, "alpha", link_b);

    let data = patterned(10 * 1024 * 1024);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let message = WireMessage::new(FILE_TYPE, Body::new());
    peer_a.send(
        OutboundMessage::with_payload(
            message,
            Box::new(Cursor::new(data.clone())),
            Some(data.len() as u64),
        ),
        Some(Box::new(move |control, payload| {
            let _ = done_tx.send((control, payload));
        })),
    );

    let (link, inbound) = recv_message(&mut events_b).await;
    assert_eq!(inbound.message.payload_size, Some(data.len() as i64));
    let download = inbound.download.expect("payload metadata missing");
    let mut sink = Vec::with_capacity(data.len());
    let got = link.retrieve_payload(download, &mut sink).await.unwrap();

    assert_eq!(got, data.len() as u64);
    assert_eq!(sink, data);
    assert_eq!(done_rx.recv().await, Some((true, true)));
}

#[tokio::test]
async fn truncated_source_fails_both_ends() {
    let a = make_host("alpha", 42710..=42713);
    let b = make_host("beta", 42714..=42717);
    let (link_a, link_b) = paired_link_pair(&a, &b).await;
    let (peer_a, _rec_a, _events_a) = attach(&a, "beta", link_a);
    let (_peer_b, _rec_b, mut events_b) = attach(&b, "alpha", link_b);

    // The source holds 5 MiB but the message declares 10 MiB.
    let declared = 10 * 1024 * 1024u64;
    let data = patterned(5 * 1024 * 1024);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    peer_a.send(
        OutboundMessage::with_payload(
            WireMessage::new(FILE_TYPE, Body::new()),
            Box::new(Cursor::new(data)),
            Some(declared),
        ),
        Some(Box::new(move |control, payload| {
            let _ = done_tx.send((control, payload));
        })),
    );

    let (link, inbound) = recv_message(&mut events_b).await;
    let download = inbound.download.expect("payload metadata missing");
    let mut sink = Vec::new();
    assert!(link.retrieve_payload(download, &mut sink).await.is_err());
    assert_eq!(done_rx.recv().await, Some((true, false)));
}

#[tokio::test]
async fn busy_pool_defers_send_until_capacity_returns() {
    let a = make_host("alpha", 42720..=42720);
    let b = make_host("beta", 42724..=42727);
    let (link_a, link_b) = paired_link_pair(&a, &b).await;
    let (peer_a, _rec_a, _events_a) = attach(&a, "beta", link_a);
    let (_peer_b, _rec_b, mut events_b) = attach(&b, "alpha", link_b);

    // Occupy the only payload port.
    let blocker = a.ctx.pool.reserve().unwrap();

    let data = patterned(64 * 1024);
    peer_a.send(
        OutboundMessage::with_payload(
            WireMessage::new(FILE_TYPE, Body::new()),
            Box::new(Cursor::new(data.clone())),
            Some(data.len() as u64),
        ),
        None,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer_a.pending_sends(), 1);

    // Freeing the port triggers the capacity watcher and the retry.
    drop(blocker);
    let (link, inbound) = recv_message(&mut events_b).await;
    let download = inbound.download.expect("payload metadata missing");
    let mut sink = Vec::new();
    link.retrieve_payload(download, &mut sink).await.unwrap();
    assert_eq!(sink, data);
    assert_eq!(peer_a.pending_sends(), 0);
}

#[tokio::test]
async fn unknown_size_payload_ends_at_clean_eof() {
    let a = make_host("alpha", 42730..=42733);
    let b = make_host("beta", 42734..=42737);
    let (link_a, link_b) = paired_link_pair(&a, &b).await;
    let (peer_a, _rec_a, _events_a) = attach(&a, "beta", link_a);
    let (_peer_b, _rec_b, mut events_b) = attach(&b, "alpha", link_b);

    let data = patterned(300_000);
    peer_a.send(
        OutboundMessage::with_payload(
            WireMessage::new(FILE_TYPE, Body::new()),
            Box::new(Cursor::new(data.clone())),
            None,
        ),
        None,
    );

    let (link, inbound) = recv_message(&mut events_b).await;
    assert_eq!(inbound.message.payload_size, None);
    let download = inbound.download.expect("payload metadata missing");
    let mut sink = Vec::new();
    let got = link.retrieve_payload(download, &mut sink).await.unwrap();
    assert_eq!(got, data.len() as u64);
    assert_eq!(sink, data);
}
