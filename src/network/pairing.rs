//! Pairing state machine.
//!
//! Pure logic: every input returns the list of [`PairingAction`]s the owning
//! link must carry out (send a pair message, pin or unpin the certificate,
//! raise an event, arm a timeout). Keeping the machine free of I/O makes
//! every transition testable without sockets.
//!
//! Timeouts are generation-stamped. Each state change bumps the generation,
//! and a timer that fires with a stale generation is a no-op, so a request
//! that was answered and re-issued cannot be killed by the earlier timer.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    /// We sent a request and are waiting for the peer's answer.
    RequestedBySelf,
    /// The peer sent a request and is waiting for ours.
    RequestedByPeer,
    Paired,
}

impl PairingState {
    /// Ordering used when a peer reconciles status across several links.
    pub fn rank(self) -> u8 {
        match self {
            PairingState::Paired => 3,
            PairingState::RequestedBySelf => 2,
            PairingState::RequestedByPeer => 1,
            PairingState::Unpaired => 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Pairing request timed out")]
    Timeout,

    #[error("Peer declined the pairing request")]
    Declined,

    #[error("Peer canceled its pairing request")]
    Canceled,

    #[error("No peer certificate available to pin")]
    NoCertificate,

    #[error("Pairing was already requested")]
    AlreadyRequested,

    #[error("Peer is already paired")]
    AlreadyPaired,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PairingAction {
    /// Send a pair message with the given `pair` flag.
    SendPair(bool),
    /// Pin the peer certificate in the trust store.
    PinCertificate,
    UnpinCertificate,
    /// Surface an inbound pairing request for local accept/decline.
    NotifyRequest,
    NotifyFailure(PairingError),
    NotifyStateChanged(PairingState),
    /// Arm the pairing timeout; the stamp must be echoed to `timer_fired`.
    StartTimer(u64),
}

pub struct PairingEngine {
    state: PairingState,
    generation: u64,
}

impl PairingEngine {
    pub fn new(initial: PairingState) -> Self {
        Self { state: initial, generation: 0 }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.state == PairingState::Paired
    }

    fn transition(&mut self, next: PairingState, actions: &mut Vec<PairingAction>) {
        if self.state == next {
            return;
        }
        self.state = next;
        self.generation += 1;
        actions.push(PairingAction::NotifyStateChanged(next));
    }

    /// Enter `Paired` only when a peer certificate exists to bind the
    /// pairing to; otherwise fall back to `Unpaired` and report it.
    fn enter_paired(&mut self, cert_available: bool, actions: &mut Vec<PairingAction>) {
        if cert_available {
            actions.push(PairingAction::PinCertificate);
            self.transition(PairingState::Paired, actions);
        } else {
            actions.push(PairingAction::NotifyFailure(PairingError::NoCertificate));
            actions.push(PairingAction::SendPair(false));
            self.transition(PairingState::Unpaired, actions);
        }
    }

    /// Locally initiate pairing. When the peer has already asked, this is
    /// an acceptance.
    pub fn request_pairing(&mut self, cert_available: bool) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        match self.state {
            PairingState::Unpaired => {
                actions.push(PairingAction::SendPair(true));
                self.transition(PairingState::RequestedBySelf, &mut actions);
                actions.push(PairingAction::StartTimer(self.generation));
            }
            PairingState::RequestedByPeer => return self.accept_pairing(cert_available),
            PairingState::RequestedBySelf => {
                actions.push(PairingAction::NotifyFailure(PairingError::AlreadyRequested));
            }
            PairingState::Paired => {
                actions.push(PairingAction::NotifyFailure(PairingError::AlreadyPaired));
            }
        }
        actions
    }

    /// Locally accept the peer's pending request.
    pub fn accept_pairing(&mut self, cert_available: bool) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        if self.state != PairingState::RequestedByPeer {
            return actions;
        }
        if cert_available {
            actions.push(PairingAction::SendPair(true));
        }
        self.enter_paired(cert_available, &mut actions);
        actions
    }

    /// Locally decline the peer's pending request.
    pub fn decline_pairing(&mut self) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        if self.state != PairingState::RequestedByPeer {
            return actions;
        }
        actions.push(PairingAction::SendPair(false));
        self.transition(PairingState::Unpaired, &mut actions);
        actions
    }

    /// Locally drop the pairing, or cancel an outstanding request.
    pub fn unpair(&mut self) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        if self.state == PairingState::Unpaired {
            return actions;
        }
        actions.push(PairingAction::SendPair(false));
        actions.push(PairingAction::UnpinCertificate);
        self.transition(PairingState::Unpaired, &mut actions);
        actions
    }

    /// An inbound pair message arrived on the link.
    pub fn handle_pair_message(&mut self, pair: bool, cert_available: bool) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        if pair {
            match self.state {
                PairingState::Unpaired => {
                    self.transition(PairingState::RequestedByPeer, &mut actions);
                    actions.push(PairingAction::NotifyRequest);
                    actions.push(PairingAction::StartTimer(self.generation));
                }
                // Both sides asked; that settles it.
                PairingState::RequestedBySelf => {
                    self.enter_paired(cert_available, &mut actions);
                }
                // Duplicate request; give the peer a fresh timeout window.
                PairingState::RequestedByPeer => {
                    self.generation += 1;
                    actions.push(PairingAction::StartTimer(self.generation));
                }
                // Re-ack so a peer with stale state converges.
                PairingState::Paired => actions.push(PairingAction::SendPair(true)),
            }
        } else {
            match self.state {
                PairingState::RequestedBySelf => {
                    actions.push(PairingAction::NotifyFailure(PairingError::Declined));
                    self.transition(PairingState::Unpaired, &mut actions);
                }
                PairingState::RequestedByPeer => {
                    actions.push(PairingAction::NotifyFailure(PairingError::Canceled));
                    self.transition(PairingState::Unpaired, &mut actions);
                }
                PairingState::Paired => {
                    actions.push(PairingAction::UnpinCertificate);
                    self.transition(PairingState::Unpaired, &mut actions);
                }
                PairingState::Unpaired => {}
            }
        }
        actions
    }

    /// The pairing timer armed with `generation` fired.
    pub fn timer_fired(&mut self, generation: u64) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        if generation != self.generation {
            return actions;
        }
        match self.state {
            PairingState::RequestedBySelf | PairingState::RequestedByPeer => {
                actions.push(PairingAction::NotifyFailure(PairingError::Timeout));
                self.transition(PairingState::Unpaired, &mut actions);
            }
            PairingState::Unpaired | PairingState::Paired => {}
        }
        actions
    }

    /// Gate an inbound non-pairing message. A fully unpaired link swallows
    /// the message and reminds the peer that nothing is paired here; while
    /// a handshake is pending the reminder is withheld, because the peer
    /// would read it as a decline.
    pub fn gate_inbound(&self) -> (bool, Vec<PairingAction>) {
        match self.state {
            PairingState::Paired => (true, Vec::new()),
            PairingState::Unpaired => (false, vec![PairingAction::SendPair(false)]),
            PairingState::RequestedBySelf | PairingState::RequestedByPeer => {
                (false, Vec::new())
            }
        }
    }

    /// Adopt the device-level pairing status reconciled across sibling
    /// links. Only the settled states propagate; a pending handshake on
    /// this link is left to finish on its own.
    pub fn reconcile(&mut self, status: PairingState) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        match status {
            PairingState::Paired if self.state != PairingState::Paired => {
                self.transition(PairingState::Paired, &mut actions);
            }
            PairingState::Unpaired if self.state == PairingState::Paired => {
                self.transition(PairingState::Unpaired, &mut actions);
            }
            _ => {}
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contains(actions: &[PairingAction], wanted: &PairingAction) {
        assert!(
            actions.contains(wanted),
            "expected {wanted:?} in {actions:?}"
        );
    }

    #[test]
    fn request_then_peer_accepts() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        let actions = engine.request_pairing(true);
        assert_contains(&actions, &PairingAction::SendPair(true));
        assert_eq!(engine.state(), PairingState::RequestedBySelf);

        let actions = engine.handle_pair_message(true, true);
        assert_contains(&actions, &PairingAction::PinCertificate);
        assert_eq!(engine.state(), PairingState::Paired);
    }

    #[test]
    fn request_then_peer_declines() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.request_pairing(true);
        let actions = engine.handle_pair_message(false, true);
        assert_contains(&actions, &PairingAction::NotifyFailure(PairingError::Declined));
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn peer_request_accepted_locally() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        let actions = engine.handle_pair_message(true, true);
        assert_contains(&actions, &PairingAction::NotifyRequest);
        assert_eq!(engine.state(), PairingState::RequestedByPeer);

        let actions = engine.accept_pairing(true);
        assert_contains(&actions, &PairingAction::SendPair(true));
        assert_contains(&actions, &PairingAction::PinCertificate);
        assert_eq!(engine.state(), PairingState::Paired);
    }

    #[test]
    fn peer_request_declined_locally() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.handle_pair_message(true, true);
        let actions = engine.decline_pairing();
        assert_contains(&actions, &PairingAction::SendPair(false));
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn simultaneous_requests_converge_to_paired() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.request_pairing(true);
        let actions = engine.handle_pair_message(true, true);
        assert_contains(&actions, &PairingAction::PinCertificate);
        assert_eq!(engine.state(), PairingState::Paired);
    }

    #[test]
    fn paired_entry_requires_certificate() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.handle_pair_message(true, false);
        let actions = engine.accept_pairing(false);
        assert_contains(&actions, &PairingAction::NotifyFailure(PairingError::NoCertificate));
        assert_eq!(engine.state(), PairingState::Unpaired);
        assert!(!actions.contains(&PairingAction::PinCertificate));
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        let actions = engine.request_pairing(true);
        let stamp = actions
            .iter()
            .find_map(|a| match a {
                PairingAction::StartTimer(g) => Some(*g),
                _ => None,
            })
            .unwrap();

        // Peer answers before the timer fires.
        engine.handle_pair_message(true, true);
        assert_eq!(engine.state(), PairingState::Paired);
        assert!(engine.timer_fired(stamp).is_empty());
        assert_eq!(engine.state(), PairingState::Paired);
    }

    #[test]
    fn live_timer_fails_the_request() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        let actions = engine.request_pairing(true);
        let stamp = actions
            .iter()
            .find_map(|a| match a {
                PairingAction::StartTimer(g) => Some(*g),
                _ => None,
            })
            .unwrap();

        let actions = engine.timer_fired(stamp);
        assert_contains(&actions, &PairingAction::NotifyFailure(PairingError::Timeout));
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn unpair_unpins_and_notifies_peer() {
        let mut engine = PairingEngine::new(PairingState::Paired);
        let actions = engine.unpair();
        assert_contains(&actions, &PairingAction::SendPair(false));
        assert_contains(&actions, &PairingAction::UnpinCertificate);
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn peer_unpair_drops_pinned_certificate() {
        let mut engine = PairingEngine::new(PairingState::Paired);
        let actions = engine.handle_pair_message(false, true);
        assert_contains(&actions, &PairingAction::UnpinCertificate);
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn unpaired_link_gates_traffic_and_reannounces() {
        let engine = PairingEngine::new(PairingState::Unpaired);
        let (allowed, actions) = engine.gate_inbound();
        assert!(!allowed);
        assert_contains(&actions, &PairingAction::SendPair(false));

        let engine = PairingEngine::new(PairingState::Paired);
        let (allowed, actions) = engine.gate_inbound();
        assert!(allowed);
        assert!(actions.is_empty());
    }

    #[test]
    fn gating_stays_silent_while_a_handshake_is_pending() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.request_pairing(true);
        let (allowed, actions) = engine.gate_inbound();
        assert!(!allowed);
        assert!(actions.is_empty());
        assert_eq!(engine.state(), PairingState::RequestedBySelf);

        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.handle_pair_message(true, true);
        let (allowed, actions) = engine.gate_inbound();
        assert!(!allowed);
        assert!(actions.is_empty());
        assert_eq!(engine.state(), PairingState::RequestedByPeer);
    }

    #[test]
    fn redundant_requests_report_failure() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.request_pairing(true);
        let actions = engine.request_pairing(true);
        assert_eq!(
            actions,
            vec![PairingAction::NotifyFailure(PairingError::AlreadyRequested)]
        );
        assert_eq!(engine.state(), PairingState::RequestedBySelf);

        let mut engine = PairingEngine::new(PairingState::Paired);
        let actions = engine.request_pairing(true);
        assert_eq!(
            actions,
            vec![PairingAction::NotifyFailure(PairingError::AlreadyPaired)]
        );
        assert_eq!(engine.state(), PairingState::Paired);
    }

    #[test]
    fn reconcile_adopts_settled_sibling_status() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        let actions = engine.reconcile(PairingState::Paired);
        assert_contains(&actions, &PairingAction::NotifyStateChanged(PairingState::Paired));
        assert_eq!(engine.state(), PairingState::Paired);

        let actions = engine.reconcile(PairingState::Unpaired);
        assert_contains(&actions, &PairingAction::NotifyStateChanged(PairingState::Unpaired));
        assert_eq!(engine.state(), PairingState::Unpaired);
    }

    #[test]
    fn reconcile_leaves_pending_handshakes_alone() {
        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.request_pairing(true);
        assert!(engine.reconcile(PairingState::Unpaired).is_empty());
        assert_eq!(engine.state(), PairingState::RequestedBySelf);

        let mut engine = PairingEngine::new(PairingState::Unpaired);
        engine.handle_pair_message(true, true);
        assert!(engine.reconcile(PairingState::Unpaired).is_empty());
        assert_eq!(engine.state(), PairingState::RequestedByPeer);
    }

    #[test]
    fn paired_reacks_redundant_request() {
        let mut engine = PairingEngine::new(PairingState::Paired);
        let actions = engine.handle_pair_message(true, true);
        assert_eq!(actions, vec![PairingAction::SendPair(true)]);
        assert_eq!(engine.state(), PairingState::Paired);
    }
}
