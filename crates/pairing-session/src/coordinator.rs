//! Client-side session policy on top of the negotiation engine.
//!
//! The coordinator turns relay messages, transport events, user intents and
//! the negotiation deadline into engine calls, then decides what happens
//! once a partner is gone: ask the relay for someone new (auto-find) or go
//! back to a callable state (directory).

use crate::chat::ChatLog;
use crate::config::{PairingMode, SessionConfig};
use crate::engine::{NegotiationEngine, NegotiationRole, NegotiationState, SignalDisposition};
use crate::error::NegotiationError;
use crate::event::{Dispatch, Notice, PartnerLostReason, SessionEvent, SessionStatus};
use crate::media::{
    MediaBridge, TransportEvent, TransportEventKind, TransportFactory, TransportState,
};
use crate::protocol::{PeerId, PresenceMeta, SessionDescription, SignalingMessage};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Something the local user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    Join { username: String },
    Call { peer: PeerId },
    Next,
    EndCall,
    SendChat { text: String },
    Shutdown,
}

/// Relay paired us as the answering side; the partner's offer is due by
/// `deadline`.
#[derive(Debug, Clone)]
struct AwaitingOffer {
    from: PeerId,
    deadline: Instant,
}

pub struct SessionCoordinator {
    mode: PairingMode,
    local_id: Option<PeerId>,
    engine: NegotiationEngine,
    chat: ChatLog,
    status: SessionStatus,
    awaiting_offer: Option<AwaitingOffer>,
    presence: BTreeMap<String, PresenceMeta>,
    timeout: Duration,
}

impl SessionCoordinator {
    pub fn new(mode: PairingMode, engine: NegotiationEngine, timeout: Duration) -> Self {
        Self {
            mode,
            local_id: None,
            engine,
            chat: ChatLog::new(),
            status: SessionStatus::Connecting,
            awaiting_offer: None,
            presence: BTreeMap::new(),
            timeout,
        }
    }

    /// Build a coordinator and its engine from configuration. The receiver
    /// carries transport callbacks and must be polled by the session loop.
    pub fn from_config(
        config: &SessionConfig,
        factory: Box<dyn TransportFactory>,
        media: Box<dyn MediaBridge>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (engine, events) = NegotiationEngine::new(factory, media, config.negotiation_timeout);
        let coordinator = Self::new(config.pairing_mode, engine, config.negotiation_timeout);
        (coordinator, events)
    }

    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn state(&self) -> NegotiationState {
        self.engine.state()
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn presence(&self) -> &BTreeMap<String, PresenceMeta> {
        &self.presence
    }

    /// Current partner: the live negotiation's, or the one whose offer we
    /// are waiting for.
    pub fn partner(&self) -> Option<&PeerId> {
        self.engine
            .partner()
            .or(self.awaiting_offer.as_ref().map(|awaiting| &awaiting.from))
    }

    /// Earliest instant at which [`handle_deadline`](Self::handle_deadline)
    /// has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let awaiting = self.awaiting_offer.as_ref().map(|awaiting| awaiting.deadline);
        match (self.engine.deadline(), awaiting) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Relay connection is up.
    pub fn start(&mut self) -> Dispatch {
        let mut out = Dispatch::new();
        match self.mode {
            PairingMode::AutoFind => self.search(&mut out),
            PairingMode::Directory => self.set_status(SessionStatus::Connecting, &mut out),
        }
        out
    }

    pub async fn handle_intent(&mut self, intent: UserIntent) -> Dispatch {
        match intent {
            UserIntent::Join { username } => self.join(username),
            UserIntent::Call { peer } => self.call(peer).await,
            UserIntent::Next => self.request_next().await,
            UserIntent::EndCall => self.end_call().await,
            UserIntent::SendChat { text } => self.send_chat(&text),
            UserIntent::Shutdown => self.shutdown().await,
        }
    }

    /// Directory mode: register under `username`, which becomes our id.
    pub fn join(&mut self, username: impl Into<String>) -> Dispatch {
        let mut out = Dispatch::new();
        let username = username.into().trim().to_string();
        if username.is_empty() {
            return out;
        }
        self.adopt_identity(PeerId::new(username.clone()), &mut out);
        out.send(SignalingMessage::Join { username });
        self.set_status(SessionStatus::Available, &mut out);
        out
    }

    /// Directory mode: offer a call to `peer`.
    pub async fn call(&mut self, peer: PeerId) -> Dispatch {
        let mut out = Dispatch::new();
        if self.local_id.as_ref() == Some(&peer) {
            debug!(target: "coordinator", "ignoring call to self");
            return out;
        }
        if let Some(awaiting) = self.awaiting_offer.as_ref() {
            out.emit(SessionEvent::Notice(Notice::AlreadyInCall {
                partner: awaiting.from.clone(),
            }));
            return out;
        }
        self.begin_offer(peer, &mut out).await;
        out
    }

    /// Drop the current partner and, in auto-find mode, look for another.
    pub async fn request_next(&mut self) -> Dispatch {
        let mut out = Dispatch::new();
        let Some(partner) = self.partner().cloned() else {
            return out;
        };
        info!(target: "coordinator", partner = %partner, "rotating to next partner");
        out.send(SignalingMessage::Next { peer: partner });
        self.teardown(&mut out).await;
        self.after_partner_gone(&mut out);
        out
    }

    /// Hang up without looking for anyone new.
    pub async fn end_call(&mut self) -> Dispatch {
        let mut out = Dispatch::new();
        let Some(partner) = self.partner().cloned() else {
            return out;
        };
        info!(target: "coordinator", partner = %partner, "ending call");
        out.send(SignalingMessage::EndCall { peer: partner });
        self.teardown(&mut out).await;
        self.set_status(SessionStatus::Available, &mut out);
        out
    }

    /// Append a local chat line and address it to the partner. Blank text or
    /// no partner is a no-op.
    pub fn send_chat(&mut self, text: &str) -> Dispatch {
        let mut out = Dispatch::new();
        if text.trim().is_empty() {
            return out;
        }
        let Some(partner) = self.partner().cloned() else {
            debug!(target: "coordinator", "no partner; chat line dropped");
            return out;
        };
        let line = self.chat.push_local(text);
        out.send(SignalingMessage::Chat {
            from: self.local_id.clone(),
            to: partner,
            message: line.text.clone(),
        });
        out.emit(SessionEvent::ChatAppended(line));
        out
    }

    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Dispatch {
        let mut out = Dispatch::new();
        debug!(target: "coordinator", kind = message.kind(), "signal received");
        match message {
            SignalingMessage::Welcome { id } => {
                if self.mode == PairingMode::Directory && self.local_id.is_some() {
                    debug!(target: "coordinator", "already joined; relay id ignored");
                } else {
                    self.adopt_identity(id, &mut out);
                }
            }
            SignalingMessage::PresenceList { users } => {
                self.presence = users.clone();
                out.emit(SessionEvent::Presence(users));
            }
            SignalingMessage::PairAssigned { to } => self.on_pair_assigned(to, &mut out).await,
            SignalingMessage::WaitingOffer { from } => self.on_waiting_offer(from, &mut out),
            SignalingMessage::Offer { from, sdp, .. } => match from {
                Some(from) => self.on_offer(from, sdp, &mut out).await,
                None => warn!(target: "coordinator", "offer without sender; dropped"),
            },
            SignalingMessage::Answer { from, sdp, .. } => {
                if let Some(from) = self.sender(from) {
                    self.on_answer(from, sdp, &mut out).await;
                }
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => {
                if let Some(from) = self.sender(from) {
                    self.engine.add_remote_candidate(&from, candidate).await;
                }
            }
            SignalingMessage::EndCall { peer } | SignalingMessage::Next { peer } => {
                self.lose_partner_if_current(&peer, PartnerLostReason::PartnerEnded, &mut out)
                    .await;
            }
            SignalingMessage::PartnerLeft { user } => {
                self.lose_partner_if_current(&user, PartnerLostReason::PartnerLeft, &mut out)
                    .await;
            }
            SignalingMessage::CallBusy { from, to } => {
                let peer = from.unwrap_or(to);
                info!(target: "coordinator", peer = %peer, "peer is busy");
                out.emit(SessionEvent::Notice(Notice::PeerBusy { peer }));
            }
            SignalingMessage::Chat { from, message, .. } => self.on_chat(from, message, &mut out),
            SignalingMessage::Join { .. } | SignalingMessage::FindPartner => {
                warn!(target: "coordinator", "relay-bound message received from relay; dropped");
            }
        }
        out
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Dispatch {
        let mut out = Dispatch::new();
        if !self.engine.is_current(event.generation) {
            debug!(
                target: "coordinator",
                generation = %event.generation,
                "discarding event from superseded transport"
            );
            return out;
        }
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                if let Some(message) = self
                    .engine
                    .local_candidate_message(event.generation, candidate)
                {
                    out.send(message);
                }
            }
            TransportEventKind::StateChanged(TransportState::Connected) => {
                self.engine.mark_transport_connected(event.generation);
                if let Some(partner) = self.engine.partner().cloned() {
                    info!(target: "coordinator", partner = %partner, "media connected");
                    self.set_status(SessionStatus::InCall { partner }, &mut out);
                }
            }
            TransportEventKind::StateChanged(state) if state.is_failure() => {
                warn!(target: "coordinator", ?state, "transport lost connectivity");
                self.lose_partner(PartnerLostReason::TransportFailure, &mut out)
                    .await;
            }
            TransportEventKind::StateChanged(state) => {
                debug!(target: "coordinator", ?state, "transport state");
            }
            TransportEventKind::RemoteTrack(stream) => {
                self.engine.set_render_sink(Some(stream.clone()));
                out.emit(SessionEvent::RemoteStream(Some(stream)));
            }
        }
        out
    }

    /// Abandon a negotiation (or an expected offer) that missed its deadline.
    pub async fn handle_deadline(&mut self, now: Instant) -> Dispatch {
        let mut out = Dispatch::new();
        let awaiting_expired = self
            .awaiting_offer
            .as_ref()
            .is_some_and(|awaiting| now >= awaiting.deadline);
        if self.engine.is_expired(now) || awaiting_expired {
            warn!(
                target: "coordinator",
                partner = ?self.partner().map(PeerId::as_str),
                "negotiation timed out"
            );
            // The partner may believe the call is up; tell it to recycle.
            if let Some(partner) = self.partner().cloned() {
                out.send(SignalingMessage::EndCall { peer: partner });
            }
            self.lose_partner(PartnerLostReason::Timeout, &mut out).await;
        }
        out
    }

    /// The relay connection dropped; nothing can be negotiated any more.
    pub async fn handle_relay_disconnected(&mut self) -> Dispatch {
        let mut out = Dispatch::new();
        self.teardown(&mut out).await;
        self.set_status(SessionStatus::Disconnected, &mut out);
        out
    }

    /// Client shutdown: hang up, release the capture device.
    pub async fn shutdown(&mut self) -> Dispatch {
        let mut out = Dispatch::new();
        if let Some(partner) = self.partner().cloned() {
            out.send(SignalingMessage::EndCall { peer: partner });
        }
        self.teardown(&mut out).await;
        self.engine.shutdown(&mut out).await;
        self.set_status(SessionStatus::Disconnected, &mut out);
        out
    }

    fn adopt_identity(&mut self, id: PeerId, out: &mut Dispatch) {
        info!(target: "coordinator", id = %id, "local identity assigned");
        self.engine.set_local_id(id.clone());
        self.local_id = Some(id.clone());
        out.emit(SessionEvent::LocalIdentity(id));
    }

    /// Addressing for answers and candidates: a missing `from` means the
    /// current partner.
    fn sender(&self, from: Option<PeerId>) -> Option<PeerId> {
        from.or_else(|| self.partner().cloned())
    }

    async fn on_pair_assigned(&mut self, to: PeerId, out: &mut Dispatch) {
        if let Some(partner) = self.partner() {
            if partner == &to {
                debug!(target: "coordinator", partner = %to, "duplicate pairing ignored");
            } else {
                out.send(SignalingMessage::CallBusy {
                    from: self.local_id.clone(),
                    to,
                });
            }
            return;
        }
        self.awaiting_offer = None;
        self.begin_offer(to, out).await;
    }

    fn on_waiting_offer(&mut self, from: PeerId, out: &mut Dispatch) {
        if self.partner().is_some() {
            if self.partner() != Some(&from) {
                out.send(SignalingMessage::CallBusy {
                    from: self.local_id.clone(),
                    to: from,
                });
            }
            return;
        }
        info!(target: "coordinator", partner = %from, "paired; waiting for offer");
        self.awaiting_offer = Some(AwaitingOffer {
            from: from.clone(),
            deadline: Instant::now() + self.timeout,
        });
        self.set_status(SessionStatus::Paired { partner: from }, out);
    }

    async fn on_offer(&mut self, from: PeerId, sdp: String, out: &mut Dispatch) {
        if self.engine.partner() == Some(&from) {
            if self.engine.answered_offer_from(&from, &sdp) {
                debug!(target: "coordinator", from = %from, "duplicate offer ignored");
                return;
            }
            if self.engine.role() == Some(NegotiationRole::Offerer) {
                debug!(target: "coordinator", from = %from, "offer from partner while offering; ignored");
                return;
            }
            info!(target: "coordinator", partner = %from, "partner restarted negotiation");
            self.engine.end(out).await;
            out.emit(SessionEvent::RemoteStream(None));
        }
        if self
            .awaiting_offer
            .as_ref()
            .is_some_and(|awaiting| awaiting.from != from)
        {
            out.send(SignalingMessage::CallBusy {
                from: self.local_id.clone(),
                to: from.clone(),
            });
            out.emit(SessionEvent::Notice(Notice::RejectedIncoming { from }));
            return;
        }
        let offer = SessionDescription::offer(sdp);
        match self.engine.begin_as_answerer(from.clone(), offer, out).await {
            Ok(()) => {
                self.awaiting_offer = None;
                self.set_status(SessionStatus::Paired { partner: from }, out);
            }
            Err(NegotiationError::AlreadyActive { .. }) => {
                out.emit(SessionEvent::Notice(Notice::RejectedIncoming { from }));
            }
            Err(err) => self.negotiation_failed(from, err, out).await,
        }
    }

    async fn on_answer(&mut self, from: PeerId, sdp: String, out: &mut Dispatch) {
        let answer = SessionDescription::answer(sdp);
        match self.engine.apply_remote_answer(&from, answer, out).await {
            Ok(SignalDisposition::Applied) => {
                debug!(target: "coordinator", partner = %from, "answer applied");
            }
            Ok(_) => {}
            Err(err) => self.negotiation_failed(from, err, out).await,
        }
    }

    fn on_chat(&mut self, from: Option<PeerId>, message: String, out: &mut Dispatch) {
        let Some(partner) = self.partner() else {
            debug!(target: "coordinator", "chat with no partner dropped");
            return;
        };
        if from.as_ref().is_some_and(|from| from != partner) {
            debug!(target: "coordinator", "chat from non-partner dropped");
            return;
        }
        let line = self.chat.push_remote(message);
        out.emit(SessionEvent::ChatAppended(line));
    }

    async fn begin_offer(&mut self, partner: PeerId, out: &mut Dispatch) {
        match self.engine.begin_as_offerer(partner.clone(), out).await {
            Ok(()) => self.set_status(SessionStatus::Paired { partner }, out),
            Err(NegotiationError::AlreadyActive { partner }) => {
                out.emit(SessionEvent::Notice(Notice::AlreadyInCall { partner }));
            }
            Err(err) => self.negotiation_failed(partner, err, out).await,
        }
    }

    /// A negotiation could not start or broke mid-flight. The engine has
    /// already cleaned up after itself.
    async fn negotiation_failed(
        &mut self,
        partner: PeerId,
        err: NegotiationError,
        out: &mut Dispatch,
    ) {
        self.awaiting_offer = None;
        match err {
            NegotiationError::MediaUnavailable(err) => {
                warn!(target: "coordinator", error = %err, "cannot negotiate without local media");
                out.emit(SessionEvent::Notice(Notice::MediaUnavailable {
                    reason: err.to_string(),
                }));
                self.set_status(SessionStatus::Available, out);
            }
            err => {
                warn!(target: "coordinator", partner = %partner, error = %err, "negotiation failed");
                if self.teardown(out).await.is_none() {
                    self.forget_partner(out);
                }
                out.emit(SessionEvent::PartnerLost {
                    partner,
                    reason: PartnerLostReason::TransportFailure,
                });
                self.after_partner_gone(out);
            }
        }
    }

    async fn lose_partner_if_current(
        &mut self,
        peer: &PeerId,
        reason: PartnerLostReason,
        out: &mut Dispatch,
    ) {
        if self.partner() != Some(peer) {
            debug!(target: "coordinator", peer = %peer, ?reason, "not our partner; ignored");
            return;
        }
        self.lose_partner(reason, out).await;
    }

    async fn lose_partner(&mut self, reason: PartnerLostReason, out: &mut Dispatch) {
        let Some(partner) = self.teardown(out).await else {
            return;
        };
        info!(target: "coordinator", partner = %partner, ?reason, "partner lost");
        out.emit(SessionEvent::PartnerLost { partner, reason });
        self.after_partner_gone(out);
    }

    /// Close the negotiation and forget everything tied to the partner.
    async fn teardown(&mut self, out: &mut Dispatch) -> Option<PeerId> {
        let awaiting = self.awaiting_offer.take().map(|awaiting| awaiting.from);
        let ended = self.engine.end(out).await;
        let partner = ended.or(awaiting)?;
        self.forget_partner(out);
        Some(partner)
    }

    fn forget_partner(&mut self, out: &mut Dispatch) {
        self.chat.clear();
        out.emit(SessionEvent::ChatCleared);
        out.emit(SessionEvent::RemoteStream(None));
    }

    fn after_partner_gone(&mut self, out: &mut Dispatch) {
        match self.mode {
            PairingMode::AutoFind => self.search(out),
            PairingMode::Directory => self.set_status(SessionStatus::Available, out),
        }
    }

    fn search(&mut self, out: &mut Dispatch) {
        out.send(SignalingMessage::FindPartner);
        self.set_status(SessionStatus::Searching, out);
    }

    fn set_status(&mut self, status: SessionStatus, out: &mut Dispatch) {
        if self.status != status {
            self.status = status.clone();
            out.emit(SessionEvent::Status(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NegotiationState::*;
    use crate::media::{Generation, RemoteStream, TrackKind};
    use crate::mock::{MockMedia, MockTransportFactory, TransportCall};
    use crate::protocol::IceCandidate;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Harness {
        coordinator: SessionCoordinator,
        factory: MockTransportFactory,
        media: MockMedia,
        _events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(mode: PairingMode) -> Harness {
        harness_with(mode, MockMedia::new())
    }

    fn harness_with(mode: PairingMode, media: MockMedia) -> Harness {
        let factory = MockTransportFactory::new();
        let (engine, events) =
            NegotiationEngine::new(Box::new(factory.clone()), Box::new(media.clone()), TIMEOUT);
        let mut coordinator = SessionCoordinator::new(mode, engine, TIMEOUT);
        let mut out = Dispatch::new();
        coordinator.adopt_identity(PeerId::from("alice"), &mut out);
        Harness {
            coordinator,
            factory,
            media,
            _events: events,
        }
    }

    fn offer_from(peer: &str, sdp: &str) -> SignalingMessage {
        SignalingMessage::Offer {
            from: Some(PeerId::from(peer)),
            to: PeerId::from("alice"),
            sdp: sdp.into(),
        }
    }

    fn answer_from(peer: &str) -> SignalingMessage {
        SignalingMessage::Answer {
            from: Some(PeerId::from(peer)),
            to: PeerId::from("alice"),
            sdp: "answer-sdp".into(),
        }
    }

    fn chat_from(peer: &str, message: &str) -> SignalingMessage {
        SignalingMessage::Chat {
            from: Some(PeerId::from(peer)),
            to: PeerId::from("alice"),
            message: message.into(),
        }
    }

    fn partner_lost(out: &Dispatch) -> Option<(PeerId, PartnerLostReason)> {
        out.events.iter().find_map(|event| match event {
            SessionEvent::PartnerLost { partner, reason } => Some((partner.clone(), *reason)),
            _ => None,
        })
    }

    #[test_timeout::tokio_timeout_test]
    async fn auto_find_start_asks_for_a_partner() {
        let mut h = harness(PairingMode::AutoFind);
        let out = h.coordinator.start();
        assert_eq!(out.outbound, vec![SignalingMessage::FindPartner]);
        assert_eq!(h.coordinator.status(), &SessionStatus::Searching);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pair_assigned_makes_us_the_offerer() {
        let mut h = harness(PairingMode::AutoFind);
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        assert_eq!(out.states(), vec![Offering, Negotiating]);
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::Offer { to, .. }] if to.as_str() == "bob"
        ));
        assert_eq!(
            h.coordinator.status(),
            &SessionStatus::Paired {
                partner: PeerId::from("bob")
            }
        );

        let out = h.coordinator.handle_signal(answer_from("bob")).await;
        assert_eq!(out.states(), vec![Connected]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn busy_peer_declines_third_party_offer() {
        let mut h = harness(PairingMode::Directory);
        h.coordinator
            .handle_signal(offer_from("bob", "offer-bob"))
            .await;
        assert_eq!(h.coordinator.state(), Connected);
        let generation = h.coordinator.engine().generation();

        let out = h
            .coordinator
            .handle_signal(offer_from("carol", "offer-carol"))
            .await;
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::CallBusy { to, .. }] if to.as_str() == "carol"
        ));
        assert!(out.states().is_empty());
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("bob")));
        assert_eq!(h.coordinator.engine().generation(), generation);
        assert_eq!(h.factory.created(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_offer_from_partner_is_ignored() {
        let mut h = harness(PairingMode::Directory);
        h.coordinator.handle_signal(offer_from("bob", "o")).await;
        let out = h.coordinator.handle_signal(offer_from("bob", "o")).await;
        assert!(out.is_empty());
        assert_eq!(h.factory.created(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn new_offer_from_partner_restarts_negotiation() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator.handle_signal(offer_from("bob", "offer-1")).await;
        h.coordinator.send_chat("still here");
        let first = h.coordinator.engine().generation();

        let out = h.coordinator.handle_signal(offer_from("bob", "offer-2")).await;
        assert_eq!(
            out.states(),
            vec![Ending, Closed, Idle, AnsweringPending, Connected]
        );
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::Answer { to, .. }] if to.as_str() == "bob"
        ));
        assert_ne!(h.coordinator.engine().generation(), first);
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("bob")));
        assert_eq!(h.coordinator.chat().len(), 1);
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.media.attaches(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_from_partner_while_offering_is_ignored() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let out = h.coordinator.handle_signal(offer_from("bob", "glare")).await;
        assert!(out.is_empty());
        assert_eq!(h.coordinator.state(), Negotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn timed_out_offerer_hangs_up_so_late_answer_is_discarded() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let deadline = h.coordinator.next_deadline().expect("deadline armed");
        let out = h.coordinator.handle_deadline(deadline).await;
        assert!(matches!(
            out.outbound.first(),
            Some(SignalingMessage::EndCall { peer }) if peer.as_str() == "bob"
        ));

        // Relay order is FIFO per sender, so bob's answer to the abandoned
        // offer lands before any new pairing.
        let out = h.coordinator.handle_signal(answer_from("bob")).await;
        assert!(out.is_empty());
        assert_eq!(h.coordinator.state(), Idle);

        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        assert_eq!(out.states(), vec![Offering, Negotiating]);
        let out = h.coordinator.handle_signal(answer_from("bob")).await;
        assert_eq!(out.states(), vec![Connected]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pair_assigned_while_awaiting_offer_is_declined() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::WaitingOffer {
                from: PeerId::from("bob"),
            })
            .await;
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("carol"),
            })
            .await;
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::CallBusy { to, .. }] if to.as_str() == "carol"
        ));
        assert!(out.states().is_empty());
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("bob")));
        assert_eq!(h.factory.created(), 0);

        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        assert!(out.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn partner_left_mid_chat_clears_everything() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator.handle_signal(offer_from("bob", "o")).await;
        h.coordinator.send_chat("hi");
        h.coordinator.handle_signal(chat_from("bob", "hello")).await;
        assert_eq!(h.coordinator.chat().len(), 2);

        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PartnerLeft {
                user: PeerId::from("bob"),
            })
            .await;
        assert_eq!(out.states(), vec![Ending, Closed, Idle]);
        assert_eq!(
            partner_lost(&out),
            Some((PeerId::from("bob"), PartnerLostReason::PartnerLeft))
        );
        assert!(h.coordinator.chat().is_empty());
        assert!(out.events.iter().any(|e| matches!(e, SessionEvent::ChatCleared)));
        assert!(
            out.events
                .iter()
                .any(|e| matches!(e, SessionEvent::RemoteStream(None)))
        );
        assert_eq!(out.outbound, vec![SignalingMessage::FindPartner]);
        assert_eq!(h.coordinator.status(), &SessionStatus::Searching);
        assert_eq!(h.media.render_sink(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn directory_mode_returns_to_available_after_hang_up() {
        let mut h = harness(PairingMode::Directory);
        h.coordinator.handle_signal(offer_from("bob", "o")).await;
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::EndCall {
                peer: PeerId::from("bob"),
            })
            .await;
        assert_eq!(
            partner_lost(&out).map(|(_, reason)| reason),
            Some(PartnerLostReason::PartnerEnded)
        );
        assert!(out.outbound.is_empty());
        assert_eq!(h.coordinator.status(), &SessionStatus::Available);
    }

    #[test_timeout::tokio_timeout_test]
    async fn next_notifies_partner_and_searches_again() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        h.coordinator.handle_signal(answer_from("bob")).await;

        let out = h.coordinator.request_next().await;
        assert_eq!(
            out.outbound,
            vec![
                SignalingMessage::Next {
                    peer: PeerId::from("bob")
                },
                SignalingMessage::FindPartner,
            ]
        );
        assert_eq!(h.coordinator.state(), Idle);
        assert_eq!(h.media.stops(), 0);

        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("carol"),
            })
            .await;
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.media.acquisitions(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn end_call_without_partner_is_a_no_op() {
        let mut h = harness(PairingMode::AutoFind);
        assert!(h.coordinator.end_call().await.is_empty());
        assert!(h.coordinator.request_next().await.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn chat_rules() {
        let mut h = harness(PairingMode::Directory);
        assert!(h.coordinator.send_chat("nobody listening").is_empty());

        h.coordinator.handle_signal(offer_from("bob", "o")).await;
        assert!(h.coordinator.send_chat("   ").is_empty());
        let out = h.coordinator.send_chat("hi bob");
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::Chat { to, message, .. }] if to.as_str() == "bob" && message == "hi bob"
        ));

        let out = h.coordinator.handle_signal(chat_from("mallory", "psst")).await;
        assert!(out.is_empty());
        h.coordinator.handle_signal(chat_from("bob", "hey")).await;

        let lines = h.coordinator.chat().lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].sender_is_local);
        assert!(!lines[1].sender_is_local);
        assert_eq!(lines[1].text, "hey");
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_transport_events_are_ignored() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let first = h.coordinator.engine().generation().unwrap();
        h.coordinator.request_next().await;
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("carol"),
            })
            .await;

        for kind in [
            TransportEventKind::StateChanged(TransportState::Failed),
            TransportEventKind::LocalCandidate(IceCandidate::new("candidate:old")),
        ] {
            let out = h
                .coordinator
                .handle_transport_event(TransportEvent {
                    generation: first,
                    kind,
                })
                .await;
            assert!(out.is_empty());
        }
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("carol")));
        assert_eq!(
            h.factory.partners(),
            vec![PeerId::from("bob"), PeerId::from("carol")]
        );
        assert_eq!(h.coordinator.state(), Negotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn transport_events_drive_status_and_candidates() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let generation = h.coordinator.engine().generation().unwrap();

        let out = h
            .coordinator
            .handle_transport_event(TransportEvent {
                generation,
                kind: TransportEventKind::LocalCandidate(IceCandidate::new("candidate:1")),
            })
            .await;
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::IceCandidate { to, from: Some(from), .. }]
                if to.as_str() == "bob" && from.as_str() == "alice"
        ));

        let out = h
            .coordinator
            .handle_transport_event(TransportEvent {
                generation,
                kind: TransportEventKind::RemoteTrack(RemoteStream {
                    id: "bob-video".into(),
                    kind: TrackKind::Video,
                    handle: Arc::new(()),
                }),
            })
            .await;
        assert!(matches!(
            out.events.as_slice(),
            [SessionEvent::RemoteStream(Some(stream))] if stream.id == "bob-video"
        ));
        assert_eq!(h.media.render_sink().as_deref(), Some("bob-video"));

        h.coordinator
            .handle_transport_event(TransportEvent {
                generation,
                kind: TransportEventKind::StateChanged(TransportState::Connected),
            })
            .await;
        assert_eq!(
            h.coordinator.status(),
            &SessionStatus::InCall {
                partner: PeerId::from("bob")
            }
        );
        assert_eq!(h.coordinator.next_deadline(), None);

        let out = h
            .coordinator
            .handle_transport_event(TransportEvent {
                generation,
                kind: TransportEventKind::StateChanged(TransportState::Failed),
            })
            .await;
        assert_eq!(
            partner_lost(&out).map(|(_, reason)| reason),
            Some(PartnerLostReason::TransportFailure)
        );
        assert_eq!(h.coordinator.state(), Idle);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unanswered_offer_times_out() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let deadline = h.coordinator.next_deadline().expect("deadline armed");

        let early = h
            .coordinator
            .handle_deadline(deadline - Duration::from_millis(1))
            .await;
        assert!(early.is_empty());

        let out = h.coordinator.handle_deadline(deadline).await;
        assert_eq!(out.states(), vec![Ending, Closed, Idle]);
        assert_eq!(
            partner_lost(&out),
            Some((PeerId::from("bob"), PartnerLostReason::Timeout))
        );
        assert_eq!(
            out.outbound,
            vec![
                SignalingMessage::EndCall {
                    peer: PeerId::from("bob")
                },
                SignalingMessage::FindPartner,
            ]
        );
        assert_eq!(
            h.factory.journal().count(&TransportCall::Close),
            1,
            "transport closed exactly once"
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_offer_after_waiting_offer_times_out() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::WaitingOffer {
                from: PeerId::from("bob"),
            })
            .await;
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("bob")));
        let deadline = h.coordinator.next_deadline().expect("deadline armed");

        let out = h.coordinator.handle_deadline(deadline).await;
        assert_eq!(
            partner_lost(&out),
            Some((PeerId::from("bob"), PartnerLostReason::Timeout))
        );
        assert_eq!(h.coordinator.partner(), None);
        assert_eq!(h.factory.created(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_from_unexpected_peer_while_waiting_is_declined() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::WaitingOffer {
                from: PeerId::from("bob"),
            })
            .await;
        let out = h.coordinator.handle_signal(offer_from("carol", "o")).await;
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::CallBusy { to, .. }] if to.as_str() == "carol"
        ));

        let out = h.coordinator.handle_signal(offer_from("bob", "o")).await;
        assert_eq!(out.states(), vec![AnsweringPending, Connected]);
        assert_eq!(h.coordinator.partner(), Some(&PeerId::from("bob")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_failure_is_surfaced_without_negotiating() {
        let mut h = harness_with(PairingMode::Directory, MockMedia::unavailable());
        let out = h.coordinator.call(PeerId::from("bob")).await;
        assert!(out.outbound.is_empty());
        assert!(out.events.iter().any(|event| matches!(
            event,
            SessionEvent::Notice(Notice::MediaUnavailable { .. })
        )));
        assert_eq!(h.coordinator.state(), Idle);
        assert_eq!(h.factory.created(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn call_busy_is_only_a_notice() {
        let mut h = harness(PairingMode::Directory);
        h.coordinator.call(PeerId::from("bob")).await;
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::CallBusy {
                from: Some(PeerId::from("bob")),
                to: PeerId::from("alice"),
            })
            .await;
        assert!(matches!(
            out.events.as_slice(),
            [SessionEvent::Notice(Notice::PeerBusy { peer })] if peer.as_str() == "bob"
        ));
        assert_eq!(h.coordinator.state(), Negotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_remote_answer_loses_the_partner() {
        let mut h = harness(PairingMode::AutoFind);
        h.coordinator
            .handle_signal(SignalingMessage::PairAssigned {
                to: PeerId::from("bob"),
            })
            .await;
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::Answer {
                from: Some(PeerId::from("bob")),
                to: PeerId::from("alice"),
                sdp: crate::mock::MALFORMED_SDP.into(),
            })
            .await;
        assert_eq!(
            partner_lost(&out),
            Some((PeerId::from("bob"), PartnerLostReason::TransportFailure))
        );
        assert_eq!(h.coordinator.state(), Idle);
        assert_eq!(h.coordinator.status(), &SessionStatus::Searching);
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_disconnect_and_shutdown() {
        let mut h = harness(PairingMode::Directory);
        h.coordinator.handle_signal(offer_from("bob", "o")).await;
        let out = h.coordinator.handle_relay_disconnected().await;
        assert_eq!(out.states(), vec![Ending, Closed, Idle]);
        assert_eq!(h.coordinator.status(), &SessionStatus::Disconnected);

        h.coordinator.shutdown().await;
        assert_eq!(h.media.stops(), 1);
        assert_eq!(
            h.factory.journal().calls_for(Generation(1)).last(),
            Some(&TransportCall::Close)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn presence_and_identity_are_surfaced() {
        let mut h = harness(PairingMode::Directory);
        let out = h.coordinator.join("zoe");
        assert_eq!(h.coordinator.local_id(), Some(&PeerId::from("zoe")));
        assert!(matches!(
            out.outbound.as_slice(),
            [SignalingMessage::Join { username }] if username == "zoe"
        ));

        let mut users = BTreeMap::new();
        users.insert("bob".to_string(), PresenceMeta::default());
        let out = h
            .coordinator
            .handle_signal(SignalingMessage::PresenceList {
                users: users.clone(),
            })
            .await;
        assert!(matches!(out.events.as_slice(), [SessionEvent::Presence(_)]));
        assert_eq!(h.coordinator.presence(), &users);
    }
}
