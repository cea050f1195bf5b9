//! Per-partner negotiation state machine.
//!
//! One [`NegotiationEngine`] lives for the whole client; it holds at most one
//! active negotiation at a time. Every operation writes the resulting state
//! transitions and outbound relay messages into a [`Dispatch`] instead of
//! calling back into the UI or the relay.

use crate::candidate_queue::CandidateQueue;
use crate::error::{MediaError, NegotiationError, TransportError};
use crate::event::{Dispatch, SessionEvent, Transition};
use crate::media::{
    Generation, MediaBridge, MediaSource, PeerTransport, RemoteStream, TransportEvent,
    TransportEventSender, TransportFactory,
};
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription, SignalingMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    AnsweringPending,
    Negotiating,
    Connected,
    Ending,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Why an inbound signal was dropped without being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoActiveNegotiation,
    PartnerMismatch { expected: PeerId },
    /// An answer arrived while not awaiting one (duplicate or late).
    NotAwaitingAnswer { state: NegotiationState },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDisposition {
    Applied,
    Buffered,
    /// The transport refused it; logged and ignored.
    Rejected,
    Discarded(StaleReason),
}

struct ActiveNegotiation {
    partner: PeerId,
    generation: Generation,
    role: NegotiationRole,
    state: NegotiationState,
    transport: Box<dyn PeerTransport>,
    candidates: CandidateQueue,
    remote_applied: bool,
    /// SDP of the offer we answered, for telling a resend from a restart.
    remote_offer: Option<String>,
    deadline: Option<Instant>,
}

impl ActiveNegotiation {
    fn transition(&mut self, to: NegotiationState, out: &mut Dispatch) {
        let from = self.state;
        self.state = to;
        debug!(
            target: "negotiation",
            partner = %self.partner,
            generation = %self.generation,
            ?from,
            ?to,
            "state transition"
        );
        out.emit(SessionEvent::StateChanged(Transition {
            generation: self.generation,
            partner: self.partner.clone(),
            from,
            to,
        }));
    }

    async fn apply_remote(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.transport.set_remote_description(description).await?;
        self.remote_applied = true;
        let buffered = self.candidates.flush();
        if !buffered.is_empty() {
            debug!(
                target: "negotiation",
                partner = %self.partner,
                count = buffered.len(),
                "flushing buffered remote candidates"
            );
        }
        for candidate in buffered {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> SignalDisposition {
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => SignalDisposition::Applied,
            Err(err) => {
                warn!(
                    target: "negotiation",
                    partner = %self.partner,
                    error = %err,
                    "ignoring unusable remote candidate"
                );
                SignalDisposition::Rejected
            }
        }
    }
}

pub struct NegotiationEngine {
    factory: Box<dyn TransportFactory>,
    media: Box<dyn MediaBridge>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    local_id: Option<PeerId>,
    local_source: Option<MediaSource>,
    active: Option<ActiveNegotiation>,
    last_generation: u64,
    timeout: Duration,
}

impl NegotiationEngine {
    /// Returns the engine and the receiver its transports report into.
    pub fn new(
        factory: Box<dyn TransportFactory>,
        media: Box<dyn MediaBridge>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            factory,
            media,
            events_tx,
            local_id: None,
            local_source: None,
            active: None,
            last_generation: 0,
            timeout,
        };
        (engine, events_rx)
    }

    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = Some(id);
    }

    pub fn state(&self) -> NegotiationState {
        self.active
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn partner(&self) -> Option<&PeerId> {
        self.active.as_ref().map(|session| &session.partner)
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.active.as_ref().map(|session| session.role)
    }

    /// True when `sdp` is the offer from `from` that the live negotiation
    /// already answered.
    pub fn answered_offer_from(&self, from: &PeerId, sdp: &str) -> bool {
        self.active.as_ref().is_some_and(|session| {
            &session.partner == from && session.remote_offer.as_deref() == Some(sdp)
        })
    }

    pub fn generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|session| session.generation)
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation() == Some(generation)
    }

    pub fn pending_candidates(&self) -> usize {
        self.active
            .as_ref()
            .map(|session| session.candidates.len())
            .unwrap_or(0)
    }

    /// Deadline after which an unconnected negotiation is abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|session| session.deadline)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub async fn begin_as_offerer(
        &mut self,
        partner: PeerId,
        out: &mut Dispatch,
    ) -> Result<(), NegotiationError> {
        if let Some(active) = self.active.as_ref() {
            return Err(NegotiationError::AlreadyActive {
                partner: active.partner.clone(),
            });
        }
        self.start(partner, NegotiationRole::Offerer, NegotiationState::Offering, out)
            .await?;
        match self.send_offer(out).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.end(out).await;
                Err(err)
            }
        }
    }

    /// On `AlreadyActive` a `call-busy` for `partner` has been queued in `out`.
    pub async fn begin_as_answerer(
        &mut self,
        partner: PeerId,
        remote_offer: SessionDescription,
        out: &mut Dispatch,
    ) -> Result<(), NegotiationError> {
        if let Some(active) = self.active.as_ref() {
            info!(
                target: "negotiation",
                caller = %partner,
                partner = %active.partner,
                "busy; declining incoming offer"
            );
            out.send(SignalingMessage::CallBusy {
                from: self.local_id.clone(),
                to: partner,
            });
            return Err(NegotiationError::AlreadyActive {
                partner: active.partner.clone(),
            });
        }
        self.start(
            partner,
            NegotiationRole::Answerer,
            NegotiationState::AnsweringPending,
            out,
        )
        .await?;
        match self.send_answer(remote_offer, out).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.end(out).await;
                Err(err)
            }
        }
    }

    pub async fn apply_remote_answer(
        &mut self,
        from: &PeerId,
        remote_answer: SessionDescription,
        out: &mut Dispatch,
    ) -> Result<SignalDisposition, NegotiationError> {
        let Some(session) = self.active.as_mut() else {
            return Ok(discard("answer", from, StaleReason::NoActiveNegotiation));
        };
        if &session.partner != from {
            let reason = StaleReason::PartnerMismatch {
                expected: session.partner.clone(),
            };
            return Ok(discard("answer", from, reason));
        }
        if session.role != NegotiationRole::Offerer
            || session.state != NegotiationState::Negotiating
        {
            let reason = StaleReason::NotAwaitingAnswer {
                state: session.state,
            };
            return Ok(discard("answer", from, reason));
        }
        let applied = session.apply_remote(remote_answer).await;
        match applied {
            Ok(()) => {
                session.transition(NegotiationState::Connected, out);
                Ok(SignalDisposition::Applied)
            }
            Err(err) => {
                self.end(out).await;
                Err(err.into())
            }
        }
    }

    pub async fn add_remote_candidate(
        &mut self,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> SignalDisposition {
        let Some(session) = self.active.as_mut() else {
            return discard("ice-candidate", from, StaleReason::NoActiveNegotiation);
        };
        if &session.partner != from {
            let reason = StaleReason::PartnerMismatch {
                expected: session.partner.clone(),
            };
            return discard("ice-candidate", from, reason);
        }
        if session.remote_applied {
            session.apply_candidate(candidate).await
        } else {
            session.candidates.enqueue(candidate);
            SignalDisposition::Buffered
        }
    }

    /// Tear down the active negotiation, if any. Safe to call repeatedly.
    ///
    /// The local capture source is kept for the next negotiation.
    pub async fn end(&mut self, out: &mut Dispatch) -> Option<PeerId> {
        let mut session = self.active.take()?;
        session.transition(NegotiationState::Ending, out);
        self.media.detach(session.transport.as_mut()).await;
        if let Err(err) = session.transport.close().await {
            debug!(
                target: "negotiation",
                partner = %session.partner,
                error = %err,
                "transport close reported an error"
            );
        }
        self.media.set_render_sink(None);
        let ActiveNegotiation {
            partner,
            generation,
            state,
            candidates,
            ..
        } = session;
        let dropped = candidates.discard();
        out.emit(SessionEvent::StateChanged(Transition {
            generation,
            partner: partner.clone(),
            from: state,
            to: NegotiationState::Closed,
        }));
        out.emit(SessionEvent::StateChanged(Transition {
            generation,
            partner: partner.clone(),
            from: NegotiationState::Closed,
            to: NegotiationState::Idle,
        }));
        info!(
            target: "negotiation",
            partner = %partner,
            generation = %generation,
            dropped_candidates = dropped,
            "negotiation closed"
        );
        Some(partner)
    }

    /// Transport reached connectivity; the negotiation deadline no longer applies.
    pub fn mark_transport_connected(&mut self, generation: Generation) -> bool {
        match self.active.as_mut() {
            Some(session) if session.generation == generation => {
                session.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Build the relay message for a locally gathered candidate, if it belongs
    /// to the live negotiation.
    pub fn local_candidate_message(
        &self,
        generation: Generation,
        candidate: IceCandidate,
    ) -> Option<SignalingMessage> {
        let session = self.active.as_ref()?;
        if session.generation != generation {
            return None;
        }
        Some(SignalingMessage::IceCandidate {
            from: self.local_id.clone(),
            to: session.partner.clone(),
            candidate,
        })
    }

    pub fn set_render_sink(&mut self, stream: Option<RemoteStream>) {
        self.media.set_render_sink(stream);
    }

    /// Full client teardown: end any negotiation and release the capture device.
    pub async fn shutdown(&mut self, out: &mut Dispatch) {
        self.end(out).await;
        if let Some(source) = self.local_source.take() {
            debug!(target: "negotiation", source = %source.id, "stopping local media source");
            self.media.stop(source).await;
        }
    }

    async fn local_source(&mut self) -> Result<MediaSource, MediaError> {
        if let Some(source) = self.local_source.as_ref() {
            return Ok(source.clone());
        }
        let source = self.media.acquire_local_source().await?;
        debug!(
            target: "negotiation",
            source = %source.id,
            tracks = source.tracks.len(),
            "acquired local media source"
        );
        self.local_source = Some(source.clone());
        Ok(source)
    }

    async fn start(
        &mut self,
        partner: PeerId,
        role: NegotiationRole,
        state: NegotiationState,
        out: &mut Dispatch,
    ) -> Result<(), NegotiationError> {
        let source = self.local_source().await?;
        self.last_generation += 1;
        let generation = Generation(self.last_generation);
        let events = TransportEventSender::new(generation, self.events_tx.clone());
        let mut transport = self.factory.create(&partner, events).await?;
        if let Err(err) = self.media.attach(transport.as_mut(), &source).await {
            if let Err(close_err) = transport.close().await {
                debug!(
                    target: "negotiation",
                    partner = %partner,
                    error = %close_err,
                    "closing transport after failed attach"
                );
            }
            return Err(err.into());
        }

        let mut session = ActiveNegotiation {
            partner,
            generation,
            role,
            state: NegotiationState::Idle,
            transport,
            candidates: CandidateQueue::new(),
            remote_applied: false,
            remote_offer: None,
            deadline: Some(Instant::now() + self.timeout),
        };
        session.transition(state, out);
        self.active = Some(session);
        Ok(())
    }

    async fn send_offer(&mut self, out: &mut Dispatch) -> Result<(), NegotiationError> {
        let local_id = self.local_id.clone();
        let Some(session) = self.active.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        let offer = session.transport.create_offer().await?;
        session.transport.set_local_description(offer.clone()).await?;
        out.send(SignalingMessage::Offer {
            from: local_id,
            to: session.partner.clone(),
            sdp: offer.sdp,
        });
        session.transition(NegotiationState::Negotiating, out);
        Ok(())
    }

    async fn send_answer(
        &mut self,
        remote_offer: SessionDescription,
        out: &mut Dispatch,
    ) -> Result<(), NegotiationError> {
        let local_id = self.local_id.clone();
        let Some(session) = self.active.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        if remote_offer.kind != SdpKind::Offer {
            return Err(TransportError::Description("expected an offer".into()).into());
        }
        session.remote_offer = Some(remote_offer.sdp.clone());
        session.apply_remote(remote_offer).await?;
        let answer = session.transport.create_answer().await?;
        session
            .transport
            .set_local_description(answer.clone())
            .await?;
        out.send(SignalingMessage::Answer {
            from: local_id,
            to: session.partner.clone(),
            sdp: answer.sdp,
        });
        session.transition(NegotiationState::Connected, out);
        Ok(())
    }
}

fn discard(kind: &'static str, from: &PeerId, reason: StaleReason) -> SignalDisposition {
    debug!(
        target: "negotiation",
        kind,
        from = %from,
        ?reason,
        "discarding stale signal"
    );
    SignalDisposition::Discarded(reason)
}
