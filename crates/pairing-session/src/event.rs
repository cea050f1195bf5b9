use crate::chat::ChatLine;
use crate::engine::NegotiationState;
use crate::media::{Generation, RemoteStream};
use crate::protocol::{PeerId, PresenceMeta, SignalingMessage};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub generation: Generation,
    pub partner: PeerId,
    pub from: NegotiationState,
    pub to: NegotiationState,
}

/// One-line status a UI would render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Searching,
    Available,
    Paired { partner: PeerId },
    InCall { partner: PeerId },
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerLostReason {
    /// Relay reported the partner gone.
    PartnerLeft,
    /// Partner sent `end-call` or `next`.
    PartnerEnded,
    TransportFailure,
    Timeout,
}

/// Non-fatal conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The peer we tried to reach is in another call.
    PeerBusy { peer: PeerId },
    /// A local call/pairing attempt was refused because one is live.
    AlreadyInCall { partner: PeerId },
    /// An offer from a third party was turned away.
    RejectedIncoming { from: PeerId },
    MediaUnavailable { reason: String },
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(Transition),
    Status(SessionStatus),
    Notice(Notice),
    LocalIdentity(PeerId),
    ChatAppended(ChatLine),
    ChatCleared,
    RemoteStream(Option<RemoteStream>),
    PartnerLost {
        partner: PeerId,
        reason: PartnerLostReason,
    },
    Presence(BTreeMap<String, PresenceMeta>),
}

/// Result of handling one input: messages for the relay, in send order, and
/// events for the UI.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outbound: Vec<SignalingMessage>,
    pub events: Vec<SessionEvent>,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, message: SignalingMessage) {
        self.outbound.push(message);
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.events.iter().filter_map(|event| match event {
            SessionEvent::StateChanged(transition) => Some(transition),
            _ => None,
        })
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<NegotiationState> {
        self.transitions().map(|transition| transition.to).collect()
    }
}
