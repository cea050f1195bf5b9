//! Peer-session negotiation client for one-to-one WebRTC calls brokered by a
//! relay.
//!
//! [`NegotiationEngine`] runs the offer/answer/candidate state machine for a
//! single partner at a time, [`SessionCoordinator`] applies pairing policy
//! and chat on top of it, and [`SessionRuntime`] drives both from a relay
//! connection, transport callbacks and user intents.

pub mod candidate_queue;
pub mod chat;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod media;
pub mod mock;
pub mod protocol;
pub mod runtime;
pub mod signaling;
pub mod telemetry;

pub use candidate_queue::CandidateQueue;
pub use chat::{ChatLine, ChatLog};
pub use config::{PairingMode, SessionConfig};
pub use coordinator::{SessionCoordinator, UserIntent};
pub use engine::{
    NegotiationEngine, NegotiationRole, NegotiationState, SignalDisposition, StaleReason,
};
pub use error::{
    ConfigError, MediaError, NegotiationError, SessionError, SignalingError, TransportError,
};
pub use event::{Dispatch, Notice, PartnerLostReason, SessionEvent, SessionStatus, Transition};
pub use media::{
    Generation, LocalTrack, MediaBridge, MediaSource, PeerTransport, RemoteStream, TrackKind,
    TransportEvent, TransportEventKind, TransportEventSender, TransportFactory, TransportState,
};
pub use protocol::{IceCandidate, PeerId, SdpKind, SessionDescription, SignalingMessage};
pub use runtime::{Exit, SessionHandle, SessionRuntime};
pub use signaling::{LocalRelay, SignalingChannel, WebSocketChannel};
