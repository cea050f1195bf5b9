use crate::protocol::PeerId;
use thiserror::Error;

/// Failures reported by a peer transport (the ICE/DTLS/SDP layer).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("local media capture failed: {0}")]
    Capture(String),
    #[error("failed to attach local tracks: {0}")]
    Attach(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A second negotiation was attempted while one is live.
    #[error("a negotiation with {partner} is already active")]
    AlreadyActive { partner: PeerId },
    #[error("local media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Signaling(#[from] SignalingError),
    #[error("{0}")]
    Negotiation(#[from] NegotiationError),
    #[error("{0}")]
    Config(#[from] ConfigError),
}
