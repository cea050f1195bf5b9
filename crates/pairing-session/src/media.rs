//! Contracts between the negotiation core and the media/transport layer.
//!
//! The core never touches an ICE agent or a capture device directly. A
//! [`TransportFactory`] hands out one [`PeerTransport`] per negotiation and a
//! [`MediaBridge`] owns the local capture handle that outlives them.

use crate::error::{MediaError, TransportError};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Monotonic tag distinguishing successive negotiations on one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Backend-specific object carried through the core untouched.
pub type OpaqueHandle = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub handle: OpaqueHandle,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Local capture handle. Survives across negotiations.
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub kind: TrackKind,
    pub handle: OpaqueHandle,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Connectivity as reported by the underlying ICE/DTLS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteStream),
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub generation: Generation,
    pub kind: TransportEventKind,
}

/// Event sink handed to a transport, pre-bound to its negotiation generation
/// so late callbacks from a superseded transport are recognisable.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    generation: Generation,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSender {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the session loop has gone away.
    pub fn send(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn local_candidate(&self, candidate: IceCandidate) -> bool {
        self.send(TransportEventKind::LocalCandidate(candidate))
    }

    pub fn state_changed(&self, state: TransportState) -> bool {
        self.send(TransportEventKind::StateChanged(state))
    }

    pub fn remote_track(&self, stream: RemoteStream) -> bool {
        self.send(TransportEventKind::RemoteTrack(stream))
    }
}

/// One peer connection, used for exactly one negotiation.
#[async_trait]
pub trait PeerTransport: Send {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), TransportError>;
    async fn remove_local_tracks(&mut self) -> Result<(), TransportError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send {
    async fn create(
        &mut self,
        partner: &PeerId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

#[async_trait]
pub trait MediaBridge: Send {
    async fn acquire_local_source(&mut self) -> Result<MediaSource, MediaError>;

    async fn attach(
        &mut self,
        transport: &mut dyn PeerTransport,
        source: &MediaSource,
    ) -> Result<(), MediaError> {
        for track in &source.tracks {
            transport
                .add_local_track(track)
                .await
                .map_err(|err| MediaError::Attach(format!("{}: {err}", track.id)))?;
        }
        Ok(())
    }

    async fn detach(&mut self, transport: &mut dyn PeerTransport) {
        if let Err(err) = transport.remove_local_tracks().await {
            tracing::debug!(target: "negotiation", error = %err, "detaching local tracks failed");
        }
    }

    /// Route a remote stream to playback; `None` clears the sink.
    fn set_render_sink(&mut self, stream: Option<RemoteStream>);

    /// Release the capture device. Only called at client shutdown.
    async fn stop(&mut self, source: MediaSource);
}
