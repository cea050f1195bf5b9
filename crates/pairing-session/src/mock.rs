//! Scripted stand-ins for the transport and media layers.
//!
//! Every call lands in a shared [`Journal`] so tests can assert ordering.
//! Candidates whose text starts with `bad` and descriptions equal to
//! [`MALFORMED_SDP`] are refused the way a real ICE agent would refuse them.

use crate::error::{MediaError, TransportError};
use crate::media::{
    Generation, LocalTrack, MediaBridge, MediaSource, PeerTransport, RemoteStream, TrackKind,
    TransportEventSender, TransportFactory,
};
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const MALFORMED_SDP: &str = "malformed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack(String),
    RemoveTracks,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind, String),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(Generation, TransportCall)>>>,
}

impl Journal {
    fn record(&self, generation: Generation, call: TransportCall) {
        self.entries.lock().push((generation, call));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.entries
            .lock()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn calls_for(&self, generation: Generation) -> Vec<TransportCall> {
        self.entries
            .lock()
            .iter()
            .filter(|(entry, _)| *entry == generation)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry == call)
            .count()
    }

    /// Candidates the transport accepted, in application order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(_, call)| match call {
                TransportCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    journal: Journal,
    senders: Arc<Mutex<HashMap<Generation, TransportEventSender>>>,
    partners: Arc<Mutex<Vec<PeerId>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Number of transports handed out so far.
    pub fn created(&self) -> usize {
        self.partners.lock().len()
    }

    pub fn partners(&self) -> Vec<PeerId> {
        self.partners.lock().clone()
    }

    /// Event sink of the transport created for `generation`, to simulate
    /// ICE/DTLS callbacks.
    pub fn events_for(&self, generation: Generation) -> Option<TransportEventSender> {
        self.senders.lock().get(&generation).cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &mut self,
        partner: &PeerId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let generation = events.generation();
        self.senders.lock().insert(generation, events);
        self.partners.lock().push(partner.clone());
        Ok(Box::new(MockTransport {
            generation,
            journal: self.journal.clone(),
            closed: false,
        }))
    }
}

struct MockTransport {
    generation: Generation,
    journal: Journal,
    closed: bool,
}

impl MockTransport {
    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.journal.record(self.generation, call);
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), TransportError> {
        self.record(TransportCall::AddTrack(track.id.clone()))
    }

    async fn remove_local_tracks(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::RemoveTracks)
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateOffer)?;
        Ok(SessionDescription::offer(format!(
            "offer-{}",
            self.generation
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateAnswer)?;
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            self.generation
        )))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocal(description.kind))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if description.sdp == MALFORMED_SDP {
            return Err(TransportError::Description("unparsable sdp".into()));
        }
        self.record(TransportCall::SetRemote(description.kind, description.sdp))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        if candidate.candidate.is_empty() || candidate.candidate.starts_with("bad") {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        self.record(TransportCall::AddCandidate(candidate.candidate))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Close)?;
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MediaState {
    unavailable: bool,
    refuse_attach: bool,
    acquisitions: usize,
    stops: usize,
    attaches: usize,
    detaches: usize,
    render_sink: Option<String>,
}

/// Capture device double with one audio and one video track.
#[derive(Debug, Clone, Default)]
pub struct MockMedia {
    state: Arc<Mutex<MediaState>>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose capture always fails.
    pub fn unavailable() -> Self {
        let media = Self::default();
        media.state.lock().unavailable = true;
        media
    }

    /// Capture works but tracks cannot be attached to a transport.
    pub fn refusing_attach() -> Self {
        let media = Self::default();
        media.state.lock().refuse_attach = true;
        media
    }

    pub fn acquisitions(&self) -> usize {
        self.state.lock().acquisitions
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn attaches(&self) -> usize {
        self.state.lock().attaches
    }

    pub fn detaches(&self) -> usize {
        self.state.lock().detaches
    }

    /// Id of the remote stream currently routed to playback.
    pub fn render_sink(&self) -> Option<String> {
        self.state.lock().render_sink.clone()
    }
}

#[async_trait]
impl MediaBridge for MockMedia {
    async fn acquire_local_source(&mut self) -> Result<MediaSource, MediaError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(MediaError::Capture("permission denied".into()));
        }
        state.acquisitions += 1;
        Ok(MediaSource {
            id: format!("mock-source-{}", state.acquisitions),
            tracks: vec![
                LocalTrack {
                    id: "mock-audio".into(),
                    kind: TrackKind::Audio,
                    handle: Arc::new(()),
                },
                LocalTrack {
                    id: "mock-video".into(),
                    kind: TrackKind::Video,
                    handle: Arc::new(()),
                },
            ],
        })
    }

    async fn attach(
        &mut self,
        transport: &mut dyn PeerTransport,
        source: &MediaSource,
    ) -> Result<(), MediaError> {
        {
            let mut state = self.state.lock();
            state.attaches += 1;
            if state.refuse_attach {
                return Err(MediaError::Attach("track rejected".into()));
            }
        }
        for track in &source.tracks {
            transport
                .add_local_track(track)
                .await
                .map_err(|err| MediaError::Attach(err.to_string()))?;
        }
        Ok(())
    }

    async fn detach(&mut self, transport: &mut dyn PeerTransport) {
        self.state.lock().detaches += 1;
        let _ = transport.remove_local_tracks().await;
    }

    fn set_render_sink(&mut self, stream: Option<RemoteStream>) {
        self.state.lock().render_sink = stream.map(|stream| stream.id);
    }

    async fn stop(&mut self, _source: MediaSource) {
        self.state.lock().stops += 1;
    }
}
