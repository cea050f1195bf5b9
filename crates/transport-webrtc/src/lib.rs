//! `webrtc`-backed implementations of the pairing-session media contracts.
//!
//! [`WebRtcTransportFactory`] builds one `RTCPeerConnection` per negotiation
//! and forwards its ICE, connection-state and remote-track callbacks as
//! generation-tagged transport events. [`StaticSampleMedia`] provides the
//! local audio/video tracks the caller writes encoded samples into.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pairing_session::{
    IceCandidate, LocalTrack, MediaBridge, MediaError, MediaSource, PeerId, PeerTransport,
    RemoteStream, SdpKind, SessionConfig, SessionDescription, TrackKind, TransportError,
    TransportEventSender, TransportFactory, TransportState,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error("no {0:?} track in the local source")]
    MissingTrack(TrackKind),
    #[error("failed to write sample: {0}")]
    Write(String),
}

fn setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

/// Builds peer connections against a fixed ICE server list.
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let connection = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(setup_error)?;
        Ok(Arc::new(connection))
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &mut self,
        partner: &PeerId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let connection = self.peer_connection().await?;
        debug!(
            target: "webrtc",
            partner = %partner,
            generation = %events.generation(),
            "peer connection created"
        );
        wire_callbacks(&connection, events);
        Ok(Box::new(WebRtcPeerTransport {
            connection,
            senders: Vec::new(),
        }))
    }
}

fn wire_callbacks(connection: &RTCPeerConnection, events: TransportEventSender) {
    let candidates = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidates.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    trace!(target: "webrtc", candidate = %init.candidate, "local candidate");
                    events.local_candidate(from_rtc_candidate(init));
                }
                Err(err) => {
                    warn!(target: "webrtc", error = %err, "failed to serialise local candidate");
                }
            }
        })
    }));

    let states = events.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = states.clone();
        Box::pin(async move {
            debug!(target: "webrtc", ?state, "peer connection state");
            if let Some(state) = map_state(state) {
                events.state_changed(state);
            }
        })
    }));

    connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => return,
            };
            let id = track.stream_id();
            debug!(target: "webrtc", stream = %id, ?kind, "remote track");
            events.remote_track(RemoteStream {
                id,
                kind,
                handle: track as Arc<dyn Any + Send + Sync>,
            });
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| TransportError::Description(err.to_string()))
}

pub struct WebRtcPeerTransport {
    connection: Arc<RTCPeerConnection>,
    senders: Vec<Arc<RTCRtpSender>>,
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), TransportError> {
        let local = track
            .handle
            .clone()
            .downcast::<TrackLocalStaticSample>()
            .map_err(|_| {
                TransportError::Setup(format!("track {} is not a webrtc track", track.id))
            })?;
        let sender = self
            .connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(setup_error)?;
        self.senders.push(sender);
        Ok(())
    }

    async fn remove_local_tracks(&mut self) -> Result<(), TransportError> {
        for sender in self.senders.drain(..) {
            self.connection
                .remove_track(&sender)
                .await
                .map_err(setup_error)?;
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.connection
            .set_local_description(description)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.connection
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.senders.clear();
        self.connection.close().await.map_err(setup_error)
    }
}

/// Local media as an Opus audio track and a VP8 video track fed by the
/// caller with already-encoded samples.
///
/// The same tracks are attached to every negotiation; `stop` releases them.
#[derive(Clone, Default)]
pub struct StaticSampleMedia {
    inner: Arc<Mutex<MediaState>>,
}

#[derive(Default)]
struct MediaState {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    render_sink: Option<RemoteStream>,
}

impl StaticSampleMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote stream currently selected for playback.
    pub fn render_sink(&self) -> Option<RemoteStream> {
        self.inner.lock().render_sink.clone()
    }

    pub async fn write_sample(
        &self,
        kind: TrackKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), WebRtcError> {
        let track = {
            let state = self.inner.lock();
            match kind {
                TrackKind::Audio => state.audio.clone(),
                TrackKind::Video => state.video.clone(),
            }
        }
        .ok_or(WebRtcError::MissingTrack(kind))?;
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|err| WebRtcError::Write(err.to_string()))
    }
}

fn static_track(
    mime_type: &str,
    clock_rate: u32,
    channels: u16,
    stream_id: &str,
) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            ..Default::default()
        },
        format!("{stream_id}-{}", mime_type.split('/').next().unwrap_or("track")),
        stream_id.to_owned(),
    ))
}

#[async_trait]
impl MediaBridge for StaticSampleMedia {
    async fn acquire_local_source(&mut self) -> Result<MediaSource, MediaError> {
        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let audio = static_track(MIME_TYPE_OPUS, 48_000, 2, &stream_id);
        let video = static_track(MIME_TYPE_VP8, 90_000, 0, &stream_id);
        let tracks = vec![
            LocalTrack {
                id: audio.id().to_owned(),
                kind: TrackKind::Audio,
                handle: audio.clone() as Arc<dyn Any + Send + Sync>,
            },
            LocalTrack {
                id: video.id().to_owned(),
                kind: TrackKind::Video,
                handle: video.clone() as Arc<dyn Any + Send + Sync>,
            },
        ];
        let mut state = self.inner.lock();
        state.audio = Some(audio);
        state.video = Some(video);
        Ok(MediaSource {
            id: stream_id,
            tracks,
        })
    }

    fn set_render_sink(&mut self, stream: Option<RemoteStream>) {
        self.inner.lock().render_sink = stream;
    }

    async fn stop(&mut self, source: MediaSource) {
        let mut state = self.inner.lock();
        state.audio = None;
        state.video = None;
        debug!(target: "webrtc", source = %source.id, "local tracks released");
    }
}
