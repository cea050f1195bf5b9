use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a participant as the relay knows it: a random session id in
/// auto-find mode, the chosen display name in directory mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Generate a fresh random peer id.
pub fn generate_peer_id() -> PeerId {
    PeerId(Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP payload plus its role. The body is never parsed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Directory entry published by the relay in directory mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    #[serde(default)]
    pub in_call: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<i64>,
}

/// Every message exchanged with the relay, one JSON object per message.
///
/// `from` is stamped by the relay on forwarded messages; clients may leave
/// it empty on outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Relay tells the client its own id.
    Welcome { id: PeerId },
    /// Directory mode: register under a display name.
    Join { username: String },
    /// Directory mode: current set of callable users.
    PresenceList {
        users: BTreeMap<String, PresenceMeta>,
    },
    /// Auto-find mode: ask the relay for a partner.
    FindPartner,
    /// The relay designated this client as offerer towards `to`.
    #[serde(alias = "create-offer")]
    PairAssigned { to: PeerId },
    /// The relay paired this client with `from`, who will send the offer.
    WaitingOffer { from: PeerId },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
        sdp: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
        sdp: String,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
        candidate: IceCandidate,
    },
    /// Hang up. Outbound `peer` is the partner; inbound it is the originator.
    #[serde(alias = "call-ended")]
    EndCall { peer: PeerId },
    /// Rotate to a new partner. Same addressing as `EndCall`.
    Next { peer: PeerId },
    #[serde(alias = "user-left")]
    PartnerLeft { user: PeerId },
    CallBusy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
    },
    #[serde(alias = "chat-message")]
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
        message: String,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Welcome { .. } => "welcome",
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::PresenceList { .. } => "presence-list",
            SignalingMessage::FindPartner => "find-partner",
            SignalingMessage::PairAssigned { .. } => "pair-assigned",
            SignalingMessage::WaitingOffer { .. } => "waiting-offer",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::EndCall { .. } => "end-call",
            SignalingMessage::Next { .. } => "next",
            SignalingMessage::PartnerLeft { .. } => "partner-left",
            SignalingMessage::CallBusy { .. } => "call-busy",
            SignalingMessage::Chat { .. } => "chat",
        }
    }

    /// Addressee of a peer-to-peer message, if the kind carries one.
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. }
            | SignalingMessage::CallBusy { to, .. }
            | SignalingMessage::Chat { to, .. } => Some(to),
            SignalingMessage::EndCall { peer } | SignalingMessage::Next { peer } => Some(peer),
            _ => None,
        }
    }

    /// Stamp the sender on a message about to be forwarded by a relay.
    pub fn stamped(self, sender: &PeerId) -> Self {
        let from = Some(sender.clone());
        match self {
            SignalingMessage::Offer { to, sdp, .. } => SignalingMessage::Offer { from, to, sdp },
            SignalingMessage::Answer { to, sdp, .. } => SignalingMessage::Answer { from, to, sdp },
            SignalingMessage::IceCandidate { to, candidate, .. } => {
                SignalingMessage::IceCandidate { from, to, candidate }
            }
            SignalingMessage::CallBusy { to, .. } => SignalingMessage::CallBusy { from, to },
            SignalingMessage::Chat { to, message, .. } => {
                SignalingMessage::Chat { from, to, message }
            }
            SignalingMessage::EndCall { .. } => SignalingMessage::EndCall {
                peer: sender.clone(),
            },
            SignalingMessage::Next { .. } => SignalingMessage::Next {
                peer: sender.clone(),
            },
            other => other,
        }
    }
}
