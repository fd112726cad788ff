//! Wire protocol shared by the signaling server and call endpoints
//!
//! Every frame is a JSON text message tagged by `type`. Field names follow the
//! browser shapes (`fromName`, `sdpMid`, ...) so a web client can speak the
//! protocol without translation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque connection identifier assigned by the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

/// Directory entry as seen by clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (`RTCSessionDescriptionInit` shape)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
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

/// ICE candidate (`RTCIceCandidateInit` shape)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Frames sent by an endpoint to the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        name: String,
    },
    Offer {
        to: PeerId,
        offer: SessionDescription,
        #[serde(rename = "fromName")]
        from_name: String,
    },
    Answer {
        to: PeerId,
        answer: SessionDescription,
    },
    /// Untagged candidates are broadcast to every other connection
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    EndCall,
    CallRejected {
        to: PeerId,
    },
}

/// Frames sent by the server to an endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Users {
        list: Vec<Peer>,
    },
    Offer {
        from: PeerId,
        #[serde(rename = "fromName")]
        from_name: String,
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    CallEnded {
        from: PeerId,
    },
    CallRejected {
        from: PeerId,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Users { .. } => "users",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
            Self::CallRejected { .. } => "call-rejected",
            Self::Error { .. } => "error",
        }
    }
}
