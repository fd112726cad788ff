use crate::signaling::protocol::{IceCandidate, Peer, PeerId};
use serde::{Deserialize, Serialize};

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// What the endpoint asks of the camera and microphone
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Transport connection state as reported by the peer-to-peer provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from a transport, delivered in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack { id: String, kind: String },
}

/// Lifecycle state of the endpoint's call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    /// Offer sent, waiting for an answer
    Calling,
    /// Offer received, waiting for the local user
    Ringing,
    /// Descriptions exchanged, transport not up yet
    Connecting,
    Connected,
    /// Terminal; immediately followed by `Idle`
    Ended,
}

/// What the UI collaborator renders
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Users(Vec<Peer>),
    State(CallState),
    Incoming { from: PeerId, from_name: String },
    Status(String),
    RemoteTrack { id: String, kind: String },
}
