pub mod agent;
pub mod client;
pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod state;
pub mod types;

pub use agent::{AgentHandle, CallAgent, Command};
pub use client::Endpoint;
pub use connection::{RtcTransport, RtcTransportProvider};
pub use media::{CapturedMedia, LocalMedia, MediaProvider, TrackCapture};
pub use negotiator::{
    NegotiatorHandle, NegotiatorOp, PeerTransport, SessionNegotiator, TransportProvider,
    WorkerReport,
};
pub use state::Trigger;
pub use types::{
    CallEvent, CallState, ConnectionState, IceServerConfig, MediaConstraints, TransportEvent,
};
