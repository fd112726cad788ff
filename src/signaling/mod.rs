//! Server side: directory, relay and the websocket front end

pub mod directory;
pub mod hub;
pub mod protocol;
pub mod relay;
pub mod server;

pub use directory::Directory;
pub use hub::{Hub, HubEvent, HubHandle};
pub use protocol::{
    ClientMessage, IceCandidate, Peer, PeerId, SdpKind, ServerMessage, SessionDescription,
};
pub use relay::{Delivery, Envelope, Relay};
pub use server::{SignalingServer, HEALTH_MESSAGE};
