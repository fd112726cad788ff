//! Single-writer hub owning the directory and the relay
//!
//! Connection tasks never touch shared state; they post `HubEvent`s and the
//! hub applies them one at a time. Events from one connection arrive in the
//! order that connection posted them.

use super::directory::Directory;
use super::protocol::{ClientMessage, PeerId, ServerMessage};
use super::relay::{Envelope, Outbox, Relay};
use crate::utils::random_id;
use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum HubEvent {
    Opened { peer: PeerId, outbox: Outbox },
    Message { peer: PeerId, msg: ClientMessage },
    /// Frame from `peer` that could not be decoded
    Invalid { peer: PeerId, reason: String },
    Closed { peer: PeerId },
}

#[derive(Default)]
pub struct Hub {
    directory: Directory,
    relay: Relay,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Applies one event; never blocks
    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Opened { peer, outbox } => {
                debug!("Connection opened: {peer} (open: {})", self.relay.len() + 1);
                self.relay.open(peer, outbox);
            }
            HubEvent::Message { peer, msg } => self.on_message(peer, msg),
            HubEvent::Invalid { peer, reason } => {
                self.relay.send_to(&peer, ServerMessage::Error { message: reason });
            }
            HubEvent::Closed { peer } => {
                self.relay.close(&peer);
                match self.directory.remove(&peer) {
                    Some(entry) => {
                        let online = Utc::now() - entry.joined_at;
                        info!(
                            "User {} disconnected: {peer} (online {}s)",
                            entry.peer.name,
                            online.num_seconds()
                        );
                        self.broadcast_users();
                    }
                    None => debug!("Connection closed before join: {peer}"),
                }
            }
        }
    }

    fn on_message(&mut self, from: PeerId, msg: ClientMessage) {
        if !self.relay.is_open(&from) {
            warn!("Message from unknown connection {from}, ignoring");
            return;
        }

        let envelope = match msg {
            ClientMessage::Join { name } => {
                info!("User {name} joined with ID: {from}");
                self.directory.register(from, name);
                self.broadcast_users();
                return;
            }
            ClientMessage::Offer {
                to,
                offer,
                from_name,
            } => Envelope::Offer {
                to,
                from_name,
                offer,
            },
            ClientMessage::Answer { to, answer } => Envelope::Answer { to, answer },
            ClientMessage::IceCandidate { candidate, to } => Envelope::IceCandidate { to, candidate },
            ClientMessage::EndCall => {
                info!("Call ended by {from}");
                Envelope::EndCall
            }
            ClientMessage::CallRejected { to } => Envelope::CallRejected { to },
        };

        self.relay.route(&from, envelope);
    }

    fn broadcast_users(&self) {
        let msg = ServerMessage::Users {
            list: self.directory.snapshot(),
        };
        let sent = self.relay.broadcast(&msg);
        debug!(
            "Broadcast users ({} joined) to {sent} connections",
            self.directory.len()
        );
    }

    /// Runs the hub until every handle is dropped
    pub async fn run(mut self, mut events: UnboundedReceiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("Hub stopped");
    }

    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Hub::new().run(rx));
        (HubHandle { tx }, task)
    }
}

/// Cloneable entry point used by connection tasks
#[derive(Clone)]
pub struct HubHandle {
    tx: UnboundedSender<HubEvent>,
}

impl HubHandle {
    /// Registers a new connection and returns its id and inbound queue
    pub fn open(&self) -> (PeerId, UnboundedReceiver<ServerMessage>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let peer = PeerId::new(random_id());
        self.post(HubEvent::Opened {
            peer: peer.clone(),
            outbox,
        });
        (peer, inbox)
    }

    pub fn send(&self, peer: &PeerId, msg: ClientMessage) {
        self.post(HubEvent::Message {
            peer: peer.clone(),
            msg,
        });
    }

    pub fn invalid(&self, peer: &PeerId, reason: String) {
        self.post(HubEvent::Invalid {
            peer: peer.clone(),
            reason,
        });
    }

    pub fn close(&self, peer: &PeerId) {
        self.post(HubEvent::Closed { peer: peer.clone() });
    }

    fn post(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            warn!("Hub is gone, event dropped");
        }
    }
}
