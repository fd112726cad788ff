//! Message relay between open signaling connections
//!
//! The relay only knows "send envelope X to peer Y". It never inspects call
//! state; delivery is fire-and-forget.

use super::protocol::{IceCandidate, PeerId, ServerMessage, SessionDescription};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Outbound half of one signaling connection
pub type Outbox = UnboundedSender<ServerMessage>;

/// Negotiation payloads the relay forwards
#[derive(Debug, Clone)]
pub enum Envelope {
    Offer {
        to: PeerId,
        from_name: String,
        offer: SessionDescription,
    },
    Answer {
        to: PeerId,
        answer: SessionDescription,
    },
    /// `to == None` keeps the broadcast behaviour of untagged candidates
    IceCandidate {
        to: Option<PeerId>,
        candidate: IceCandidate,
    },
    EndCall,
    CallRejected {
        to: PeerId,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::EndCall => "end-call",
            Self::CallRejected { .. } => "call-rejected",
        }
    }
}

/// Result of a route call; never reported back to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(usize),
    Dropped,
}

/// Open connections in accept order
#[derive(Default)]
pub struct Relay {
    connections: Vec<(PeerId, Outbox)>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, id: PeerId, outbox: Outbox) {
        self.close(&id);
        self.connections.push((id, outbox));
    }

    pub fn close(&mut self, id: &PeerId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|(peer, _)| peer != id);
        before != self.connections.len()
    }

    pub fn is_open(&self, id: &PeerId) -> bool {
        self.connections.iter().any(|(peer, _)| peer == id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Forwards `envelope` from `from` to its target(s)
    pub fn route(&self, from: &PeerId, envelope: Envelope) -> Delivery {
        let kind = envelope.kind();
        let delivery = match envelope {
            Envelope::Offer {
                to,
                from_name,
                offer,
            } => self.unicast(
                &to,
                ServerMessage::Offer {
                    from: from.clone(),
                    from_name,
                    offer,
                },
            ),
            Envelope::Answer { to, answer } => self.unicast(&to, ServerMessage::Answer { answer }),
            Envelope::IceCandidate { to, candidate } => {
                let msg = ServerMessage::IceCandidate {
                    from: from.clone(),
                    candidate,
                };
                match to {
                    Some(to) => self.unicast(&to, msg),
                    None => self.broadcast_except(from, msg),
                }
            }
            Envelope::EndCall => {
                self.broadcast_except(from, ServerMessage::CallEnded { from: from.clone() })
            }
            Envelope::CallRejected { to } => {
                self.unicast(&to, ServerMessage::CallRejected { from: from.clone() })
            }
        };

        debug!("Relay {kind} from {from}: {delivery:?}");
        delivery
    }

    /// Sends `msg` to every open connection
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        self.connections
            .iter()
            .filter(|(_, outbox)| outbox.send(msg.clone()).is_ok())
            .count()
    }

    /// Sends `msg` to one connection
    pub fn send_to(&self, to: &PeerId, msg: ServerMessage) -> Delivery {
        self.unicast(to, msg)
    }

    fn unicast(&self, to: &PeerId, msg: ServerMessage) -> Delivery {
        match self.connections.iter().find(|(peer, _)| peer == to) {
            Some((_, outbox)) if outbox.send(msg).is_ok() => Delivery::Delivered(1),
            _ => Delivery::Dropped,
        }
    }

    fn broadcast_except(&self, from: &PeerId, msg: ServerMessage) -> Delivery {
        let sent = self
            .connections
            .iter()
            .filter(|(peer, _)| peer != from)
            .filter(|(_, outbox)| outbox.send(msg.clone()).is_ok())
            .count();
        Delivery::Delivered(sent)
    }
}
