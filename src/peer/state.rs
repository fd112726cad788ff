//! Call transition table
//!
//! Every state change of a call goes through [`CallState::on`]. The agent
//! only performs side effects for transitions this table allows.

pub use super::types::CallState;

/// Inputs that may move a call between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Local user calls a peer
    Dial,
    /// Offer arrived from a peer
    IncomingOffer,
    Accept,
    Reject,
    /// Answer to our offer arrived
    RemoteAnswer,
    TransportConnected,
    /// `call-ended` from the session peer
    RemoteEnd,
    /// Callee turned our offer down
    RemoteReject,
    LocalEnd,
    /// Transport failed, negotiation failed or media was denied
    Failure,
    /// Local disconnect or loss of the signaling link
    Disconnect,
}

impl CallState {
    /// Next state for `trigger`, or `None` when the trigger is not legal here
    pub fn on(self, trigger: Trigger) -> Option<CallState> {
        use CallState::*;
        use Trigger::*;

        match (self, trigger) {
            (Idle, Dial) => Some(Calling),
            (Idle, IncomingOffer) => Some(Ringing),
            (Ringing, Accept) => Some(Connecting),
            (Ringing, Reject) => Some(Idle),
            (Calling, RemoteAnswer) => Some(Connecting),
            (Connecting | Connected, TransportConnected) => Some(Connected),
            (Calling, RemoteReject) => Some(Ended),
            (Calling | Ringing | Connecting | Connected, RemoteEnd | LocalEnd | Failure | Disconnect) => {
                Some(Ended)
            }
            _ => None,
        }
    }

    /// A call attempt exists in this state
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connecting | CallState::Connected
        )
    }
}
