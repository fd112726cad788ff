//! Call agent: the endpoint's single dispatch loop
//!
//! UI commands, signaling messages, negotiator reports and timers all arrive
//! on one queue and are handled without awaiting. Anything that suspends
//! (media, offer/answer, candidates) runs in the session's negotiator worker,
//! whose reports come back tagged with the session epoch. Reports from an
//! older session are dropped.

use super::media::{LocalMedia, MediaProvider};
use super::negotiator::{NegotiatorHandle, NegotiatorOp, SessionNegotiator, TransportProvider, WorkerReport};
use super::state::{CallState, Trigger};
use super::types::{CallEvent, ConnectionState, TransportEvent};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::signaling::protocol::{ClientMessage, IceCandidate, Peer, PeerId, ServerMessage, SessionDescription};
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const STATUS_REQUESTING_MEDIA: &str = "Requesting camera and microphone access...";
pub const STATUS_MEDIA_GRANTED: &str = "Media access granted";
pub const STATUS_MEDIA_DENIED: &str = "Failed to access camera/microphone";
pub const STATUS_ACCEPTING: &str = "Accepting call...";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_RECOVERED: &str = "Connection recovered";
pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_CONNECTION_FAILED: &str = "Connection failed";
pub const STATUS_CREATE_FAILED: &str = "Failed to create call";
pub const STATUS_ACCEPT_FAILED: &str = "Failed to accept call";
pub const STATUS_CALL_ENDED: &str = "Call ended";
pub const STATUS_CALL_REJECTED: &str = "Call rejected";
pub const STATUS_PEER_LEFT: &str = "Peer left";
pub const STATUS_SERVER_LOST: &str = "Disconnected from server";

/// Requests from the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Call(PeerId),
    Accept,
    Reject,
    End,
    /// Ends any call and closes the signaling link
    Disconnect,
    ToggleAudio,
    ToggleVideo,
}

#[derive(Debug)]
enum AgentInput {
    Command(Command),
    Signal(ServerMessage),
    SignalingLost,
}

#[derive(Debug)]
enum Internal {
    Worker { epoch: u64, report: WorkerReport },
    /// Setup or reconnect timer fired
    GraceExpired { epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

struct CallSession {
    epoch: u64,
    peer: PeerId,
    peer_name: String,
    role: Role,
    negotiator: Option<NegotiatorHandle>,
    /// Offer held while ringing
    remote_offer: Option<SessionDescription>,
    /// Candidates that arrived while ringing
    pending_candidates: Vec<IceCandidate>,
    media: Option<Arc<dyn LocalMedia>>,
    /// The peer knows about this call (offer sent or offer received)
    engaged: bool,
    transport_connected: bool,
    /// Connect timeout while setting up, grace period after a disconnect
    grace: Option<JoinHandle<()>>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn new(epoch: u64, peer: PeerId, peer_name: String, role: Role) -> Self {
        Self {
            epoch,
            peer,
            peer_name,
            role,
            negotiator: None,
            remote_offer: None,
            pending_candidates: Vec::new(),
            media: None,
            engaged: role == Role::Callee,
            transport_connected: false,
            grace: None,
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    fn submit(&self, op: NegotiatorOp) {
        match &self.negotiator {
            Some(negotiator) if negotiator.submit(op) => {}
            _ => debug!("Negotiator for {} is gone, dropping op", self.peer),
        }
    }
}

/// Cloneable front door to a running [`CallAgent`]
#[derive(Clone)]
pub struct AgentHandle {
    tx: UnboundedSender<AgentInput>,
    state: watch::Receiver<CallState>,
}

impl AgentHandle {
    /// Registers under `name`; blank names are refused locally
    pub fn join(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidName);
        }
        self.command(Command::Join(name.to_owned()))
    }

    pub fn call(&self, peer: PeerId) -> Result<()> {
        self.command(Command::Call(peer))
    }

    pub fn accept(&self) -> Result<()> {
        self.command(Command::Accept)
    }

    pub fn reject(&self) -> Result<()> {
        self.command(Command::Reject)
    }

    pub fn end(&self) -> Result<()> {
        self.command(Command::End)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn toggle_audio(&self) -> Result<()> {
        self.command(Command::ToggleAudio)
    }

    pub fn toggle_video(&self) -> Result<()> {
        self.command(Command::ToggleVideo)
    }

    pub fn command(&self, command: Command) -> Result<()> {
        self.send(AgentInput::Command(command))
    }

    /// Hands a message received from the signaling server to the agent
    pub fn deliver(&self, msg: ServerMessage) -> Result<()> {
        self.send(AgentInput::Signal(msg))
    }

    /// The signaling link went away
    pub fn signaling_lost(&self) -> Result<()> {
        self.send(AgentInput::SignalingLost)
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    fn send(&self, input: AgentInput) -> Result<()> {
        self.tx.send(input).map_err(|_| Error::Closed)
    }
}

pub struct CallAgent {
    config: ClientConfig,
    transports: Arc<dyn TransportProvider>,
    media: Arc<dyn MediaProvider>,
    signal: Option<UnboundedSender<ClientMessage>>,
    internal: UnboundedSender<Internal>,
    events: UnboundedSender<CallEvent>,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    session: Option<CallSession>,
    users: Vec<Peer>,
    name: Option<String>,
    next_epoch: u64,
    audio_enabled: bool,
    video_enabled: bool,
}

impl CallAgent {
    /// Starts the agent. Outgoing signaling goes to `signal`; the agent drops
    /// that sender on disconnect, which tells the link owner to close.
    pub fn spawn(
        config: ClientConfig,
        transports: Arc<dyn TransportProvider>,
        media: Arc<dyn MediaProvider>,
        signal: UnboundedSender<ClientMessage>,
    ) -> (AgentHandle, UnboundedReceiver<CallEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let agent = CallAgent {
            config,
            transports,
            media,
            signal: Some(signal),
            internal,
            events,
            state: CallState::Idle,
            state_tx,
            session: None,
            users: Vec::new(),
            name: None,
            next_epoch: 0,
            audio_enabled: true,
            video_enabled: true,
        };
        let task = tokio::spawn(agent.run(rx, internal_rx));
        (AgentHandle { tx, state: state_rx }, events_rx, task)
    }

    async fn run(mut self, mut inputs: UnboundedReceiver<AgentInput>, mut internal: UnboundedReceiver<Internal>) {
        loop {
            let flow = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input),
                    None => ControlFlow::Break(()),
                },
                Some(msg) = internal.recv() => {
                    self.handle_internal(msg);
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        if self.state.is_active() {
            self.finish(Trigger::Disconnect, None);
        }
        debug!("Call agent stopped");
    }

    fn handle(&mut self, input: AgentInput) -> ControlFlow<()> {
        match input {
            AgentInput::Command(command) => return self.on_command(command),
            AgentInput::Signal(msg) => self.on_signal(msg),
            AgentInput::SignalingLost => {
                warn!("Signaling link lost");
                self.signal = None;
                if !self.finish(Trigger::Disconnect, Some(STATUS_SERVER_LOST)) {
                    self.status(STATUS_SERVER_LOST);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Join(name) => {
                info!("Joining as {name}");
                self.name = Some(name.clone());
                self.send_signal(ClientMessage::Join { name });
            }
            Command::Call(peer) => self.dial(peer),
            Command::Accept => self.accept(),
            Command::Reject => self.reject(),
            Command::End => {
                if self.state.is_active() {
                    self.send_signal(ClientMessage::EndCall);
                    self.finish(Trigger::LocalEnd, Some(STATUS_CALL_ENDED));
                }
            }
            Command::Disconnect => {
                if self.state.is_active() {
                    self.send_signal(ClientMessage::EndCall);
                }
                self.finish(Trigger::Disconnect, Some(STATUS_DISCONNECTED));
                // dropping the sender closes the link
                self.signal = None;
                info!("Disconnected from signaling");
                return ControlFlow::Break(());
            }
            Command::ToggleAudio => {
                self.audio_enabled = !self.audio_enabled;
                if let Some(media) = self.session.as_ref().and_then(|s| s.media.as_ref()) {
                    media.set_audio_enabled(self.audio_enabled);
                }
                self.status(if self.audio_enabled { "Microphone on" } else { "Microphone muted" });
            }
            Command::ToggleVideo => {
                self.video_enabled = !self.video_enabled;
                if let Some(media) = self.session.as_ref().and_then(|s| s.media.as_ref()) {
                    media.set_video_enabled(self.video_enabled);
                }
                self.status(if self.video_enabled { "Camera on" } else { "Camera off" });
            }
        }
        ControlFlow::Continue(())
    }

    fn dial(&mut self, peer: PeerId) {
        if !self.transition(Trigger::Dial) {
            warn!("Cannot call {peer} while {:?}", self.state);
            return;
        }
        let peer_name = self.name_of(&peer);
        info!("Calling {peer_name} ({peer})");

        let mut session = CallSession::new(self.bump_epoch(), peer, peer_name, Role::Caller);
        session.negotiator = Some(self.spawn_negotiator(session.epoch));
        session.submit(NegotiatorOp::Offer);
        self.session = Some(session);
        self.status(STATUS_REQUESTING_MEDIA);
    }

    fn accept(&mut self) {
        if !self.transition(Trigger::Accept) {
            return;
        }
        let Some(epoch) = self.current_epoch() else {
            return;
        };
        let negotiator = self.spawn_negotiator(epoch);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        info!("Accepting call from {}", session.peer_name);

        session.negotiator = Some(negotiator);
        match session.remote_offer.take() {
            Some(offer) => session.submit(NegotiatorOp::Answer(offer)),
            None => warn!("Accepted a call without an offer"),
        }
        for candidate in std::mem::take(&mut session.pending_candidates) {
            session.submit(NegotiatorOp::Candidate(candidate));
        }
        self.arm_timer(self.config.connect_timeout());
        self.status(STATUS_ACCEPTING);
    }

    fn reject(&mut self) {
        if !self.transition(Trigger::Reject) {
            return;
        }
        if let Some(session) = self.session.take() {
            info!("Rejecting call from {}", session.peer_name);
            self.send_signal(ClientMessage::CallRejected { to: session.peer });
        }
    }

    fn on_signal(&mut self, msg: ServerMessage) {
        debug!("Signaling message: {}", msg.kind());
        match msg {
            ServerMessage::Users { list } => {
                if let Some(session) = &self.session {
                    let pending = matches!(
                        self.state,
                        CallState::Calling | CallState::Ringing | CallState::Connecting
                    );
                    let was_listed = self.users.iter().any(|p| p.id == session.peer);
                    let still_listed = list.iter().any(|p| p.id == session.peer);
                    if pending && was_listed && !still_listed {
                        info!("{} left before the call was set up", session.peer_name);
                        self.finish(Trigger::RemoteEnd, Some(STATUS_PEER_LEFT));
                    }
                }
                self.users = list.clone();
                self.emit(CallEvent::Users(list));
            }
            ServerMessage::Offer { from, from_name, offer } => {
                if self.state.on(Trigger::IncomingOffer).is_none() {
                    info!("Busy, turning down offer from {from_name} ({from})");
                    self.send_signal(ClientMessage::CallRejected { to: from });
                    return;
                }
                self.transition(Trigger::IncomingOffer);
                info!("Incoming call from {from_name} ({from})");

                let name = if from_name.is_empty() { self.name_of(&from) } else { from_name.clone() };
                let mut session = CallSession::new(self.bump_epoch(), from.clone(), name, Role::Callee);
                session.remote_offer = Some(offer);
                self.session = Some(session);
                self.emit(CallEvent::Incoming { from, from_name });
            }
            ServerMessage::Answer { answer } => {
                if !self.transition(Trigger::RemoteAnswer) {
                    debug!("Ignoring answer while {:?}", self.state);
                    return;
                }
                if let Some(session) = &self.session {
                    session.submit(NegotiatorOp::RemoteAnswer(answer));
                }
                self.arm_timer(self.config.connect_timeout());
                self.status(STATUS_CONNECTING);
            }
            ServerMessage::IceCandidate { from, candidate } => match self.session.as_mut() {
                Some(session) if session.peer == from => {
                    if session.negotiator.is_some() {
                        session.submit(NegotiatorOp::Candidate(candidate));
                    } else {
                        session.pending_candidates.push(candidate);
                    }
                }
                _ => debug!("Dropping candidate from {from}: not the session peer"),
            },
            ServerMessage::CallEnded { from } => {
                if self.is_session_peer(&from) {
                    info!("Remote ended the call");
                    self.finish(Trigger::RemoteEnd, Some(STATUS_CALL_ENDED));
                }
            }
            ServerMessage::CallRejected { from } => {
                if self.is_session_peer(&from) {
                    info!("Call rejected by {from}");
                    self.finish(Trigger::RemoteReject, Some(STATUS_CALL_REJECTED));
                }
            }
            ServerMessage::Error { message } => {
                warn!("Server reported an error: {message}");
                self.status(format!("Server error: {message}"));
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Worker { epoch, report } => {
                if self.current_epoch() != Some(epoch) {
                    debug!("Dropping stale report from session {epoch}: {report:?}");
                    return;
                }
                self.on_report(report);
            }
            Internal::GraceExpired { epoch } => {
                let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
                    return;
                };
                session.grace = None;
                if session.transport_connected {
                    debug!("Transport came up before the timer fired");
                    return;
                }
                warn!("Transport still down when the timer fired ({:?})", self.state);
                self.fail(STATUS_CONNECTION_FAILED);
            }
        }
    }

    fn on_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Ready(media) => {
                media.set_audio_enabled(self.audio_enabled);
                media.set_video_enabled(self.video_enabled);
                if let Some(session) = self.session.as_mut() {
                    session.media = Some(media);
                }
                self.status(STATUS_MEDIA_GRANTED);
            }
            WorkerReport::OfferCreated(offer) => {
                let Some(session) = self.session.as_mut() else { return };
                session.engaged = true;
                let msg = ClientMessage::Offer {
                    to: session.peer.clone(),
                    offer,
                    from_name: self.name.clone().unwrap_or_default(),
                };
                let status = format!("Calling {}...", session.peer_name);
                self.send_signal(msg);
                self.status(status);
            }
            WorkerReport::AnswerCreated(answer) => {
                let Some(session) = &self.session else { return };
                let msg = ClientMessage::Answer {
                    to: session.peer.clone(),
                    answer,
                };
                self.send_signal(msg);
                self.status(STATUS_CONNECTING);
            }
            WorkerReport::RemoteAnswerApplied => debug!("Remote answer applied"),
            WorkerReport::Transport(event) => self.on_transport(event),
            WorkerReport::MediaDenied(reason) => {
                warn!("Media access denied: {reason}");
                self.fail(STATUS_MEDIA_DENIED);
            }
            WorkerReport::Failed { op, reason } => {
                warn!("Negotiation step {op} failed: {reason}");
                let status = match op {
                    "offer" => STATUS_CREATE_FAILED,
                    "answer" => STATUS_ACCEPT_FAILED,
                    _ => STATUS_CONNECTION_FAILED,
                };
                self.fail(status);
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(session) = &self.session {
                    let msg = ClientMessage::IceCandidate {
                        candidate,
                        to: Some(session.peer.clone()),
                    };
                    self.send_signal(msg);
                }
            }
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                let was_connected = self.state == CallState::Connected;
                if let Some(session) = self.session.as_mut() {
                    session.transport_connected = true;
                    if let Some(grace) = session.grace.take() {
                        grace.abort();
                    }
                }
                if self.transition(Trigger::TransportConnected) {
                    if let Some(session) = self.session.as_mut() {
                        session.connected_at.get_or_insert_with(Utc::now);
                    }
                    self.status(if was_connected { STATUS_RECOVERED } else { STATUS_CONNECTED });
                }
            }
            TransportEvent::StateChanged(ConnectionState::Disconnected) => {
                let Some(session) = self.session.as_mut() else { return };
                session.transport_connected = false;
                let grace_period = self.config.grace_period();
                if self.arm_timer(grace_period) {
                    info!("Transport disconnected, grace period {}s", grace_period.as_secs());
                    self.status(STATUS_DISCONNECTED);
                }
            }
            TransportEvent::StateChanged(ConnectionState::Failed) => {
                warn!("Transport failed");
                self.fail(STATUS_CONNECTION_FAILED);
            }
            TransportEvent::StateChanged(state) => debug!("Transport state {state:?}"),
            TransportEvent::RemoteTrack { id, kind } => {
                self.emit(CallEvent::RemoteTrack { id, kind });
            }
        }
    }

    /// Starts the session timer; false when one is already running. On expiry
    /// the call fails unless the transport is connected by then.
    fn arm_timer(&mut self, period: Duration) -> bool {
        let internal = self.internal.clone();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.grace.is_some() {
            debug!("Session timer already running");
            return false;
        }
        let epoch = session.epoch;
        session.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = internal.send(Internal::GraceExpired { epoch });
        }));
        true
    }

    /// Ends the call after a local failure and tells the peer if it knows about it
    fn fail(&mut self, status: &str) {
        if self.session.as_ref().is_some_and(|s| s.engaged) {
            self.send_signal(ClientMessage::EndCall);
        }
        self.finish(Trigger::Failure, Some(status));
    }

    /// Ended → Idle with teardown; false when the trigger is not legal now
    fn finish(&mut self, trigger: Trigger, status: Option<&str>) -> bool {
        if !self.transition(trigger) {
            return false;
        }
        self.teardown();
        if let Some(status) = status {
            self.status(status);
        }
        self.set_state(CallState::Idle);
        true
    }

    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(grace) = session.grace.take() {
            grace.abort();
        }
        // cancels in-flight work; the worker closes transport and media
        session.negotiator = None;
        session.pending_candidates.clear();

        match session.connected_at {
            Some(connected_at) => {
                let lasted = Utc::now() - connected_at;
                info!(
                    "Call with {} ({:?}) ended after {}s",
                    session.peer_name,
                    session.role,
                    lasted.num_seconds()
                );
            }
            None => info!(
                "Call attempt with {} ({:?}) ended after {}ms without connecting",
                session.peer_name,
                session.role,
                (Utc::now() - session.started_at).num_milliseconds()
            ),
        }
    }

    fn transition(&mut self, trigger: Trigger) -> bool {
        match self.state.on(trigger) {
            Some(next) => {
                self.set_state(next);
                true
            }
            None => {
                debug!("Ignoring {trigger:?} while {:?}", self.state);
                false
            }
        }
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        debug!("Call state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(CallEvent::State(next));
    }

    fn spawn_negotiator(&self, epoch: u64) -> NegotiatorHandle {
        let negotiator = SessionNegotiator::new(
            self.transports.clone(),
            self.media.clone(),
            self.config.ice_servers.clone(),
            self.config.media.clone(),
        );
        let internal = self.internal.clone();
        NegotiatorHandle::spawn(negotiator, move |report| {
            let _ = internal.send(Internal::Worker { epoch, report });
        })
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn current_epoch(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.epoch)
    }

    fn is_session_peer(&self, peer: &PeerId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.peer == peer)
    }

    fn name_of(&self, peer: &PeerId) -> String {
        self.users
            .iter()
            .find(|p| &p.id == peer)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| peer.to_string())
    }

    fn send_signal(&self, msg: ClientMessage) {
        match &self.signal {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!("Signaling link closed, message dropped");
                }
            }
            None => debug!("No signaling link, dropping {msg:?}"),
        }
    }

    fn status(&self, status: impl Into<String>) {
        let status = status.into();
        info!("Status: {status}");
        self.emit(CallEvent::Status(status));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
