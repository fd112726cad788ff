//! Session negotiator for one call attempt
//!
//! Owns the transport and local media of a call. Remote candidates that arrive
//! before the remote description are buffered and flushed, in receipt order,
//! right after it is applied. Runs inside a worker task so the agent never
//! waits on negotiation; dropping the [`NegotiatorHandle`] cancels whatever
//! step is in flight and closes the negotiator.

use super::media::{LocalMedia, MediaProvider};
use super::types::{IceServerConfig, MediaConstraints, TransportEvent};
use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One peer-to-peer transport attempt (an `RTCPeerConnection` or a stand-in)
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;
    /// Creates an answer and installs it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Factory for transports; callbacks flow back through `events`
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        media: Arc<dyn LocalMedia>,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>>;
}

pub struct SessionNegotiator {
    transports: Arc<dyn TransportProvider>,
    media_source: Arc<dyn MediaProvider>,
    ice_servers: Vec<IceServerConfig>,
    constraints: MediaConstraints,
    transport: Option<Box<dyn PeerTransport>>,
    media: Option<Arc<dyn LocalMedia>>,
    remote_set: bool,
    pending: Vec<IceCandidate>,
    closed: bool,
}

impl SessionNegotiator {
    pub fn new(
        transports: Arc<dyn TransportProvider>,
        media_source: Arc<dyn MediaProvider>,
        ice_servers: Vec<IceServerConfig>,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            transports,
            media_source,
            ice_servers,
            constraints,
            transport: None,
            media: None,
            remote_set: false,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Acquires local media, then builds the transport around it
    pub async fn start(
        &mut self,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn LocalMedia>> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.transport.is_some() {
            return Err(Error::InvalidState("negotiator already started"));
        }

        let media = self
            .media_source
            .acquire(&self.constraints)
            .await
            .map_err(|e| match e {
                Error::MediaAccess(_) => e,
                other => Error::MediaAccess(other.to_string()),
            })?;
        // held before connect so close() releases it if connect fails
        self.media = Some(media.clone());

        let transport = self
            .transports
            .connect(&self.ice_servers, media.clone(), events)
            .await?;
        self.transport = Some(transport);
        Ok(media)
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.transport()?.create_offer().await
    }

    /// Applies the remote offer, flushes buffered candidates, answers
    pub async fn create_answer(&mut self, remote_offer: SessionDescription) -> Result<SessionDescription> {
        self.set_remote(remote_offer).await?;
        self.transport()?.create_answer().await
    }

    pub async fn apply_remote_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.set_remote(answer).await
    }

    /// Buffers until the remote description exists; rejected candidates are only logged
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.remote_set || self.transport.is_none() {
            self.pending.push(candidate);
            debug!(
                "Remote description not set yet, queued candidate ({} pending)",
                self.pending.len()
            );
            return Ok(());
        }
        self.apply_candidate(candidate).await;
        Ok(())
    }

    /// Releases transport and media; safe to call repeatedly
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport: {e}");
            }
        }
        if let Some(media) = self.media.take() {
            media.stop();
        }
        debug!("Negotiator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn transport(&self) -> Result<&dyn PeerTransport> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.transport
            .as_deref()
            .ok_or(Error::InvalidState("transport not started"))
    }

    async fn set_remote(&mut self, desc: SessionDescription) -> Result<()> {
        self.transport()?.set_remote_description(desc).await?;
        self.remote_set = true;

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            info!("Applying {} buffered remote candidates", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        dump_candidate("REMOTE", &candidate);
        let Some(transport) = self.transport.as_deref() else {
            return;
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate: {e}");
        }
    }

    async fn apply(&mut self, op: NegotiatorOp) -> Option<WorkerReport> {
        match op {
            NegotiatorOp::Offer => Some(match self.create_offer().await {
                Ok(offer) => WorkerReport::OfferCreated(offer),
                Err(e) => WorkerReport::Failed {
                    op: "offer",
                    reason: e.to_string(),
                },
            }),
            NegotiatorOp::Answer(remote_offer) => Some(match self.create_answer(remote_offer).await {
                Ok(answer) => WorkerReport::AnswerCreated(answer),
                Err(e) => WorkerReport::Failed {
                    op: "answer",
                    reason: e.to_string(),
                },
            }),
            NegotiatorOp::RemoteAnswer(answer) => Some(match self.apply_remote_answer(answer).await {
                Ok(()) => WorkerReport::RemoteAnswerApplied,
                Err(e) => WorkerReport::Failed {
                    op: "remote-answer",
                    reason: e.to_string(),
                },
            }),
            NegotiatorOp::Candidate(candidate) => {
                if let Err(e) = self.add_remote_candidate(candidate).await {
                    debug!("Candidate dropped: {e}");
                }
                None
            }
        }
    }
}

/// Work queued for the negotiator, executed in order
#[derive(Debug, Clone)]
pub enum NegotiatorOp {
    Offer,
    Answer(SessionDescription),
    RemoteAnswer(SessionDescription),
    Candidate(IceCandidate),
}

/// What the worker tells its owner
#[derive(Clone)]
pub enum WorkerReport {
    Ready(Arc<dyn LocalMedia>),
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    RemoteAnswerApplied,
    Transport(TransportEvent),
    MediaDenied(String),
    Failed { op: &'static str, reason: String },
}

impl std::fmt::Debug for WorkerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Ready"),
            Self::OfferCreated(_) => f.write_str("OfferCreated"),
            Self::AnswerCreated(_) => f.write_str("AnswerCreated"),
            Self::RemoteAnswerApplied => f.write_str("RemoteAnswerApplied"),
            Self::Transport(event) => write!(f, "Transport({event:?})"),
            Self::MediaDenied(reason) => write!(f, "MediaDenied({reason})"),
            Self::Failed { op, reason } => write!(f, "Failed({op}: {reason})"),
        }
    }
}

/// Owner side of a negotiator worker; dropping it cancels and closes
pub struct NegotiatorHandle {
    ops: UnboundedSender<NegotiatorOp>,
    _cancel: oneshot::Sender<()>,
}

impl NegotiatorHandle {
    pub fn spawn<F>(negotiator: SessionNegotiator, report: F) -> Self
    where
        F: Fn(WorkerReport) + Send + 'static,
    {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        tokio::spawn(run_worker(negotiator, ops_rx, cancel_rx, report));
        Self {
            ops,
            _cancel: cancel,
        }
    }

    pub fn submit(&self, op: NegotiatorOp) -> bool {
        self.ops.send(op).is_ok()
    }
}

async fn run_worker<F>(
    mut negotiator: SessionNegotiator,
    mut ops: UnboundedReceiver<NegotiatorOp>,
    mut cancel: oneshot::Receiver<()>,
    report: F,
) where
    F: Fn(WorkerReport) + Send + 'static,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let started = tokio::select! {
        biased;
        _ = &mut cancel => None,
        started = negotiator.start(events_tx) => Some(started),
    };

    match started {
        None => debug!("Negotiation cancelled before transport was ready"),
        Some(Err(Error::MediaAccess(reason))) => report(WorkerReport::MediaDenied(reason)),
        Some(Err(e)) => report(WorkerReport::Failed {
            op: "start",
            reason: e.to_string(),
        }),
        Some(Ok(media)) => {
            report(WorkerReport::Ready(media));
            'ops: loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    Some(event) = events.recv() => report(WorkerReport::Transport(event)),
                    op = ops.recv() => {
                        let Some(op) = op else { break };
                        tokio::select! {
                            biased;
                            _ = &mut cancel => break 'ops,
                            outcome = negotiator.apply(op) => {
                                if let Some(outcome) = outcome {
                                    report(outcome);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    negotiator.close().await;
}
