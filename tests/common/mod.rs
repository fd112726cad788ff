#![allow(dead_code)]

use async_trait::async_trait;
use peercall_lib::config::ClientConfig;
use peercall_lib::peer::{
    AgentHandle, CallAgent, CallEvent, CallState, ConnectionState, IceServerConfig, LocalMedia,
    MediaConstraints, MediaProvider, PeerTransport, TransportEvent, TransportProvider,
};
use peercall_lib::signaling::{ClientMessage, HubHandle, IceCandidate, PeerId, SessionDescription};
use peercall_lib::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use webrtc::track::track_local::TrackLocal;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> ClientConfig {
    ClientConfig {
        ice_servers: Vec::new(),
        grace_period_secs: 1,
        connect_timeout_secs: 2,
        ..Default::default()
    }
}

/// Records what the agent did to its transports
#[derive(Default)]
pub struct TransportLog {
    pub label: String,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    /// Report Connected once both descriptions are in place
    pub auto_connect: bool,
    events: Mutex<Option<UnboundedSender<TransportEvent>>>,
}

impl TransportLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Pushes an event as if the latest transport raised it
    pub fn inject(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("no transport created yet")
            .send(event)
            .expect("agent dropped transport events");
    }
}

pub struct MockTransports(pub Arc<TransportLog>);

impl MockTransports {
    pub fn new(label: &str, auto_connect: bool) -> (Arc<Self>, Arc<TransportLog>) {
        let log = Arc::new(TransportLog {
            label: label.to_string(),
            auto_connect,
            ..Default::default()
        });
        (Arc::new(Self(log.clone())), log)
    }
}

#[async_trait]
impl TransportProvider for MockTransports {
    async fn connect(
        &self,
        _: &[IceServerConfig],
        _: Arc<dyn LocalMedia>,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.events.lock().unwrap() = Some(events.clone());
        Ok(Box::new(MockTransport {
            log: self.0.clone(),
            events,
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
        }))
    }
}

struct MockTransport {
    log: Arc<TransportLog>,
    events: UnboundedSender<TransportEvent>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
}

impl MockTransport {
    fn record(&self, call: String) {
        self.log.calls.lock().unwrap().push(call);
    }

    fn local_set(&self) {
        self.has_local.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{}", self.log.label),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        if self.log.auto_connect
            && self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
        {
            let _ = self
                .events
                .send(TransportEvent::StateChanged(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("offer".into());
        self.local_set();
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.log.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("answer".into());
        self.local_set();
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.log.label)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("remote:{}", desc.sdp));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(format!("cand:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaLog {
    pub acquires: AtomicUsize,
    pub stops: AtomicUsize,
    pub audio: AtomicBool,
    pub video: AtomicBool,
}

impl MediaLog {
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Media provider that can deny access or hold acquisition until released
pub struct MockMedia {
    pub log: Arc<MediaLog>,
    pub deny: bool,
    pub gate: Option<Arc<Semaphore>>,
}

impl MockMedia {
    pub fn granted() -> (Arc<Self>, Arc<MediaLog>) {
        Self::build(false, None)
    }

    pub fn denied() -> (Arc<Self>, Arc<MediaLog>) {
        Self::build(true, None)
    }

    pub fn gated(gate: Arc<Semaphore>) -> (Arc<Self>, Arc<MediaLog>) {
        Self::build(false, Some(gate))
    }

    fn build(deny: bool, gate: Option<Arc<Semaphore>>) -> (Arc<Self>, Arc<MediaLog>) {
        let log = Arc::new(MediaLog::default());
        (
            Arc::new(Self {
                log: log.clone(),
                deny,
                gate,
            }),
            log,
        )
    }
}

#[async_trait]
impl MediaProvider for MockMedia {
    async fn acquire(&self, _: &MediaConstraints) -> Result<Arc<dyn LocalMedia>> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.deny {
            return Err(Error::MediaAccess("permission denied".into()));
        }
        self.log.acquires.fetch_add(1, Ordering::SeqCst);
        self.log.audio.store(true, Ordering::SeqCst);
        self.log.video.store(true, Ordering::SeqCst);
        Ok(Arc::new(MockLocalMedia(self.log.clone())))
    }
}

struct MockLocalMedia(Arc<MediaLog>);

impl LocalMedia for MockLocalMedia {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        Vec::new()
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.0.audio.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.0.video.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.0.audio.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.0.video.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Agent whose outgoing signaling is captured instead of sent anywhere
pub struct Bare {
    pub handle: AgentHandle,
    pub events: UnboundedReceiver<CallEvent>,
    pub signal: UnboundedReceiver<ClientMessage>,
}

pub fn bare_agent(transports: Arc<MockTransports>, media: Arc<MockMedia>) -> Bare {
    let (signal_tx, signal) = mpsc::unbounded_channel();
    let (handle, events, _task) = CallAgent::spawn(test_config(), transports, media, signal_tx);
    Bare {
        handle,
        events,
        signal,
    }
}

/// Agent wired to an in-process hub
pub struct Attached {
    pub id: PeerId,
    pub handle: AgentHandle,
    pub events: UnboundedReceiver<CallEvent>,
}

pub fn attach(hub: &HubHandle, transports: Arc<MockTransports>, media: Arc<MockMedia>) -> Attached {
    let (id, mut inbox) = hub.open();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (handle, events, _task) = CallAgent::spawn(test_config(), transports, media, signal_tx);

    let out_hub = hub.clone();
    let out_id = id.clone();
    tokio::spawn(async move {
        while let Some(msg) = signal_rx.recv().await {
            out_hub.send(&out_id, msg);
        }
        out_hub.close(&out_id);
    });

    let deliver = handle.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            if deliver.deliver(msg).is_err() {
                break;
            }
        }
    });

    Attached { id, handle, events }
}

pub async fn wait_state(handle: &AgentHandle, want: CallState) {
    let mut rx = handle.watch_state();
    timeout(WAIT, rx.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .expect("agent stopped");
}

/// Drains events until one matches
pub async fn wait_event<F>(events: &mut UnboundedReceiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_status(events: &mut UnboundedReceiver<CallEvent>, status: &str) {
    wait_event(events, |e| matches!(e, CallEvent::Status(s) if s == status)).await;
}

/// Drains outgoing signaling until one matches
pub async fn wait_signal<F>(signal: &mut UnboundedReceiver<ClientMessage>, mut pred: F) -> ClientMessage
where
    F: FnMut(&ClientMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            let msg = signal.recv().await.expect("signal stream closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for signaling message")
}

/// Whatever outgoing signaling is queued right now
pub fn drain_signal(signal: &mut UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = signal.try_recv() {
        out.push(msg);
    }
    out
}

pub async fn eventually<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(WAIT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
