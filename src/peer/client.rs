//! Endpoint side of the signaling link

use super::agent::{AgentHandle, CallAgent};
use super::media::MediaProvider;
use super::negotiator::TransportProvider;
use super::types::CallEvent;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::signaling::protocol::{ClientMessage, ServerMessage};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// A connected call endpoint: agent plus its WebSocket link
pub struct Endpoint {
    handle: AgentHandle,
    events: Option<UnboundedReceiver<CallEvent>>,
    agent: JoinHandle<()>,
    link: JoinHandle<()>,
}

impl Endpoint {
    pub async fn connect(
        config: ClientConfig,
        transports: Arc<dyn TransportProvider>,
        media: Arc<dyn MediaProvider>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let (ws, _) = connect_async(config.signaling_url.as_str()).await?;
        info!("Connected to signaling server {}", config.signaling_url);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (handle, events, agent) = CallAgent::spawn(config, transports, media, signal_tx);
        let link = tokio::spawn(run_link(ws, signal_rx, handle.clone()));

        Ok(Self {
            handle,
            events: Some(events),
            agent,
            link,
        })
    }

    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }

    /// Takes the UI event stream; `None` after the first call
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<CallEvent>> {
        self.events.take()
    }

    /// Ends any call, closes the link and waits for both tasks
    pub async fn shutdown(mut self) {
        let _ = self.handle.disconnect();
        let agent = &mut self.agent;
        let link = &mut self.link;
        if let Err(e) = agent.await {
            debug!("Agent task ended abnormally: {e}");
        }
        if let Err(e) = link.await {
            debug!("Link task ended abnormally: {e}");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.link.abort();
        self.agent.abort();
    }
}

/// Pumps frames both ways until either side closes
async fn run_link<S>(ws: S, mut outgoing: UnboundedReceiver<ClientMessage>, agent: AgentHandle)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    debug!("Agent closed the link");
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Signaling send failed: {e}");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if agent.deliver(msg).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Unreadable signaling frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling link error: {e}");
                    break;
                }
            },
        }
    }

    info!("Signaling link closed");
    let _ = agent.signaling_lost();
}
