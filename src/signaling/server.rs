//! WebSocket signaling server
//!
//! One reader task and one writer task per connection. Readers decode frames
//! and post them to the hub; writers drain the connection's outbox. Plain
//! HTTP requests that do not ask for an upgrade get a small health reply.

use super::hub::{Hub, HubHandle};
use super::protocol::ClientMessage;
use crate::config::{ServerConfig, DEFAULT_PORT};
use crate::error::Result;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tracing::{debug, error, info, warn};

pub const HEALTH_MESSAGE: &str = "WebRTC Signaling Server is running!";

/// How long open connections get to close once shutdown starts
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a client may take to send its request head
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_HEAD_LIMIT: usize = 4096;

pub struct SignalingServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl SignalingServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config
            .bind
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` resolves, then closes every open
    /// socket and waits for the hub to stop
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("WebRTC Signaling Server running on {addr}");

        let Self { listener, config } = self;
        let (hub, hub_task) = Hub::spawn();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let hub = hub.clone();
                        let config = Arc::clone(&config);
                        let stop = stop_rx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, remote, hub, config, stop).await {
                                debug!("Connection {remote} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                },
                Some(_) = connections.join_next() => {}
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        debug!("Closing {} open connections", connections.len());
        let drained = timeout(SHUTDOWN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!("{} connections did not close in time, aborting", connections.len());
            connections.shutdown().await;
        }

        // the hub stops once the last handle is gone
        drop(hub);
        if timeout(SHUTDOWN_TIMEOUT, hub_task).await.is_err() {
            warn!("Hub did not stop in time");
        }
        info!("Server closed.");
        Ok(())
    }
}

struct RequestHead {
    request_line: String,
    upgrade: bool,
    len: usize,
}

/// Waits for the request head without consuming it
async fn peek_head(stream: &TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = vec![0u8; REQUEST_HEAD_LIMIT];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let head = &buf[..n];
        let end = head.windows(4).position(|w| w == b"\r\n\r\n");
        if end.is_some() || n == buf.len() {
            let len = end.map_or(n, |at| at + 4);
            let text = String::from_utf8_lossy(&head[..len]);
            let mut lines = text.lines();
            let request_line = lines.next().unwrap_or_default().to_string();
            let upgrade = lines.any(|line| {
                line.split_once(':').is_some_and(|(name, value)| {
                    name.trim().eq_ignore_ascii_case("upgrade")
                        && value.to_ascii_lowercase().contains("websocket")
                })
            });
            return Ok(Some(RequestHead {
                request_line,
                upgrade,
                len,
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Answers a plain HTTP request: health on `GET /`, 404 for anything else
async fn reply_http(mut stream: TcpStream, head: RequestHead) -> Result<()> {
    let mut consumed = vec![0u8; head.len];
    stream.read_exact(&mut consumed).await?;

    let mut parts = head.request_line.split_whitespace();
    let method = parts.next();
    let path = parts.next().and_then(|p| p.split('?').next());
    let (status, body) = match (method, path) {
        (Some("GET"), Some("/")) => (
            "200 OK",
            serde_json::json!({ "message": HEALTH_MESSAGE }),
        ),
        _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
    };
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    hub: HubHandle,
    config: Arc<ServerConfig>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let head = timeout(REQUEST_HEAD_TIMEOUT, peek_head(&stream)).await;
    match head {
        Ok(Ok(Some(head))) if head.upgrade => {}
        Ok(Ok(Some(head))) => {
            debug!("Plain HTTP request from {remote}: {}", head.request_line);
            return reply_http(stream, head).await;
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            debug!("{remote} sent no request head in time");
            return Ok(());
        }
    }

    let check_origin = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if config.origin_allowed(origin) {
            Ok(resp)
        } else {
            warn!("Rejecting {remote}: origin {origin:?} not allowed");
            let mut reject = ErrorResponse::new(Some("origin not allowed".to_string()));
            *reject.status_mut() = StatusCode::FORBIDDEN;
            Err(reject)
        }
    };
    let ws = accept_hdr_async(stream, check_origin).await?;
    let (mut sink, mut source) = ws.split();

    let (peer, mut inbox) = hub.open();
    info!("User connected: {peer} ({remote})");

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} for {writer_peer}: {e}", msg.kind());
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Failed to send to {writer_peer}: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = stop.changed() => {
                debug!("Closing {peer} for shutdown");
                break;
            }
            frame = source.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => hub.send(&peer, msg),
                Err(e) => {
                    warn!("Malformed frame from {peer}: {e}");
                    hub.invalid(&peer, format!("malformed message: {e}"));
                }
            },
            Ok(Message::Close(_)) => {
                debug!("Connection closed by client: {peer}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Socket error for {peer}: {e}");
                break;
            }
        }
    }

    // the hub drops the outbox on close, which ends the writer
    hub.close(&peer);
    if timeout(Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        debug!("Writer for {peer} did not finish in time");
    }
    Ok(())
}
