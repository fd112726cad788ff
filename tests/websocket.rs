mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use peercall_lib::config::{ClientConfig, ServerConfig};
use peercall_lib::peer::{CallEvent, CallState, Endpoint};
use peercall_lib::signaling::{
    ClientMessage, Peer, PeerId, ServerMessage, SessionDescription, SignalingServer, HEALTH_MESSAGE,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<peercall_lib::Result<()>>,
}

async fn serve(allowed_origins: Vec<String>) -> Running {
    let config = ServerConfig {
        bind: Some("127.0.0.1:0".parse().unwrap()),
        allowed_origins,
    };
    let server = SignalingServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

async fn start_server(allowed_origins: Vec<String>) -> (SocketAddr, oneshot::Sender<()>) {
    let running = serve(allowed_origins).await;
    (running.addr, running.stop)
}

/// Sends a raw HTTP request and returns the whole response
async fn http(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("timed out reading the response")
        .unwrap();
    String::from_utf8(response).unwrap()
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Reads frames until a users list of `count` entries shows up
async fn users(ws: &mut Ws, count: usize) -> Vec<Peer> {
    loop {
        if let ServerMessage::Users { list } = recv(ws).await {
            if list.len() == count {
                return list;
            }
        }
    }
}

async fn silent(ws: &mut Ws) -> bool {
    timeout(Duration::from_millis(200), ws.next()).await.is_err()
}

async fn join(ws: &mut Ws, name: &str) {
    send(ws, &ClientMessage::Join { name: name.into() }).await;
}

fn id_of(list: &[Peer], name: &str) -> PeerId {
    list.iter()
        .find(|p| p.name == name)
        .map(|p| p.id.clone())
        .unwrap()
}

#[tokio::test]
async fn joins_are_broadcast_to_everyone() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    join(&mut a, "Alice").await;
    let list = users(&mut a, 1).await;
    assert_eq!(list[0].name, "Alice");

    join(&mut b, "Bob").await;
    let seen_by_a = users(&mut a, 2).await;
    let seen_by_b = users(&mut b, 2).await;
    assert_eq!(seen_by_a, seen_by_b);
    assert_eq!(seen_by_a[0].name, "Alice");
    assert_eq!(seen_by_a[1].name, "Bob");
}

#[tokio::test]
async fn offers_reach_only_their_target() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;

    join(&mut a, "A").await;
    join(&mut b, "B").await;
    join(&mut c, "C").await;
    let list = users(&mut a, 3).await;
    users(&mut b, 3).await;
    users(&mut c, 3).await;

    let offer = SessionDescription::offer("v=0 test");
    send(
        &mut a,
        &ClientMessage::Offer {
            to: id_of(&list, "B"),
            offer: offer.clone(),
            from_name: "A".into(),
        },
    )
    .await;

    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Offer {
            from: id_of(&list, "A"),
            from_name: "A".into(),
            offer,
        }
    );
    assert!(silent(&mut c).await);
    assert!(silent(&mut a).await);
}

#[tokio::test]
async fn untagged_candidates_go_to_everyone_else() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    join(&mut a, "A").await;
    join(&mut b, "B").await;
    join(&mut c, "C").await;
    let list = users(&mut a, 3).await;
    users(&mut b, 3).await;
    users(&mut c, 3).await;

    send(
        &mut a,
        &ClientMessage::IceCandidate {
            candidate: candidate("c1"),
            to: None,
        },
    )
    .await;

    let expected = ServerMessage::IceCandidate {
        from: id_of(&list, "A"),
        candidate: candidate("c1"),
    };
    assert_eq!(recv(&mut b).await, expected);
    assert_eq!(recv(&mut c).await, expected);
    assert!(silent(&mut a).await);
}

#[tokio::test]
async fn malformed_frames_get_an_error_and_keep_the_socket() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let mut a = connect(addr).await;

    a.send(Message::Text("{\"type\":\"dance\"}".into())).await.unwrap();
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    a.send(Message::Text("not json".into())).await.unwrap();
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    join(&mut a, "Alice").await;
    users(&mut a, 1).await;
}

#[tokio::test]
async fn disconnect_removes_the_peer() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "A").await;
    join(&mut b, "B").await;
    users(&mut a, 2).await;

    b.close(None).await.unwrap();
    let list = users(&mut a, 1).await;
    assert_eq!(list[0].name, "A");
}

#[tokio::test]
async fn foreign_origins_are_refused() {
    let (addr, _stop) = start_server(vec!["http://localhost:3000".into()]).await;

    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:3000".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn endpoints_call_each_other_over_the_server() {
    let (addr, _stop) = start_server(Vec::new()).await;
    let config = ClientConfig {
        signaling_url: format!("ws://{addr}"),
        ..test_config()
    };

    let (alice_net, alice_log) = MockTransports::new("alice", true);
    let (alice_cam, _) = MockMedia::granted();
    let (bob_net, bob_log) = MockTransports::new("bob", true);
    let (bob_cam, _) = MockMedia::granted();

    let mut alice = Endpoint::connect(config.clone(), alice_net, alice_cam).await.unwrap();
    let mut bob = Endpoint::connect(config, bob_net, bob_cam).await.unwrap();
    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();

    alice.handle().join("Alice").unwrap();
    bob.handle().join("Bob").unwrap();
    let bob_id = match wait_event(&mut alice_events, |e| matches!(e, CallEvent::Users(l) if l.len() == 2)).await {
        CallEvent::Users(list) => id_of(&list, "Bob"),
        _ => unreachable!(),
    };

    alice.handle().call(bob_id).unwrap();
    wait_event(&mut bob_events, |e| matches!(e, CallEvent::Incoming { .. })).await;
    bob.handle().accept().unwrap();

    wait_state(alice.handle(), CallState::Connected).await;
    wait_state(bob.handle(), CallState::Connected).await;

    // alice leaving the server ends bob's call from the other side
    alice.shutdown().await;
    wait_status(&mut bob_events, "Call ended").await;
    wait_state(bob.handle(), CallState::Idle).await;
    eventually("transports closed", || {
        alice_log.closes() == 1 && bob_log.closes() == 1
    })
    .await;

    bob.shutdown().await;
}

#[tokio::test]
async fn plain_http_gets_a_health_reply() {
    let (addr, _stop) = start_server(Vec::new()).await;

    let response = http(addr, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["message"], HEALTH_MESSAGE);

    let response = http(addr, "GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    // websocket clients still get through
    let mut a = connect(addr).await;
    join(&mut a, "Alice").await;
    users(&mut a, 1).await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets_before_returning() {
    let running = serve(Vec::new()).await;
    let mut a = connect(running.addr).await;
    join(&mut a, "Alice").await;
    users(&mut a, 1).await;

    running.stop.send(()).unwrap();
    timeout(WAIT, running.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    // the socket was closed by the server, not left serving
    let ended = timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(TcpStream::connect(running.addr).await.is_err());
}
