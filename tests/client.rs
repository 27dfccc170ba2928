mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use blockdev::client::{ClientConfig, ClientError, ConnectionClient, RemoteEvent};
use blockdev::model::{ConnectionStatus, ServerStatus, SupervisorEvent};

use common::spawn_agent;

/// A bare WebSocket endpoint that hands every accepted socket to the test,
/// so the test decides when a connection drops.
struct ScriptedAgent {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl ScriptedAgent {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self { addr, accepted }
    }

    fn client(&self) -> ConnectionClient {
        ConnectionClient::new(ClientConfig::new(
            "127.0.0.1",
            Some(self.addr.port()),
            "secret",
            "remote",
        ))
    }

    async fn next_socket(&mut self) -> WebSocketStream<TcpStream> {
        tokio::time::timeout(Duration::from_secs(10), self.accepted.recv())
            .await
            .expect("client never (re)connected")
            .unwrap()
    }
}

async fn next_request(ws: &mut WebSocketStream<TcpStream>) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => {}
                other => panic!("socket ended: {:?}", other),
            }
        }
    })
    .await
    .expect("no request from client")
}

/// Every (re)connect opens with a status and console resync.
async fn expect_resync(ws: &mut WebSocketStream<TcpStream>) {
    assert_eq!(next_request(ws).await["type"], "get-status");
    assert_eq!(next_request(ws).await["type"], "get-recent-console");
}

async fn wait_for(rx: &mut watch::Receiver<ConnectionStatus>, want: ConnectionStatus) {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", want))
        .unwrap();
}

async fn wait_for_console(rx: &mut broadcast::Receiver<SupervisorEvent>, needle: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SupervisorEvent::Console { message, .. } = rx.recv().await.unwrap() {
                if message.text.contains(needle) {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw console line {:?}", needle));
}

#[tokio::test]
async fn calls_succeed_as_soon_as_connect_returns() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, token) = spawn_agent(tmp.path()).await;
    let client = ConnectionClient::new(ClientConfig::new(
        "127.0.0.1",
        Some(addr.port()),
        &token,
        "remote",
    ));
    let mut remote = client.subscribe_remote();
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);
    client.start().unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let RemoteEvent::RequestAck {
                request_type,
                success,
                ..
            } = remote.recv().await.unwrap()
            {
                return (request_type, success);
            }
        }
    })
    .await
    .unwrap();
    // Nothing has been set up on the agent yet.
    assert_eq!(ack, ("start-server".to_string(), false));

    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SupervisorEvent::Status { status, .. } = events.recv().await.unwrap() {
                return status;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(status, ServerStatus::Stopped);

    client.disconnect();
    assert!(matches!(client.start(), Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn drop_triggers_reconnect_and_console_replay() {
    let mut agent = ScriptedAgent::bind().await;
    let client = agent.client();
    let mut status = client.watch_status();
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    let mut first = agent.next_socket().await;
    expect_resync(&mut first).await;

    first.close(None).await.unwrap();
    drop(first);
    wait_for(&mut status, ConnectionStatus::Reconnecting).await;
    assert!(matches!(client.request_status(), Err(ClientError::NotConnected)));

    let mut second = agent.next_socket().await;
    expect_resync(&mut second).await;
    wait_for(&mut status, ConnectionStatus::Connected).await;

    let replay = json!({
        "type": "recent-console",
        "lines": [
            {"line": "[12:00:00 INFO]: Done (3.1s)!", "level": "info", "timestamp": 1_700_000_000_000i64}
        ]
    });
    second
        .send(Message::Text(replay.to_string().into()))
        .await
        .unwrap();
    wait_for_console(&mut events, "Done (3.1s)!").await;

    client.request_status().unwrap();
    assert_eq!(next_request(&mut second).await["type"], "get-status");
    client.disconnect();
}

#[tokio::test]
async fn backoff_resets_after_a_successful_reconnect() {
    let mut agent = ScriptedAgent::bind().await;
    let client = agent.client();
    let mut status = client.watch_status();

    client.connect().await.unwrap();
    let mut socket = agent.next_socket().await;
    expect_resync(&mut socket).await;

    // Without a reset the second gap would be the doubled 2s delay.
    for _ in 0..2 {
        let dropped = Instant::now();
        socket.close(None).await.unwrap();
        drop(socket);
        socket = agent.next_socket().await;
        let gap = dropped.elapsed();
        assert!(gap >= Duration::from_millis(900), "reconnected after {:?}", gap);
        assert!(gap < Duration::from_millis(1800), "reconnected after {:?}", gap);
        expect_resync(&mut socket).await;
        wait_for(&mut status, ConnectionStatus::Connected).await;
    }
    client.disconnect();
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let mut agent = ScriptedAgent::bind().await;
    let client = agent.client();
    let mut status = client.watch_status();

    client.connect().await.unwrap();
    let mut socket = agent.next_socket().await;
    expect_resync(&mut socket).await;
    socket.close(None).await.unwrap();
    drop(socket);
    wait_for(&mut status, ConnectionStatus::Reconnecting).await;

    client.disconnect();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), agent.accepted.recv())
            .await
            .is_err(),
        "client reconnected after disconnect()"
    );
}
