mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use blockdev::auth::{is_valid_token, TOKEN_LEN};

use common::spawn_agent;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, token: Option<&str>) -> Result<Socket, WsError> {
    let mut req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    if let Some(token) = token {
        req.headers_mut()
            .insert("Authorization", format!("Bearer {}", token).parse().unwrap());
    }
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next frame of the given `type`, skipping broadcast noise.
async fn recv_type(ws: &mut Socket, ty: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    if v["type"] == ty {
                        return v;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} frame", ty))
}

fn assert_unauthorized(res: Result<Socket, WsError>) {
    match res {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
        Err(other) => panic!("expected HTTP 401, got {:?}", other),
        Ok(_) => panic!("expected HTTP 401, connection was accepted"),
    }
}

#[tokio::test]
async fn fresh_agent_requires_token_and_reports_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, token) = spawn_agent(tmp.path()).await;

    let on_disk = std::fs::read_to_string(tmp.path().join("auth.token")).unwrap();
    assert_eq!(on_disk.len(), TOKEN_LEN);
    assert!(is_valid_token(&on_disk));
    assert_eq!(on_disk, token);

    assert_unauthorized(connect(addr, None).await);
    assert_unauthorized(connect(addr, Some("not-the-token")).await);

    let mut ws = connect(addr, Some(&token)).await.unwrap();
    send(&mut ws, json!({"type": "get-status"})).await;
    let status = recv_type(&mut ws, "status").await;
    assert_eq!(status["serverStatus"], "stopped");
    assert!(status.get("pid").is_none());

    send(&mut ws, json!({"type": "get-recent-console", "lines": 10})).await;
    let recent = recv_type(&mut ws, "recent-console").await;
    assert_eq!(recent["lines"], json!([]));
}

#[tokio::test]
async fn setup_persists_and_start_without_jar_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, token) = spawn_agent(tmp.path()).await;
    let mut ws = connect(addr, Some(&token)).await.unwrap();

    send(
        &mut ws,
        json!({
            "type": "setup-server",
            "framework": "paper",
            "mcVersion": "1.21.1",
            "jvmArgs": ["-Xmx1G"],
            "port": 25570
        }),
    )
    .await;
    let ack = recv_type(&mut ws, "request-ack").await;
    assert_eq!(ack["requestType"], "setup-server");
    assert_eq!(ack["success"], true, "{}", ack);

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("server.json")).unwrap())
            .unwrap();
    assert_eq!(saved["instance"]["framework"], "paper");
    let props = std::fs::read_to_string(tmp.path().join("server/server.properties")).unwrap();
    assert!(props.contains("server-port=25570"));
    assert!(tmp.path().join("server/eula.txt").is_file());

    send(&mut ws, json!({"type": "start-server"})).await;
    let ack = recv_type(&mut ws, "request-ack").await;
    assert_eq!(ack["requestType"], "start-server");
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("server.jar"));

    send(&mut ws, json!({"type": "setup-server", "framework": "bukkit-9000", "mcVersion": "1.0", "port": 1})).await;
    let ack = recv_type(&mut ws, "request-ack").await;
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("Unknown framework"));
}

#[tokio::test]
async fn upload_then_deploy_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, token) = spawn_agent(tmp.path()).await;
    let mut ws = connect(addr, Some(&token)).await.unwrap();

    // "hello" in base64.
    send(&mut ws, json!({"type": "upload-artifact", "name": "MyPlugin.jar", "data": "aGVsbG8="})).await;
    assert_eq!(recv_type(&mut ws, "request-ack").await["success"], true);

    send(&mut ws, json!({"type": "deploy-artifact", "name": "MyPlugin.jar", "targetDir": "plugins"})).await;
    assert_eq!(recv_type(&mut ws, "request-ack").await["success"], true);
    assert_eq!(
        std::fs::read(tmp.path().join("server/plugins/MyPlugin.jar")).unwrap(),
        b"hello"
    );

    send(&mut ws, json!({"type": "deploy-artifact", "name": "Missing.jar", "targetDir": "plugins"})).await;
    let ack = recv_type(&mut ws, "request-ack").await;
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("not found"));

    send(&mut ws, json!({"type": "deploy-artifact", "name": "MyPlugin.jar", "targetDir": "../escape"})).await;
    assert_eq!(recv_type(&mut ws, "request-ack").await["success"], false);
}

#[tokio::test]
async fn malformed_request_gets_error_frame() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, token) = spawn_agent(tmp.path()).await;
    let mut ws = connect(addr, Some(&token)).await.unwrap();

    ws.send(Message::Text("{\"type\":\"format-disk\"}".into()))
        .await
        .unwrap();
    let err = recv_type(&mut ws, "error").await;
    assert_eq!(err["code"], "bad-request");
}

#[tokio::test]
async fn health_needs_no_token() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _) = spawn_agent(tmp.path()).await;

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"status\":\"ok\""));
}

#[cfg(unix)]
mod serve_shutdown {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use async_trait::async_trait;

    use blockdev::agent;
    use blockdev::config::AgentConfig;
    use blockdev::model::{ReloadCapability, ServerInstance};
    use blockdev::provider::FrameworkProvider;

    /// Stands in for a JVM: idles until it reads `stop`.
    struct IdleProvider;

    #[async_trait]
    impl FrameworkProvider for IdleProvider {
        fn name(&self) -> &str {
            "idle"
        }

        fn start_command(&self, _instance: &ServerInstance) -> Vec<String> {
            vec![
                "sh".into(),
                "-c".into(),
                r#"while read line; do [ "$line" = stop ] && exit 0; done"#.into(),
            ]
        }

        fn stop_command(&self) -> String {
            "stop".into()
        }

        fn reload_command(&self) -> Option<String> {
            None
        }

        fn reload_capability(&self) -> ReloadCapability {
            ReloadCapability::Cold
        }

        fn watch_patterns(&self) -> Vec<String> {
            vec![]
        }

        async fn deploy(&self, artifact: &Path, _instance: &ServerInstance) -> anyhow::Result<PathBuf> {
            Ok(artifact.to_path_buf())
        }
    }

    #[tokio::test]
    async fn serve_stops_the_server_on_shutdown_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let state = agent::bootstrap(AgentConfig {
            port: 0,
            data_dir: tmp.path().to_path_buf(),
        })
        .await
        .unwrap();
        let instance = ServerInstance {
            id: "server".into(),
            framework: "idle".into(),
            mc_version: "1.21.1".into(),
            build: None,
            jvm_args: vec![],
            port: 25565,
            working_dir: tmp.path().to_path_buf(),
            jar_path: tmp.path().join("server.jar"),
        };
        state
            .supervisor
            .start(instance, Arc::new(IdleProvider))
            .await
            .unwrap();
        assert!(state.supervisor.is_running("server"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (trigger, signal) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(agent::serve(state.clone(), listener, async move {
            let _ = signal.await;
        }));
        trigger.send(()).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(30), server)
            .await
            .expect("serve never returned")
            .unwrap()
            .unwrap();
        assert!(state.supervisor.list().is_empty());
        assert!(!state.supervisor.is_running("server"));
    }
}
