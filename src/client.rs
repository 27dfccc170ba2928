//! WebSocket client for a remote agent. Mirrors [`ProcessSupervisor`]'s
//! control surface and re-emits the agent's frames as [`SupervisorEvent`]s.
//!
//! [`ProcessSupervisor`]: crate::supervisor::ProcessSupervisor

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::DEFAULT_AGENT_PORT;
use crate::model::{
    ConnectionStatus, ConsoleLevel, ConsoleMessage, ServerInstance, ServerStatus, SupervisorEvent,
};
use crate::protocol::{AgentEvent, AgentRequest, ConsoleLine};
use crate::supervisor::ServerControl;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open socket whose sender is already registered with the client.
struct Session {
    sink: SplitSink<Socket, WsMessage>,
    stream: SplitStream<Socket>,
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected to agent")]
    NotConnected,
    #[error("Invalid agent address: {0}")]
    InvalidAddress(String),
    #[error("Failed to connect to agent: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Exponential reconnect delay: 1s, 2s, 4s, ... capped at 30s.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Agent frames with no local supervisor counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    ProcessStats {
        cpu: f64,
        memory: f64,
        tps: Option<f64>,
    },
    SetupProgress {
        stage: String,
        percent: u8,
        message: Option<String>,
    },
    RequestAck {
        request_type: String,
        success: bool,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port/ws`
    pub url: String,
    pub token: String,
    /// Id under which the remote server's events are re-emitted.
    pub server_id: String,
}

impl ClientConfig {
    pub fn new(host: &str, port: Option<u16>, token: &str, server_id: &str) -> Self {
        Self {
            url: format!("ws://{}:{}/ws", host, port.unwrap_or(DEFAULT_AGENT_PORT)),
            token: token.trim().to_string(),
            server_id: server_id.to_string(),
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    /// Bumped on every `connect`; stale sessions check it before touching state.
    generation: u64,
    closed: bool,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    status: watch::Sender<ConnectionStatus>,
    lifecycle: StdMutex<Lifecycle>,
    /// Sender of the live session, tagged with the generation that owns it.
    outgoing: StdMutex<Option<(u64, mpsc::UnboundedSender<WsMessage>)>>,
    remote_status: StdMutex<(ServerStatus, Option<u32>)>,
    events: broadcast::Sender<SupervisorEvent>,
    remote: broadcast::Sender<RemoteEvent>,
}

#[derive(Clone)]
pub struct ConnectionClient {
    inner: Arc<Inner>,
}

impl ConnectionClient {
    pub fn new(config: ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(1024);
        let (remote, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                status,
                lifecycle: StdMutex::new(Lifecycle::default()),
                outgoing: StdMutex::new(None),
                remote_status: StdMutex::new((ServerStatus::Stopped, None)),
                events,
                remote,
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_remote(&self) -> broadcast::Receiver<RemoteEvent> {
        self.inner.remote.subscribe()
    }

    /// Last status reported by the agent.
    pub fn server_status(&self) -> (ServerStatus, Option<u32>) {
        *self
            .inner
            .remote_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the socket. A failed first attempt is returned to the caller;
    /// once connected, drops are retried with backoff until [`disconnect`].
    /// On `Ok` the client is `Connected` and calls can be sent immediately.
    ///
    /// [`disconnect`]: ConnectionClient::disconnect
    pub async fn connect(&self) -> Result<(), ClientError> {
        let generation = {
            let mut lc = self.lifecycle();
            if let Some(task) = lc.task.take() {
                task.abort();
            }
            lc.generation += 1;
            lc.closed = false;
            self.inner.status.send_replace(ConnectionStatus::Connecting);
            lc.generation
        };

        let session = match open_socket(&self.inner.config).await {
            Ok(socket) => self.attach(generation, socket),
            Err(e) => Err(e),
        };
        let session = match session {
            Ok(Some(session)) => session,
            // Superseded by disconnect() or a newer connect() while opening.
            Ok(None) => return Err(ClientError::NotConnected),
            Err(e) => {
                self.transition(generation, ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        tracing::info!(url = %self.inner.config.url, "Connected to agent");

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(generation, session).await });
        let mut lc = self.lifecycle();
        if lc.generation == generation && !lc.closed {
            lc.task = Some(handle);
        } else {
            handle.abort();
        }
        Ok(())
    }

    /// The only path to `disconnected`. Cancels any pending reconnect.
    pub fn disconnect(&self) {
        let task = {
            let mut lc = self.lifecycle();
            lc.closed = true;
            self.inner.status.send_replace(ConnectionStatus::Disconnected);
            lc.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        *self.outgoing() = None;
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a state change from `generation`'s session, unless the caller
    /// has since disconnected or reconnected.
    fn transition(&self, generation: u64, to: ConnectionStatus) -> bool {
        let lc = self.lifecycle();
        if lc.generation != generation || lc.closed {
            return false;
        }
        self.inner.status.send_replace(to);
        true
    }

    fn outgoing(&self) -> std::sync::MutexGuard<'_, Option<(u64, mpsc::UnboundedSender<WsMessage>)>> {
        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_outgoing(&self, generation: u64) {
        let mut outgoing = self.outgoing();
        if outgoing.as_ref().is_some_and(|(g, _)| *g == generation) {
            *outgoing = None;
        }
    }

    /// Registers a freshly opened socket and flips the status to `Connected`.
    /// `None` when `generation` was superseded in the meantime.
    fn attach(&self, generation: u64, socket: Socket) -> Result<Option<Session>, ClientError> {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();

        // Resync after every (re)connect so no console history is lost. Queued
        // ahead of anything the caller sends.
        for req in [
            AgentRequest::GetStatus,
            AgentRequest::GetRecentConsole { lines: None },
        ] {
            let _ = tx.send(WsMessage::Text(serde_json::to_string(&req)?.into()));
        }

        *self.outgoing() = Some((generation, tx));
        if !self.transition(generation, ConnectionStatus::Connected) {
            self.clear_outgoing(generation);
            return Ok(None);
        }
        Ok(Some(Session { sink, stream, rx }))
    }

    async fn run(self, generation: u64, mut session: Session) {
        let mut backoff = Backoff::default();
        loop {
            if let Err(e) = self.session(session).await {
                tracing::warn!(error = %e, "Agent connection lost");
            }
            self.clear_outgoing(generation);

            session = loop {
                if !self.transition(generation, ConnectionStatus::Reconnecting) {
                    return;
                }
                let delay = backoff.next_delay();
                tracing::info!(delay_secs = delay.as_secs(), "Reconnecting to agent");
                tokio::time::sleep(delay).await;
                let attached = match open_socket(&self.inner.config).await {
                    Ok(socket) => self.attach(generation, socket),
                    Err(e) => Err(e),
                };
                match attached {
                    Ok(Some(session)) => break session,
                    Ok(None) => return,
                    Err(e) => tracing::debug!(error = %e, "Reconnect attempt failed"),
                }
            };
            backoff.reset();
            tracing::info!(url = %self.inner.config.url, "Reconnected to agent");
        }
    }

    async fn session(&self, session: Session) -> anyhow::Result<()> {
        let Session {
            mut sink,
            mut stream,
            mut rx,
        } = session;
        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => sink.send(msg).await?,
                    None => return Ok(()),
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<AgentEvent>(&text) {
                        Ok(event) => self.dispatch(event),
                        Err(e) => tracing::debug!(error = %e, "Ignoring unrecognised agent frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_console(&self, message: ConsoleMessage) {
        self.emit(SupervisorEvent::Console {
            server_id: self.inner.config.server_id.clone(),
            message,
        });
    }

    fn dispatch(&self, event: AgentEvent) {
        let server_id = self.inner.config.server_id.clone();
        match event {
            AgentEvent::Console {
                line,
                level,
                timestamp,
            } => self.emit_console(
                ConsoleLine {
                    line,
                    level,
                    timestamp,
                }
                .into_message(),
            ),
            AgentEvent::RecentConsole { lines } => {
                for line in lines {
                    self.emit_console(line.into_message());
                }
            }
            AgentEvent::Status {
                server_status, pid, ..
            } => {
                let pid = pid.filter(|_| server_status.has_process());
                *self
                    .inner
                    .remote_status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = (server_status, pid);
                self.emit(SupervisorEvent::Status {
                    server_id,
                    status: server_status,
                    pid,
                });
            }
            AgentEvent::Heartbeat { server_status, .. } => {
                let changed = {
                    let mut cached = self
                        .inner
                        .remote_status
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    if cached.0 == server_status {
                        None
                    } else {
                        *cached = (server_status, cached.1.filter(|_| server_status.has_process()));
                        Some(cached.1)
                    }
                };
                if let Some(pid) = changed {
                    self.emit(SupervisorEvent::Status {
                        server_id,
                        status: server_status,
                        pid,
                    });
                }
            }
            AgentEvent::Error { message, code } => {
                let text = match code {
                    Some(code) => format!("[agent] {} ({})", message, code),
                    None => format!("[agent] {}", message),
                };
                self.emit_console(ConsoleMessage::system(ConsoleLevel::Error, text));
            }
            AgentEvent::ProcessStats { cpu, memory, tps } => {
                let _ = self
                    .inner
                    .remote
                    .send(RemoteEvent::ProcessStats { cpu, memory, tps });
            }
            AgentEvent::SetupProgress {
                stage,
                percent,
                message,
            } => {
                let _ = self.inner.remote.send(RemoteEvent::SetupProgress {
                    stage,
                    percent,
                    message,
                });
            }
            AgentEvent::RequestAck {
                request_type,
                success,
                error,
            } => {
                if let Some(err) = &error {
                    tracing::warn!(request = %request_type, error = %err, "Agent rejected request");
                }
                let _ = self.inner.remote.send(RemoteEvent::RequestAck {
                    request_type,
                    success,
                    error,
                });
            }
        }
    }

    fn send(&self, request: &AgentRequest) -> Result<(), ClientError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        let json = serde_json::to_string(request)?;
        let outgoing = self.outgoing();
        match outgoing.as_ref() {
            Some((_, tx)) => tx
                .send(WsMessage::Text(json.into()))
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    pub fn setup_server(&self, instance: &ServerInstance) -> Result<(), ClientError> {
        self.send(&AgentRequest::SetupServer {
            framework: instance.framework.clone(),
            mc_version: instance.mc_version.clone(),
            build: instance.build.clone(),
            jvm_args: instance.jvm_args.clone(),
            port: instance.port,
        })
    }

    pub fn start(&self) -> Result<(), ClientError> {
        self.send(&AgentRequest::StartServer)
    }

    pub fn stop(&self) -> Result<(), ClientError> {
        self.send(&AgentRequest::StopServer)
    }

    pub fn restart(&self) -> Result<(), ClientError> {
        self.send(&AgentRequest::RestartServer)
    }

    pub fn send_command(&self, command: &str) -> Result<(), ClientError> {
        self.send(&AgentRequest::SendCommand {
            command: command.to_string(),
        })
    }

    pub fn upload_artifact(&self, name: &str, bytes: &[u8]) -> Result<(), ClientError> {
        self.send(&AgentRequest::UploadArtifact {
            name: name.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }

    pub fn deploy_artifact(&self, name: &str, target_dir: &str) -> Result<(), ClientError> {
        self.send(&AgentRequest::DeployArtifact {
            name: name.to_string(),
            target_dir: target_dir.to_string(),
        })
    }

    pub fn request_status(&self) -> Result<(), ClientError> {
        self.send(&AgentRequest::GetStatus)
    }
}

async fn open_socket(config: &ClientConfig) -> Result<Socket, ClientError> {
    let mut req = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|_| ClientError::InvalidAddress(config.url.clone()))?;
    let value = format!("Bearer {}", config.token)
        .parse::<HeaderValue>()
        .map_err(|_| ClientError::InvalidAddress(config.url.clone()))?;
    req.headers_mut().insert("Authorization", value);
    let (socket, _) = tokio_tungstenite::connect_async(req).await?;
    Ok(socket)
}

#[async_trait]
impl ServerControl for ConnectionClient {
    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        ConnectionClient::subscribe(self)
    }

    fn is_running(&self, _server_id: &str) -> bool {
        matches!(
            self.server_status().0,
            ServerStatus::Starting | ServerStatus::Running
        )
    }

    async fn send_command(&self, _server_id: &str, command: &str) -> anyhow::Result<()> {
        Ok(ConnectionClient::send_command(self, command)?)
    }

    async fn restart(&self, _server_id: &str) -> anyhow::Result<()> {
        Ok(ConnectionClient::restart(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::default();
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn config_builds_ws_url() {
        let c = ClientConfig::new("10.0.0.5", None, " tok\n", "remote");
        assert_eq!(c.url, "ws://10.0.0.5:9847/ws");
        assert_eq!(c.token, "tok");
    }

    #[test]
    fn calls_fail_when_not_connected() {
        let client = ConnectionClient::new(ClientConfig::new("127.0.0.1", Some(1), "t", "s"));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(matches!(client.start(), Err(ClientError::NotConnected)));
        assert!(matches!(
            client.upload_artifact("a.jar", b"x"),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn dispatch_maps_frames_to_events() {
        let client = ConnectionClient::new(ClientConfig::new("127.0.0.1", None, "t", "remote"));
        let mut events = client.subscribe();
        let mut remote = client.subscribe_remote();

        client.dispatch(AgentEvent::Status {
            server_status: ServerStatus::Running,
            pid: Some(42),
            players: None,
        });
        client.dispatch(AgentEvent::Error {
            message: "boom".into(),
            code: None,
        });
        client.dispatch(AgentEvent::ProcessStats {
            cpu: 12.5,
            memory: 512.0,
            tps: Some(20.0),
        });

        assert_eq!(client.server_status(), (ServerStatus::Running, Some(42)));
        match events.recv().await.unwrap() {
            SupervisorEvent::Status { server_id, status, pid } => {
                assert_eq!(server_id, "remote");
                assert_eq!(status, ServerStatus::Running);
                assert_eq!(pid, Some(42));
            }
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            SupervisorEvent::Console { message, .. } => {
                assert_eq!(message.level, ConsoleLevel::Error);
                assert!(message.text.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            remote.recv().await.unwrap(),
            RemoteEvent::ProcessStats {
                cpu: 12.5,
                memory: 512.0,
                tps: Some(20.0)
            }
        );

        client.dispatch(AgentEvent::Heartbeat {
            uptime: 10,
            server_status: ServerStatus::Stopped,
        });
        assert_eq!(client.server_status(), (ServerStatus::Stopped, None));
        match events.recv().await.unwrap() {
            SupervisorEvent::Status { status, pid, .. } => {
                assert_eq!(status, ServerStatus::Stopped);
                assert_eq!(pid, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        // An unchanged heartbeat is silent.
        client.dispatch(AgentEvent::Heartbeat {
            uptime: 40,
            server_status: ServerStatus::Stopped,
        });
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn failed_connect_leaves_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = ConnectionClient::new(ClientConfig::new("127.0.0.1", Some(port), "t", "s"));
        assert!(client.connect().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
