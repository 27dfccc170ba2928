use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::auth::{self, bearer_token, token_matches};
use crate::config::{self, AgentConfig, AgentState};
use crate::console::SignalExtractors;
use crate::model::{ServerInstance, SupervisorEvent};
use crate::protocol::{AgentEvent, AgentRequest, ConsoleLine};
use crate::sampler::ResourceSampler;
use crate::state::{AppState, AGENT_SERVER_ID};
use crate::supervisor::{self, ProcessSupervisor, SupervisorError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const SERVER_JAR: &str = "server.jar";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("No server configured; send setup-server first")]
    NoServerConfigured,
    #[error("Unknown framework '{0}'")]
    UnknownFramework(String),
    #[error("Server must be stopped before it can be set up again")]
    ServerBusy,
    #[error("Server jar not found at {0}; upload it and deploy it to '.'")]
    ServerJarMissing(String),
    #[error("Artifact '{0}' not found")]
    ArtifactNotFound(String),
    #[error("Invalid path '{0}'")]
    InvalidPath(String),
    #[error("Artifact data is not valid base64: {0}")]
    InvalidArtifactData(#[from] base64::DecodeError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Prepares the data directory, token and saved server, then starts the
/// background event pump and heartbeat.
pub async fn bootstrap(config: AgentConfig) -> anyhow::Result<AppState> {
    config.ensure_dirs().await?;
    let token = auth::load_or_create_token(&config.token_path()).await?;
    let saved = config::load_state(&config.state_path()).await?;
    if let Some(instance) = &saved.instance {
        let killed = supervisor::kill_orphans(instance).await;
        tracing::info!(
            framework = %instance.framework,
            version = %instance.mc_version,
            orphans_killed = killed,
            "Restored server configuration"
        );
    }

    let state = AppState::new(
        config,
        token,
        ProcessSupervisor::default(),
        ResourceSampler::default(),
        saved.instance,
    );
    spawn_event_pump(state.clone());
    spawn_heartbeat(state.clone(), HEARTBEAT_INTERVAL);
    Ok(state)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        uptime: state.uptime_secs(),
    })
}

async fn ws_handler(
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> impl IntoResponse {
    let authorized = bearer_token(&headers).is_some_and(|got| token_matches(&state.token, &got));
    if !authorized {
        tracing::warn!("Rejected connection with missing or invalid token");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn send_event(socket: &mut WebSocket, event: &AgentEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize event");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    tracing::info!("Client connected");

    // Requests from one client are handled in order, off the socket loop, so
    // a slow stop does not hold up console streaming.
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<AgentRequest>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let worker = {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(req) = req_rx.recv().await {
                for reply in handle_request(&state, req).await {
                    if reply_tx.send(reply).is_err() {
                        return;
                    }
                }
            }
        })
    };

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => {
                    if !send_event(&mut socket, &ev).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Client lagged behind event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = reply_rx.recv() => match reply {
                Some(reply) => {
                    if !send_event(&mut socket, &reply).await {
                        break;
                    }
                }
                None => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentRequest>(&text) {
                    Ok(req) => {
                        tracing::debug!(request = req.kind(), "Request received");
                        let _ = req_tx.send(req);
                    }
                    Err(e) => {
                        let err = AgentEvent::Error {
                            message: format!("Invalid request: {}", e),
                            code: Some("bad-request".into()),
                        };
                        if !send_event(&mut socket, &err).await {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket receive failed");
                    break;
                }
                _ => {}
            }
        }
    }

    drop(req_tx);
    // Requests already queued still run to completion.
    tokio::spawn(async move {
        let _ = worker.await;
    });
    tracing::info!("Client disconnected");
}

/// Executes one request. Queries answer with data; everything else answers
/// with a `request-ack`.
pub async fn handle_request(state: &AppState, req: AgentRequest) -> Vec<AgentEvent> {
    match &req {
        AgentRequest::GetStatus => return vec![state.status_event()],
        AgentRequest::GetRecentConsole { lines } => {
            let lines = state.console.lock().await.recent(*lines);
            return vec![AgentEvent::RecentConsole { lines }];
        }
        _ => {}
    }

    let result = match req.clone() {
        AgentRequest::SetupServer {
            framework,
            mc_version,
            build,
            jvm_args,
            port,
        } => setup_server(state, framework, mc_version, build, jvm_args, port).await,
        AgentRequest::StartServer => start_server(state).await,
        AgentRequest::StopServer => stop_server(state).await,
        AgentRequest::RestartServer => restart_server(state).await,
        AgentRequest::SendCommand { command } => state
            .supervisor
            .send_command(AGENT_SERVER_ID, &command)
            .await
            .map_err(AgentError::from),
        AgentRequest::UploadArtifact { name, data } => upload_artifact(state, &name, &data).await,
        AgentRequest::DeployArtifact { name, target_dir } => {
            deploy_artifact(state, &name, &target_dir).await
        }
        AgentRequest::GetStatus | AgentRequest::GetRecentConsole { .. } => Ok(()),
    };

    if let Err(e) = &result {
        tracing::warn!(request = req.kind(), error = %e, "Request failed");
    }
    vec![AgentEvent::ack(&req, result.map_err(|e| e.to_string()))]
}

fn progress(state: &AppState, stage: &str, percent: u8, message: Option<String>) {
    state.broadcast(AgentEvent::SetupProgress {
        stage: stage.to_string(),
        percent,
        message,
    });
}

async fn setup_server(
    state: &AppState,
    framework: String,
    mc_version: String,
    build: Option<String>,
    jvm_args: Vec<String>,
    port: u16,
) -> Result<(), AgentError> {
    if state.providers.get(&framework).is_none() {
        return Err(AgentError::UnknownFramework(framework));
    }
    if state.supervisor.get_status(AGENT_SERVER_ID).is_some() {
        return Err(AgentError::ServerBusy);
    }

    progress(state, "prepare", 10, None);
    let server_dir = state.config.server_dir();
    tokio::fs::create_dir_all(&server_dir).await?;

    progress(state, "configure", 50, None);
    tokio::fs::write(server_dir.join("eula.txt"), "eula=true\n").await?;
    let props_path = server_dir.join("server.properties");
    let props = match tokio::fs::read_to_string(&props_path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    tokio::fs::write(&props_path, set_property(&props, "server-port", &port.to_string())).await?;

    let instance = ServerInstance {
        id: AGENT_SERVER_ID.to_string(),
        framework,
        mc_version,
        build,
        jvm_args,
        port,
        working_dir: server_dir.clone(),
        jar_path: server_dir.join(SERVER_JAR),
    };
    config::save_state(
        &state.config.state_path(),
        &AgentState {
            instance: Some(instance.clone()),
        },
    )
    .await?;

    let note = (!instance.jar_path.is_file()).then(|| {
        format!(
            "{} not found; upload it and deploy it to '.'",
            SERVER_JAR
        )
    });
    tracing::info!(framework = %instance.framework, version = %instance.mc_version, port, "Server set up");
    *state.current.write().await = Some(instance);
    progress(state, "ready", 100, note);
    Ok(())
}

/// Replaces `key=...` in a properties file, appending it when absent.
pub fn set_property(contents: &str, key: &str, value: &str) -> String {
    let mut found = false;
    let mut out: Vec<String> = contents
        .lines()
        .map(|line| match line.split_once('=') {
            Some((k, _)) if k.trim() == key && !line.trim_start().starts_with('#') => {
                found = true;
                format!("{}={}", key, value)
            }
            _ => line.to_string(),
        })
        .collect();
    if !found {
        out.push(format!("{}={}", key, value));
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

async fn current_instance(state: &AppState) -> Result<ServerInstance, AgentError> {
    state
        .current
        .read()
        .await
        .clone()
        .ok_or(AgentError::NoServerConfigured)
}

async fn start_server(state: &AppState) -> Result<(), AgentError> {
    let instance = current_instance(state).await?;
    let provider = state
        .providers
        .get(&instance.framework)
        .ok_or_else(|| AgentError::UnknownFramework(instance.framework.clone()))?;
    if !instance.jar_path.is_file() {
        return Err(AgentError::ServerJarMissing(
            instance.jar_path.display().to_string(),
        ));
    }
    let world_dir = instance.world_dir();
    let process = state.supervisor.start(instance, provider).await?;
    if let Some(pid) = process.pid {
        state
            .sampler
            .start_monitoring(AGENT_SERVER_ID, pid, process.started_at, world_dir);
    }
    Ok(())
}

async fn stop_server(state: &AppState) -> Result<(), AgentError> {
    state.supervisor.stop(AGENT_SERVER_ID).await?;
    state.sampler.stop_monitoring(AGENT_SERVER_ID);
    Ok(())
}

async fn restart_server(state: &AppState) -> Result<(), AgentError> {
    let process = state.supervisor.restart(AGENT_SERVER_ID).await?;
    if let (Some(pid), Some(instance)) = (process.pid, state.supervisor.instance(AGENT_SERVER_ID)) {
        state
            .sampler
            .start_monitoring(AGENT_SERVER_ID, pid, process.started_at, instance.world_dir());
    }
    Ok(())
}

/// A bare file name: no separators, no `..`.
fn safe_file_name(name: &str) -> Result<&str, AgentError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(name),
        _ => Err(AgentError::InvalidPath(name.to_string())),
    }
}

/// `rel` joined onto `base`, refusing anything that would escape it.
fn safe_join(base: &Path, rel: &str) -> Result<PathBuf, AgentError> {
    let mut out = base.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(AgentError::InvalidPath(rel.to_string())),
        }
    }
    Ok(out)
}

async fn upload_artifact(state: &AppState, name: &str, data: &str) -> Result<(), AgentError> {
    let name = safe_file_name(name)?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    let dir = state.config.uploads_dir();
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(name);
    tokio::fs::write(&dest, &bytes).await?;
    tracing::info!(artifact = %name, bytes = bytes.len(), "Artifact uploaded");
    Ok(())
}

async fn deploy_artifact(state: &AppState, name: &str, target_dir: &str) -> Result<(), AgentError> {
    let name = safe_file_name(name)?;
    let src = state.config.uploads_dir().join(name);
    if !src.is_file() {
        return Err(AgentError::ArtifactNotFound(name.to_string()));
    }
    let dir = safe_join(&state.config.server_dir(), target_dir)?;
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(name);
    tokio::fs::copy(&src, &dest).await?;
    tracing::info!(artifact = %name, dest = %dest.display(), "Artifact deployed");
    Ok(())
}

/// Fans supervisor and sampler output out to every connected client.
pub fn spawn_event_pump(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut supervisor_rx = state.supervisor.subscribe();
        let mut stats_rx = state.sampler.subscribe();
        let mut extractors: Option<(String, SignalExtractors)> = None;
        loop {
            tokio::select! {
                ev = supervisor_rx.recv() => match ev {
                    Ok(SupervisorEvent::Console { server_id, message }) => {
                        let line = ConsoleLine::from(&message);
                        state.console.lock().await.push(line.clone());
                        state.broadcast(AgentEvent::console(line));

                        let framework = state
                            .current
                            .read()
                            .await
                            .as_ref()
                            .map(|i| i.framework.clone())
                            .unwrap_or_default();
                        if extractors.as_ref().map_or(true, |(f, _)| *f != framework) {
                            let ex = SignalExtractors::for_framework(&framework);
                            extractors = Some((framework, ex));
                        }
                        if let Some((_, ex)) = &extractors {
                            if let Some(signal) = ex.extract(&message.text) {
                                state.sampler.apply_signal(&server_id, signal);
                            }
                        }
                    }
                    Ok(SupervisorEvent::Status { server_id, status, pid }) => {
                        // A restart may already have registered the next run.
                        if state.supervisor.get_status(&server_id).is_none() {
                            state.sampler.stop_monitoring(&server_id);
                        }
                        state.broadcast(AgentEvent::Status {
                            server_status: status,
                            pid,
                            players: state.sampler.players(&server_id),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event pump lagged behind supervisor");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                stats = stats_rx.recv() => match stats {
                    Ok(s) => state.broadcast(AgentEvent::ProcessStats {
                        cpu: s.cpu_percent,
                        memory: s.rss_mb,
                        tps: s.tps,
                    }),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

pub fn spawn_heartbeat(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (server_status, _) = state.server_status();
            state.broadcast(AgentEvent::Heartbeat {
                uptime: state.uptime_secs(),
                server_status,
            });
        }
    })
}

/// Stops monitoring and the managed server, escalating to a kill if the
/// graceful path overruns.
/// Serves until `signal` fires, then stops the server. Cleanup also runs when
/// the listener fails, before the error is returned.
pub async fn serve<F>(state: AppState, listener: TcpListener, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(signal)
        .await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "Agent server failed");
    }
    tracing::info!("Shutting down server...");
    shutdown(&state).await;
    served.context("Agent server failed")
}

pub async fn shutdown(state: &AppState) {
    state.sampler.stop_all();
    let grace = config::stop_timeout() + Duration::from_secs(5);
    if tokio::time::timeout(grace, state.supervisor.stop_all())
        .await
        .is_err()
    {
        tracing::warn!("Graceful shutdown timed out, killing remaining servers");
    }
    state.supervisor.kill_all();
}
