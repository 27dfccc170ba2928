use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, watch, Mutex, Notify};

use crate::config;
use crate::console::{classify_level, LineSplitter};
use crate::model::{
    ConsoleLevel, ConsoleMessage, ConsoleSource, RunningProcess, ServerInstance, ServerStatus,
    SupervisorEvent,
};
use crate::provider::{FrameworkProvider, JAVA_PLACEHOLDER};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Server '{0}' is not running")]
    NotRunning(String),
    #[error("Provider '{0}' returned an empty start command")]
    EmptyCommand(String),
    #[error("Failed to spawn server '{id}': {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to get child {0}")]
    MissingPipe(&'static str),
    #[error("Failed to write to server '{id}': {source}")]
    Stdin {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long `stop` waits for a graceful exit before killing.
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: config::stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(Option<i32>),
}

struct ManagedServer {
    instance: ServerInstance,
    provider: Arc<dyn FrameworkProvider>,
    pid: u32,
    started_at: DateTime<Utc>,
    status: StdMutex<ServerStatus>,
    stdin: Mutex<ChildStdin>,
    kill: Notify,
    exited: watch::Receiver<ExitState>,
}

impl ManagedServer {
    fn status(&self) -> ServerStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> RunningProcess {
        let status = self.status();
        RunningProcess {
            server_id: self.instance.id.clone(),
            pid: status.has_process().then_some(self.pid),
            status,
            started_at: self.started_at,
        }
    }

    async fn write_line(&self, text: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(format!("{}\n", text).as_bytes()).await?;
        stdin.flush().await
    }
}

/// Owns one child process per server id.
#[derive(Clone)]
pub struct ProcessSupervisor {
    servers: Arc<DashMap<String, Arc<ManagedServer>>>,
    events: broadcast::Sender<SupervisorEvent>,
    options: SupervisorOptions,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            servers: Arc::new(DashMap::new()),
            events,
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub async fn start(
        &self,
        instance: ServerInstance,
        provider: Arc<dyn FrameworkProvider>,
    ) -> Result<RunningProcess, SupervisorError> {
        let server_id = instance.id.clone();
        if self.servers.contains_key(&server_id) {
            return Err(SupervisorError::AlreadyRunning(server_id));
        }

        let java = resolve_java();
        let argv: Vec<String> = provider
            .start_command(&instance)
            .into_iter()
            .map(|arg| {
                if arg == JAVA_PLACEHOLDER {
                    java.to_string_lossy().into_owned()
                } else {
                    arg
                }
            })
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::EmptyCommand(provider.name().to_string()))?;

        // Check-and-insert under the shard lock so two concurrent starts for
        // the same id cannot both spawn.
        let (managed, mut child, exit_tx) = match self.servers.entry(server_id.clone()) {
            Entry::Occupied(_) => return Err(SupervisorError::AlreadyRunning(server_id)),
            Entry::Vacant(slot) => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args)
                    .current_dir(&instance.working_dir)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);

                let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
                    id: server_id.clone(),
                    source,
                })?;
                let pid = child.id().ok_or(SupervisorError::MissingPipe("PID"))?;
                let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;

                let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
                let managed = Arc::new(ManagedServer {
                    instance: instance.clone(),
                    provider: provider.clone(),
                    pid,
                    started_at: Utc::now(),
                    status: StdMutex::new(ServerStatus::Starting),
                    stdin: Mutex::new(stdin),
                    kill: Notify::new(),
                    exited: exit_rx,
                });
                slot.insert(managed.clone());
                (managed, child, exit_tx)
            }
        };
        let pid = managed.pid;
        self.emit_status(&server_id, ServerStatus::Starting, Some(pid));

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(server_id.clone(), ConsoleSource::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(server_id.clone(), ConsoleSource::Stderr, stderr);
        }

        {
            let this = self.clone();
            let managed = managed.clone();
            tokio::spawn(async move {
                this.watch_exit(managed, child, exit_tx).await;
            });
        }

        // Readiness (the "Done" banner) is the caller's concern.
        let promoted = {
            let mut status = managed.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == ServerStatus::Starting {
                *status = ServerStatus::Running;
                true
            } else {
                false
            }
        };
        if promoted {
            self.emit_status(&server_id, ServerStatus::Running, Some(pid));
        }

        tracing::info!(
            server = %server_id,
            pid,
            java = %java.display(),
            "Started server '{}' with PID {}",
            server_id,
            pid
        );
        Ok(managed.snapshot())
    }

    fn spawn_reader<R>(&self, server_id: String, source: ConsoleSource, mut stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut splitter = LineSplitter::new();
            let mut buf = vec![0u8; 8192];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in splitter.push(&buf[..n]) {
                            this.emit_line(&server_id, source, line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(server = %server_id, error = %e, "console stream closed");
                        break;
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                this.emit_line(&server_id, source, line);
            }
        });
    }

    fn emit_line(&self, server_id: &str, source: ConsoleSource, text: String) {
        let message = ConsoleMessage {
            timestamp: Utc::now(),
            level: classify_level(&text),
            source,
            text,
        };
        self.emit_console(server_id, message);
    }

    async fn watch_exit(
        &self,
        managed: Arc<ManagedServer>,
        mut child: Child,
        exit_tx: watch::Sender<ExitState>,
    ) {
        let server_id = managed.instance.id.clone();
        let waited = tokio::select! {
            res = child.wait() => res,
            _ = managed.kill.notified() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(server = %server_id, error = %e, "kill failed");
                }
                child.wait().await
            }
        };
        let code = match waited {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "wait failed");
                None
            }
        };

        // An explicit stop marks `stopping` first; anything else is a crash.
        let final_status = {
            let mut status = managed.status.lock().unwrap_or_else(PoisonError::into_inner);
            let next = if *status == ServerStatus::Stopping {
                ServerStatus::Stopped
            } else {
                ServerStatus::Error
            };
            *status = next;
            next
        };

        let code_text = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let level = if final_status == ServerStatus::Stopped {
            ConsoleLevel::Info
        } else {
            ConsoleLevel::Error
        };
        self.emit_console(
            &server_id,
            ConsoleMessage::system(level, format!("Server process exited with code {}", code_text)),
        );

        // A restart may already have registered a new run under this id.
        self.servers
            .remove_if(&server_id, |_, current| Arc::ptr_eq(current, &managed));
        self.emit_status(&server_id, final_status, None);
        tracing::info!(server = %server_id, code = %code_text, status = %final_status, "Server '{}' exited", server_id);

        let _ = exit_tx.send(ExitState::Exited(code));
    }

    pub async fn stop(&self, server_id: &str) -> Result<(), SupervisorError> {
        let managed = self
            .servers
            .get(server_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| SupervisorError::NotRunning(server_id.to_string()))?;

        let already_stopping = {
            let mut status = managed.status.lock().unwrap_or_else(PoisonError::into_inner);
            if !status.has_process() {
                return Err(SupervisorError::NotRunning(server_id.to_string()));
            }
            let was = *status == ServerStatus::Stopping;
            *status = ServerStatus::Stopping;
            was
        };

        let mut exited = managed.exited.clone();
        if !already_stopping {
            self.emit_status(server_id, ServerStatus::Stopping, Some(managed.pid));
            let stop_cmd = managed.provider.stop_command();
            if let Err(e) = managed.write_line(&stop_cmd).await {
                tracing::warn!(server = %server_id, error = %e, "Failed to send stop command");
            }
        }

        let timeout = self.options.stop_timeout;
        let graceful = tokio::time::timeout(
            timeout,
            exited.wait_for(|s| matches!(s, ExitState::Exited(_))),
        )
        .await
        .is_ok();

        if !graceful {
            tracing::warn!(server = %server_id, timeout_secs = timeout.as_secs_f64(), "Server did not stop in time, killing");
            self.emit_console(
                server_id,
                ConsoleMessage::system(
                    ConsoleLevel::Warn,
                    format!(
                        "Server did not stop within {}s, forcing shutdown",
                        timeout.as_secs()
                    ),
                ),
            );
            managed.kill.notify_one();
            let _ = exited
                .wait_for(|s| matches!(s, ExitState::Exited(_)))
                .await;
        }

        tracing::info!("Stopped server '{}'", server_id);
        Ok(())
    }

    pub async fn restart(&self, server_id: &str) -> Result<RunningProcess, SupervisorError> {
        let (instance, provider) = self
            .servers
            .get(server_id)
            .map(|r| (r.instance.clone(), r.provider.clone()))
            .ok_or_else(|| SupervisorError::NotRunning(server_id.to_string()))?;
        self.stop(server_id).await?;
        self.start(instance, provider).await
    }

    pub async fn send_command(&self, server_id: &str, text: &str) -> Result<(), SupervisorError> {
        let managed = self
            .servers
            .get(server_id)
            .map(|r| r.value().clone())
            .filter(|m| m.status() == ServerStatus::Running)
            .ok_or_else(|| SupervisorError::NotRunning(server_id.to_string()))?;
        managed
            .write_line(text)
            .await
            .map_err(|source| SupervisorError::Stdin {
                id: server_id.to_string(),
                source,
            })
    }

    pub fn get_status(&self, server_id: &str) -> Option<RunningProcess> {
        self.servers.get(server_id).map(|r| r.snapshot())
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.servers.get(server_id).is_some_and(|r| {
            matches!(r.status(), ServerStatus::Starting | ServerStatus::Running)
        })
    }

    pub fn instance(&self, server_id: &str) -> Option<ServerInstance> {
        self.servers.get(server_id).map(|r| r.instance.clone())
    }

    pub fn list(&self) -> Vec<RunningProcess> {
        self.servers.iter().map(|r| r.snapshot()).collect()
    }

    /// Stops every server in parallel. One stuck server does not hold up the
    /// others, and failures are only logged.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.servers.iter().map(|r| r.key().clone()).collect();
        let results = futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, res) in ids.iter().zip(results) {
            if let Err(e) = res {
                tracing::error!(server = %id, error = %e, "stop_all: failed to stop server");
            }
        }
    }

    /// Signal-only kill of every tracked process. Safe to call from teardown
    /// code where no runtime is available.
    pub fn kill_all(&self) {
        let pids: Vec<(String, u32)> = self
            .servers
            .iter()
            .map(|r| (r.key().clone(), r.pid))
            .collect();
        for (id, pid) in pids {
            if !kill_pid(pid) {
                tracing::warn!(server = %id, pid, "kill_all: signal not delivered");
            }
        }
        self.servers.clear();
    }

    fn emit_status(&self, server_id: &str, status: ServerStatus, pid: Option<u32>) {
        let _ = self.events.send(SupervisorEvent::Status {
            server_id: server_id.to_string(),
            status,
            pid,
        });
    }

    fn emit_console(&self, server_id: &str, message: ConsoleMessage) {
        let _ = self.events.send(SupervisorEvent::Console {
            server_id: server_id.to_string(),
            message,
        });
    }
}

/// What the deploy pipeline needs from a server, local or behind an agent.
#[async_trait]
pub trait ServerControl: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent>;
    fn is_running(&self, server_id: &str) -> bool;
    async fn send_command(&self, server_id: &str, command: &str) -> anyhow::Result<()>;
    async fn restart(&self, server_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl ServerControl for ProcessSupervisor {
    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        ProcessSupervisor::subscribe(self)
    }

    fn is_running(&self, server_id: &str) -> bool {
        ProcessSupervisor::is_running(self, server_id)
    }

    async fn send_command(&self, server_id: &str, command: &str) -> anyhow::Result<()> {
        Ok(ProcessSupervisor::send_command(self, server_id, command).await?)
    }

    async fn restart(&self, server_id: &str) -> anyhow::Result<()> {
        ProcessSupervisor::restart(self, server_id).await?;
        Ok(())
    }
}

/// `JAVA_HOME/bin/java`, else the first `java` on `PATH`, else bare `java`.
pub fn resolve_java() -> PathBuf {
    let exe = if cfg!(windows) { "java.exe" } else { "java" };
    if let Some(home) = std::env::var_os("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join(exe);
        if candidate.is_file() {
            return candidate;
        }
    }
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(exe)
}

/// Kills JVMs left behind by a previous agent that died without cleaning up:
/// same jar, same working directory. Returns how many were found.
pub async fn kill_orphans(instance: &ServerInstance) -> usize {
    let instance = instance.clone();
    let killed = tokio::task::spawn_blocking(move || {
        let sys = sysinfo::System::new_all();
        let jar = instance.jar_path.to_string_lossy().into_owned();
        let mut killed = 0;
        for (pid, process) in sys.processes() {
            let cmd = process.cmd();
            let is_server = cmd.iter().any(|c| c.to_string_lossy().contains("java"))
                && cmd.iter().any(|c| c.to_string_lossy() == jar);
            if is_server && process.cwd() == Some(instance.working_dir.as_path()) {
                tracing::warn!(server = %instance.id, pid = %pid, "Found orphaned server, killing it");
                if process.kill() {
                    killed += 1;
                }
            }
        }
        killed
    })
    .await
    .unwrap_or(0);
    if killed > 0 {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    killed
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some_and(|p| p.kill())
}
