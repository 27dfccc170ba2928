use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one supervised server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }

    /// True while an OS process backs this status and its pid is meaningful.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch parameters for one server. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    pub id: String,
    pub framework: String,
    pub mc_version: String,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub jvm_args: Vec<String>,
    pub port: u16,
    pub working_dir: PathBuf,
    pub jar_path: PathBuf,
}

impl ServerInstance {
    pub fn world_dir(&self) -> PathBuf {
        self.working_dir.join("world")
    }
}

/// Externally visible snapshot of a managed server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcess {
    pub server_id: String,
    pub pid: Option<u32>,
    pub status: ServerStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl ConsoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Error => "error",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => ConsoleLevel::Error,
            "warn" => ConsoleLevel::Warn,
            "debug" => ConsoleLevel::Debug,
            _ => ConsoleLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleSource {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub timestamp: DateTime<Utc>,
    pub level: ConsoleLevel,
    pub source: ConsoleSource,
    pub text: String,
}

impl ConsoleMessage {
    /// A line produced by the supervisor itself rather than the child process.
    pub fn system(level: ConsoleLevel, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: ConsoleSource::System,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResourceStats {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    pub heap_used_mb: f64,
    pub heap_max_mb: f64,
    pub rss_mb: f64,
    pub cpu_percent: f64,
    pub uptime_seconds: u64,
    pub tps: Option<f64>,
    pub player_count: Option<u32>,
    pub player_list: Vec<String>,
    pub world_size_mb: Option<f64>,
}

/// How disruptive applying new code to a running server is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadCapability {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything a supervisor (local or remote) reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Console {
        server_id: String,
        message: ConsoleMessage,
    },
    Status {
        server_id: String,
        status: ServerStatus,
        pid: Option<u32>,
    },
}

impl SupervisorEvent {
    pub fn server_id(&self) -> &str {
        match self {
            SupervisorEvent::Console { server_id, .. } => server_id,
            SupervisorEvent::Status { server_id, .. } => server_id,
        }
    }
}

/// Uniform success flag plus message for UI-facing callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T, E: fmt::Display> From<Result<T, E>> for OpResult {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(_) => OpResult {
                success: true,
                message: None,
            },
            Err(e) => OpResult {
                success: false,
                message: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_uses_camel_case_fields() {
        let json = serde_json::json!({
            "id": "dev",
            "framework": "paper",
            "mcVersion": "1.21.1",
            "port": 25565,
            "workingDir": "/srv/dev",
            "jarPath": "/srv/dev/server.jar"
        });
        let inst: ServerInstance = serde_json::from_value(json).unwrap();
        assert_eq!(inst.mc_version, "1.21.1");
        assert!(inst.jvm_args.is_empty());
        assert_eq!(inst.world_dir(), PathBuf::from("/srv/dev/world"));
    }

    #[test]
    fn op_result_carries_error_text() {
        let res: Result<(), String> = Err("server 'a' is not running".into());
        let op = OpResult::from(res);
        assert!(!op.success);
        assert_eq!(op.message.as_deref(), Some("server 'a' is not running"));
    }

    #[test]
    fn only_live_statuses_have_a_process() {
        assert!(ServerStatus::Stopping.has_process());
        assert!(!ServerStatus::Stopped.has_process());
        assert!(!ServerStatus::Error.has_process());
    }
}
