//! JSON frames exchanged between [`crate::client::ConnectionClient`] and the
//! agent. One object per WebSocket text frame, discriminated by `type`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ConsoleLevel, ConsoleMessage, ConsoleSource, ServerStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentRequest {
    SetupServer {
        framework: String,
        mc_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        build: Option<String>,
        #[serde(default)]
        jvm_args: Vec<String>,
        port: u16,
    },
    StartServer,
    StopServer,
    RestartServer,
    SendCommand {
        command: String,
    },
    UploadArtifact {
        name: String,
        /// Base64 file contents.
        data: String,
    },
    DeployArtifact {
        name: String,
        target_dir: String,
    },
    GetStatus,
    GetRecentConsole {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
}

impl AgentRequest {
    /// The `type` tag, echoed back in `request-ack`.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentRequest::SetupServer { .. } => "setup-server",
            AgentRequest::StartServer => "start-server",
            AgentRequest::StopServer => "stop-server",
            AgentRequest::RestartServer => "restart-server",
            AgentRequest::SendCommand { .. } => "send-command",
            AgentRequest::UploadArtifact { .. } => "upload-artifact",
            AgentRequest::DeployArtifact { .. } => "deploy-artifact",
            AgentRequest::GetStatus => "get-status",
            AgentRequest::GetRecentConsole { .. } => "get-recent-console",
        }
    }
}

/// A console line as buffered by the agent and replayed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub line: String,
    pub level: ConsoleLevel,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl From<&ConsoleMessage> for ConsoleLine {
    fn from(msg: &ConsoleMessage) -> Self {
        Self {
            line: msg.text.clone(),
            level: msg.level,
            timestamp: msg.timestamp.timestamp_millis(),
        }
    }
}

impl ConsoleLine {
    pub fn into_message(self) -> ConsoleMessage {
        let timestamp: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        ConsoleMessage {
            timestamp,
            level: self.level,
            source: ConsoleSource::Stdout,
            text: self.line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    Console {
        line: String,
        level: ConsoleLevel,
        timestamp: i64,
    },
    Status {
        server_status: ServerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        players: Option<Vec<String>>,
    },
    ProcessStats {
        cpu: f64,
        /// Resident memory in MB.
        memory: f64,
        #[serde(default)]
        tps: Option<f64>,
    },
    SetupProgress {
        stage: String,
        percent: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Heartbeat {
        uptime: u64,
        server_status: ServerStatus,
    },
    RecentConsole {
        lines: Vec<ConsoleLine>,
    },
    RequestAck {
        request_type: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentEvent {
    pub fn console(line: ConsoleLine) -> Self {
        AgentEvent::Console {
            line: line.line,
            level: line.level,
            timestamp: line.timestamp,
        }
    }

    pub fn ack(request: &AgentRequest, result: Result<(), String>) -> Self {
        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        AgentEvent::RequestAck {
            request_type: request.kind().to_string(),
            success,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_server_wire_shape() {
        let req: AgentRequest = serde_json::from_value(json!({
            "type": "setup-server",
            "framework": "paper",
            "mcVersion": "1.21.1",
            "build": "120",
            "jvmArgs": ["-Xmx4G"],
            "port": 25565
        }))
        .unwrap();
        assert_eq!(
            req,
            AgentRequest::SetupServer {
                framework: "paper".into(),
                mc_version: "1.21.1".into(),
                build: Some("120".into()),
                jvm_args: vec!["-Xmx4G".into()],
                port: 25565,
            }
        );
        assert_eq!(req.kind(), "setup-server");
    }

    #[test]
    fn unit_requests_are_bare_tags() {
        assert_eq!(
            serde_json::to_value(AgentRequest::GetStatus).unwrap(),
            json!({"type": "get-status"})
        );
        let req: AgentRequest =
            serde_json::from_value(json!({"type": "get-recent-console"})).unwrap();
        assert_eq!(req, AgentRequest::GetRecentConsole { lines: None });
    }

    #[test]
    fn status_event_omits_missing_pid() {
        let ev = AgentEvent::Status {
            server_status: ServerStatus::Stopped,
            pid: None,
            players: None,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "status", "serverStatus": "stopped"})
        );
    }

    #[test]
    fn ack_carries_error() {
        let ev = AgentEvent::ack(&AgentRequest::StartServer, Err("no server configured".into()));
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "type": "request-ack",
                "requestType": "start-server",
                "success": false,
                "error": "no server configured"
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<AgentRequest>(r#"{"type":"format-disk"}"#).is_err());
    }
}
