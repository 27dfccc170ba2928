use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::model::ServerInstance;

pub const DEFAULT_AGENT_PORT: u16 = 9847;
pub const TOKEN_FILE: &str = "auth.token";
pub const STATE_FILE: &str = "server.json";

const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2000;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn stop_timeout() -> Duration {
    Duration::from_secs(
        env_u64("BLOCKDEV_STOP_TIMEOUT_SECS")
            .map(|v| v.clamp(1, 300))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
    )
}

pub fn sample_interval() -> Duration {
    Duration::from_millis(
        env_u64("BLOCKDEV_SAMPLE_INTERVAL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
    )
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".blockdev-agent")
}

/// Where the agent keeps its token, server directory and uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_AGENT_PORT,
            data_dir: default_data_dir(),
        }
    }
}

impl AgentConfig {
    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    pub fn server_dir(&self) -> PathBuf {
        self.data_dir.join("server")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.data_dir.clone(), self.server_dir(), self.uploads_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// The server the agent was last set up with, restored across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentState {
    #[serde(default)]
    pub instance: Option<ServerInstance>,
}

pub async fn load_state(path: &Path) -> anyhow::Result<AgentState> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let state: AgentState =
                serde_json::from_str(&contents).context("Failed to parse server.json")?;
            Ok(state)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No saved server state, starting empty");
            Ok(AgentState::default())
        }
        Err(e) => Err(e).context("Failed to read server.json"),
    }
}

pub async fn save_state(path: &Path, state: &AgentState) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to serialize server state")?;
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .context("Failed to create temp state file")?;
    file.write_all(json.as_bytes())
        .await
        .context("Failed to write temp state file")?;
    file.flush().await.context("Failed to flush temp state file")?;
    file.sync_all().await.context("Failed to fsync temp state file")?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .context("Failed to rename temp state file")?;
    Ok(())
}
