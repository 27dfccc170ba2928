//! Installs and launches `blockdev-agent` on a remote host over ssh/scp and
//! returns the token it generates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::is_valid_token;
use crate::config::{DEFAULT_AGENT_PORT, TOKEN_FILE};

pub const AGENT_BINARY: &str = "blockdev-agent";
pub const PID_FILE: &str = "agent.pid";
pub const LOG_FILE: &str = "agent.log";
pub const DEFAULT_REMOTE_DIR: &str = "~/.blockdev-agent";

const TOKEN_POLL_ATTEMPTS: u32 = 20;
const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOG_TAIL_LINES: u32 = 40;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{step} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Unexpected reply from host: {0:?}")]
    UnexpectedReply(String),
    #[error("Agent did not write a token after {attempts} attempts. Log tail:\n{log_tail}")]
    TokenTimeout { attempts: u32, log_tail: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs a local program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let out = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub remote_dir: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity: None,
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args
    }

    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = self.common_args("-p");
        args.push(self.destination());
        args.push(remote_command.to_string());
        args
    }

    pub fn scp_args(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut args = self.common_args("-P");
        args.push(local.to_string_lossy().into_owned());
        args.push(format!("{}:{}", self.destination(), remote_path));
        args
    }

    fn remote(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), name)
    }

    fn data_dir(&self) -> String {
        self.remote("data")
    }
}

/// Single-quotes `s` for a POSIX shell. A leading `~/` is left outside the
/// quotes so the remote shell still expands it.
pub fn shell_path(s: &str) -> String {
    if s == "~" {
        return "\"$HOME\"".to_string();
    }
    match s.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(s),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn mkdir_command(target: &SshTarget) -> String {
    format!("mkdir -p {}", shell_path(&target.data_dir()))
}

/// Kills only the pid recorded by a previous launch.
pub fn stop_previous_command(target: &SshTarget) -> String {
    let pid = shell_path(&target.remote(PID_FILE));
    format!(
        "if [ -f {pid} ]; then kill \"$(cat {pid})\" 2>/dev/null || true; rm -f {pid}; fi",
        pid = pid
    )
}

pub fn chmod_command(target: &SshTarget) -> String {
    format!("chmod +x {}", shell_path(&target.remote(AGENT_BINARY)))
}

pub fn remove_token_command(target: &SshTarget) -> String {
    format!(
        "rm -f {}",
        shell_path(&format!("{}/{}", target.data_dir(), TOKEN_FILE))
    )
}

pub fn launch_command(target: &SshTarget, agent_port: u16) -> String {
    format!(
        "cd {dir} && {{ nohup ./{bin} --port {port} --data-dir {data} > {log} 2>&1 < /dev/null & echo $! > {pid}; }}",
        dir = shell_path(&target.remote_dir),
        bin = AGENT_BINARY,
        port = agent_port,
        data = shell_path(&target.data_dir()),
        log = LOG_FILE,
        pid = PID_FILE,
    )
}

pub fn read_token_command(target: &SshTarget) -> String {
    format!(
        "cat {} 2>/dev/null",
        shell_path(&format!("{}/{}", target.data_dir(), TOKEN_FILE))
    )
}

pub fn log_tail_command(target: &SshTarget) -> String {
    format!(
        "tail -n {} {} 2>/dev/null",
        LOG_TAIL_LINES,
        shell_path(&target.remote(LOG_FILE))
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedAgent {
    pub host: String,
    pub port: u16,
    pub token: String,
}

pub struct HostProvisioner {
    target: SshTarget,
    runner: Arc<dyn CommandRunner>,
    agent_port: u16,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl HostProvisioner {
    pub fn new(target: SshTarget) -> Self {
        Self::with_runner(target, Arc::new(SystemRunner))
    }

    pub fn with_runner(target: SshTarget, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            target,
            runner,
            agent_port: DEFAULT_AGENT_PORT,
            poll_attempts: TOKEN_POLL_ATTEMPTS,
            poll_interval: TOKEN_POLL_INTERVAL,
        }
    }

    pub fn agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    pub fn token_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    async fn exec(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, ProvisionError> {
        tracing::debug!(program, host = %self.target.host, "Running {}", args.last().map(String::as_str).unwrap_or(""));
        self.runner
            .run(program, &args)
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: program.to_string(),
                source,
            })
    }

    async fn ssh(&self, step: &'static str, remote_command: &str) -> Result<CommandOutput, ProvisionError> {
        let out = self.exec("ssh", self.target.ssh_args(remote_command)).await?;
        if !out.success() {
            return Err(ProvisionError::CommandFailed {
                step,
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Pre-flight round trip.
    pub async fn test_connection(&self) -> Result<(), ProvisionError> {
        let out = self.ssh("connection test", "echo ok").await?;
        if out.stdout.trim() != "ok" {
            return Err(ProvisionError::UnexpectedReply(out.stdout));
        }
        Ok(())
    }

    /// Safe to repeat: a previous agent launched by this flow is replaced.
    pub async fn provision(&self, local_binary: &Path) -> Result<ProvisionedAgent, ProvisionError> {
        let host = self.target.host.clone();
        tracing::info!(host = %host, dir = %self.target.remote_dir, "Provisioning agent");

        self.ssh("create directory", &mkdir_command(&self.target)).await?;
        self.ssh("stop previous agent", &stop_previous_command(&self.target))
            .await?;

        let out = self
            .exec(
                "scp",
                self.target
                    .scp_args(local_binary, &self.target.remote(AGENT_BINARY)),
            )
            .await?;
        if !out.success() {
            return Err(ProvisionError::CommandFailed {
                step: "upload binary",
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }

        self.ssh("mark executable", &chmod_command(&self.target)).await?;
        self.ssh("remove stale token", &remove_token_command(&self.target))
            .await?;
        self.ssh("launch agent", &launch_command(&self.target, self.agent_port))
            .await?;

        for attempt in 1..=self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            let out = self
                .exec("ssh", self.target.ssh_args(&read_token_command(&self.target)))
                .await?;
            let token = out.stdout.trim();
            if out.success() && is_valid_token(token) {
                tracing::info!(host = %host, attempt, "Agent is up");
                return Ok(ProvisionedAgent {
                    host,
                    port: self.agent_port,
                    token: token.to_string(),
                });
            }
        }

        let log_tail = match self
            .exec("ssh", self.target.ssh_args(&log_tail_command(&self.target)))
            .await
        {
            Ok(out) => out.stdout.trim().to_string(),
            Err(e) => format!("(log unavailable: {})", e),
        };
        tracing::warn!(host = %host, "Agent did not come up");
        Err(ProvisionError::TokenTimeout {
            attempts: self.poll_attempts,
            log_tail,
        })
    }
}
