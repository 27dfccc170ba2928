use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::model::{OpResult, ReloadCapability, ServerInstance};
use crate::provider::FrameworkProvider;
use crate::supervisor::ServerControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingKind {
    /// Sources are copied as-is into `target_dir`, relative to the server root.
    Script { target_dir: PathBuf },
    /// `command` runs in the source directory and must produce `artifact`
    /// (relative to it), which the provider then installs.
    Build { command: String, artifact: PathBuf },
}

/// Ties a source directory in a project to where its output lands on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentMapping {
    pub name: String,
    pub source_dir: PathBuf,
    pub kind: MappingKind,
}

#[derive(Clone)]
pub struct DeployTarget {
    pub server: ServerInstance,
    pub provider: Arc<dyn FrameworkProvider>,
    pub mappings: Vec<DeploymentMapping>,
}

impl DeployTarget {
    /// Mappings whose source tree contains `changed`.
    pub fn mappings_for(&self, changed: &Path) -> Vec<&DeploymentMapping> {
        self.mappings
            .iter()
            .filter(|m| changed.starts_with(&m.source_dir))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Copy,
    Build,
    Deploy,
    Reload,
    Restart,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    pub server_id: String,
    pub mapping: String,
    pub stage: DeployStage,
    pub message: String,
}

pub struct Deployer {
    control: Arc<dyn ServerControl>,
    events: broadcast::Sender<DeployEvent>,
}

impl Deployer {
    pub fn new(control: Arc<dyn ServerControl>) -> Self {
        let (events, _) = broadcast::channel(512);
        Self { control, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.events.subscribe()
    }

    fn report(&self, server_id: &str, mapping: &str, stage: DeployStage, message: impl Into<String>) {
        let _ = self.events.send(DeployEvent {
            server_id: server_id.to_string(),
            mapping: mapping.to_string(),
            stage,
            message: message.into(),
        });
    }

    /// Runs each mapping in turn. A failing mapping is reported and skipped;
    /// the rest still run.
    pub async fn deploy(&self, target: &DeployTarget, mappings: &[&DeploymentMapping]) -> Vec<(String, OpResult)> {
        let mut results = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let res = self.run_mapping(target, mapping).await;
            if let Err(e) = &res {
                tracing::warn!(server = %target.server.id, mapping = %mapping.name, error = %e, "Deployment failed");
                self.report(&target.server.id, &mapping.name, DeployStage::Failed, format!("{:#}", e));
            }
            results.push((mapping.name.clone(), OpResult::from(res.map_err(|e| format!("{:#}", e)))));
        }
        results
    }

    pub async fn deploy_all(&self, target: &DeployTarget) -> Vec<(String, OpResult)> {
        let all: Vec<&DeploymentMapping> = target.mappings.iter().collect();
        self.deploy(target, &all).await
    }

    async fn run_mapping(&self, target: &DeployTarget, mapping: &DeploymentMapping) -> anyhow::Result<()> {
        let server = &target.server;
        match &mapping.kind {
            MappingKind::Script { target_dir } => {
                let dest = server.working_dir.join(target_dir);
                let copied = copy_tree(&mapping.source_dir, &dest).await?;
                self.report(
                    &server.id,
                    &mapping.name,
                    DeployStage::Copy,
                    format!("Copied {} file(s) to {}", copied, dest.display()),
                );
                if self.control.is_running(&server.id) {
                    match target.provider.reload_command() {
                        Some(cmd) => {
                            self.control.send_command(&server.id, &cmd).await?;
                            self.report(&server.id, &mapping.name, DeployStage::Reload, format!("Sent '{}'", cmd));
                        }
                        None => self.report(
                            &server.id,
                            &mapping.name,
                            DeployStage::Reload,
                            "No reload command; changes apply on next start",
                        ),
                    }
                }
            }
            MappingKind::Build { command, artifact } => {
                self.report(&server.id, &mapping.name, DeployStage::Build, format!("Running '{}'", command));
                self.run_build(&server.id, &mapping.name, command, &mapping.source_dir)
                    .await?;

                let artifact = mapping.source_dir.join(artifact);
                if !artifact.is_file() {
                    bail!("Build succeeded but {} was not produced", artifact.display());
                }
                let dest = target.provider.deploy(&artifact, server).await?;
                self.report(
                    &server.id,
                    &mapping.name,
                    DeployStage::Deploy,
                    format!("Installed {}", dest.display()),
                );

                if self.control.is_running(&server.id) {
                    self.apply(target, mapping).await?;
                }
            }
        }
        self.report(&server.id, &mapping.name, DeployStage::Done, "Deployed");
        Ok(())
    }

    /// Reloads for hot/warm frameworks, restarts for cold ones (or when no
    /// reload command exists).
    async fn apply(&self, target: &DeployTarget, mapping: &DeploymentMapping) -> anyhow::Result<()> {
        let server_id = &target.server.id;
        let reload = match target.provider.reload_capability() {
            ReloadCapability::Hot | ReloadCapability::Warm => target.provider.reload_command(),
            ReloadCapability::Cold => None,
        };
        match reload {
            Some(cmd) => {
                self.control.send_command(server_id, &cmd).await?;
                self.report(server_id, &mapping.name, DeployStage::Reload, format!("Sent '{}'", cmd));
            }
            None => {
                self.report(server_id, &mapping.name, DeployStage::Restart, "Restarting server");
                self.control.restart(server_id).await?;
            }
        }
        Ok(())
    }

    async fn run_build(&self, server_id: &str, mapping: &str, command: &str, cwd: &Path) -> anyhow::Result<()> {
        let mut cmd = shell_command(command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to run '{}'", command))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(out) = child.stdout.take() {
            forward_lines(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, tx.clone());
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            self.report(server_id, mapping, DeployStage::Build, line);
        }
        let status = child.wait().await.context("Failed to wait for build")?;
        if !status.success() {
            bail!(
                "Build command exited with code {}",
                status.code().map_or_else(|| "unknown".to_string(), |c| c.to_string())
            );
        }
        Ok(())
    }
}

fn shell_command(command: &str) -> tokio::process::Command {
    if cfg!(windows) {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Copies every file under `src` into `dest`, keeping relative paths.
pub async fn copy_tree(src: &Path, dest: &Path) -> anyhow::Result<usize> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut copied = 0;
        for entry in walkdir::WalkDir::new(&src) {
            let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&src)?;
            let to = dest.join(rel);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &to)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
        Ok(copied)
    })
    .await?
}
