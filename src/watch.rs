//! Project file watching: notify events, filtered by the provider's globs,
//! debounced per path, then handed to the [`Deployer`].

use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::deploy::{DeployEvent, DeployTarget, Deployer};

pub const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChanged {
    pub server_id: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Directories to watch for a set of globs: each glob's leading literal
/// components, minus any root already covered by another.
pub fn watch_roots(patterns: &[String]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = patterns.iter().map(|p| literal_root(p)).collect();
    roots.sort();
    roots.dedup();
    let mut out: Vec<PathBuf> = Vec::new();
    for root in roots {
        if !out.iter().any(|kept| root.starts_with(kept)) {
            out.push(root);
        }
    }
    out
}

fn literal_root(pattern: &str) -> PathBuf {
    let parts: Vec<&str> = pattern.split(['/', '\\']).filter(|p| !p.is_empty()).collect();
    let literal = parts
        .iter()
        .take_while(|p| !p.contains(['*', '?', '[', '{']))
        .count();
    // A fully literal pattern names a file; watch its directory.
    let keep = if literal == parts.len() {
        literal.saturating_sub(1)
    } else {
        literal
    };
    parts[..keep].iter().collect()
}

/// Collapses bursts per key: only the last value triggered within `delay`
/// of the previous one is emitted.
#[derive(Clone)]
pub struct Debouncer<K, V> {
    delay: Duration,
    pending: Arc<DashMap<K, u64>>,
    seq: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<(K, V)>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<(K, V)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            delay,
            pending: Arc::new(DashMap::new()),
            seq: Arc::new(AtomicU64::new(0)),
            tx,
        };
        (debouncer, rx)
    }

    pub fn trigger(&self, key: K, value: V) {
        let ticket = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(key.clone(), ticket);
        let pending = self.pending.clone();
        let tx = self.tx.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if pending.remove_if(&key, |_, t| *t == ticket).is_some() {
                let _ = tx.send((key, value));
            }
        });
    }

    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}

/// One project directory bound to one server.
#[derive(Clone)]
pub struct WatchSpec {
    pub project_dir: PathBuf,
    /// Globs relative to `project_dir`; the provider's watch patterns if empty.
    pub patterns: Vec<String>,
    pub target: DeployTarget,
    pub auto_deploy: bool,
}

struct ActiveWatch {
    _watcher: StdMutex<RecommendedWatcher>,
    task: JoinHandle<()>,
    debouncer: Debouncer<PathBuf, ChangeKind>,
}

#[derive(Clone)]
pub struct FileWatchPipeline {
    deployer: Arc<Deployer>,
    watches: Arc<DashMap<String, ActiveWatch>>,
    auto_deploy: Arc<DashMap<String, bool>>,
    changes: broadcast::Sender<FileChanged>,
    delay: Duration,
}

impl FileWatchPipeline {
    pub fn new(deployer: Arc<Deployer>) -> Self {
        Self::with_delay(deployer, DEBOUNCE)
    }

    pub fn with_delay(deployer: Arc<Deployer>, delay: Duration) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            deployer,
            watches: Arc::new(DashMap::new()),
            auto_deploy: Arc::new(DashMap::new()),
            changes,
            delay,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileChanged> {
        self.changes.subscribe()
    }

    pub fn subscribe_deploy(&self) -> broadcast::Receiver<DeployEvent> {
        self.deployer.subscribe()
    }

    pub fn set_auto_deploy(&self, server_id: &str, enabled: bool) {
        self.auto_deploy.insert(server_id.to_string(), enabled);
    }

    pub fn auto_deploy(&self, server_id: &str) -> bool {
        self.auto_deploy.get(server_id).is_some_and(|v| *v)
    }

    pub fn is_watching(&self, server_id: &str) -> bool {
        self.watches.contains_key(server_id)
    }

    /// Replaces any existing watch for the same server.
    pub fn watch(&self, spec: WatchSpec) -> anyhow::Result<()> {
        let server_id = spec.target.server.id.clone();
        self.unwatch(&server_id);

        let patterns = if spec.patterns.is_empty() {
            spec.target.provider.watch_patterns()
        } else {
            spec.patterns.clone()
        };
        let globs = build_globset(&patterns)?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(ev) => {
                    let _ = raw_tx.send(ev);
                }
                Err(e) => tracing::warn!(error = %e, "File watcher error"),
            }
        })
        .context("Failed to create file watcher")?;

        let mut watched = 0;
        for root in watch_roots(&patterns) {
            let dir = spec.project_dir.join(&root);
            match watcher.watch(&dir, RecursiveMode::Recursive) {
                Ok(()) => {
                    watched += 1;
                    tracing::info!(server = %server_id, dir = %dir.display(), "Watching");
                }
                Err(e) => tracing::warn!(server = %server_id, dir = %dir.display(), error = %e, "Cannot watch directory"),
            }
        }
        if watched == 0 {
            anyhow::bail!(
                "Nothing to watch under {} for {:?}",
                spec.project_dir.display(),
                patterns
            );
        }

        let (debouncer, mut settled) = Debouncer::<PathBuf, ChangeKind>::new(self.delay);
        self.auto_deploy.insert(server_id.clone(), spec.auto_deploy);

        let task = {
            let this = self.clone();
            let debouncer = debouncer.clone();
            let project_dir = spec.project_dir.clone();
            let target = spec.target;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        ev = raw_rx.recv() => match ev {
                            Some(ev) => {
                                let Some(kind) = change_kind(&ev.kind) else { continue };
                                for path in ev.paths {
                                    let rel = path.strip_prefix(&project_dir).unwrap_or(&path);
                                    if globs.is_match(rel) {
                                        debouncer.trigger(path, kind);
                                    }
                                }
                            }
                            None => break,
                        },
                        settled = settled.recv() => match settled {
                            Some((path, kind)) => this.on_settled(&target, path, kind).await,
                            None => break,
                        }
                    }
                }
            })
        };

        self.watches.insert(
            server_id,
            ActiveWatch {
                _watcher: StdMutex::new(watcher),
                task,
                debouncer,
            },
        );
        Ok(())
    }

    async fn on_settled(&self, target: &DeployTarget, path: PathBuf, kind: ChangeKind) {
        let server_id = target.server.id.clone();
        tracing::debug!(server = %server_id, path = %path.display(), ?kind, "File changed");
        let _ = self.changes.send(FileChanged {
            server_id: server_id.clone(),
            path: path.clone(),
            kind,
        });
        if kind == ChangeKind::Removed || !self.auto_deploy(&server_id) {
            return;
        }
        let mappings = target.mappings_for(&path);
        if mappings.is_empty() {
            return;
        }
        self.deployer.deploy(target, &mappings).await;
    }

    pub fn unwatch(&self, server_id: &str) {
        if let Some((_, active)) = self.watches.remove(server_id) {
            active.debouncer.cancel_all();
            active.task.abort();
            tracing::info!(server = %server_id, "Stopped watching");
        }
    }

    pub fn unwatch_all(&self) {
        let ids: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
        for id in ids {
            self.unwatch(&id);
        }
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).with_context(|| format!("Invalid watch pattern '{}'", p))?);
    }
    Ok(builder.build()?)
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Access(_) => None,
    }
}
