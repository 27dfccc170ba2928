use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config;
use crate::console::ConsoleSignal;
use crate::inspect::{self, ProcessInspector};
use crate::model::ServerResourceStats;

/// Absorbs measurement noise; four fully busy logical cores.
pub const MAX_CPU_PERCENT: f64 = 400.0;
pub const WORLD_SIZE_INTERVAL: Duration = Duration::from_secs(10);

const MIB: f64 = 1024.0 * 1024.0;

/// `clamp(cpu_delta / wall_delta * 100, 0, 400)`, both in seconds.
pub fn cpu_percent(cpu_delta_secs: f64, wall_delta_secs: f64) -> f64 {
    if wall_delta_secs <= 0.0 || !cpu_delta_secs.is_finite() {
        return 0.0;
    }
    (cpu_delta_secs / wall_delta_secs * 100.0).clamp(0.0, MAX_CPU_PERCENT)
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub interval: Duration,
    pub world_interval: Duration,
    /// Run `jstat` for heap figures; RSS is used when disabled or unavailable.
    pub probe_heap: bool,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            interval: config::sample_interval(),
            world_interval: WORLD_SIZE_INTERVAL,
            probe_heap: true,
        }
    }
}

struct MonitoredProcess {
    pid: u32,
    /// When the process was spawned, not when monitoring began.
    started_at: DateTime<Utc>,
    last_cpu: Option<(Duration, Instant)>,
    heap_supported: bool,
    tps: Option<f64>,
    players: Option<Vec<String>>,
    world_size_mb: Option<f64>,
    latest: Option<ServerResourceStats>,
}

impl MonitoredProcess {
    /// Percent over the interval since the previous call; the first call
    /// has nothing to compare against and reports 0.
    fn record_cpu(&mut self, cpu_time: Duration, now: Instant) -> f64 {
        let percent = match self.last_cpu {
            Some((prev_cpu, prev_at)) => cpu_percent(
                cpu_time.saturating_sub(prev_cpu).as_secs_f64(),
                now.saturating_duration_since(prev_at).as_secs_f64(),
            ),
            None => 0.0,
        };
        self.last_cpu = Some((cpu_time, now));
        percent
    }
}

struct Monitor {
    state: Arc<StdMutex<MonitoredProcess>>,
    poll: JoinHandle<()>,
    world: JoinHandle<()>,
}

impl Monitor {
    fn abort(&self) {
        self.poll.abort();
        self.world.abort();
    }
}

/// Polls OS-level metrics for running servers on independent timers.
#[derive(Clone)]
pub struct ResourceSampler {
    monitors: Arc<DashMap<String, Monitor>>,
    inspector: Arc<dyn ProcessInspector>,
    stats_tx: broadcast::Sender<ServerResourceStats>,
    options: SamplerOptions,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(SamplerOptions::default())
    }
}

impl ResourceSampler {
    pub fn new(options: SamplerOptions) -> Self {
        Self::with_inspector(inspect::platform_inspector(), options)
    }

    pub fn with_inspector(inspector: Arc<dyn ProcessInspector>, options: SamplerOptions) -> Self {
        let (stats_tx, _) = broadcast::channel(64);
        Self {
            monitors: Arc::new(DashMap::new()),
            inspector,
            stats_tx,
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerResourceStats> {
        self.stats_tx.subscribe()
    }

    pub fn is_monitoring(&self, server_id: &str) -> bool {
        self.monitors.contains_key(server_id)
    }

    /// Starts both timers for `server_id`, replacing any previous monitor.
    /// Uptime is reported relative to `started_at`.
    pub fn start_monitoring(
        &self,
        server_id: &str,
        pid: u32,
        started_at: DateTime<Utc>,
        world_dir: PathBuf,
    ) {
        self.stop_monitoring(server_id);

        let state = Arc::new(StdMutex::new(MonitoredProcess {
            pid,
            started_at,
            last_cpu: None,
            heap_supported: self.options.probe_heap,
            tps: None,
            players: None,
            world_size_mb: None,
            latest: None,
        }));

        let poll = {
            let this = self.clone();
            let state = state.clone();
            let id = server_id.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.options.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Some(stats) = this.sample_once(&id, &state).await {
                        let _ = this.stats_tx.send(stats);
                    }
                }
            })
        };

        // The directory walk is I/O-bound and must not delay the fast path.
        let world = {
            let state = state.clone();
            let interval = self.options.world_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let dir = world_dir.clone();
                    let size = tokio::task::spawn_blocking(move || dir_size_bytes(&dir))
                        .await
                        .ok()
                        .flatten();
                    let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                    st.world_size_mb = size.map(|b| b as f64 / MIB);
                }
            })
        };

        tracing::debug!(server = %server_id, pid, "resource monitoring started");
        self.monitors
            .insert(server_id.to_string(), Monitor { state, poll, world });
    }

    async fn sample_once(
        &self,
        server_id: &str,
        state: &Arc<StdMutex<MonitoredProcess>>,
    ) -> Option<ServerResourceStats> {
        let (pid, probe_heap) = {
            let st = state.lock().unwrap_or_else(PoisonError::into_inner);
            (st.pid, st.heap_supported)
        };

        let Some(sample) = self.inspector.sample(pid).await else {
            tracing::debug!(server = %server_id, pid, "process sample unavailable");
            return None;
        };
        let heap = if probe_heap {
            inspect::probe_heap(pid).await
        } else {
            None
        };

        let now = Instant::now();
        let rss_mb = sample.rss_bytes as f64 / MIB;
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        if probe_heap && heap.is_none() {
            tracing::debug!(server = %server_id, "jstat unavailable, reporting RSS as heap");
            st.heap_supported = false;
        }
        let cpu = st.record_cpu(sample.cpu_time, now);
        let (heap_used_mb, heap_max_mb) = match heap {
            Some(h) => (h.used_bytes as f64 / MIB, h.max_bytes as f64 / MIB),
            None => (rss_mb, rss_mb),
        };
        let stats = ServerResourceStats {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            heap_used_mb,
            heap_max_mb,
            rss_mb,
            cpu_percent: cpu,
            uptime_seconds: uptime_secs(st.started_at, Utc::now()),
            tps: st.tps,
            player_count: st.players.as_ref().map(|p| p.len() as u32),
            player_list: st.players.clone().unwrap_or_default(),
            world_size_mb: st.world_size_mb,
        };
        st.latest = Some(stats.clone());
        Some(stats)
    }

    pub fn latest(&self, server_id: &str) -> Option<ServerResourceStats> {
        let monitor = self.monitors.get(server_id)?;
        let st = monitor.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.latest.clone()
    }

    fn with_state(&self, server_id: &str, f: impl FnOnce(&mut MonitoredProcess)) {
        if let Some(monitor) = self.monitors.get(server_id) {
            let mut st = monitor.state.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut st);
        }
    }

    pub fn update_tps(&self, server_id: &str, tps: f64) {
        self.with_state(server_id, |st| st.tps = Some(tps));
    }

    pub fn update_players(&self, server_id: &str, players: Vec<String>) {
        self.with_state(server_id, |st| st.players = Some(players));
    }

    pub fn players(&self, server_id: &str) -> Option<Vec<String>> {
        let monitor = self.monitors.get(server_id)?;
        let st = monitor.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.players.clone()
    }

    /// Feeds a signal scraped from the console into the push-only fields.
    pub fn apply_signal(&self, server_id: &str, signal: ConsoleSignal) {
        self.with_state(server_id, |st| match signal {
            ConsoleSignal::Tps(tps) => st.tps = Some(tps),
            ConsoleSignal::PlayerList(list) => st.players = Some(list),
            ConsoleSignal::PlayerJoined(name) => {
                let players = st.players.get_or_insert_with(Vec::new);
                if !players.contains(&name) {
                    players.push(name);
                }
            }
            ConsoleSignal::PlayerLeft(name) => {
                if let Some(players) = st.players.as_mut() {
                    players.retain(|p| *p != name);
                }
            }
        });
    }

    pub fn stop_monitoring(&self, server_id: &str) {
        if let Some((_, monitor)) = self.monitors.remove(server_id) {
            monitor.abort();
            tracing::debug!(server = %server_id, "resource monitoring stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.monitors.iter().map(|m| m.key().clone()).collect();
        for id in ids {
            self.stop_monitoring(&id);
        }
    }
}

/// Total bytes of regular files under `dir`; `None` if it is not a directory.
fn uptime_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - started_at).num_seconds()).unwrap_or(0)
}

pub fn dir_size_bytes(dir: &Path) -> Option<u64> {
    if !dir.is_dir() {
        return None;
    }
    let total = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::ProcessSample;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Burns exactly one CPU-second per sample.
    #[derive(Default)]
    struct FakeInspector {
        calls: AtomicU64,
    }

    #[async_trait]
    impl ProcessInspector for FakeInspector {
        async fn sample(&self, _pid: u32) -> Option<ProcessSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Some(ProcessSample {
                rss_bytes: 512 * 1024 * 1024,
                cpu_time: Duration::from_secs(n),
            })
        }
    }

    fn options() -> SamplerOptions {
        SamplerOptions {
            interval: Duration::from_secs(2),
            world_interval: WORLD_SIZE_INTERVAL,
            probe_heap: false,
        }
    }

    #[test]
    fn cpu_percent_formula_and_clamp() {
        assert_eq!(cpu_percent(1.0, 2.0), 50.0);
        assert_eq!(cpu_percent(3.0, 1.0), 300.0);
        assert_eq!(cpu_percent(10.0, 1.0), MAX_CPU_PERCENT);
        assert_eq!(cpu_percent(-1.0, 1.0), 0.0);
        assert_eq!(cpu_percent(1.0, 0.0), 0.0);
    }

    #[test]
    fn record_cpu_is_a_trailing_interval() {
        let t0 = Instant::now();
        let mut mp = MonitoredProcess {
            pid: 1,
            started_at: Utc::now(),
            last_cpu: None,
            heap_supported: false,
            tps: None,
            players: None,
            world_size_mb: None,
            latest: None,
        };
        assert_eq!(mp.record_cpu(Duration::from_secs(100), t0), 0.0);
        let t1 = t0 + Duration::from_secs(4);
        assert_eq!(mp.record_cpu(Duration::from_secs(102), t1), 50.0);
        let t2 = t1 + Duration::from_secs(1);
        assert_eq!(mp.record_cpu(Duration::from_secs(103), t2), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_snapshots_with_pushed_fields() {
        let sampler = ResourceSampler::with_inspector(Arc::new(FakeInspector::default()), options());
        let mut rx = sampler.subscribe();
        let spawned = Utc::now() - chrono::Duration::seconds(90);
        sampler.start_monitoring("dev", 4242, spawned, PathBuf::from("/nonexistent/world"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.cpu_percent, 0.0);
        assert!(first.uptime_seconds >= 90, "uptime {}", first.uptime_seconds);
        assert_eq!(first.rss_mb, 512.0);
        assert_eq!(first.heap_used_mb, first.rss_mb);
        assert_eq!(first.tps, None);
        assert_eq!(first.player_count, None);

        sampler.update_tps("dev", 19.5);
        sampler.apply_signal("dev", ConsoleSignal::PlayerJoined("Steve".into()));
        sampler.apply_signal("dev", ConsoleSignal::PlayerJoined("Alex".into()));
        sampler.apply_signal("dev", ConsoleSignal::PlayerLeft("Steve".into()));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.cpu_percent, 50.0);
        assert_eq!(second.tps, Some(19.5));
        assert_eq!(second.player_count, Some(1));
        assert_eq!(second.player_list, vec!["Alex".to_string()]);
        assert_eq!(second.world_size_mb, None);

        sampler.stop_monitoring("dev");
        assert!(!sampler.is_monitoring("dev"));
        assert!(sampler.latest("dev").is_none());
    }

    #[test]
    fn uptime_counts_from_spawn_and_never_goes_negative() {
        let spawned = Utc::now();
        assert_eq!(uptime_secs(spawned, spawned + chrono::Duration::seconds(75)), 75);
        assert_eq!(uptime_secs(spawned, spawned - chrono::Duration::seconds(5)), 0);
    }

    #[test]
    fn world_size_counts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let region = tmp.path().join("region");
        std::fs::create_dir_all(&region).unwrap();
        std::fs::write(tmp.path().join("level.dat"), vec![0u8; 100]).unwrap();
        std::fs::write(region.join("r.0.0.mca"), vec![0u8; 4096]).unwrap();
        assert_eq!(dir_size_bytes(tmp.path()), Some(4196));
        assert_eq!(dir_size_bytes(&tmp.path().join("missing")), None);
    }
}
