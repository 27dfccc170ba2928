//! OS-level process introspection.
//!
//! One [`ProcessInspector`] is picked per platform at construction time:
//! `/proc` on Linux, `ps` on macOS, and `sysinfo` everywhere else (Windows
//! included). The JVM heap probe shells out to the JDK's `jstat`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Raw OS counters for one process at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub rss_bytes: u64,
    /// Cumulative user + system CPU time since the process started.
    pub cpu_time: Duration,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// `None` when the process is gone or the platform query failed.
    async fn sample(&self, pid: u32) -> Option<ProcessSample>;
}

pub fn platform_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcFsInspector::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(PsInspector)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(SysinfoInspector::new())
    }
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
pub struct ProcFsInspector {
    ticks_per_sec: u64,
}

#[cfg(target_os = "linux")]
impl ProcFsInspector {
    pub fn new() -> Self {
        use nix::unistd::{sysconf, SysconfVar};
        let ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(v)) if v > 0 => v as u64,
            _ => 100,
        };
        Self {
            ticks_per_sec: ticks,
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcFsInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl ProcessInspector for ProcFsInspector {
    async fn sample(&self, pid: u32) -> Option<ProcessSample> {
        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await.ok()?;
        let ticks = parse_proc_stat_ticks(&stat)?;
        let rss_kb = parse_status_rss_kb(&status).unwrap_or(0);
        Some(ProcessSample {
            rss_bytes: rss_kb * 1024,
            cpu_time: Duration::from_secs_f64(ticks as f64 / self.ticks_per_sec as f64),
        })
    }
}

/// utime + stime in clock ticks. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_proc_stat_ticks(stat: &str) -> Option<u64> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

pub fn parse_status_rss_kb(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let v = line.strip_prefix("VmRSS:")?;
        v.trim().trim_end_matches("kB").trim().parse().ok()
    })
}

/// `ps -o rss=,time= -p <pid>` for macOS.
#[cfg(target_os = "macos")]
pub struct PsInspector;

#[cfg(target_os = "macos")]
#[async_trait]
impl ProcessInspector for PsInspector {
    async fn sample(&self, pid: u32) -> Option<ProcessSample> {
        let out = tokio::process::Command::new("ps")
            .args(["-o", "rss=,time=", "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        if !out.status.success() {
            return None;
        }
        parse_ps_output(&String::from_utf8_lossy(&out.stdout))
    }
}

/// One `<rss-kb> <cputime>` row.
pub fn parse_ps_output(out: &str) -> Option<ProcessSample> {
    let mut fields = out.split_whitespace();
    let rss_kb: u64 = fields.next()?.parse().ok()?;
    let cpu_time = parse_cpu_time(fields.next()?)?;
    Some(ProcessSample {
        rss_bytes: rss_kb * 1024,
        cpu_time,
    })
}

/// `[[dd-]hh:]mm:ss[.ff]` as printed by `ps`.
pub fn parse_cpu_time(s: &str) -> Option<Duration> {
    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };
    let mut secs = 0f64;
    for part in clock.split(':') {
        secs = secs * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(Duration::from_secs_f64(secs + (days * 86_400) as f64))
}

/// Portable fallback backed by `sysinfo`.
///
/// sysinfo only reports CPU usage over the interval between two refreshes, so
/// the cumulative CPU time is integrated here from those readings.
pub struct SysinfoInspector {
    inner: Mutex<SysinfoState>,
}

struct SysinfoState {
    system: sysinfo::System,
    clocks: HashMap<u32, CpuClock>,
}

#[derive(Debug, Clone, Copy)]
struct CpuClock {
    last_refresh: Instant,
    total: Duration,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SysinfoState {
                system: sysinfo::System::new(),
                clocks: HashMap::new(),
            }),
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds `elapsed` wall time spent at `usage_percent` (100 = one full core).
fn accumulate_cpu(total: Duration, usage_percent: f32, elapsed: Duration) -> Duration {
    if !usage_percent.is_finite() || usage_percent <= 0.0 {
        return total;
    }
    total + elapsed.mul_f64(f64::from(usage_percent) / 100.0)
}

#[async_trait]
impl ProcessInspector for SysinfoInspector {
    async fn sample(&self, pid: u32) -> Option<ProcessSample> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate};
        let sys_pid = Pid::from_u32(pid);
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        state.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let now = Instant::now();
        let Some(proc) = state.system.process(sys_pid) else {
            state.clocks.remove(&pid);
            return None;
        };
        let clock = state.clocks.entry(pid).or_insert(CpuClock {
            last_refresh: now,
            total: Duration::ZERO,
        });
        clock.total = accumulate_cpu(
            clock.total,
            proc.cpu_usage(),
            now.saturating_duration_since(clock.last_refresh),
        );
        clock.last_refresh = now;
        Some(ProcessSample {
            rss_bytes: proc.memory(),
            cpu_time: clock.total,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

fn jstat_path() -> PathBuf {
    let exe = if cfg!(windows) { "jstat.exe" } else { "jstat" };
    let java = crate::supervisor::resolve_java();
    match java.parent() {
        Some(bin) if bin.join(exe).is_file() => bin.join(exe),
        _ => PathBuf::from(exe),
    }
}

/// Heap figures from `jstat -gc`. Minimal JREs ship without `jstat`, so
/// `None` is an expected answer.
pub async fn probe_heap(pid: u32) -> Option<HeapUsage> {
    let out = tokio::process::Command::new(jstat_path())
        .args(["-gc", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    parse_jstat_gc(&String::from_utf8_lossy(&out.stdout))
}

/// Used is survivor + eden + old occupancy; max is their current capacity.
/// Columns are in KB and may be `-` on collectors that lack a space.
pub fn parse_jstat_gc(out: &str) -> Option<HeapUsage> {
    let mut lines = out.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines.next()?.split_whitespace().collect();
    let values: Vec<&str> = lines.next()?.split_whitespace().collect();
    let column = |name: &str| -> f64 {
        header
            .iter()
            .position(|h| *h == name)
            .and_then(|i| values.get(i))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    if !header.contains(&"EU") || !header.contains(&"OU") {
        return None;
    }
    let used_kb = column("S0U") + column("S1U") + column("EU") + column("OU");
    let max_kb = column("S0C") + column("S1C") + column("EC") + column("OC");
    Some(HeapUsage {
        used_bytes: (used_kb * 1024.0) as u64,
        max_bytes: (max_kb * 1024.0) as u64,
    })
}
