//! Best-effort per-plugin tick cost, scraped from diagnostic command output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::console::message_body;
use crate::model::SupervisorEvent;
use crate::supervisor::ProcessSupervisor;

pub const TIMINGS_INTERVAL: Duration = Duration::from_secs(5);

/// One server tick at 20 TPS.
const TICK_MS: f64 = 50.0;
const PROFILER_COMMAND: &str = "spark profiler info";
const PLUGIN_LIST_COMMAND: &str = "plugins";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginTiming {
    pub name: String,
    pub tick_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingsSnapshot {
    pub server_id: String,
    pub plugins: Vec<PluginTiming>,
}

/// Incrementally builds the name → tick-percent table from console lines.
#[derive(Debug, Default)]
pub struct TimingsParser {
    known: Vec<String>,
    costs: HashMap<String, f64>,
    profiler_detected: bool,
    in_plugin_list: bool,
}

impl TimingsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostic_command(&self) -> &'static str {
        if self.profiler_detected {
            PROFILER_COMMAND
        } else {
            PLUGIN_LIST_COMMAND
        }
    }

    /// Returns whether the line contributed anything. Most lines do not.
    pub fn feed(&mut self, line: &str) -> bool {
        let body = message_body(line);

        // "Plugins (3): A, B, C" or the Paper header "Server Plugins (3):"
        // followed by "Bukkit Plugins:" and "- A, B, C".
        if let Some((head, names)) = body.split_once("):") {
            if head.contains("Plugins (") {
                self.in_plugin_list = names.trim().is_empty();
                self.add_names(names);
                return true;
            }
        }
        if self.in_plugin_list {
            if let Some(names) = body.strip_prefix("- ") {
                self.add_names(names);
                return true;
            }
            if body.ends_with("Plugins:") {
                return true;
            }
            self.in_plugin_list = false;
        }

        if let Some((name, percent)) = parse_cost(&body) {
            self.costs.insert(name, percent);
            return true;
        }
        false
    }

    fn add_names(&mut self, names: &str) {
        for name in names.split(',') {
            let name = name.trim().trim_end_matches('*').trim();
            if name.is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case("spark") {
                self.profiler_detected = true;
            }
            if !self.known.iter().any(|k| k == name) {
                self.known.push(name.to_string());
            }
        }
    }

    /// Sorted by cost, highest first. Before any timing line has arrived this
    /// is the known plugin list at 0%.
    pub fn snapshot(&self) -> Vec<PluginTiming> {
        let mut out: Vec<PluginTiming> = if self.costs.is_empty() {
            self.known
                .iter()
                .map(|name| PluginTiming {
                    name: name.clone(),
                    tick_percent: 0.0,
                })
                .collect()
        } else {
            self.costs
                .iter()
                .map(|(name, pct)| PluginTiming {
                    name: name.clone(),
                    tick_percent: *pct,
                })
                .collect()
        };
        out.sort_by(|a, b| {
            b.tick_percent
                .total_cmp(&a.tick_percent)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// `<name>: 12.5%`, `<name> - 1.2ms` or `<name> 0.8 ms/tick`.
fn parse_cost(body: &str) -> Option<(String, f64)> {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    for (i, tok) in tokens.iter().enumerate() {
        if let Some(num) = tok.strip_suffix('%') {
            if let Ok(pct) = num.parse::<f64>() {
                return cost_name(&tokens[..i]).map(|name| (name, pct));
            }
        }
        let ms = if let Some(num) = tok.strip_suffix("ms/tick").or_else(|| tok.strip_suffix("ms")) {
            num.parse::<f64>().ok()
        } else if tokens.get(i + 1).is_some_and(|unit| unit.starts_with("ms")) {
            tok.parse::<f64>().ok()
        } else {
            None
        };
        if let Some(ms) = ms {
            return cost_name(&tokens[..i]).map(|name| (name, ms / TICK_MS * 100.0));
        }
    }
    None
}

/// A single-word name, ignoring separator tokens.
fn cost_name(prefix: &[&str]) -> Option<String> {
    let words: Vec<&str> = prefix
        .iter()
        .map(|t| t.trim_end_matches([':', '-', '|']))
        .filter(|t| !t.is_empty())
        .collect();
    match words.as_slice() {
        [name] => Some(name.to_string()),
        _ => None,
    }
}

/// Periodically asks a running server for plugin diagnostics.
#[derive(Clone)]
pub struct PluginTimingsSampler {
    supervisor: ProcessSupervisor,
    tasks: Arc<DashMap<String, JoinHandle<()>>>,
    tx: broadcast::Sender<TimingsSnapshot>,
    interval: Duration,
}

impl PluginTimingsSampler {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self::with_interval(supervisor, TIMINGS_INTERVAL)
    }

    pub fn with_interval(supervisor: ProcessSupervisor, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            supervisor,
            tasks: Arc::new(DashMap::new()),
            tx,
            interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimingsSnapshot> {
        self.tx.subscribe()
    }

    pub fn start(&self, server_id: &str) {
        self.stop(server_id);
        let supervisor = self.supervisor.clone();
        let tx = self.tx.clone();
        let interval = self.interval;
        let id = server_id.to_string();
        let handle = tokio::spawn(async move {
            let mut parser = TimingsParser::new();
            let mut events = supervisor.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !supervisor.is_running(&id) {
                            continue;
                        }
                        if let Err(e) = supervisor.send_command(&id, parser.diagnostic_command()).await {
                            tracing::debug!(server = %id, error = %e, "timings command not sent");
                            continue;
                        }
                        let _ = tx.send(TimingsSnapshot {
                            server_id: id.clone(),
                            plugins: parser.snapshot(),
                        });
                    }
                    ev = events.recv() => match ev {
                        Ok(SupervisorEvent::Console { server_id, message }) if server_id == id => {
                            parser.feed(&message.text);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(server = %id, skipped = n, "timings sampler lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        self.tasks.insert(server_id.to_string(), handle);
    }

    pub fn stop(&self, server_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(server_id) {
            handle.abort();
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_known_names_at_zero() {
        let mut p = TimingsParser::new();
        assert!(p.feed("[12:00:00 INFO]: Plugins (3): WorldEdit, Essentials, spark"));
        assert_eq!(p.diagnostic_command(), PROFILER_COMMAND);
        let snap = p.snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|t| t.tick_percent == 0.0));
    }

    #[test]
    fn paper_multiline_plugin_list() {
        let mut p = TimingsParser::new();
        assert!(p.feed("[12:00:00 INFO]: Server Plugins (2):"));
        assert!(p.feed("[12:00:00 INFO]: Bukkit Plugins:"));
        assert!(p.feed("[12:00:00 INFO]:  - LuckPerms, Vault"));
        assert_eq!(p.diagnostic_command(), PLUGIN_LIST_COMMAND);
        let names: Vec<String> = p.snapshot().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["LuckPerms".to_string(), "Vault".to_string()]);
    }

    #[test]
    fn percent_and_ms_lines_sorted_descending() {
        let mut p = TimingsParser::new();
        p.feed("Plugins (3): WorldEdit, Essentials, Dynmap");
        assert!(p.feed("WorldEdit: 2.5%"));
        assert!(p.feed("Dynmap - 5ms/tick"));
        assert!(p.feed("Essentials 0.5 ms"));
        let snap = p.snapshot();
        assert_eq!(snap[0], PluginTiming { name: "Dynmap".into(), tick_percent: 10.0 });
        assert_eq!(snap[1].name, "WorldEdit");
        assert_eq!(snap[2].tick_percent, 1.0);
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let mut p = TimingsParser::new();
        assert!(!p.feed("[12:00:00 WARN]: Can't keep up! Is the server overloaded? Running 2000ms or 40 ticks behind"));
        assert!(!p.feed("[12:00:00 INFO]: Done (3.2s)! For help, type \"help\""));
        assert!(p.snapshot().is_empty());
    }
}
