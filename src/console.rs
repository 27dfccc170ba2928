use std::collections::VecDeque;

use crate::model::ConsoleLevel;

/// Lines of console history kept for reconnect replay.
pub const CONSOLE_BUFFER_SIZE: usize = 500;

/// Case-insensitive keyword heuristic. The exit code never feeds into this.
pub fn classify_level(line: &str) -> ConsoleLevel {
    let upper = line.to_ascii_uppercase();
    if upper.contains("ERROR") || upper.contains("FATAL") {
        ConsoleLevel::Error
    } else if upper.contains("WARN") {
        ConsoleLevel::Warn
    } else if upper.contains("DEBUG") || upper.contains("TRACE") {
        ConsoleLevel::Debug
    } else {
        ConsoleLevel::Info
    }
}

/// Splits a byte stream into lines, holding a trailing partial line until the
/// write that completes it arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flushes whatever is left once the stream hits EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Fixed-capacity FIFO; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct ConsoleRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> ConsoleRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Up to `n` most recent entries, oldest first. `None` returns everything.
    pub fn recent(&self, n: Option<usize>) -> Vec<T> {
        let take = n.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries
            .iter()
            .skip(self.entries.len() - take)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A domain signal scraped out of free-text server output.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleSignal {
    Tps(f64),
    PlayerList(Vec<String>),
    PlayerJoined(String),
    PlayerLeft(String),
}

/// Parser for one server variant's console dialect. Returning `None` is the
/// normal case for most lines.
pub trait ConsoleSignalExtractor: Send + Sync {
    fn extract(&self, message: &str) -> Option<ConsoleSignal>;
}

/// Strips the `[time] [thread/LEVEL]: ` log prefix and `§` colour codes.
pub fn message_body(line: &str) -> String {
    let body = match line.split_once("]: ") {
        Some((prefix, rest)) if prefix.starts_with('[') => rest,
        _ => line,
    };
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '§' {
            chars.next();
            continue;
        }
        out.push(c);
    }
    out.trim().to_string()
}

/// `TPS from last 1m, 5m, 15m: 19.98, 20.0, 20.0` as printed by Paper/Spigot.
#[derive(Debug, Default)]
pub struct TpsLineExtractor;

impl ConsoleSignalExtractor for TpsLineExtractor {
    fn extract(&self, message: &str) -> Option<ConsoleSignal> {
        let rest = message.strip_prefix("TPS from last")?;
        let (_, values) = rest.split_once(':')?;
        let first = values.split(',').next()?.trim().trim_start_matches('*');
        first.parse::<f64>().ok().map(ConsoleSignal::Tps)
    }
}

/// Output of the vanilla `list` command plus join/leave announcements.
#[derive(Debug, Default)]
pub struct PlayerLineExtractor;

impl ConsoleSignalExtractor for PlayerLineExtractor {
    fn extract(&self, message: &str) -> Option<ConsoleSignal> {
        if let Some(name) = message.strip_suffix(" joined the game") {
            return Some(ConsoleSignal::PlayerJoined(name.trim().to_string()));
        }
        if let Some(name) = message.strip_suffix(" left the game") {
            return Some(ConsoleSignal::PlayerLeft(name.trim().to_string()));
        }
        // "There are 2 of a max of 20 players online: Steve, Alex"
        // "There are 2/20 players online:"
        if message.starts_with("There are ") && message.contains("players online") {
            let names = message
                .split_once("online:")
                .map(|(_, names)| names)
                .unwrap_or("");
            let list = names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
            return Some(ConsoleSignal::PlayerList(list));
        }
        None
    }
}

/// Ordered set of parsers; the first one that recognises a line wins.
pub struct SignalExtractors {
    parsers: Vec<Box<dyn ConsoleSignalExtractor>>,
}

impl SignalExtractors {
    pub fn new(parsers: Vec<Box<dyn ConsoleSignalExtractor>>) -> Self {
        Self { parsers }
    }

    /// Parsers suitable for the given framework's server console.
    pub fn for_framework(framework: &str) -> Self {
        let mut parsers: Vec<Box<dyn ConsoleSignalExtractor>> =
            vec![Box::new(PlayerLineExtractor)];
        // Vanilla and Fabric have no /tps command.
        if matches!(framework, "paper" | "spigot" | "purpur" | "forge") {
            parsers.insert(0, Box::new(TpsLineExtractor));
        }
        Self::new(parsers)
    }

    pub fn extract(&self, line: &str) -> Option<ConsoleSignal> {
        let body = message_body(line);
        self.parsers.iter().find_map(|p| p.extract(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_keyword() {
        assert_eq!(
            classify_level("[12:00:00] [Server thread/ERROR]: boom"),
            ConsoleLevel::Error
        );
        assert_eq!(classify_level("java.lang.fatal thing"), ConsoleLevel::Error);
        assert_eq!(
            classify_level("[12:00:00] [Server thread/WARN]: Can't keep up!"),
            ConsoleLevel::Warn
        );
        assert_eq!(classify_level("trace: entering"), ConsoleLevel::Debug);
        assert_eq!(
            classify_level("[12:00:00] [Server thread/INFO]: Done (3.2s)!"),
            ConsoleLevel::Info
        );
    }

    #[test]
    fn splitter_holds_partial_lines() {
        let mut s = LineSplitter::new();
        assert!(s.push(b"[INFO]: Prep").is_empty());
        assert_eq!(s.push(b"aring spawn\r\nDone"), vec!["[INFO]: Preparing spawn"]);
        assert_eq!(s.push(b"\n"), vec!["Done"]);
        assert_eq!(s.finish(), None);
        s.push(b"tail");
        assert_eq!(s.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn splitter_is_lossy_on_bad_utf8() {
        let mut s = LineSplitter::new();
        let lines = s.push(b"ok \xff\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
    }

    #[test]
    fn ring_keeps_most_recent_in_order() {
        let mut ring = ConsoleRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.recent(None), vec![2, 3, 4]);
        assert_eq!(ring.recent(Some(2)), vec![3, 4]);
        assert_eq!(ring.recent(Some(10)), vec![2, 3, 4]);
    }

    #[test]
    fn ring_at_default_capacity() {
        let mut ring = ConsoleRing::new(CONSOLE_BUFFER_SIZE);
        for i in 0..(CONSOLE_BUFFER_SIZE + 42) {
            ring.push(i);
        }
        let all = ring.recent(None);
        assert_eq!(all.len(), CONSOLE_BUFFER_SIZE);
        assert_eq!(all[0], 42);
        assert_eq!(*all.last().unwrap(), CONSOLE_BUFFER_SIZE + 41);
    }

    #[test]
    fn extracts_tps_from_paper_output() {
        let ex = SignalExtractors::for_framework("paper");
        let sig = ex.extract("[12:00:00 INFO]: §6TPS from last 1m, 5m, 15m: §a*20.0, §a19.5, §a19.9");
        assert_eq!(sig, Some(ConsoleSignal::Tps(20.0)));
    }

    #[test]
    fn vanilla_ignores_tps_lines() {
        let ex = SignalExtractors::for_framework("vanilla");
        assert_eq!(ex.extract("TPS from last 1m, 5m, 15m: 20.0, 20.0, 20.0"), None);
    }

    #[test]
    fn extracts_player_list_and_joins() {
        let ex = SignalExtractors::for_framework("vanilla");
        assert_eq!(
            ex.extract("[12:00:00] [Server thread/INFO]: There are 2 of a max of 20 players online: Steve, Alex"),
            Some(ConsoleSignal::PlayerList(vec!["Steve".into(), "Alex".into()]))
        );
        assert_eq!(
            ex.extract("[12:00:00] [Server thread/INFO]: There are 0/20 players online:"),
            Some(ConsoleSignal::PlayerList(vec![]))
        );
        assert_eq!(
            ex.extract("[12:00:01] [Server thread/INFO]: Steve joined the game"),
            Some(ConsoleSignal::PlayerJoined("Steve".into()))
        );
        assert_eq!(ex.extract("[12:00:01] [Server thread/INFO]: Preparing level \"world\""), None);
    }
}
