use crate::config::ProfileKind;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

type ProfileKey = (ProfileKind, String);

/// Bounded in-memory tail of every profile's captured output.
///
/// Lines survive restarts of the subprocess; each one already carries its
/// incarnation prefix, so output from consecutive runs stays attributable.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<ProfileKey, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, kind: ProfileKind, name: &str, line: String) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        let entries = logs.entry((kind, name.to_string())).or_default();
        entries.push_back(line);
        while entries.len() > self.max_lines {
            entries.pop_front();
        }
    }

    /// Last `n` lines for a profile, oldest first.
    pub fn tail(&self, kind: ProfileKind, name: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read().expect("LogBuffer lock poisoned");
        let Some(entries) = logs.get(&(kind, name.to_string())) else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Carry captured output over to a renamed profile.
    pub fn rename(&self, kind: ProfileKind, old: &str, new: &str) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        if let Some(entries) = logs.remove(&(kind, old.to_string())) {
            logs.insert((kind, new.to_string()), entries);
        }
    }

    pub fn clear(&self, kind: ProfileKind, name: &str) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        logs.remove(&(kind, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_newest_lines_in_order() {
        let buf = LogBuffer::new(100);
        for i in 0..10 {
            buf.push(ProfileKind::Daemon, "lockable", format!("[1:42] line {i}"));
        }
        assert_eq!(
            buf.tail(ProfileKind::Daemon, "lockable", 3),
            vec!["[1:42] line 7", "[1:42] line 8", "[1:42] line 9"]
        );
    }

    #[test]
    fn oldest_lines_are_evicted() {
        let buf = LogBuffer::new(2);
        for i in 0..5 {
            buf.push(ProfileKind::Nameserver, "default", format!("line {i}"));
        }
        assert_eq!(
            buf.tail(ProfileKind::Nameserver, "default", 10),
            vec!["line 3", "line 4"]
        );
    }

    #[test]
    fn kinds_do_not_share_buffers() {
        let buf = LogBuffer::new(10);
        buf.push(ProfileKind::Nameserver, "default", "ns".into());
        buf.push(ProfileKind::Daemon, "default", "daemon".into());
        assert_eq!(buf.tail(ProfileKind::Daemon, "default", 10), vec!["daemon"]);
        assert!(buf.tail(ProfileKind::Daemon, "other", 10).is_empty());
    }

    #[test]
    fn rename_moves_and_clear_drops() {
        let buf = LogBuffer::new(10);
        buf.push(ProfileKind::Daemon, "bench", "hello".into());
        buf.rename(ProfileKind::Daemon, "bench", "bench2");
        assert!(buf.tail(ProfileKind::Daemon, "bench", 10).is_empty());
        assert_eq!(buf.tail(ProfileKind::Daemon, "bench2", 10), vec!["hello"]);

        buf.clear(ProfileKind::Daemon, "bench2");
        assert!(buf.tail(ProfileKind::Daemon, "bench2", 10).is_empty());
    }
}
