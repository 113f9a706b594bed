//! Log files under the logs directory: one per profile plus the
//! supervisor's own. Every line starts with an RFC 3339 timestamp, which is
//! what [`export`] merges on.

use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOG_EXTENSION: &str = "log";

/// A captured line as written to its profile's log file.
pub fn stamp(line: &str) -> String {
    format!(
        "{} {line}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

fn leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// `*.log` files directly under `dir`, by name. A missing directory has none.
pub fn list(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == LOG_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Delete every log file under `dir`. Returns how many were removed.
pub fn clean(dir: &Path) -> Result<usize> {
    let files = list(dir)?;
    for file in &files {
        std::fs::remove_file(file)?;
        debug!(path = %file.display(), "Removed log file");
    }
    Ok(files.len())
}

/// Merge every log file under `dir` into `dest`, oldest line first.
///
/// Each line is prefixed with the file it came from. A line without a
/// timestamp (a wrapped message, a backtrace) stays behind the line it
/// continues. Returns the number of lines written.
pub fn export(dir: &Path, dest: &Path) -> Result<usize> {
    let mut merged: Vec<(DateTime<Utc>, String)> = Vec::new();
    for file in list(dir)? {
        if file == dest {
            continue;
        }
        let source = file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = std::fs::read(&file)?;
        let mut last = DateTime::<Utc>::MIN_UTC;
        for line in String::from_utf8_lossy(&bytes).lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(at) = leading_timestamp(line) {
                last = at;
            }
            merged.push((last, format!("{source} | {line}")));
        }
    }
    merged.sort_by_key(|(at, _)| *at);

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = String::new();
    for (_, line) in &merged {
        text.push_str(line);
        text.push('\n');
    }
    std::fs::write(dest, text)?;
    debug!(dest = %dest.display(), lines = merged.len(), "Exported logs");
    Ok(merged.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_interleaves_files_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nameserver-default.log"),
            "2026-03-01T10:00:00.000001Z [1:100] listening\n\
             2026-03-01T10:00:02.000000Z [1:100] registered asgard.hulk\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("daemon-lockable.log"),
            "2026-03-01T10:00:01.500000Z [1:200] connecting\n\
             \tcaused by: refused\n\
             2026-03-01T10:00:03.000000Z [1:200] ready\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a log\n").unwrap();

        let dest = dir.path().join("out").join("combined.txt");
        assert_eq!(export(dir.path(), &dest).unwrap(), 5);

        let combined = std::fs::read_to_string(&dest).unwrap();
        let lines: Vec<&str> = combined.lines().collect();
        assert_eq!(
            lines,
            vec![
                "nameserver-default | 2026-03-01T10:00:00.000001Z [1:100] listening",
                "daemon-lockable | 2026-03-01T10:00:01.500000Z [1:200] connecting",
                "daemon-lockable | \tcaused by: refused",
                "nameserver-default | 2026-03-01T10:00:02.000000Z [1:100] registered asgard.hulk",
                "daemon-lockable | 2026-03-01T10:00:03.000000Z [1:200] ready",
            ]
        );
    }

    #[test]
    fn clean_removes_only_log_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("supervisor.log"), "x\n").unwrap();
        std::fs::write(dir.path().join("daemon-default.log"), "y\n").unwrap();
        std::fs::write(dir.path().join("keep.yaml"), "z\n").unwrap();

        assert_eq!(clean(dir.path()).unwrap(), 2);
        assert!(dir.path().join("keep.yaml").exists());
        assert!(list(dir.path()).unwrap().is_empty());
        assert_eq!(clean(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn stamped_lines_carry_a_parseable_timestamp() {
        let line = stamp("[2:42] hello");
        assert!(line.ends_with(" [2:42] hello"));
        assert!(leading_timestamp(&line).is_some());
    }
}
