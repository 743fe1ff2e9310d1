//! JSON-lines file logging with size-based rotation.
//!
//! Diagnostics (including the context stripped from user-visible error
//! messages) land in a JSON-lines file. At startup the file is rotated:
//! once it exceeds the configured maximum, the oldest lines are dropped
//! until the newest half remains. Rotation by age is intentionally not
//! implemented.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_MAX_BYTES;
use crate::error::{Result, XferError};

/// Initializes the global tracing subscriber writing JSON lines to
/// `log_path`, rotating first if the file has outgrown its budget.
///
/// The env filter honours `RUST_LOG`; the default level is `info`.
pub fn init(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| XferError::Storage(format!("failed to create log dir: {}", e)))?;
    }

    rotate_if_needed(log_path, LOG_MAX_BYTES)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| XferError::Storage(format!("failed to open log file: {}", e)))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(Mutex::new(file)))
        .init();

    Ok(())
}

/// Rotates `path` in place when it exceeds `max_bytes`.
///
/// Keeps the newest whole lines that fit within half the budget, so the
/// file has room to grow again before the next rotation. Storage is
/// cheap, debug time is not, so half a budget of history stays around.
pub fn rotate_if_needed(path: &Path, max_bytes: u64) -> Result<()> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(XferError::Storage(format!("failed to stat log file: {}", e))),
    };
    if size <= max_bytes {
        return Ok(());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| XferError::Storage(format!("failed to read log file: {}", e)))?;
    let lines: Vec<&str> = contents.lines().collect();

    // Walk backwards accumulating the newest lines until half the budget
    // is spent.
    let threshold = max_bytes / 2;
    let mut kept_bytes: u64 = 0;
    let mut start = lines.len();
    while start > 0 {
        let line_len = lines[start - 1].len() as u64 + 1; // + newline
        if kept_bytes + line_len > threshold {
            break;
        }
        kept_bytes += line_len;
        start -= 1;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)
            .map_err(|e| XferError::Storage(format!("failed to create temp log: {}", e)))?;
        for line in &lines[start..] {
            writeln!(tmp, "{}", line)
                .map_err(|e| XferError::Storage(format!("failed to write temp log: {}", e)))?;
        }
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| XferError::Storage(format!("failed to swap log file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(i: usize) -> String {
        format!("{{\"n\":{},\"msg\":\"entry number {}\"}}", i, i)
    }

    #[test]
    fn test_no_rotation_below_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.json");
        fs::write(&path, format!("{}\n{}\n", line(1), line(2))).unwrap();

        rotate_if_needed(&path, 10_000).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_missing_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        rotate_if_needed(&dir.path().join("absent.json"), 100).unwrap();
    }

    #[test]
    fn test_rotation_keeps_newest_half() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.json");

        let mut contents = String::new();
        for i in 0..100 {
            contents.push_str(&line(i));
            contents.push('\n');
        }
        fs::write(&path, &contents).unwrap();
        let full_size = fs::metadata(&path).unwrap().len();

        // Force a rotation with a budget smaller than the file.
        let budget = full_size / 2;
        rotate_if_needed(&path, budget).unwrap();

        let rotated = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = rotated.lines().collect();

        // Newest lines survived, oldest went first.
        assert!(fs::metadata(&path).unwrap().len() <= budget / 2 + 64);
        assert!(!kept.is_empty());
        assert_eq!(*kept.last().unwrap(), line(99));
        assert!(!rotated.contains(&line(0)));

        // Order preserved.
        let first_kept = kept[0];
        let first_index: usize = first_kept
            .split(&[':', ','][..])
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        for (offset, kept_line) in kept.iter().enumerate() {
            assert_eq!(*kept_line, line(first_index + offset));
        }
    }

    #[test]
    fn test_rotation_is_idempotent_once_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.json");

        let mut contents = String::new();
        for i in 0..50 {
            contents.push_str(&line(i));
            contents.push('\n');
        }
        fs::write(&path, &contents).unwrap();

        let budget = fs::metadata(&path).unwrap().len() - 1;
        rotate_if_needed(&path, budget).unwrap();
        let after_first = fs::read_to_string(&path).unwrap();

        rotate_if_needed(&path, budget).unwrap();
        let after_second = fs::read_to_string(&path).unwrap();

        assert_eq!(after_first, after_second);
    }
}
