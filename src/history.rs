// Per-session chat transcript on disk.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::error::Result;
use crate::logger::Logger;

/// Appends every rendered chat/system line to
/// `<dir>/chat_<name>_<port>_<YYYY-MM-DD_HH-MM-SS>.log`.
pub struct MessageHistory {
    path: PathBuf,
    // `None` once closed
    writer: Mutex<Option<BufWriter<File>>>,
    logger: Logger,
}

impl MessageHistory {
    /// Create the directory if needed, open a fresh file and write the session banner.
    pub fn start(dir: impl AsRef<Path>, user: &str, port: u16, logger: Logger) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let now = Local::now();
        let file_name = format!(
            "chat_{}_{}_{}.log",
            sanitize(user),
            port,
            now.format("%Y-%m-%d_%H-%M-%S")
        );
        let path = dir.join(file_name);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;

        let history = Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            logger,
        };
        history.append(&format!(
            "== New session started at {} ==",
            now.format("%Y-%m-%d %H:%M:%S")
        ));
        history.logger.info(&format!("📝 Chat history: {}", history.path.display()));
        Ok(history)
    }

    /// Write one line and flush it. Failures are logged, never returned.
    pub fn append(&self, line: &str) {
        let mut guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(writer) = guard.as_mut() else { return };

        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            self.logger.warn(&format!("⚠️ Could not write history {}: {}", self.path.display(), e));
        }
    }

    /// Write the closing banner and release the file. Later calls do nothing.
    pub fn close(&self) {
        self.append(&format!(
            "== Session ended at {} ==",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(writer);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MessageHistory {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keep user names from escaping the history directory or breaking the file name.
fn sanitize(user: &str) -> String {
    let cleaned: String = user
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "peer".to_string() } else { cleaned }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_is_framed_by_banners() {
        let dir = tempfile::tempdir().unwrap();
        let history = MessageHistory::start(dir.path(), "alice", 5000, Logger).unwrap();
        history.append("[12:00:00] bob: hi");
        history.append("[12:00:01] [system] Connected to 10.0.0.2:5001");
        history.close();

        let text = fs::read_to_string(history.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("== New session started at "));
        assert_eq!(lines[1], "[12:00:00] bob: hi");
        assert!(lines[3].starts_with("== Session ended at "));
    }

    #[test]
    fn close_is_idempotent_and_later_appends_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let history = MessageHistory::start(dir.path(), "alice", 5000, Logger).unwrap();
        history.close();
        history.close();
        history.append("too late");

        let text = fs::read_to_string(history.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(!text.contains("too late"));
    }

    #[test]
    fn file_name_carries_user_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let history = MessageHistory::start(dir.path().join("nested"), "../eve x", 5003, Logger).unwrap();

        let name = history.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("chat____eve_x_5003_"), "{}", name);
        assert!(name.ends_with(".log"));
        assert_eq!(history.path().parent().unwrap(), dir.path().join("nested"));
    }
}
