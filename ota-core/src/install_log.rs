// Human-readable trace of boot-time install and recovery work, kept in /install.log

use log::Level;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const BANNER_WIDTH: usize = 50;

/// Appends lines to the install log and mirrors each one to the `log` facade.
///
/// Write failures are swallowed after a debug message: losing the trace file
/// must never stop an install.
pub struct InstallLog {
    path: Option<PathBuf>,
    lines: usize,
}

impl InstallLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), lines: 0 }
    }

    /// Mirror to `log` only
    pub fn console() -> Self {
        Self { path: None, lines: 0 }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines_written(&self) -> usize {
        self.lines
    }

    pub fn line(&mut self, level: Level, message: &str) {
        log::log!(target: "install", level, "{}", message);
        let Some(path) = &self.path else { return };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "[{}] {}", level, message));
        match result {
            Ok(()) => self.lines += 1,
            Err(e) => log::debug!("install log write failed: {}", e),
        }
    }

    pub fn info(&mut self, message: &str) {
        self.line(Level::Info, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.line(Level::Warn, message);
    }

    pub fn error(&mut self, message: &str) {
        self.line(Level::Error, message);
    }

    /// Framed error block for conditions that need a human
    pub fn banner(&mut self, level: Level, title: &str) {
        let rule = "=".repeat(BANNER_WIDTH);
        self.line(level, &rule);
        self.line(level, title);
        self.line(level, &rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("install.log");
        std::fs::write(&path, "[INFO] previous boot\n").unwrap();

        let mut log = InstallLog::new(&path);
        log.info("Manifest loaded");
        log.banner(Level::Error, "Update aborted");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[INFO] previous boot\n[INFO] Manifest loaded\n"));
        assert!(text.contains("[ERROR] Update aborted"));
        assert_eq!(log.lines_written(), 4);
    }

    #[test]
    fn test_console_log_writes_nothing() {
        let mut log = InstallLog::console();
        log.warn("only on the console");
        assert_eq!(log.lines_written(), 0);
        assert!(log.path().is_none());
    }
}
