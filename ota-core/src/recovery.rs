//! Last-known-good mirror of the critical file set under `/recovery`.
//!
//! The mirror is rebuilt from scratch after every successful install. It is not
//! written atomically, so every restore is followed by a fresh validation of the
//! live filesystem.

use log::Level;
use std::fs;

use crate::critical::CriticalFileSet;
use crate::error::{IoContext, UpdateError};
use crate::fs_util::{self, dir_has_entries};
use crate::install_log::InstallLog;
use crate::layout::{join_device_path, Layout};

const DIGEST_CHUNK_BYTES: usize = 2048;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: usize,
    /// `path: error` for every file that could not be copied
    pub failures: Vec<String>,
}

impl CopyReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of the boot-time recovery check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryReport {
    /// Every critical file present, nothing done
    Healthy,
    Restored { restored: usize },
    Partial { restored: usize, failures: Vec<String>, still_missing: Vec<String> },
    /// Files missing and no backup to restore from
    Unavailable { missing: Vec<String> },
}

impl RecoveryReport {
    pub fn device_intact(&self) -> bool {
        matches!(self, RecoveryReport::Healthy | RecoveryReport::Restored { .. })
    }
}

pub struct RecoveryStore<'a> {
    layout: &'a Layout,
    files: &'a CriticalFileSet,
}

impl<'a> RecoveryStore<'a> {
    pub fn new(layout: &'a Layout, files: &'a CriticalFileSet) -> Self {
        Self { layout, files }
    }

    /// A backup directory with at least one entry
    pub fn exists(&self) -> bool {
        dir_has_entries(&self.layout.recovery_dir())
    }

    /// Clear `/recovery` and copy the live critical set into it
    pub fn create_backup(&self) -> Result<CopyReport, UpdateError> {
        let recovery = self.layout.recovery_dir();
        fs_util::remove_path(&recovery).at(&recovery)?;
        fs::create_dir_all(&recovery).at(&recovery)?;

        let report = copy_set(self.files.paths(), self.layout.root(), &recovery);
        if !report.is_complete() {
            log::error!(
                "Partial backup: {} files backed up, {} failed",
                report.copied,
                report.failures.len()
            );
            for failure in &report.failures {
                log::error!("  - {}", failure);
            }
            return Ok(report);
        }

        log::info!("Recovery backup complete: {} critical files backed up", report.copied);
        match self.validate_backup() {
            Ok(()) => log::debug!("Integrity check passed"),
            Err(missing) => log::warn!("Integrity check after backup failed: {} files missing", missing.len()),
        }
        Ok(report)
    }

    /// Every critical path present in the backup; `Err` lists the missing ones
    pub fn validate_backup(&self) -> Result<(), Vec<String>> {
        if !self.exists() {
            return Err(self.files.paths().to_vec());
        }
        let missing = self.files.missing_in(&self.layout.recovery_dir());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// Backup complete and byte-identical to the live critical set
    pub fn is_current(&self) -> bool {
        if self.validate_backup().is_err() {
            return false;
        }
        let recovery = self.layout.recovery_dir();
        self.files.paths().iter().all(|path| {
            let live = fs_util::file_digest(&self.layout.resolve(path), DIGEST_CHUNK_BYTES);
            let backup = fs_util::file_digest(&join_device_path(&recovery, path), DIGEST_CHUNK_BYTES);
            matches!((live, backup), (Ok(a), Ok(b)) if a == b)
        })
    }

    /// Rebuild the backup unless it already mirrors the live set. Never replaces
    /// a backup with an incomplete live set.
    pub fn ensure_current(&self) -> Result<(), UpdateError> {
        if self.is_current() {
            log::debug!("Recovery backup is current");
            return Ok(());
        }
        let live_missing = self.files.missing_in(self.layout.root());
        if !live_missing.is_empty() {
            log::warn!(
                "Not refreshing recovery backup: {} critical files missing from root",
                live_missing.len()
            );
            return Ok(());
        }
        log::info!("Refreshing recovery backup before install");
        let report = self.create_backup()?;
        if report.is_complete() {
            Ok(())
        } else {
            Err(UpdateError::RecoveryUnavailable)
        }
    }

    /// Copy every backed-up critical file over the live root
    pub fn restore_all(&self) -> CopyReport {
        copy_set(self.files.paths(), &self.layout.recovery_dir(), self.layout.root())
    }

    /// Boot-time check: validate the live set and restore from the backup when
    /// anything is missing
    pub fn check_and_restore(&self, log: &mut InstallLog) -> RecoveryReport {
        let missing = self.files.missing_in(self.layout.root());
        if missing.is_empty() {
            log::debug!("All critical files present, no recovery needed");
            return RecoveryReport::Healthy;
        }

        if !self.exists() {
            log.banner(Level::Error, "CRITICAL: No recovery backup available");
            log.error(&format!("Missing {} critical files: {}", missing.len(), summarize(&missing)));
            log.error("Manual intervention may be required");
            return RecoveryReport::Unavailable { missing };
        }

        log.banner(Level::Error, "CRITICAL: Missing critical files detected");
        for path in missing.iter().take(10) {
            log.error(&format!("  - {}", path));
        }
        log.error("Restoring from recovery backup");

        let report = self.restore_all();
        let still_missing = self.files.missing_in(self.layout.root());
        if report.is_complete() && still_missing.is_empty() {
            log.info(&format!("Recovery complete: {} critical files restored", report.copied));
            return RecoveryReport::Restored { restored: report.copied };
        }

        log.error(&format!(
            "Partial recovery: {} files restored, {} failed, {} still missing",
            report.copied,
            report.failures.len(),
            still_missing.len()
        ));
        for failure in &report.failures {
            log.error(&format!("  - {}", failure));
        }
        log.error("Manual intervention required");
        RecoveryReport::Partial { restored: report.copied, failures: report.failures, still_missing }
    }

    /// Minimal pre-boot pass: put back only missing boot-critical files.
    /// Returns the restored paths.
    pub fn emergency_restore(&self) -> Vec<String> {
        let mut restored = Vec::new();
        let recovery = self.layout.recovery_dir();
        for path in self.files.missing_boot_critical(self.layout.root()) {
            let src = join_device_path(&recovery, &path);
            match fs_util::copy_file(&src, &self.layout.resolve(&path)) {
                Ok(_) => {
                    log::warn!("EMERGENCY RECOVERY: Restored {}", path);
                    restored.push(path);
                }
                Err(e) => log::error!("EMERGENCY RECOVERY FAILED: {} - {}", path, e),
            }
        }
        restored
    }
}

/// Copy each device path from `src_base` to `dst_base`. Paths absent from the
/// source and directories are skipped; errors become named failures.
fn copy_set(paths: &[String], src_base: &std::path::Path, dst_base: &std::path::Path) -> CopyReport {
    let mut report = CopyReport::default();
    for path in paths {
        let src = join_device_path(src_base, path);
        if !src.is_file() {
            continue;
        }
        match fs_util::copy_file(&src, &join_device_path(dst_base, path)) {
            Ok(_) => report.copied += 1,
            Err(e) => report.failures.push(format!("{}: {}", path, e)),
        }
    }
    report
}

fn summarize(paths: &[String]) -> String {
    let mut summary = paths.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
    if paths.len() > 5 {
        summary.push_str(&format!(" ...and {} more", paths.len() - 5));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn populate(root: &Path, tag: &str) {
        for path in CriticalFileSet::wicid().paths() {
            let full = join_device_path(root, path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, format!("{} {}", tag, path)).unwrap();
        }
    }

    #[test]
    fn test_backup_mirrors_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        fs::create_dir_all(layout.recovery_dir().join("stale")).unwrap();

        let store = RecoveryStore::new(&layout, &files);
        let report = store.create_backup().unwrap();
        assert_eq!(report.copied, files.paths().len());
        assert!(store.validate_backup().is_ok());
        assert!(store.is_current());
        assert!(!layout.recovery_dir().join("stale").exists());

        fs::write(layout.resolve("/app.bin"), "v2 app").unwrap();
        assert!(!store.is_current());
        store.ensure_current().unwrap();
        assert!(store.is_current());
    }

    #[test]
    fn test_healthy_root_needs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        let store = RecoveryStore::new(&layout, &files);
        assert_eq!(store.check_and_restore(&mut InstallLog::console()), RecoveryReport::Healthy);
    }

    #[test]
    fn test_missing_files_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        let store = RecoveryStore::new(&layout, &files);
        store.create_backup().unwrap();

        fs::remove_file(layout.resolve("/app.bin")).unwrap();
        fs::remove_dir_all(layout.resolve("/certs")).unwrap();

        let report = store.check_and_restore(&mut InstallLog::console());
        assert!(matches!(report, RecoveryReport::Restored { .. }));
        assert!(report.device_intact());
        assert_eq!(fs::read_to_string(layout.resolve("/app.bin")).unwrap(), "v1 /app.bin");
        assert!(layout.resolve("/certs/ca_bundle.pem").is_file());
    }

    #[test]
    fn test_no_backup_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        fs::remove_file(layout.resolve("/boot.bin")).unwrap();

        let store = RecoveryStore::new(&layout, &files);
        let report = store.check_and_restore(&mut InstallLog::console());
        assert_eq!(report, RecoveryReport::Unavailable { missing: vec!["/boot.bin".into()] });
        assert!(store.ensure_current().is_ok());
        assert!(!store.exists());
    }

    #[test]
    fn test_partial_backup_reports_still_missing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        let store = RecoveryStore::new(&layout, &files);
        store.create_backup().unwrap();
        fs::remove_file(join_device_path(&layout.recovery_dir(), "/app.bin")).unwrap();
        fs::remove_file(layout.resolve("/app.bin")).unwrap();

        match store.check_and_restore(&mut InstallLog::console()) {
            RecoveryReport::Partial { still_missing, .. } => assert_eq!(still_missing, vec!["/app.bin"]),
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_emergency_restore_only_touches_boot_critical() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let files = CriticalFileSet::wicid();
        populate(dir.path(), "v1");
        let store = RecoveryStore::new(&layout, &files);
        store.create_backup().unwrap();

        fs::remove_file(layout.resolve("/settings.json")).unwrap();
        fs::remove_file(layout.resolve("/app.bin")).unwrap();

        assert_eq!(store.emergency_restore(), vec!["/settings.json"]);
        assert!(layout.resolve("/settings.json").is_file());
        assert!(!layout.resolve("/app.bin").exists());
    }
}
