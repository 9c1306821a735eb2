//! Boot-time installer for a staged update.
//!
//! Runs once per boot, after the recovery check and before any application
//! code. Everything up to the pre-install hook is read-only on the live root;
//! a failure there discards the pending tree and boots the old firmware. The
//! destructive phase (delete, move) is bracketed by preserved-file digests
//! and a critical-file validation, and any failure inside it rolls the critical
//! set back from `/recovery` and continues booting without a reset.

use log::Level;
use std::fs;
use std::path::Path;

use crate::critical::{is_preserved_name, CriticalFileSet, PRESERVED_FILES};
use crate::error::{IoContext, UpdateError};
use crate::fs_util::{self, dir_has_entries, file_digest, same_name, Sha256Digest};
use crate::hooks::{HookRegistry, PostInstallContext, PreInstallContext};
use crate::identity::DeviceIdentity;
use crate::incompatible::{mark_incompatible, IncompatibleReleases};
use crate::install_log::InstallLog;
use crate::layout::{Layout, INSTALL_LOG_FILE, MANIFEST_FILE, PENDING_UPDATE_DIR, RECOVERY_DIR};
use crate::manifest::{installed_version, ReleaseManifest};
use crate::platform::{Cue, StatusIndicator, SystemReset};
use crate::recovery::RecoveryStore;
use crate::resolver::check_compatibility;
use crate::stager::{is_valid_marker, read_ready_marker};
use crate::version::FirmwareVersion;

/// Host volume metadata that is never deleted
const VOLUME_METADATA: &[&str] = &[".Trashes", ".metadata_never_index", ".fseventsd", "System Volume Information"];

const DIGEST_CHUNK_BYTES: usize = 2048;

/// What the installer finds under `/pending_update`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    None,
    Incomplete(String),
    Ready { marker: String },
}

#[derive(Debug)]
pub enum InstallOutcome {
    NoPendingUpdate,
    /// Half-staged debris removed
    DiscardedIncomplete,
    /// Refused before anything on the live root changed
    Rejected { version: Option<FirmwareVersion>, error: UpdateError },
    /// Failed during the destructive phase; critical files rolled back, no reset
    Aborted { version: FirmwareVersion, error: UpdateError },
    Installed { from: FirmwareVersion, to: FirmwareVersion },
    ScriptOnlyInstalled { from: FirmwareVersion, to: FirmwareVersion },
}

impl InstallOutcome {
    pub fn reset_requested(&self) -> bool {
        matches!(self, InstallOutcome::Installed { .. } | InstallOutcome::ScriptOnlyInstalled { .. })
    }
}

pub struct Installer<'a> {
    layout: &'a Layout,
    critical: &'a CriticalFileSet,
    identity: &'a DeviceIdentity,
    hooks: &'a HookRegistry,
}

type PreservedSnapshot = Vec<(String, Sha256Digest)>;

impl<'a> Installer<'a> {
    pub fn new(
        layout: &'a Layout,
        critical: &'a CriticalFileSet,
        identity: &'a DeviceIdentity,
        hooks: &'a HookRegistry,
    ) -> Self {
        Self { layout, critical, identity, hooks }
    }

    pub fn detect(&self) -> PendingState {
        if !self.layout.pending_dir().exists() {
            return PendingState::None;
        }
        if self.layout.staging_dir().exists() {
            return PendingState::Incomplete("staging directory left behind".into());
        }
        if !dir_has_entries(&self.layout.pending_root()) {
            return PendingState::Incomplete("pending root missing or empty".into());
        }
        match read_ready_marker(self.layout) {
            None => PendingState::Incomplete("ready marker missing or empty".into()),
            Some(marker) if !is_valid_marker(&marker) => {
                PendingState::Incomplete(format!("ready marker malformed: {:?}", marker))
            }
            Some(marker) => PendingState::Ready { marker },
        }
    }

    pub fn run<I, R>(&self, indicator: &mut I, reset: &mut R, log: &mut InstallLog) -> InstallOutcome
    where
        I: StatusIndicator + ?Sized,
        R: SystemReset + ?Sized,
    {
        log.info("=== BOOT: Checking for pending firmware updates ===");

        let marker = match self.detect() {
            PendingState::None => {
                log.info("No pending update found - proceeding with normal boot");
                return InstallOutcome::NoPendingUpdate;
            }
            PendingState::Incomplete(reason) => {
                log.warn(&format!("Incomplete pending update ({}), cleaning up", reason));
                self.discard_pending(log);
                return InstallOutcome::DiscardedIncomplete;
            }
            PendingState::Ready { marker } => marker,
        };

        indicator.cue(Cue::Installing);
        log.info(&format!("Ready marker found ({}...)", marker.get(..16).unwrap_or(marker.as_str())));

        let pending_root = self.layout.pending_root();
        let manifest = match ReleaseManifest::load(&pending_root.join(MANIFEST_FILE)) {
            Ok(manifest) => manifest,
            Err(error) => {
                log.error(&format!("Could not load manifest: {}", error));
                self.discard_pending(log);
                indicator.cue(Cue::Error);
                return InstallOutcome::Rejected { version: None, error };
            }
        };
        let current = installed_version(self.layout);
        let target = manifest.version.clone();
        log.info(&format!("WICID Firmware Update: {} → {}", current, target));

        if let Err(error) = self.preflight(&manifest, &current, log) {
            return self.reject(target, error, indicator, log);
        }
        indicator.tick();

        if manifest.script_only_release {
            return match self.install_script_only(&pending_root) {
                Ok(()) => {
                    self.discard_pending(log);
                    log.info(&format!("Script-only update complete: {} → {}", current, target));
                    indicator.cue(Cue::Idle);
                    reset.hard_reset();
                    InstallOutcome::ScriptOnlyInstalled { from: current, to: target }
                }
                Err(error) => self.reject(target, error, indicator, log),
            };
        }

        let recovery = RecoveryStore::new(self.layout, self.critical);
        if let Err(error) = recovery.ensure_current() {
            log.banner(Level::Error, "Recovery backup could not be refreshed, refusing to install");
            return self.reject(target, error, indicator, log);
        }

        if let Err(error) = self.replace_root(&pending_root, indicator, log) {
            return self.abort(target, error, &recovery, indicator, log);
        }

        let report = recovery.create_backup();
        match report {
            Ok(report) if report.is_complete() => log.info("✓ Recovery backup refreshed"),
            Ok(report) => log.warn(&format!("Recovery backup partial: {} failures", report.failures.len())),
            Err(e) => log.warn(&format!("Recovery backup failed: {}", e)),
        }

        if manifest.has_post_install_script {
            let mut ctx = PostInstallContext { log: &mut *log, version: &target, root: self.layout.root() };
            match self.hooks.run_post_install(&mut ctx) {
                Ok(()) => log.info("✓ Post-install hook complete"),
                Err(e) => log.warn(&format!("Post-install hook failed (non-fatal): {}", e)),
            }
        }

        self.discard_pending(log);
        log.info(&format!("Update complete: {} → {}", current, target));
        indicator.cue(Cue::Idle);
        reset.hard_reset();
        InstallOutcome::Installed { from: current, to: target }
    }

    /// Read-only checks: compatibility, package completeness, pre-install hook
    fn preflight(
        &self,
        manifest: &ReleaseManifest,
        current: &FirmwareVersion,
        log: &mut InstallLog,
    ) -> Result<(), UpdateError> {
        let blacklist = IncompatibleReleases::load(&self.layout.incompatible_file());
        check_compatibility(
            manifest.target_machine_types.as_slice(),
            manifest.target_operating_systems.as_slice(),
            &manifest.version,
            self.identity,
            current,
            &blacklist,
        )
        .map_err(|reason| UpdateError::IncompatibleRelease(reason.to_string()))?;
        log.info("✓ Compatibility verified");

        if !manifest.script_only_release {
            let missing = self.critical.missing_in(&self.layout.pending_root());
            if !missing.is_empty() {
                log.error(&format!(
                    "Update package incomplete - missing {} critical files: {}",
                    missing.len(),
                    missing.join(", ")
                ));
                return Err(UpdateError::IncompletePackage { missing });
            }
            log.info("✓ Package integrity validated");
        }

        if manifest.has_pre_install_script {
            let pending_root = self.layout.pending_root();
            let pending_dir = self.layout.pending_dir();
            let mut ctx = PreInstallContext {
                log: &mut *log,
                version: &manifest.version,
                pending_root: &pending_root,
                pending_dir: &pending_dir,
            };
            self.hooks.run_pre_install(&mut ctx)?;
            log.info("✓ Pre-install hook complete");
        }

        Ok(())
    }

    /// Script-only releases only bring a new version record
    fn install_script_only(&self, pending_root: &Path) -> Result<(), UpdateError> {
        let src = pending_root.join(MANIFEST_FILE);
        let dst = self.layout.installed_manifest();
        fs_util::copy_file(&src, &dst).at(&dst)?;
        Ok(())
    }

    /// The destructive phase: delete, move, verify
    fn replace_root<I>(&self, pending_root: &Path, indicator: &mut I, log: &mut InstallLog) -> Result<(), UpdateError>
    where
        I: StatusIndicator + ?Sized,
    {
        let snapshot = self.snapshot_preserved()?;
        log.info(&format!("Preserving {} user files", snapshot.len()));

        self.delete_all_except(indicator, log)?;
        self.verify_preserved(&snapshot, "delete")?;

        self.move_pending(pending_root, indicator, log)?;
        self.verify_preserved(&snapshot, "move")?;

        let missing = self.critical.missing_in(self.layout.root());
        if !missing.is_empty() {
            return Err(UpdateError::PostInstallValidationFailure { missing });
        }
        log.info("✓ Critical files validated");
        Ok(())
    }

    fn snapshot_preserved(&self) -> Result<PreservedSnapshot, UpdateError> {
        let mut snapshot = Vec::new();
        for name in PRESERVED_FILES {
            let path = self.layout.root().join(name);
            if path.is_file() {
                let digest = file_digest(&path, DIGEST_CHUNK_BYTES).at(&path)?;
                snapshot.push((name.to_string(), digest));
            }
        }
        Ok(snapshot)
    }

    fn verify_preserved(&self, snapshot: &PreservedSnapshot, phase: &str) -> Result<(), UpdateError> {
        for (name, before) in snapshot {
            let path = self.layout.root().join(name);
            match file_digest(&path, DIGEST_CHUNK_BYTES) {
                Ok(after) if after == *before => {}
                Ok(_) => {
                    return Err(UpdateError::PreservedFileViolation(format!("{} changed during {}", name, phase)))
                }
                Err(e) => {
                    return Err(UpdateError::PreservedFileViolation(format!(
                        "{} unreadable after {}: {}",
                        name, phase, e
                    )))
                }
            }
        }
        Ok(())
    }

    fn delete_all_except<I>(&self, indicator: &mut I, log: &mut InstallLog) -> Result<(), UpdateError>
    where
        I: StatusIndicator + ?Sized,
    {
        log.info("Performing full reset (deleting all existing files)...");
        let root = self.layout.root();
        for entry in fs::read_dir(root).at(root)? {
            let entry = entry.at(root)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            indicator.tick();

            if is_kept_root_entry(&name) {
                log.info(&format!("  Preserved: /{}", name));
                continue;
            }
            if let Err(e) = fs_util::remove_path(&entry.path()) {
                log.warn(&format!("  Error removing /{}: {}", name, e));
            }
        }
        log.info("✓ Full reset complete");
        Ok(())
    }

    fn move_pending<I>(&self, pending_root: &Path, indicator: &mut I, log: &mut InstallLog) -> Result<(), UpdateError>
    where
        I: StatusIndicator + ?Sized,
    {
        log.info("Moving files from pending root into place...");
        let root = self.layout.root();
        for entry in fs::read_dir(pending_root).at(pending_root)? {
            let entry = entry.at(pending_root)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let src = entry.path();
            indicator.tick();

            if is_kept_root_entry(&name) {
                log.warn(&format!("  Skipping reserved name in release: {}", name));
                if let Err(e) = fs_util::remove_path(&src) {
                    log.warn(&format!("  Could not remove {}: {}", src.display(), e));
                }
                continue;
            }

            let dst = root.join(&name);
            if is_preserved_name(&name) && dst.exists() {
                return Err(UpdateError::PreservedFileViolation(format!("move would overwrite /{}", name)));
            }
            if let Err(e) = move_tree(&src, &dst) {
                log.warn(&format!("  Could not move {}: {}", name, e));
            }
        }
        log.info("✓ File move complete");
        Ok(())
    }

    fn reject<I>(&self, version: FirmwareVersion, error: UpdateError, indicator: &mut I, log: &mut InstallLog) -> InstallOutcome
    where
        I: StatusIndicator + ?Sized,
    {
        indicator.cue(Cue::Error);
        if error.records_incompatibility() {
            mark_incompatible(self.layout, &version.to_string(), &error.reason());
        }
        self.discard_pending(log);
        log.banner(Level::Error, &format!("Update aborted: {}", error));
        InstallOutcome::Rejected { version: Some(version), error }
    }

    fn abort<I>(
        &self,
        version: FirmwareVersion,
        error: UpdateError,
        recovery: &RecoveryStore<'_>,
        indicator: &mut I,
        log: &mut InstallLog,
    ) -> InstallOutcome
    where
        I: StatusIndicator + ?Sized,
    {
        indicator.cue(Cue::Error);
        log.banner(Level::Error, &format!("CRITICAL: install failed: {}", error));
        log.error("Restoring previous critical files from recovery backup");

        let report = recovery.restore_all();
        log.error(&format!(
            "Rollback restored {} files, {} failures",
            report.copied,
            report.failures.len()
        ));
        for failure in &report.failures {
            log.error(&format!("  - {}", failure));
        }

        if error.records_incompatibility() {
            mark_incompatible(self.layout, &version.to_string(), &error.reason());
        }
        self.discard_pending(log);
        log.error("Continuing boot on the previous firmware without reset");
        InstallOutcome::Aborted { version, error }
    }

    fn discard_pending(&self, log: &mut InstallLog) {
        let pending = self.layout.pending_dir();
        if let Err(e) = fs_util::remove_path(&pending) {
            log.warn(&format!("Error cleaning up pending_update: {}", e));
        }
    }
}

/// Root entries the delete pass never removes and a release may never replace
fn is_kept_root_entry(name: &str) -> bool {
    is_preserved_name(name)
        || [RECOVERY_DIR, PENDING_UPDATE_DIR, INSTALL_LOG_FILE]
            .iter()
            .chain(VOLUME_METADATA)
            .any(|kept| same_name(kept, name))
}

/// Rename `src` onto `dst`, falling back to copy + remove (FAT cannot always
/// rename across directories). Directories merge into an existing target.
fn move_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        if !dst.exists() && fs::rename(src, dst).is_ok() {
            return Ok(());
        }
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            move_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::remove_dir(src)
    } else {
        if dst.is_dir() {
            fs::remove_dir_all(dst)?;
        }
        if fs::rename(src, dst).is_ok() {
            return Ok(());
        }
        fs_util::copy_file(src, dst)?;
        fs::remove_file(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OsVersion;
    use crate::platform::NoIndicator;

    #[test]
    fn test_kept_root_entries() {
        assert!(is_kept_root_entry("Recovery"));
        assert!(is_kept_root_entry("pending_update"));
        assert!(is_kept_root_entry("install.log"));
        assert!(is_kept_root_entry("System Volume Information"));
        assert!(is_kept_root_entry("secrets.json"));
        assert!(!is_kept_root_entry("app.bin"));
        assert!(!is_kept_root_entry("lib"));
    }

    #[test]
    fn test_detect_states() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let critical = CriticalFileSet::wicid();
        let identity = DeviceIdentity::new("wicid_s3", OsVersion::new("espidf", 5, 1, 0));
        let hooks = HookRegistry::new();
        let installer = Installer::new(&layout, &critical, &identity, &hooks);

        assert_eq!(installer.detect(), PendingState::None);

        fs::create_dir_all(layout.pending_root()).unwrap();
        assert!(matches!(installer.detect(), PendingState::Incomplete(_)));

        fs::write(layout.pending_root().join("manifest.json"), "{}").unwrap();
        assert!(matches!(installer.detect(), PendingState::Incomplete(_)));

        fs::write(layout.ready_marker(), "garbage").unwrap();
        assert!(matches!(installer.detect(), PendingState::Incomplete(_)));

        fs::write(layout.ready_marker(), "no-checksum\n").unwrap();
        assert_eq!(installer.detect(), PendingState::Ready { marker: "no-checksum".into() });

        fs::create_dir_all(layout.staging_dir()).unwrap();
        assert!(matches!(installer.detect(), PendingState::Incomplete(_)));
    }

    #[test]
    fn test_move_pending_drops_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let critical = CriticalFileSet::wicid();
        let identity = DeviceIdentity::new("wicid_s3", OsVersion::new("espidf", 5, 1, 0));
        let hooks = HookRegistry::new();
        let installer = Installer::new(&layout, &critical, &identity, &hooks);

        fs::write(layout.resolve("/secrets.json"), b"user").unwrap();
        let pending_root = layout.pending_root();
        fs::create_dir_all(&pending_root).unwrap();
        fs::write(pending_root.join("secrets.json"), b"release").unwrap();
        fs::write(pending_root.join("app.bin"), b"v2").unwrap();

        let mut log = InstallLog::new(layout.install_log());
        installer.move_pending(&pending_root, &mut NoIndicator, &mut log).unwrap();

        assert_eq!(fs::read(layout.resolve("/secrets.json")).unwrap(), b"user");
        assert_eq!(fs::read(layout.resolve("/app.bin")).unwrap(), b"v2");
        assert!(!pending_root.join("secrets.json").exists());
        let written = fs::read_to_string(layout.install_log()).unwrap();
        assert!(written.contains("Skipping reserved name in release: secrets.json"));
        assert!(!written.contains("Could not remove"));
    }

    #[test]
    fn test_move_tree_merges_directories() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("lib/fonts")).unwrap();
        fs::write(src.join("lib/fonts/a.bin"), b"new").unwrap();
        fs::create_dir_all(dst.join("lib")).unwrap();
        fs::write(dst.join("lib/old.bin"), b"old").unwrap();

        move_tree(&src.join("lib"), &dst.join("lib")).unwrap();
        assert_eq!(fs::read(dst.join("lib/fonts/a.bin")).unwrap(), b"new");
        assert!(dst.join("lib/old.bin").exists());
        assert!(!src.join("lib").exists());
    }
}
