//! Files the device cannot live without.
//!
//! The boot-critical subset is what the recovery and installer code itself needs;
//! the full set adds everything required for another OTA cycle. Both are checked
//! against staged trees, the live root and the recovery mirror.

use std::path::Path;

use crate::error::UpdateError;
use crate::fs_util::same_name;
use crate::layout::{join_device_path, INCOMPATIBLE_FILE, DEVELOPMENT_FLAG, MANIFEST_FILE, SECRETS_FILE};

pub const BOOT_CRITICAL: &[&str] = &["/boot.bin", "/settings.json"];

pub const CRITICAL_FILES: &[&str] = &[
    "/boot.bin",
    "/settings.json",
    "/app.bin",
    "/manifest.json",
    "/certs/ca_bundle.pem",
];

pub const WIFI_RETRY_STATE_FILE: &str = "wifi_retry_state.json";

/// User-owned root files an install never deletes or overwrites
pub const PRESERVED_FILES: &[&str] = &[
    SECRETS_FILE,
    WIFI_RETRY_STATE_FILE,
    DEVELOPMENT_FLAG,
    INCOMPATIBLE_FILE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalFileSet {
    boot: Vec<String>,
    full: Vec<String>,
}

impl CriticalFileSet {
    /// Build a registry, checking that paths are absolute, that the boot subset
    /// is contained in the full set and that nothing overlaps the preserved files
    pub fn new<S: AsRef<str>>(boot: &[S], full: &[S]) -> Result<Self, UpdateError> {
        let boot: Vec<String> = boot.iter().map(|p| p.as_ref().to_string()).collect();
        let full: Vec<String> = full.iter().map(|p| p.as_ref().to_string()).collect();

        if full.is_empty() {
            return Err(UpdateError::Config("critical file set is empty".into()));
        }
        if let Some(path) = full.iter().find(|p| !p.starts_with('/') || p.ends_with('/')) {
            return Err(UpdateError::Config(format!("critical path '{}' must be an absolute file path", path)));
        }
        if let Some(path) = boot.iter().find(|p| !full.contains(p)) {
            return Err(UpdateError::Config(format!("boot-critical path '{}' is not in the full set", path)));
        }
        if let Some(path) = full.iter().find(|p| is_preserved_name(p)) {
            return Err(UpdateError::Config(format!("critical path '{}' is a preserved file", path)));
        }

        Ok(Self { boot, full })
    }

    /// The registry shipped with this firmware
    pub fn wicid() -> Self {
        Self {
            boot: BOOT_CRITICAL.iter().map(|p| p.to_string()).collect(),
            full: CRITICAL_FILES.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Reduced set for script-only releases: only the bundled manifest
    pub fn script_only() -> Self {
        let manifest = format!("/{}", MANIFEST_FILE);
        Self { boot: Vec::new(), full: vec![manifest] }
    }

    pub fn paths(&self) -> &[String] {
        &self.full
    }

    pub fn boot_critical(&self) -> &[String] {
        &self.boot
    }

    /// Paths of the full set missing (or not regular files) under `base`
    pub fn missing_in(&self, base: &Path) -> Vec<String> {
        missing(&self.full, base)
    }

    pub fn missing_boot_critical(&self, base: &Path) -> Vec<String> {
        missing(&self.boot, base)
    }
}

impl Default for CriticalFileSet {
    fn default() -> Self {
        Self::wicid()
    }
}

fn missing(paths: &[String], base: &Path) -> Vec<String> {
    paths
        .iter()
        .filter(|p| !join_device_path(base, p).is_file())
        .cloned()
        .collect()
}

/// Whether a root entry name (or device path) belongs to the preserved allowlist
pub fn is_preserved_name(name: &str) -> bool {
    let name = name.trim_start_matches('/');
    PRESERVED_FILES.iter().any(|p| same_name(p, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_shipped_registry_is_consistent() {
        let set = CriticalFileSet::wicid();
        let rebuilt = CriticalFileSet::new(set.boot_critical(), set.paths()).unwrap();
        assert_eq!(rebuilt, set);
        assert!(set.boot_critical().iter().all(|p| set.paths().contains(p)));
    }

    #[test]
    fn test_rejects_invalid_registries() {
        assert!(CriticalFileSet::new(&["/boot.bin"], &["/app.bin"]).is_err());
        assert!(CriticalFileSet::new::<&str>(&[], &["app.bin"]).is_err());
        assert!(CriticalFileSet::new::<&str>(&[], &["/secrets.json"]).is_err());
        assert!(CriticalFileSet::new::<&str>(&[], &[]).is_err());
    }

    #[test]
    fn test_missing_paths_are_reported_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("boot.bin"), b"b").unwrap();
        fs::create_dir_all(dir.path().join("app.bin")).unwrap(); // directory, not a file

        let set = CriticalFileSet::wicid();
        assert_eq!(
            set.missing_in(dir.path()),
            vec!["/settings.json", "/app.bin", "/manifest.json", "/certs/ca_bundle.pem"]
        );
        assert_eq!(set.missing_boot_critical(dir.path()), vec!["/settings.json"]);
    }

    #[test]
    fn test_preserved_names_ignore_case() {
        assert!(is_preserved_name("SECRETS.JSON"));
        assert!(is_preserved_name("/development"));
        assert!(!is_preserved_name("settings.json"));
    }
}
