// On-disk layout of the update engine, relative to the filesystem root

use std::path::{Path, PathBuf};

pub const PENDING_UPDATE_DIR: &str = "pending_update";
pub const STAGING_DIR: &str = ".staging";
pub const PENDING_ROOT_DIR: &str = "root";
pub const READY_MARKER: &str = ".ready";
pub const ARCHIVE_FILE: &str = "update.zip";
pub const RECOVERY_DIR: &str = "recovery";
pub const INCOMPATIBLE_FILE: &str = "incompatible_releases.json";
pub const INSTALL_LOG_FILE: &str = "install.log";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const DEVELOPMENT_FLAG: &str = "DEVELOPMENT";

/// Root of the device filesystem as seen by the engine.
///
/// On the device this is the FAT mount point; in tests it is a temp directory.
/// Absolute device paths such as `/app.bin` are resolved against it.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a device path (`/lib/x.bin`) against the root
    pub fn resolve(&self, device_path: &str) -> PathBuf {
        join_device_path(&self.root, device_path)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_UPDATE_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.pending_dir().join(STAGING_DIR)
    }

    pub fn pending_root(&self) -> PathBuf {
        self.pending_dir().join(PENDING_ROOT_DIR)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.pending_dir().join(READY_MARKER)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.pending_dir().join(ARCHIVE_FILE)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.root.join(RECOVERY_DIR)
    }

    pub fn incompatible_file(&self) -> PathBuf {
        self.root.join(INCOMPATIBLE_FILE)
    }

    pub fn install_log(&self) -> PathBuf {
        self.root.join(INSTALL_LOG_FILE)
    }

    pub fn installed_manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.root.join(SECRETS_FILE)
    }

    pub fn development_flag(&self) -> PathBuf {
        self.root.join(DEVELOPMENT_FLAG)
    }
}

/// Join a device path onto an arbitrary base (root, staging tree, recovery mirror)
pub fn join_device_path(base: &Path, device_path: &str) -> PathBuf {
    base.join(device_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_paths_stay_under_root() {
        let layout = Layout::new("/mnt/fat");
        assert_eq!(layout.resolve("/lib/certs.pem"), PathBuf::from("/mnt/fat/lib/certs.pem"));
        assert_eq!(layout.resolve("manifest.json"), PathBuf::from("/mnt/fat/manifest.json"));
        assert_eq!(layout.ready_marker(), PathBuf::from("/mnt/fat/pending_update/.ready"));
        assert_eq!(layout.staging_dir(), PathBuf::from("/mnt/fat/pending_update/.staging"));
    }
}
