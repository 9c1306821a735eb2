use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::hooks::HookStage;

/// Every way an update cycle can fail.
///
/// The variant decides the failure policy: see [`UpdateError::records_incompatibility`].
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("checksum mismatch: expected {}..., got {}...", short(expected), short(actual))]
    ChecksumMismatch { expected: String, actual: String },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("unsupported compression method {method} for {name}")]
    UnsupportedCompression { name: String, method: u16 },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("incomplete package: missing {} critical files", missing.len())]
    IncompletePackage { missing: Vec<String> },

    #[error("incompatible release: {0}")]
    IncompatibleRelease(String),

    #[error("{stage} hook failed: {message}")]
    ScriptFailure { stage: HookStage, message: String },

    #[error("preserved file violation: {0}")]
    PreservedFileViolation(String),

    #[error("critical files missing after install: {}", missing.join(", "))]
    PostInstallValidationFailure { missing: Vec<String> },

    #[error("no recovery backup available")]
    RecoveryUnavailable,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    /// Whether this failure counts as an attempt against the release version.
    ///
    /// Unreachable servers and local configuration problems say nothing about the
    /// release itself, so they are retried at the next scheduled check.
    pub fn records_incompatibility(&self) -> bool {
        !matches!(
            self,
            UpdateError::Network(_) | UpdateError::Config(_) | UpdateError::RecoveryUnavailable
        )
    }

    /// Short reason string stored in the incompatibility record.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        UpdateError::Io { path: path.into(), source }
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..16).unwrap_or(checksum)
}

/// Attach the offending path to a raw `io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, UpdateError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, UpdateError> {
        self.map_err(|e| UpdateError::io(path, e))
    }
}
