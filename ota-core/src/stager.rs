//! Turns a verified archive into a trusted pending update.
//!
//! ```text
//! pending_update/update.zip ──extract──▶ .staging/ ──validate──▶ rename ──▶ root/ + .ready
//! ```
//!
//! Nothing under `root/` exists until the staged tree has passed validation, and
//! `.ready` is written last. A crash at any point leaves either no `root/` or a
//! `root/` without a valid marker, both of which the installer discards.

use std::fs;
use std::path::Path;

use crate::archive::ZipArchive;
use crate::critical::CriticalFileSet;
use crate::error::{IoContext, UpdateError};
use crate::fs_util::{self, is_hidden_path};
use crate::layout::{Layout, MANIFEST_FILE};
use crate::manifest::ReleaseManifest;
use crate::platform::Cooperative;
use crate::progress::{percent_of, Notifier, Phase};

/// Marker content when the manifest carried no checksum
pub const NO_CHECKSUM_MARKER: &str = "no-checksum";

// Report unpacking progress every few members
const PROGRESS_EVERY: usize = 3;

pub struct Stager<'a> {
    layout: &'a Layout,
    critical: &'a CriticalFileSet,
}

impl<'a> Stager<'a> {
    pub fn new(layout: &'a Layout, critical: &'a CriticalFileSet) -> Self {
        Self { layout, critical }
    }

    /// Extract, validate, commit. Returns the staged release manifest.
    pub fn stage<C>(
        &self,
        archive_path: &Path,
        expected_checksum: Option<&str>,
        cooperative: &mut C,
        notifier: &mut Notifier<'_>,
    ) -> Result<ReleaseManifest, UpdateError>
    where
        C: Cooperative + ?Sized,
    {
        let staging = self.layout.staging_dir();
        fs_util::remove_path(&staging).at(&staging)?;
        fs::create_dir_all(&staging).at(&staging)?;

        log::info!("Extracting update files");
        notifier.notify(Phase::Unpacking, "Extracting update files...", Some(0));
        cooperative.yield_now();

        let archive = ZipArchive::open(archive_path)?;
        let members: Vec<_> = archive
            .entries()
            .iter()
            .filter(|e| !is_hidden_path(&e.name))
            .collect();
        let skipped = archive.entries().len() - members.len();
        log::debug!("ZIP contains {} entries", archive.entries().len());
        if skipped > 0 {
            log::debug!("Skipping {} hidden entries", skipped);
        }

        let total = members.len();
        for (index, entry) in members.into_iter().enumerate() {
            archive.extract(entry, &staging)?;
            let done = index + 1;
            if done % PROGRESS_EVERY == 0 || done == total {
                let message = format!("Extracting files... ({}/{})", done, total);
                notifier.notify(Phase::Unpacking, &message, percent_of(done as u64, total as u64, 100));
            }
            cooperative.yield_now();
        }
        drop(archive);
        log::info!("Extraction complete");

        let manifest = ReleaseManifest::load(&staging.join(MANIFEST_FILE)).map_err(|e| {
            log::error!("Extracted manifest.json is corrupted or invalid: {}", e);
            e
        })?;
        log::info!("Manifest validated (version: {})", manifest.version);

        notifier.notify(Phase::Unpacking, "Validating update package...", None);
        let required = if manifest.script_only_release {
            CriticalFileSet::script_only()
        } else {
            self.critical.clone()
        };
        let missing = required.missing_in(&staging);
        if !missing.is_empty() {
            log::error!("Update package is incomplete");
            log::error!("Missing {} critical files:", missing.len());
            for path in missing.iter().take(10) {
                log::error!("  - {}", path);
            }
            if missing.len() > 10 {
                log::error!("  ... and {} more", missing.len() - 10);
            }
            log::error!("Installation would brick the device - aborting");
            return Err(UpdateError::IncompletePackage { missing });
        }
        log::info!("All critical files present in update");

        // Free the archive's space before the tree is committed
        fs_util::remove_path(archive_path).at(archive_path)?;

        let root = self.layout.pending_root();
        log::debug!("Performing atomic rename: .staging -> root");
        fs::rename(&staging, &root).at(&root)?;

        let marker = expected_checksum
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(NO_CHECKSUM_MARKER);
        self.write_ready_marker(marker)?;
        cooperative.yield_now();

        log::info!("Update ready for installation");
        notifier.notify(Phase::Complete, "Update ready for installation", Some(100));
        Ok(manifest)
    }

    fn write_ready_marker(&self, content: &str) -> Result<(), UpdateError> {
        let path = self.layout.ready_marker();
        fs::write(&path, content).at(&path)?;
        if let Err(e) = fs::File::open(&path).and_then(|file| file.sync_all()) {
            log::warn!("Could not sync {}: {}", path.display(), e);
        }

        match read_ready_marker(self.layout) {
            Some(read_back) if read_back == content => {
                log::debug!("Wrote ready marker: {}...", content.get(..16).unwrap_or(content));
                Ok(())
            }
            other => Err(UpdateError::CorruptArchive(format!(
                "ready marker read back as {:?}",
                other.unwrap_or_default()
            ))),
        }
    }
}

/// Trimmed marker content, `None` when missing or empty
pub fn read_ready_marker(layout: &Layout) -> Option<String> {
    let content = fs::read_to_string(layout.ready_marker()).ok()?;
    let content = content.trim();
    (!content.is_empty()).then(|| content.to_string())
}

/// A 64-digit hex checksum or the no-checksum marker
pub fn is_valid_marker(content: &str) -> bool {
    content == NO_CHECKSUM_MARKER || (content.len() == 64 && content.bytes().all(|b| b.is_ascii_hexdigit()))
}
