//! Streams a release archive to `/pending_update/update.zip` and verifies it.
//!
//! Every chunk (network or checksum) is followed by a service callback and a
//! cooperative yield, so the LED animation and portal keep running during a
//! multi-minute download.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::UpdateConfig;
use crate::error::{IoContext, UpdateError};
use crate::fs_util::{self, to_hex};
use crate::layout::Layout;
use crate::platform::{Cooperative, HttpSession};
use crate::progress::{percent_of, Notifier, Phase};

pub const CONNECTION_CLOSE: (&str, &str) = ("Connection", "close");

pub struct UpdateFetcher<'a> {
    layout: &'a Layout,
    config: &'a UpdateConfig,
}

impl<'a> UpdateFetcher<'a> {
    pub fn new(layout: &'a Layout, config: &'a UpdateConfig) -> Self {
        Self { layout, config }
    }

    /// Download `url` into a fresh pending directory and check it against
    /// `expected_checksum`. Returns the archive path.
    ///
    /// Leaves partial state behind on failure; the caller discards it.
    pub fn download<S, C>(
        &self,
        session: &mut S,
        cooperative: &mut C,
        url: &str,
        expected_checksum: Option<&str>,
        notifier: &mut Notifier<'_>,
    ) -> Result<PathBuf, UpdateError>
    where
        S: HttpSession + ?Sized,
        C: Cooperative + ?Sized,
    {
        let pending = self.layout.pending_dir();
        fs_util::remove_path(&pending).at(&pending)?;
        fs::create_dir_all(&pending).at(&pending)?;

        let archive = self.layout.archive_path();
        log::info!("Downloading update: {}", url);
        log::debug!("Saving to: {}", archive.display());
        notifier.notify(Phase::Downloading, "Starting download...", Some(0));

        let headers = [CONNECTION_CLOSE];

        // HEAD only feeds the progress bar
        let mut content_length = match session.head(url, &headers) {
            Ok(head) if head.status == 200 => head.content_length,
            Ok(head) => {
                log::debug!("HEAD returned HTTP {} (non-critical)", head.status);
                None
            }
            Err(e) => {
                log::debug!("HEAD request failed (non-critical): {}", e);
                None
            }
        };
        if let Some(len) = content_length {
            log::debug!("Content-Length from HEAD: {} bytes", len);
        }

        let mut response = session.get(url, &headers)?;
        if response.status() != 200 {
            return Err(UpdateError::Network(format!("download failed: HTTP {}", response.status())));
        }
        if content_length.is_none() {
            content_length = response.content_length();
        }

        let mut file = File::create(&archive).at(&archive)?;
        let mut buf = vec![0u8; self.config.download_chunk_bytes.max(1)];
        let mut received: u64 = 0;
        loop {
            let n = response.read_chunk(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).at(&archive)?;
            received += n as u64;

            let pct = content_length.and_then(|total| percent_of(received, total, 99));
            notifier.notify(Phase::Downloading, "Download...", pct);
            cooperative.yield_now();
        }
        drop(response);
        file.sync_all().at(&archive)?;
        drop(file);
        cooperative.yield_now();

        if let Some(total) = content_length {
            if received != total {
                return Err(UpdateError::Network(format!(
                    "download truncated: {} of {} bytes",
                    received, total
                )));
            }
        }

        log::info!("Download complete ({} bytes)", received);
        notifier.notify(Phase::Downloading, "Download complete", Some(100));

        match expected_checksum {
            Some(expected) => {
                log::info!("Verifying download integrity");
                notifier.notify(Phase::Verifying, "Verifying download integrity...", None);
                self.verify_checksum(&archive, expected, cooperative, notifier)?;
                notifier.notify(Phase::Verifying, "Verification complete", Some(100));
            }
            None => log::warn!("No checksum in manifest - update may be from older release"),
        }

        Ok(archive)
    }

    /// Compare the file digest with `expected`, ignoring case
    pub fn verify_checksum<C>(
        &self,
        path: &Path,
        expected: &str,
        cooperative: &mut C,
        notifier: &mut Notifier<'_>,
    ) -> Result<(), UpdateError>
    where
        C: Cooperative + ?Sized,
    {
        let actual = sha256_cooperative(path, self.config.checksum_chunk_bytes, cooperative, notifier)?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            log::info!("Checksum verified: {}...", &actual[..16]);
            return Ok(());
        }

        let err = UpdateError::ChecksumMismatch { expected: expected.trim().to_string(), actual };
        log::error!("Checksum verification failed: {}", err);
        log::error!("SECURITY WARNING: Downloaded file may be corrupted or tampered with");
        notifier.notify(Phase::Error, "Verification failed", None);
        Err(err)
    }
}

/// SHA-256 of a file in `chunk`-byte reads with a yield after each
pub fn sha256_cooperative<C>(
    path: &Path,
    chunk: usize,
    cooperative: &mut C,
    notifier: &mut Notifier<'_>,
) -> Result<String, UpdateError>
where
    C: Cooperative + ?Sized,
{
    let total = fs::metadata(path).at(path)?.len();
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk.max(1)];
    let mut processed: u64 = 0;
    let mut ticks = 0u32;

    loop {
        let n = file.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        processed += n as u64;
        ticks += 1;

        notifier.notify(
            Phase::Verifying,
            "Verifying download integrity...",
            percent_of(processed, total, 100),
        );
        cooperative.yield_now();
    }

    log::debug!("Checksum over {} bytes in {} chunks", processed, ticks);
    Ok(to_hex(&hasher.finalize()))
}
