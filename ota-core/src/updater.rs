//! Runtime side of the update cycle: check the manifest, download and stage a
//! release, then hand over to the boot-time installer with a reset.

use std::time::{Duration, Instant};

use crate::config::UpdateConfig;
use crate::critical::CriticalFileSet;
use crate::error::UpdateError;
use crate::fetcher::{UpdateFetcher, CONNECTION_CLOSE};
use crate::fs_util;
use crate::identity::DeviceIdentity;
use crate::incompatible::{mark_incompatible, IncompatibleReleases};
use crate::layout::Layout;
use crate::manifest::{installed_version, Channel, Manifest, ReleaseManifest};
use crate::platform::{Cooperative, Cue, HttpSession, StatusIndicator, SystemReset};
use crate::progress::{Notifier, Phase};
use crate::resolver::{resolve, AvailableUpdate};
use crate::stager::Stager;
use crate::version::FirmwareVersion;

/// Largest `releases.json` we are willing to buffer
pub const MAX_MANIFEST_BYTES: usize = 64 * 1024;

pub struct UpdateManager<S, C> {
    layout: Layout,
    config: UpdateConfig,
    identity: DeviceIdentity,
    critical: CriticalFileSet,
    session: S,
    cooperative: C,
    next_check: Option<Instant>,
    available: Option<AvailableUpdate>,
}

impl<S, C> UpdateManager<S, C>
where
    S: HttpSession,
    C: Cooperative,
{
    pub fn new(
        layout: Layout,
        config: UpdateConfig,
        identity: DeviceIdentity,
        critical: CriticalFileSet,
        session: S,
        cooperative: C,
    ) -> Self {
        Self {
            layout,
            config: config.sanitized(),
            identity,
            critical,
            session,
            cooperative,
            next_check: None,
            available: None,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn cooperative(&self) -> &C {
        &self.cooperative
    }

    pub fn current_version(&self) -> FirmwareVersion {
        installed_version(&self.layout)
    }

    /// Result of the last successful check
    pub fn available_update(&self) -> Option<&AvailableUpdate> {
        self.available.as_ref()
    }

    /// Fetch `releases.json` and pick the newest compatible release for this
    /// device. `Ok(None)` means up to date.
    pub fn check_for_updates(&mut self) -> Result<Option<AvailableUpdate>, UpdateError> {
        let url = self
            .config
            .manifest_url
            .clone()
            .ok_or_else(|| UpdateError::Config("no manifest_url configured".into()))?;

        let current = self.current_version();
        let channel = Channel::detect(&self.layout);
        log::info!("Checking for updates (current {}, {} channel)", current, channel);

        let user_agent = self.identity.user_agent(&current);
        let headers = [("User-Agent", user_agent.as_str()), CONNECTION_CLOSE];
        let body = self.fetch_manifest(&url, &headers)?;
        let manifest = Manifest::from_slice(&body)?;
        log::debug!("Manifest lists {} releases", manifest.releases.len());

        let blacklist = IncompatibleReleases::load(&self.layout.incompatible_file());
        let update = resolve(&manifest, &self.identity, &current, channel, &blacklist);
        if update.is_none() {
            log::info!("No compatible update available");
        }
        self.available = update.clone();
        Ok(update)
    }

    fn fetch_manifest(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, UpdateError> {
        let mut response = self.session.get(url, headers)?;
        if response.status() != 200 {
            return Err(UpdateError::Network(format!("manifest request failed: HTTP {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            if len > MAX_MANIFEST_BYTES as u64 {
                return Err(UpdateError::InvalidManifest(format!("manifest too large: {} bytes", len)));
            }
        }

        let mut body = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = response.read_chunk(&mut buf)?;
            if n == 0 {
                break;
            }
            if body.len() + n > MAX_MANIFEST_BYTES {
                return Err(UpdateError::InvalidManifest("manifest too large".into()));
            }
            body.extend_from_slice(&buf[..n]);
            self.cooperative.yield_now();
        }
        Ok(body)
    }

    /// Download, verify and stage `update`. On failure the pending state is
    /// removed and, unless the failure was environmental, the version is
    /// recorded as incompatible.
    pub fn download_update<I>(
        &mut self,
        update: &AvailableUpdate,
        indicator: &mut I,
        notifier: &mut Notifier<'_>,
    ) -> Result<ReleaseManifest, UpdateError>
    where
        I: StatusIndicator + ?Sized,
    {
        indicator.cue(Cue::Downloading);
        let result = self.fetch_and_stage(update, indicator, notifier);

        match &result {
            Ok(manifest) => {
                log::info!("Update {} staged, install on next boot", manifest.version);
                indicator.cue(Cue::Idle);
            }
            Err(error) => {
                log::error!("Update {} failed: {}", update.version, error);
                indicator.cue(Cue::Error);
                notifier.notify(Phase::Error, "Update failed", None);

                let pending = self.layout.pending_dir();
                if let Err(e) = fs_util::remove_path(&pending) {
                    log::warn!("Could not clean up {}: {}", pending.display(), e);
                }
                if error.records_incompatibility() {
                    mark_incompatible(&self.layout, &update.version.to_string(), &error.reason());
                }
            }
        }
        result
    }

    fn fetch_and_stage<I>(
        &mut self,
        update: &AvailableUpdate,
        indicator: &mut I,
        notifier: &mut Notifier<'_>,
    ) -> Result<ReleaseManifest, UpdateError>
    where
        I: StatusIndicator + ?Sized,
    {
        let expected = update.sha256.as_deref();
        let archive = UpdateFetcher::new(&self.layout, &self.config).download(
            &mut self.session,
            &mut self.cooperative,
            &update.zip_url,
            expected,
            notifier,
        )?;

        indicator.cue(Cue::Unpacking);
        let manifest = Stager::new(&self.layout, &self.critical).stage(
            &archive,
            expected,
            &mut self.cooperative,
            notifier,
        )?;

        if manifest.version != update.version {
            log::warn!(
                "Archive manifest version {} differs from releases.json entry {}",
                manifest.version,
                update.version
            );
        }
        Ok(manifest)
    }

    /// Full runtime cycle. Returns `Ok(false)` when there is nothing to install;
    /// on success the device is reset and, on hardware, this never returns.
    pub fn check_download_and_reboot<I, R>(
        &mut self,
        indicator: &mut I,
        reset: &mut R,
        notifier: &mut Notifier<'_>,
    ) -> Result<bool, UpdateError>
    where
        I: StatusIndicator + ?Sized,
        R: SystemReset + ?Sized,
    {
        let Some(update) = self.check_for_updates()? else {
            return Ok(false);
        };
        self.download_update(&update, indicator, notifier)?;

        log::info!("Rebooting in {}s to install {}", self.config.reboot_delay_secs, update.version);
        self.cooperative.sleep(Duration::from_secs(self.config.reboot_delay_secs));
        reset.hard_reset();
        Ok(true)
    }

    /// Next check after `delay`, or after the configured interval
    pub fn schedule_next_check(&mut self, now: Instant, delay: Option<Duration>) {
        let delay = delay.unwrap_or_else(|| self.check_interval());
        self.next_check = Some(now + delay);
        log::debug!("Next update check in {}s", delay.as_secs());
    }

    /// First check after `initial_check_delay_secs`
    pub fn schedule_initial_check(&mut self, now: Instant) {
        let delay = Duration::from_secs(self.config.initial_check_delay_secs);
        self.schedule_next_check(now, Some(delay));
    }

    pub fn should_check_now(&self, now: Instant) -> bool {
        self.next_check.is_some_and(|at| now >= at)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.check_interval_hours) * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OsVersion;
    use crate::platform::{HttpResponse, ResponseHead};

    struct Body(Vec<u8>, u16);

    impl HttpResponse for Body {
        fn status(&self) -> u16 {
            self.1
        }

        fn content_length(&self) -> Option<u64> {
            Some(self.0.len() as u64)
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0.drain(..n);
            Ok(n)
        }
    }

    struct ManifestOnly {
        body: Vec<u8>,
        status: u16,
        user_agents: Vec<String>,
    }

    impl HttpSession for ManifestOnly {
        fn head(&mut self, _url: &str, _headers: &[(&str, &str)]) -> Result<ResponseHead, UpdateError> {
            Err(UpdateError::Network("unused".into()))
        }

        fn get<'a>(
            &'a mut self,
            _url: &str,
            headers: &[(&str, &str)],
        ) -> Result<Box<dyn HttpResponse + 'a>, UpdateError> {
            for (name, value) in headers {
                if *name == "User-Agent" {
                    self.user_agents.push(value.to_string());
                }
            }
            Ok(Box::new(Body(self.body.clone(), self.status)))
        }
    }

    struct NoYield;

    impl Cooperative for NoYield {
        fn yield_now(&mut self) {}
        fn sleep(&mut self, _duration: Duration) {}
    }

    const RELEASES: &str = r#"{"releases": [{
        "target_machine_types": ["wicid_s3"],
        "target_operating_systems": ["espidf_5_1"],
        "production": {"version": "1.2.0", "zip_url": "http://x/1.2.0.zip", "sha256": ""}
    }]}"#;

    fn manager_for(dir: &std::path::Path, body: &str, status: u16) -> UpdateManager<ManifestOnly, NoYield> {
        let config = UpdateConfig { manifest_url: Some("http://x/releases.json".into()), ..Default::default() };
        let identity = DeviceIdentity::new("wicid_s3", OsVersion::new("espidf", 5, 1, 2)).with_weather_zip("02139");
        let session = ManifestOnly { body: body.as_bytes().to_vec(), status, user_agents: Vec::new() };
        UpdateManager::new(Layout::new(dir), config, identity, CriticalFileSet::wicid(), session, NoYield)
    }

    #[test]
    fn test_check_finds_newer_release() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), r#"{"version":"1.0.0"}"#).unwrap();
        let mut manager = manager_for(dir.path(), RELEASES, 200);

        let update = manager.check_for_updates().unwrap().unwrap();
        assert_eq!(update.version, FirmwareVersion::new(1, 2, 0));
        assert_eq!(update.sha256, None);
        assert_eq!(manager.available_update(), Some(&update));
        assert_eq!(manager.session.user_agents, vec!["WICID/1.0.0 (wicid_s3; espidf_5_1_2; ZIP:02139)"]);
    }

    #[test]
    fn test_check_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_for(dir.path(), RELEASES, 503);
        assert!(matches!(manager.check_for_updates(), Err(UpdateError::Network(_))));

        let mut manager = manager_for(dir.path(), "not json", 200);
        assert!(matches!(manager.check_for_updates(), Err(UpdateError::InvalidManifest(_))));

        let big = format!("{{\"releases\": [], \"last_updated\": \"{}\"}}", "x".repeat(MAX_MANIFEST_BYTES));
        let mut manager = manager_for(dir.path(), &big, 200);
        assert!(matches!(manager.check_for_updates(), Err(UpdateError::InvalidManifest(_))));

        let mut manager = manager_for(dir.path(), RELEASES, 200);
        manager.config.manifest_url = None;
        assert!(matches!(manager.check_for_updates(), Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_for(dir.path(), RELEASES, 200);
        let start = Instant::now();
        assert!(!manager.should_check_now(start));

        manager.schedule_initial_check(start);
        assert!(!manager.should_check_now(start));
        assert!(manager.should_check_now(start + Duration::from_secs(60)));

        manager.schedule_next_check(start, None);
        assert!(!manager.should_check_now(start + Duration::from_secs(23 * 3600)));
        assert!(manager.should_check_now(start + Duration::from_secs(24 * 3600)));

        manager.schedule_next_check(start, Some(Duration::ZERO));
        assert!(manager.should_check_now(start));
    }
}
