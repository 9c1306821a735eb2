//! Manifest documents: the remote `releases.json` and the `manifest.json`
//! bundled in every release archive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::UpdateError;
use crate::layout::Layout;
use crate::version::FirmwareVersion;

/// Remote releases document, `{"releases": [...]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub releases: Vec<ReleaseEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, UpdateError> {
        serde_json::from_slice(bytes).map_err(|e| UpdateError::InvalidManifest(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub target_machine_types: Vec<String>,
    #[serde(default)]
    pub target_operating_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production: Option<ChannelPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub development: Option<ChannelPayload>,
}

impl ReleaseEntry {
    pub fn payload(&self, channel: Channel) -> Option<&ChannelPayload> {
        match channel {
            Channel::Production => self.production.as_ref(),
            Channel::Development => self.development.as_ref(),
        }
    }

    /// Version of a channel payload; the payload's own version wins over the entry's
    pub fn payload_version<'a>(&'a self, payload: &'a ChannelPayload) -> Option<&'a str> {
        payload.version.as_deref().or(self.version.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub script_only_release: bool,
    #[serde(default)]
    pub has_pre_install_script: bool,
    #[serde(default)]
    pub has_post_install_script: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

/// `manifest.json` inside a release tree and at `/manifest.json` on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub version: FirmwareVersion,
    #[serde(default)]
    pub target_machine_types: Vec<String>,
    #[serde(default)]
    pub target_operating_systems: Vec<String>,
    #[serde(default)]
    pub script_only_release: bool,
    #[serde(default)]
    pub has_pre_install_script: bool,
    #[serde(default)]
    pub has_post_install_script: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

impl ReleaseManifest {
    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        let text = fs::read_to_string(path)
            .map_err(|e| UpdateError::InvalidManifest(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| UpdateError::InvalidManifest(format!("{}: {}", path.display(), e)))
    }
}

/// Version recorded in `/manifest.json`, or 0.0.0 when it is missing or invalid
pub fn installed_version(layout: &Layout) -> FirmwareVersion {
    match ReleaseManifest::load(&layout.installed_manifest()) {
        Ok(manifest) => manifest.version,
        Err(e) => {
            log::warn!("No valid installed manifest ({}), assuming 0.0.0", e);
            FirmwareVersion::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Production,
    Development,
}

impl Channel {
    /// Development when the `/DEVELOPMENT` flag file exists
    pub fn detect(layout: &Layout) -> Self {
        if layout.development_flag().exists() {
            Channel::Development
        } else {
            Channel::Production
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Production => "production",
            Channel::Development => "development",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASES: &str = r#"{
        "releases": [
            {
                "version": "0.5.0",
                "target_machine_types": ["wicid_s3"],
                "target_operating_systems": ["espidf_5_1"],
                "production": {
                    "version": "0.6.0",
                    "zip_url": "https://example.com/wicid-0.6.0.zip",
                    "sha256": "abc",
                    "release_notes": "Weather fixes",
                    "has_post_install_script": true
                },
                "development": {
                    "version": "0.7.0-b1",
                    "zip_url": "https://example.com/wicid-0.7.0-b1.zip",
                    "script_only_release": true
                }
            }
        ],
        "last_updated": "2025-01-01T00:00:00Z"
    }"#;

    #[test]
    fn test_parse_releases_document() {
        let manifest = Manifest::from_slice(RELEASES.as_bytes()).unwrap();
        let entry = &manifest.releases[0];
        let prod = entry.payload(Channel::Production).unwrap();
        assert_eq!(entry.payload_version(prod), Some("0.6.0"));
        assert!(prod.has_post_install_script);
        assert!(!prod.script_only_release);

        let dev = entry.payload(Channel::Development).unwrap();
        assert!(dev.script_only_release);
        assert_eq!(dev.sha256, None);
        assert_eq!(dev.release_notes, "");
    }

    #[test]
    fn test_invalid_manifest_is_reported() {
        assert!(matches!(Manifest::from_slice(b"{not json"), Err(UpdateError::InvalidManifest(_))));
    }

    #[test]
    fn test_installed_version_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert_eq!(installed_version(&layout), FirmwareVersion::ZERO);

        fs::write(layout.installed_manifest(), r#"{"version": "1.4.2", "release_type": "production"}"#).unwrap();
        assert_eq!(installed_version(&layout), FirmwareVersion::new(1, 4, 2));

        fs::write(layout.installed_manifest(), r#"{"version": "banana"}"#).unwrap();
        assert_eq!(installed_version(&layout), FirmwareVersion::ZERO);
    }

    #[test]
    fn test_channel_from_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert_eq!(Channel::detect(&layout), Channel::Production);
        fs::write(layout.development_flag(), b"").unwrap();
        assert_eq!(Channel::detect(&layout), Channel::Development);
    }
}
