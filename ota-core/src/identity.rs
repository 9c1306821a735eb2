//! Who the device is: hardware type, OS version and the weather ZIP that
//! rides along in the User-Agent.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::version::FirmwareVersion;

/// OS/runtime version in the `name_major_minor[_patch]` form used by manifests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub fn new(name: impl Into<String>, major: u32, minor: u32, patch: u32) -> Self {
        Self { name: name.into(), major, minor, patch }
    }

    /// Parse `espidf_5_1_2`, `esp_idf_5_1` or `espidf_5`. The family name is every
    /// leading non-numeric segment; missing minor/patch default to 0.
    pub fn parse(tag: &str) -> Option<Self> {
        let segments: Vec<&str> = tag.trim().split('_').collect();
        let split = segments
            .iter()
            .position(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))?;
        if split == 0 {
            return None;
        }

        let name = segments[..split].join("_");
        let mut numbers = segments[split..].iter().map(|s| s.parse::<u32>().ok());
        let major = numbers.next().flatten()?;
        let minor = match numbers.next() {
            Some(n) => n?,
            None => 0,
        };
        let patch = match numbers.next() {
            Some(n) => n?,
            None => 0,
        };

        Some(Self { name: name.to_ascii_lowercase(), major, minor, patch })
    }

    /// Device-side tag: `name_major_minor_patch`
    pub fn tag(&self) -> String {
        format!("{}_{}_{}_{}", self.name, self.major, self.minor, self.patch)
    }

    /// True when `target` is the same family and its major.minor lower bound is
    /// at or below this version; a newer OS never fails the check
    pub fn satisfies(&self, target: &OsVersion) -> bool {
        self.name == target.name && (self.major, self.minor) >= (target.major, target.minor)
    }

    /// True when any target of this OS family accepts the device
    pub fn matches_any<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        targets.iter().any(|t| match OsVersion::parse(t.as_ref()) {
            Some(target) => self.satisfies(&target),
            None => {
                log::debug!("Ignoring malformed OS target '{}'", t.as_ref());
                false
            }
        })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub machine_type: String,
    pub os: OsVersion,
    pub weather_zip: String,
}

impl DeviceIdentity {
    pub fn new(machine_type: impl Into<String>, os: OsVersion) -> Self {
        Self { machine_type: machine_type.into(), os, weather_zip: String::new() }
    }

    pub fn with_weather_zip(mut self, zip: impl Into<String>) -> Self {
        self.weather_zip = zip.into();
        self
    }

    pub fn user_agent(&self, current: &FirmwareVersion) -> String {
        format!(
            "WICID/{} ({}; {}; ZIP:{})",
            current,
            self.machine_type,
            self.os.tag(),
            self.weather_zip
        )
    }
}

#[derive(Deserialize)]
struct SecretsZip {
    #[serde(default)]
    weather_zip: String,
}

/// `weather_zip` from `secrets.json`; empty when the file or key is absent
pub fn weather_zip_from_secrets(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<SecretsZip>(&text).ok())
        .map(|s| s.weather_zip)
        .unwrap_or_default()
}
