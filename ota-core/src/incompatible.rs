//! Retry-limited blacklist of release versions that failed to install.
//!
//! Stored as `/incompatible_releases.json`:
//! `{"releases": {"2.0.0": {"reason": "...", "attempts": 1, "last_reason": "..."}}}`.
//! Document order is kept, so the file reads oldest-first.

use heapless::Vec as BoundedVec;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{IoContext, UpdateError};
use crate::layout::Layout;

/// Attempts at which a version is skipped for good
pub const BLOCK_THRESHOLD: u32 = 3;
pub const MAX_RECORDS: usize = 10;

const MIGRATED_REASON: &str = "Unknown (migrated)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub reason: String,
    #[serde(default = "one")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
}

fn one() -> u32 {
    1
}

impl FailureRecord {
    /// Most recent reason
    pub fn latest_reason(&self) -> &str {
        self.last_reason.as_deref().unwrap_or(&self.reason)
    }
}

/// One slot of headroom so an insert can happen before trimming
type Records = BoundedVec<(String, FailureRecord), { MAX_RECORDS + 1 }>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncompatibleReleases {
    records: Records,
}

impl IncompatibleReleases {
    /// Load the record file; a missing or unreadable file is an empty record
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<RecordFile>(&text) {
            Ok(file) => Self::from_entries(file.into_entries()),
            Err(e) => {
                log::warn!("Ignoring unreadable {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), UpdateError> {
        let json = serde_json::to_string(&RecordFileRef { releases: &self.records })
            .map_err(|e| UpdateError::Config(format!("serializing incompatible releases: {}", e)))?;
        fs::write(path, json).at(path)
    }

    fn from_entries(mut entries: Vec<(String, FailureRecord)>) -> Self {
        keep_most_attempted(&mut entries);
        let mut records = Records::new();
        for entry in entries {
            // Capacity exceeds MAX_RECORDS, so this cannot fail after trimming
            let _ = records.push(entry);
        }
        Self { records }
    }

    /// Count a failed attempt and return the new attempt count
    pub fn record_failure(&mut self, version: &str, reason: &str) -> u32 {
        if let Some((_, record)) = self.records.iter_mut().find(|(v, _)| v == version) {
            record.attempts = record.attempts.saturating_add(1);
            record.last_reason = Some(reason.to_string());
            return record.attempts;
        }

        let record = FailureRecord { reason: reason.to_string(), attempts: 1, last_reason: None };
        let mut entries: Vec<_> = self.records.iter().cloned().collect();
        entries.push((version.to_string(), record));
        *self = Self::from_entries(entries);
        self.attempts(version)
    }

    pub fn get(&self, version: &str) -> Option<&FailureRecord> {
        self.records.iter().find(|(v, _)| v == version).map(|(_, r)| r)
    }

    pub fn attempts(&self, version: &str) -> u32 {
        self.get(version).map(|r| r.attempts).unwrap_or(0)
    }

    pub fn is_blocked(&self, version: &str) -> bool {
        self.attempts(version) >= BLOCK_THRESHOLD
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(v, _)| v.as_str())
    }
}

/// Keep the MAX_RECORDS most-attempted entries; ties keep the earlier one
fn keep_most_attempted(entries: &mut Vec<(String, FailureRecord)>) {
    if entries.len() > MAX_RECORDS {
        entries.sort_by(|a, b| b.1.attempts.cmp(&a.1.attempts));
        entries.truncate(MAX_RECORDS);
    }
}

/// Load, count the failure, save. Errors are logged rather than returned since a
/// failed bookkeeping write must not mask the original failure.
pub fn mark_incompatible(layout: &Layout, version: &str, reason: &str) {
    let path = layout.incompatible_file();
    let mut releases = IncompatibleReleases::load(&path);
    let attempts = releases.record_failure(version, reason);
    match releases.save(&path) {
        Ok(()) => log::warn!("Marked {} as incompatible (attempt {}): {}", version, attempts, reason),
        Err(e) => log::warn!("Could not record failed update {}: {}", version, e),
    }
}

// On-disk shapes

struct RecordFileRef<'a> {
    releases: &'a Records,
}

impl Serialize for RecordFileRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Releases<'a>(&'a Records);

        impl Serialize for Releases<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (version, record) in self.0.iter() {
                    map.serialize_entry(version, record)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("releases", &Releases(self.releases))?;
        map.end()
    }
}

#[derive(Deserialize)]
struct RecordFile {
    #[serde(default)]
    releases: OrderedReleases,
    /// Legacy format: a flat list of blocked versions
    #[serde(default)]
    versions: Option<Vec<String>>,
}

impl RecordFile {
    fn into_entries(self) -> Vec<(String, FailureRecord)> {
        let mut entries = self.releases.0;
        if let Some(legacy) = self.versions {
            log::info!("Migrating {} legacy incompatible release entries", legacy.len());
            for version in legacy {
                if entries.iter().any(|(v, _)| *v == version) {
                    continue;
                }
                let record = FailureRecord {
                    reason: MIGRATED_REASON.to_string(),
                    attempts: BLOCK_THRESHOLD,
                    last_reason: None,
                };
                entries.push((version, record));
            }
        }
        entries
    }
}

#[derive(Default)]
struct OrderedReleases(Vec<(String, FailureRecord)>);

impl<'de> Deserialize<'de> for OrderedReleases {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedReleases;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of version to failure record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((version, record)) = access.next_entry::<String, FailureRecord>()? {
                    entries.push((version, record));
                }
                Ok(OrderedReleases(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
