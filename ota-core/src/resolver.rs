//! Picks the release a device should install next.
//!
//! The compatibility predicate here is shared with the boot-time recheck in the
//! installer, so a release can never pass one and fail the other for the same
//! device state.

use std::fmt;

use crate::identity::DeviceIdentity;
use crate::incompatible::IncompatibleReleases;
use crate::manifest::{Channel, ChannelPayload, Manifest, ReleaseEntry};
use crate::version::FirmwareVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    Hardware { machine: String, targets: Vec<String> },
    OperatingSystem { os: String, targets: Vec<String> },
    NotNewer { candidate: FirmwareVersion, current: FirmwareVersion },
    Blocked { attempts: u32, reason: String },
    BadVersion(String),
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incompatibility::Hardware { machine, targets } => {
                write!(f, "Incompatible hardware: {} not in {:?}", machine, targets)
            }
            Incompatibility::OperatingSystem { os, targets } => {
                write!(f, "Incompatible OS: {} not compatible with {:?}", os, targets)
            }
            Incompatibility::NotNewer { candidate, current } => {
                write!(f, "Version not newer: {} <= {}", candidate, current)
            }
            Incompatibility::Blocked { attempts, reason } => {
                write!(f, "Blocked after {} attempts: {}", attempts, reason)
            }
            Incompatibility::BadVersion(v) => write!(f, "Unparseable version '{}'", v),
        }
    }
}

/// Hardware, OS, version and blacklist checks, in that order
pub fn check_compatibility<S: AsRef<str>>(
    machine_types: &[S],
    operating_systems: &[S],
    candidate: &FirmwareVersion,
    identity: &DeviceIdentity,
    current: &FirmwareVersion,
    blacklist: &IncompatibleReleases,
) -> Result<(), Incompatibility> {
    if !machine_types.iter().any(|m| m.as_ref() == identity.machine_type) {
        return Err(Incompatibility::Hardware {
            machine: identity.machine_type.clone(),
            targets: to_strings(machine_types),
        });
    }

    if !identity.os.matches_any(operating_systems) {
        return Err(Incompatibility::OperatingSystem {
            os: identity.os.tag(),
            targets: to_strings(operating_systems),
        });
    }

    if candidate <= current {
        return Err(Incompatibility::NotNewer { candidate: candidate.clone(), current: current.clone() });
    }

    let version = candidate.to_string();
    if let Some(record) = blacklist.get(&version) {
        if blacklist.is_blocked(&version) {
            return Err(Incompatibility::Blocked {
                attempts: record.attempts,
                reason: record.latest_reason().to_string(),
            });
        }
        log::warn!(
            "Version {} had {} failed attempts: {}",
            version,
            record.attempts,
            record.latest_reason()
        );
    }

    Ok(())
}

fn to_strings<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    items.iter().map(|s| s.as_ref().to_string()).collect()
}

/// A compatible release picked from the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct AvailableUpdate {
    pub version: FirmwareVersion,
    pub channel: Channel,
    pub zip_url: String,
    pub sha256: Option<String>,
    pub release_notes: String,
    pub script_only_release: bool,
    pub target_machine_types: Vec<String>,
    pub target_operating_systems: Vec<String>,
}

/// First manifest entry with a compatible payload for `channel`.
///
/// The development channel looks at both payloads of an entry and takes the
/// newer one; equal versions go to production.
pub fn resolve(
    manifest: &Manifest,
    identity: &DeviceIdentity,
    current: &FirmwareVersion,
    channel: Channel,
    blacklist: &IncompatibleReleases,
) -> Option<AvailableUpdate> {
    for entry in &manifest.releases {
        let production = candidate(entry, Channel::Production, identity, current, blacklist);
        let selected = match channel {
            Channel::Production => production,
            Channel::Development => {
                let development = candidate(entry, Channel::Development, identity, current, blacklist);
                match (production, development) {
                    (Some(p), Some(d)) => {
                        if d.version > p.version {
                            Some(d)
                        } else {
                            Some(p)
                        }
                    }
                    (p, d) => p.or(d),
                }
            }
        };

        if let Some(update) = selected {
            log::info!("Update available: {} -> {} ({})", current, update.version, update.channel);
            return Some(update);
        }
    }

    log::info!("No compatible updates available");
    None
}

fn candidate(
    entry: &ReleaseEntry,
    channel: Channel,
    identity: &DeviceIdentity,
    current: &FirmwareVersion,
    blacklist: &IncompatibleReleases,
) -> Option<AvailableUpdate> {
    let payload = entry.payload(channel)?;
    let raw_version = match entry.payload_version(payload) {
        Some(v) => v,
        None => {
            log::debug!("Skipping {} payload without a version", channel);
            return None;
        }
    };
    let version = match raw_version.parse::<FirmwareVersion>() {
        Ok(v) => v,
        Err(_) => {
            log::debug!("Skipping {}: {}", channel, Incompatibility::BadVersion(raw_version.to_string()));
            return None;
        }
    };

    if let Err(reason) = check_compatibility(
        entry.target_machine_types.as_slice(),
        entry.target_operating_systems.as_slice(),
        &version,
        identity,
        current,
        blacklist,
    ) {
        log::debug!("Skipping {} {}: {}", channel, version, reason);
        return None;
    }

    let zip_url = match &payload.zip_url {
        Some(url) if !url.is_empty() => url.clone(),
        _ => {
            log::warn!("Skipping {} {}: no zip_url", channel, version);
            return None;
        }
    };

    Some(selection(entry, payload, channel, version, zip_url))
}

fn selection(
    entry: &ReleaseEntry,
    payload: &ChannelPayload,
    channel: Channel,
    version: FirmwareVersion,
    zip_url: String,
) -> AvailableUpdate {
    AvailableUpdate {
        version,
        channel,
        zip_url,
        sha256: payload.sha256.clone().filter(|s| !s.trim().is_empty()),
        release_notes: payload.release_notes.clone(),
        script_only_release: payload.script_only_release,
        target_machine_types: entry.target_machine_types.clone(),
        target_operating_systems: entry.target_operating_systems.clone(),
    }
}
