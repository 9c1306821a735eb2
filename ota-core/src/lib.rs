//! OTA Core - Hardware-independent update and recovery engine for WICID firmware
//!
//! Everything in here runs against a plain directory standing in for the device
//! filesystem, so the whole update cycle can be exercised on the host. The
//! firmware crate supplies the platform pieces (HTTP session, cooperative yield,
//! reset) through the traits in [`platform`].

pub mod archive;
pub mod config;
pub mod critical;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod hooks;
pub mod identity;
pub mod incompatible;
pub mod install_log;
pub mod installer;
pub mod layout;
pub mod manifest;
pub mod package;
pub mod platform;
pub mod progress;
pub mod recovery;
pub mod resolver;
pub mod stager;
pub mod updater;
pub mod version;

pub use config::UpdateConfig;
pub use critical::CriticalFileSet;
pub use error::UpdateError;
pub use hooks::HookRegistry;
pub use identity::{DeviceIdentity, OsVersion};
pub use installer::{InstallOutcome, Installer};
pub use layout::Layout;
pub use manifest::{Channel, Manifest, ReleaseManifest};
pub use recovery::{RecoveryReport, RecoveryStore};
pub use resolver::AvailableUpdate;
pub use updater::UpdateManager;
pub use version::FirmwareVersion;
