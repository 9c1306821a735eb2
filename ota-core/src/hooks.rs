//! Install hooks compiled into the firmware.
//!
//! A release flags `has_pre_install_script` / `has_post_install_script` in its
//! manifest; the installer then looks up the hook registered for that exact
//! version. Hooks are plain function pointers, so a release can only run code
//! that was reviewed and built into an earlier firmware image.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::error::UpdateError;
use crate::install_log::InstallLog;
use crate::version::FirmwareVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreInstall,
    PostInstall,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::PreInstall => f.write_str("pre_install"),
            HookStage::PostInstall => f.write_str("post_install"),
        }
    }
}

/// What a pre-install hook may look at: the trusted pending tree, before
/// anything on the live filesystem has been touched
pub struct PreInstallContext<'a> {
    pub log: &'a mut InstallLog,
    pub version: &'a FirmwareVersion,
    pub pending_root: &'a Path,
    pub pending_dir: &'a Path,
}

pub struct PostInstallContext<'a> {
    pub log: &'a mut InstallLog,
    pub version: &'a FirmwareVersion,
    /// Live filesystem root, already holding the new release
    pub root: &'a Path,
}

pub type HookResult = Result<(), String>;
pub type PreInstallHook = fn(&mut PreInstallContext<'_>) -> HookResult;
pub type PostInstallHook = fn(&mut PostInstallContext<'_>) -> HookResult;

#[derive(Default, Clone)]
pub struct HookRegistry {
    pre: Vec<(FirmwareVersion, PreInstallHook)>,
    post: Vec<(FirmwareVersion, PostInstallHook)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_install(mut self, version: FirmwareVersion, hook: PreInstallHook) -> Self {
        self.pre.retain(|(v, _)| *v != version);
        self.pre.push((version, hook));
        self
    }

    pub fn post_install(mut self, version: FirmwareVersion, hook: PostInstallHook) -> Self {
        self.post.retain(|(v, _)| *v != version);
        self.post.push((version, hook));
        self
    }

    pub fn has(&self, stage: HookStage, version: &FirmwareVersion) -> bool {
        match stage {
            HookStage::PreInstall => self.pre.iter().any(|(v, _)| v == version),
            HookStage::PostInstall => self.post.iter().any(|(v, _)| v == version),
        }
    }

    pub fn len(&self) -> usize {
        self.pre.len() + self.post.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the pre-install hook for `ctx.version`. A missing hook, an error
    /// return and a panic are all failures.
    pub fn run_pre_install(&self, ctx: &mut PreInstallContext<'_>) -> Result<(), UpdateError> {
        let stage = HookStage::PreInstall;
        let hook = self
            .pre
            .iter()
            .find(|(v, _)| v == ctx.version)
            .map(|(_, h)| *h)
            .ok_or_else(|| missing(stage, ctx.version))?;
        ctx.log.info(&format!("Running {} hook for {}", stage, ctx.version));
        guarded(stage, || hook(ctx))
    }

    pub fn run_post_install(&self, ctx: &mut PostInstallContext<'_>) -> Result<(), UpdateError> {
        let stage = HookStage::PostInstall;
        let hook = self
            .post
            .iter()
            .find(|(v, _)| v == ctx.version)
            .map(|(_, h)| *h)
            .ok_or_else(|| missing(stage, ctx.version))?;
        ctx.log.info(&format!("Running {} hook for {}", stage, ctx.version));
        guarded(stage, || hook(ctx))
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pre: Vec<String> = self.pre.iter().map(|(v, _)| v.to_string()).collect();
        let post: Vec<String> = self.post.iter().map(|(v, _)| v.to_string()).collect();
        f.debug_struct("HookRegistry").field("pre", &pre).field("post", &post).finish()
    }
}

fn missing(stage: HookStage, version: &FirmwareVersion) -> UpdateError {
    UpdateError::ScriptFailure {
        stage,
        message: format!("no {} hook compiled in for {}", stage, version),
    }
}

// With panic = "abort" builds a panic still takes the device down; the
// watchdog reboot then finds the untouched pending tree again.
fn guarded(stage: HookStage, run: impl FnOnce() -> HookResult) -> Result<(), UpdateError> {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(UpdateError::ScriptFailure { stage, message }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "hook panicked".to_string());
            Err(UpdateError::ScriptFailure { stage, message: format!("panic: {}", message) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_hook(ctx: &mut PreInstallContext<'_>) -> HookResult {
        ctx.log.info("checking pending tree");
        Ok(())
    }

    fn failing_hook(_ctx: &mut PreInstallContext<'_>) -> HookResult {
        Err("settings schema too old".into())
    }

    fn panicking_hook(_ctx: &mut PreInstallContext<'_>) -> HookResult {
        panic!("boom")
    }

    fn run(registry: &HookRegistry, version: &str) -> Result<(), UpdateError> {
        let dir = tempfile::tempdir().unwrap();
        let mut log = InstallLog::console();
        let version: FirmwareVersion = version.parse().unwrap();
        let mut ctx = PreInstallContext {
            log: &mut log,
            version: &version,
            pending_root: dir.path(),
            pending_dir: dir.path(),
        };
        registry.run_pre_install(&mut ctx)
    }

    #[test]
    fn test_hooks_are_keyed_by_version() {
        let registry = HookRegistry::new()
            .pre_install(FirmwareVersion::new(1, 0, 0), ok_hook)
            .pre_install(FirmwareVersion::new(2, 0, 0), failing_hook)
            .pre_install(FirmwareVersion::new(3, 0, 0), panicking_hook);

        assert!(run(&registry, "1.0.0").is_ok());

        let err = run(&registry, "2.0.0").unwrap_err();
        assert_eq!(err.to_string(), "pre_install hook failed: settings schema too old");

        let err = run(&registry, "3.0.0").unwrap_err();
        assert!(err.to_string().contains("panic: boom"));

        let err = run(&registry, "4.0.0").unwrap_err();
        assert!(matches!(err, UpdateError::ScriptFailure { stage: HookStage::PreInstall, .. }));
        assert!(err.records_incompatibility());
    }

    #[test]
    fn test_later_registration_replaces_earlier() {
        let registry = HookRegistry::new()
            .pre_install(FirmwareVersion::new(1, 0, 0), failing_hook)
            .pre_install(FirmwareVersion::new(1, 0, 0), ok_hook);
        assert_eq!(registry.len(), 1);
        assert!(run(&registry, "1.0.0").is_ok());
        assert!(!registry.has(HookStage::PostInstall, &FirmwareVersion::new(1, 0, 0)));
    }
}
