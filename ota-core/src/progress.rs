// Progress and service callbacks for long-running update work

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Verifying,
    Unpacking,
    Complete,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Downloading => "downloading",
            Phase::Verifying => "verifying",
            Phase::Unpacking => "unpacking",
            Phase::Complete => "complete",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress<'m> {
    pub phase: Phase,
    pub message: &'m str,
    /// `None` when the total is unknown
    pub percent: Option<u8>,
}

pub type ProgressFn<'a> = dyn FnMut(&Progress<'_>) + 'a;
pub type ServiceFn<'a> = dyn FnMut() + 'a;

/// Fan-out for progress reports and the periodic service callback
#[derive(Default)]
pub struct Notifier<'a> {
    progress: Option<&'a mut ProgressFn<'a>>,
    service: Option<&'a mut ServiceFn<'a>>,
}

impl<'a> Notifier<'a> {
    pub fn new() -> Self {
        Self { progress: None, service: None }
    }

    pub fn with_progress(mut self, progress: &'a mut ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_service(mut self, service: &'a mut ServiceFn<'a>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn report(&mut self, phase: Phase, message: &str, percent: Option<u8>) {
        if let Some(progress) = self.progress.as_mut() {
            progress(&Progress { phase, message, percent });
        }
    }

    /// Let background work (LED animation, web portal) run
    pub fn service(&mut self) {
        if let Some(service) = self.service.as_mut() {
            service();
        }
    }

    /// Report then service, the per-chunk pattern
    pub fn notify(&mut self, phase: Phase, message: &str, percent: Option<u8>) {
        self.report(phase, message, percent);
        self.service();
    }
}

/// Percentage of `done` over `total`, capped at `cap`
pub fn percent_of(done: u64, total: u64, cap: u8) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = done.saturating_mul(100) / total;
    Some(pct.min(cap as u64) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_capped() {
        assert_eq!(percent_of(50, 100, 99), Some(50));
        assert_eq!(percent_of(100, 100, 99), Some(99));
        assert_eq!(percent_of(150, 100, 100), Some(100));
        assert_eq!(percent_of(1, 0, 99), None);
    }

    #[test]
    fn test_notifier_calls_both_callbacks() {
        let mut seen = Vec::new();
        let mut services = 0;
        {
            let mut on_progress = |p: &Progress<'_>| seen.push((p.phase, p.percent));
            let mut on_service = || services += 1;
            let mut notifier = Notifier::new().with_progress(&mut on_progress).with_service(&mut on_service);
            notifier.notify(Phase::Downloading, "Download...", Some(10));
            notifier.report(Phase::Complete, "done", Some(100));
        }
        assert_eq!(seen, vec![(Phase::Downloading, Some(10)), (Phase::Complete, Some(100))]);
        assert_eq!(services, 1);
    }
}
