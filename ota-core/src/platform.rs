/// Narrow interfaces the engine consumes from the firmware around it.
///
/// The firmware crate implements these over ESP-IDF (and over std/reqwest for the
/// host simulator); tests implement them with in-memory fakes.
use std::time::Duration;

use crate::error::UpdateError;

/// Cooperative scheduling points
pub trait Cooperative {
    /// Give other tasks a chance to run
    fn yield_now(&mut self);

    /// Suspend this flow for `duration`
    fn sleep(&mut self, duration: Duration);
}

/// Plain thread yield/sleep for hosts without a scheduler
#[derive(Debug, Default, Clone, Copy)]
pub struct Blocking;

impl Cooperative for Blocking {
    fn yield_now(&mut self) {
        std::thread::yield_now();
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
}

/// Streamed response body
pub trait HttpResponse {
    fn status(&self) -> u16;

    fn content_length(&self) -> Option<u64>;

    /// Read up to `buf.len()` bytes; 0 means the body is complete
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError>;
}

/// HTTP client session. Timeouts are the session's business.
pub trait HttpSession {
    fn head(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<ResponseHead, UpdateError>;

    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn HttpResponse + 'a>, UpdateError>;
}

/// Status LED cues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Downloading,
    Verifying,
    Unpacking,
    Installing,
    Error,
    Idle,
}

pub trait StatusIndicator {
    fn cue(&mut self, _cue: Cue) {}

    /// Advance the current animation one step
    fn tick(&mut self) {}
}

/// Indicator for boards without a status LED
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl StatusIndicator for NoIndicator {}

pub trait SystemReset {
    /// Hard reset so the boot sequence runs again. On the device this does not return.
    fn hard_reset(&mut self);
}
