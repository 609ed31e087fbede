//! Readiness-notification backends.
//!
//! Two interchangeable implementations sit behind the [`Backend`] trait:
//! - `mio`: epoll on Linux, kqueue on macOS. Scales with the number of
//!   ready descriptors rather than registered ones.
//! - `poll`: `poll(2)` over every descriptor up to the reactor's watermark.
//!   Portable fallback.
//!
//! Both report readiness level-triggered: a descriptor with unread data is
//! returned by every `wait` until the data is consumed or interest removed.

mod mio;
mod poll;

pub use self::mio::MioBackend;
pub use self::poll::PollBackend;

use crate::runtime::Mask;
use clap::ValueEnum;
use serde::Deserialize;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One entry of the per-iteration ready list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub fd: RawFd,
    pub ready: Mask,
}

/// Platform readiness mechanism.
///
/// `current` is the interest the reactor has already recorded for `fd`,
/// letting an implementation choose between adding and modifying a
/// registration. The reactor filters no-op calls before they get here.
pub trait Backend {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Add `added` to the interest registered for `fd`.
    fn register(&mut self, fd: RawFd, current: Mask, added: Mask) -> io::Result<()>;

    /// Remove `removed` from the interest registered for `fd`.
    fn unregister(&mut self, fd: RawFd, current: Mask, removed: Mask) -> io::Result<()>;

    /// Block for at most `timeout`, appending ready descriptors to `fired`.
    ///
    /// `max_fd` is the highest descriptor with non-empty interest, if any.
    /// An interrupted wait yields an empty list rather than an error.
    fn wait(
        &mut self,
        timeout: Duration,
        max_fd: Option<RawFd>,
        fired: &mut Vec<Fired>,
    ) -> io::Result<()>;
}

/// Backend selection, made once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// epoll/kqueue through mio
    #[default]
    Mio,
    /// poll(2) fallback
    Poll,
}

/// Construct the configured backend.
pub fn create(kind: BackendType) -> io::Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendType::Mio => Box::new(MioBackend::new()?),
        BackendType::Poll => Box::new(PollBackend::new()),
    })
}
