//! mio backend: epoll on Linux, kqueue on macOS.
//!
//! mio registers descriptors edge-triggered. A handler issues a single
//! bounded read per event, so data left in the socket would never be
//! reported again. To keep level-triggered semantics every descriptor
//! returned by a wait is re-registered with its current interest before the
//! next wait; re-registering a descriptor that is still ready queues a fresh
//! event for it.

use super::{Backend, Fired};
use crate::runtime::Mask;
use ::mio::unix::SourceFd;
use ::mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

const EVENTS_CAPACITY: usize = 1024;

pub struct MioBackend {
    poll: Poll,
    events: Events,
    /// Interest currently registered with mio, indexed by descriptor.
    registered: Vec<Mask>,
    /// Descriptors reported by the previous wait, pending re-arm.
    rearm: Vec<RawFd>,
}

impl MioBackend {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registered: Vec::new(),
            rearm: Vec::new(),
        })
    }

    fn registered(&self, fd: RawFd) -> Mask {
        self.registered
            .get(fd as usize)
            .copied()
            .unwrap_or(Mask::NONE)
    }

    fn record(&mut self, fd: RawFd, mask: Mask) {
        let idx = fd as usize;
        if idx >= self.registered.len() {
            self.registered.resize(idx + 1, Mask::NONE);
        }
        self.registered[idx] = mask;
    }

    /// Apply `mask` as the full interest for `fd`, given what mio holds now.
    fn apply(&mut self, fd: RawFd, previous: Mask, mask: Mask) -> io::Result<()> {
        let registry = self.poll.registry();
        let token = Token(fd as usize);
        match to_interest(mask) {
            None => registry.deregister(&mut SourceFd(&fd))?,
            Some(interest) if previous.is_empty() => {
                registry.register(&mut SourceFd(&fd), token, interest)?
            }
            Some(interest) => registry.reregister(&mut SourceFd(&fd), token, interest)?,
        }
        self.record(fd, mask);
        Ok(())
    }
}

impl Backend for MioBackend {
    fn name(&self) -> &'static str {
        "mio"
    }

    fn register(&mut self, fd: RawFd, current: Mask, added: Mask) -> io::Result<()> {
        self.apply(fd, current, current | added)
    }

    fn unregister(&mut self, fd: RawFd, current: Mask, removed: Mask) -> io::Result<()> {
        self.apply(fd, current, current.remove(removed))
    }

    fn wait(
        &mut self,
        timeout: Duration,
        _max_fd: Option<RawFd>,
        fired: &mut Vec<Fired>,
    ) -> io::Result<()> {
        // Descriptors released since the last wait were recorded as NONE and
        // are skipped here.
        let rearm = std::mem::take(&mut self.rearm);
        for &fd in &rearm {
            if let Some(interest) = to_interest(self.registered(fd)) {
                let res =
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest);
                if let Err(e) = res {
                    debug!(fd, error = %e, "re-arm failed");
                }
            }
        }
        self.rearm = rearm;
        self.rearm.clear();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let interest = self.registered(fd);

            let mut ready = Mask::NONE;
            if event.is_readable() || event.is_read_closed() {
                ready |= Mask::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Mask::WRITE;
            }
            if event.is_error() {
                ready |= error_readiness(interest);
            }

            let ready = ready & interest;
            if !ready.is_empty() {
                fired.push(Fired { fd, ready });
                self.rearm.push(fd);
            }
        }

        Ok(())
    }
}

fn to_interest(mask: Mask) -> Option<Interest> {
    match (mask.contains(Mask::READ), mask.contains(Mask::WRITE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Errors surface through the read handler, or the write handler when the
/// descriptor is only waiting to write.
pub(super) fn error_readiness(interest: Mask) -> Mask {
    if interest.contains(Mask::READ) {
        Mask::READ
    } else {
        interest
    }
}
