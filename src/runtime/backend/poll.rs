//! poll(2) backend.
//!
//! Rebuilds the descriptor set from the recorded interests on every wait,
//! scanning up to the reactor's `max_fd` watermark.

use super::mio::error_readiness;
use super::{Backend, Fired};
use crate::runtime::Mask;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollBackend {
    /// Interest per descriptor.
    interests: Vec<Mask>,
    /// Scratch set handed to the kernel.
    pollfds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self {
            interests: Vec::new(),
            pollfds: Vec::new(),
        }
    }

    fn set(&mut self, fd: RawFd, mask: Mask) {
        let idx = fd as usize;
        if idx >= self.interests.len() {
            self.interests.resize(idx + 1, Mask::NONE);
        }
        self.interests[idx] = mask;
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, fd: RawFd, current: Mask, added: Mask) -> io::Result<()> {
        self.set(fd, current | added);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, current: Mask, removed: Mask) -> io::Result<()> {
        self.set(fd, current.remove(removed));
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Duration,
        max_fd: Option<RawFd>,
        fired: &mut Vec<Fired>,
    ) -> io::Result<()> {
        self.pollfds.clear();
        if let Some(max_fd) = max_fd {
            let end = (max_fd as usize + 1).min(self.interests.len());
            for (fd, mask) in self.interests[..end].iter().enumerate() {
                if mask.is_empty() {
                    continue;
                }
                let mut events = 0;
                if mask.contains(Mask::READ) {
                    events |= libc::POLLIN;
                }
                if mask.contains(Mask::WRITE) {
                    events |= libc::POLLOUT;
                }
                self.pollfds.push(libc::pollfd {
                    fd: fd as RawFd,
                    events,
                    revents: 0,
                });
            }
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            let interest = self.interests[pfd.fd as usize];

            let mut ready = Mask::NONE;
            if pfd.revents & libc::POLLIN != 0 {
                ready |= Mask::READ;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ready |= Mask::WRITE;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                ready |= error_readiness(interest);
            }

            let ready = ready & interest;
            if !ready.is_empty() {
                fired.push(Fired { fd: pfd.fd, ready });
            }
        }

        Ok(())
    }
}

/// Round up so a sub-millisecond remainder does not become a busy poll.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
