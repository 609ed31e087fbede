//! Event reactor: descriptor table plus the wait/dispatch loop.
//!
//! The table is a fixed-capacity array indexed directly by descriptor
//! value. Each slot records the registered interest, the handler to run for
//! each interest bit, and the client that owns the descriptor. Handlers are
//! application-defined tags (`H`); the reactor hands them back to a
//! [`Service`] which does the actual work, so the reactor never needs to
//! know what a connection is.
//!
//! ## Loop
//!
//! Every iteration:
//! 1. Check the stop flag (once, before waiting).
//! 2. Wait for at most `tick - elapsed(previous iteration)`.
//! 3. For each ready descriptor, re-read the slot's *current* mask before
//!    running the read handler, then again before the write handler. A
//!    handler earlier in the batch may have released the slot.
//! 4. Run [`Service::tick`] once a full tick period has passed.

use crate::runtime::backend::{Backend, Fired};
use crate::runtime::{Mask, Token};
use crate::{Error, Result};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Nominal housekeeping period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Application side of the reactor.
pub trait Service {
    /// Handler tag stored in the table.
    type Handler: Copy + std::fmt::Debug;
    /// Per-descriptor state owned by the table.
    type Client;

    /// Run `handler` for `token`, which is ready for `ready`.
    fn dispatch(
        &mut self,
        reactor: &mut Reactor<Self::Handler, Self::Client>,
        handler: Self::Handler,
        token: Token,
        ready: Mask,
    );

    /// Periodic housekeeping.
    fn tick(&mut self, _reactor: &mut Reactor<Self::Handler, Self::Client>) {}
}

struct Slot<H, C> {
    mask: Mask,
    read: Option<H>,
    write: Option<H>,
    client: Option<C>,
    generation: u32,
}

impl<H, C> Slot<H, C> {
    fn empty() -> Self {
        Self {
            mask: Mask::NONE,
            read: None,
            write: None,
            client: None,
            generation: 0,
        }
    }
}

pub struct Reactor<H, C> {
    backend: Box<dyn Backend>,
    slots: Vec<Slot<H, C>>,
    fired: Vec<Fired>,
    max_fd: Option<RawFd>,
    tick: Duration,
    stop: Arc<AtomicBool>,
}

impl<H: Copy + std::fmt::Debug, C> Reactor<H, C> {
    /// Create a reactor with a table of `capacity` slots.
    pub fn new(backend: Box<dyn Backend>, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);

        Self {
            backend,
            slots,
            fired: Vec::with_capacity(capacity),
            max_fd: None,
            tick: DEFAULT_TICK,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the housekeeping period.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Highest descriptor with non-empty interest.
    pub fn max_registered_fd(&self) -> Option<RawFd> {
        self.max_fd
    }

    /// Shared stop flag, for setting from outside the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ask the loop to exit after the current batch.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn index(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Error::Capacity {
                fd,
                capacity: self.slots.len(),
            });
        }
        Ok(fd as usize)
    }

    fn slot(&self, token: Token) -> Option<&Slot<H, C>> {
        let slot = self.slots.get(usize::try_from(token.fd()).ok()?)?;
        (slot.generation == token.generation()).then_some(slot)
    }

    fn slot_mut(&mut self, token: Token) -> Option<&mut Slot<H, C>> {
        let slot = self.slots.get_mut(usize::try_from(token.fd()).ok()?)?;
        (slot.generation == token.generation()).then_some(slot)
    }

    /// Current interest for `fd`; `NONE` when unregistered or out of range.
    pub fn mask(&self, fd: RawFd) -> Mask {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .map_or(Mask::NONE, |slot| slot.mask)
    }

    /// Register `mask` interest on `fd`, running `handler` when ready.
    ///
    /// Bits that are already registered keep their handler.
    pub fn add_event(&mut self, fd: RawFd, mask: Mask, handler: H) -> Result<Token> {
        let idx = self.index(fd)?;
        let current = self.slots[idx].mask;
        let added = mask.remove(current);

        if !added.is_empty() {
            self.backend.register(fd, current, added)?;
            let slot = &mut self.slots[idx];
            slot.mask |= added;
            if added.contains(Mask::READ) {
                slot.read = Some(handler);
            }
            if added.contains(Mask::WRITE) {
                slot.write = Some(handler);
            }
            trace!(fd, mask = ?slot.mask, "event added");
        }

        if !self.slots[idx].mask.is_empty() && self.max_fd.map_or(true, |max| fd > max) {
            self.max_fd = Some(fd);
        }

        Ok(Token::new(fd, self.slots[idx].generation))
    }

    /// Drop `mask` interest from `fd`. Clearing bits that are not set is a
    /// no-op.
    pub fn remove_event(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let idx = self.index(fd)?;
        let current = self.slots[idx].mask;
        let removed = current & mask;
        if removed.is_empty() {
            return Ok(());
        }

        self.backend.unregister(fd, current, removed)?;
        let slot = &mut self.slots[idx];
        slot.mask = current.remove(removed);
        if removed.contains(Mask::READ) {
            slot.read = None;
        }
        if removed.contains(Mask::WRITE) {
            slot.write = None;
        }
        trace!(fd, mask = ?slot.mask, "event removed");

        if slot.mask.is_empty() && self.max_fd == Some(fd) {
            self.max_fd = self.slots[..idx]
                .iter()
                .rposition(|slot| !slot.mask.is_empty())
                .map(|i| i as RawFd);
        }

        Ok(())
    }

    /// Hand ownership of `client` to the slot for `fd`.
    pub fn attach(&mut self, fd: RawFd, client: C) -> Result<Token> {
        let idx = self.index(fd)?;
        let slot = &mut self.slots[idx];
        slot.client = Some(client);
        Ok(Token::new(fd, slot.generation))
    }

    pub fn client(&self, token: Token) -> Option<&C> {
        self.slot(token)?.client.as_ref()
    }

    pub fn client_mut(&mut self, token: Token) -> Option<&mut C> {
        self.slot_mut(token)?.client.as_mut()
    }

    /// True while `token` still names a live registration.
    pub fn is_live(&self, token: Token) -> bool {
        self.slot(token)
            .is_some_and(|slot| !slot.mask.is_empty() || slot.client.is_some())
    }

    /// Tear down the registration behind `token`.
    ///
    /// Removes both interests, bumps the slot generation and returns the
    /// client. Returns `None` for a stale token, so a second release of the
    /// same token does nothing.
    pub fn release(&mut self, token: Token) -> Option<C> {
        if !self.is_live(token) {
            return None;
        }

        if let Err(e) = self.remove_event(token.fd(), Mask::ALL) {
            debug!(fd = token.fd(), error = %e, "unregister on release failed");
        }

        let slot = &mut self.slots[token.fd() as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.mask = Mask::NONE;
        slot.read = None;
        slot.write = None;
        slot.client.take()
    }

    /// Tokens of every slot that currently owns a client.
    pub fn clients(&self) -> impl Iterator<Item = (Token, &C)> + '_ {
        self.slots.iter().enumerate().filter_map(|(fd, slot)| {
            let client = slot.client.as_ref()?;
            Some((Token::new(fd as RawFd, slot.generation), client))
        })
    }

    /// Run until the stop flag is observed.
    pub fn run<S>(&mut self, service: &mut S) -> Result<()>
    where
        S: Service<Handler = H, Client = C>,
    {
        let mut timeout = self.tick;
        let mut last_tick = Instant::now();

        debug!(backend = self.backend.name(), capacity = self.capacity(), "reactor started");

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let started = Instant::now();
            self.turn(service, timeout)?;

            if last_tick.elapsed() >= self.tick {
                last_tick = Instant::now();
                service.tick(self);
            }

            timeout = next_timeout(self.tick, started.elapsed());
        }

        debug!("reactor stopped");
        Ok(())
    }

    /// Wait once for at most `timeout` and dispatch whatever became ready.
    pub fn turn<S>(&mut self, service: &mut S, timeout: Duration) -> Result<()>
    where
        S: Service<Handler = H, Client = C>,
    {
        let mut fired = std::mem::take(&mut self.fired);
        fired.clear();
        let result = self.backend.wait(timeout, self.max_fd, &mut fired);
        if result.is_ok() {
            for event in &fired {
                self.dispatch(service, event);
            }
        }
        self.fired = fired;
        Ok(result?)
    }

    fn dispatch<S>(&mut self, service: &mut S, event: &Fired)
    where
        S: Service<Handler = H, Client = C>,
    {
        let Ok(idx) = self.index(event.fd) else {
            return;
        };

        // Read the slot afresh each time; the read handler may have
        // released it before the write handler gets its turn.
        let slot = &self.slots[idx];
        if event.ready.contains(Mask::READ) && slot.mask.contains(Mask::READ) {
            if let Some(handler) = slot.read {
                let token = Token::new(event.fd, slot.generation);
                service.dispatch(self, handler, token, Mask::READ);
            }
        }

        let slot = &self.slots[idx];
        if event.ready.contains(Mask::WRITE) && slot.mask.contains(Mask::WRITE) {
            if let Some(handler) = slot.write {
                let token = Token::new(event.fd, slot.generation);
                service.dispatch(self, handler, token, Mask::WRITE);
            }
        }
    }
}

/// Time left in the tick after an iteration that took `elapsed`.
fn next_timeout(tick: Duration, elapsed: Duration) -> Duration {
    tick.saturating_sub(elapsed).min(tick)
}
