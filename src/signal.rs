//! Signal handling.
//!
//! - SIGINT / SIGTERM set the reactor's stop flag (via `ctrlc`). The loop
//!   notices at its next iteration.
//! - SIGUSR1 requests a status report. The handler only stores into an
//!   atomic; the report itself is produced by the reactor tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static STATUS_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_status_signal(_: libc::c_int) {
    STATUS_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the shutdown and status handlers.
///
/// `stop` is the reactor's stop flag.
pub fn install(stop: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        // Second signal - force exit
        if stop.swap(true, Ordering::SeqCst) {
            tracing::warn!("Received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("Received shutdown signal, stopping after current batch");
    })?;

    let handler = on_status_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGUSR1, handler as libc::sighandler_t);
    }

    Ok(())
}

/// Take a pending status request, clearing it.
pub fn take_status_request() -> bool {
    STATUS_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Request a status report as SIGUSR1 would.
pub fn request_status() {
    STATUS_REQUESTED.store(true, Ordering::SeqCst);
}
