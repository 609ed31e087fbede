//! reactord: single-threaded reactor server
//!
//! Serves a length-prefixed binary protocol:
//! - echo (type 0): reply with the request body
//! - time (type 1): reply with a fixed timestamp string
//!
//! Features:
//! - Level-triggered event loop over mio (epoll/kqueue) or poll(2)
//! - Pipelined requests, partial reads and partial writes
//! - Connection limit with immediate rejection
//! - Configuration via CLI arguments or TOML file

use reactord::alloc::CountingAlloc;
use reactord::{signal, Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        max_connections = config.max_connections,
        tick_ms = config.tick.as_millis() as u64,
        "Starting reactord server"
    );

    let mut server = Server::bind(&config)?;
    signal::install(server.stop_handle())?;
    server.run()?;

    Ok(())
}
