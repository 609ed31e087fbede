//! The framed-protocol server.
//!
//! Glues the listener, the reactor and the codec together. The reactor
//! owns every `Connection` in its table; this module decides what happens
//! when a descriptor becomes ready:
//!
//! - listener readable: accept until the backlog is empty
//! - client readable: one bounded read, then decode every complete frame
//! - client writable: flush staged replies, drop write interest once drained
//!
//! Any read error, peer close or protocol error releases the connection.
//!
//! Two kinds of pressure pause a source instead of spinning on it:
//! - a client whose staged replies reach the write limit loses read
//!   interest until its writer falls back under the limit
//! - the listener loses read interest when accept fails for lack of
//!   descriptors, and regains it when a connection is released or on the
//!   next tick

use crate::alloc;
use crate::config::Config;
use crate::protocol::{Analysis, Codec, CommandTable};
use crate::runtime::{
    self, Connection, Flush, Listener, Mask, ReadOutcome, Reactor, Service, Token,
};
use crate::signal;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Handler tags stored in the reactor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Accept,
    Read,
    Write,
}

/// Everything the handlers need apart from the reactor itself.
struct ServerContext {
    listener: Listener,
    /// Listener read interest dropped after running out of descriptors.
    accept_paused: bool,
    codec: Codec,
    scratch: Vec<u8>,
    read_limit: usize,
    write_limit: usize,
    max_connections: usize,
    idle_timeout: Option<Duration>,
    active_clients: usize,
    total_clients: u64,
    started_at: DateTime<Utc>,
}

pub struct Server {
    reactor: Reactor<Handler, Connection>,
    context: ServerContext,
}

impl Server {
    /// Bind the listening socket and set up the reactor.
    ///
    /// `max_connections` is lowered if the event table would not fit under
    /// the process descriptor limit.
    pub fn bind(config: &Config) -> Result<Self> {
        let mut config = config.clone();
        if let Some(nofile) = descriptor_limit() {
            let requested = config.max_connections;
            if config.fit_descriptor_limit(nofile) {
                warn!(
                    requested,
                    max_connections = config.max_connections,
                    nofile,
                    "Descriptor limit too low, lowering max_connections"
                );
            }
        }

        let backend = runtime::backend::create(config.backend)?;
        let mut reactor = Reactor::new(backend, config.table_capacity()).with_tick(config.tick);

        let listener = Listener::bind(config.listen, config.backlog)?;
        reactor.add_event(listener.fd(), Mask::READ, Handler::Accept)?;

        info!(
            address = %listener.local_addr()?,
            backend = reactor.backend_name(),
            max_connections = config.max_connections,
            table_capacity = reactor.capacity(),
            "Server listening"
        );

        Ok(Self {
            reactor,
            context: ServerContext {
                listener,
                accept_paused: false,
                codec: Codec::new(CommandTable::standard(), config.max_frame_size),
                scratch: vec![0u8; config.read_chunk],
                read_limit: config.read_limit(),
                write_limit: config.write_limit(),
                max_connections: config.max_connections,
                idle_timeout: config.idle_timeout,
                active_clients: 0,
                total_clients: 0,
                started_at: Utc::now(),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.context.listener.local_addr()?)
    }

    /// Flag that stops the loop once set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.reactor.stop_handle()
    }

    /// Serve until stopped, then close every client.
    pub fn run(&mut self) -> Result<()> {
        let result = self.reactor.run(&mut self.context);

        let tokens: Vec<Token> = self.reactor.clients().map(|(token, _)| token).collect();
        for token in tokens {
            self.context.release(&mut self.reactor, token);
        }

        info!(
            total_clients = self.context.total_clients,
            uptime_secs = self.context.uptime().num_seconds(),
            "Server stopped"
        );
        result
    }
}

/// Soft `RLIMIT_NOFILE`, or `None` when unlimited or unavailable.
fn descriptor_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return None;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    usize::try_from(limit.rlim_cur).ok()
}

/// Accept failures that only clear once a descriptor is freed.
fn out_of_descriptors(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

impl ServerContext {
    fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    fn accept(&mut self, reactor: &mut Reactor<Handler, Connection>) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    self.accept_failed(reactor, &e);
                    break;
                }
            };

            if self.active_clients >= self.max_connections {
                warn!(peer = %peer, limit = self.max_connections, "Connection limit reached");
                continue;
            }

            let mut conn = Connection::new(stream, peer, self.read_limit);
            let Some(fd) = conn.fd() else {
                continue;
            };

            match reactor.add_event(fd, Mask::READ, Handler::Read) {
                Ok(_) => {}
                Err(Error::Capacity { capacity, .. }) => {
                    warn!(
                        peer = %peer,
                        fd,
                        capacity,
                        "Descriptor beyond event table, rejecting connection"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to register connection");
                    continue;
                }
            }

            conn.activate();
            if let Err(e) = reactor.attach(fd, conn) {
                warn!(peer = %peer, error = %e, "Failed to attach connection");
                if let Err(e) = reactor.remove_event(fd, Mask::ALL) {
                    debug!(fd, error = %e, "unregister after failed attach");
                }
                continue;
            }

            self.active_clients += 1;
            self.total_clients += 1;
            debug!(peer = %peer, fd, active = self.active_clients, "Accepted connection");
        }
    }

    /// The pending connection stays queued after a failed accept, so a
    /// descriptor shortage would make the listener ready on every wait.
    /// Stop watching it until a descriptor may be available again.
    fn accept_failed(&mut self, reactor: &mut Reactor<Handler, Connection>, err: &io::Error) {
        if !out_of_descriptors(err) {
            warn!(error = %err, "Accept error");
            return;
        }
        if self.accept_paused {
            return;
        }

        warn!(
            error = %err,
            active = self.active_clients,
            "Out of descriptors, pausing accept"
        );
        match reactor.remove_event(self.listener.fd(), Mask::READ) {
            Ok(()) => self.accept_paused = true,
            Err(e) => debug!(error = %e, "Failed to drop listener interest"),
        }
    }

    fn resume_accept(&mut self, reactor: &mut Reactor<Handler, Connection>) {
        if !self.accept_paused {
            return;
        }
        match reactor.add_event(self.listener.fd(), Mask::READ, Handler::Accept) {
            Ok(_) => {
                self.accept_paused = false;
                debug!("Accept resumed");
            }
            Err(e) => debug!(error = %e, "Failed to restore listener interest"),
        }
    }

    fn readable(&mut self, reactor: &mut Reactor<Handler, Connection>, token: Token) {
        let Some(conn) = reactor.client_mut(token) else {
            return;
        };

        match conn.read_from(&mut self.scratch) {
            Ok(ReadOutcome::Data(n)) => trace!(fd = token.fd(), bytes = n, "read"),
            Ok(ReadOutcome::WouldBlock) => return,
            Ok(ReadOutcome::Closed) => {
                debug!(peer = %conn.peer(), "Peer closed connection");
                self.release(reactor, token);
                return;
            }
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "Read error");
                self.release(reactor, token);
                return;
            }
        }

        match self.codec.analyze(conn) {
            Ok(Analysis::Continue) => {}
            Ok(Analysis::NeedReply) => {
                let staged = conn.writer.pending().len();
                if let Err(e) = reactor.add_event(token.fd(), Mask::WRITE, Handler::Write) {
                    warn!(fd = token.fd(), error = %e, "Failed to add write interest");
                    self.release(reactor, token);
                    return;
                }
                if staged >= self.write_limit {
                    trace!(fd = token.fd(), staged, "write limit reached, pausing reads");
                    if let Err(e) = reactor.remove_event(token.fd(), Mask::READ) {
                        debug!(fd = token.fd(), error = %e, "Failed to drop read interest");
                    }
                }
            }
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "Protocol error, closing connection");
                self.release(reactor, token);
            }
        }
    }

    fn writable(&mut self, reactor: &mut Reactor<Handler, Connection>, token: Token) {
        let Some(conn) = reactor.client_mut(token) else {
            return;
        };

        let flushed = conn.flush();
        let staged = conn.writer.pending().len();
        match flushed {
            Ok(Flush::Drained) => {
                if let Err(e) = reactor.remove_event(token.fd(), Mask::WRITE) {
                    debug!(fd = token.fd(), error = %e, "Failed to drop write interest");
                }
            }
            Ok(Flush::Partial) => {}
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "Write error");
                self.release(reactor, token);
                return;
            }
        }

        if staged < self.write_limit && !reactor.mask(token.fd()).contains(Mask::READ) {
            trace!(fd = token.fd(), staged, "resuming reads");
            if let Err(e) = reactor.add_event(token.fd(), Mask::READ, Handler::Read) {
                warn!(fd = token.fd(), error = %e, "Failed to restore read interest");
                self.release(reactor, token);
            }
        }
    }

    fn release(&mut self, reactor: &mut Reactor<Handler, Connection>, token: Token) {
        let Some(mut conn) = reactor.release(token) else {
            return;
        };
        conn.close();
        self.active_clients = self.active_clients.saturating_sub(1);
        debug!(peer = %conn.peer(), active = self.active_clients, "Connection released");

        self.resume_accept(reactor);
    }

    fn sweep_idle(&mut self, reactor: &mut Reactor<Handler, Connection>, timeout: Duration) {
        let now = Instant::now();
        let idle: Vec<Token> = reactor
            .clients()
            .filter(|(_, conn)| conn.idle_for(now) >= timeout)
            .map(|(token, _)| token)
            .collect();

        for token in idle {
            debug!(fd = token.fd(), "Closing idle connection");
            self.release(reactor, token);
        }
    }
}

impl Service for ServerContext {
    type Handler = Handler;
    type Client = Connection;

    fn dispatch(
        &mut self,
        reactor: &mut Reactor<Handler, Connection>,
        handler: Handler,
        token: Token,
        _ready: Mask,
    ) {
        match handler {
            Handler::Accept => self.accept(reactor),
            Handler::Read => self.readable(reactor, token),
            Handler::Write => self.writable(reactor, token),
        }
    }

    fn tick(&mut self, reactor: &mut Reactor<Handler, Connection>) {
        if signal::take_status_request() {
            info!(
                active_clients = self.active_clients,
                total_clients = self.total_clients,
                outstanding_bytes = alloc::outstanding_bytes(),
                max_fd = ?reactor.max_registered_fd(),
                accept_paused = self.accept_paused,
                uptime_secs = self.uptime().num_seconds(),
                "Status"
            );
        }

        self.resume_accept(reactor);

        if let Some(timeout) = self.idle_timeout {
            self.sweep_idle(reactor, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::ECHO;
    use crate::protocol::{pack_request, unpack_response};
    use crate::runtime::BackendType;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    const BACKENDS: [BackendType; 2] = [BackendType::Mio, BackendType::Poll];
    const HEADER: usize = crate::protocol::HEADER_SIZE;

    fn test_config(backend: BackendType) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            backend,
            tick: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn turn(server: &mut Server) {
        server
            .reactor
            .turn(&mut server.context, Duration::from_millis(10))
            .unwrap();
    }

    /// Connect a client and run the loop until the server has accepted it.
    fn connect(server: &mut Server) -> (TcpStream, Token) {
        let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            turn(server);
            if let Some((token, _)) = server.reactor.clients().next() {
                client.set_nonblocking(true).unwrap();
                return (client, token);
            }
            assert!(Instant::now() < deadline, "client never accepted");
        }
    }

    /// Run the loop until the server has picked up a request, which shows
    /// as a change in the client's interest.
    fn turn_until_read(server: &mut Server, fd: i32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.reactor.mask(fd) == Mask::READ {
            turn(server);
            assert!(Instant::now() < deadline, "request never read");
        }
    }

    /// Run the loop while the client reads, until `want` bytes arrived.
    fn drain(server: &mut Server, client: &mut TcpStream, want: usize) -> Vec<u8> {
        let mut received = Vec::with_capacity(want);
        let mut buf = vec![0u8; 256 * 1024];
        let deadline = Instant::now() + Duration::from_secs(20);
        while received.len() < want {
            turn(server);
            loop {
                match client.read(&mut buf) {
                    Ok(0) => panic!("server closed the connection"),
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {}", e),
                }
            }
            assert!(Instant::now() < deadline, "only {} of {} bytes", received.len(), want);
        }
        received
    }

    fn staged(server: &Server, token: Token) -> usize {
        server.reactor.client(token).unwrap().writer.pending().len()
    }

    #[test]
    fn test_write_interest_follows_writer() {
        for backend in BACKENDS {
            let mut server = Server::bind(&Config {
                max_frame_size: 64 << 20,
                ..test_config(backend)
            })
            .unwrap();
            let (mut client, token) = connect(&mut server);
            let fd = token.fd();
            assert_eq!(server.reactor.mask(fd), Mask::READ);

            client.write_all(&pack_request(ECHO, b"hello")).unwrap();
            turn_until_read(&mut server, fd);
            assert_eq!(server.reactor.mask(fd), Mask::READ | Mask::WRITE);

            let reply = drain(&mut server, &mut client, HEADER + 5);
            assert_eq!(unpack_response(&reply).unwrap().1, b"hello");

            // Drained: write interest is gone and stays gone while idle
            assert_eq!(server.reactor.mask(fd), Mask::READ);
            for _ in 0..5 {
                turn(&mut server);
            }
            assert_eq!(server.reactor.mask(fd), Mask::READ);

            // More than the socket buffers hold: the first flush is partial
            let bulk = 32 << 20;
            server
                .reactor
                .client_mut(token)
                .unwrap()
                .writer
                .append(&vec![0u8; bulk]);
            client.write_all(&pack_request(ECHO, b"again")).unwrap();
            turn_until_read(&mut server, fd);
            turn(&mut server);
            assert!(staged(&server, token) > 0, "backend {:?}", backend);
            assert_eq!(server.reactor.mask(fd), Mask::READ | Mask::WRITE);

            drain(&mut server, &mut client, bulk + HEADER + 5);
            assert_eq!(staged(&server, token), 0);
            assert_eq!(server.reactor.mask(fd), Mask::READ);
        }
    }

    #[test]
    fn test_reads_pause_at_write_limit() {
        for backend in BACKENDS {
            let config = Config {
                max_frame_size: 1024,
                read_chunk: 1024,
                ..test_config(backend)
            };
            let limit = config.write_limit();
            let mut server = Server::bind(&config).unwrap();
            let (mut client, token) = connect(&mut server);
            let fd = token.fd();

            // Replies the client has not collected yet
            server
                .reactor
                .client_mut(token)
                .unwrap()
                .writer
                .append(&vec![0u8; limit]);

            let mut batch = Vec::new();
            for i in 0..4u8 {
                batch.extend_from_slice(&pack_request(ECHO, &[b'a' + i; 100]));
            }
            client.write_all(&batch).unwrap();

            // Over the limit: only write interest is left
            turn_until_read(&mut server, fd);
            assert!(staged(&server, token) >= limit);
            assert_eq!(server.reactor.mask(fd), Mask::WRITE, "backend {:?}", backend);

            // Once the client catches up reading resumes, and every
            // pipelined request was answered in order
            let received = drain(&mut server, &mut client, limit + 4 * (HEADER + 100));
            let mut replies = &received[limit..];
            for i in 0..4u8 {
                let (_, body) = unpack_response(replies).unwrap();
                assert_eq!(body, &[b'a' + i; 100][..]);
                replies = &replies[HEADER + 100..];
            }
            assert_eq!(server.reactor.mask(fd), Mask::READ);

            client.write_all(&pack_request(ECHO, b"more")).unwrap();
            let reply = drain(&mut server, &mut client, HEADER + 4);
            assert_eq!(unpack_response(&reply).unwrap().1, b"more");
        }
    }

    #[test]
    fn test_accept_pauses_when_out_of_descriptors() {
        for backend in BACKENDS {
            let mut server = Server::bind(&test_config(backend)).unwrap();
            let listener_fd = server.context.listener.fd();
            assert_eq!(server.reactor.mask(listener_fd), Mask::READ);

            // Unrelated failures leave the listener alone
            let aborted = io::Error::from_raw_os_error(libc::ECONNABORTED);
            server.context.accept_failed(&mut server.reactor, &aborted);
            assert_eq!(server.reactor.mask(listener_fd), Mask::READ);

            let exhausted = io::Error::from_raw_os_error(libc::EMFILE);
            server.context.accept_failed(&mut server.reactor, &exhausted);
            assert_eq!(server.reactor.mask(listener_fd), Mask::NONE);

            // A queued client waits rather than making every wait return
            let _client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
            let started = Instant::now();
            for _ in 0..3 {
                turn(&mut server);
            }
            assert!(started.elapsed() >= Duration::from_millis(25));
            assert!(server.reactor.clients().next().is_none());

            // Retried from the tick
            server.context.resume_accept(&mut server.reactor);
            assert_eq!(server.reactor.mask(listener_fd), Mask::READ);
            let deadline = Instant::now() + Duration::from_secs(5);
            while server.reactor.clients().next().is_none() {
                turn(&mut server);
                assert!(Instant::now() < deadline, "backend {:?}", backend);
            }
        }
    }

    #[test]
    fn test_release_resumes_accept() {
        let mut server = Server::bind(&test_config(BackendType::Poll)).unwrap();
        let (_client, token) = connect(&mut server);
        let listener_fd = server.context.listener.fd();

        let exhausted = io::Error::from_raw_os_error(libc::ENFILE);
        server.context.accept_failed(&mut server.reactor, &exhausted);
        assert_eq!(server.reactor.mask(listener_fd), Mask::NONE);

        server.context.release(&mut server.reactor, token);
        assert_eq!(server.reactor.mask(listener_fd), Mask::READ);
        assert!(!server.context.accept_paused);
    }
}
