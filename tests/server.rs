//! Integration tests for the reactord server.
//!
//! Each test starts a server on an ephemeral port in its own thread and
//! talks to it over real TCP sockets.

use reactord::protocol::command::{ECHO, TIME};
use reactord::protocol::frame::RequestHeader;
use reactord::protocol::{pack_request, Client, HEADER_SIZE};
use reactord::runtime::BackendType;
use reactord::{Config, Server};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<reactord::Result<()>>>,
}

impl TestServer {
    fn start(config: Config) -> Self {
        let (tx, rx) = mpsc::channel();

        // The reactor is built on the thread that runs it.
        let handle = thread::spawn(move || {
            let mut server = Server::bind(&config)?;
            tx.send((server.local_addr()?, server.stop_handle())).unwrap();
            server.run()
        });

        let (addr, stop) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server failed to start");

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    fn with_backend(backend: BackendType) -> Self {
        Self::start(test_config(backend))
    }

    fn client(&self) -> Client {
        let client = Client::connect(self.addr).unwrap();
        client.set_timeout(Some(Duration::from_secs(2))).unwrap();
        client
    }

    fn shutdown(mut self) -> reactord::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn test_config(backend: BackendType) -> Config {
    Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        backend,
        tick: Duration::from_millis(20),
        ..Config::default()
    }
}

/// True once the peer has closed the connection.
fn wait_closed(stream: &mut TcpStream) -> bool {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::ConnectionReset,
    }
}

/// True if nothing arrives within `wait`.
fn stays_quiet(stream: &mut TcpStream, wait: Duration) -> bool {
    stream.set_read_timeout(Some(wait)).unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        Ok(_) => false,
    }
}

const BACKENDS: [BackendType; 2] = [BackendType::Mio, BackendType::Poll];

#[test]
fn test_echo_round_trip() {
    for backend in BACKENDS {
        let server = TestServer::with_backend(backend);
        let mut client = server.client();

        let reply = client.call(ECHO, b"hello").unwrap();
        assert!(reply.is_success(), "backend {:?}", backend);
        assert_eq!(reply.body, b"hello");

        // Empty body is a valid request
        let reply = client.call(ECHO, b"").unwrap();
        assert!(reply.is_success());
        assert!(reply.body.is_empty());

        server.shutdown().unwrap();
    }
}

#[test]
fn test_time_reply() {
    let server = TestServer::with_backend(BackendType::Mio);
    let mut client = server.client();

    let reply = client.call(TIME, b"").unwrap();
    assert_eq!(reply.code, 0);
    assert_eq!(reply.body, b"13.14");
}

#[test]
fn test_bad_checksum_closes_connection() {
    for backend in BACKENDS {
        let server = TestServer::with_backend(backend);
        let mut client = server.client();

        let mut frame = pack_request(ECHO, b"hello");
        frame[6] ^= 0xff;
        client.stream().write_all(&frame).unwrap();

        assert!(wait_closed(client.stream()), "backend {:?}", backend);
    }
}

#[test]
fn test_unknown_command_closes_connection() {
    let server = TestServer::with_backend(BackendType::Poll);
    let mut client = server.client();

    client.stream().write_all(&pack_request(7, b"")).unwrap();
    assert!(wait_closed(client.stream()));
}

#[test]
fn test_header_split_across_reads() {
    for backend in BACKENDS {
        let server = TestServer::with_backend(backend);
        let mut client = server.client();

        let frame = pack_request(TIME, b"");
        assert_eq!(frame.len(), HEADER_SIZE);

        client.stream().write_all(&frame[..4]).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.stream().write_all(&frame[4..]).unwrap();

        let reply = client.recv().unwrap();
        assert_eq!(reply.body, b"13.14", "backend {:?}", backend);

        // Exactly one reply
        assert!(stays_quiet(client.stream(), Duration::from_millis(100)));
    }
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    for backend in BACKENDS {
        let server = TestServer::with_backend(backend);
        let mut client = server.client();

        let mut batch = pack_request(ECHO, b"a");
        batch.extend_from_slice(&pack_request(ECHO, b"bb"));
        batch.extend_from_slice(&pack_request(TIME, b""));
        client.stream().write_all(&batch).unwrap();

        assert_eq!(client.recv().unwrap().body, b"a", "backend {:?}", backend);
        assert_eq!(client.recv().unwrap().body, b"bb");
        assert_eq!(client.recv().unwrap().body, b"13.14");
    }
}

#[test]
fn test_body_arrives_in_pieces() {
    let server = TestServer::with_backend(BackendType::Mio);
    let mut client = server.client();

    let body = vec![b'x'; 64 * 1024];
    let mut header = Vec::new();
    RequestHeader::new(ECHO, body.len() as u32).encode(&mut header);
    client.stream().write_all(&header).unwrap();
    for chunk in body.chunks(8 * 1024) {
        client.stream().write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let reply = client.recv().unwrap();
    assert_eq!(reply.body.len(), body.len());
    assert!(reply.body.iter().all(|b| *b == b'x'));
}

#[test]
fn test_connection_limit_rejects_extra_client() {
    for backend in BACKENDS {
        let server = TestServer::start(Config {
            max_connections: 2,
            ..test_config(backend)
        });

        let mut first = server.client();
        let mut second = server.client();
        assert!(first.call(ECHO, b"1").unwrap().is_success());
        assert!(second.call(ECHO, b"2").unwrap().is_success());

        let mut extra = TcpStream::connect(server.addr).unwrap();
        assert!(wait_closed(&mut extra), "backend {:?}", backend);

        // Existing clients are unaffected
        assert_eq!(first.call(ECHO, b"still here").unwrap().body, b"still here");
        assert_eq!(second.call(TIME, b"").unwrap().body, b"13.14");

        // Closing one frees a slot for a new client
        drop(first);
        thread::sleep(Duration::from_millis(100));
        let mut third = server.client();
        assert!(third.call(ECHO, b"3").unwrap().is_success());
    }
}

#[test]
fn test_idle_connections_closed() {
    let server = TestServer::start(Config {
        idle_timeout: Some(Duration::from_millis(200)),
        ..test_config(BackendType::Poll)
    });

    let mut client = server.client();
    assert!(client.call(ECHO, b"hi").unwrap().is_success());

    let started = Instant::now();
    assert!(wait_closed(client.stream()));
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_stop_flag_ends_run() {
    for backend in BACKENDS {
        let server = TestServer::with_backend(backend);
        let mut client = server.client();
        assert!(client.call(ECHO, b"bye").unwrap().is_success());

        let started = Instant::now();
        server.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        // Remaining clients were closed on the way out
        assert!(wait_closed(client.stream()), "backend {:?}", backend);
    }
}
