//! End-to-end FastCGI gateway tests over real TCP sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wasgate_core::arena::ArenaManager;
use wasgate_core::config::GatewayConfig;
use wasgate_core::shutdown::ShutdownController;
use wasgate_core::worker::WorkerPool;
use wasgate_core::Value;
use wasgate_proto::fcgi::{
    append_record, append_stdin, encode_name_value, BeginRequestBody, ProtocolStatus,
    RecordHeader, RecordType, HEADER_LEN,
};
use wasgate_server::dispatch::Handler;
use wasgate_server::{FcgiEngine, FileCache, SessionStore};

struct TestServer {
    port: u16,
    controller: ShutdownController,
    workers: Arc<WorkerPool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(mut config: GatewayConfig, handler: Handler) -> Self {
        config.fcgi_port = 0;
        config.graceful_shutdown_timeout_ms = 2000;
        let config = Arc::new(config);

        let arenas = ArenaManager::new(config.max_in_flight as usize, config.arena_capacity);
        let workers = WorkerPool::new();
        workers.start(config.worker_count());
        let cache = Arc::new(FileCache::new(Duration::from_secs(60), 1 << 20));
        let sessions = Arc::new(SessionStore::new(
            std::env::temp_dir().join("wasgate-fcgi-tests"),
            Arc::clone(&cache),
        ));
        let controller = ShutdownController::new();

        let engine = FcgiEngine::new(
            Arc::clone(&config),
            arenas,
            Arc::clone(&workers),
            handler,
            controller.subscribe(),
            sessions,
            cache,
        )
        .expect("engine setup");
        let port = engine.local_tcp_port().expect("tcp port");
        let thread = std::thread::spawn(move || engine.run());

        Self {
            port,
            controller,
            workers,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.controller.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.workers.shutdown();
    }
}

fn echo_handler() -> Handler {
    Arc::new(|req, out| {
        out.extend_from_slice(b"echo:");
        out.extend_from_slice(&req.data.lock().body);
    })
}

fn begin_request(id: u16, flags: u8) -> Vec<u8> {
    let mut out = Vec::new();
    append_record(
        &mut out,
        RecordType::BeginRequest,
        id,
        &BeginRequestBody::encode(1, flags),
    );
    out
}

fn params_end(id: u16) -> Vec<u8> {
    let mut out = Vec::new();
    append_record(&mut out, RecordType::Params, id, &[]);
    out
}

/// Reads records until END_REQUEST for `id`, returning (type, request_id,
/// content) triples in order.
fn read_until_end(stream: &mut TcpStream, id: u16) -> Vec<(u8, u16, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut records = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(header) = RecordHeader::parse(&buf) {
            let total = header.total_len();
            if buf.len() < total {
                break;
            }
            let content = buf[HEADER_LEN..HEADER_LEN + header.content_length as usize].to_vec();
            buf.drain(..total);
            let done = header.rtype == RecordType::EndRequest as u8 && header.request_id == id;
            records.push((header.rtype, header.request_id, content));
            if done {
                return records;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => panic!("connection closed before END_REQUEST id={id}: {records:?}"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("read: {e}"),
        }
    }
}

fn stdout_payload(records: &[(u8, u16, Vec<u8>)], id: u16) -> Vec<u8> {
    records
        .iter()
        .filter(|(rtype, rid, _)| *rtype == RecordType::Stdout as u8 && *rid == id)
        .flat_map(|(_, _, content)| content.iter().copied())
        .collect()
}

fn end_request_status(records: &[(u8, u16, Vec<u8>)], id: u16) -> u8 {
    let (_, _, content) = records
        .iter()
        .find(|(rtype, rid, _)| *rtype == RecordType::EndRequest as u8 && *rid == id)
        .expect("END_REQUEST present");
    content[4]
}

#[test]
fn minimal_echo_roundtrip() {
    let server = TestServer::start(GatewayConfig::default(), echo_handler());
    let mut stream = server.connect();

    // The canonical minimal exchange: BEGIN, empty PARAMS, empty STDIN.
    let wire: &[u8] = &[
        0x01, 0x01, 0x00, 0x01, 0x00, 0x08, 0x00, 0x00, // BEGIN id=1
        0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // role=1 flags=0
        0x01, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // PARAMS end
        0x01, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // STDIN end
    ];
    stream.write_all(wire).expect("send");

    let records = read_until_end(&mut stream, 1);
    assert_eq!(stdout_payload(&records, 1), b"echo:");
    // STDOUT stream terminates with an empty record before END_REQUEST.
    let stdout_records: Vec<_> = records
        .iter()
        .filter(|(rtype, _, _)| *rtype == RecordType::Stdout as u8)
        .collect();
    assert!(stdout_records.last().expect("stdout records").2.is_empty());
    assert_eq!(
        end_request_status(&records, 1),
        ProtocolStatus::RequestComplete as u8
    );
}

#[test]
fn body_and_params_reach_the_handler() {
    let handler: Handler = Arc::new(|req, out| {
        let data = req.data.lock();
        let who = data
            .env
            .find("WHO")
            .and_then(Value::as_str)
            .unwrap_or("nobody");
        out.extend_from_slice(who.as_bytes());
        out.push(b'/');
        out.extend_from_slice(&data.body);
    });
    let server = TestServer::start(GatewayConfig::default(), handler);
    let mut stream = server.connect();

    let mut wire = begin_request(1, 0);
    let mut pairs = Vec::new();
    encode_name_value(&mut pairs, b"WHO", b"world");
    append_record(&mut wire, RecordType::Params, 1, &pairs);
    wire.extend_from_slice(&params_end(1));
    append_stdin(&mut wire, 1, b"payload");
    stream.write_all(&wire).expect("send");

    let records = read_until_end(&mut stream, 1);
    assert_eq!(stdout_payload(&records, 1), b"world/payload");
}

#[test]
fn params_cap_overflow_is_overloaded() {
    let config = GatewayConfig::default().with_max_params_bytes(16);
    let server = TestServer::start(config, echo_handler());
    let mut stream = server.connect();

    let mut wire = begin_request(2, 0);
    let mut pairs = Vec::new();
    encode_name_value(&mut pairs, b"AAAAAAAAAA", b"BBBBBBBBBB");
    append_record(&mut wire, RecordType::Params, 2, &pairs);
    stream.write_all(&wire).expect("send");

    let records = read_until_end(&mut stream, 2);
    assert_eq!(
        end_request_status(&records, 2),
        ProtocolStatus::Overloaded as u8
    );
    // No STDOUT was produced for the failed request.
    assert!(stdout_payload(&records, 2).is_empty());
}

#[test]
fn stdin_cap_overflow_is_overloaded() {
    let config = GatewayConfig::default().with_max_stdin_bytes(8);
    let server = TestServer::start(config, echo_handler());
    let mut stream = server.connect();

    let mut wire = begin_request(3, 0);
    wire.extend_from_slice(&params_end(3));
    append_record(&mut wire, RecordType::Stdin, 3, &[0x55; 64]);
    stream.write_all(&wire).expect("send");

    let records = read_until_end(&mut stream, 3);
    assert_eq!(
        end_request_status(&records, 3),
        ProtocolStatus::Overloaded as u8
    );
}

#[test]
fn multiplexed_requests_on_one_connection() {
    let server = TestServer::start(GatewayConfig::default(), echo_handler());
    let mut stream = server.connect();

    // Interleave two keep-alive requests on the same connection.
    let mut wire = begin_request(1, 1);
    wire.extend_from_slice(&begin_request(2, 1));
    wire.extend_from_slice(&params_end(1));
    wire.extend_from_slice(&params_end(2));
    append_stdin(&mut wire, 2, b"two");
    append_stdin(&mut wire, 1, b"one");
    stream.write_all(&wire).expect("send");

    // Both responses arrive; completion order is worker-dependent.
    let mut buf = Vec::new();
    let mut ends = 0;
    let mut stdout_1 = Vec::new();
    let mut stdout_2 = Vec::new();
    let mut chunk = [0u8; 4096];
    while ends < 2 {
        while let Some(header) = RecordHeader::parse(&buf) {
            let total = header.total_len();
            if buf.len() < total {
                break;
            }
            let content = buf[HEADER_LEN..HEADER_LEN + header.content_length as usize].to_vec();
            buf.drain(..total);
            if header.rtype == RecordType::Stdout as u8 {
                match header.request_id {
                    1 => stdout_1.extend_from_slice(&content),
                    2 => stdout_2.extend_from_slice(&content),
                    other => panic!("unexpected request id {other}"),
                }
            } else if header.rtype == RecordType::EndRequest as u8 {
                ends += 1;
            }
        }
        if ends < 2 {
            let n = stream.read(&mut chunk).expect("read");
            assert_ne!(n, 0, "closed before both responses");
            buf.extend_from_slice(&chunk[..n]);
        }
    }
    assert_eq!(stdout_1, b"echo:one");
    assert_eq!(stdout_2, b"echo:two");
}

#[test]
fn abort_request_completes_without_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    let handler: Handler = Arc::new(move |_, out| {
        calls_in_handler.fetch_add(1, Ordering::SeqCst);
        out.extend_from_slice(b"never");
    });
    let server = TestServer::start(GatewayConfig::default(), handler);
    let mut stream = server.connect();

    // BEGIN then ABORT before the input stream completes.
    let mut wire = begin_request(7, 0);
    wire.extend_from_slice(&params_end(7));
    append_record(&mut wire, RecordType::AbortRequest, 7, &[]);
    stream.write_all(&wire).expect("send");

    let records = read_until_end(&mut stream, 7);
    assert_eq!(
        end_request_status(&records, 7),
        ProtocolStatus::RequestComplete as u8
    );
    assert!(stdout_payload(&records, 7).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn arena_exhaustion_pauses_accept_until_release() {
    let config = GatewayConfig::default().with_max_in_flight(1);
    let server = TestServer::start(config, echo_handler());

    // First connection takes the only arena and holds it (input never
    // completes).
    let mut holder = server.connect();
    let mut wire = begin_request(1, 0);
    wire.extend_from_slice(&params_end(1));
    holder.write_all(&wire).expect("send holder");

    // Give the reactor time to admit the request and drain the pool.
    std::thread::sleep(Duration::from_millis(150));

    // Second connection sends a complete request; with the pool drained it
    // must not be served yet.
    let mut blocked = server.connect();
    let mut wire = begin_request(1, 0);
    wire.extend_from_slice(&params_end(1));
    append_stdin(&mut wire, 1, b"queued");
    blocked.write_all(&wire).expect("send blocked");

    blocked
        .set_read_timeout(Some(Duration::from_millis(300)))
        .expect("short timeout");
    let mut probe = [0u8; 64];
    match blocked.read(&mut probe) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
            || e.kind() == std::io::ErrorKind::TimedOut => {}
        Ok(n) => panic!("got {n} bytes while the pool was exhausted"),
        Err(e) => panic!("unexpected read error: {e}"),
    }

    // Abort the holder; its arena releases, accept resumes, and the queued
    // connection is served.
    let mut abort = Vec::new();
    append_record(&mut abort, RecordType::AbortRequest, 1, &[]);
    holder.write_all(&abort).expect("send abort");

    blocked
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("long timeout");
    let records = read_until_end(&mut blocked, 1);
    assert_eq!(stdout_payload(&records, 1), b"echo:queued");
}

#[test]
fn request_timeout_is_overloaded() {
    let config = GatewayConfig::default().with_max_request_time(1);
    let server = TestServer::start(config, echo_handler());
    let mut stream = server.connect();

    // PARAMS ends but STDIN never does; housekeeping times the request
    // out.
    let mut wire = begin_request(4, 0);
    wire.extend_from_slice(&params_end(4));
    stream.write_all(&wire).expect("send");

    let records = read_until_end(&mut stream, 4);
    assert_eq!(
        end_request_status(&records, 4),
        ProtocolStatus::Overloaded as u8
    );
}

#[test]
fn graceful_shutdown_finishes_in_flight_request() {
    let handler: Handler = Arc::new(|req, out| {
        std::thread::sleep(Duration::from_millis(300));
        out.extend_from_slice(b"slow:");
        out.extend_from_slice(&req.data.lock().body);
    });
    let server = TestServer::start(GatewayConfig::default(), handler);
    let mut stream = server.connect();

    let mut wire = begin_request(1, 0);
    wire.extend_from_slice(&params_end(1));
    append_stdin(&mut wire, 1, b"work");
    stream.write_all(&wire).expect("send");

    // Let the worker pick the request up, then ask for shutdown.
    std::thread::sleep(Duration::from_millis(100));
    server.controller.shutdown();

    let records = read_until_end(&mut stream, 1);
    assert_eq!(stdout_payload(&records, 1), b"slow:work");
    assert_eq!(
        end_request_status(&records, 1),
        ProtocolStatus::RequestComplete as u8
    );
}

#[test]
fn bad_version_closes_the_connection() {
    let server = TestServer::start(GatewayConfig::default(), echo_handler());
    let mut stream = server.connect();

    let mut wire = begin_request(1, 0);
    wire[0] = 9; // not version 1
    stream.write_all(&wire).expect("send");

    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {n} bytes"),
        Err(e) => panic!("read: {e}"),
    }
}
