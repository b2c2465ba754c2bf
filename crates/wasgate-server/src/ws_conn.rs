//! WebSocket connection engine.
//!
//! A second single-threaded reactor owns the WebSocket listener. Each
//! client goes through the HTTP upgrade handshake, then its frames are
//! decoded and reassembled into messages; every completed message runs on
//! the worker pool against a synthetic request and the handler's output is
//! framed back with the same opcode.
//!
//! Non-upgrade requests are served as plain HTTP: headers and
//! Content-Length are parsed, the body is buffered in full, the HTTP-mode
//! handler runs, and the connection closes after the response flushes.
//!
//! Arena exhaustion here is best-effort: a message that cannot get an
//! arena is dropped rather than queued (the FastCGI side owns the
//! accept-pause backpressure).

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use wasgate_core::arena::ArenaManager;
use wasgate_core::config::GatewayConfig;
use wasgate_core::request::{Request, RequestFlags};
use wasgate_core::shutdown::ShutdownSignal;
use wasgate_core::worker::WorkerPool;
use wasgate_core::{log_debug, log_error, log_info, Value};
use wasgate_proto::http::{find_header_block_end, HttpHead};
use wasgate_proto::ws::{
    build_accept_response, decode_frame, encode_frame, Opcode, DEFAULT_MAX_FRAME_SIZE,
};

use crate::dispatch::{finalize_request_data, prepare_request_data, Handler};
use crate::file_cache::FileCache;
use crate::net::{ListenAddr, Listener, Stream};
use crate::pending::ResponseQueue;
use crate::session::SessionStore;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 2;
const READ_CHUNK: usize = 4096;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

struct Client {
    stream: Stream,
    token: Token,
    handshake_done: bool,
    http_mode: bool,
    http_head: Option<HttpHead>,
    http_dispatched: bool,
    http_responded: bool,
    close_after_flush: bool,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    out_pos: usize,
    closed: bool,
    want_write: bool,
    assembling: bool,
    assemble_opcode: u8,
    assemble_data: Vec<u8>,
}

impl Client {
    fn new(stream: Stream, token: Token) -> Self {
        Self {
            stream,
            token,
            handshake_done: false,
            http_mode: false,
            http_head: None,
            http_dispatched: false,
            http_responded: false,
            close_after_flush: false,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            closed: false,
            want_write: false,
            assembling: false,
            assemble_opcode: 0,
            assemble_data: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct WsLink {
    config: Arc<GatewayConfig>,
    queue: Arc<ResponseQueue>,
    sessions: Arc<SessionStore>,
    file_cache: Arc<FileCache>,
    ws_handler: Handler,
    http_handler: Handler,
}

enum Phase {
    Wait,
    Frames,
    Http,
}

/// The WebSocket reactor.
pub struct WsEngine {
    config: Arc<GatewayConfig>,
    arenas: Arc<ArenaManager>,
    workers: Arc<WorkerPool>,
    shutdown: ShutdownSignal,
    link: WsLink,
    addr: ListenAddr,
    poll: Poll,
    listener: Listener,
    listener_registered: bool,
    queue: Arc<ResponseQueue>,
    clients: Slab<Client>,
}

impl WsEngine {
    /// Binds the listener and sets up the poll, waker, and pending queue.
    ///
    /// # Errors
    ///
    /// Socket, bind, listen, and poll-creation failures; all startup-fatal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GatewayConfig>,
        arenas: Arc<ArenaManager>,
        workers: Arc<WorkerPool>,
        ws_handler: Handler,
        http_handler: Handler,
        shutdown: ShutdownSignal,
        sessions: Arc<SessionStore>,
        file_cache: Arc<FileCache>,
    ) -> io::Result<Self> {
        let addr = ListenAddr::from_config(config.ws_port, &config.ws_socket_path);
        let mut listener = Listener::bind(&addr, config.backlog)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let queue = ResponseQueue::new(waker);
        arenas.add_observer(queue.clone());

        let link = WsLink {
            config: Arc::clone(&config),
            queue: Arc::clone(&queue),
            sessions,
            file_cache,
            ws_handler,
            http_handler,
        };

        Ok(Self {
            config,
            arenas,
            workers,
            shutdown,
            link,
            addr,
            poll,
            listener,
            listener_registered: true,
            queue,
            clients: Slab::new(),
        })
    }

    /// The bound TCP port; useful with a configured port of 0.
    #[must_use]
    pub fn local_tcp_port(&self) -> Option<u16> {
        self.listener.local_tcp_port()
    }

    /// Runs the reactor until shutdown.
    pub fn run(mut self) {
        log_info!("websocket listening on {}", self.addr);
        let mut events = Events::with_capacity(64);
        let mut last_housekeeping = Instant::now();
        let mut draining_since: Option<Instant> = None;

        loop {
            if self.shutdown.is_shutting_down() {
                if draining_since.is_none() {
                    draining_since = Some(Instant::now());
                    if self.listener_registered {
                        let _ = self.poll.registry().deregister(&mut self.listener);
                        self.listener_registered = false;
                    }
                    log_info!("websocket draining, {} clients open", self.clients.len());
                }
                let budget = Duration::from_millis(self.config.graceful_shutdown_timeout_ms);
                let over_budget = draining_since.is_some_and(|t| t.elapsed() >= budget);
                if self.clients.is_empty() || over_budget || self.shutdown.is_forced() {
                    break;
                }
            }

            let timeout = HOUSEKEEPING_INTERVAL
                .checked_sub(last_housekeeping.elapsed())
                .unwrap_or(Duration::ZERO);
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log_error!("poll: {e}");
                    break;
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    WAKER_TOKEN => self.waker_ready(),
                    token => self.handle_io(
                        token.0 - TOKEN_BASE,
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error(),
                    ),
                }
            }

            if last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
                last_housekeeping = Instant::now();
                self.housekeeping();
            }
        }

        let keys: Vec<usize> = self.clients.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_client(key);
        }
        self.addr.cleanup();
        log_info!("websocket listener stopped");
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    let entry = self.clients.vacant_entry();
                    let key = entry.key();
                    let token = Token(key + TOKEN_BASE);
                    let mut client = Client::new(stream, token);
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut client.stream, token, Interest::READABLE)
                    {
                        log_error!("register accepted client: {e}");
                        continue;
                    }
                    entry.insert(client);
                    log_debug!("accepted client={key}");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log_error!("accept: {e}");
                    return;
                }
            }
        }
    }

    fn handle_io(&mut self, key: usize, readable: bool, writable: bool, errored: bool) {
        {
            let Some(client) = self.clients.get_mut(key) else {
                return;
            };
            if errored {
                client.closed = true;
            }
            if readable {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match client.stream.read(&mut chunk) {
                        Ok(0) => {
                            client.closed = true;
                            break;
                        }
                        Ok(n) => client.in_buf.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log_error!("recv client={key}: {e}");
                            client.closed = true;
                            break;
                        }
                    }
                }
            }
        }

        if readable {
            self.process_client(key);
        }
        self.flush_client(key);
        if writable {
            self.flush_client(key);
        }

        if self.clients.get(key).is_some_and(client_should_close) {
            self.close_client(key);
        }
    }

    /// Advances a client through handshake, then frames or plain HTTP.
    fn process_client(&mut self, key: usize) {
        let phase = {
            let Some(client) = self.clients.get_mut(key) else {
                return;
            };
            if client.closed {
                return;
            }
            if !client.handshake_done && !client.http_mode {
                match find_header_block_end(&client.in_buf) {
                    None => {
                        if client.in_buf.len() > MAX_HANDSHAKE_BYTES {
                            client.closed = true;
                        }
                        Phase::Wait
                    }
                    Some(end) => match HttpHead::parse(&client.in_buf[..end]) {
                        Err(_) => {
                            client.closed = true;
                            Phase::Wait
                        }
                        Ok(head) => {
                            client.in_buf.drain(..end);
                            if head.is_websocket_upgrade() {
                                match head.websocket_key() {
                                    Some(ws_key) if !ws_key.is_empty() => {
                                        let response = build_accept_response(ws_key);
                                        client.out_buf.extend_from_slice(&response);
                                        client.handshake_done = true;
                                        Phase::Frames
                                    }
                                    _ => {
                                        client.closed = true;
                                        Phase::Wait
                                    }
                                }
                            } else {
                                client.http_mode = true;
                                client.http_head = Some(head);
                                Phase::Http
                            }
                        }
                    },
                }
            } else if client.http_mode {
                Phase::Http
            } else {
                Phase::Frames
            }
        };

        match phase {
            Phase::Wait => {}
            Phase::Frames => self.process_frames(key),
            Phase::Http => self.process_http(key),
        }
    }

    /// Decodes and acts on every complete frame in the in-buffer.
    fn process_frames(&mut self, key: usize) {
        let link = self.link.clone();
        let workers = Arc::clone(&self.workers);
        let arenas = Arc::clone(&self.arenas);

        let Some(client) = self.clients.get_mut(key) else {
            return;
        };
        let client_fd = client.stream.as_raw_fd();

        loop {
            match decode_frame(&client.in_buf, DEFAULT_MAX_FRAME_SIZE) {
                Ok(None) => break,
                Err(e) => {
                    log_debug!("client={key}: {e}");
                    client.closed = true;
                    break;
                }
                Ok(Some((frame, consumed))) => {
                    client.in_buf.drain(..consumed);
                    match Opcode::from_u8(frame.opcode) {
                        Some(Opcode::Close) => {
                            client.closed = true;
                        }
                        Some(Opcode::Ping) => {
                            let pong = encode_frame(Opcode::Pong.to_u8(), &frame.payload, true);
                            client.out_buf.extend_from_slice(&pong);
                        }
                        Some(Opcode::Pong) => {}
                        Some(Opcode::Text | Opcode::Binary) => {
                            if client.assembling {
                                // A new data frame abandons any half-built
                                // message.
                                client.assemble_data.clear();
                                client.assembling = false;
                            }
                            if frame.fin {
                                dispatch_message(
                                    &link,
                                    &workers,
                                    &arenas,
                                    key,
                                    client_fd,
                                    frame.opcode,
                                    frame.payload,
                                );
                            } else {
                                client.assembling = true;
                                client.assemble_opcode = frame.opcode;
                                client.assemble_data = frame.payload;
                            }
                        }
                        Some(Opcode::Continuation) => {
                            if !client.assembling {
                                client.closed = true;
                            } else {
                                client.assemble_data.extend_from_slice(&frame.payload);
                                if frame.fin {
                                    let opcode = client.assemble_opcode;
                                    let complete = std::mem::take(&mut client.assemble_data);
                                    client.assembling = false;
                                    dispatch_message(
                                        &link, &workers, &arenas, key, client_fd, opcode, complete,
                                    );
                                }
                            }
                        }
                        None => {
                            // Unknown opcode: frame consumed and dropped.
                        }
                    }
                    if client.closed {
                        break;
                    }
                }
            }
        }
    }

    /// Plain-HTTP mode: waits for the full body, then dispatches once.
    fn process_http(&mut self, key: usize) {
        let link = self.link.clone();
        let workers = Arc::clone(&self.workers);
        let arenas = Arc::clone(&self.arenas);

        let Some(client) = self.clients.get_mut(key) else {
            return;
        };
        if client.http_dispatched {
            return;
        }
        let needed = client
            .http_head
            .as_ref()
            .and_then(HttpHead::content_length)
            .unwrap_or(0);
        if client.in_buf.len() < needed {
            return;
        }
        let body: Vec<u8> = client.in_buf.drain(..needed).collect();
        let Some(head) = client.http_head.take() else {
            return;
        };
        client.http_dispatched = true;
        client.close_after_flush = true;

        if !dispatch_http(&link, &workers, &arenas, key, head, body) {
            log_debug!("client={key}: dropping http request (no arenas)");
            client.closed = true;
        }
    }

    fn flush_client(&mut self, key: usize) {
        let registry = self.poll.registry();
        let Some(client) = self.clients.get_mut(key) else {
            return;
        };
        loop {
            let remaining = client.out_buf.len() - client.out_pos;
            if remaining == 0 {
                if client.out_pos != 0 {
                    client.out_buf.clear();
                    client.out_pos = 0;
                }
                if client.want_write
                    && registry
                        .reregister(&mut client.stream, client.token, Interest::READABLE)
                        .is_ok()
                {
                    client.want_write = false;
                }
                return;
            }
            match client.stream.write(&client.out_buf[client.out_pos..]) {
                Ok(0) => {
                    client.closed = true;
                    return;
                }
                Ok(n) => client.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !client.want_write
                        && registry
                            .reregister(
                                &mut client.stream,
                                client.token,
                                Interest::READABLE | Interest::WRITABLE,
                            )
                            .is_ok()
                    {
                        client.want_write = true;
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_error!("send client={key}: {e}");
                    client.closed = true;
                    return;
                }
            }
        }
    }

    fn waker_ready(&mut self) {
        for pending in self.queue.drain() {
            let key = pending.conn;
            {
                let Some(client) = self.clients.get_mut(key) else {
                    continue;
                };
                if client.closed {
                    continue;
                }
                if client.out_buf.capacity() == 0 {
                    client.out_buf.reserve(self.config.output_buffer_initial);
                }
                client.out_buf.extend_from_slice(&pending.bytes);
                if client.http_dispatched {
                    client.http_responded = true;
                }
            }
            self.flush_client(key);
            if self.clients.get(key).is_some_and(client_should_close) {
                self.close_client(key);
            }
        }
    }

    fn housekeeping(&mut self) {
        let keys: Vec<usize> = self.clients.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.flush_client(key);
            if self.clients.get(key).is_some_and(client_should_close) {
                self.close_client(key);
            }
        }
    }

    fn close_client(&mut self, key: usize) {
        let Some(mut client) = self.clients.try_remove(key) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut client.stream);
        log_debug!("closed client={key}");
    }
}

fn client_should_close(client: &Client) -> bool {
    if client.closed {
        return true;
    }
    client.close_after_flush
        && client.http_responded
        && client.out_pos == client.out_buf.len()
}

/// Builds a synthetic request for one complete WebSocket message and runs
/// it on the worker pool. Returns without dispatching when no arena is
/// free (the message is dropped).
fn dispatch_message(
    link: &WsLink,
    workers: &WorkerPool,
    arenas: &Arc<ArenaManager>,
    client_key: usize,
    client_fd: i32,
    opcode: u8,
    payload: Vec<u8>,
) {
    let Some(lease) = arenas.get() else {
        log_debug!("dropping websocket message (no arenas)");
        return;
    };

    let req = Request::new(lease, 0, client_key);
    {
        let mut data = req.data.lock();
        data.env.insert("WS", "1");
        data.env.insert(
            "MESSAGE_TYPE",
            if opcode == Opcode::Binary.to_u8() {
                "binary"
            } else {
                "text"
            },
        );
        data.env.insert("OPCODE", opcode.to_string());
        data.env.insert("CLIENT_FD", client_fd.to_string());
        data.body_bytes = payload.len();
        data.body = payload;
    }
    req.flags.set(
        RequestFlags::INITIALIZED | RequestFlags::PARAMS_COMPLETE | RequestFlags::INPUT_COMPLETE,
    );

    let link = link.clone();
    // A false return means the pool is stopping; the dropped closure
    // releases the arena on its way out.
    let _ = workers.enqueue(Box::new(move || {
        let mut response = Vec::new();
        (link.ws_handler)(&req, &mut response);
        if !response.is_empty() {
            let frame = encode_frame(opcode, &response, true);
            link.queue.push(client_key, frame);
        }
        // Dropping the request releases its arena and wakes the reactors.
        drop(req);
    }));
}

/// Builds a synthetic request for a plain-HTTP exchange and runs it on the
/// worker pool. Returns false when no arena is free.
fn dispatch_http(
    link: &WsLink,
    workers: &WorkerPool,
    arenas: &Arc<ArenaManager>,
    client_key: usize,
    head: HttpHead,
    body: Vec<u8>,
) -> bool {
    let Some(lease) = arenas.get() else {
        return false;
    };

    let req = Request::new(lease, 0, client_key);
    {
        let mut data = req.data.lock();
        data.env.insert("REQUEST_METHOD", head.method.clone());
        data.env.insert("REQUEST_URI", head.target.clone());
        data.env.insert("SERVER_PROTOCOL", head.version.clone());
        if let Some((_, query)) = head.target.split_once('?') {
            data.env.insert("QUERY_STRING", query);
        }
        for (name, value) in &head.headers {
            let upper = name.to_ascii_uppercase().replace('-', "_");
            match upper.as_str() {
                "CONTENT_TYPE" => data.env.insert("CONTENT_TYPE", value.as_str()),
                "CONTENT_LENGTH" => data.env.insert("CONTENT_LENGTH", value.as_str()),
                _ => data.env.insert(format!("HTTP_{upper}"), value.as_str()),
            }
        }
        data.body_bytes = body.len();
        data.body = body;
    }
    req.flags.set(
        RequestFlags::INITIALIZED | RequestFlags::PARAMS_COMPLETE | RequestFlags::INPUT_COMPLETE,
    );

    let link = link.clone();
    workers.enqueue(Box::new(move || {
        {
            let mut data = req.data.lock();
            prepare_request_data(&link.config, &link.file_cache, &link.sessions, &mut data);
        }

        let mut response = Vec::new();
        (link.http_handler)(&req, &mut response);

        {
            let data = req.data.lock();
            if !data.session_id.is_empty() {
                link.sessions.save(&data);
            }
        }

        let bytes = if response.starts_with(b"HTTP/") {
            response
        } else {
            let content_type = req
                .data
                .lock()
                .headers
                .find("Content-Type")
                .and_then(Value::as_str)
                .map_or_else(|| link.config.default_content_type.clone(), str::to_string);
            let mut wrapped = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: {content_type}\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n",
                response.len()
            )
            .into_bytes();
            wrapped.extend_from_slice(&response);
            wrapped
        };
        link.queue.push(client_key, bytes);
        finalize_request_data(&mut req.data.lock(), &link.config);
        drop(req);
    }))
}
