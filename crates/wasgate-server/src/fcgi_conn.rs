//! FastCGI connection engine.
//!
//! One single-threaded reactor owns the FastCGI listener and every
//! connection accepted from it. Records are parsed in arrival order into
//! per-request accumulators; completed requests run on the worker pool and
//! hand their framed responses back through the [`ResponseQueue`].
//!
//! Backpressure: request admission is bounded by the arena pool. When no
//! arena is free, the listener is deregistered (accept pauses) and a
//! connection whose BEGIN_REQUEST cannot be admitted stops consuming bytes
//! until a release re-drives it. Nothing is refused; everything waits.
//!
//! Housekeeping runs every 100 ms: request timeouts turn into
//! END_REQUEST(OVERLOADED), and idle connections are closed per
//! `should_close`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use wasgate_core::arena::ArenaManager;
use wasgate_core::config::GatewayConfig;
use wasgate_core::request::{Request, RequestFlags};
use wasgate_core::shutdown::ShutdownSignal;
use wasgate_core::worker::WorkerPool;
use wasgate_core::{log_debug, log_error, log_info, log_warn};
use wasgate_proto::fcgi::{
    append_end_request, append_stdout, params_pairs, BeginRequestBody, ProtocolStatus,
    RecordHeader, RecordType, HEADER_LEN, VERSION_1,
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

/// Connection state shared with worker closures.
#[derive(Debug, Default)]
pub(crate) struct ConnShared {
    closed: AtomicBool,
    active_workers: AtomicUsize,
}

impl ConnShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }
}

struct Connection {
    stream: Stream,
    token: Token,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    out_pos: usize,
    requests: HashMap<u16, Arc<Request>>,
    shared: Arc<ConnShared>,
    waiting_for_arena: bool,
    want_write: bool,
    saw_request: bool,
    // Sticky: requests are swept from the table once responded, so the
    // keep-alive ask must outlive them.
    keep_alive: bool,
}

impl Connection {
    fn new(stream: Stream, token: Token) -> Self {
        Self {
            stream,
            token,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            requests: HashMap::new(),
            shared: Arc::new(ConnShared::default()),
            waiting_for_arena: false,
            want_write: false,
            saw_request: false,
            keep_alive: false,
        }
    }
}

/// Everything a worker closure needs, cloned per dispatch.
#[derive(Clone)]
struct WorkerLink {
    config: Arc<GatewayConfig>,
    queue: Arc<ResponseQueue>,
    sessions: Arc<SessionStore>,
    file_cache: Arc<FileCache>,
    handler: Handler,
}

/// The FastCGI reactor.
pub struct FcgiEngine {
    config: Arc<GatewayConfig>,
    arenas: Arc<ArenaManager>,
    workers: Arc<WorkerPool>,
    shutdown: ShutdownSignal,
    link: WorkerLink,
    addr: ListenAddr,
    poll: Poll,
    listener: Listener,
    listener_registered: bool,
    accept_paused: bool,
    queue: Arc<ResponseQueue>,
    conns: Slab<Connection>,
    waiting: VecDeque<usize>,
    close_queue: Vec<usize>,
}

impl FcgiEngine {
    /// Binds the listener and sets up the poll, waker, and pending queue.
    ///
    /// # Errors
    ///
    /// Socket, bind, listen, and poll-creation failures; all startup-fatal.
    pub fn new(
        config: Arc<GatewayConfig>,
        arenas: Arc<ArenaManager>,
        workers: Arc<WorkerPool>,
        handler: Handler,
        shutdown: ShutdownSignal,
        sessions: Arc<SessionStore>,
        file_cache: Arc<FileCache>,
    ) -> io::Result<Self> {
        let addr = ListenAddr::from_config(config.fcgi_port, &config.fcgi_socket_path);
        let mut listener = Listener::bind(&addr, config.backlog)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let queue = ResponseQueue::new(waker);
        arenas.add_observer(queue.clone());

        let link = WorkerLink {
            config: Arc::clone(&config),
            queue: Arc::clone(&queue),
            sessions,
            file_cache,
            handler,
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
            accept_paused: false,
            queue,
            conns: Slab::new(),
            waiting: VecDeque::new(),
            close_queue: Vec::new(),
        })
    }

    /// The bound TCP port; useful with a configured port of 0.
    #[must_use]
    pub fn local_tcp_port(&self) -> Option<u16> {
        self.listener.local_tcp_port()
    }

    /// Runs the reactor until shutdown, then tears down connections and
    /// the socket file.
    pub fn run(mut self) {
        log_info!("fastcgi listening on {}", self.addr);
        let mut events = Events::with_capacity(64);
        let mut last_housekeeping = Instant::now();
        let mut draining_since: Option<Instant> = None;

        loop {
            if self.shutdown.is_shutting_down() {
                if draining_since.is_none() {
                    draining_since = Some(Instant::now());
                    self.stop_accepting();
                    log_info!("fastcgi draining, {} connections open", self.conns.len());
                }
                let budget = Duration::from_millis(self.config.graceful_shutdown_timeout_ms);
                let over_budget = draining_since.is_some_and(|t| t.elapsed() >= budget);
                if self.conns.is_empty() || over_budget || self.shutdown.is_forced() {
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

        self.teardown();
    }

    fn teardown(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key);
        }
        self.addr.cleanup();
        log_info!("fastcgi listener stopped");
    }

    // ------------------------------------------------------------------
    // Accept path
    // ------------------------------------------------------------------

    fn accept_ready(&mut self) {
        if self.arenas.available() == 0 {
            self.pause_accept();
            return;
        }
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    let entry = self.conns.vacant_entry();
                    let key = entry.key();
                    let token = Token(key + TOKEN_BASE);
                    let mut conn = Connection::new(stream, token);
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut conn.stream, token, Interest::READABLE)
                    {
                        log_error!("register accepted connection: {e}");
                        continue;
                    }
                    entry.insert(conn);
                    log_debug!("accepted conn={key}");
                    if self.arenas.available() == 0 {
                        self.pause_accept();
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log_error!("accept: {e}");
                    return;
                }
            }
        }
    }

    fn pause_accept(&mut self) {
        if self.accept_paused {
            return;
        }
        if self.listener_registered {
            match self.poll.registry().deregister(&mut self.listener) {
                Ok(()) => self.listener_registered = false,
                Err(e) => log_error!("deregister listener: {e}"),
            }
        }
        self.accept_paused = true;
        log_debug!("paused accept (no arenas)");
    }

    fn resume_accept(&mut self) {
        if !self.accept_paused || self.shutdown.is_shutting_down() {
            return;
        }
        if !self.listener_registered {
            match self.poll.registry().register(
                &mut self.listener,
                LISTENER_TOKEN,
                Interest::READABLE,
            ) {
                Ok(()) => self.listener_registered = true,
                Err(e) => {
                    log_error!("re-register listener: {e}");
                    return;
                }
            }
        }
        self.accept_paused = false;
        log_debug!("resumed accept");
        // Connections that queued while we were deregistered do not
        // re-trigger an edge; drain them now.
        self.accept_ready();
    }

    fn stop_accepting(&mut self) {
        if self.listener_registered {
            let _ = self.poll.registry().deregister(&mut self.listener);
            self.listener_registered = false;
        }
    }

    // ------------------------------------------------------------------
    // I/O path
    // ------------------------------------------------------------------

    fn handle_io(&mut self, key: usize, readable: bool, writable: bool, errored: bool) {
        let was_waiting;
        {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            was_waiting = conn.waiting_for_arena;
            if errored {
                conn.shared.set_closed();
            }
            if readable {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match conn.stream.read(&mut chunk) {
                        Ok(0) => {
                            conn.shared.set_closed();
                            break;
                        }
                        Ok(n) => conn.in_buf.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log_error!("recv conn={key}: {e}");
                            conn.shared.set_closed();
                            break;
                        }
                    }
                }
            }
        }

        if readable {
            self.process_records(key);
            let now_waiting = self.conns.get(key).is_some_and(|c| c.waiting_for_arena);
            if !was_waiting && now_waiting {
                self.waiting.push_back(key);
            }
            self.flush_connection(key);
        }
        if writable {
            self.flush_connection(key);
        }

        self.sweep_requests(key);
        if let Some(conn) = self.conns.get(key) {
            if should_close(conn) {
                self.close_queue.push(key);
            }
        }
        self.process_close_queue();
    }

    /// Parses as many complete records as the in-buffer holds, building and
    /// dispatching requests. Stops (leaving bytes buffered) when a
    /// BEGIN_REQUEST cannot get an arena.
    fn process_records(&mut self, key: usize) {
        let link = self.link.clone();
        let arenas = Arc::clone(&self.arenas);
        let workers = Arc::clone(&self.workers);
        let max_in_flight = self.config.max_in_flight as usize;
        let max_params = self.config.max_params_bytes;
        let max_stdin = self.config.max_stdin_bytes;

        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.shared.is_closed() {
            return;
        }
        conn.waiting_for_arena = false;

        let mut offset = 0;
        loop {
            let Some(header) = RecordHeader::parse(&conn.in_buf[offset..]) else {
                break;
            };
            if header.version != VERSION_1 {
                log_debug!("bad fastcgi version {} on conn={key}", header.version);
                conn.shared.set_closed();
                break;
            }
            let total = header.total_len();
            if conn.in_buf.len() - offset < total {
                break;
            }
            let id = header.request_id;
            let content_start = offset + HEADER_LEN;
            let content_end = content_start + header.content_length as usize;

            let mut touched: Option<Arc<Request>> = None;
            match RecordType::from_u8(header.rtype) {
                Some(RecordType::BeginRequest) => {
                    if let Some(body) =
                        BeginRequestBody::parse(&conn.in_buf[content_start..content_end])
                    {
                        if body.keep_conn() {
                            conn.keep_alive = true;
                        }
                        if let Some(existing) = conn.requests.get(&id) {
                            if body.keep_conn() {
                                existing.flags.set(RequestFlags::KEEP_CONNECTION);
                            }
                            touched = Some(Arc::clone(existing));
                        } else if conn.requests.len() >= max_in_flight {
                            log_warn!("conn={key} exceeded max in-flight; record ignored");
                        } else {
                            match arenas.get() {
                                None => {
                                    // Leave the record buffered; the release
                                    // observer re-drives this connection.
                                    conn.waiting_for_arena = true;
                                    break;
                                }
                                Some(lease) => {
                                    let req = Arc::new(Request::new(lease, id, key));
                                    let mut flags = RequestFlags::INITIALIZED;
                                    if body.keep_conn() {
                                        flags |= RequestFlags::KEEP_CONNECTION;
                                    }
                                    req.flags.set(flags);
                                    conn.saw_request = true;
                                    conn.requests.insert(id, Arc::clone(&req));
                                    touched = Some(req);
                                }
                            }
                        }
                    }
                }
                Some(RecordType::Params) => {
                    if let Some(req) = conn.requests.get(&id) {
                        touched = Some(Arc::clone(req));
                        if header.content_length == 0 {
                            req.flags.set(RequestFlags::PARAMS_COMPLETE);
                        } else if !req.flags.intersects(RequestFlags::FAILED) {
                            let mut data = req.data.lock();
                            for (name, value) in
                                params_pairs(&conn.in_buf[content_start..content_end])
                            {
                                let pair_bytes = name.len() + value.len();
                                if data.params_bytes + pair_bytes > max_params {
                                    fail_request(req, &mut conn.out_buf, ProtocolStatus::Overloaded);
                                    break;
                                }
                                data.env.insert(
                                    String::from_utf8_lossy(name).into_owned(),
                                    String::from_utf8_lossy(value).into_owned(),
                                );
                                data.params_bytes += pair_bytes;
                            }
                        }
                    }
                }
                Some(RecordType::Stdin) => {
                    if let Some(req) = conn.requests.get(&id) {
                        touched = Some(Arc::clone(req));
                        if header.content_length == 0 {
                            req.flags.set(RequestFlags::INPUT_COMPLETE);
                        } else if !req.flags.intersects(RequestFlags::FAILED) {
                            let mut data = req.data.lock();
                            let content = &conn.in_buf[content_start..content_end];
                            if data.body_bytes + content.len() > max_stdin {
                                fail_request(req, &mut conn.out_buf, ProtocolStatus::Overloaded);
                            } else {
                                data.body.extend_from_slice(content);
                                data.body_bytes += content.len();
                            }
                        }
                    }
                }
                Some(RecordType::AbortRequest) => {
                    if let Some(req) = conn.requests.get(&id) {
                        touched = Some(Arc::clone(req));
                        req.flags.set(RequestFlags::ABORTED);
                        fail_request(req, &mut conn.out_buf, ProtocolStatus::RequestComplete);
                    }
                }
                // Unknown and outbound-only record types are consumed and
                // ignored.
                _ => {}
            }

            offset += total;

            if let Some(req) = touched {
                if req.ready_for_dispatch() && !req.worker_active.load(Ordering::Acquire) {
                    dispatch(&link, &workers, &conn.shared, &req);
                }
            }
        }

        if offset > 0 {
            conn.in_buf.drain(..offset);
        }
    }

    /// Drains the out-buffer with edge-triggered semantics: send until
    /// empty (drop write interest), `WouldBlock` (keep the cursor, arm
    /// write interest), or error (mark closed).
    fn flush_connection(&mut self, key: usize) {
        let registry = self.poll.registry();
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        loop {
            let remaining = conn.out_buf.len() - conn.out_pos;
            if remaining == 0 {
                if conn.out_pos != 0 {
                    conn.out_buf.clear();
                    conn.out_pos = 0;
                }
                if conn.want_write
                    && registry
                        .reregister(&mut conn.stream, conn.token, Interest::READABLE)
                        .is_ok()
                {
                    conn.want_write = false;
                }
                break;
            }
            match conn.stream.write(&conn.out_buf[conn.out_pos..]) {
                Ok(0) => {
                    conn.shared.set_closed();
                    break;
                }
                Ok(n) => conn.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !conn.want_write
                        && registry
                            .reregister(
                                &mut conn.stream,
                                conn.token,
                                Interest::READABLE | Interest::WRITABLE,
                            )
                            .is_ok()
                    {
                        conn.want_write = true;
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_error!("send conn={key}: {e}");
                    conn.shared.set_closed();
                    break;
                }
            }
        }
        if should_close(conn) {
            self.close_queue.push(key);
        }
    }

    // ------------------------------------------------------------------
    // Worker hand-back
    // ------------------------------------------------------------------

    fn waker_ready(&mut self) {
        for pending in self.queue.drain() {
            let key = pending.conn;
            if pending.bytes.is_empty() {
                continue;
            }
            {
                let Some(conn) = self.conns.get_mut(key) else {
                    continue;
                };
                if conn.shared.is_closed() {
                    continue;
                }
                let was_empty = conn.out_pos == conn.out_buf.len();
                if was_empty && conn.out_buf.capacity() == 0 {
                    conn.out_buf.reserve(self.config.output_buffer_initial);
                }
                conn.out_buf.extend_from_slice(&pending.bytes);
            }
            self.flush_connection(key);
        }

        // Worker completions and arena releases wake us without bytes:
        // sweep reclaimable requests, resume accept, re-drive stalls.
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.sweep_requests(key);
            if let Some(conn) = self.conns.get(key) {
                if should_close(conn) {
                    self.close_queue.push(key);
                }
            }
        }
        self.process_close_queue();

        if self.accept_paused && self.arenas.available() > 0 {
            self.resume_accept();
        }
        self.process_waiting_connections();
    }

    /// Re-drives connections that stalled on arena exhaustion, bounded by
    /// the number of arenas currently free.
    fn process_waiting_connections(&mut self) {
        let mut budget = self.arenas.available();
        if budget == 0 || self.waiting.is_empty() {
            return;
        }
        let rounds = self.waiting.len();
        for _ in 0..rounds {
            if budget == 0 {
                break;
            }
            let Some(key) = self.waiting.pop_front() else {
                break;
            };
            let Some(conn) = self.conns.get(key) else {
                continue;
            };
            if conn.shared.is_closed() {
                continue;
            }
            let was_waiting = conn.waiting_for_arena;
            self.process_records(key);
            let still_waiting = self.conns.get(key).is_some_and(|c| c.waiting_for_arena);
            if was_waiting && !still_waiting {
                budget = budget.saturating_sub(1);
                self.flush_connection(key);
            } else if still_waiting {
                self.waiting.push_back(key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping and reclamation
    // ------------------------------------------------------------------

    fn housekeeping(&mut self) {
        let timeout_secs = self.config.max_request_time;
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            if timeout_secs > 0 {
                let limit = Duration::from_secs(timeout_secs);
                if let Some(conn) = self.conns.get_mut(key) {
                    for req in conn.requests.values() {
                        if !req.flags.intersects(RequestFlags::RESPONDED) && req.elapsed() > limit
                        {
                            let prev = req
                                .flags
                                .fetch_set(RequestFlags::RESPONDED | RequestFlags::FAILED);
                            if prev & RequestFlags::RESPONDED == 0 {
                                log_warn!(
                                    "request id={} conn={key} timed out after {}s",
                                    req.id,
                                    timeout_secs
                                );
                                append_end_request(
                                    &mut conn.out_buf,
                                    req.id,
                                    0,
                                    ProtocolStatus::Overloaded,
                                );
                            }
                        }
                    }
                }
            }
            self.flush_connection(key);
            self.sweep_requests(key);
            if let Some(conn) = self.conns.get(key) {
                if should_close(conn) {
                    self.close_queue.push(key);
                }
            }
        }
        self.process_close_queue();

        if self.accept_paused && self.arenas.available() > 0 {
            self.resume_accept();
        }
    }

    /// Reclaims requests whose worker is inactive: finalize + release for
    /// RESPONDED, release without finalize for FAILED/ABORTED leftovers.
    fn sweep_requests(&mut self, key: usize) {
        let config = Arc::clone(&self.config);
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let mut reclaim: Vec<(u16, bool)> = Vec::new();
        for (id, req) in &conn.requests {
            if req.worker_active.load(Ordering::Acquire) {
                continue;
            }
            let flags = req.flags.load();
            if flags & RequestFlags::RESPONDED != 0 {
                reclaim.push((*id, true));
            } else if flags & (RequestFlags::FAILED | RequestFlags::ABORTED) != 0 {
                reclaim.push((*id, false));
            }
        }
        for (id, finalize) in reclaim {
            if let Some(req) = conn.requests.remove(&id) {
                if finalize {
                    finalize_request_data(&mut req.data.lock(), &config);
                }
                // The arena lease is released when the last Arc drops.
                drop(req);
            }
        }
    }

    fn process_close_queue(&mut self) {
        if self.close_queue.is_empty() {
            return;
        }
        let local = std::mem::take(&mut self.close_queue);
        for key in local {
            let Some(conn) = self.conns.get(key) else {
                continue;
            };
            if should_close(conn) {
                self.close_connection(key);
            }
        }
    }

    fn close_connection(&mut self, key: usize) {
        let config = Arc::clone(&self.config);
        let Some(mut conn) = self.conns.try_remove(key) else {
            return;
        };
        for (_, req) in conn.requests.drain() {
            if !req.flags.intersects(RequestFlags::RESPONDED) {
                finalize_request_data(&mut req.data.lock(), &config);
            }
        }
        let _ = self.poll.registry().deregister(&mut conn.stream);
        log_debug!("closed conn={key}");
    }
}

/// Marks the request failed and emits END_REQUEST once. The `fetch_set`
/// guarantees a single responder when worker, timeout, and abort race.
fn fail_request(req: &Request, out_buf: &mut Vec<u8>, status: ProtocolStatus) {
    let prev = req
        .flags
        .fetch_set(RequestFlags::RESPONDED | RequestFlags::FAILED);
    if prev & RequestFlags::RESPONDED == 0 {
        append_end_request(out_buf, req.id, 0, status);
    }
}

/// A connection is reclaimable when it is marked closed with no active
/// workers and nothing left to send, or when every request it ever saw has
/// responded, none asked to keep the connection, and both buffers are
/// drained.
fn should_close(conn: &Connection) -> bool {
    let out_empty = conn.out_pos == conn.out_buf.len();
    if conn.shared.is_closed() {
        return conn.shared.workers() == 0 && out_empty;
    }
    if !conn.saw_request || conn.keep_alive || conn.waiting_for_arena || !conn.in_buf.is_empty() {
        return false;
    }
    for req in conn.requests.values() {
        if req.flags.load() & RequestFlags::RESPONDED == 0 {
            return false;
        }
    }
    out_empty && conn.shared.workers() == 0
}

/// Hands a ready request to the worker pool.
fn dispatch(link: &WorkerLink, workers: &WorkerPool, shared: &Arc<ConnShared>, req: &Arc<Request>) {
    shared.active_workers.fetch_add(1, Ordering::AcqRel);
    req.worker_active.store(true, Ordering::Release);

    let link = link.clone();
    let shared_task = Arc::clone(shared);
    let req_task = Arc::clone(req);
    let queued = workers.enqueue(Box::new(move || {
        run_fcgi_request(&link, &shared_task, &req_task);
        req_task.worker_active.store(false, Ordering::Release);
        shared_task.active_workers.fetch_sub(1, Ordering::AcqRel);
        // Wake the reactor even when no bytes were published so it can
        // sweep the request promptly.
        link.queue.wake();
    }));

    if !queued {
        req.worker_active.store(false, Ordering::Release);
        shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The worker side of a FastCGI request: pre-handler parsing, the user
/// handler, response framing, and publication.
fn run_fcgi_request(link: &WorkerLink, shared: &ConnShared, req: &Request) {
    if req.flags.intersects(RequestFlags::RESPONDED) || shared.is_closed() {
        return;
    }

    {
        let mut data = req.data.lock();
        prepare_request_data(&link.config, &link.file_cache, &link.sessions, &mut data);
    }

    let mut body_out = Vec::with_capacity(1024);
    (link.handler)(req, &mut body_out);

    // Exactly one completer wins; a raced timeout or abort already sent
    // END_REQUEST, so late output is discarded.
    let prev = req.flags.fetch_set(RequestFlags::RESPONDED);
    if prev & RequestFlags::RESPONDED != 0 {
        return;
    }

    {
        let data = req.data.lock();
        if !data.session_id.is_empty() {
            link.sessions.save(&data);
        }
    }

    let mut records = Vec::with_capacity(body_out.len() + 64);
    append_stdout(&mut records, req.id, &body_out);
    append_end_request(&mut records, req.id, 0, ProtocolStatus::RequestComplete);
    link.queue.push(req.conn, records);
}
