//! Per-request state.
//!
//! A [`Request`] is created by a reactor when a protocol-level request
//! begins (FastCGI BEGIN_REQUEST, or a complete WebSocket message), lives in
//! exactly one arena lease, and is handed to a worker for handler execution.
//!
//! Ownership handoff: the reactor builds the request, sets `worker_active`,
//! and enqueues it; the worker runs the handler and clears `worker_active`;
//! the reactor reclaims the request only when `worker_active` is false. The
//! handler-visible mutable state sits behind a mutex that is uncontended by
//! construction (exactly one side touches it at any time) while the flag
//! word and `worker_active` are atomics readable from both sides.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::arena::ArenaLease;
use crate::value::Value;

/// Atomic bitflag word describing request lifecycle state.
#[derive(Debug, Default)]
pub struct RequestFlags(AtomicU64);

impl RequestFlags {
    /// Request has been initialized.
    pub const INITIALIZED: u64 = 1 << 0;
    /// Keep the connection alive after responding.
    pub const KEEP_CONNECTION: u64 = 1 << 1;
    /// All parameters received.
    pub const PARAMS_COMPLETE: u64 = 1 << 2;
    /// All input data received.
    pub const INPUT_COMPLETE: u64 = 1 << 3;
    /// Response has been emitted.
    pub const RESPONDED: u64 = 1 << 4;
    /// Request was aborted by the peer.
    pub const ABORTED: u64 = 1 << 5;
    /// Request failed (limit or protocol failure).
    pub const FAILED: u64 = 1 << 6;

    /// Creates an empty flag word.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given bits.
    pub fn set(&self, bits: u64) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Sets the given bits and returns the previous word. Lets exactly one
    /// of several racing completers (worker, timeout, abort) win RESPONDED.
    pub fn fetch_set(&self, bits: u64) -> u64 {
        self.0.fetch_or(bits, Ordering::AcqRel)
    }

    /// Returns true when every given bit is set.
    #[must_use]
    pub fn contains(&self, bits: u64) -> bool {
        self.0.load(Ordering::Acquire) & bits == bits
    }

    /// Returns true when any of the given bits is set.
    #[must_use]
    pub fn intersects(&self, bits: u64) -> bool {
        self.0.load(Ordering::Acquire) & bits != 0
    }

    /// Snapshot of the raw flag word.
    #[must_use]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Handler-visible request state.
#[derive(Debug)]
pub struct RequestData {
    /// Environment parameters (FastCGI PARAMS, or synthetic WS/HTTP vars).
    pub env: Value,
    /// Query + form parameters.
    pub params: Value,
    /// Parsed request cookies.
    pub cookies: Value,
    /// Response headers to emit.
    pub headers: Value,
    /// Uploaded-file records.
    pub files: Value,
    /// Session data.
    pub session: Value,
    /// Endpoint context data.
    pub context: Value,
    /// Session identifier, empty until a session is started.
    pub session_id: String,
    /// Raw request body (binary-safe).
    pub body: Vec<u8>,
    /// Cumulative parameter bytes received.
    pub params_bytes: usize,
    /// Cumulative body bytes received.
    pub body_bytes: usize,
}

impl Default for RequestData {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestData {
    /// Creates empty request state: object-typed maps, an array of files,
    /// an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Value::object(),
            params: Value::object(),
            cookies: Value::object(),
            headers: Value::object(),
            files: Value::array(),
            session: Value::object(),
            context: Value::object(),
            session_id: String::new(),
            body: Vec::new(),
            params_bytes: 0,
            body_bytes: 0,
        }
    }
}

/// A single in-flight request, owned by one arena lease.
#[derive(Debug)]
pub struct Request {
    /// Protocol-assigned 16-bit id; 0 for WebSocket messages.
    pub id: u16,
    /// Reactor connection id this request belongs to.
    pub conn: usize,
    /// Lifecycle flags.
    pub flags: RequestFlags,
    /// True while a worker owns the request; the reactor never reclaims a
    /// request whose worker is active.
    pub worker_active: AtomicBool,
    /// Monotonic creation time, used by housekeeping timeouts.
    pub started: Instant,
    /// Handler-visible mutable state.
    pub data: Mutex<RequestData>,
    lease: ArenaLease,
}

impl Request {
    /// Creates a request bound to the given arena lease and connection.
    #[must_use]
    pub fn new(lease: ArenaLease, id: u16, conn: usize) -> Self {
        Self {
            id,
            conn,
            flags: RequestFlags::new(),
            worker_active: AtomicBool::new(false),
            started: Instant::now(),
            data: Mutex::new(RequestData::new()),
            lease,
        }
    }

    /// Slot index of the owning arena.
    #[must_use]
    pub fn arena_slot(&self) -> usize {
        self.lease.slot()
    }

    /// The owning arena lease.
    #[must_use]
    pub fn lease(&self) -> &ArenaLease {
        &self.lease
    }

    /// Time elapsed since the request was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// True when the request has neither responded nor failed and both
    /// streams are complete; the dispatch condition.
    #[must_use]
    pub fn ready_for_dispatch(&self) -> bool {
        let flags = self.flags.load();
        flags & (RequestFlags::PARAMS_COMPLETE | RequestFlags::INPUT_COMPLETE)
            == (RequestFlags::PARAMS_COMPLETE | RequestFlags::INPUT_COMPLETE)
            && flags & (RequestFlags::RESPONDED | RequestFlags::FAILED) == 0
    }
}
