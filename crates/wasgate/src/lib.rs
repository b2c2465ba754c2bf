//! wasgate: dual-protocol FastCGI/WebSocket application gateway.
//!
//! This umbrella crate re-exports the public API of the workspace:
//!
//! - [`wasgate_core`]: dynamic values, configuration, logging, the arena
//!   pool, request state, the worker pool, shutdown coordination.
//! - [`wasgate_proto`]: FastCGI and WebSocket codecs, HTTP head parsing,
//!   body parsers.
//! - [`wasgate_server`]: the reactors and the bootstrap.
//!
//! The `wasgate` binary wires a demo dump handler to both listeners; see
//! `main.rs` and `handler.rs`.

pub use wasgate_core::{
    ArenaLease, ArenaManager, GatewayConfig, LogLevel, Request, RequestData, RequestFlags,
    ShutdownController, Value, WorkerPool,
};
pub use wasgate_proto::{body, fcgi, http, ws};
pub use wasgate_server::{
    run, FcgiEngine, FileCache, Handler, Handlers, ListenAddr, SessionStore, StartupError,
    WsEngine,
};

pub mod handler;
