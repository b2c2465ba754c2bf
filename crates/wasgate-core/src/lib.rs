//! Core types for the wasgate gateway.
//!
//! This crate holds everything the protocol engines share but that is not
//! itself wire-format code: the dynamic [`Value`] container, gateway
//! [`config`], structured [`logging`], the bounded [`arena`] pool that
//! backpressures request admission, per-request state, the [`worker`] pool,
//! and [`shutdown`] coordination.

pub mod arena;
pub mod config;
pub mod logging;
pub mod request;
pub mod shutdown;
pub mod value;
pub mod worker;

pub use arena::{Arena, ArenaLease, ArenaManager, ArenaSpan, ReleaseObserver};
pub use config::{ArgsError, GatewayConfig};
pub use logging::{LogEntry, LogLevel};
pub use request::{Request, RequestData, RequestFlags};
pub use shutdown::{ShutdownController, ShutdownSignal, install_signal_handlers};
pub use value::Value;
pub use worker::{Task, WorkerPool};
