//! Server bootstrap: wires configuration, arenas, workers, and both
//! reactors together, and owns the process lifecycle.
//!
//! Listeners are bound before any thread is spawned so bind/listen/poll
//! failures surface as [`StartupError`] (exit code 1) instead of dying
//! inside a reactor thread.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use wasgate_core::arena::ArenaManager;
use wasgate_core::config::GatewayConfig;
use wasgate_core::logging::{self, LogLevel};
use wasgate_core::shutdown::{self, ShutdownController};
use wasgate_core::worker::WorkerPool;
use wasgate_core::log_info;

use crate::dispatch::Handler;
use crate::fcgi_conn::FcgiEngine;
use crate::file_cache::FileCache;
use crate::session::SessionStore;
use crate::ws_conn::WsEngine;

/// Startup failure; the binary exits 1 on any of these.
#[derive(Debug)]
pub enum StartupError {
    /// FastCGI listener could not be set up.
    FcgiListener(io::Error),
    /// WebSocket listener could not be set up.
    WsListener(io::Error),
    /// A reactor thread could not be spawned.
    Thread(io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FcgiListener(e) => write!(f, "fastcgi listener: {e}"),
            Self::WsListener(e) => write!(f, "websocket listener: {e}"),
            Self::Thread(e) => write!(f, "spawning reactor thread: {e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FcgiListener(e) | Self::WsListener(e) | Self::Thread(e) => Some(e),
        }
    }
}

/// The handlers the gateway runs. All three share the same protocol-opaque
/// signature; the engines do the framing.
#[derive(Clone)]
pub struct Handlers {
    /// Runs for each completed FastCGI request.
    pub fcgi: Handler,
    /// Runs for each completed WebSocket message.
    pub ws: Handler,
    /// Runs for each plain-HTTP request on the WebSocket port.
    pub http: Handler,
}

/// Builds the shared infrastructure, spawns one thread per listener, and
/// blocks until both reactors have drained after a shutdown signal.
///
/// # Errors
///
/// [`StartupError`] when a listener cannot be bound or a thread cannot be
/// spawned; nothing has been accepted at that point.
pub fn run(config: GatewayConfig, handlers: Handlers) -> Result<(), StartupError> {
    logging::init(&config.log_destination, false);
    logging::set_global_log_level(LogLevel::from_verbosity(config.log_level));
    shutdown::install_signal_handlers();

    let config = Arc::new(config);
    let arenas = ArenaManager::new(config.max_in_flight as usize, config.arena_capacity);
    let workers = WorkerPool::new();
    workers.start(config.worker_count());

    let file_cache = Arc::new(FileCache::new(
        Duration::from_secs(config.file_cache_ttl),
        config.file_cache_max_size,
    ));
    let sessions = Arc::new(SessionStore::new(
        config.session_storage_path.clone(),
        Arc::clone(&file_cache),
    ));

    let controller = ShutdownController::new();

    let fcgi = FcgiEngine::new(
        Arc::clone(&config),
        Arc::clone(&arenas),
        Arc::clone(&workers),
        handlers.fcgi,
        controller.subscribe(),
        Arc::clone(&sessions),
        Arc::clone(&file_cache),
    )
    .map_err(StartupError::FcgiListener)?;

    let ws = WsEngine::new(
        Arc::clone(&config),
        Arc::clone(&arenas),
        Arc::clone(&workers),
        handlers.ws,
        handlers.http,
        controller.subscribe(),
        Arc::clone(&sessions),
        Arc::clone(&file_cache),
    )
    .map_err(StartupError::WsListener)?;

    log_info!(
        "wasgate starting: {} arenas x {} bytes, {} workers",
        config.max_in_flight,
        config.arena_capacity,
        config.worker_count()
    );

    let fcgi_thread = std::thread::Builder::new()
        .name("wasgate-fcgi".into())
        .spawn(move || fcgi.run())
        .map_err(StartupError::Thread)?;
    let ws_thread = std::thread::Builder::new()
        .name("wasgate-ws".into())
        .spawn(move || ws.run())
        .map_err(StartupError::Thread)?;

    let _ = fcgi_thread.join();
    let _ = ws_thread.join();

    workers.shutdown();
    log_info!("wasgate shutdown complete");
    Ok(())
}
