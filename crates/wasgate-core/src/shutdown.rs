//! Shutdown coordination.
//!
//! A [`ShutdownController`] owns the process stop state; reactors hold
//! [`ShutdownSignal`] handles and poll them from their loop condition.
//!
//! Two levels exist: *graceful* (stop accepting, drain in-flight work
//! within the configured budget) and *forced* (exit the loops as soon as
//! possible). Requesting shutdown twice escalates to forced, so a second
//! Ctrl-C behaves the way operators expect.
//!
//! Signal wiring installs a handler for SIGINT/SIGTERM that only flips
//! process-global atomics; the signal handles observe those in addition to
//! their controller's local flags.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGNAL_STOP: AtomicBool = AtomicBool::new(false);
static SIGNAL_FORCED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    // Async-signal-safe: atomic stores only. First signal requests a
    // graceful stop, the second escalates to forced.
    if SIGNAL_STOP.swap(true, Ordering::SeqCst) {
        SIGNAL_FORCED.store(true, Ordering::SeqCst);
    }
}

/// Installs the SIGINT/SIGTERM handler. Safe to call more than once.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[derive(Debug, Default)]
struct ShutdownState {
    stop: AtomicBool,
    forced: AtomicBool,
}

/// Controller for initiating shutdown programmatically.
#[derive(Clone, Debug)]
pub struct ShutdownController {
    state: Arc<ShutdownState>,
}

impl ShutdownController {
    /// Creates a controller in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(ShutdownState::default()),
        }
    }

    /// Creates a signal handle for a reactor.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Requests shutdown. The first call is graceful; a second call
    /// escalates to forced.
    pub fn shutdown(&self) {
        if self.state.stop.swap(true, Ordering::SeqCst) {
            self.state.forced.store(true, Ordering::SeqCst);
        }
    }

    /// Requests immediate shutdown with no drain.
    pub fn force_shutdown(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.forced.store(true, Ordering::SeqCst);
    }

    /// True once shutdown has been requested (controller or signal).
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst) || SIGNAL_STOP.load(Ordering::SeqCst)
    }

    /// True once forced shutdown has been requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.state.forced.load(Ordering::SeqCst) || SIGNAL_FORCED.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only shutdown view held by reactors.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    state: Arc<ShutdownState>,
}

impl ShutdownSignal {
    /// True once shutdown has been requested (controller or signal).
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst) || SIGNAL_STOP.load(Ordering::SeqCst)
    }

    /// True once forced shutdown has been requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.state.forced.load(Ordering::SeqCst) || SIGNAL_FORCED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_starts_running() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutting_down());
        assert!(!controller.is_forced());
    }

    #[test]
    fn first_shutdown_is_graceful() {
        let controller = ShutdownController::new();
        controller.shutdown();
        assert!(controller.is_shutting_down());
        assert!(!controller.is_forced());
    }

    #[test]
    fn second_shutdown_escalates() {
        let controller = ShutdownController::new();
        controller.shutdown();
        controller.shutdown();
        assert!(controller.is_forced());
    }

    #[test]
    fn force_shutdown_sets_both() {
        let controller = ShutdownController::new();
        controller.force_shutdown();
        assert!(controller.is_shutting_down());
        assert!(controller.is_forced());
    }

    #[test]
    fn signal_handle_sees_controller_state() {
        let controller = ShutdownController::new();
        let signal = controller.subscribe();
        assert!(!signal.is_shutting_down());
        controller.shutdown();
        assert!(signal.is_shutting_down());
    }
}
