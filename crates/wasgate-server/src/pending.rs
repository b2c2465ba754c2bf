//! Worker-to-reactor response hand-back.
//!
//! Workers never touch connection out-buffers. They publish finished
//! response bytes here under a short mutex, then wake the reactor through
//! its `mio::Waker` (the notification descriptor; on Linux an eventfd with
//! write-accumulate / read-drain semantics). The reactor empties the list
//! atomically by swap, so per-connection ordering of deposits is preserved;
//! no ordering across connections is guaranteed.
//!
//! The queue doubles as the arena-release observer: a release wakes the
//! reactor so it can resume a paused accept loop and re-drive connections
//! stalled on exhaustion.

use std::sync::Arc;

use mio::Waker;
use parking_lot::Mutex;
use wasgate_core::ReleaseObserver;

/// Response bytes bound for one connection's out-buffer.
#[derive(Debug)]
pub struct PendingResponse {
    /// Reactor connection id (slab key). Connection ids are stable while a
    /// worker holds one, unlike raw fds which the kernel reuses.
    pub conn: usize,
    /// Encoded response bytes, ready for the out-buffer.
    pub bytes: Vec<u8>,
}

/// Mutex-guarded pending list plus the reactor's waker.
pub struct ResponseQueue {
    pending: Mutex<Vec<PendingResponse>>,
    waker: Waker,
}

impl ResponseQueue {
    /// Wraps a reactor's waker.
    #[must_use]
    pub fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            waker,
        })
    }

    /// Publishes response bytes for a connection and wakes the reactor.
    pub fn push(&self, conn: usize, bytes: Vec<u8>) {
        self.pending.lock().push(PendingResponse { conn, bytes });
        self.wake();
    }

    /// Takes the whole pending list in one swap.
    #[must_use]
    pub fn drain(&self) -> Vec<PendingResponse> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Wakes the reactor without publishing anything; used after worker
    /// completion so the reactor sweeps reclaimable requests promptly.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            wasgate_core::log_error!("waker: {e}");
        }
    }
}

impl ReleaseObserver for ResponseQueue {
    fn arena_released(&self) {
        self.wake();
    }
}

impl std::fmt::Debug for ResponseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseQueue")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    #[test]
    fn push_preserves_order_and_drain_swaps() {
        let poll = Poll::new().expect("poll");
        let waker = Waker::new(poll.registry(), Token(0)).expect("waker");
        let queue = ResponseQueue::new(waker);

        queue.push(1, vec![1]);
        queue.push(2, vec![2]);
        queue.push(1, vec![3]);

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].conn, 1);
        assert_eq!(drained[1].conn, 2);
        assert_eq!(drained[2].conn, 1);
        assert_eq!(drained[2].bytes, vec![3]);

        assert!(queue.drain().is_empty());
    }

    #[test]
    fn push_wakes_the_poll() {
        let mut poll = Poll::new().expect("poll");
        let waker = Waker::new(poll.registry(), Token(9)).expect("waker");
        let queue = ResponseQueue::new(waker);

        queue.push(0, vec![42]);

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(2))).expect("poll");
        let tokens: Vec<_> = events.iter().map(mio::event::Event::token).collect();
        assert!(tokens.contains(&Token(9)));
    }

    #[test]
    fn release_observer_wakes_the_poll() {
        let mut poll = Poll::new().expect("poll");
        let waker = Waker::new(poll.registry(), Token(3)).expect("waker");
        let queue = ResponseQueue::new(waker);

        let manager = wasgate_core::ArenaManager::new(1, 64);
        manager.add_observer(queue.clone());
        drop(manager.get().expect("lease"));

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(2))).expect("poll");
        assert!(events.iter().any(|e| e.token() == Token(3)));
    }
}
