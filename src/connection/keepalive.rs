//! Keep-alive bookkeeping: ping payloads and the pong observer.
//!
//! The ping task itself lives with the connection (it needs the write
//! serializer and the lifecycle state); this type owns what the task and
//! the receive loop share: the ping counter and the registered pong
//! observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Callback invoked with the payload of every pong the peer sends.
pub type PongObserver = Box<dyn Fn(&[u8]) + Send + Sync>;

pub(crate) struct KeepAlive {
    counter: AtomicU64,
    observer: Mutex<Option<PongObserver>>,
}

impl KeepAlive {
    pub(crate) fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            observer: Mutex::new(None),
        }
    }

    /// Payload for the next periodic ping: a monotonically increasing
    /// counter, 8 bytes big-endian.
    pub(crate) fn next_ping_payload(&self) -> [u8; 8] {
        self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes()
    }

    /// How many pings have been emitted so far.
    pub(crate) fn pings_sent(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Replace the pong observer.
    pub(crate) fn set_observer(&self, observer: PongObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    /// Deliver a pong payload to the observer, if one is registered.
    ///
    /// Called from the receive loop with exactly the payload slice of the
    /// pong frame.
    pub(crate) fn pong_received(&self, payload: &[u8]) {
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer(payload);
        }
    }
}
