use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Single-slot "latest value" channel. A new value overwrites any unconsumed
/// predecessor; there is no queue and no backpressure.
pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store `value`, returning true if an unconsumed value was dropped.
    pub fn put(&self, value: T) -> bool {
        let replaced = self.value.lock().replace(value).is_some();
        self.ready.notify_one();
        replaced
    }

    /// Non-blocking take.
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Take, waiting at most `timeout` for a value to arrive.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.value.lock();
        if guard.is_none() {
            self.ready.wait_for(&mut guard, timeout);
        }
        guard.take()
    }

    /// Wake any waiter without storing a value (used on shutdown).
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
