//! Per-device request queue (C5): a single-slot, unbounded-backlog FIFO
//! realized as a mutex guarding an async critical section, per the design
//! note on languages without a ready promise-queue primitive.
//!
//! Holding the lock *is* holding the queue slot: whoever acquires it runs
//! ensure-session-then-send to completion before the next caller's turn,
//! which is what guarantees handshake/login happens at most once under
//! concurrent load and that sequence numbers progress monotonically.

use tokio::sync::{Mutex, MutexGuard};

pub struct DeviceQueue<T> {
    inner: Mutex<T>,
}

impl<T> DeviceQueue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    /// Wait for the queue slot and hold it until the returned guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }
}
