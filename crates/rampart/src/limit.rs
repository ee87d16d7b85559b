//! Connection admission limiting.
//!
//! A [`ConnectionLimit`] caps the number of accepted-but-unclosed
//! connections. Each accepted stream owns a [`ConnectionPermit`]; dropping
//! the stream returns the slot. Waiters queue in FIFO order (tokio's
//! semaphore is fair), so a bounded connection lifetime guarantees every
//! waiter is eventually admitted.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound on concurrently accepted, unclosed connections.
///
/// Cloning shares the same permit pool.
#[derive(Clone, Debug)]
pub struct ConnectionLimit {
    permits: Arc<Semaphore>,
    max: usize,
}

/// One admission slot, held for the lifetime of an accepted connection.
///
/// Dropping the permit releases the slot exactly once, from whichever task
/// owns it at the time.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLimit {
    /// Create a limit of `max` simultaneous connections.
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// The configured maximum.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of admission slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait (FIFO order) for a free slot and take its permit.
    ///
    /// Returns `None` once the limit has been closed.
    pub async fn acquire(&self) -> Option<ConnectionPermit> {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => Some(ConnectionPermit { _permit: permit }),
            Err(_) => None,
        }
    }

    /// Close the limit: all blocked and future [`acquire`](Self::acquire)
    /// calls return `None`. Idempotent.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
