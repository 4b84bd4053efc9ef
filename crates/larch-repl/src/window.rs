//! Credit-based flow control between a broker and its relay.
//!
//! Each session carries a fixed window W. The sender holds a pool of W
//! credits and consumes one per update; the receiver counts locally
//! *replayed* (not merely received) updates and returns credits in batches
//! of W/2. A sender starved of credit for longer than the probe interval
//! emits a window probe, recovering from a lost window-update message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ReplError;

/// Flow-control configuration for one session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum unacknowledged updates in flight.
    pub size: usize,
    /// How long a sender waits for credit before emitting a probe.
    pub probe_after_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 100,
            probe_after_ms: 500,
        }
    }
}

/// Outcome of a bounded credit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A credit was consumed; the caller may send one update.
    Granted,
    /// No credit arrived within the probe interval; the caller should send
    /// a window probe and try again.
    Starved,
}

/// Sender half: the credit pool.
#[derive(Debug, Clone)]
pub struct SendWindow {
    size: usize,
    credits: Arc<Semaphore>,
}

impl SendWindow {
    /// A full pool of `size` credits.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            credits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Consume one credit without waiting. Returns false when empty.
    pub fn try_acquire(&self) -> bool {
        match self.credits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Consume one credit, waiting at most `probe_after` for one to return.
    pub async fn acquire(&self, probe_after: Duration) -> Result<AcquireOutcome, ReplError> {
        match tokio::time::timeout(probe_after, self.credits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(AcquireOutcome::Granted)
            }
            Ok(Err(_)) => Err(ReplError::Shutdown),
            Err(_) => Ok(AcquireOutcome::Starved),
        }
    }

    /// Return `n` credits (a received window update).
    pub fn release(&self, n: usize) {
        self.credits.add_permits(n);
    }

    /// Credits currently available.
    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }

    /// The configured window size.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Receiver half: counts replayed updates and decides when to return
/// credit.
#[derive(Debug)]
pub struct ReceiveWindow {
    size: usize,
    owed: AtomicUsize,
}

impl ReceiveWindow {
    /// Receiver side for a window of `size`.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            owed: AtomicUsize::new(0),
        }
    }

    /// Record one locally replayed update. Returns `Some(credits)` when a
    /// window update is due (every W/2 replays).
    pub fn on_replayed(&self) -> Option<usize> {
        let owed = self.owed.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = (self.size / 2).max(1);
        if owed >= threshold {
            self.owed.fetch_sub(owed, Ordering::Relaxed);
            Some(owed)
        } else {
            None
        }
    }

    /// Credits accumulated but not yet returned.
    pub fn owed(&self) -> usize {
        self.owed.load(Ordering::Relaxed)
    }

    /// Take every accumulated credit (the response to a window probe).
    pub fn drain(&self) -> usize {
        self.owed.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_bounds_in_flight() {
        let window = SendWindow::new(10);
        for _ in 0..10 {
            assert!(window.try_acquire());
        }
        assert!(!window.try_acquire());
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn release_restores_credit() {
        let window = SendWindow::new(2);
        assert!(window.try_acquire());
        assert!(window.try_acquire());
        assert!(!window.try_acquire());
        window.release(1);
        assert!(window.try_acquire());
    }

    #[tokio::test]
    async fn acquire_starves_without_credit() {
        let window = SendWindow::new(1);
        assert!(window.try_acquire());
        let outcome = window.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Starved);
    }

    #[tokio::test]
    async fn acquire_resumes_when_credit_returns() {
        let window = SendWindow::new(1);
        assert!(window.try_acquire());
        let w2 = window.clone();
        let waiter = tokio::spawn(async move {
            w2.acquire(Duration::from_secs(5)).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.release(1);
        assert_eq!(waiter.await.unwrap(), AcquireOutcome::Granted);
    }

    #[test]
    fn receive_window_returns_credit_at_half() {
        let window = ReceiveWindow::new(10);
        for _ in 0..4 {
            assert_eq!(window.on_replayed(), None);
        }
        assert_eq!(window.on_replayed(), Some(5));
        assert_eq!(window.owed(), 0);
    }

    #[test]
    fn receive_window_drain_answers_probe() {
        let window = ReceiveWindow::new(10);
        window.on_replayed();
        window.on_replayed();
        assert_eq!(window.drain(), 2);
        assert_eq!(window.drain(), 0);
    }

    #[test]
    fn tiny_window_still_returns_credit() {
        let window = ReceiveWindow::new(1);
        assert_eq!(window.on_replayed(), Some(1));
    }
}
