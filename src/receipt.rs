//! Correlation of receipt-bearing frames with RECEIPT replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::error::StompError;

type Completion = oneshot::Sender<Result<(), StompError>>;

/// A receipt waiting for its RECEIPT frame.
#[derive(Debug)]
struct PendingReceipt {
    created: Instant,
    completion: Completion,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<String, PendingReceipt>,
    /// Set once the connection leaves `Connected`; later `expect` calls fail
    /// immediately with this error.
    closed: Option<StompError>,
}

/// Handle returned by [`ReceiptTracker::expect`]; pass it to
/// [`ReceiptTracker::wait`].
#[derive(Debug)]
pub struct ReceiptWaiter {
    id: String,
    rx: oneshot::Receiver<Result<(), StompError>>,
}

impl ReceiptWaiter {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Tracks outstanding receipts for one connection.
#[derive(Debug, Default)]
pub struct ReceiptTracker {
    inner: Mutex<Inner>,
    counter: AtomicU64,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a receipt id unique within this tracker.
    pub fn next_id(&self) -> String {
        format!("rcpt-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Register `receipt_id` before the frame carrying it is written.
    pub async fn expect(&self, receipt_id: &str) -> Result<ReceiptWaiter, StompError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.pending.contains_key(receipt_id) {
            return Err(StompError::Protocol(format!(
                "receipt id '{}' is already pending",
                receipt_id
            )));
        }
        inner.pending.insert(
            receipt_id.to_string(),
            PendingReceipt {
                created: Instant::now(),
                completion: tx,
            },
        );
        Ok(ReceiptWaiter {
            id: receipt_id.to_string(),
            rx,
        })
    }

    /// Wait until the receipt resolves, fails, or `timeout` elapses.
    ///
    /// On timeout the entry is discarded, so a late RECEIPT is reported as
    /// unknown rather than resolving anything.
    pub async fn wait(&self, waiter: ReceiptWaiter, timeout: Duration) -> Result<(), StompError> {
        let ReceiptWaiter { id, rx } = waiter;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StompError::ConnectionClosed),
            Err(_) => {
                self.inner.lock().await.pending.remove(&id);
                Err(StompError::ReceiptTimeout(id))
            }
        }
    }

    /// Complete the receipt named by a RECEIPT frame.
    ///
    /// An unknown id is a protocol error for the caller to report; it does
    /// not affect the connection.
    pub async fn resolve(&self, receipt_id: &str) -> Result<Duration, StompError> {
        let entry = self.inner.lock().await.pending.remove(receipt_id);
        match entry {
            Some(pending) => {
                let _ = pending.completion.send(Ok(()));
                Ok(pending.created.elapsed())
            }
            None => Err(StompError::Protocol(format!(
                "RECEIPT for unknown receipt-id '{}'",
                receipt_id
            ))),
        }
    }

    /// Fail one pending receipt, e.g. when an ERROR frame names it.
    pub async fn fail(&self, receipt_id: &str, err: StompError) -> bool {
        match self.inner.lock().await.pending.remove(receipt_id) {
            Some(pending) => {
                let _ = pending.completion.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every pending receipt and refuse new ones.
    pub async fn fail_all(&self, err: StompError) {
        let mut inner = self.inner.lock().await;
        for (_, pending) in inner.pending.drain() {
            let _ = pending.completion.send(Err(err.clone()));
        }
        inner.closed = Some(err);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_unique() {
        let tracker = ReceiptTracker::new();
        assert_ne!(tracker.next_id(), tracker.next_id());
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_rejected() {
        let tracker = ReceiptTracker::new();
        let _w = tracker.expect("r1").await.unwrap();
        assert!(matches!(
            tracker.expect("r1").await,
            Err(StompError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn expect_after_fail_all_fails_fast() {
        let tracker = ReceiptTracker::new();
        tracker.fail_all(StompError::ConnectionClosed).await;
        assert!(matches!(
            tracker.expect("r1").await,
            Err(StompError::ConnectionClosed)
        ));
    }
}
