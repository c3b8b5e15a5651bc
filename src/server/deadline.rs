//! Absolute deadlines over tokio's timer wheel.
//!
//! A connection carries two of these: the idle deadline between
//! requests and the request deadline from the first byte of a request
//! to its completion. Expiry cancels the awaited operation at its next
//! suspension point; buffers and sockets are released by the normal
//! drop path.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline {
    at: Instant,
}

/// The awaited operation did not finish before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Expired;

impl Deadline {
    pub(crate) fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `future` until it resolves or the deadline fires.
    pub(crate) async fn run<F>(&self, future: F) -> Result<F::Output, Expired>
    where
        F: std::future::Future,
    {
        tokio::time::timeout_at(self.at, future)
            .await
            .map_err(|_| Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let value = deadline.run(async { 41 + 1 }).await;
        assert_eq!(value, Ok(42));
        assert!(!deadline.expired());
    }

    #[tokio::test]
    async fn cancels_at_expiry() {
        tokio::time::pause();
        let deadline = Deadline::after(Duration::from_millis(50));

        let slow = deadline.run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "never"
        });
        assert_eq!(slow.await, Err(Expired));
        assert!(deadline.expired());
    }

    #[tokio::test]
    async fn deadline_is_absolute_not_sliding() {
        tokio::time::pause();
        let deadline = Deadline::after(Duration::from_millis(100));

        // Two sequential waits share the same budget.
        let first = deadline.run(tokio::time::sleep(Duration::from_millis(60))).await;
        assert!(first.is_ok());
        let second = deadline.run(tokio::time::sleep(Duration::from_millis(60))).await;
        assert_eq!(second, Err(Expired));
    }
}
