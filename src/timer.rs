//! (G) Timer service (spec.md §4.G): backs `wait` commands and every
//! timeout a session waits on. A fresh [`Timer::wait`] call always
//! supersedes a still-pending one on the same `Timer` (spec.md "a new
//! wait replaces any prior pending one") and [`Timer::cancel`] is
//! idempotent, both for free from a generation counter rather than any
//! explicit cancellation bookkeeping: a sleep only fires its caller if
//! its captured generation still matches when it wakes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One timer per session (spec.md §5: "exactly one pending timer per
/// session"). Cloning shares the same generation counter, so a `Timer`
/// handed out to multiple call sites still only ever has one winner.
#[derive(Clone, Default)]
pub struct Timer {
    generation: Arc<AtomicU64>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `ms` milliseconds and reports whether it ran to
    /// completion (`true`) or was superseded/cancelled before then
    /// (`false`). `ms == 0` resolves immediately without sleeping.
    pub async fn wait(&self, ms: u32) -> bool {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
        self.generation.load(Ordering::SeqCst) == my_gen
    }

    /// Invalidates any timer currently pending on this handle. Calling
    /// this with nothing pending is a no-op, satisfying "cancel is
    /// idempotent."
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_wait_completes() {
        let t = Timer::new();
        assert!(t.wait(1).await);
    }

    #[tokio::test]
    async fn zero_wait_completes_immediately() {
        let t = Timer::new();
        assert!(t.wait(0).await);
    }

    #[tokio::test]
    async fn later_wait_supersedes_earlier_one() {
        let t = Timer::new();
        let t2 = t.clone();
        let loser = tokio::spawn(async move { t2.wait(50).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(t.wait(1).await);
        assert!(!loser.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_invalidates_pending_wait() {
        let t = Timer::new();
        let t2 = t.clone();
        let handle = tokio::spawn(async move { t2.wait(50).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        t.cancel();
        assert!(!handle.await.unwrap());
    }
}
