//! Single-flight token refresh.
//!
//! At most one refresh runs per refresh token. Concurrent 401 handlers
//! holding the same token join the in-flight task through a [`Shared`]
//! future, while a context holding another token never sees it. The task
//! itself is spawned,
//! so a waiter that gets cancelled never cancels the refresh for the
//! others. A successful result stays joinable for a hold window so late
//! 401s ride it instead of refreshing again; a failed one is dropped at
//! once.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cookies::Cookie;

/// Result of one refresh, cloned to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were issued; these cookies carry them.
    Refreshed(Vec<Cookie>),
    /// The refresh endpoint answered 401: the refresh token is dead.
    Rejected,
    /// Any other failure.
    Failed(String),
}

impl RefreshOutcome {
    /// True for [`RefreshOutcome::Refreshed`].
    #[must_use]
    pub const fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed(_))
    }
}

/// Joinable handle to an in-flight or recently settled refresh.
pub type RefreshTask = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Holds the shared refresh task of each refresh token.
pub struct RefreshSlot {
    slot: Mutex<HashMap<String, (u64, RefreshTask)>>,
    generation: AtomicU64,
    hold: Duration,
}

impl std::fmt::Debug for RefreshSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshSlot")
            .field("started", &self.started())
            .field("hold", &self.hold)
            .finish_non_exhaustive()
    }
}

impl RefreshSlot {
    /// Slot keeping successful results joinable for `hold`.
    #[must_use]
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            hold,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, RefreshTask)>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("refresh slot lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    /// Number of refreshes started so far.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// True while a task for `refresh_token` is joinable.
    #[must_use]
    pub fn is_occupied(&self, refresh_token: &str) -> bool {
        self.lock().contains_key(refresh_token)
    }

    /// Joins the task of `refresh_token`, or spawns `start()` as its new one.
    ///
    /// Must be called within a tokio runtime.
    pub fn join_or_start<F>(self: &Arc<Self>, refresh_token: &str, start: F) -> RefreshTask
    where
        F: FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    {
        let mut guard = self.lock();
        if let Some((_, task)) = guard.get(refresh_token) {
            debug!("joining in-flight token refresh");
            return task.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let work = start();
        let slot = Arc::clone(self);
        let key = refresh_token.to_string();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            if outcome.is_refreshed() {
                let hold = slot.hold;
                tokio::spawn(async move {
                    tokio::time::sleep(hold).await;
                    slot.clear(&key, generation);
                });
            } else {
                slot.clear(&key, generation);
            }
            outcome
        });
        let task = async move {
            handle
                .await
                .unwrap_or_else(|e| RefreshOutcome::Failed(format!("refresh task aborted: {e}")))
        }
        .boxed()
        .shared();
        guard.insert(refresh_token.to_string(), (generation, task.clone()));
        task
    }

    fn clear(&self, refresh_token: &str, generation: u64) {
        let mut guard = self.lock();
        if guard.get(refresh_token).is_some_and(|(g, _)| *g == generation) {
            debug!(generation, "refresh slot released");
            guard.remove(refresh_token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(
        calls: &Arc<AtomicUsize>,
        outcome: RefreshOutcome,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, RefreshOutcome> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                outcome
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let slot = RefreshSlot::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = RefreshOutcome::Refreshed(vec![Cookie::new("access_token", "new")]);

        let tasks: Vec<_> = (0..5)
            .map(|_| slot.join_or_start("r", counting(&calls, ok.clone(), Duration::from_millis(50))))
            .collect();
        let results = futures_util::future::join_all(tasks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slot.started(), 1);
        assert!(results.iter().all(|r| *r == ok));
    }

    #[tokio::test]
    async fn test_success_is_held_then_released() {
        let slot = RefreshSlot::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = RefreshOutcome::Refreshed(Vec::new());

        slot.join_or_start("r", counting(&calls, ok.clone(), Duration::ZERO))
            .await;
        assert!(slot.is_occupied("r"), "held after success");
        slot.join_or_start("r", counting(&calls, ok.clone(), Duration::ZERO))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "late caller reuses result");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!slot.is_occupied("r"));
        slot.join_or_start("r", counting(&calls, ok, Duration::ZERO)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_releases_immediately() {
        let slot = RefreshSlot::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = slot
            .join_or_start("r", counting(&calls, RefreshOutcome::Rejected, Duration::ZERO))
            .await;
        assert_eq!(outcome, RefreshOutcome::Rejected);
        assert!(!slot.is_occupied("r"));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_refresh() {
        let slot = RefreshSlot::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = RefreshOutcome::Refreshed(Vec::new());

        let first = slot.join_or_start("r", counting(&calls, ok.clone(), Duration::from_millis(50)));
        let _ = tokio::time::timeout(Duration::from_millis(5), first).await;

        let second = slot.join_or_start("r", counting(&calls, ok.clone(), Duration::ZERO));
        assert_eq!(second.await, ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_tokens_refresh_separately() {
        let slot = RefreshSlot::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let alice = RefreshOutcome::Refreshed(vec![Cookie::new("access_token", "fresh-alice")]);
        let bob = RefreshOutcome::Refreshed(vec![Cookie::new("access_token", "fresh-bob")]);

        let first = slot.join_or_start(
            "r-alice",
            counting(&calls, alice.clone(), Duration::from_millis(50)),
        );
        let second = slot.join_or_start(
            "r-bob",
            counting(&calls, bob.clone(), Duration::from_millis(50)),
        );
        let (first, second) = futures_util::future::join(first, second).await;

        assert_eq!(first, alice);
        assert_eq!(second, bob);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(slot.is_occupied("r-alice"));
        assert!(!slot.is_occupied("r-carol"));
    }
}
