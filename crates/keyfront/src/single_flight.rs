//! Exactly-once async operation primitive.
//!
//! Frameworks that intentionally double-invoke effects (StrictMode-style
//! double mounts, duplicate redirect callbacks) may call the bootstrap entry
//! point twice while the first call's work is still in flight. Re-running
//! the work would re-submit a single-use authorization code and double-count
//! side effects, so concurrent callers must share the same in-flight future.
//!
//! [`SingleFlight`] memoizes one `Shared` future per logical operation:
//! the first caller installs it, every concurrent (and later) caller awaits
//! the same future and observes the same settled value until [`reset`].
//!
//! [`reset`]: SingleFlight::reset

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

/// Memoized in-flight future for one logical operation.
pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").field("in_flight", &self.slot.lock().is_some()).finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// Return the in-flight future, installing the one produced by `make`
    /// if none exists. `make` runs at most once per [`reset`] cycle.
    ///
    /// [`reset`]: Self::reset
    pub fn get_or_run<F>(&self, make: F) -> Shared<BoxFuture<'static, T>>
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let shared = make().shared();
        *slot = Some(shared.clone());
        shared
    }

    /// Whether an operation has been installed (in flight or settled).
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Forget the memoized operation so the next caller starts a fresh one.
    pub fn reset(&self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the single-flight primitive.
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let make = |executions: Arc<AtomicUsize>| {
            async move {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                42u32
            }
            .boxed()
        };

        let a = flight.get_or_run(|| make(Arc::clone(&executions)));
        let b = flight.get_or_run(|| make(Arc::clone(&executions)));

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, 42);
        assert_eq!(rb, 42);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settled_value_is_retained_until_reset() {
        let flight = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let executions = Arc::clone(&executions);
            let value = flight
                .get_or_run(move || {
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                    .boxed()
                })
                .await;
            assert!(value);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        flight.reset();
        assert!(!flight.is_engaged());

        let executions2 = Arc::clone(&executions);
        flight
            .get_or_run(move || {
                async move {
                    executions2.fetch_add(1, Ordering::SeqCst);
                    true
                }
                .boxed()
            })
            .await;
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
