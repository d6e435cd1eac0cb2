//! Re-run a unit of work in a fresh transaction when the store reports contention.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use stream_metrics::{SharedMetrics, Tag};
use tracing::warn;

use crate::error::{BatchError, BatchResult};
use crate::store::BatchStore;

/// Default number of re-executions after a conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Conflict retries spent on one unit of work.
///
/// The transaction loop and any savepoint retries inside it draw from the same
/// budget, so a conflict is re-executed at most `max_retries` times in total.
#[derive(Debug, Default)]
pub struct RetryBudget {
    spent: AtomicU32,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spent(&self) -> u32 {
        self.spent.load(Ordering::SeqCst)
    }

    fn spend(&self) -> u32 {
        self.spent.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Clone)]
pub struct DeadlockRetry {
    max_retries: u32,
    base_delay: Duration,
    jitter: Duration,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for DeadlockRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockRetry")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl DeadlockRetry {
    /// Two retries after a 5-10 second randomized pause.
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(5),
            jitter: Duration::from_secs(5),
            metrics,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Pause between attempts: `base` plus a random extra of up to `jitter`.
    pub fn with_delay(mut self, base: Duration, jitter: Duration) -> Self {
        self.base_delay = base;
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `work` inside a transaction and commit it.
    ///
    /// The transaction is handed to `work` by value and handed back with the
    /// outcome. On a persistence conflict, from `work` or from the commit, the
    /// transaction is discarded and `work` runs again in a new one, up to
    /// `max_retries` times. Any other error rolls back and returns at once.
    pub async fn run<S, T, F, Fut>(&self, store: &S, tags: &[Tag<'_>], work: F) -> BatchResult<T>
    where
        S: BatchStore,
        F: FnMut(S::Tx) -> Fut,
        Fut: Future<Output = (S::Tx, BatchResult<T>)>,
    {
        self.run_with_budget(store, tags, &RetryBudget::new(), work)
            .await
    }

    /// Like [`DeadlockRetry::run`], charging retries to `budget`, which `work`
    /// may also spend from.
    pub async fn run_with_budget<S, T, F, Fut>(
        &self,
        store: &S,
        tags: &[Tag<'_>],
        budget: &RetryBudget,
        mut work: F,
    ) -> BatchResult<T>
    where
        S: BatchStore,
        F: FnMut(S::Tx) -> Fut,
        Fut: Future<Output = (S::Tx, BatchResult<T>)>,
    {
        loop {
            let tx = store.begin().await?;
            let (tx, outcome) = work(tx).await;

            let err = match outcome {
                Ok(value) => match store.commit(tx).await {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                },
                Err(err) => {
                    if let Err(rollback_err) = store.rollback(tx).await {
                        warn!(error = %rollback_err, "Rollback after failed batch transaction failed");
                    }
                    err
                }
            };

            if !self.should_retry(&err, budget) {
                return Err(err);
            }
            self.retry_after(&err, budget, tags).await;
        }
    }

    /// Whether a failure may be retried with what is left of `budget`.
    pub fn should_retry(&self, err: &BatchError, budget: &RetryBudget) -> bool {
        err.is_conflict() && budget.spent() < self.max_retries
    }

    /// Spend one retry from `budget`, record the conflict and wait it out.
    pub async fn retry_after(&self, err: &BatchError, budget: &RetryBudget, tags: &[Tag<'_>]) {
        let attempt = budget.spend();
        self.metrics.increment("deadlock", tags, 1);
        let delay = self.delay();
        warn!(
            attempt,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Persistence conflict, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base_delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.base_delay + Duration::from_millis(extra)
    }
}
