//! Bounded-concurrency batch execution.
//!
//! A fixed pool of scoped OS threads pulls item indices from a shared
//! cursor, so at most `concurrency` items are in flight and a slow item
//! holds only its own slot. The pool is joined before either run method
//! returns, which is the barrier the glossary merge relies on.
//!
//! ## Modes
//!
//! - [`BoundedExecutor::run_fail_fast`]: the first failure cancels a child
//!   token; in-flight siblings observe it and no further item starts.
//! - [`BoundedExecutor::run_collect`]: every item runs; all failures are
//!   returned next to the successes, ordered by item index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use tokio_util::sync::CancellationToken;

/// Default number of items in flight.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Executor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum items in flight; 0 is treated as 1.
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { concurrency: DEFAULT_CONCURRENCY }
    }
}

impl ExecutorConfig {
    /// Configuration with the given concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency }
    }
}

/// Failure of a fail-fast run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError<E: std::error::Error + 'static> {
    /// The caller's token was cancelled before every item ran.
    #[error("Batch cancelled")]
    Cancelled,
    /// The first item failure.
    #[error("Item {index} failed: {source}")]
    Item {
        /// Item position in the input slice.
        index: usize,
        /// Item error.
        #[source]
        source: E,
    },
}

/// One failed item of a collecting run.
#[derive(Debug)]
pub struct ItemFailure<E> {
    /// Item position in the input slice.
    pub index: usize,
    /// Item error.
    pub error: E,
}

/// Everything a collecting run produced.
#[derive(Debug)]
pub struct BatchOutcome<R, E> {
    /// Successful results as `(index, result)`, ordered by index.
    pub results: Vec<(usize, R)>,
    /// Failed items, ordered by index.
    pub failures: Vec<ItemFailure<E>>,
    /// Items never started because the run was cancelled.
    pub not_started: Vec<usize>,
}

impl<R, E> BatchOutcome<R, E> {
    /// Whether every item ran and succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.not_started.is_empty()
    }
}

/// Worker pool with a fixed concurrency bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedExecutor {
    config: ExecutorConfig,
}

impl BoundedExecutor {
    /// Create an executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Effective concurrency (at least 1).
    pub fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Run `f` over `items`; the first failure stops the batch.
    ///
    /// Results are returned in item order.
    pub fn run_fail_fast<T, R, E, F>(
        &self,
        items: &[T],
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Vec<R>, ExecutorError<E>>
    where
        T: Sync,
        R: Send,
        E: std::error::Error + Send + 'static,
        F: Fn(&T, &CancellationToken) -> Result<R, E> + Sync,
    {
        let run = self.drive(items, cancel, true, f);

        if let Some(first) = run.failures.into_iter().next() {
            return Err(ExecutorError::Item { index: first.index, source: first.error });
        }
        if run.started < items.len() {
            return Err(ExecutorError::Cancelled);
        }
        Ok(sorted(run.results).into_iter().map(|(_, r)| r).collect())
    }

    /// Run `f` over every item, collecting successes and failures.
    pub fn run_collect<T, R, E, F>(
        &self,
        items: &[T],
        cancel: &CancellationToken,
        f: F,
    ) -> BatchOutcome<R, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T, &CancellationToken) -> Result<R, E> + Sync,
    {
        let run = self.drive(items, cancel, false, f);

        let mut failures = run.failures;
        failures.sort_by_key(|f| f.index);
        BatchOutcome {
            results: sorted(run.results),
            failures,
            not_started: (run.started..items.len()).collect(),
        }
    }

    fn drive<T, R, E, F>(&self, items: &[T], cancel: &CancellationToken, fail_fast: bool, f: F) -> RawRun<R, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T, &CancellationToken) -> Result<R, E> + Sync,
    {
        let workers = self.concurrency().min(items.len());
        let token = cancel.child_token();
        let cursor = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(items.len()));
        let failures = Mutex::new(Vec::new());

        tracing::debug!(items = items.len(), workers, fail_fast, "Starting batch");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if token.is_cancelled() {
                        break;
                    }
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(index) else { break };

                    match f(item, &token) {
                        Ok(result) => results.lock().push((index, result)),
                        Err(error) => {
                            failures.lock().push(ItemFailure { index, error });
                            if fail_fast {
                                token.cancel();
                            }
                        }
                    }
                });
            }
        });

        RawRun {
            results: results.into_inner(),
            failures: failures.into_inner(),
            started: cursor.into_inner().min(items.len()),
        }
    }
}

struct RawRun<R, E> {
    results: Vec<(usize, R)>,
    /// In completion order.
    failures: Vec<ItemFailure<E>>,
    started: usize,
}

fn sorted<R>(mut results: Vec<(usize, R)>) -> Vec<(usize, R)> {
    results.sort_by_key(|(i, _)| *i);
    results
}
