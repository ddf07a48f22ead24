use crate::types::{TopoError, TopoResult};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// Rayon's global pool (one worker per core)
    #[default]
    Auto,
    /// Single-threaded, in item order
    Sequential,
    /// Dedicated pool with the given number of workers
    Threads(usize),
}

/// Executor parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorParams {
    pub parallelism: Parallelism,
    /// Wall-clock budget per work item; results of slower items are
    /// discarded as no-data
    pub item_budget: Option<Duration>,
}

impl ExecutorParams {
    pub fn validate(&self) -> TopoResult<()> {
        if self.parallelism == Parallelism::Threads(0) {
            return Err(TopoError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.item_budget == Some(Duration::ZERO) {
            return Err(TopoError::InvalidConfig(
                "per-item budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cooperative shutdown flag shared between the driver and the executor
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching new items; in-flight items still complete
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Number of work items completed so far in the current run
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicUsize>);

impl ProgressCounter {
    pub fn completed(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Called with `(completed, total)` after each item, from worker threads
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// What happened to a single work item
#[derive(Debug)]
pub enum ItemOutcome<T> {
    Completed(T),
    Failed(TopoError),
    /// The kernel panicked; the payload message is kept for diagnostics
    Panicked(String),
    /// Finished, but over the per-item budget
    TimedOut(Duration),
}

impl<T> ItemOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ItemOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// `(item_key, outcome)` pairs in item order
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub outcomes: Vec<(usize, ItemOutcome<T>)>,
    pub elapsed: Duration,
}

impl<T> ExecutionReport<T> {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ItemOutcome::Failed(_) | ItemOutcome::Panicked(_)))
            .count()
    }

    pub fn timed_out(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ItemOutcome::TimedOut(_)))
            .count()
    }

    /// First fatal error recorded by any item, if any
    pub fn fatal_error(&self) -> Option<&TopoError> {
        self.outcomes.iter().find_map(|(_, o)| match o {
            ItemOutcome::Failed(e) if e.is_fatal() => Some(e),
            _ => None,
        })
    }
}

/// Fans independent work items out over a worker pool and collects the
/// results in item order
///
/// Workers share nothing mutable except the progress counter and the
/// cancellation flag. A failing or panicking item is recorded and does not
/// stop its siblings.
pub struct ParallelExecutor {
    params: ExecutorParams,
    cancel: CancellationToken,
    progress: ProgressCounter,
    callback: Option<ProgressCallback>,
}

impl ParallelExecutor {
    pub fn new(params: ExecutorParams) -> Self {
        Self {
            params,
            cancel: CancellationToken::new(),
            progress: ProgressCounter::default(),
            callback: None,
        }
    }

    /// Executor using all cores and no per-item budget
    pub fn standard() -> Self {
        Self::new(ExecutorParams::default())
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn params(&self) -> &ExecutorParams {
        &self.params
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> ProgressCounter {
        self.progress.clone()
    }

    /// Evaluate `f` on every item
    ///
    /// Returns `Cancelled` if shutdown was requested during the run; results
    /// of items that were in flight at that point are discarded.
    pub fn execute<I, T, F>(&self, items: &[I], f: F) -> TopoResult<ExecutionReport<T>>
    where
        I: Sync,
        T: Send,
        F: Fn(&I) -> TopoResult<T> + Sync + Send,
    {
        self.params.validate()?;

        let total = items.len();
        let start = Instant::now();
        self.progress.reset();

        log::debug!(
            "Dispatching {} work items ({:?})",
            total,
            self.params.parallelism
        );

        let run = |index: usize, item: &I| self.run_item(index, item, total, &f);

        let outcomes: Vec<Option<(usize, ItemOutcome<T>)>> = match self.params.parallelism {
            Parallelism::Sequential => items.iter().enumerate().map(|(i, item)| run(i, item)).collect(),
            Parallelism::Auto => self.dispatch_parallel(items, &run),
            Parallelism::Threads(threads) => {
                build_pool(threads)?.install(|| self.dispatch_parallel(items, &run))
            }
        };

        let completed = self.progress.completed();
        if self.cancel.is_cancelled() {
            log::warn!("Run cancelled after {} of {} work items", completed, total);
            return Err(TopoError::Cancelled { completed, total });
        }

        let report = ExecutionReport {
            outcomes: outcomes.into_iter().flatten().collect(),
            elapsed: start.elapsed(),
        };

        log::debug!(
            "Executed {} items in {:.3}s ({} failed, {} over budget)",
            total,
            report.elapsed.as_secs_f64(),
            report.failed(),
            report.timed_out()
        );

        Ok(report)
    }

    /// Run `op` on a worker pool sized like this executor's
    ///
    /// Rayon work spawned inside `op` (e.g. parallel iterators) runs on
    /// one worker for `Sequential`, on a dedicated pool for `Threads(n)`
    /// and on the global pool for `Auto`.
    pub fn install<R, F>(&self, op: F) -> TopoResult<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.params.validate()?;
        match self.params.parallelism {
            Parallelism::Auto => Ok(op()),
            Parallelism::Sequential => Ok(build_pool(1)?.install(op)),
            Parallelism::Threads(threads) => Ok(build_pool(threads)?.install(op)),
        }
    }

    #[cfg(feature = "parallel")]
    fn dispatch_parallel<I, T, R>(&self, items: &[I], run: &R) -> Vec<Option<(usize, ItemOutcome<T>)>>
    where
        I: Sync,
        T: Send,
        R: Fn(usize, &I) -> Option<(usize, ItemOutcome<T>)> + Sync,
    {
        use rayon::prelude::*;

        items
            .par_iter()
            .enumerate()
            .map(|(i, item)| run(i, item))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn dispatch_parallel<I, T, R>(&self, items: &[I], run: &R) -> Vec<Option<(usize, ItemOutcome<T>)>>
    where
        I: Sync,
        T: Send,
        R: Fn(usize, &I) -> Option<(usize, ItemOutcome<T>)> + Sync,
    {
        // Fallback to sequential dispatch if parallel feature is not available
        items.iter().enumerate().map(|(i, item)| run(i, item)).collect()
    }

    fn run_item<I, T, F>(
        &self,
        index: usize,
        item: &I,
        total: usize,
        f: &F,
    ) -> Option<(usize, ItemOutcome<T>)>
    where
        F: Fn(&I) -> TopoResult<T>,
    {
        if self.cancel.is_cancelled() {
            return None;
        }

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(item)));
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(value)) => match self.params.item_budget {
                Some(budget) if elapsed > budget => {
                    log::warn!(
                        "Work item {} took {:.3}s, over its {:.3}s budget; discarding result",
                        index,
                        elapsed.as_secs_f64(),
                        budget.as_secs_f64()
                    );
                    ItemOutcome::TimedOut(elapsed)
                }
                _ => ItemOutcome::Completed(value),
            },
            Ok(Err(e)) => {
                log::warn!("Work item {} failed: {}", index, e);
                ItemOutcome::Failed(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("Work item {} panicked: {}", index, message);
                ItemOutcome::Panicked(message)
            }
        };

        let completed = self.progress.increment();
        if let Some(callback) = &self.callback {
            callback(completed, total);
        }
        let step = (total / 10).max(1);
        if completed % step == 0 || completed == total {
            log::debug!("Progress: {}/{} work items", completed, total);
        }

        Some((index, outcome))
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::standard()
    }
}

fn build_pool(threads: usize) -> TopoResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| TopoError::InvalidConfig(format!("Failed to build worker pool: {}", e)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
