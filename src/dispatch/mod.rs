// Rate-governed dispatcher: every outbound request task runs only after it
// has taken a token from the shared bucket.

pub mod bucket;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};

use crate::error::DispatchError;
use crate::metrics;

pub use bucket::{min_refill_interval, TokenBucket, MAX_CAPACITY, MAX_RATE_PER_MINUTE};

/// How a task submitted through [`Dispatcher::enqueue_or_async`] or
/// [`Dispatcher::burst`] was executed.
#[derive(Debug)]
pub enum Submission<T, E> {
    /// A token was free, so the task ran inline on the caller.
    Completed(Result<T, E>),
    /// No token was free; the task waits for one on its own tokio task.
    Deferred(JoinHandle<Result<T, E>>),
}

impl<T, E> Submission<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Submission::Completed(_))
    }

    /// Wait for the task's result, whichever path it took.
    pub async fn outcome(self) -> Result<Result<T, E>, JoinError> {
        match self {
            Submission::Completed(result) => Ok(result),
            Submission::Deferred(handle) => handle.await,
        }
    }
}

/// Gates task execution behind a [`TokenBucket`]. Cheap to clone; all clones
/// share the same bucket.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    bucket: Arc<TokenBucket>,
}

impl Dispatcher {
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket: Arc::new(bucket),
        }
    }

    /// Convenience for `Dispatcher::new(TokenBucket::new(rate)?)`.
    pub fn with_rate(rate_per_minute: u32) -> Result<Self, crate::error::BucketError> {
        Ok(Self::new(TokenBucket::new(rate_per_minute)?))
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Wait for a token, then run `task` and return its result.
    pub async fn enqueue<F, Fut, T, E>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DispatchError>,
    {
        self.bucket.acquire().await?;
        metrics::TASKS_DISPATCHED_TOTAL
            .with_label_values(&["sync"])
            .inc();
        task().await
    }

    /// Run `task` on its own tokio task once a token is available.
    ///
    /// The caller never blocks. Dropping the returned handle makes this
    /// fire-and-forget; failures are then only visible in the debug log.
    pub fn enqueue_async<F, Fut, T, E>(&self, task: F) -> JoinHandle<Result<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DispatchError> + Display + Send + 'static,
    {
        tokio::spawn(self.clone().gated(task))
    }

    /// Like [`enqueue_async`](Self::enqueue_async), but the task is spawned
    /// into a caller-owned `JoinSet` so its result or error is collected when
    /// the caller joins the set.
    pub fn enqueue_async_err<F, Fut, T, E>(
        &self,
        task: F,
        set: &mut JoinSet<Result<T, E>>,
    ) -> AbortHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DispatchError> + Display + Send + 'static,
    {
        set.spawn(self.clone().gated(task))
    }

    /// Run `task` inline if a token is free right now, otherwise hand it to
    /// [`enqueue_async`](Self::enqueue_async). Never waits for a token.
    pub async fn enqueue_or_async<F, Fut, T, E>(&self, task: F) -> Submission<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DispatchError> + Display + Send + 'static,
    {
        if self.bucket.try_acquire() {
            metrics::TASKS_DISPATCHED_TOTAL
                .with_label_values(&["inline"])
                .inc();
            Submission::Completed(task().await)
        } else {
            Submission::Deferred(self.enqueue_async(task))
        }
    }

    /// Run tasks inline, in order, while tokens are immediately available.
    /// Once the bucket runs dry every remaining task is deferred through
    /// [`enqueue_async`](Self::enqueue_async). Output `i` belongs to task `i`.
    pub async fn burst<I, F, Fut, T, E>(&self, tasks: I) -> Vec<Submission<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DispatchError> + Display + Send + 'static,
    {
        let tasks = tasks.into_iter();
        let mut submissions = Vec::with_capacity(tasks.size_hint().0);
        let mut exhausted = false;

        for task in tasks {
            if !exhausted && self.bucket.try_acquire() {
                metrics::TASKS_DISPATCHED_TOTAL
                    .with_label_values(&["inline"])
                    .inc();
                submissions.push(Submission::Completed(task().await));
            } else {
                exhausted = true;
                submissions.push(Submission::Deferred(self.enqueue_async(task)));
            }
        }

        let deferred = submissions.iter().filter(|s| !s.is_completed()).count();
        if deferred > 0 {
            tracing::debug!(
                inline = submissions.len() - deferred,
                deferred,
                "burst exhausted the token bucket"
            );
        }
        submissions
    }

    async fn gated<F, Fut, T, E>(self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DispatchError> + Display,
    {
        self.bucket.acquire().await?;
        metrics::TASKS_DISPATCHED_TOTAL
            .with_label_values(&["async"])
            .inc();
        let result = task().await;
        if let Err(e) = &result {
            tracing::debug!("async dispatch task failed: {e}");
        }
        result
    }
}
