// Chunked queries: split a large identifier list into API-sized batches and
// drive them through the dispatcher, keeping whatever succeeds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::task::{self, JoinSet};

use crate::dispatch::Dispatcher;
use crate::error::{ChunkError, QueryError};
use crate::metrics;

/// Maximum number of identifiers the official API accepts per request.
pub const QUERY_LIMIT: usize = 100;

/// Records that can be looked up again by identifier.
pub trait Identified {
    fn id(&self) -> &str;
}

/// Merged result of a chunked query.
#[derive(Debug)]
pub struct QueryOutcome<T> {
    /// Records from every chunk that succeeded, in no particular chunk order.
    pub results: Vec<T>,
    /// One entry per failed chunk, sorted by chunk index.
    pub errors: Vec<ChunkError>,
    /// Number of chunk calls issued.
    pub chunks: usize,
}

impl<T> QueryOutcome<T> {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
            chunks: 0,
        }
    }

    /// True when no chunk failed.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Caller-supplied chunk sizes are an upper bound: never above
/// [`QUERY_LIMIT`], never below one.
pub fn effective_chunk_size(requested: usize) -> usize {
    requested.clamp(1, QUERY_LIMIT)
}

/// Run chunks one after another.
///
/// A failed chunk contributes nothing and is recorded in `errors`. With
/// `stop_on_error` the query returns right after the first failure with
/// what has been gathered so far.
pub async fn query_sequential<F, Fut, T>(
    dispatcher: &Dispatcher,
    f: F,
    ids: &[String],
    chunk_size: usize,
    stop_on_error: bool,
) -> QueryOutcome<T>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, QueryError>>,
{
    let size = effective_chunk_size(chunk_size);
    let mut outcome = QueryOutcome::new();

    for (index, chunk) in ids.chunks(size).enumerate() {
        outcome.chunks += 1;
        metrics::CHUNKS_ISSUED_TOTAL
            .with_label_values(&["sequential"])
            .inc();

        match dispatcher.enqueue(|| f(chunk.to_vec())).await {
            Ok(mut records) => outcome.results.append(&mut records),
            Err(error) => {
                metrics::CHUNKS_FAILED_TOTAL
                    .with_label_values(&["sequential"])
                    .inc();
                tracing::warn!(chunk = index, "sequential query chunk failed: {error}");
                outcome.errors.push(ChunkError { index, error });
                if stop_on_error {
                    break;
                }
            }
        }
    }

    outcome
}

/// Run every chunk concurrently, each gated by the dispatcher's bucket, and
/// wait for all of them. Every chunk is always attempted.
pub async fn query_concurrent<F, Fut, T>(
    dispatcher: &Dispatcher,
    f: F,
    ids: &[String],
) -> QueryOutcome<T>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, QueryError>> + Send + 'static,
    T: Send + 'static,
{
    query_concurrent_chunked(dispatcher, f, ids, QUERY_LIMIT).await
}

/// [`query_concurrent`] with a caller-chosen chunk size (clamped by
/// [`effective_chunk_size`]).
pub async fn query_concurrent_chunked<F, Fut, T>(
    dispatcher: &Dispatcher,
    f: F,
    ids: &[String],
    chunk_size: usize,
) -> QueryOutcome<T>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, QueryError>> + Send + 'static,
    T: Send + 'static,
{
    let size = effective_chunk_size(chunk_size);
    let f = Arc::new(f);
    let mut set = JoinSet::new();
    let mut chunk_of = HashMap::new();
    let mut outcome = QueryOutcome::new();

    for (index, chunk) in ids.chunks(size).enumerate() {
        let f = f.clone();
        let chunk = chunk.to_vec();
        let handle = dispatcher.enqueue_async_err(move || (*f)(chunk), &mut set);
        chunk_of.insert(handle.id(), index);

        outcome.chunks += 1;
        metrics::CHUNKS_ISSUED_TOTAL
            .with_label_values(&["concurrent"])
            .inc();
    }

    while let Some(joined) = set.join_next_with_id().await {
        let (index, error) = match joined {
            Ok((_, Ok(mut records))) => {
                outcome.results.append(&mut records);
                continue;
            }
            Ok((id, Err(error))) => (chunk_index(&chunk_of, id), error),
            Err(join_error) => (
                chunk_index(&chunk_of, join_error.id()),
                QueryError::Join(join_error.to_string()),
            ),
        };

        metrics::CHUNKS_FAILED_TOTAL
            .with_label_values(&["concurrent"])
            .inc();
        tracing::warn!(chunk = index, "concurrent query chunk failed: {error}");
        outcome.errors.push(ChunkError { index, error });
    }

    outcome.errors.sort_by_key(|e| e.index);
    outcome
}

// Every task in the set was spawned by the loop above, which recorded its id.
fn chunk_index(chunk_of: &HashMap<task::Id, usize>, id: task::Id) -> usize {
    *chunk_of
        .get(&id)
        .expect("every spawned chunk task has a recorded index")
}

/// Re-resolve records that are already known, by their identifiers.
pub async fn query_known<R, F, Fut, T>(
    dispatcher: &Dispatcher,
    f: F,
    records: &[R],
) -> QueryOutcome<T>
where
    R: Identified,
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, QueryError>> + Send + 'static,
    T: Send + 'static,
{
    let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
    query_concurrent(dispatcher, f, &ids).await
}
