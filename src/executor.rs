//! Turns a batch of buffered requests into fetch calls, and distributes the
//! results.

use std::{future::Future, num::NonZeroUsize};

use futures::{
    future::{self, Either},
    pin_mut,
};
use tracing::{debug, warn};

use crate::{
    buffer::{BufferedRequest, Pending},
    cache::TaskCache,
    cancel::CancelSignal,
    error::LoadError,
};

/// The batch function of a loader.
///
/// `fetch` is called with a list of unique keys and must return one result
/// per key, in the same order. An `Err` inside the list fails only its own
/// key; an `Err` for the whole call fails every key of the call.
///
/// This is implemented for every `Fn(Vec<K>, CancelSignal) -> Future`, so
/// an async closure or function is usually all you need:
///
/// ```
/// use keyloader::CancelSignal;
///
/// type Lengths = Result<Vec<Result<usize, ()>>, ()>;
///
/// async fn lengths(keys: Vec<String>, _cancel: CancelSignal) -> Lengths {
///     Ok(keys.iter().map(|key| Ok(key.len())).collect())
/// }
/// ```
pub trait Fetch<K, V, E>: Send + Sync {
    type Future: Future<Output = Result<Vec<Result<V, E>>, E>> + Send + 'static;

    fn fetch(&self, keys: Vec<K>, cancel: CancelSignal) -> Self::Future;
}

impl<K, V, E, F, Fut> Fetch<K, V, E> for F
where
    F: Fn(Vec<K>, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Result<V, E>>, E>> + Send + 'static,
{
    type Future = Fut;

    #[inline]
    fn fetch(&self, keys: Vec<K>, cancel: CancelSignal) -> Fut {
        self(keys, cancel)
    }
}

/// Split `requests` into chunks of at most `size` requests, keeping their
/// order. With no size, everything goes in a single chunk.
fn chunks<T>(requests: Vec<T>, size: Option<NonZeroUsize>) -> Vec<Vec<T>> {
    let size = match size {
        Some(size) if size.get() < requests.len() => size.get(),
        _ => return vec![requests],
    };

    let mut chunks = Vec::with_capacity((requests.len() + size - 1) / size);
    let mut requests = requests.into_iter().peekable();

    while requests.peek().is_some() {
        chunks.push(requests.by_ref().take(size).collect());
    }

    chunks
}

/// Everything needed to run one dispatched batch.
pub(crate) struct Executor<'a, F, V, E> {
    pub fetch: &'a F,
    pub cache: Option<&'a TaskCache<Pending<V, E>>>,
    pub cancel: CancelSignal,
    pub chunk_size: Option<NonZeroUsize>,
}

impl<'a, F, V, E> Executor<'a, F, V, E>
where
    V: Clone,
    E: Clone,
{
    /// Fetch every request, completing all of their promises. Chunks are
    /// fetched concurrently and are independent of each other: a failure in
    /// one chunk doesn't affect the others.
    pub(crate) async fn run<K>(&self, requests: Vec<BufferedRequest<K, V, E>>)
    where
        K: Clone,
        F: Fetch<K, V, E>,
    {
        if requests.is_empty() {
            return;
        }

        let chunks = chunks(requests, self.chunk_size);
        debug!(chunks = chunks.len(), "running batch");

        future::join_all(chunks.into_iter().map(|chunk| self.run_chunk(chunk))).await;
    }

    async fn run_chunk<K>(&self, chunk: Vec<BufferedRequest<K, V, E>>)
    where
        K: Clone,
        F: Fetch<K, V, E>,
    {
        if self.cancel.is_cancelled() {
            return self.fail_all(chunk, LoadError::Cancelled);
        }

        let keys: Vec<K> = chunk.iter().map(|request| request.key.clone()).collect();
        let expected = keys.len();

        let fetch = self.fetch.fetch(keys, self.cancel.clone());
        pin_mut!(fetch);

        let values = match future::select(fetch, self.cancel.cancelled()).await {
            Either::Left((Ok(values), _)) => values,
            Either::Left((Err(err), _)) => {
                debug!(keys = expected, "fetch failed");
                return self.fail_all(chunk, LoadError::Fetch(err));
            }
            Either::Right(((), _)) => {
                warn!(keys = expected, "fetch cancelled");
                return self.fail_all(chunk, LoadError::Cancelled);
            }
        };

        let actual = values.len();
        if actual != expected {
            warn!(expected, actual, "fetch returned the wrong number of values");
            return self.fail_all(chunk, LoadError::CountMismatch { expected, actual });
        }

        for (request, value) in chunk.into_iter().zip(values) {
            match value {
                Ok(value) => {
                    request.pending.complete(Ok(value));
                }
                // Per-key errors aren't cached, so that the next load retries
                Err(err) => request.fail(self.cache, LoadError::Fetch(err)),
            }
        }
    }

    fn fail_all<K>(&self, chunk: Vec<BufferedRequest<K, V, E>>, error: LoadError<E>) {
        for request in chunk {
            request.fail(self.cache, error.clone());
        }
    }
}
