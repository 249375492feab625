//! The set of requests collected for the next dispatch.

use std::{
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    mem,
};

use crate::{
    cache::{CacheKey, TaskCache},
    error::LoadError,
    promise::{Promise, WeakPromise},
};

/// The pending result of loading one key.
pub(crate) type Pending<V, E> = Promise<Result<V, LoadError<E>>>;

/// A single key waiting to be fetched, along with the promise every
/// interested party is waiting on.
#[derive(Debug)]
pub(crate) struct BufferedRequest<K, V, E> {
    pub key: K,
    // Only present when caching is enabled
    pub cache_key: Option<CacheKey>,
    pub pending: Pending<V, E>,

    // How many requests were merged into this one. Only used for logging.
    pub waiters: usize,
}

impl<K, V: Clone, E: Clone> BufferedRequest<K, V, E> {
    pub(crate) fn new(key: K, cache_key: Option<CacheKey>) -> Self {
        Self {
            key,
            cache_key,
            pending: Promise::new(),
            waiters: 1,
        }
    }

    /// Downgrade this request, so that it can be held by a driver without
    /// keeping the promise alive.
    pub(crate) fn downgrade(&self) -> WeakRequest<K, V, E>
    where
        K: Clone,
    {
        WeakRequest {
            key: self.key.clone(),
            cache_key: self.cache_key.clone(),
            pending: self.pending.downgrade(),
            waiters: self.waiters,
        }
    }

    /// Fail this request, and forget it from the cache if it's still the
    /// cached value for its key.
    pub(crate) fn fail(
        self,
        cache: Option<&TaskCache<Pending<V, E>>>,
        error: LoadError<E>,
    ) {
        if let (Some(cache), Some(cache_key)) = (cache, self.cache_key.as_ref()) {
            cache.remove_if(cache_key, |cached| cached.ptr_eq(&self.pending));
        }

        self.pending.complete(Err(error));
    }
}

pub(crate) struct WeakRequest<K, V, E> {
    key: K,
    cache_key: Option<CacheKey>,
    pending: WeakPromise<Result<V, LoadError<E>>>,
    waiters: usize,
}

impl<K, V: Clone, E: Clone> WeakRequest<K, V, E> {
    /// Returns None if nobody is interested in this request anymore.
    pub(crate) fn upgrade(self) -> Option<BufferedRequest<K, V, E>> {
        let pending = self.pending.upgrade()?;

        Some(BufferedRequest {
            key: self.key,
            cache_key: self.cache_key,
            pending,
            waiters: self.waiters,
        })
    }
}

/// What happened when a key was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    /// The key is new to this buffer, and it was empty before: this is the
    /// start of a new buffering cycle.
    Started,

    /// The key is new to this buffer.
    Added,

    /// The key was already buffered; the caller shares its promise.
    Attached,
}

/// The requests collected during one buffering cycle. Keys are unique, and
/// are kept in the order they were first requested.
#[derive(Debug)]
pub(crate) struct RequestBuffer<K: Eq + Hash, V, E> {
    // Index into `requests` for every buffered key
    index: HashMap<K, usize>,
    requests: Vec<BufferedRequest<K, V, E>>,
}

impl<K: Eq + Hash, V, E> Default for RequestBuffer<K, V, E> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            requests: Vec::new(),
        }
    }
}

impl<K, V, E> RequestBuffer<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    /// Add a request for `key`, returning the promise the caller should wait
    /// on. If the key is already buffered, the existing promise is shared.
    pub(crate) fn enqueue(
        &mut self,
        key: K,
        cache_key: Option<CacheKey>,
    ) -> (Pending<V, E>, Enqueued) {
        let was_empty = self.requests.is_empty();

        match self.index.entry(key) {
            Entry::Occupied(entry) => {
                let request = &mut self.requests[*entry.get()];
                request.waiters += 1;
                (request.pending.clone(), Enqueued::Attached)
            }
            Entry::Vacant(entry) => {
                let request = BufferedRequest::new(entry.key().clone(), cache_key);
                let pending = request.pending.clone();

                entry.insert(self.requests.len());
                self.requests.push(request);

                if was_empty {
                    (pending, Enqueued::Started)
                } else {
                    (pending, Enqueued::Added)
                }
            }
        }
    }
}

impl<K: Eq + Hash, V, E> RequestBuffer<K, V, E> {
    /// Check if there are any keys in this buffer
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Get the number of unique keys in this buffer.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Take every buffered request out of the buffer, leaving it empty for
    /// the next cycle.
    pub(crate) fn take(&mut self) -> Vec<BufferedRequest<K, V, E>> {
        self.index.clear();
        mem::take(&mut self.requests)
    }
}
