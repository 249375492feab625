use std::{
    fmt::{self, Debug, Formatter},
    hash::Hash,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use crate::cache::CacheKey;

/// Maps a loader key to the key its value is cached under.
pub type CacheKeyFn<K> = Arc<dyn Fn(&K) -> CacheKey + Send + Sync>;

/// Configuration for a [`Loader`]. The loader takes a snapshot of these
/// options when it's created; they can't be changed afterwards.
///
/// [`Loader`]: crate::Loader
pub struct LoaderOptions<K> {
    /// Dispatch buffered requests automatically, `batch_delay` after the
    /// first request of a batch arrives. When false, requests wait for an
    /// explicit [`dispatch`](crate::Loader::dispatch).
    pub auto_dispatch: bool,

    /// When false, every request is fetched on its own as soon as it's made,
    /// without waiting for a delay or a dispatch.
    pub batching_enabled: bool,

    /// How long an auto-dispatched batch collects requests. Later requests
    /// don't extend the window.
    pub batch_delay: Duration,

    /// The maximum number of keys passed to a single fetch call. Larger
    /// batches are split into several calls. 0 means unbounded.
    pub max_batch_size: usize,

    /// Whether loaded values are cached between calls.
    pub caching_enabled: bool,

    /// The maximum number of cached values. 0 is treated as 1.
    pub cache_capacity: usize,

    /// Cached values that aren't accessed for this long are discarded.
    /// Zero means values never expire.
    pub sliding_expiration: Duration,

    /// Computes the cache key for a loader key. Defaults to the key itself.
    pub cache_key: Option<CacheKeyFn<K>>,
}

impl<K> Default for LoaderOptions<K> {
    fn default() -> Self {
        Self {
            auto_dispatch: false,
            batching_enabled: true,
            batch_delay: Duration::from_millis(50),
            max_batch_size: 0,
            caching_enabled: true,
            cache_capacity: 1000,
            sliding_expiration: Duration::ZERO,
            cache_key: None,
        }
    }
}

impl<K> Clone for LoaderOptions<K> {
    fn clone(&self) -> Self {
        Self {
            auto_dispatch: self.auto_dispatch,
            batching_enabled: self.batching_enabled,
            batch_delay: self.batch_delay,
            max_batch_size: self.max_batch_size,
            caching_enabled: self.caching_enabled,
            cache_capacity: self.cache_capacity,
            sliding_expiration: self.sliding_expiration,
            cache_key: self.cache_key.clone(),
        }
    }
}

impl<K> Debug for LoaderOptions<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("auto_dispatch", &self.auto_dispatch)
            .field("batching_enabled", &self.batching_enabled)
            .field("batch_delay", &self.batch_delay)
            .field("max_batch_size", &self.max_batch_size)
            .field("caching_enabled", &self.caching_enabled)
            .field("cache_capacity", &self.cache_capacity)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("cache_key", &self.cache_key.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

impl<K> LoaderOptions<K> {
    pub fn with_auto_dispatch(mut self, delay: Duration) -> Self {
        self.auto_dispatch = true;
        self.batch_delay = delay;
        self
    }

    pub fn without_batching(mut self) -> Self {
        self.batching_enabled = false;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn without_caching(mut self) -> Self {
        self.caching_enabled = false;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_sliding_expiration(mut self, expiration: Duration) -> Self {
        self.sliding_expiration = expiration;
        self
    }

    pub fn with_cache_key(
        mut self,
        cache_key: impl Fn(&K) -> CacheKey + Send + Sync + 'static,
    ) -> Self {
        self.cache_key = Some(Arc::new(cache_key));
        self
    }

    /// The chunk size for a dispatch, or None if batches are unbounded.
    pub(crate) fn chunk_size(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_batch_size)
    }
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static> LoaderOptions<K> {
    pub(crate) fn cache_key_for(&self, key: &K) -> CacheKey {
        match self.cache_key {
            Some(ref cache_key) => cache_key(key),
            None => CacheKey::new(key.clone()),
        }
    }
}
