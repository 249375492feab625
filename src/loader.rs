use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    sync::{Arc, Weak},
};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::{
    channel::oneshot,
    future::{self, Either, FutureExt},
};
use futures_timer::Delay;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    buffer::{BufferedRequest, Enqueued, Pending, RequestBuffer, WeakRequest},
    cache::TaskCache,
    cancel::CancelSource,
    error::LoadError,
    executor::{Executor, Fetch},
    options::LoaderOptions,
    promise::{Driver, Promise},
};

type Listener<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// A running auto-dispatch delay.
struct Timer {
    // Dropping this interrupts the delay
    _interrupt: oneshot::Sender<()>,
    driver: Driver,
}

struct State<K: Eq + Hash, V, E> {
    buffer: RequestBuffer<K, V, E>,

    // Incremented every time the buffer is flushed, so that a delay that
    // elapses late doesn't flush someone else's cycle.
    cycle: u64,
    timer: Option<Timer>,
}

struct Inner<K: Eq + Hash, V, E, F> {
    fetch: F,
    options: LoaderOptions<K>,
    cache: Option<TaskCache<Pending<V, E>>>,
    state: Mutex<State<K, V, E>>,

    // Swapped out when the loader is disposed
    cancel: ArcSwapOption<CancelSource>,
    listeners: ArcSwap<Vec<Listener<K>>>,
}

/// A loader batches, deduplicates and caches requests for individual keys.
///
/// Each call to [`load`] registers interest in a single key. Requests are
/// collected in a buffer until they're dispatched, at which point every
/// buffered key is passed to the fetch function in as few calls as
/// possible. Requests for the same key share a single fetch and a single
/// result, and, when caching is enabled, later requests for a loaded key
/// don't fetch at all.
///
/// When requests are dispatched depends on the [`LoaderOptions`]:
///
/// - with batching disabled, every request is fetched as soon as it's
///   awaited;
/// - with auto dispatch, buffered requests are dispatched once the batch
///   delay has passed since the first of them arrived;
/// - otherwise, requests wait for an explicit call to [`dispatch`].
///
/// A loader never spawns anything. The work of a dispatch is driven by the
/// futures waiting on its results, so it progresses as long as at least one
/// of them is being polled.
///
/// Dropping a loader disposes it; see [`dispose`].
///
/// [`load`]: Loader::load
/// [`dispatch`]: Loader::dispatch
/// [`dispose`]: Loader::dispose
pub struct Loader<K: Eq + Hash, V, E, F> {
    inner: Arc<Inner<K, V, E, F>>,
}

impl<K: Eq + Hash, V, E, F> Debug for Loader<K, V, E, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Loader")
            .field("options", &self.inner.options)
            .field("buffered", &state.buffer.len())
            .field("cycle", &state.cycle)
            .field("cache", &self.inner.cache)
            .field("disposed", &self.inner.cancel.load().is_none())
            .finish()
    }
}

impl<K, V, E, F> Loader<K, V, E, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fetch<K, V, E> + 'static,
{
    /// Create a loader with the default options: manual dispatch, batching
    /// and caching enabled.
    pub fn new(fetch: F) -> Self {
        Self::with_options(fetch, LoaderOptions::default())
    }

    pub fn with_options(fetch: F, options: LoaderOptions<K>) -> Self {
        let cache = if options.caching_enabled {
            Some(TaskCache::new(
                options.cache_capacity,
                options.sliding_expiration,
            ))
        } else {
            None
        };

        Self {
            inner: Arc::new(Inner {
                fetch,
                options,
                cache,
                state: Mutex::new(State {
                    buffer: RequestBuffer::default(),
                    cycle: 0,
                    timer: None,
                }),
                cancel: ArcSwapOption::from_pointee(CancelSource::new()),
                listeners: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &LoaderOptions<K> {
        &self.inner.options
    }

    /// Load the value for a single key.
    ///
    /// A cached value is returned without fetching. Otherwise, the request is
    /// buffered right away (sharing any request already pending for the same
    /// key) and the returned future completes once it has been fetched.
    pub fn load(&self, key: K) -> impl Future<Output = Result<V, LoadError<E>>> + Send + 'static {
        let request = self.inner.request(key);

        async move { request?.settle().await }
    }

    /// Load the values for several keys, in the same order as the keys.
    /// Fails with the error of the first key (in key order) that failed.
    pub fn load_many<I>(
        &self,
        keys: I,
    ) -> impl Future<Output = Result<Vec<V>, LoadError<E>>> + Send + 'static
    where
        I: IntoIterator<Item = K>,
    {
        self.load_many_results(keys)
            .map(|results| results.into_iter().collect::<Result<Vec<V>, _>>())
    }

    /// Load the values for several keys, in the same order as the keys,
    /// keeping each key's result separate.
    pub fn load_many_results<I>(
        &self,
        keys: I,
    ) -> impl Future<Output = Vec<Result<V, LoadError<E>>>> + Send + 'static
    where
        I: IntoIterator<Item = K>,
    {
        let requests: Vec<Result<Pending<V, E>, LoadError<E>>> = keys
            .into_iter()
            .map(|key| self.inner.request(key))
            .collect();

        future::join_all(requests.into_iter().map(|request| async move {
            match request {
                Ok(pending) => pending.settle().await,
                Err(err) => Err(err),
            }
        }))
    }

    /// Dispatch everything that's currently buffered, interrupting a running
    /// auto-dispatch delay. Completes once every dispatched key is resolved.
    /// Does nothing if nothing is buffered.
    pub async fn dispatch(&self) {
        self.inner.flush(None).await
    }

    /// Put a known value in the cache, replacing whatever was cached for the
    /// key. Does nothing when caching is disabled.
    pub fn set(&self, key: K, value: V) {
        if let Some(cache) = self.inner.cache.as_ref() {
            let cache_key = self.inner.options.cache_key_for(&key);
            cache.insert(cache_key, Promise::resolved(Ok(value)));
        }
    }

    /// Forget the cached value for a key, so that the next load fetches it
    /// again.
    pub fn remove(&self, key: &K) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.remove(&self.inner.options.cache_key_for(key));
        }
    }

    /// Forget every cached value.
    pub fn clear(&self) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.clear();
        }
    }

    /// The number of distinct keys waiting for a dispatch.
    pub fn buffered_requests(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// The number of cached values. Always 0 when caching is disabled.
    pub fn cached_values(&self) -> usize {
        self.inner.cache.as_ref().map_or(0, TaskCache::usage)
    }

    /// Register a listener for the "request buffered" event, which fires once
    /// for every requested key: cache hits and requests that share an already
    /// buffered key included. An empty `load_many` fires nothing.
    pub fn on_request_buffered(&self, listener: impl Fn(&K) + Send + Sync + 'static) {
        let listener: Listener<K> = Arc::new(listener);

        self.inner.listeners.rcu(|listeners| {
            let mut listeners = Vec::clone(listeners);
            listeners.push(Arc::clone(&listener));
            listeners
        });
    }

    /// Dispose this loader. Buffered requests fail with
    /// [`LoadError::Disposed`], in-flight fetches are cancelled (their
    /// requests fail with [`LoadError::Cancelled`]) and the cache is
    /// cleared. Requests made afterwards fail with `Disposed`.
    ///
    /// Calling this more than once has no effect.
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.load().is_none()
    }
}

impl<K: Eq + Hash, V, E, F> Drop for Loader<K, V, E, F> {
    fn drop(&mut self) {
        self.inner.dispose()
    }
}

impl<K, V, E, F> Inner<K, V, E, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fetch<K, V, E> + 'static,
{
    /// Register a request for `key`, returning the promise to wait on. The
    /// promise comes with whatever driver is needed to complete it.
    fn request(self: &Arc<Self>, key: K) -> Result<Pending<V, E>, LoadError<E>> {
        let cache_key = self
            .cache
            .as_ref()
            .map(|_| self.options.cache_key_for(&key));

        let mut state = self.state.lock();

        // Checked under the lock, so that a request can't slip into the
        // buffer after dispose has emptied it.
        if self.cancel.load().is_none() {
            return Err(LoadError::Disposed);
        }

        if let (Some(cache), Some(cache_key)) = (self.cache.as_ref(), cache_key.as_ref()) {
            if let Some(pending) = cache.try_get(cache_key) {
                trace!(?cache_key, "cache hit");
                drop(state);
                self.notify_buffered(&key);
                return Ok(pending);
            }
        }

        if !self.options.batching_enabled {
            let request = BufferedRequest::new(key.clone(), cache_key);
            let pending = request.pending.clone();
            self.cache_pending(&request);
            pending.set_driver(self.batch_driver(vec![request.downgrade()]));

            drop(state);
            self.notify_buffered(&key);
            return Ok(pending);
        }

        let (pending, enqueued) = state.buffer.enqueue(key.clone(), cache_key.clone());
        trace!(?enqueued, buffered = state.buffer.len(), "request buffered");

        if enqueued != Enqueued::Attached {
            if let (Some(cache), Some(cache_key)) = (self.cache.as_ref(), cache_key) {
                cache.try_add(cache_key, pending.clone());
            }

            if self.options.auto_dispatch {
                let cycle = state.cycle;
                let timer = state
                    .timer
                    .get_or_insert_with(|| self.start_timer(cycle));
                pending.set_driver(timer.driver.clone());
            }
        }

        drop(state);
        self.notify_buffered(&key);
        Ok(pending)
    }

    fn cache_pending(&self, request: &BufferedRequest<K, V, E>) {
        if let (Some(cache), Some(cache_key)) = (self.cache.as_ref(), request.cache_key.as_ref()) {
            cache.try_add(cache_key.clone(), request.pending.clone());
        }
    }

    fn notify_buffered(&self, key: &K) {
        for listener in self.listeners.load().iter() {
            listener(key);
        }
    }

    /// Start the auto-dispatch delay for the current buffering cycle. Once
    /// the delay elapses, the cycle is flushed, unless it was already
    /// flushed by a manual dispatch (which also interrupts the delay).
    fn start_timer(self: &Arc<Self>, cycle: u64) -> Timer {
        let (interrupt, interrupted) = oneshot::channel::<()>();
        let delay = Delay::new(self.options.batch_delay);
        let inner = Arc::downgrade(self);

        let driver = async move {
            if let Either::Right(_) = future::select(delay, interrupted).await {
                trace!(cycle, "auto dispatch interrupted");
                return;
            }

            if let Some(inner) = inner.upgrade() {
                inner.flush(Some(cycle)).await;
            }
        }
        .boxed()
        .shared();

        Timer {
            _interrupt: interrupt,
            driver,
        }
    }

    /// A driver that fetches `requests`. It holds them weakly: a request
    /// whose promise has been dropped by everyone is skipped. If the loader
    /// is gone by the time the driver runs, the requests fail.
    fn batch_driver(self: &Arc<Self>, requests: Vec<WeakRequest<K, V, E>>) -> Driver {
        let inner: Weak<Self> = Arc::downgrade(self);

        async move {
            let requests: Vec<BufferedRequest<K, V, E>> =
                requests.into_iter().filter_map(WeakRequest::upgrade).collect();

            match inner.upgrade() {
                Some(inner) => inner.execute(requests).await,
                None => {
                    for request in requests {
                        request.pending.complete(Err(LoadError::Disposed));
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Flush the buffer. With a cycle, only flush if that cycle is still
    /// buffering.
    ///
    /// The flushed requests are handed to a new driver before the buffer
    /// lock is released, so that whoever waits on them keeps driving the
    /// batch even if this future is dropped.
    async fn flush(self: &Arc<Self>, cycle: Option<u64>) {
        let driver = {
            let mut state = self.state.lock();

            if cycle.map_or(false, |cycle| cycle != state.cycle) {
                return;
            }

            // Dropping the timer interrupts the delay
            state.timer = None;

            if state.buffer.is_empty() {
                return;
            }

            let requests = state.buffer.take();
            debug!(
                cycle = state.cycle,
                keys = requests.len(),
                waiters = requests.iter().map(|request| request.waiters).sum::<usize>(),
                "dispatching"
            );
            state.cycle += 1;

            let driver =
                self.batch_driver(requests.iter().map(BufferedRequest::downgrade).collect());
            for request in &requests {
                request.pending.set_driver(driver.clone());
            }

            driver
        };

        driver.await
    }

    async fn execute(&self, requests: Vec<BufferedRequest<K, V, E>>) {
        let cancel = match self.cancel.load_full() {
            Some(source) => source.signal(),
            None => {
                for request in requests {
                    request.fail(self.cache.as_ref(), LoadError::Disposed);
                }
                return;
            }
        };

        let executor = Executor {
            fetch: &self.fetch,
            cache: self.cache.as_ref(),
            cancel,
            chunk_size: self.options.chunk_size(),
        };

        executor.run(requests).await
    }
}

impl<K: Eq + Hash, V, E, F> Inner<K, V, E, F> {
    fn dispose(&self) {
        let Some(source) = self.cancel.swap(None) else {
            return;
        };

        debug!("disposing loader");
        source.cancel();

        let (requests, timer) = {
            let mut state = self.state.lock();
            state.cycle += 1;
            (state.buffer.take(), state.timer.take())
        };
        drop(timer);

        for request in requests {
            request.pending.complete(Err(LoadError::Disposed));
        }

        if let Some(cache) = self.cache.as_ref() {
            cache.clear();
        }
    }
}
