//! These tests ensure that buffered requests are dispatched at the right
//! time for each dispatch mode, and that the batch keeps going no matter
//! which of the interested futures are dropped.

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{executor, future, FutureExt};
use futures_timer::Delay;
use keyloader::{CancelSignal, Loader, LoaderOptions};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::Context,
    thread,
    time::{Duration, Instant},
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

type Calls = Arc<Mutex<Vec<Vec<u32>>>>;
type Values = Result<Vec<Result<u32, String>>, String>;

fn calls() -> Calls {
    Arc::new(Mutex::new(Vec::new()))
}

fn increment(
    calls: &Calls,
) -> impl Fn(Vec<u32>, CancelSignal) -> future::Ready<Values> + Send + Sync + 'static {
    let calls = Arc::clone(calls);

    move |keys, _cancel| {
        calls.lock().push(keys.clone());
        future::ready(Ok(keys.into_iter().map(|key| Ok(key + 1)).collect()))
    }
}

/// Like increment, but takes a little while to answer.
fn slow_increment(
    calls: &Calls,
) -> impl Fn(Vec<u32>, CancelSignal) -> future::BoxFuture<'static, Values> + Send + Sync + 'static {
    let calls = Arc::clone(calls);

    move |keys, _cancel| {
        calls.lock().push(keys.clone());

        async move {
            Delay::new(Duration::from_millis(10)).await;
            let values: Values = Ok(keys.into_iter().map(|key| Ok(key + 1)).collect());
            values
        }
        .boxed()
    }
}

#[test]
fn manual_dispatch_is_required_by_default() {
    let calls = calls();
    let loader = Loader::new(increment(&calls));

    let mut value = Box::pin(loader.load(1));
    assert!(value.as_mut().now_or_never().is_none());
    assert_eq!(loader.buffered_requests(), 1);
    assert!(calls.lock().is_empty());

    executor::block_on(loader.dispatch());

    assert_eq!(loader.buffered_requests(), 0);
    assert_eq!(executor::block_on(value), Ok(2));
}

#[test]
fn dispatching_nothing_does_nothing() {
    let calls = calls();
    let loader = Loader::new(increment(&calls));

    executor::block_on(loader.dispatch());
    assert!(calls.lock().is_empty());
}

#[test]
fn loads_during_a_dispatch_start_a_new_cycle() {
    let calls = calls();
    let loader = Loader::new(slow_increment(&calls));

    let waker = NoOpWaker.into_waker();
    let mut cx = Context::from_waker(&waker);

    let first = loader.load(1);
    let mut dispatch = Box::pin(loader.dispatch());
    assert!(dispatch.as_mut().poll(&mut cx).is_pending());

    // The first batch is in flight; this one waits for the next dispatch
    let second = loader.load(2);
    assert_eq!(loader.buffered_requests(), 1);

    let ((), first) = executor::block_on(async { futures::join!(dispatch, first) });
    assert_eq!(first, Ok(2));

    let ((), second) = executor::block_on(async { futures::join!(loader.dispatch(), second) });
    assert_eq!(second, Ok(3));

    assert_eq!(*calls.lock(), [vec![1], vec![2]]);
}

#[test]
fn batch_completes_after_dispatch_is_dropped() {
    let calls = calls();
    let loader = Loader::new(slow_increment(&calls));

    let waker = NoOpWaker.into_waker();
    let mut cx = Context::from_waker(&waker);

    let value = loader.load(1);
    let mut dispatch = Box::pin(loader.dispatch());
    assert!(dispatch.as_mut().poll(&mut cx).is_pending());
    drop(dispatch);

    // Waiting on the value drives the batch from here
    assert_eq!(executor::block_on(value), Ok(2));
    assert_eq!(calls.lock().len(), 1);
}

#[test]
fn dropped_waiters_dont_affect_the_others() {
    let calls = calls();
    let loader = Loader::new(increment(&calls));

    let first = loader.load(5);
    let second = loader.load(5);
    drop(first);

    let ((), second) = executor::block_on(async { futures::join!(loader.dispatch(), second) });
    assert_eq!(second, Ok(6));
}

#[test]
fn unbatched_loads_resolve_immediately() {
    let calls = calls();
    let loader =
        Loader::with_options(increment(&calls), LoaderOptions::default().without_batching());

    let first = loader.load(1);
    assert_eq!(loader.buffered_requests(), 0);
    assert_eq!(first.now_or_never(), Some(Ok(2)));

    let second = loader.load(2);
    assert_eq!(executor::block_on(second), Ok(3));

    // Cached like any other value
    assert_eq!(loader.load(1).now_or_never(), Some(Ok(2)));
    assert_eq!(*calls.lock(), [vec![1], vec![2]]);
}

#[test]
fn unbatched_loads_fetch_one_key_at_a_time() {
    let calls = calls();
    let loader = Loader::with_options(
        increment(&calls),
        LoaderOptions::default().without_batching().without_caching(),
    );

    let values = executor::block_on(loader.load_many(vec![3, 1, 3]));

    assert_eq!(values, Ok(vec![4, 2, 4]));
    assert_eq!(*calls.lock(), [vec![3], vec![1], vec![3]]);
}

#[test]
fn auto_dispatch_runs_after_the_delay() {
    let calls = calls();
    let loader = Loader::with_options(
        increment(&calls),
        LoaderOptions::default().with_auto_dispatch(Duration::from_millis(20)),
    );

    let first = loader.load(1);
    let second = loader.load(2);
    assert_eq!(loader.buffered_requests(), 2);

    // Only waiting on the second value is enough to dispatch both
    assert_eq!(executor::block_on(second), Ok(3));
    assert_eq!(first.now_or_never(), Some(Ok(2)));

    assert_eq!(*calls.lock(), [vec![1, 2]]);
}

#[test]
fn auto_dispatch_cycles_restart() {
    let calls = calls();
    let loader = Loader::with_options(
        increment(&calls),
        LoaderOptions::default().with_auto_dispatch(Duration::from_millis(5)),
    );

    assert_eq!(executor::block_on(loader.load(1)), Ok(2));
    assert_eq!(executor::block_on(loader.load(2)), Ok(3));
    assert_eq!(*calls.lock(), [vec![1], vec![2]]);
}

#[test]
fn manual_dispatch_interrupts_auto_dispatch() {
    let calls = calls();
    let loader = Loader::with_options(
        increment(&calls),
        LoaderOptions::default().with_auto_dispatch(Duration::from_secs(60)),
    );

    let start = Instant::now();

    let values = loader.load_many(vec![1, 2]);
    let ((), values) = executor::block_on(async { futures::join!(loader.dispatch(), values) });

    assert_eq!(values, Ok(vec![2, 3]));
    assert!(start.elapsed() < Duration::from_secs(30));

    // The interrupted delay doesn't flush the next cycle early
    let mut next = Box::pin(loader.load(3));
    assert!(next.as_mut().now_or_never().is_none());
    assert_eq!(loader.buffered_requests(), 1);

    let ((), next) = executor::block_on(async { futures::join!(loader.dispatch(), next) });
    assert_eq!(next, Ok(4));
    assert_eq!(*calls.lock(), [vec![1, 2], vec![3]]);
}

#[test]
fn manual_dispatch_releases_threads_waiting_on_auto_dispatch() {
    let calls = calls();
    let loader = Loader::with_options(
        increment(&calls),
        LoaderOptions::default().with_auto_dispatch(Duration::from_secs(60)),
    );

    let buffered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&buffered);
    loader.on_request_buffered(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let start = Instant::now();

    let results: Vec<_> = crossbeam::scope(|scope| {
        // Every thread waits on the delay until the manual dispatch below
        let handles: Vec<_> = (1..=6)
            .map(|key| {
                let loader = &loader;
                scope.spawn(move |_| executor::block_on(loader.load(key)))
            })
            .collect();

        while buffered.load(Ordering::SeqCst) < 6 {
            thread::yield_now();
        }

        executor::block_on(loader.dispatch());

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap();

    assert_eq!(results, [Ok(2), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)]);
    assert!(start.elapsed() < Duration::from_secs(30));

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);

    let mut keys = calls[0].clone();
    keys.sort_unstable();
    assert_eq!(keys, [1, 2, 3, 4, 5, 6]);
}
