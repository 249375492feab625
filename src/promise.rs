//! A shared, single-assignment value that any number of futures can wait on.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::wakerset::{Token, WakerSet};

/// The shared work that will eventually complete a promise. Whoever is
/// waiting on the promise also polls the driver, so that the work makes
/// progress without being spawned anywhere.
pub(crate) type Driver = Shared<BoxFuture<'static, ()>>;

struct Slot<T> {
    value: Option<T>,
    wakers: WakerSet,
    driver: Option<Driver>,

    // Bumped every time a driver is attached, so that settling futures can
    // tell a new driver from one they've already run to completion.
    generation: u64,
}

/// A value that will be known later. All clones of a `Promise` share the
/// same slot: it can be completed exactly once, and every waiting party
/// observes a clone of that one value.
///
/// This is the unit stored in a loader's cache and request buffer, so
/// that concurrent requests for the same key share one computation.
pub struct Promise<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Debug> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Promise")
            .field("value", &slot.value)
            .field("waiters", &slot.wakers.len())
            .field("driven", &slot.driver.is_some())
            .finish()
    }
}

impl<T> Promise<T> {
    /// Complete this promise. Returns false (and drops `value`) if it was
    /// already completed. Every waiting future is awoken.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.value.is_some() {
            return false;
        }

        slot.value = Some(value);
        let wakers = mem::take(&mut slot.wakers);
        let driver = slot.driver.take();
        drop(slot);

        wakers.wake_all();

        // The driver may own the last reference to the batch that completed
        // us; drop it only once the slot is unlocked.
        drop(driver);
        true
    }

    pub fn is_completed(&self) -> bool {
        self.slot.lock().value.is_some()
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    /// Create a promise that hasn't been completed yet.
    pub fn new() -> Self {
        Self::from_slot(None)
    }

    /// Create a promise that is already completed with `value`.
    pub fn resolved(value: T) -> Self {
        Self::from_slot(Some(value))
    }

    fn from_slot(value: Option<T>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                value,
                wakers: WakerSet::default(),
                driver: None,
                generation: 0,
            })),
        }
    }

    /// Get a clone of the value, if the promise has been completed.
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Returns true if both promises share the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Wait for this promise to be completed. This only waits; it doesn't
    /// drive whatever work is meant to complete the promise.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            promise: self.clone(),
            token: None,
        }
    }

    /// Attach the work that will complete this promise, replacing whatever
    /// was attached before. Ignored once the promise is completed. Waiting
    /// futures are awoken, so that those settling the promise pick up the
    /// new driver.
    pub(crate) fn set_driver(&self, driver: Driver) {
        let mut slot = self.slot.lock();
        if slot.value.is_some() {
            return;
        }

        let previous = slot.driver.replace(driver);
        slot.generation += 1;
        let wakers = mem::take(&mut slot.wakers);
        drop(slot);

        wakers.wake_all();
        drop(previous);
    }

    #[cfg(test)]
    pub(crate) fn driver(&self) -> Option<Driver> {
        self.slot.lock().driver.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            slot: Arc::downgrade(&self.slot),
        }
    }

    /// Wait for the promise, driving its attached work in the meantime.
    pub(crate) fn settle(self) -> Settle<T> {
        Settle {
            promise: self,
            token: None,
            driver: None,
            generation: None,
        }
    }
}

/// A non-owning handle to a [`Promise`], held by drivers so that a batch
/// nobody is interested in anymore can be freed.
pub(crate) struct WeakPromise<T> {
    slot: Weak<Mutex<Slot<T>>>,
}

impl<T> WeakPromise<T> {
    pub(crate) fn upgrade(&self) -> Option<Promise<T>> {
        self.slot.upgrade().map(|slot| Promise { slot })
    }
}

/// Future returned by [`Promise::wait`].
pub struct Wait<T> {
    promise: Promise<T>,
    token: Option<Token>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<T> {
        let this = Pin::into_inner(self);
        let mut slot = this.promise.slot.lock();

        if let Some(value) = slot.value.as_ref() {
            let value = value.clone();
            if let Some(token) = this.token.take() {
                slot.wakers.discard_waker(&token);
            }
            return Poll::Ready(value);
        }

        match this.token {
            Some(ref token) => slot.wakers.replace_waker(token, ctx.waker()),
            None => this.token = Some(slot.wakers.add_waker(ctx.waker())),
        }

        Poll::Pending
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.promise.slot.lock().wakers.discard_waker(&token);
        }
    }
}

/// Future returned by [`Promise::settle`].
///
/// A driver can finish without completing the promise when its work was
/// handed over to a different driver (for instance, an auto-dispatch delay
/// interrupted by a manual dispatch). The new driver is picked up when it's
/// attached. A driver is run at most once per attachment; once it's done,
/// this only waits until a new one is attached or the promise completes.
pub(crate) struct Settle<T> {
    promise: Promise<T>,
    token: Option<Token>,
    driver: Option<Driver>,

    // Generation of the last driver picked up from the slot
    generation: Option<u64>,
}

impl<T: Clone> Future for Settle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<T> {
        let this = Pin::into_inner(self);

        loop {
            if let Some(driver) = this.driver.as_mut() {
                if Pin::new(driver).poll(ctx).is_ready() {
                    this.driver = None;
                }
            }

            let mut slot = this.promise.slot.lock();

            if let Some(value) = slot.value.as_ref() {
                let value = value.clone();
                if let Some(token) = this.token.take() {
                    slot.wakers.discard_waker(&token);
                }
                return Poll::Ready(value);
            }

            if this.generation != Some(slot.generation) {
                if let Some(driver) = slot.driver.as_ref() {
                    this.driver = Some(driver.clone());
                    this.generation = Some(slot.generation);
                    continue;
                }
            }

            match this.token {
                Some(ref token) => slot.wakers.replace_waker(token, ctx.waker()),
                None => this.token = Some(slot.wakers.add_waker(ctx.waker())),
            }

            return Poll::Pending;
        }
    }
}

impl<T> Drop for Settle<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.promise.slot.lock().wakers.discard_waker(&token);
        }
    }
}
