//! Keyloader is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It collects many independent requests for individual
//! keys, fetches them with as few calls as possible to a batch function, and
//! hands each requester its own value, without the requester knowing anything
//! about the batching. Requests for the same key are merged, and results can
//! be cached so that later requests don't fetch at all. The common use case
//! is resolving the fields of a graph-shaped query, where sibling fields
//! would otherwise each make their own call to a database or an API.
//!
//! ## Overview
//!
//! A loader is built around a fetch function. It's called with a list of
//! unique keys and a [`CancelSignal`], and returns one result per key, in the
//! same order as the keys. Each key can fail on its own; an error for the
//! whole call fails every key of that call.
//!
//! ```
//! use keyloader::CancelSignal;
//!
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     age: u16,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum ApiError {
//!     NotFound,
//!     Unavailable,
//! }
//!
//! async fn get_users(
//!     usernames: Vec<String>,
//!     _cancel: CancelSignal,
//! ) -> Result<Vec<Result<UserData, ApiError>>, ApiError> {
//!     Ok(usernames
//!         .into_iter()
//!         .map(|username| match username.as_str() {
//!             "nobody" => Err(ApiError::NotFound),
//!             _ => Ok(UserData { username, age: 30 }),
//!         })
//!         .collect())
//! }
//! ```
//!
//! Any `Fn(Vec<K>, CancelSignal) -> impl Future` works as a fetch function;
//! see [`Fetch`] for the full contract.
//!
//! Once you have a fetch function, create a [`Loader`] for it. A loader is
//! meant to live for one logical scope (typically, one incoming request). It
//! can be shared by reference, so that many independent async tasks (even on
//! different threads) have their individual key lookups batched together.
//!
//! Each call to [`load`] registers a key and returns a future for its value.
//! By default, registered keys are buffered until [`dispatch`] is called:
//!
//! ```
//! # use keyloader::CancelSignal;
//! # #[derive(Debug, Clone)] struct UserData { username: String, age: u16 }
//! # #[derive(Debug, Clone)] enum ApiError { NotFound }
//! # async fn get_users(usernames: Vec<String>, _cancel: CancelSignal) ->
//! #     Result<Vec<Result<UserData, ApiError>>, ApiError> {
//! #     Ok(usernames.into_iter().map(|username| Ok(UserData { username, age: 30 })).collect())
//! # }
//! use futures::executor::block_on;
//! use keyloader::Loader;
//!
//! let loader = Loader::new(get_users);
//!
//! let alice = loader.load("alice".to_owned());
//! let bob = loader.load("bob".to_owned());
//! let alice_again = loader.load("alice".to_owned());
//! assert_eq!(loader.buffered_requests(), 2);
//!
//! // One call to get_users, with both usernames
//! let ((), alice, bob, alice_again) = block_on(async {
//!     futures::join!(loader.dispatch(), alice, bob, alice_again)
//! });
//!
//! assert_eq!(alice.unwrap().username, "alice");
//! assert_eq!(bob.unwrap().username, "bob");
//! assert_eq!(alice_again.unwrap().username, "alice");
//!
//! // Cached from now on
//! assert_eq!(loader.cached_values(), 2);
//! ```
//!
//! When requests are dispatched, and whether their results are cached, is
//! configured with [`LoaderOptions`]:
//!
//! ```
//! # use keyloader::CancelSignal;
//! # async fn lengths(keys: Vec<String>, _cancel: CancelSignal) ->
//! #     Result<Vec<Result<usize, ()>>, ()> { Ok(keys.iter().map(|key| Ok(key.len())).collect()) }
//! use std::time::Duration;
//! use keyloader::{Loader, LoaderOptions};
//!
//! let options = LoaderOptions::default()
//!     .with_auto_dispatch(Duration::from_millis(5))
//!     .with_max_batch_size(100)
//!     .with_cache_capacity(500);
//!
//! let loader = Loader::with_options(lengths, options);
//!
//! // Dispatched by itself, 5ms after the first key was requested
//! let length = futures::executor::block_on(loader.load("hello".to_owned()));
//! assert_eq!(length, Ok(5));
//! ```
//!
//! ## Design notes
//!
//! ### Poll-driven design
//!
//! In keeping with Rust's polling async design, a loader never spawns
//! anything and doesn't depend on any runtime. The batch function is not
//! run in the background; it is driven in the foreground by the futures
//! waiting on its results (and by [`dispatch`], which drives the batch it
//! started). As long as one interested future is polled, the batch makes
//! progress, even if the others (or the caller of `dispatch`) are dropped.
//! The auto-dispatch delay is a [`futures_timer::Delay`], so it works on any
//! executor too.
//!
//! ### Promises
//!
//! Every buffered key gets a single [`Promise`], which is shared by every
//! request for that key and stored in the cache as is. Concurrent requests
//! for a key that's already being fetched wait on the same promise, rather
//! than fetching it again, and all of them observe the same result.
//!
//! ### Cache keys
//!
//! The cache stores [`CacheKey`]s rather than keys, so that a custom cache
//! key function can map keys of one type onto cache keys of another. Cache
//! keys remember the type they were made from: a `String` key and a `u64`
//! key never collide.
//!
//! [`load`]: Loader::load
//! [`dispatch`]: Loader::dispatch

mod buffer;
mod cache;
mod cancel;
mod dynamic;
mod error;
mod executor;
mod loader;
mod options;
mod promise;
mod wakerset;

pub use cache::{CacheKey, TaskCache};
pub use cancel::CancelSignal;
pub use dynamic::{AnyError, AnyKey, AnyValue, DynLoader};
pub use error::LoadError;
pub use executor::Fetch;
pub use loader::Loader;
pub use options::{CacheKeyFn, LoaderOptions};
pub use promise::{Promise, Wait};
