//! A weakly typed view of a [`Loader`], for callers that only know their keys
//! and values at runtime.

use std::{
    any::{self, Any},
    error::Error,
    hash::Hash,
    sync::Arc,
};

use futures::future::{self, BoxFuture, FutureExt};

use crate::{error::LoadError, executor::Fetch, loader::Loader};

pub type AnyKey = Box<dyn Any + Send>;
pub type AnyValue = Arc<dyn Any + Send + Sync>;
pub type AnyError = Arc<dyn Error + Send + Sync>;

/// The loader interface with keys, values and errors erased. Every method
/// forwards to the typed [`Loader`]; a key or value of the wrong type fails
/// with [`LoadError::InvalidArgument`].
pub trait DynLoader: Send + Sync {
    fn load_any(&self, key: AnyKey) -> BoxFuture<'static, Result<AnyValue, LoadError<AnyError>>>;

    fn load_many_any(
        &self,
        keys: Vec<AnyKey>,
    ) -> BoxFuture<'static, Result<Vec<AnyValue>, LoadError<AnyError>>>;

    fn dispatch_any(&self) -> BoxFuture<'_, ()>;

    fn set_any(&self, key: AnyKey, value: AnyValue) -> Result<(), LoadError<AnyError>>;

    fn remove_any(&self, key: AnyKey) -> Result<(), LoadError<AnyError>>;

    fn clear_any(&self);

    fn buffered_requests_any(&self) -> usize;

    fn cached_values_any(&self) -> usize;
}

fn downcast_key<K: 'static>(key: AnyKey) -> Result<K, LoadError<AnyError>> {
    key.downcast::<K>().map(|key| *key).map_err(|_| {
        LoadError::InvalidArgument(format!("expected a key of type {}", any::type_name::<K>()))
    })
}

fn erase<V, E>(result: Result<V, LoadError<E>>) -> Result<AnyValue, LoadError<AnyError>>
where
    V: Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
{
    result
        .map(|value| Arc::new(value) as AnyValue)
        .map_err(|err| err.map_fetch(|err| Arc::new(err) as AnyError))
}

impl<K, V, E, F> DynLoader for Loader<K, V, E, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Error + Clone + Send + Sync + 'static,
    F: Fetch<K, V, E> + 'static,
{
    fn load_any(&self, key: AnyKey) -> BoxFuture<'static, Result<AnyValue, LoadError<AnyError>>> {
        match downcast_key::<K>(key) {
            Ok(key) => self.load(key).map(erase).boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn load_many_any(
        &self,
        keys: Vec<AnyKey>,
    ) -> BoxFuture<'static, Result<Vec<AnyValue>, LoadError<AnyError>>> {
        let keys = match keys
            .into_iter()
            .map(downcast_key::<K>)
            .collect::<Result<Vec<K>, _>>()
        {
            Ok(keys) => keys,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        self.load_many_results(keys)
            .map(|results| results.into_iter().map(erase).collect::<Result<Vec<_>, _>>())
            .boxed()
    }

    fn dispatch_any(&self) -> BoxFuture<'_, ()> {
        self.dispatch().boxed()
    }

    fn set_any(&self, key: AnyKey, value: AnyValue) -> Result<(), LoadError<AnyError>> {
        let key = downcast_key::<K>(key)?;
        let value = value.downcast::<V>().map_err(|_| {
            LoadError::InvalidArgument(format!(
                "expected a value of type {}",
                any::type_name::<V>()
            ))
        })?;

        self.set(key, V::clone(&value));
        Ok(())
    }

    fn remove_any(&self, key: AnyKey) -> Result<(), LoadError<AnyError>> {
        let key = downcast_key::<K>(key)?;
        self.remove(&key);
        Ok(())
    }

    fn clear_any(&self) {
        self.clear()
    }

    fn buffered_requests_any(&self) -> usize {
        self.buffered_requests()
    }

    fn cached_values_any(&self) -> usize {
        self.cached_values()
    }
}

#[cfg(test)]
mod tests {
    use super::{AnyKey, AnyValue, DynLoader};
    use crate::{CancelSignal, LoadError, Loader};
    use futures::executor;
    use std::{fmt, sync::Arc};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Missing(u32);

    impl fmt::Display for Missing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} is missing", self.0)
        }
    }

    impl std::error::Error for Missing {}

    async fn names(
        keys: Vec<u32>,
        _: CancelSignal,
    ) -> Result<Vec<Result<String, Missing>>, Missing> {
        Ok(keys
            .into_iter()
            .map(|key| match key {
                0 => Err(Missing(0)),
                key => Ok(format!("#{}", key)),
            })
            .collect())
    }

    fn key(key: u32) -> AnyKey {
        Box::new(key)
    }

    #[test]
    fn loads_through_the_erased_interface() {
        let loader: Arc<dyn DynLoader> = Arc::new(Loader::new(names));

        let values = executor::block_on(async {
            let load = loader.load_many_any(vec![key(2), key(1)]);
            assert_eq!(loader.buffered_requests_any(), 2);
            let ((), values) = futures::join!(loader.dispatch_any(), load);
            values
        })
        .unwrap();

        let values: Vec<&String> = values
            .iter()
            .map(|value| value.downcast_ref::<String>().unwrap())
            .collect();
        assert_eq!(values, ["#2", "#1"]);
        assert_eq!(loader.cached_values_any(), 2);
    }

    #[test]
    fn wrong_key_type_is_an_invalid_argument() {
        let loader = Loader::new(names);

        let result = executor::block_on(loader.load_any(Box::new("one")));
        assert!(matches!(result, Err(LoadError::InvalidArgument(_))));
        assert_eq!(loader.buffered_requests_any(), 0);

        let value: AnyValue = Arc::new(1u8);
        assert!(matches!(
            loader.set_any(key(1), value),
            Err(LoadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn set_and_fetch_errors_pass_through() {
        let loader = Loader::new(names);

        loader
            .set_any(key(5), Arc::new(String::from("five")))
            .unwrap();
        let value = executor::block_on(loader.load_any(key(5))).unwrap();
        assert_eq!(value.downcast_ref::<String>().unwrap(), "five");

        let result = executor::block_on(async {
            let load = loader.load_any(key(0));
            let ((), result) = futures::join!(loader.dispatch_any(), load);
            result
        });

        match result {
            Err(LoadError::Fetch(err)) => assert_eq!(err.to_string(), "0 is missing"),
            Err(err) => panic!("unexpected error: {}", err),
            Ok(_) => panic!("expected an error"),
        }
    }
}
