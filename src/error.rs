use thiserror::Error;

/// The reason a single key could not be loaded.
///
/// Every waiter of a key observes a clone of the same `LoadError`, which is
/// why the fetch function's error type must be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The fetch function failed, either for this key specifically or for
    /// the whole chunk the key was fetched in. The error is passed through
    /// unchanged.
    #[error("fetch failed: {0}")]
    Fetch(E),

    /// The fetch function returned a different number of results than the
    /// number of keys it was given. Every key of the affected chunk fails
    /// with this error.
    #[error("keys and values count mismatch: expected {expected} values, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    /// The fetch was in flight when the loader was disposed.
    #[error("the fetch was cancelled")]
    Cancelled,

    /// The request was still buffered when the loader was disposed, or was
    /// issued after disposal.
    #[error("the loader has been disposed")]
    Disposed,

    /// A caller passed an argument the loader can't use. Only raised by the
    /// weakly typed adapter, which can be handed keys and values of the
    /// wrong type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl<E> LoadError<E> {
    /// Convert the fetch error, leaving every other variant untouched.
    pub fn map_fetch<F>(self, op: impl FnOnce(E) -> F) -> LoadError<F> {
        match self {
            LoadError::Fetch(err) => LoadError::Fetch(op(err)),
            LoadError::CountMismatch { expected, actual } => {
                LoadError::CountMismatch { expected, actual }
            }
            LoadError::Cancelled => LoadError::Cancelled,
            LoadError::Disposed => LoadError::Disposed,
            LoadError::InvalidArgument(message) => LoadError::InvalidArgument(message),
        }
    }

    /// Get the fetch function's error, if that's what this is.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}
