use crate::promise::{Promise, Wait};

/// The owning side of a cancellation signal. A loader holds one of these for
/// its whole lifetime and fires it when it's disposed.
#[derive(Debug, Default)]
pub(crate) struct CancelSource {
    fired: Promise<()>,
}

impl CancelSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) -> CancelSignal {
        CancelSignal {
            fired: self.fired.clone(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.fired.complete(());
    }
}

/// Handed to the fetch function along with its keys. A fetch function that
/// supports early termination can check [`is_cancelled`] or race its work
/// against [`cancelled`]; the loader stops waiting for the fetch as soon as
/// the signal fires either way.
///
/// [`is_cancelled`]: CancelSignal::is_cancelled
/// [`cancelled`]: CancelSignal::cancelled
#[derive(Debug, Clone)]
pub struct CancelSignal {
    fired: Promise<()>,
}

impl CancelSignal {
    /// A signal that never fires. Useful for calling a fetch function
    /// outside of a loader.
    pub fn never() -> Self {
        CancelSignal {
            fired: Promise::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.is_completed()
    }

    /// A future that completes once the signal fires.
    pub fn cancelled(&self) -> Wait<()> {
        self.fired.wait()
    }
}
