use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared value. Every party waiting on a [`Promise`] owns one
/// entry in its WakerSet; when the promise is completed, the whole set is
/// taken out and every waker is awoken.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a waiting future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset, when the future is dropped.
///
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular future.
///
/// [`Promise`]: crate::promise::Promise
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. When the future is re-polled, replace_waker
    /// should be used with this token.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: &Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker.clone());
        token
    }

    /// Set a waker with an existing token in this set. If the token is
    /// unknown (because the set was drained by a completion in between
    /// polls), the waker is added back under the same token. The waker is
    /// passed by reference and is set with clone_from because we assume that
    /// it comes from a Context and will need to be cloned anyway.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    existing.clone_from(waker)
                }
            }
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set. No-op if the token isn't present.
    pub(crate) fn discard_waker(&mut self, token: &Token) {
        self.wakers.remove(token);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Wake every waker in the set, consuming it. This should be called after
    /// the lock protecting the set has been released, so that awoken tasks
    /// don't immediately contend on it.
    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
