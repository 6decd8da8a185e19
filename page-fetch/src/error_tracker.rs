use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::Arc,
};

use crate::{Emitter, Subscription};

/// An error raised by a tracked fetch.
///
/// Cheap to clone so it can be broadcast to every error subscriber.
#[derive(thiserror::Error)]
pub enum FetchError<E> {
    /// The fetch callback returned an error.
    #[error("{0}")]
    Callback(Arc<E>),
    /// The fetch callback panicked, the panic was caught and its message kept.
    #[error("fetch callback panicked: {0}")]
    Panicked(Arc<str>),
}

impl<E: Debug> Debug for FetchError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(err) => f.debug_tuple("Callback").field(err).finish(),
            Self::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
        }
    }
}

impl<E> Clone for FetchError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(err) => Self::Callback(err.clone()),
            Self::Panicked(msg) => Self::Panicked(msg.clone()),
        }
    }
}

impl<E> FetchError<E> {
    /// Wrap an error returned by a fetch callback.
    pub fn callback(err: E) -> Self {
        Self::Callback(Arc::new(err))
    }

    pub(crate) fn panicked(msg: impl Into<Arc<str>>) -> Self {
        Self::Panicked(msg.into())
    }

    /// The callback's own error, `None` for a caught panic.
    pub fn callback_error(&self) -> Option<&E> {
        match self {
            Self::Callback(err) => Some(err.as_ref()),
            Self::Panicked(_) => None,
        }
    }

    /// Whether this is a caught panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// A side-channel for errors raised by tracked operations.
///
/// Wrapping a fetch with [`ErrorTracker::track`] reports its error here while still handing
/// it back to the caller, which is expected to swallow it so the surrounding pipeline keeps running.
/// Subscribers of [`ErrorTracker::errors`] receive every reported error.
pub struct ErrorTracker<E> {
    emitter: Emitter<FetchError<E>>,
}

impl<E> Clone for ErrorTracker<E> {
    fn clone(&self) -> Self {
        Self {
            emitter: self.emitter.clone(),
        }
    }
}

impl<E> Debug for ErrorTracker<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("emitter", &self.emitter)
            .finish()
    }
}

impl<E> Default for ErrorTracker<E>
where
    E: Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ErrorTracker<E>
where
    E: Debug + Send + Sync + 'static,
{
    /// A tracker with no subscribers.
    pub fn new() -> Self {
        Self {
            emitter: Emitter::new(),
        }
    }

    /// Pass `fut` through, reporting its error to this tracker if it fails.
    pub fn track<T, F>(&self, fut: F) -> impl Future<Output = Result<T, FetchError<E>>> + use<T, F, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let tracker = self.clone();
        async move {
            fut.await.map_err(|err| {
                let err = FetchError::callback(err);
                tracker.report(err.clone());
                err
            })
        }
    }

    /// Manually feed an error to every subscriber.
    pub fn report(&self, err: FetchError<E>) {
        tracing::warn!(error = ?err, "fetch failed");
        self.emitter.emit(err);
    }

    /// Every error reported from now on.
    pub fn errors(&self) -> Subscription<FetchError<E>> {
        self.emitter.subscribe()
    }
}
