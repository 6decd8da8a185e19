use std::{
    collections::HashSet,
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    Signal, Subscription,
    utils::{OnDrop, new_activity_id},
};

/// Opaque identity of one tracked operation, minted when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(u64);

/// Marks one operation as in flight for as long as it's alive.
///
/// Dropping it is the operation's terminal event, whether it succeeded, failed or was cancelled.
pub struct ActivityGuard {
    id: ActivityId,
    _on_finish: OnDrop<Box<dyn FnOnce() + Send + Sync>>,
}

impl Debug for ActivityGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityGuard").field("id", &self.id).finish()
    }
}

impl ActivityGuard {
    fn new(id: ActivityId, on_finish: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            _on_finish: OnDrop::new(Box::new(on_finish)),
        }
    }

    /// The identity of the tracked operation.
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Mark the operation finished, same as dropping the guard.
    pub fn finish(self) {}
}

/// Something that exposes whether operations are currently in flight as a boolean signal.
pub trait ActivityTracker: Clone + Send + Sync + 'static {
    /// Mark an operation as started, the returned guard finishes it.
    fn start(&self) -> ActivityGuard;

    /// Whether the tracker currently reports activity.
    fn is_active(&self) -> bool;

    /// The activity flag: the current value first, then every change.
    fn subscribe(&self) -> Subscription<bool>;
}

/// Wrap a future so `tracker` reports activity from its first poll until it resolves or is dropped.
///
/// The output of the future is passed through untouched.
pub fn track_activity<A, F>(tracker: &A, fut: F) -> impl Future<Output = F::Output> + use<A, F>
where
    A: ActivityTracker,
    F: Future,
{
    let tracker = tracker.clone();
    async move {
        let _guard = tracker.start();
        fut.await
    }
}

/// Tracks whether a single logical operation is in flight.
///
/// Starting sets the flag, any finish clears it. Overlapping operations should use
/// [`MultiActivityCounter`] instead, as here the first to finish clears the flag for all.
#[derive(Debug, Clone, Default)]
pub struct ActivityCounter {
    active: Signal<bool>,
}

impl ActivityCounter {
    /// A new counter, initially inactive.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`track_activity`].
    pub fn track<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> + use<F> {
        track_activity(self, fut)
    }
}

impl ActivityTracker for ActivityCounter {
    fn start(&self) -> ActivityGuard {
        let id = ActivityId(new_activity_id());
        self.active.set_if_changed(true);
        tracing::trace!(?id, "activity started");
        let active = self.active.clone();
        ActivityGuard::new(id, move || {
            active.set_if_changed(false);
            tracing::trace!(?id, "activity finished");
        })
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn subscribe(&self) -> Subscription<bool> {
        self.active.subscribe()
    }
}

/// Tracks a set of concurrently in-flight operations.
///
/// Active while the set of live operations is non-empty, so one operation finishing
/// doesn't clear the flag while siblings of the same kind are still running.
#[derive(Clone, Default)]
pub struct MultiActivityCounter {
    live: Arc<Mutex<HashSet<ActivityId>>>,
    active: Signal<bool>,
}

impl Debug for MultiActivityCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiActivityCounter")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl MultiActivityCounter {
    /// A new counter with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.live.lock().len()
    }

    /// See [`track_activity`].
    pub fn track<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> + use<F> {
        track_activity(self, fut)
    }
}

impl ActivityTracker for MultiActivityCounter {
    fn start(&self) -> ActivityGuard {
        let id = ActivityId(new_activity_id());
        {
            let mut live = self.live.lock();
            live.insert(id);
            // Flag only re-broadcast when emptiness changes:
            self.active.set_if_changed(!live.is_empty());
        }
        tracing::trace!(?id, "activity started");

        let live = self.live.clone();
        let active = self.active.clone();
        ActivityGuard::new(id, move || {
            let mut live = live.lock();
            live.remove(&id);
            active.set_if_changed(!live.is_empty());
            drop(live);
            tracing::trace!(?id, "activity finished");
        })
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn subscribe(&self) -> Subscription<bool> {
        self.active.subscribe()
    }
}
