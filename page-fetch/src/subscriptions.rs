use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::{
    FutureExt, Stream, StreamExt,
    channel::mpsc,
    future,
    stream::{self, BoxStream, FusedStream},
};
use parking_lot::Mutex;

use crate::utils::{OnDrop, new_subscription_id};

type Unsubscribe = OnDrop<Box<dyn FnOnce() + Send + Sync>>;

/// A stream of values pushed by a [`Signal`] or an [`Emitter`].
///
/// The subscriber is unregistered when the stream is dropped.
/// The stream ends once the source it was created from is dropped.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _unsubscribe: Unsubscribe,
}

impl<T> Debug for Subscription<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl<T> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool {
        self.rx.is_terminated()
    }
}

impl<T> Subscription<T> {
    /// Take every value that has already been delivered, without waiting.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut values = vec![];
        while let Some(Some(value)) = self.rx.next().now_or_never() {
            values.push(value);
        }
        values
    }
}

struct Subs<T> {
    senders: HashMap<u64, mpsc::UnboundedSender<T>>,
}

impl<T> Default for Subs<T> {
    fn default() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }
}

impl<T: Clone> Subs<T> {
    fn register(&mut self, initial: Option<T>) -> (u64, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded();
        if let Some(initial) = initial {
            // Receiver is alive, can't fail:
            let _ = tx.unbounded_send(initial);
        }
        let sub_id = new_subscription_id();
        self.senders.insert(sub_id, tx);
        (sub_id, rx)
    }

    fn notify(&mut self, value: &T) {
        // Receivers normally unregister on drop, this also catches ones leaked with mem::forget:
        self.senders
            .retain(|_, tx| tx.unbounded_send(value.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.senders.len()
    }
}

fn unsubscribe_on_drop<X>(
    inner: &Arc<Mutex<X>>,
    sub_id: u64,
    subs_of: fn(&mut X, u64),
) -> Unsubscribe
where
    X: Send + 'static,
{
    let weak: Weak<Mutex<X>> = Arc::downgrade(inner);
    OnDrop::new(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            subs_of(&mut inner.lock(), sub_id);
        }
    }))
}

struct SignalInner<T> {
    value: T,
    subs: Subs<T>,
}

/// A lock-protected current value that pushes every change to its subscribers.
///
/// Cloning gives another handle to the same value.
pub struct Signal<T> {
    inner: Arc<Mutex<SignalInner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Debug> Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Signal")
            .field("value", &inner.value)
            .field("subscribers", &inner.subs.senders.len())
            .finish()
    }
}

impl<T: Default + Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + 'static,
{
    /// Create a new signal holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SignalInner {
                value,
                subs: Subs::default(),
            })),
        }
    }

    /// A clone of the current value.
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().value)
    }

    /// Replace the value and notify subscribers, even if the value didn't change.
    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Read-modify-write the value under the lock, then notify subscribers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let result = f(&mut inner.value);
        inner.subs.notify(&inner.value);
        result
    }

    /// Subscribe to the signal, the stream yields the current value first, then every change.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut inner = self.inner.lock();
        let initial = inner.value.clone();
        let (sub_id, rx) = inner.subs.register(Some(initial));
        drop(inner);
        Subscription {
            rx,
            _unsubscribe: unsubscribe_on_drop(&self.inner, sub_id, |inner, sub_id| {
                inner.subs.senders.remove(&sub_id);
            }),
        }
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subs.len()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Replace the value, only notifying subscribers when it differs from the current one.
    ///
    /// Returns whether the value changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.value == value {
            return false;
        }
        inner.value = value;
        let inner = &mut *inner;
        inner.subs.notify(&inner.value);
        true
    }
}

/// Fan-out of pushed values to every current subscriber, nothing is replayed to late subscribers.
pub struct Emitter<T> {
    inner: Arc<Mutex<Subs<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Emitter<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("subscribers", &self.inner.lock().senders.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T>
where
    T: Clone + Send + 'static,
{
    /// Create an emitter with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subs::default())),
        }
    }

    /// Push a value to every current subscriber.
    pub fn emit(&self, value: T) {
        self.inner.lock().notify(&value);
    }

    /// Subscribe to values emitted from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (sub_id, rx) = self.inner.lock().register(None);
        Subscription {
            rx,
            _unsubscribe: unsubscribe_on_drop(&self.inner, sub_id, |subs, sub_id| {
                subs.senders.remove(&sub_id);
            }),
        }
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Combine the latest value of each source, emitting once every source has produced a value.
pub(crate) fn combine_latest<T>(sources: Vec<Subscription<T>>) -> BoxStream<'static, Vec<T>>
where
    T: Clone + Send + 'static,
{
    let len = sources.len();
    stream::select_all(
        sources
            .into_iter()
            .enumerate()
            .map(|(idx, sub)| sub.map(move |value| (idx, value))),
    )
    .scan(vec![None; len], |latest, (idx, value)| {
        latest[idx] = Some(value);
        let snapshot = latest.iter().cloned().collect::<Option<Vec<T>>>();
        future::ready(Some(snapshot))
    })
    .filter_map(future::ready)
    .boxed()
}

/// Suppress consecutive duplicates.
pub(crate) fn distinct_until_changed<S>(source: S) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Clone + PartialEq + Send,
{
    let mut last = None;
    source
        .filter(move |value| {
            let changed = last.as_ref() != Some(value);
            if changed {
                last = Some(value.clone());
            }
            future::ready(changed)
        })
        .boxed()
}
