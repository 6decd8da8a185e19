use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use any_spawner::Executor;
use futures::{
    FutureExt, StreamExt,
    channel::mpsc,
    future::{AbortHandle, AbortRegistration, Abortable, BoxFuture},
    stream::{self, BoxStream, Fuse},
};
use tracing::Instrument;

use crate::{
    ActivityGuard, ErrorTracker, FetchError, FetchKind, events::EventLog, utils::panic_message,
};

/// A boxed fetch callback taking the trigger input.
pub type FetchFn<I, R, E> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// A boxed load-more callback taking the trigger input and the page number to fetch.
pub type LoadMoreFn<I, R, E> =
    Arc<dyn Fn(I, usize) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// A boxed item mapper.
pub type MapperFn<Item, M> = Arc<dyn Fn(Item) -> M + Send + Sync>;

// The callback itself is only invoked once the returned future is first polled inside the fetch task,
// so a callback panicking before it returns its future is caught there too.
pub(crate) fn boxed_fetch<I, R, E, F, Fut>(fetch: F) -> FetchFn<I, R, E>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    Arc::new(move |input| {
        let fetch = fetch.clone();
        async move { fetch(input).await }.boxed()
    })
}

pub(crate) fn boxed_load_more<I, R, E, F, Fut>(fetch: F) -> LoadMoreFn<I, R, E>
where
    I: Send + 'static,
    F: Fn(I, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    Arc::new(move |input, page| {
        let fetch = fetch.clone();
        async move { fetch(input, page).await }.boxed()
    })
}

fn report_panic<E>(
    error_tracker: &ErrorTracker<E>,
    panic: Box<dyn std::any::Any + Send>,
) -> FetchError<E>
where
    E: std::fmt::Debug + Send + Sync + 'static,
{
    let err = FetchError::panicked(panic_message(panic.as_ref()));
    error_tracker.report(err.clone());
    err
}

/// Run a synchronous step of the driver (e.g. the mapper), a panic is reported to `error_tracker`
/// instead of unwinding through the driver.
pub(crate) fn catch_panic<T, E>(
    error_tracker: &ErrorTracker<E>,
    f: impl FnOnce() -> T,
) -> Result<T, FetchError<E>>
where
    E: std::fmt::Debug + Send + Sync + 'static,
{
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| report_panic(error_tracker, panic))
}

/// The switch-to-latest state of one dispatch path.
///
/// Every dispatch bumps the generation and cancels the predecessor,
/// a completion is only applied when its generation is still the current one.
#[derive(Debug, Default)]
pub(crate) struct LatestSlot {
    generation: u64,
    in_flight: Option<AbortHandle>,
}

impl LatestSlot {
    pub fn begin(&mut self) -> (u64, AbortRegistration) {
        self.cancel();
        let (handle, registration) = AbortHandle::new_pair();
        self.in_flight = Some(handle);
        (self.generation, registration)
    }

    /// Abort anything in flight and invalidate completions already queued.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn finish(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.in_flight = None;
        }
    }

    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

impl Drop for LatestSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

/// A fetch result on its way back to the driver.
///
/// The activity guard travels with it so the flag only clears once the driver has applied the result.
pub(crate) struct Completion<R, E> {
    pub kind: FetchKind,
    pub generation: u64,
    pub result: Result<R, FetchError<E>>,
    pub elapsed_ms: i64,
    pub guard: ActivityGuard,
}

pub(crate) struct FetchTask<R, E> {
    pub kind: FetchKind,
    pub generation: u64,
    pub registration: AbortRegistration,
    pub guard: ActivityGuard,
    pub fetch: BoxFuture<'static, Result<R, E>>,
}

/// Run the fetch on the executor, errors and caught panics are reported to `error_tracker`.
pub(crate) fn spawn_fetch<R, E>(
    task: FetchTask<R, E>,
    error_tracker: ErrorTracker<E>,
    completions: mpsc::UnboundedSender<Completion<R, E>>,
) where
    R: Send + 'static,
    E: std::fmt::Debug + Send + Sync + 'static,
{
    let FetchTask {
        kind,
        generation,
        registration,
        guard,
        fetch,
    } = task;
    let span = tracing::debug_span!("fetch", %kind, generation);
    Executor::spawn(
        async move {
            let started_at = Instant::now();
            let tracked = AssertUnwindSafe(error_tracker.track(fetch)).catch_unwind();
            let result = match Abortable::new(tracked, registration).await {
                Err(_aborted) => {
                    tracing::debug!("fetch cancelled, superseded or orchestrator dropped");
                    return;
                }
                Ok(Err(panic)) => Err(report_panic(&error_tracker, panic)),
                Ok(Ok(result)) => result,
            };
            let elapsed_ms = i64::try_from(started_at.elapsed().as_millis()).unwrap_or(i64::MAX);
            // Closed when the orchestrator was dropped, nothing left to apply to:
            let _ = completions.unbounded_send(Completion {
                kind,
                generation,
                result,
                elapsed_ms,
                guard,
            });
        }
        .instrument(span),
    );
}

pub(crate) enum DriverInput<T> {
    Trigger(T),
    TriggersClosed,
}

/// Merge the trigger sources in arrival order, followed by a single close marker once all have ended.
pub(crate) fn driver_inputs<T>(
    triggers: Vec<BoxStream<'static, T>>,
) -> Fuse<BoxStream<'static, DriverInput<T>>>
where
    T: Send + 'static,
{
    stream::select_all(triggers)
        .map(DriverInput::Trigger)
        .chain(stream::once(async { DriverInput::TriggersClosed }))
        .boxed()
        .fuse()
}

/// Spawn an orchestrator driver, the returned handle stops it.
pub(crate) fn spawn_driver(
    driver: impl Future<Output = ()> + Send + 'static,
    span: tracing::Span,
) -> AbortHandle {
    let (handle, registration) = AbortHandle::new_pair();
    Executor::spawn(
        Abortable::new(driver, registration)
            .map(|_| ())
            .instrument(span),
    );
    handle
}

pub(crate) fn record(events: &EventLog, variant: crate::FetchEventVariant) {
    tracing::trace!(%variant, "fetch event");
    events.push(variant);
}
