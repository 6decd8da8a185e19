use std::{fmt::Debug, future::Future, sync::Arc};

use futures::{Stream, StreamExt, channel::mpsc, future::AbortHandle, stream::BoxStream};

use crate::{
    ActivityTracker, DropReason, Emitter, ErrorTracker, FetchError, FetchEvent, FetchEventVariant,
    FetchKind, FetchOptions, PageActivityState, Subscription, Trigger,
    dispatch::{
        Completion, DriverInput, FetchFn, FetchTask, LatestSlot, MapperFn, boxed_fetch,
        catch_panic, driver_inputs, record, spawn_driver, spawn_fetch,
    },
    events::EventLog,
    utils::new_orchestrator_id,
};

/// Everything [`fetch_list`] needs besides its triggers.
///
/// `I` is the per-trigger input, `Item` what the fetch callbacks return and `M` what the
/// mapper turns each item into.
pub struct ListFetchConfig<I, Item, M, E> {
    fetch_items: FetchFn<I, Vec<Item>, E>,
    reload_items: Option<FetchFn<I, Vec<Item>, E>>,
    mapper: MapperFn<Item, M>,
    activity: PageActivityState,
    error_tracker: ErrorTracker<E>,
    options: FetchOptions,
}

impl<I, Item, M, E> Debug for ListFetchConfig<I, Item, M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListFetchConfig")
            .field("fetch_items", &"Arc<dyn Fn(I) -> BoxFuture<Result<Vec<Item>, E>>>")
            .field("has_reload_items", &self.reload_items.is_some())
            .field("activity", &self.activity)
            .field("options", &self.options)
            .finish()
    }
}

impl<I, Item, E> ListFetchConfig<I, Item, Item, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// A config fetching with `fetch_items` for both load and reload, items are not mapped.
    pub fn new<F, Fut>(fetch_items: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Item>, E>> + Send + 'static,
    {
        Self {
            fetch_items: boxed_fetch(fetch_items),
            reload_items: None,
            mapper: Arc::new(|item| item),
            activity: PageActivityState::new(),
            error_tracker: ErrorTracker::new(),
            options: FetchOptions::new(),
        }
    }
}

impl<I, Item, M, E> ListFetchConfig<I, Item, M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// Map every fetched item before it's emitted.
    pub fn set_mapper<M2>(
        self,
        mapper: impl Fn(Item) -> M2 + Send + Sync + 'static,
    ) -> ListFetchConfig<I, Item, M2, E> {
        ListFetchConfig {
            fetch_items: self.fetch_items,
            reload_items: self.reload_items,
            mapper: Arc::new(mapper),
            activity: self.activity,
            error_tracker: self.error_tracker,
            options: self.options,
        }
    }

    /// Use a different callback for reloads, by default reloads use the load callback.
    pub fn set_reload_items<F, Fut>(mut self, reload_items: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Item>, E>> + Send + 'static,
    {
        self.reload_items = Some(boxed_fetch(reload_items));
        self
    }

    /// Track activity on a shared [`PageActivityState`].
    pub fn set_activity(mut self, activity: PageActivityState) -> Self {
        self.activity = activity;
        self
    }

    /// Report errors to a shared [`ErrorTracker`].
    pub fn set_error_tracker(mut self, error_tracker: ErrorTracker<E>) -> Self {
        self.error_tracker = error_tracker;
        self
    }

    /// Set the [`FetchOptions`].
    pub fn set_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }
}

/// The running list orchestrator returned by [`fetch_list`].
///
/// Dropping it stops the orchestrator and cancels any in-flight fetch.
pub struct ListFetch<M, E> {
    items: Emitter<Vec<M>>,
    error_tracker: ErrorTracker<E>,
    activity: PageActivityState,
    events: EventLog,
    driver: AbortHandle,
}

impl<M, E> Debug for ListFetch<M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListFetch")
            .field("activity", &self.activity)
            .finish_non_exhaustive()
    }
}

impl<M, E> Drop for ListFetch<M, E> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The output streams of a [`ListFetch`]: items, errors, loading, reloading.
pub type ListFetchStreams<M, E> = (
    Subscription<Vec<M>>,
    Subscription<FetchError<E>>,
    Subscription<bool>,
    Subscription<bool>,
);

impl<M, E> ListFetch<M, E>
where
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// Every mapped item collection fetched from now on.
    pub fn items(&self) -> Subscription<Vec<M>> {
        self.items.subscribe()
    }

    /// Every fetch error from now on.
    pub fn errors(&self) -> Subscription<FetchError<E>> {
        self.error_tracker.errors()
    }

    /// The loading flag.
    pub fn is_loading(&self) -> Subscription<bool> {
        self.activity.subscribe_loading()
    }

    /// The reloading flag.
    pub fn is_reloading(&self) -> Subscription<bool> {
        self.activity.subscribe_reloading()
    }

    /// The activity counters this orchestrator tracks against.
    pub fn activity(&self) -> &PageActivityState {
        &self.activity
    }

    /// The recent diagnostic history, oldest first.
    pub fn events(&self) -> Vec<FetchEvent> {
        self.events.snapshot()
    }

    /// Subscribe to every output at once.
    pub fn streams(&self) -> ListFetchStreams<M, E> {
        (
            self.items(),
            self.errors(),
            self.is_loading(),
            self.is_reloading(),
        )
    }
}

/// Drive load/reload triggers against a non-paginated fetch callback.
///
/// Triggers are handled in arrival order. A trigger arriving while a load or reload is in flight
/// is dropped, not queued (see [`FetchOptions::set_reload_supersedes_load`] for the one exception).
/// Each successful fetch is mapped and emitted on [`ListFetch::items`], errors go to the
/// [`ErrorTracker`] and never stop the orchestrator.
pub fn fetch_list<I, Item, M, E>(
    config: ListFetchConfig<I, Item, M, E>,
    load_trigger: impl Stream<Item = I> + Send + 'static,
    reload_trigger: impl Stream<Item = I> + Send + 'static,
) -> ListFetch<M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    let ListFetchConfig {
        fetch_items,
        reload_items,
        mapper,
        activity,
        error_tracker,
        options,
    } = config;

    let items = Emitter::new();
    let events = EventLog::new(options.event_history_limit());
    let (completions_tx, completions_rx) = mpsc::unbounded();

    let driver = ListDriver {
        reload_items: reload_items.unwrap_or_else(|| fetch_items.clone()),
        fetch_items,
        mapper,
        activity: activity.clone(),
        error_tracker: error_tracker.clone(),
        options,
        items: items.clone(),
        events: events.clone(),
        latest: LatestSlot::default(),
        completions: Some(completions_tx),
    };

    let triggers: Vec<BoxStream<'static, Trigger<I>>> = vec![
        load_trigger.map(Trigger::Loading).boxed(),
        reload_trigger.map(Trigger::Reloading).boxed(),
    ];
    let span = tracing::debug_span!("fetch_list", orchestrator = new_orchestrator_id());
    let driver = spawn_driver(driver.run(triggers, completions_rx), span);

    ListFetch {
        items,
        error_tracker,
        activity,
        events,
        driver,
    }
}

struct ListDriver<I, Item, M, E> {
    fetch_items: FetchFn<I, Vec<Item>, E>,
    reload_items: FetchFn<I, Vec<Item>, E>,
    mapper: MapperFn<Item, M>,
    activity: PageActivityState,
    error_tracker: ErrorTracker<E>,
    options: FetchOptions,
    items: Emitter<Vec<M>>,
    events: EventLog,
    latest: LatestSlot,
    // None once the triggers have closed, so the completion channel ends with the last fetch:
    completions: Option<mpsc::UnboundedSender<Completion<Vec<Item>, E>>>,
}

impl<I, Item, M, E> ListDriver<I, Item, M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    async fn run(
        mut self,
        triggers: Vec<BoxStream<'static, Trigger<I>>>,
        mut completions: mpsc::UnboundedReceiver<Completion<Vec<Item>, E>>,
    ) {
        let mut inputs = driver_inputs(triggers);
        loop {
            futures::select! {
                input = inputs.select_next_some() => match input {
                    DriverInput::Trigger(trigger) => self.on_trigger(trigger),
                    DriverInput::TriggersClosed => {
                        tracing::debug!("triggers closed, finishing in-flight fetches");
                        self.completions = None;
                    }
                },
                completion = completions.select_next_some() => self.on_completion(completion),
                complete => break,
            }
        }
        tracing::debug!("list orchestrator finished");
    }

    fn is_busy_for(&self, kind: FetchKind) -> bool {
        match kind {
            FetchKind::Reload if self.options.reload_supersedes_load() => {
                self.activity.is_reloading()
            }
            _ => self.activity.is_loading() || self.activity.is_reloading(),
        }
    }

    fn on_trigger(&mut self, trigger: Trigger<I>) {
        let kind = trigger.kind();
        if self.is_busy_for(kind) {
            tracing::debug!(%kind, "busy, trigger dropped");
            record(
                &self.events,
                FetchEventVariant::TriggerDropped {
                    kind,
                    reason: DropReason::Busy,
                },
            );
            return;
        }
        let Some(completions) = self.completions.clone() else {
            return;
        };

        let guard = self.activity.counter(kind).start();
        let (generation, registration) = self.latest.begin();
        let fetch = match trigger {
            Trigger::Loading(input) => (self.fetch_items)(input),
            Trigger::Reloading(input) => (self.reload_items)(input),
        };
        tracing::debug!(%kind, generation, "dispatching");
        record(&self.events, FetchEventVariant::Dispatched { kind });
        spawn_fetch(
            FetchTask {
                kind,
                generation,
                registration,
                guard,
                fetch,
            },
            self.error_tracker.clone(),
            completions,
        );
    }

    fn on_completion(&mut self, completion: Completion<Vec<Item>, E>) {
        let Completion {
            kind,
            generation,
            result,
            elapsed_ms,
            guard,
        } = completion;

        if !self.latest.is_current(generation) {
            tracing::debug!(%kind, generation, "stale response discarded");
            record(&self.events, FetchEventVariant::StaleDiscarded { kind });
            return;
        }
        self.latest.finish(generation);

        let mapper = &self.mapper;
        let mapped = result.and_then(|items| {
            catch_panic(&self.error_tracker, || {
                items.into_iter().map(|item| mapper(item)).collect::<Vec<_>>()
            })
        });
        match mapped {
            Ok(mapped) => {
                tracing::debug!(%kind, elapsed_ms, "items fetched");
                self.items.emit(mapped);
                record(&self.events, FetchEventVariant::Fetched { kind, elapsed_ms });
            }
            Err(_) => {
                // Already reported to the error tracker, by the fetch task or the mapper step.
                record(&self.events, FetchEventVariant::Failed { kind });
            }
        }
        // Activity only clears once the result is out:
        guard.finish();
    }
}
