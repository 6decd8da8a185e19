use std::{any::Any, fmt::Debug, future::Future, sync::Arc};

use futures::{Stream, StreamExt, channel::mpsc, future::AbortHandle, stream::BoxStream};
use parking_lot::Mutex;

use crate::{
    ActivityTracker, DropReason, Emitter, ErrorTracker, FIRST_PAGE, FetchError, FetchEvent,
    FetchEventVariant, FetchKind, FetchOptions, PageActivityState, PagedResult, Signal,
    Subscription, Trigger,
    dispatch::{
        Completion, DriverInput, FetchFn, FetchTask, LatestSlot, LoadMoreFn, MapperFn,
        boxed_fetch, boxed_load_more, catch_panic, driver_inputs, record, spawn_driver,
        spawn_fetch,
    },
    events::EventLog,
    utils::{OnDrop, new_orchestrator_id},
};

/// The authoritative paged snapshot of a screen.
///
/// Anyone holding a clone can read it, only the page orchestrator it's handed to writes it,
/// and always through a single replace-or-append step.
///
/// A state has at most one writer at a time: the first running orchestrator it's handed to claims it
/// until that orchestrator is dropped. An orchestrator given a state that's already claimed logs an
/// error and accumulates into a private state of its own instead, see [`PageFetch::page_state`].
pub struct PageState<M> {
    cell: Signal<PagedResult<M>>,
    // The orchestrator currently writing:
    writer: Arc<Mutex<Option<u64>>>,
}

impl<M> Clone for PageState<M> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<M: Debug> Debug for PageState<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageState")
            .field("cell", &self.cell)
            .field("writer", &*self.writer.lock())
            .finish()
    }
}

type WriterClaim = OnDrop<Box<dyn FnOnce() + Send + Sync>>;

impl<M: Clone + Send + 'static> Default for PageState<M> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum PageUpdate<M> {
    /// Load or reload: the new page replaces everything.
    Replace(PagedResult<M>),
    /// Load-more: the new page is appended.
    Append(PagedResult<M>),
}

impl<M> PageState<M>
where
    M: Clone + Send + 'static,
{
    /// Starts as the empty first page.
    pub fn new() -> Self {
        Self::with_initial(PagedResult::empty())
    }

    /// Start from an existing snapshot, e.g. one restored from a cache.
    pub fn with_initial(initial: PagedResult<M>) -> Self {
        Self {
            cell: Signal::new(initial),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a running orchestrator currently writes this state.
    pub fn has_writer(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Whether both handles point to the same state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    /// Become the single writer, `None` when another orchestrator already is.
    fn claim(&self, orchestrator: u64) -> Option<WriterClaim> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return None;
        }
        *writer = Some(orchestrator);
        let slot = self.writer.clone();
        Some(OnDrop::new(Box::new(move || {
            let mut writer = slot.lock();
            if *writer == Some(orchestrator) {
                *writer = None;
            }
        })))
    }

    /// A clone of the current snapshot.
    pub fn get(&self) -> PagedResult<M> {
        self.cell.get()
    }

    /// Read the current snapshot without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&PagedResult<M>) -> R) -> R {
        self.cell.with(f)
    }

    /// The current snapshot first, then every accepted update.
    pub fn subscribe(&self) -> Subscription<PagedResult<M>> {
        self.cell.subscribe()
    }

    pub(crate) fn apply(&self, update: PageUpdate<M>) -> PagedResult<M> {
        self.cell.update(|current| {
            let next = match update {
                PageUpdate::Replace(page) => page,
                PageUpdate::Append(page) => std::mem::take(current).append(page),
            };
            *current = next;
            current.clone()
        })
    }
}

/// Everything [`fetch_page`] needs besides its triggers.
///
/// `I` is the per-trigger input, `Item` what the fetch callbacks return and `M` what the
/// mapper turns each item into.
pub struct PageFetchConfig<I, Item, M, E> {
    fetch_items: FetchFn<I, PagedResult<Item>, E>,
    reload_items: Option<FetchFn<I, PagedResult<Item>, E>>,
    load_more_items: LoadMoreFn<I, PagedResult<Item>, E>,
    mapper: MapperFn<Item, M>,
    page_state: Option<PageState<M>>,
    activity: PageActivityState,
    error_tracker: ErrorTracker<E>,
    options: FetchOptions,
}

impl<I, Item, M, E> Debug for PageFetchConfig<I, Item, M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetchConfig")
            .field(
                "fetch_items",
                &"Arc<dyn Fn(I) -> BoxFuture<Result<PagedResult<Item>, E>>>",
            )
            .field("has_reload_items", &self.reload_items.is_some())
            .field("activity", &self.activity)
            .field("options", &self.options)
            .finish()
    }
}

impl<I, Item, E> PageFetchConfig<I, Item, Item, E>
where
    I: Send + 'static,
    Item: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// A config loading the first page with `fetch_items` (also used for reloads) and following
    /// pages with `load_more_items`, which receives the page number to fetch. Items are not mapped.
    pub fn new<F, Fut, LF, LFut>(fetch_items: F, load_more_items: LF) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PagedResult<Item>, E>> + Send + 'static,
        LF: Fn(I, usize) -> LFut + Send + Sync + 'static,
        LFut: Future<Output = Result<PagedResult<Item>, E>> + Send + 'static,
    {
        Self {
            fetch_items: boxed_fetch(fetch_items),
            reload_items: None,
            load_more_items: boxed_load_more(load_more_items),
            mapper: Arc::new(|item| item),
            page_state: None,
            activity: PageActivityState::new(),
            error_tracker: ErrorTracker::new(),
            options: FetchOptions::new(),
        }
    }

    /// A config from a single callback taking the page number:
    /// load and reload request [`FIRST_PAGE`], load-more requests the page after the current one.
    pub fn from_page_fetcher<F, Fut>(fetch: F) -> Self
    where
        F: Fn(I, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PagedResult<Item>, E>> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        Self::new(
            {
                let fetch = fetch.clone();
                move |input| (*fetch)(input, FIRST_PAGE)
            },
            move |input, page| (*fetch)(input, page),
        )
    }
}

impl<I, Item, M, E> PageFetchConfig<I, Item, M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// Map every fetched item before it's merged into the page state.
    ///
    /// A page state already set is kept when the mapped type is unchanged. One of a different
    /// item type can't hold the mapped items, it's dropped with a warning, so call
    /// [`PageFetchConfig::set_page_state`] after this.
    pub fn set_mapper<M2>(
        self,
        mapper: impl Fn(Item) -> M2 + Send + Sync + 'static,
    ) -> PageFetchConfig<I, Item, M2, E>
    where
        M2: Clone + Send + 'static,
    {
        let page_state = self.page_state.and_then(|page_state| {
            let page_state: Box<dyn Any> = Box::new(page_state);
            match page_state.downcast::<PageState<M2>>() {
                Ok(page_state) => Some(*page_state),
                Err(_) => {
                    tracing::warn!(
                        "page state set before a mapper changing the item type, using a fresh one"
                    );
                    None
                }
            }
        });
        PageFetchConfig {
            fetch_items: self.fetch_items,
            reload_items: self.reload_items,
            load_more_items: self.load_more_items,
            mapper: Arc::new(mapper),
            page_state,
            activity: self.activity,
            error_tracker: self.error_tracker,
            options: self.options,
        }
    }

    /// Use a different callback for reloads, by default reloads use the load callback.
    pub fn set_reload_items<F, Fut>(mut self, reload_items: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PagedResult<Item>, E>> + Send + 'static,
    {
        self.reload_items = Some(boxed_fetch(reload_items));
        self
    }

    /// Accumulate into a shared [`PageState`] rather than a private one.
    ///
    /// The state must not be written by another running orchestrator, see [`PageState`].
    pub fn set_page_state(mut self, page_state: PageState<M>) -> Self {
        self.page_state = Some(page_state);
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

/// The running page orchestrator returned by [`fetch_page`].
///
/// Dropping it stops the orchestrator and cancels any in-flight fetch.
pub struct PageFetch<M, E> {
    page: Emitter<PagedResult<M>>,
    page_state: PageState<M>,
    error_tracker: ErrorTracker<E>,
    activity: PageActivityState,
    events: EventLog,
    driver: AbortHandle,
    _writer: Option<WriterClaim>,
}

impl<M, E> Debug for PageFetch<M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetch")
            .field("activity", &self.activity)
            .finish_non_exhaustive()
    }
}

impl<M, E> Drop for PageFetch<M, E> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The output streams of a [`PageFetch`]: page, errors, loading, reloading, loading-more.
pub type PageFetchStreams<M, E> = (
    Subscription<PagedResult<M>>,
    Subscription<FetchError<E>>,
    Subscription<bool>,
    Subscription<bool>,
    Subscription<bool>,
);

impl<M, E> PageFetch<M, E>
where
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    /// The fully merged snapshot after every successful load, reload or load-more from now on.
    pub fn page(&self) -> Subscription<PagedResult<M>> {
        self.page.subscribe()
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

    /// The loading-more flag.
    pub fn is_loading_more(&self) -> Subscription<bool> {
        self.activity.subscribe_loading_more()
    }

    /// The current snapshot.
    pub fn current_page(&self) -> PagedResult<M> {
        self.page_state.get()
    }

    /// The state accumulated into.
    ///
    /// A private one when the state this orchestrator was configured with already had a writer.
    pub fn page_state(&self) -> &PageState<M> {
        &self.page_state
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
    pub fn streams(&self) -> PageFetchStreams<M, E> {
        (
            self.page(),
            self.errors(),
            self.is_loading(),
            self.is_reloading(),
            self.is_loading_more(),
        )
    }
}

enum PageTrigger<I> {
    Primary(Trigger<I>),
    LoadMore(I),
}

/// Drive load/reload/load-more triggers against paginated fetch callbacks.
///
/// Load and reload replace the [`PageState`] with the fetched page, load-more appends the next page
/// to it. Any trigger arriving while a load, reload or load-more is in flight is dropped, as is a
/// load-more before a first page exists. Every accepted update is emitted on [`PageFetch::page`] as
/// the fully merged snapshot. Errors go to the [`ErrorTracker`], leave the page state untouched and
/// never stop the orchestrator.
pub fn fetch_page<I, Item, M, E>(
    config: PageFetchConfig<I, Item, M, E>,
    load_trigger: impl Stream<Item = I> + Send + 'static,
    reload_trigger: impl Stream<Item = I> + Send + 'static,
    load_more_trigger: impl Stream<Item = I> + Send + 'static,
) -> PageFetch<M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    let PageFetchConfig {
        fetch_items,
        reload_items,
        load_more_items,
        mapper,
        page_state,
        activity,
        error_tracker,
        options,
    } = config;

    let orchestrator = new_orchestrator_id();
    let mut page_state = page_state.unwrap_or_default();
    let writer = match page_state.claim(orchestrator) {
        Some(claim) => Some(claim),
        None => {
            tracing::error!(
                orchestrator,
                "page state already has a writer, accumulating into a private one"
            );
            page_state = PageState::with_initial(page_state.get());
            page_state.claim(orchestrator)
        }
    };

    let page = Emitter::new();
    let events = EventLog::new(options.event_history_limit());
    let (completions_tx, completions_rx) = mpsc::unbounded();

    let driver = PageDriver {
        reload_items: reload_items.unwrap_or_else(|| fetch_items.clone()),
        fetch_items,
        load_more_items,
        mapper,
        page_state: page_state.clone(),
        activity: activity.clone(),
        error_tracker: error_tracker.clone(),
        options,
        page: page.clone(),
        events: events.clone(),
        primary: LatestSlot::default(),
        load_more: LatestSlot::default(),
        completions: Some(completions_tx),
    };

    let triggers: Vec<BoxStream<'static, PageTrigger<I>>> = vec![
        load_trigger
            .map(|input| PageTrigger::Primary(Trigger::Loading(input)))
            .boxed(),
        reload_trigger
            .map(|input| PageTrigger::Primary(Trigger::Reloading(input)))
            .boxed(),
        load_more_trigger.map(PageTrigger::LoadMore).boxed(),
    ];
    let span = tracing::debug_span!("fetch_page", orchestrator);
    let driver = spawn_driver(driver.run(triggers, completions_rx), span);

    PageFetch {
        page,
        page_state,
        error_tracker,
        activity,
        events,
        driver,
        _writer: writer,
    }
}

struct PageDriver<I, Item, M, E> {
    fetch_items: FetchFn<I, PagedResult<Item>, E>,
    reload_items: FetchFn<I, PagedResult<Item>, E>,
    load_more_items: LoadMoreFn<I, PagedResult<Item>, E>,
    mapper: MapperFn<Item, M>,
    page_state: PageState<M>,
    activity: PageActivityState,
    error_tracker: ErrorTracker<E>,
    options: FetchOptions,
    page: Emitter<PagedResult<M>>,
    events: EventLog,
    primary: LatestSlot,
    load_more: LatestSlot,
    // None once the triggers have closed, so the completion channel ends with the last fetch:
    completions: Option<mpsc::UnboundedSender<Completion<PagedResult<Item>, E>>>,
}

impl<I, Item, M, E> PageDriver<I, Item, M, E>
where
    I: Send + 'static,
    Item: Send + 'static,
    M: Clone + Send + 'static,
    E: Debug + Send + Sync + 'static,
{
    async fn run(
        mut self,
        triggers: Vec<BoxStream<'static, PageTrigger<I>>>,
        mut completions: mpsc::UnboundedReceiver<Completion<PagedResult<Item>, E>>,
    ) {
        let mut inputs = driver_inputs(triggers);
        loop {
            futures::select! {
                input = inputs.select_next_some() => match input {
                    DriverInput::Trigger(PageTrigger::Primary(trigger)) => self.on_primary(trigger),
                    DriverInput::Trigger(PageTrigger::LoadMore(input)) => self.on_load_more(input),
                    DriverInput::TriggersClosed => {
                        tracing::debug!("triggers closed, finishing in-flight fetches");
                        self.completions = None;
                    }
                },
                completion = completions.select_next_some() => self.on_completion(completion),
                complete => break,
            }
        }
        tracing::debug!("page orchestrator finished");
    }

    fn is_busy_for(&self, kind: FetchKind) -> bool {
        match kind {
            FetchKind::Reload if self.options.reload_supersedes_load() => {
                self.activity.is_reloading() || self.activity.is_loading_more()
            }
            _ => self.activity.is_busy(),
        }
    }

    fn drop_trigger(&self, kind: FetchKind, reason: DropReason) {
        tracing::debug!(%kind, ?reason, "trigger dropped");
        record(
            &self.events,
            FetchEventVariant::TriggerDropped { kind, reason },
        );
    }

    fn on_primary(&mut self, trigger: Trigger<I>) {
        let kind = trigger.kind();
        if self.is_busy_for(kind) {
            self.drop_trigger(kind, DropReason::Busy);
            return;
        }
        let Some(completions) = self.completions.clone() else {
            return;
        };

        let guard = self.activity.counter(kind).start();
        let (generation, registration) = self.primary.begin();
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

    fn on_load_more(&mut self, input: I) {
        let kind = FetchKind::LoadMore;
        if self.is_busy_for(kind) {
            self.drop_trigger(kind, DropReason::Busy);
            return;
        }
        let (has_first_page, current_page) = self
            .page_state
            .with(|page| (!page.items.is_empty(), page.page));
        if !has_first_page {
            // Nothing was started so the loading-more flag is already clear.
            self.drop_trigger(kind, DropReason::NoFirstPage);
            return;
        }
        let Some(completions) = self.completions.clone() else {
            return;
        };

        let guard = self.activity.counter(kind).start();
        let (generation, registration) = self.load_more.begin();
        let next_page = current_page + 1;
        tracing::debug!(generation, next_page, "dispatching load more");
        record(&self.events, FetchEventVariant::Dispatched { kind });
        spawn_fetch(
            FetchTask {
                kind,
                generation,
                registration,
                guard,
                fetch: (self.load_more_items)(input, next_page),
            },
            self.error_tracker.clone(),
            completions,
        );
    }

    fn on_completion(&mut self, completion: Completion<PagedResult<Item>, E>) {
        let Completion {
            kind,
            generation,
            result,
            elapsed_ms,
            guard,
        } = completion;

        let slot = match kind {
            FetchKind::LoadMore => &mut self.load_more,
            FetchKind::Load | FetchKind::Reload => &mut self.primary,
        };
        if !slot.is_current(generation) {
            tracing::debug!(%kind, generation, "stale response discarded");
            record(&self.events, FetchEventVariant::StaleDiscarded { kind });
            return;
        }
        slot.finish(generation);

        match result {
            Ok(fetched) => {
                if kind == FetchKind::LoadMore && fetched.is_empty_tail() {
                    tracing::debug!(page = fetched.page, "empty last page ignored");
                    record(&self.events, FetchEventVariant::EmptyTailDropped);
                } else {
                    let mapper = &self.mapper;
                    match catch_panic(&self.error_tracker, || fetched.map(|item| mapper(item))) {
                        Ok(mapped) => {
                            let update = match kind {
                                FetchKind::LoadMore => PageUpdate::Append(mapped),
                                FetchKind::Load | FetchKind::Reload => PageUpdate::Replace(mapped),
                            };
                            let snapshot = self.page_state.apply(update);
                            tracing::debug!(
                                %kind,
                                elapsed_ms,
                                page = snapshot.page,
                                items = snapshot.items.len(),
                                "page applied"
                            );
                            self.page.emit(snapshot);
                            record(&self.events, FetchEventVariant::Fetched { kind, elapsed_ms });
                        }
                        Err(_) => {
                            // Mapper panicked, reported, page state untouched.
                            record(&self.events, FetchEventVariant::Failed { kind });
                        }
                    }
                }
            }
            Err(_) => {
                // Already reported to the error tracker by the fetch task, page state untouched.
                record(&self.events, FetchEventVariant::Failed { kind });
            }
        }
        // Activity only clears once the page is out:
        guard.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{StreamExt, channel::mpsc::UnboundedSender, stream};
    use rstest::*;

    use super::*;
    use crate::test::{MockFetch, TestError, prep, settle};

    type PageResponse = Result<PagedResult<char>, TestError>;

    struct Harness {
        load: UnboundedSender<()>,
        reload: UnboundedSender<()>,
        load_more: UnboundedSender<()>,
        fetch: MockFetch<&'static str, PageResponse>,
        reload_fetch: MockFetch<&'static str, PageResponse>,
        more_fetch: MockFetch<usize, PageResponse>,
        pages: PageFetch<String, TestError>,
    }

    fn harness(options: FetchOptions) -> Harness {
        let fetch = MockFetch::new();
        let reload_fetch = MockFetch::new();
        let more_fetch = MockFetch::new();
        let (load, load_rx) = mpsc::unbounded();
        let (reload, reload_rx) = mpsc::unbounded();
        let (load_more, load_more_rx) = mpsc::unbounded();
        let config = PageFetchConfig::new(
            {
                let fetch = fetch.clone();
                move |()| fetch.call("load")
            },
            {
                let more_fetch = more_fetch.clone();
                move |(), page| more_fetch.call(page)
            },
        )
        .set_reload_items({
            let reload_fetch = reload_fetch.clone();
            move |()| reload_fetch.call("reload")
        })
        .set_mapper(|c: char| c.to_string())
        .set_options(options);
        let pages = fetch_page(config, load_rx, reload_rx, load_more_rx);
        Harness {
            load,
            reload,
            load_more,
            fetch,
            reload_fetch,
            more_fetch,
            pages,
        }
    }

    fn page(page: usize, items: &[char]) -> PagedResult<char> {
        PagedResult::new(page, items.to_vec())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Load `[A, B]` as page 1 and wait for it to be applied.
    async fn first_page(h: &Harness) {
        h.load.unbounded_send(()).unwrap();
        settle().await;
        h.fetch.respond(h.fetch.call_count() - 1, Ok(page(1, &['A', 'B'])));
        settle().await;
    }

    #[test]
    fn test_page_state_replace_and_append() {
        let state = PageState::new();
        let mut updates = state.subscribe();
        state.apply(PageUpdate::Replace(page(1, &['A', 'B'])));
        let merged = state.apply(PageUpdate::Append(
            page(2, &['C']).set_has_more_pages(false),
        ));
        assert_eq!(merged, page(2, &['A', 'B', 'C']));
        assert!(!state.get().has_more_pages);
        assert_eq!(
            updates
                .drain_ready()
                .into_iter()
                .map(|p| p.items)
                .collect::<Vec<_>>(),
            vec![vec![], vec!['A', 'B'], vec!['A', 'B', 'C']]
        );
    }

    #[tokio::test]
    async fn test_load_then_load_more() {
        prep();
        let h = harness(FetchOptions::new());
        let mut pages = h.pages.page();

        first_page(&h).await;
        let first = pages.next().await.unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(first.items, strings(&["A", "B"]));

        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(h.more_fetch.calls(), vec![2]);
        assert!(h.pages.activity().is_loading_more());
        h.more_fetch.respond(0, Ok(page(2, &['C']).set_total_items(3)));
        settle().await;

        let second = pages.next().await.unwrap();
        assert_eq!(second.page, 2);
        assert_eq!(second.items, strings(&["A", "B", "C"]));
        assert_eq!(second.total_items, 3);
        assert_eq!(h.pages.current_page(), second);
        assert!(!h.pages.activity().is_busy());
    }

    #[tokio::test]
    async fn test_reload_replaces_everything() {
        prep();
        let h = harness(FetchOptions::new());
        first_page(&h).await;
        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        h.more_fetch.respond(0, Ok(page(2, &['C'])));
        settle().await;
        assert_eq!(h.pages.current_page().len(), 3);

        let mut reloading = h.pages.is_reloading();
        h.reload.unbounded_send(()).unwrap();
        settle().await;
        h.reload_fetch.respond(0, Ok(page(1, &['X'])));
        settle().await;
        assert_eq!(h.pages.current_page(), PagedResult::new(1, strings(&["X"])));
        assert_eq!(reloading.drain_ready(), vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_load_more_before_first_page_is_dropped() {
        prep();
        let h = harness(FetchOptions::new());
        let mut pages = h.pages.page();
        let mut loading_more = h.pages.is_loading_more();

        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(h.more_fetch.call_count(), 0);
        assert!(pages.drain_ready().is_empty());
        assert_eq!(loading_more.drain_ready(), vec![false]);
        assert!(h.pages.events().iter().any(|event| event.variant
            == FetchEventVariant::TriggerDropped {
                kind: FetchKind::LoadMore,
                reason: DropReason::NoFirstPage,
            }));
    }

    #[tokio::test]
    async fn test_load_more_after_empty_first_page_is_dropped() {
        prep();
        let h = harness(FetchOptions::new());
        h.load.unbounded_send(()).unwrap();
        settle().await;
        // Still claims more pages, but there's nothing to extend:
        h.fetch.respond(0, Ok(page(1, &[])));
        settle().await;
        assert!(h.pages.current_page().is_empty());

        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(h.more_fetch.call_count(), 0);
        assert!(!h.pages.activity().is_busy());
        assert!(h.pages.events().iter().any(|event| event.variant
            == FetchEventVariant::TriggerDropped {
                kind: FetchKind::LoadMore,
                reason: DropReason::NoFirstPage,
            }));
    }

    #[tokio::test]
    async fn test_fetched_event_times_the_request() {
        prep();
        let h = harness(FetchOptions::new());
        h.load.unbounded_send(()).unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.fetch.respond(0, Ok(page(1, &['A'])));
        settle().await;

        let elapsed = h.pages.events().iter().find_map(|event| match event.variant {
            FetchEventVariant::Fetched {
                kind: FetchKind::Load,
                elapsed_ms,
            } => Some(elapsed_ms),
            _ => None,
        });
        assert!(elapsed.is_some_and(|elapsed_ms| elapsed_ms >= 30), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_empty_tail_leaves_state_unchanged() {
        prep();
        let h = harness(FetchOptions::new());
        first_page(&h).await;
        let mut pages = h.pages.page();

        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        h.more_fetch
            .respond(0, Ok(page(2, &[]).set_has_more_pages(false)));
        settle().await;
        assert!(pages.drain_ready().is_empty());
        assert_eq!(h.pages.current_page(), PagedResult::new(1, strings(&["A", "B"])));
        assert!(!h.pages.activity().is_loading_more());
        assert!(
            h.pages
                .events()
                .iter()
                .any(|event| event.variant == FetchEventVariant::EmptyTailDropped)
        );
    }

    #[tokio::test]
    async fn test_empty_page_with_more_pages_is_merged() {
        prep();
        let h = harness(FetchOptions::new());
        first_page(&h).await;
        h.load_more.unbounded_send(()).unwrap();
        settle().await;
        h.more_fetch.respond(0, Ok(page(2, &[])));
        settle().await;
        let current = h.pages.current_page();
        assert_eq!(current.page, 2);
        assert_eq!(current.items, strings(&["A", "B"]));
    }

    #[rstest]
    #[tokio::test]
    async fn test_nothing_dispatched_while_busy(
        #[values(FetchKind::Load, FetchKind::Reload, FetchKind::LoadMore)] busy_with: FetchKind,
    ) {
        prep();
        let h = harness(FetchOptions::new());
        first_page(&h).await;
        let sender = |kind: FetchKind| match kind {
            FetchKind::Load => &h.load,
            FetchKind::Reload => &h.reload,
            FetchKind::LoadMore => &h.load_more,
        };
        sender(busy_with).unbounded_send(()).unwrap();
        settle().await;
        let before = (
            h.fetch.call_count(),
            h.reload_fetch.call_count(),
            h.more_fetch.call_count(),
        );

        for kind in [FetchKind::Load, FetchKind::Reload, FetchKind::LoadMore] {
            sender(kind).unbounded_send(()).unwrap();
        }
        settle().await;
        assert_eq!(
            (
                h.fetch.call_count(),
                h.reload_fetch.call_count(),
                h.more_fetch.call_count(),
            ),
            before
        );
        let dropped = h
            .pages
            .events()
            .iter()
            .filter(|event| {
                matches!(
                    event.variant,
                    FetchEventVariant::TriggerDropped {
                        reason: DropReason::Busy,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(dropped, 3);
    }

    #[rstest]
    #[tokio::test]
    async fn test_error_leaves_state_unchanged(
        #[values(FetchKind::Load, FetchKind::Reload, FetchKind::LoadMore)] failing: FetchKind,
    ) {
        prep();
        let h = harness(FetchOptions::new());
        if failing != FetchKind::Load {
            first_page(&h).await;
        }
        let before = h.pages.current_page();
        let mut errors = h.pages.errors();
        let mut pages = h.pages.page();

        match failing {
            FetchKind::Load => {
                h.load.unbounded_send(()).unwrap();
                settle().await;
                h.fetch.respond(0, Err(TestError("timeout")));
            }
            FetchKind::Reload => {
                h.reload.unbounded_send(()).unwrap();
                settle().await;
                h.reload_fetch.respond(0, Err(TestError("timeout")));
            }
            FetchKind::LoadMore => {
                h.load_more.unbounded_send(()).unwrap();
                settle().await;
                h.more_fetch.respond(0, Err(TestError("timeout")));
            }
        }
        settle().await;

        let reported = errors.drain_ready();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].to_string(), "test error: timeout");
        assert!(pages.drain_ready().is_empty());
        assert_eq!(h.pages.current_page(), before);
        assert!(!h.pages.activity().is_busy());
        assert!(h.pages.events().iter().any(|event| event.variant
            == FetchEventVariant::Failed { kind: failing }));
    }

    #[tokio::test]
    async fn test_strict_guard_drops_reload_during_load() {
        prep();
        let h = harness(FetchOptions::new());
        h.load.unbounded_send(()).unwrap();
        settle().await;
        h.reload.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(h.reload_fetch.call_count(), 0);
        h.fetch.respond(0, Ok(page(1, &['A', 'B'])));
        settle().await;
        assert_eq!(h.pages.current_page().items, strings(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_reload_supersedes_in_flight_load() {
        prep();
        let h = harness(FetchOptions::new().set_reload_supersedes_load(true));
        let mut pages = h.pages.page();

        h.load.unbounded_send(()).unwrap();
        settle().await;
        h.reload.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(h.reload_fetch.call_count(), 1);
        // The load was cancelled when the reload started:
        assert!(!h.pages.activity().is_loading());

        h.reload_fetch.respond(0, Ok(page(1, &['X'])));
        h.fetch.respond(0, Ok(page(1, &['A', 'B'])));
        settle().await;
        assert_eq!(
            pages
                .drain_ready()
                .into_iter()
                .map(|p| p.items)
                .collect::<Vec<_>>(),
            vec![strings(&["X"])]
        );
        assert_eq!(h.pages.current_page().items, strings(&["X"]));
    }

    #[tokio::test]
    async fn test_from_page_fetcher_requests_pages() {
        prep();
        let fetch = MockFetch::<usize, Result<PagedResult<u32>, TestError>>::new();
        let (load, load_rx) = mpsc::unbounded();
        let (_reload, reload_rx) = mpsc::unbounded::<()>();
        let (load_more, load_more_rx) = mpsc::unbounded();
        let pages = fetch_page(
            PageFetchConfig::from_page_fetcher({
                let fetch = fetch.clone();
                move |(), page| fetch.call(page)
            }),
            load_rx,
            reload_rx,
            load_more_rx,
        );

        load.unbounded_send(()).unwrap();
        settle().await;
        fetch.respond(0, Ok(PagedResult::new(1, vec![10, 11])));
        settle().await;
        load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(fetch.calls(), vec![FIRST_PAGE, 2]);
        fetch.respond(1, Ok(PagedResult::new(2, vec![12])));
        settle().await;
        assert_eq!(pages.current_page().items, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_shared_page_state_is_read_outside() {
        prep();
        let state = PageState::with_initial(PagedResult::new(3, vec!['q']));
        let (_load, load_rx) = mpsc::unbounded::<()>();
        let (_reload, reload_rx) = mpsc::unbounded::<()>();
        let (load_more, load_more_rx) = mpsc::unbounded();
        let more_fetch = MockFetch::<usize, PageResponse>::new();
        let pages = fetch_page(
            PageFetchConfig::new(|()| async { Ok(PagedResult::empty()) }, {
                let more_fetch = more_fetch.clone();
                move |(), page| more_fetch.call(page)
            })
            .set_page_state(state.clone()),
            load_rx,
            reload_rx,
            load_more_rx,
        );

        // An existing snapshot counts as a first page:
        load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(more_fetch.calls(), vec![4]);
        more_fetch.respond(0, Ok(PagedResult::new(4, vec!['r'])));
        settle().await;
        assert_eq!(state.get().items, vec!['q', 'r']);
        assert_eq!(pages.page_state().get(), state.get());
    }

    #[tokio::test]
    async fn test_panicking_mapper_leaves_page_state() {
        prep();
        let fetch = MockFetch::<usize, Result<PagedResult<u32>, TestError>>::new();
        let (load, load_rx) = mpsc::unbounded();
        let (load_more, load_more_rx) = mpsc::unbounded();
        let pages = fetch_page(
            PageFetchConfig::from_page_fetcher({
                let fetch = fetch.clone();
                move |(), page| fetch.call(page)
            })
            .set_mapper(|n: u32| {
                assert!(n != 0, "zero item");
                n * 10
            }),
            load_rx,
            stream::pending(),
            load_more_rx,
        );
        let mut errors = pages.errors();

        load.unbounded_send(()).unwrap();
        settle().await;
        fetch.respond(0, Ok(PagedResult::new(1, vec![1, 2])));
        settle().await;
        load_more.unbounded_send(()).unwrap();
        settle().await;
        fetch.respond(1, Ok(PagedResult::new(2, vec![0])));
        settle().await;

        let reported = errors.drain_ready();
        assert_eq!(reported.len(), 1);
        assert!(matches!(reported[0], FetchError::Panicked(_)));
        assert_eq!(pages.current_page(), PagedResult::new(1, vec![10, 20]));
        assert!(!pages.activity().is_busy());
        assert!(pages.events().iter().any(|event| event.variant
            == FetchEventVariant::Failed {
                kind: FetchKind::LoadMore
            }));

        // Still running:
        load_more.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(fetch.calls(), vec![FIRST_PAGE, 2, 2]);
        fetch.respond(2, Ok(PagedResult::new(2, vec![3])));
        settle().await;
        assert_eq!(pages.current_page().items, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_callback_panicking_before_its_future_is_reported() {
        prep();
        let (load, load_rx) = mpsc::unbounded();
        let pages = fetch_page(
            PageFetchConfig::new(
                |explode: bool| {
                    assert!(!explode, "bad input");
                    async { Ok::<_, TestError>(PagedResult::new(1, vec!['A'])) }
                },
                |_, _| async { Ok(PagedResult::empty()) },
            ),
            load_rx,
            stream::pending(),
            stream::pending(),
        );
        let mut errors = pages.errors();

        load.unbounded_send(true).unwrap();
        settle().await;
        let reported = errors.drain_ready();
        assert_eq!(reported.len(), 1);
        assert!(matches!(reported[0], FetchError::Panicked(_)));
        assert!(!pages.activity().is_loading());

        load.unbounded_send(false).unwrap();
        settle().await;
        assert_eq!(pages.current_page().items, vec!['A']);
    }

    fn char_config() -> PageFetchConfig<(), char, char, TestError> {
        PageFetchConfig::new(
            |()| async { Ok(PagedResult::new(1, vec!['a'])) },
            |(), _| async { Ok(PagedResult::empty()) },
        )
    }

    #[test]
    fn test_set_mapper_carries_page_state_of_same_type() {
        let state = PageState::<char>::new();

        let same = char_config()
            .set_page_state(state.clone())
            .set_mapper(|c: char| c.to_ascii_uppercase());
        assert!(same.page_state.as_ref().is_some_and(|kept| kept.ptr_eq(&state)));

        let changed = char_config()
            .set_page_state(state.clone())
            .set_mapper(|c: char| c.to_string());
        assert!(changed.page_state.is_none());
    }

    #[tokio::test]
    async fn test_page_state_set_before_mapper_is_written() {
        prep();
        let state = PageState::<char>::new();
        let (load, load_rx) = mpsc::unbounded();
        let pages = fetch_page(
            char_config()
                .set_page_state(state.clone())
                .set_mapper(|c: char| c.to_ascii_uppercase()),
            load_rx,
            stream::pending(),
            stream::pending(),
        );

        load.unbounded_send(()).unwrap();
        settle().await;
        assert!(pages.page_state().ptr_eq(&state));
        assert_eq!(state.get().items, vec!['A']);
    }

    #[tokio::test]
    async fn test_page_state_has_single_writer() {
        prep();
        let state = PageState::<char>::new();
        assert!(!state.has_writer());

        let start = |state: &PageState<char>| {
            let (load, load_rx) = mpsc::unbounded();
            let pages = fetch_page(
                char_config().set_page_state(state.clone()),
                load_rx,
                stream::pending(),
                stream::pending(),
            );
            (load, pages)
        };

        let (_first_load, first) = start(&state);
        assert!(state.has_writer());
        assert!(first.page_state().ptr_eq(&state));

        // Already written by the first, so the second gets a private copy:
        let (second_load, second) = start(&state);
        assert!(!second.page_state().ptr_eq(&state));
        second_load.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(second.current_page().items, vec!['a']);
        assert!(state.get().is_empty());

        drop(first);
        assert!(!state.has_writer());
        let (third_load, third) = start(&state);
        assert!(third.page_state().ptr_eq(&state));
        third_load.unbounded_send(()).unwrap();
        settle().await;
        assert_eq!(state.get().items, vec!['a']);
    }
}
