pub(crate) const DEFAULT_EVENT_HISTORY_LIMIT: usize = 64;

/// Configuration for the list and page orchestrators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FetchOptions {
    reload_supersedes_load: Option<bool>,
    event_history_limit: Option<usize>,
}

impl FetchOptions {
    /// Create new [`FetchOptions`] with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a reload trigger through while an initial load is still in flight.
    ///
    /// The reload supersedes the load: the load's fetch is cancelled and its response, if it still
    /// arrives, is discarded. A reload is still dropped while another reload or a load-more is in flight.
    ///
    /// When disabled every trigger arriving while anything is in flight is dropped.
    ///
    /// Default: `false`
    pub fn set_reload_supersedes_load(mut self, reload_supersedes_load: bool) -> Self {
        self.reload_supersedes_load = Some(reload_supersedes_load);
        self
    }

    /// Set how many diagnostic [`crate::FetchEvent`]s the orchestrator keeps, oldest dropped first.
    ///
    /// Set to `0` to disable recording.
    ///
    /// Default: `64`
    pub fn set_event_history_limit(mut self, event_history_limit: usize) -> Self {
        self.event_history_limit = Some(event_history_limit);
        self
    }

    /// Whether a reload trigger may supersede an in-flight initial load.
    ///
    /// Default: `false`
    pub fn reload_supersedes_load(&self) -> bool {
        self.reload_supersedes_load.unwrap_or(false)
    }

    /// How many diagnostic events are kept.
    ///
    /// Default: `64`
    pub fn event_history_limit(&self) -> usize {
        self.event_history_limit
            .unwrap_or(DEFAULT_EVENT_HISTORY_LIMIT)
    }
}
