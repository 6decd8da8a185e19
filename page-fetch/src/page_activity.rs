use futures::{StreamExt, stream::BoxStream};

use crate::{
    ActivityTracker, FetchKind, MultiActivityCounter, Subscription,
    subscriptions::{combine_latest, distinct_until_changed},
};

/// The shared activity dashboard of a screen: one [`MultiActivityCounter`] per fetch kind.
///
/// Performs no orchestration itself, the orchestrators start and finish activities on it
/// and the UI reads the flags.
#[derive(Debug, Clone, Default)]
pub struct PageActivityState {
    loading: MultiActivityCounter,
    reloading: MultiActivityCounter,
    loading_more: MultiActivityCounter,
}

impl PageActivityState {
    /// Three fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from existing counters, e.g. to share one loading counter between screens.
    pub fn from_counters(
        loading: MultiActivityCounter,
        reloading: MultiActivityCounter,
        loading_more: MultiActivityCounter,
    ) -> Self {
        Self {
            loading,
            reloading,
            loading_more,
        }
    }

    /// The initial load counter.
    pub fn loading(&self) -> &MultiActivityCounter {
        &self.loading
    }

    /// The reload counter.
    pub fn reloading(&self) -> &MultiActivityCounter {
        &self.reloading
    }

    /// The load-more counter.
    pub fn loading_more(&self) -> &MultiActivityCounter {
        &self.loading_more
    }

    /// The counter tracking fetches of `kind`.
    pub fn counter(&self, kind: FetchKind) -> &MultiActivityCounter {
        match kind {
            FetchKind::Load => &self.loading,
            FetchKind::Reload => &self.reloading,
            FetchKind::LoadMore => &self.loading_more,
        }
    }

    /// Whether an initial load is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading.is_active()
    }

    /// Whether a reload is in flight.
    pub fn is_reloading(&self) -> bool {
        self.reloading.is_active()
    }

    /// Whether a load-more is in flight.
    pub fn is_loading_more(&self) -> bool {
        self.loading_more.is_active()
    }

    /// Whether anything at all is in flight.
    pub fn is_busy(&self) -> bool {
        self.is_loading() || self.is_reloading() || self.is_loading_more()
    }

    /// The current `(loading, reloading, loading_more)` flags.
    pub fn snapshot(&self) -> (bool, bool, bool) {
        (self.is_loading(), self.is_reloading(), self.is_loading_more())
    }

    /// The loading flag.
    pub fn subscribe_loading(&self) -> Subscription<bool> {
        self.loading.subscribe()
    }

    /// The reloading flag.
    pub fn subscribe_reloading(&self) -> Subscription<bool> {
        self.reloading.subscribe()
    }

    /// The loading-more flag.
    pub fn subscribe_loading_more(&self) -> Subscription<bool> {
        self.loading_more.subscribe()
    }

    /// The `(loading, reloading, loading_more)` tuple, re-emitted whenever any flag changes.
    pub fn subscribe_combined(&self) -> BoxStream<'static, (bool, bool, bool)> {
        distinct_until_changed(
            combine_latest(vec![
                self.subscribe_loading(),
                self.subscribe_reloading(),
                self.subscribe_loading_more(),
            ])
            .map(|flags| (flags[0], flags[1], flags[2])),
        )
    }
}
