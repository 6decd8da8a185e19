use std::fmt;

/// The kind of fetch a trigger asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// The initial load.
    Load,
    /// A full reload, e.g. pull-to-refresh.
    Reload,
    /// The next page, e.g. scroll-to-bottom.
    LoadMore,
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKind::Load => write!(f, "load"),
            FetchKind::Reload => write!(f, "reload"),
            FetchKind::LoadMore => write!(f, "load more"),
        }
    }
}

/// A load or reload trigger, carrying the caller's per-trigger input.
///
/// Decides which activity counter and which fetch callback the trigger goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger<I> {
    /// Fetch with the `fetch_items` callback, tracked as loading.
    Loading(I),
    /// Fetch with the `reload_items` callback, tracked as reloading.
    Reloading(I),
}

impl<I> Trigger<I> {
    /// The fetch this trigger asks for.
    pub fn kind(&self) -> FetchKind {
        match self {
            Trigger::Loading(_) => FetchKind::Load,
            Trigger::Reloading(_) => FetchKind::Reload,
        }
    }

    /// The caller's input.
    pub fn input(&self) -> &I {
        match self {
            Trigger::Loading(input) | Trigger::Reloading(input) => input,
        }
    }

    /// Consume into the caller's input.
    pub fn into_input(self) -> I {
        match self {
            Trigger::Loading(input) | Trigger::Reloading(input) => input,
        }
    }
}
