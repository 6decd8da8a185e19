//! Small stream helpers for screens built on top of the orchestrators.

use futures::{
    Stream, StreamExt, future,
    stream::{self, BoxStream},
};

use crate::{
    Subscription,
    subscriptions::{combine_latest, distinct_until_changed},
};

/// Whether an empty state should be shown: not loading and no items.
pub fn is_data_empty<T>(is_loading: bool, items: &[T]) -> bool {
    !is_loading && items.is_empty()
}

enum EmptyInput {
    Loading(bool),
    Empty(bool),
}

/// [`is_data_empty`] over the latest loading flag and the latest item collection.
///
/// Emits once both sources have produced a value, consecutive duplicates are suppressed.
pub fn data_empty_stream<T>(
    is_loading: impl Stream<Item = bool> + Send + 'static,
    items: impl Stream<Item = Vec<T>> + Send + 'static,
) -> BoxStream<'static, bool>
where
    T: Send + 'static,
{
    let merged = stream::select(
        is_loading.map(EmptyInput::Loading),
        items.map(|items| EmptyInput::Empty(items.is_empty())),
    );
    let combined = merged
        .scan((None, None), |(loading, empty), input| {
            match input {
                EmptyInput::Loading(value) => *loading = Some(value),
                EmptyInput::Empty(value) => *empty = Some(value),
            }
            let shown = match (*loading, *empty) {
                (Some(loading), Some(empty)) => Some(!loading && empty),
                _ => None,
            };
            future::ready(Some(shown))
        })
        .filter_map(future::ready);
    distinct_until_changed(combined)
}

/// The item at `index`, `None` when out of range.
pub fn select_item<T>(index: usize, items: &[T]) -> Option<&T> {
    items.get(index)
}

enum SelectInput<T> {
    Index(usize),
    Items(Vec<T>),
}

/// Resolve every index against the latest item collection.
///
/// Only index events emit, item updates are just remembered. Indexes arriving before any items,
/// or out of range of the latest items, are skipped.
pub fn select_item_stream<T>(
    index: impl Stream<Item = usize> + Send + 'static,
    items: impl Stream<Item = Vec<T>> + Send + 'static,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::select(index.map(SelectInput::Index), items.map(SelectInput::Items))
        .scan(None::<Vec<T>>, |latest, input| {
            let selected = match input {
                SelectInput::Items(items) => {
                    *latest = Some(items);
                    None
                }
                SelectInput::Index(index) => latest
                    .as_deref()
                    .and_then(|items| select_item(index, items))
                    .cloned(),
            };
            future::ready(Some(selected))
        })
        .filter_map(future::ready)
        .boxed()
}

/// `true` while any source's latest value is `true`.
///
/// Emits once every source has produced a value.
pub fn any_of(sources: Vec<Subscription<bool>>) -> BoxStream<'static, bool> {
    combine_latest(sources)
        .map(|latest| latest.contains(&true))
        .boxed()
}

/// `true` while every source's latest value is `true`.
///
/// Emits once every source has produced a value.
pub fn all_of(sources: Vec<Subscription<bool>>) -> BoxStream<'static, bool> {
    combine_latest(sources)
        .map(|latest| latest.iter().all(|value| *value))
        .boxed()
}
