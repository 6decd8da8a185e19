#![allow(clippy::type_complexity)]
#![warn(missing_docs)]
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod activity;
mod dispatch;
mod error_tracker;
mod events;
mod fetch_list;
mod fetch_options;
mod fetch_page;
mod page_activity;
mod paged_result;
mod subscriptions;
mod trigger;
mod utils;
pub mod view;

pub use activity::*;
pub use dispatch::{FetchFn, LoadMoreFn, MapperFn};
pub use error_tracker::*;
pub use events::{DropReason, FetchEvent, FetchEventVariant};
pub use fetch_list::*;
pub use fetch_options::*;
pub use fetch_page::*;
pub use page_activity::*;
pub use paged_result::*;
pub use subscriptions::{Emitter, Signal, Subscription};
pub use trigger::*;
