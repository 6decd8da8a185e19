use core::fmt;
use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::FetchKind;

/// Bounded history of what an orchestrator did, oldest first.
#[derive(Debug, Clone)]
pub(crate) struct EventLog {
    events: Arc<Mutex<VecDeque<FetchEvent>>>,
    limit: usize,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(limit.min(256)))),
            limit,
        }
    }

    pub fn push(&self, variant: FetchEventVariant) {
        if self.limit == 0 {
            return;
        }
        let mut events = self.events.lock();
        while events.len() >= self.limit {
            events.pop_front();
        }
        events.push_back(FetchEvent::new(variant));
    }

    pub fn snapshot(&self) -> Vec<FetchEvent> {
        self.events.lock().iter().copied().collect()
    }
}

/// A diagnostic record of something an orchestrator did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchEvent {
    /// When it happened.
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    /// What happened.
    pub variant: FetchEventVariant,
}

impl FetchEvent {
    fn new(variant: FetchEventVariant) -> Self {
        Self {
            recorded_at: chrono::Utc::now(),
            variant,
        }
    }
}

impl fmt::Display for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.recorded_at.format("%H:%M:%S%.3f"), self.variant)
    }
}

/// Why a trigger was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Another fetch blocking this kind was in flight.
    Busy,
    /// Load-more before any first page exists.
    NoFirstPage,
}

/// See [`FetchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchEventVariant {
    /// A trigger passed the guard and its fetch callback was called.
    Dispatched {
        /// The fetch kind.
        kind: FetchKind,
    },
    /// A fetch succeeded and its result was applied.
    Fetched {
        /// The fetch kind.
        kind: FetchKind,
        /// Time from dispatch to response.
        elapsed_ms: i64,
    },
    /// A fetch failed, the error went to the error tracker.
    Failed {
        /// The fetch kind.
        kind: FetchKind,
    },
    /// A trigger was ignored.
    TriggerDropped {
        /// The fetch kind.
        kind: FetchKind,
        /// Why.
        reason: DropReason,
    },
    /// A response arrived after a newer fetch superseded it and was discarded.
    StaleDiscarded {
        /// The fetch kind.
        kind: FetchKind,
    },
    /// A load-more response with no items and no further pages was ignored.
    EmptyTailDropped,
}

impl fmt::Display for FetchEventVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchEventVariant::Dispatched { kind } => write!(f, "{kind} dispatched"),
            FetchEventVariant::Fetched { kind, elapsed_ms } => {
                write!(f, "{kind} fetched in {elapsed_ms}ms")
            }
            FetchEventVariant::Failed { kind } => write!(f, "{kind} failed"),
            FetchEventVariant::TriggerDropped { kind, reason } => match reason {
                DropReason::Busy => write!(f, "{kind} trigger dropped, busy"),
                DropReason::NoFirstPage => write!(f, "{kind} trigger dropped, no first page yet"),
            },
            FetchEventVariant::StaleDiscarded { kind } => {
                write!(f, "stale {kind} response discarded")
            }
            FetchEventVariant::EmptyTailDropped => write!(f, "empty last page ignored"),
        }
    }
}
