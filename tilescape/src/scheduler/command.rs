//! Fetch commands, handles, and completion routing types.
//!
//! A command asks the scheduler to fetch and decode one tile from one
//! source on behalf of one TileNode. Submitting returns a
//! [`CommandHandle`] used for cancellation; results come back as
//! [`Completion`] values delivered to a [`CompletionSink`] during
//! [`Scheduler::pump`](super::Scheduler::pump) on the coordinating
//! thread.

use std::fmt;
use std::sync::Arc;

use super::policy::{Priority, RetryPolicy};
use crate::coord::TileId;
use crate::layer::LayerId;
use crate::source::{Source, SourceError, SourceKey, TilePayload};

/// Unique id of one submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub(super) u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// The layer and tile a command was issued for; completions are routed
/// back to this address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requester {
    pub layer: LayerId,
    pub tile: TileId,
}

impl Requester {
    pub fn new(layer: LayerId, tile: TileId) -> Self {
        Self { layer, tile }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.tile)
    }
}

/// A request to fetch and decode one tile.
pub struct FetchCommand {
    pub(super) key: SourceKey,
    pub(super) requester: Requester,
    pub(super) priority: Priority,
    pub(super) source: Arc<dyn Source>,
    pub(super) retry: RetryPolicy,
}

impl FetchCommand {
    pub fn new(key: SourceKey, requester: Requester, source: Arc<dyn Source>) -> Self {
        Self {
            key,
            requester,
            priority: Priority::default(),
            source,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the scheduling priority (recomputed by the caller each
    /// submission from current screen-space error).
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the transient-failure retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Debug for FetchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCommand")
            .field("key", &self.key.to_string())
            .field("requester", &self.requester.to_string())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Handle returned from `submit`, used to cancel the command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    pub(super) id: CommandId,
    pub(super) key: SourceKey,
}

impl CommandHandle {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }
}

/// One delivered result: the payload or error a requester's fetch ended
/// with. Coalesced requesters each receive their own completion carrying
/// a clone of the shared result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub requester: Requester,
    pub key: SourceKey,
    pub result: Result<TilePayload, SourceError>,
}

/// Receives completions during `pump` on the coordinating thread.
///
/// Implemented by the view, which routes each completion to the issuing
/// layer; tests use a collecting sink.
pub trait CompletionSink {
    fn apply(&mut self, completion: Completion);
}

/// Sink that collects completions into a vector. Test helper, also handy
/// for headless tools that drain the scheduler without a view.
#[derive(Default)]
pub struct CollectingSink {
    pub completions: Vec<Completion>,
}

impl CompletionSink for CollectingSink {
    fn apply(&mut self, completion: Completion) {
        self.completions.push(completion);
    }
}
