//! Priority queue of pending fetch commands.
//!
//! Commands are ordered by priority (higher first), then by submission
//! order (FIFO within a priority level). The queue holds at most one
//! pending command per source key: later submissions for the same key
//! attach as additional requesters and may raise the command's priority.
//!
//! Cancellation and priority bumps use lazy heap deletion: the heap keeps
//! stale entries that `pop` skips when they no longer match the live
//! command for their key.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use super::command::{CommandId, Requester};
use super::policy::{Priority, RetryPolicy};
use crate::source::{Source, SourceKey};

/// One requester attached to a pending or in-flight command.
#[derive(Debug, Clone)]
pub(super) struct RequesterSlot {
    pub id: CommandId,
    pub requester: Requester,
    pub cancelled: bool,
}

impl RequesterSlot {
    pub fn new(id: CommandId, requester: Requester) -> Self {
        Self {
            id,
            requester,
            cancelled: false,
        }
    }
}

/// A command waiting for an execution slot.
pub(super) struct PendingCommand {
    pub key: SourceKey,
    pub source: Arc<dyn Source>,
    pub retry: RetryPolicy,
    pub priority: Priority,
    pub sequence: u64,
    pub enqueued_at: Instant,
    pub slots: Vec<RequesterSlot>,
}

impl PendingCommand {
    fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.cancelled).count()
    }
}

struct HeapEntry {
    priority: Priority,
    sequence: u64,
    key: SourceKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older)
        // first for FIFO within a priority level.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Priority queue with per-key coalescing and lazy deletion.
#[derive(Default)]
pub(super) struct CommandQueue {
    heap: BinaryHeap<HeapEntry>,
    pending: HashMap<SourceKey, PendingCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Number of pending commands (not heap entries, which may include
    /// stale duplicates).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains_key(&self, key: &SourceKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Enqueues a new command. The caller guarantees no pending command
    /// exists for the key (checked via [`Self::contains_key`]).
    pub fn push(&mut self, command: PendingCommand) {
        debug_assert!(!self.pending.contains_key(&command.key));
        self.heap.push(HeapEntry {
            priority: command.priority,
            sequence: command.sequence,
            key: command.key.clone(),
        });
        self.pending.insert(command.key.clone(), command);
    }

    /// Attaches another requester to the pending command for `key`,
    /// raising its priority if the new request is more urgent.
    ///
    /// Returns false if no command is pending for the key.
    pub fn attach(&mut self, key: &SourceKey, slot: RequesterSlot, priority: Priority) -> bool {
        let Some(command) = self.pending.get_mut(key) else {
            return false;
        };
        command.slots.push(slot);
        if priority > command.priority {
            command.priority = priority;
            // Old heap entry goes stale; pop() skips it.
            self.heap.push(HeapEntry {
                priority,
                sequence: command.sequence,
                key: key.clone(),
            });
        }
        true
    }

    /// Cancels one requester of a pending command. When the last live
    /// requester is cancelled the whole command is removed from the
    /// queue.
    ///
    /// Returns true if the requester was found in the queue.
    pub fn cancel_slot(&mut self, key: &SourceKey, id: CommandId) -> bool {
        let Some(command) = self.pending.get_mut(key) else {
            return false;
        };
        let Some(slot) = command.slots.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        if slot.cancelled {
            return true;
        }
        slot.cancelled = true;
        if command.live_slots() == 0 {
            self.pending.remove(key);
        }
        true
    }

    /// Removes and returns the highest-priority pending command, skipping
    /// stale heap entries left behind by cancellations and priority
    /// bumps.
    pub fn pop(&mut self) -> Option<PendingCommand> {
        while let Some(entry) = self.heap.pop() {
            let is_live = self
                .pending
                .get(&entry.key)
                .is_some_and(|cmd| cmd.priority == entry.priority);
            if is_live {
                return self.pending.remove(&entry.key);
            }
        }
        None
    }

    /// Drops every pending command, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.heap.clear();
        dropped
    }
}
