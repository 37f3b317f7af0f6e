//! Priority-ordered asynchronous fetch scheduling.
//!
//! The scheduler owns the queue of fetch/decode commands issued by the
//! layers each frame. It executes a bounded number concurrently on the
//! tokio runtime, coalesces duplicate requests for the same source key,
//! supports cancellation at every stage, and reports completions back to
//! the issuing layer on the coordinating thread.
//!
//! # Architecture
//!
//! ```text
//! Layer.update ──submit──► CommandQueue ──pump──► tokio tasks
//!                             (priority)            (≤ cap in flight)
//!                                                        │
//! Layer.apply ◄──sink◄── completion channel ◄──send──────┘
//! ```
//!
//! Two invariants hold throughout:
//!
//! - At most one fetch per source key is in flight at a time; concurrent
//!   requesters for the same key share the single execution's result.
//! - Cancel always wins: a command cancelled before its result is applied
//!   never delivers success, and an in-flight cancellation frees the
//!   execution slot immediately instead of waiting for the fetch.
//!
//! All TileNode and scene-graph mutation stays on the thread that calls
//! [`Scheduler::pump`]; worker tasks only fetch and decode.

mod command;
mod policy;
mod queue;

pub use command::{
    CollectingSink, CommandHandle, CommandId, Completion, CompletionSink, FetchCommand, Requester,
};
pub use policy::{Priority, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::source::{SourceError, SourceKey, TilePayload};
use crate::telemetry::StreamingMetrics;
use queue::{CommandQueue, PendingCommand, RequesterSlot};

/// Default cap on simultaneously executing fetch/decode commands.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of commands executing at once; the rest queue.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

struct InFlightCommand {
    execution: u64,
    token: CancellationToken,
    slots: Vec<RequesterSlot>,
    started_at: Instant,
}

struct RawCompletion {
    key: SourceKey,
    execution: u64,
    result: Result<TilePayload, SourceError>,
}

/// Priority queue of asynchronous fetch commands with bounded
/// concurrency, coalescing, and cancellation.
pub struct Scheduler {
    config: SchedulerConfig,
    runtime: tokio::runtime::Handle,
    metrics: Arc<StreamingMetrics>,
    queue: CommandQueue,
    in_flight: HashMap<SourceKey, InFlightCommand>,
    running: usize,
    next_command: u64,
    next_sequence: u64,
    next_execution: u64,
    completion_tx: mpsc::UnboundedSender<RawCompletion>,
    completion_rx: mpsc::UnboundedReceiver<RawCompletion>,
}

impl Scheduler {
    /// Creates a scheduler that spawns fetch work onto `runtime`.
    pub fn new(
        config: SchedulerConfig,
        runtime: tokio::runtime::Handle,
        metrics: Arc<StreamingMetrics>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            config,
            runtime,
            metrics,
            queue: CommandQueue::new(),
            in_flight: HashMap::new(),
            running: 0,
            next_command: 0,
            next_sequence: 0,
            next_execution: 0,
            completion_tx,
            completion_rx,
        }
    }

    /// Submits a command, returning a handle for cancellation.
    ///
    /// If a command for the same source key is already pending or in
    /// flight, this submission attaches to it instead of scheduling a
    /// second fetch; the attached requester receives a clone of the
    /// shared result. A more urgent duplicate raises the pending
    /// command's priority.
    pub fn submit(&mut self, command: FetchCommand) -> CommandHandle {
        self.metrics.command_submitted();
        let id = CommandId(self.next_command);
        self.next_command += 1;
        let handle = CommandHandle {
            id,
            key: command.key.clone(),
        };
        let slot = RequesterSlot::new(id, command.requester);

        if let Some(in_flight) = self.in_flight.get_mut(&command.key) {
            trace!(key = %command.key, "Coalescing onto in-flight command");
            in_flight.slots.push(slot);
            self.metrics.command_coalesced();
            return handle;
        }
        if self.queue.contains_key(&command.key) {
            trace!(key = %command.key, "Coalescing onto queued command");
            self.queue.attach(&command.key, slot, command.priority);
            self.metrics.command_coalesced();
            return handle;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push(PendingCommand {
            key: command.key,
            source: command.source,
            retry: command.retry,
            priority: command.priority,
            sequence,
            enqueued_at: Instant::now(),
            slots: vec![slot],
        });
        handle
    }

    /// Cancels a command.
    ///
    /// A queued command is removed immediately. For an in-flight command
    /// the requester is detached; when the last requester goes, the fetch
    /// is aborted, its slot is freed at once, and any late-arriving
    /// result is discarded.
    pub fn cancel(&mut self, handle: &CommandHandle) {
        if self.queue.cancel_slot(&handle.key, handle.id) {
            self.metrics.command_cancelled();
            return;
        }
        let Some(in_flight) = self.in_flight.get_mut(&handle.key) else {
            // Already completed or never known; nothing to do.
            return;
        };
        let Some(slot) = in_flight.slots.iter_mut().find(|s| s.id == handle.id) else {
            return;
        };
        if slot.cancelled {
            return;
        }
        slot.cancelled = true;
        self.metrics.command_cancelled();
        if in_flight.slots.iter().all(|s| s.cancelled) {
            debug!(key = %handle.key, "Abandoning in-flight command");
            let abandoned = self.in_flight.remove(&handle.key);
            if let Some(abandoned) = abandoned {
                abandoned.token.cancel();
            }
            // Free the slot now rather than waiting for the fetch to
            // notice; the stale completion is dropped by execution id.
            self.running -= 1;
        }
    }

    /// Number of commands waiting for an execution slot.
    pub fn commands_waiting_execution_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of commands currently executing.
    pub fn execution_count(&self) -> usize {
        self.running
    }

    /// True when nothing is queued or executing.
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.queue.is_empty()
    }

    /// Advances execution: applies arrived completions through `sink` and
    /// starts queued commands while slots are free. Called once per
    /// main-loop cycle on the coordinating thread.
    ///
    /// Returns the number of completions applied.
    pub fn pump(&mut self, sink: &mut dyn CompletionSink) -> usize {
        let applied = self.drain_completions(sink);
        while self.running < self.config.max_concurrent {
            let Some(pending) = self.queue.pop() else {
                break;
            };
            self.start(pending);
        }
        applied
    }

    fn drain_completions(&mut self, sink: &mut dyn CompletionSink) -> usize {
        let mut applied = 0;
        while let Ok(raw) = self.completion_rx.try_recv() {
            let matches = self
                .in_flight
                .get(&raw.key)
                .is_some_and(|cmd| cmd.execution == raw.execution);
            if !matches {
                // Cancelled while in flight; the slot was already freed.
                trace!(key = %raw.key, "Discarding stale completion");
                continue;
            }
            let Some(command) = self.in_flight.remove(&raw.key) else {
                continue;
            };
            self.running -= 1;

            match &raw.result {
                Ok(payload) => {
                    self.metrics.command_executed();
                    self.metrics.bytes_decoded(payload.byte_len() as u64);
                    trace!(
                        key = %raw.key,
                        elapsed_ms = command.started_at.elapsed().as_millis() as u64,
                        "Command completed"
                    );
                }
                Err(error) => {
                    self.metrics.command_failed();
                    warn!(key = %raw.key, %error, "Command failed");
                }
            }

            for slot in command.slots {
                if slot.cancelled {
                    continue;
                }
                sink.apply(Completion {
                    requester: slot.requester,
                    key: raw.key.clone(),
                    result: raw.result.clone(),
                });
                applied += 1;
            }
        }
        applied
    }

    fn start(&mut self, pending: PendingCommand) {
        let execution = self.next_execution;
        self.next_execution += 1;
        trace!(
            key = %pending.key,
            waited_ms = pending.enqueued_at.elapsed().as_millis() as u64,
            "Starting command"
        );
        let token = CancellationToken::new();
        let key = pending.key.clone();
        let source = pending.source;
        let retry = pending.retry;
        let tx = self.completion_tx.clone();
        let task_token = token.clone();
        let task_key = key.clone();

        self.in_flight.insert(
            key,
            InFlightCommand {
                execution,
                token,
                slots: pending.slots,
                started_at: Instant::now(),
            },
        );
        self.running += 1;

        self.runtime.spawn(async move {
            let mut attempt = 1u32;
            let result = loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        // Abandoned; the scheduler freed the slot already.
                        return;
                    }
                    fetched = source.fetch_and_decode(task_key.clone()) => match fetched {
                        Ok(payload) => break Ok(payload),
                        Err(error) if error.is_transient() => {
                            match retry.delay_for_attempt(attempt) {
                                Some(delay) => {
                                    trace!(key = %task_key, attempt, "Retrying transient failure");
                                    attempt += 1;
                                    tokio::time::sleep(delay).await;
                                }
                                None => break Err(error),
                            }
                        }
                        Err(error) => break Err(error),
                    }
                }
            };
            // Receiver dropped means the scheduler is gone; nothing to do.
            let _ = tx.send(RawCompletion {
                key: task_key,
                execution,
                result,
            });
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("waiting", &self.queue.len())
            .field("running", &self.running)
            .field("max_concurrent", &self.config.max_concurrent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{Crs, TileId};
    use crate::layer::LayerId;
    use crate::source::{Source, SyntheticSource, SyntheticSourceConfig, PayloadKind};
    use std::time::Duration;

    fn scheduler(max_concurrent: usize) -> Scheduler {
        Scheduler::new(
            SchedulerConfig { max_concurrent },
            tokio::runtime::Handle::current(),
            Arc::new(StreamingMetrics::new()),
        )
    }

    fn command(
        source: &Arc<SyntheticSource>,
        layer: &str,
        tile: TileId,
        priority: Priority,
    ) -> FetchCommand {
        let key = source.build_key(tile, &Crs::new("EPSG:3857"));
        let src: Arc<dyn Source> = source.clone();
        FetchCommand::new(key, Requester::new(LayerId::new(layer), tile), src)
            .with_priority(priority)
    }

    /// Pumps until `expected` completions arrive or the deadline passes.
    async fn pump_until(
        scheduler: &mut Scheduler,
        sink: &mut CollectingSink,
        expected: usize,
    ) {
        for _ in 0..500 {
            scheduler.pump(sink);
            if sink.completions.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "expected {} completions, got {}",
            expected,
            sink.completions.len()
        );
    }

    #[tokio::test]
    async fn test_fetch_completes_and_routes_to_requester() {
        let source = Arc::new(SyntheticSource::terrain("ground"));
        let mut scheduler = scheduler(4);
        let mut sink = CollectingSink::default();

        let tile = TileId::new(2, 1, 1).unwrap();
        scheduler.submit(command(&source, "terrain", tile, Priority::REFINE));
        assert_eq!(scheduler.commands_waiting_execution_count(), 1);

        pump_until(&mut scheduler, &mut sink, 1).await;
        let completion = &sink.completions[0];
        assert_eq!(completion.requester.tile, tile);
        assert_eq!(completion.requester.layer, LayerId::new("terrain"));
        assert!(completion.result.is_ok());
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_duplicate_key_executes_once_and_shares_result() {
        let source = Arc::new(SyntheticSource::terrain("ground"));
        let mut scheduler = scheduler(4);
        let mut sink = CollectingSink::default();

        let tile = TileId::new(2, 1, 1).unwrap();
        scheduler.submit(command(&source, "view-a", tile, Priority::REFINE));
        scheduler.submit(command(&source, "view-b", tile, Priority::REFINE));

        pump_until(&mut scheduler, &mut sink, 2).await;
        // One fetch, two requesters, identical payloads.
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(sink.completions.len(), 2);
        let a = sink.completions[0].result.as_ref().unwrap();
        let b = sink.completions[1].result.as_ref().unwrap();
        assert_eq!(a.body(), b.body());
    }

    #[tokio::test]
    async fn test_coalescing_onto_in_flight_command() {
        let config = SyntheticSourceConfig::new("slow", PayloadKind::Terrain)
            .with_latency(Duration::from_millis(30));
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(4);
        let mut sink = CollectingSink::default();

        let tile = TileId::new(2, 1, 1).unwrap();
        scheduler.submit(command(&source, "first", tile, Priority::REFINE));
        // Start the fetch, then submit a duplicate while it is in flight.
        scheduler.pump(&mut sink);
        assert_eq!(scheduler.execution_count(), 1);
        scheduler.submit(command(&source, "second", tile, Priority::REFINE));
        assert_eq!(scheduler.commands_waiting_execution_count(), 0);

        pump_until(&mut scheduler, &mut sink, 2).await;
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_command_never_delivers() {
        let source = Arc::new(SyntheticSource::terrain("ground"));
        let mut scheduler = scheduler(4);
        let mut sink = CollectingSink::default();

        let handle = scheduler.submit(command(
            &source,
            "terrain",
            TileId::new(2, 1, 1).unwrap(),
            Priority::REFINE,
        ));
        scheduler.cancel(&handle);
        assert_eq!(scheduler.commands_waiting_execution_count(), 0);

        // Give any stray work a chance to surface.
        for _ in 0..10 {
            scheduler.pump(&mut sink);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(sink.completions.is_empty());
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_frees_slot_and_discards_result() {
        let config = SyntheticSourceConfig::new("slow", PayloadKind::Terrain)
            .with_latency(Duration::from_millis(50));
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(1);
        let mut sink = CollectingSink::default();

        let tile_a = TileId::new(2, 0, 0).unwrap();
        let tile_b = TileId::new(2, 0, 1).unwrap();
        let handle_a = scheduler.submit(command(&source, "terrain", tile_a, Priority::REFINE));
        scheduler.submit(command(&source, "terrain", tile_b, Priority::REFINE));

        scheduler.pump(&mut sink);
        assert_eq!(scheduler.execution_count(), 1);
        assert_eq!(scheduler.commands_waiting_execution_count(), 1);

        // Cancel the in-flight command: its slot frees immediately so the
        // second command starts without waiting for the first fetch.
        scheduler.cancel(&handle_a);
        scheduler.pump(&mut sink);
        assert_eq!(scheduler.execution_count(), 1);
        assert_eq!(scheduler.commands_waiting_execution_count(), 0);

        pump_until(&mut scheduler, &mut sink, 1).await;
        assert_eq!(sink.completions.len(), 1);
        assert_eq!(sink.completions[0].requester.tile, tile_b);
    }

    #[tokio::test]
    async fn test_cancel_one_coalesced_requester_keeps_others() {
        let config = SyntheticSourceConfig::new("slow", PayloadKind::Terrain)
            .with_latency(Duration::from_millis(20));
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(4);
        let mut sink = CollectingSink::default();

        let tile = TileId::new(2, 1, 1).unwrap();
        let handle_a = scheduler.submit(command(&source, "view-a", tile, Priority::REFINE));
        scheduler.submit(command(&source, "view-b", tile, Priority::REFINE));
        scheduler.pump(&mut sink);
        scheduler.cancel(&handle_a);

        pump_until(&mut scheduler, &mut sink, 1).await;
        assert_eq!(sink.completions.len(), 1);
        assert_eq!(sink.completions[0].requester.layer, LayerId::new("view-b"));
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        let config = SyntheticSourceConfig::new("slow", PayloadKind::Terrain)
            .with_latency(Duration::from_millis(30));
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(2);
        let mut sink = CollectingSink::default();

        for i in 0..5u32 {
            scheduler.submit(command(
                &source,
                "terrain",
                TileId::new(3, i / 2, i % 2 + (i / 4) * 2).unwrap(),
                Priority::REFINE,
            ));
        }
        scheduler.pump(&mut sink);
        assert_eq!(scheduler.execution_count(), 2);
        assert_eq!(scheduler.commands_waiting_execution_count(), 3);

        pump_until(&mut scheduler, &mut sink, 5).await;
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_priority_starves_prefetch() {
        let config = SyntheticSourceConfig::new("slow", PayloadKind::Terrain)
            .with_latency(Duration::from_millis(10));
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(1);
        let mut sink = CollectingSink::default();

        let prefetch_tile = TileId::new(2, 0, 0).unwrap();
        let refine_tile = TileId::new(2, 0, 1).unwrap();
        scheduler.submit(command(&source, "terrain", prefetch_tile, Priority::PREFETCH));
        scheduler.submit(command(&source, "terrain", refine_tile, Priority::REFINE));

        pump_until(&mut scheduler, &mut sink, 2).await;
        // The refine command jumped the earlier prefetch.
        assert_eq!(sink.completions[0].requester.tile, refine_tile);
        assert_eq!(sink.completions[1].requester.tile, prefetch_tile);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let config = SyntheticSourceConfig::new("flaky", PayloadKind::Terrain).with_fail_every(2);
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(1);
        let mut sink = CollectingSink::default();

        // First fetch succeeds (count 1), second fails (count 2) and
        // retries (count 3).
        let tile_a = TileId::new(2, 0, 0).unwrap();
        let tile_b = TileId::new(2, 0, 1).unwrap();
        let src: Arc<dyn Source> = source.clone();
        scheduler.submit(
            FetchCommand::new(
                source.build_key(tile_a, &Crs::new("EPSG:3857")),
                Requester::new(LayerId::new("terrain"), tile_a),
                src.clone(),
            )
            .with_priority(Priority::REFINE)
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1))),
        );
        scheduler.submit(
            FetchCommand::new(
                source.build_key(tile_b, &Crs::new("EPSG:3857")),
                Requester::new(LayerId::new("terrain"), tile_b),
                src,
            )
            .with_priority(Priority::REFINE)
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1))),
        );

        pump_until(&mut scheduler, &mut sink, 2).await;
        assert!(sink.completions.iter().all(|c| c.result.is_ok()));
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_reports_error() {
        let bad = TileId::new(1, 0, 0).unwrap();
        let config =
            SyntheticSourceConfig::new("poison", PayloadKind::Terrain).with_poisoned_tile(bad);
        let source = Arc::new(SyntheticSource::new(config));
        let mut scheduler = scheduler(1);
        let mut sink = CollectingSink::default();

        scheduler.submit(command(&source, "terrain", bad, Priority::REFINE));
        pump_until(&mut scheduler, &mut sink, 1).await;

        let result = &sink.completions[0].result;
        assert!(matches!(result, Err(SourceError::Decode(_))));
    }
}
