//! Streaming telemetry for observability and user feedback.
//!
//! Lock-free atomic counters instrumented by the scheduler, layers, and
//! cache, with point-in-time snapshots for display.
//!
//! # Architecture
//!
//! ```text
//! Scheduler / Layers ────► StreamingMetrics ────► TelemetrySnapshot ────► Views
//!                          (atomic counters)      (point-in-time copy)    (CLI, etc.)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lock-free counters for the streaming pipeline.
///
/// Shared as `Arc<StreamingMetrics>` between the scheduler, layers, and
/// the decode cache; all methods are cheap enough to call per event.
#[derive(Debug)]
pub struct StreamingMetrics {
    started_at: Instant,
    commands_submitted: AtomicU64,
    commands_coalesced: AtomicU64,
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
    commands_cancelled: AtomicU64,
    tiles_displayed: AtomicU64,
    tiles_evicted: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bytes_decoded: AtomicU64,
}

impl StreamingMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            commands_submitted: AtomicU64::new(0),
            commands_coalesced: AtomicU64::new(0),
            commands_executed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_cancelled: AtomicU64::new(0),
            tiles_displayed: AtomicU64::new(0),
            tiles_evicted: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            bytes_decoded: AtomicU64::new(0),
        }
    }

    pub fn command_submitted(&self) {
        self.commands_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A submission that attached to an already-pending command for the
    /// same source key instead of executing its own fetch.
    pub fn command_coalesced(&self) {
        self.commands_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_cancelled(&self) {
        self.commands_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_displayed(&self) {
        self.tiles_displayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_evicted(&self) {
        self.tiles_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_decoded(&self, bytes: u64) {
        self.bytes_decoded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot for display or serialization.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let elapsed_secs = self.started_at.elapsed().as_secs_f64();
        let commands_executed = self.commands_executed.load(Ordering::Relaxed);
        let bytes_decoded = self.bytes_decoded.load(Ordering::Relaxed);
        TelemetrySnapshot {
            captured_at: Utc::now(),
            elapsed_secs,
            commands_submitted: self.commands_submitted.load(Ordering::Relaxed),
            commands_coalesced: self.commands_coalesced.load(Ordering::Relaxed),
            commands_executed,
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_cancelled: self.commands_cancelled.load(Ordering::Relaxed),
            tiles_displayed: self.tiles_displayed.load(Ordering::Relaxed),
            tiles_evicted: self.tiles_evicted.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_decoded,
            fetches_per_second: if elapsed_secs > 0.0 {
                commands_executed as f64 / elapsed_secs
            } else {
                0.0
            },
            bytes_per_second: if elapsed_secs > 0.0 {
                bytes_decoded as f64 / elapsed_secs
            } else {
                0.0
            },
        }
    }
}

impl Default for StreamingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable point-in-time copy of [`StreamingMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub captured_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub commands_submitted: u64,
    pub commands_coalesced: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub commands_cancelled: u64,
    pub tiles_displayed: u64,
    pub tiles_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_decoded: u64,
    pub fetches_per_second: f64,
    pub bytes_per_second: f64,
}

impl TelemetrySnapshot {
    /// Cache hit ratio over all lookups, or zero with no traffic.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
