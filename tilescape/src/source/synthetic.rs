//! Procedural source for simulations and tests.
//!
//! Generates deterministic payloads from the tile key with configurable
//! latency and failure injection. The CLI simulator streams from this
//! source; integration tests use it to exercise the scheduler without any
//! network dependency.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::{BoxFuture, PayloadKind, Source, SourceError, SourceKey, TilePayload};
use crate::coord::TileId;

/// Default payload size in bytes.
pub const DEFAULT_PAYLOAD_BYTES: usize = 4096;

/// Configuration for a [`SyntheticSource`].
#[derive(Clone, Debug)]
pub struct SyntheticSourceConfig {
    /// Source name used in keys and logs.
    pub name: String,

    /// Kind of payload this source produces.
    pub kind: PayloadKind,

    /// Size of each generated payload.
    pub payload_bytes: usize,

    /// Simulated fetch latency per tile.
    pub latency: Duration,

    /// Inject a transient failure on every Nth fetch (1-based count).
    pub fail_every: Option<u64>,

    /// Tiles that always fail with a decode error.
    pub poisoned_tiles: HashSet<TileId>,
}

impl SyntheticSourceConfig {
    pub fn new(name: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            name: name.into(),
            kind,
            payload_bytes: DEFAULT_PAYLOAD_BYTES,
            latency: Duration::ZERO,
            fail_every: None,
            poisoned_tiles: HashSet::new(),
        }
    }

    pub fn with_payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn with_poisoned_tile(mut self, tile: TileId) -> Self {
        self.poisoned_tiles.insert(tile);
        self
    }
}

/// Deterministic in-process source.
pub struct SyntheticSource {
    config: SyntheticSourceConfig,
    fetch_count: AtomicU64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticSourceConfig) -> Self {
        Self {
            config,
            fetch_count: AtomicU64::new(0),
        }
    }

    /// Terrain source with default settings.
    pub fn terrain(name: impl Into<String>) -> Self {
        Self::new(SyntheticSourceConfig::new(name, PayloadKind::Terrain))
    }

    /// Imagery source with default settings.
    pub fn imagery(name: impl Into<String>) -> Self {
        Self::new(SyntheticSourceConfig::new(name, PayloadKind::Imagery))
    }

    /// Elevation source with default settings.
    pub fn elevation(name: impl Into<String>) -> Self {
        Self::new(SyntheticSourceConfig::new(name, PayloadKind::Elevation))
    }

    /// Total fetches attempted so far (including failures).
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    fn generate(&self, key: &SourceKey) -> TilePayload {
        // Deterministic body derived from the key so repeated fetches are
        // byte-identical and tests can assert on content.
        let seed = key.to_string();
        let body: Vec<u8> = seed
            .as_bytes()
            .iter()
            .cycle()
            .take(self.config.payload_bytes)
            .copied()
            .collect();
        TilePayload::new(self.config.kind, Bytes::from(body))
    }
}

impl Source for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn fetch_and_decode(&self, key: SourceKey) -> BoxFuture<'_, Result<TilePayload, SourceError>> {
        Box::pin(async move {
            if !self.config.latency.is_zero() {
                tokio::time::sleep(self.config.latency).await;
            }
            let count = self.fetch_count.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(n) = self.config.fail_every {
                if count % n == 0 {
                    return Err(SourceError::Transient(format!(
                        "injected failure on fetch #{count}"
                    )));
                }
            }
            if self.config.poisoned_tiles.contains(&key.tile()) {
                return Err(SourceError::Decode(format!("poisoned tile {}", key.tile())));
            }
            Ok(self.generate(&key))
        })
    }
}
