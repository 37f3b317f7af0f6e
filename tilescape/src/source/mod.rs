//! Data source abstraction and decoded-tile caching.
//!
//! A [`Source`] knows how to build a fetch request for a spatial key and
//! how to fetch and decode one tile of its dataset. The engine never talks
//! a tile protocol itself; concrete sources (tile servers, local archives,
//! procedural generators) live behind this trait.
//!
//! Decoded payloads are cached in a [`DecodeCache`] shared by every layer
//! and view that holds the same source, with reference counting that keeps
//! an entry alive exactly as long as some displayed tile uses it and some
//! view still needs its CRS.
//!
//! # Dyn Compatibility
//!
//! Async trait methods use `Pin<Box<dyn Future>>` so sources can be stored
//! as `Arc<dyn Source>` and handed to the scheduler's worker tasks.

mod cache;
mod synthetic;

pub use cache::DecodeCache;
pub use synthetic::{SyntheticSource, SyntheticSourceConfig};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::coord::{Crs, TileId};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Payloads
// =============================================================================

/// What a decoded payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Tiled geometry: terrain patches, meshes, point-cloud cells.
    Terrain,
    /// Raster imagery draped over geometry.
    Imagery,
    /// Elevation data applied to geometry.
    Elevation,
}

/// A decoded tile payload ready to attach to the scene graph.
///
/// The body is reference-counted ([`Bytes`]), so cloning a payload for
/// coalesced requesters or cache entries is cheap.
#[derive(Debug, Clone)]
pub struct TilePayload {
    kind: PayloadKind,
    body: Bytes,
}

impl TilePayload {
    pub fn new(kind: PayloadKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decoded size in bytes, used for telemetry and budget accounting.
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors a source can report from fetch/decode work.
///
/// Cloneable because a coalesced command delivers the same error to every
/// requester.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Transient failure (network timeout, service overload); the command
    /// may be retried.
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// The payload arrived but could not be decoded; retrying will not
    /// help.
    #[error("Malformed payload: {0}")]
    Decode(String),

    /// The source has no data for this key.
    #[error("No data for key {0}")]
    NotFound(String),

    /// Source startup work failed; the owning layer never becomes ready.
    #[error("Source initialization failed: {0}")]
    Init(String),
}

impl SourceError {
    /// Returns true if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Cache/request key identifying one tile of one source in one CRS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    source: String,
    tile: TileId,
    crs: Crs,
}

impl SourceKey {
    pub fn new(source: impl Into<String>, tile: TileId, crs: Crs) -> Self {
        Self {
            source: source.into(),
            tile,
            crs,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.source, self.tile, self.crs)
    }
}

// =============================================================================
// Source trait
// =============================================================================

/// A leaf data provider: builds request keys and fetches/decodes tiles.
///
/// Implementations must be `Send + Sync`; `fetch_and_decode` runs on the
/// scheduler's worker tasks, everything else on the coordinating thread.
pub trait Source: Send + Sync {
    /// Short name used in keys, logs, and telemetry.
    fn name(&self) -> &str;

    /// Builds the request key for a tile in the given CRS.
    fn build_key(&self, tile: TileId, crs: &Crs) -> SourceKey {
        SourceKey::new(self.name(), tile, crs.clone())
    }

    /// Startup work that must finish before a layer over this source is
    /// ready (manifest fetch, index load). Defaults to nothing.
    fn initialize(&self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async { Ok(()) })
    }

    /// Fetches and decodes the tile for `key`.
    fn fetch_and_decode(&self, key: SourceKey) -> BoxFuture<'_, Result<TilePayload, SourceError>>;

    /// Notifies the source that no view needs the given CRS any more, so
    /// CRS-specific state (projection grids, resampled indices) may be
    /// released. `None` means the source is entirely unused.
    fn on_layer_removed(&self, unused_crs: Option<&Crs>) {
        let _ = unused_crs;
    }
}

// =============================================================================
// Shared handle
// =============================================================================

/// A source paired with its process-wide decode cache.
///
/// Cloning the handle shares both; every layer (in any view) built over
/// the same dataset should clone one handle so cache entries and CRS
/// accounting are shared.
#[derive(Clone)]
pub struct SourceHandle {
    source: Arc<dyn Source>,
    cache: Arc<DecodeCache>,
}

impl SourceHandle {
    pub fn new(source: impl Source + 'static) -> Self {
        Self {
            source: Arc::new(source),
            cache: Arc::new(DecodeCache::new()),
        }
    }

    pub fn from_arc(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            cache: Arc::new(DecodeCache::new()),
        }
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.cache
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn build_key(&self, tile: TileId, crs: &Crs) -> SourceKey {
        self.source.build_key(tile, crs)
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("source", &self.source.name())
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}
