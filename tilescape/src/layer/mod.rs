//! Layers and per-frame refinement over their tile trees.
//!
//! A [`Layer`] binds one dataset (through a [`SourceHandle`]) into a view.
//! Tiled geometry layers own a quadtree of [`TileNode`]s and decide each
//! frame which tiles to fetch, display, cull, or evict from the camera's
//! screen-space error. Overlay layers (color imagery, elevation) carry no
//! tree of their own: their payloads are applied onto the parent geometry
//! layer's currently displayed tiles.
//!
//! The per-frame contract is split in two, mirroring the main loop:
//! [`Layer::pre_update`] computes the desired tile set from camera state,
//! and [`Layer::update`] diffs it against the tree, issuing scheduler
//! commands for missing tiles and culling or evicting the rest. Neither
//! ever blocks on a fetch; results arrive later through
//! [`Layer::apply_completion`].

mod node;

pub use node::{TileNode, TileState};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::camera::Camera;
use crate::coord::{Crs, Extent, TileId};
use crate::render::{Renderer, SceneKey};
use crate::scheduler::{
    CommandHandle, Completion, FetchCommand, Priority, Requester, RetryPolicy, Scheduler,
};
use crate::source::SourceHandle;
use crate::telemetry::StreamingMetrics;
use crate::view::ChangeSet;

/// Default screen-space error threshold in pixels above which a tile
/// refines into its children.
pub const DEFAULT_SSE_THRESHOLD: f64 = 16.0;

/// Default maximum tile subdivision level.
pub const DEFAULT_MAX_TILE_LEVEL: u8 = 18;

/// Default number of culled-but-retained payloads a layer may keep.
pub const DEFAULT_RETAINED_TILE_BUDGET: usize = 512;

/// Default idle time after which a culled tile's payload is evicted.
pub const DEFAULT_IDLE_EVICT_SECS: u64 = 30;

/// Default number of times a tile is re-requested after transient
/// failures before it is marked failed.
pub const DEFAULT_MAX_TILE_RETRIES: u32 = 3;

// =============================================================================
// Identity
// =============================================================================

/// Layer identifier, unique within a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for LayerId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for refinement, culling, and eviction.
#[derive(Clone, Debug)]
pub struct RefinementConfig {
    /// Screen-space error (pixels) above which a tile refines.
    pub sse_threshold: f64,

    /// Maximum subdivision level; tiles at this level fetch data instead
    /// of refining further.
    pub max_level: u8,

    /// How many culled-but-retained payloads to keep before evicting.
    /// Culled tiles count against this budget; loading tiles do not (they
    /// hold no payload yet).
    pub retained_budget: usize,

    /// Culled tiles idle longer than this are evicted outright.
    pub idle_evict_after: Duration,

    /// Re-request attempts after transient failures before a tile is
    /// marked failed.
    pub max_retries: u32,

    /// Vertical bounds of the layer's content, for frustum tests and
    /// camera distance.
    pub height_range: (f64, f64),

    /// Per-command retry policy handed to the scheduler.
    pub retry: RetryPolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            sse_threshold: DEFAULT_SSE_THRESHOLD,
            max_level: DEFAULT_MAX_TILE_LEVEL,
            retained_budget: DEFAULT_RETAINED_TILE_BUDGET,
            idle_evict_after: Duration::from_secs(DEFAULT_IDLE_EVICT_SECS),
            max_retries: DEFAULT_MAX_TILE_RETRIES,
            height_range: (0.0, 0.0),
            retry: RetryPolicy::exponential(3),
        }
    }
}

impl RefinementConfig {
    pub fn with_sse_threshold(mut self, threshold: f64) -> Self {
        self.sse_threshold = threshold;
        self
    }

    pub fn with_max_level(mut self, max_level: u8) -> Self {
        self.max_level = max_level.min(crate::coord::MAX_LEVEL);
        self
    }

    pub fn with_retained_budget(mut self, budget: usize) -> Self {
        self.retained_budget = budget;
        self
    }

    pub fn with_idle_evict_after(mut self, idle: Duration) -> Self {
        self.idle_evict_after = idle;
        self
    }
}

// =============================================================================
// Layer kinds
// =============================================================================

/// Per-kind layer state. The capability set is closed: every call site
/// matches exhaustively instead of probing dynamic flags.
pub enum LayerKind {
    /// Owns a tile tree and drives refinement.
    TiledGeometry(GeometryState),
    /// Raster imagery applied onto the parent geometry's displayed tiles.
    Color(OverlayState),
    /// Elevation data applied onto the parent geometry's displayed tiles.
    Elevation(OverlayState),
}

impl LayerKind {
    pub fn is_geometry(&self) -> bool {
        matches!(self, Self::TiledGeometry(_))
    }

    pub fn is_overlay(&self) -> bool {
        !self.is_geometry()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TiledGeometry(_) => "tiled-geometry",
            Self::Color(_) => "color",
            Self::Elevation(_) => "elevation",
        }
    }
}

impl fmt::Debug for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tree and bookkeeping of a tiled geometry layer.
#[derive(Default)]
pub struct GeometryState {
    root: Option<TileNode>,
    handles: HashMap<TileId, CommandHandle>,
    retries: HashMap<TileId, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlayTileState {
    Loading,
    Applied,
    Error,
}

struct OverlayTile {
    state: OverlayTileState,
    handle: Option<CommandHandle>,
}

/// Applied-tile bookkeeping of an overlay layer. Overlays follow the
/// parent geometry's displayed set rather than maintaining a tree.
#[derive(Default)]
pub struct OverlayState {
    tiles: HashMap<TileId, OverlayTile>,
    retries: HashMap<TileId, u32>,
}

// =============================================================================
// Refinement plan
// =============================================================================

/// One tile the camera wants displayed this frame.
#[derive(Debug, Clone, Copy)]
pub struct DesiredTile {
    pub tile: TileId,
    pub sse: f64,
    pub distance: f64,
}

/// Output of [`Layer::pre_update`]: the desired display set with the
/// metrics that drive request priority.
#[derive(Debug, Default)]
pub struct RefinePlan {
    pub desired: Vec<DesiredTile>,
}

impl RefinePlan {
    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

/// Counters from one [`Layer::update`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayerUpdateOutcome {
    pub submitted: usize,
    pub restored: usize,
    pub culled: usize,
    pub evicted: usize,
    pub needs_redraw: bool,
}

// =============================================================================
// Layer
// =============================================================================

/// One dataset bound into a view.
pub struct Layer {
    id: LayerId,
    kind: LayerKind,
    source: SourceHandle,
    crs: Option<Crs>,
    extent: Option<Extent>,
    ready: bool,
    sequence: u32,
    attached: Vec<LayerId>,
    config: RefinementConfig,
}

impl Layer {
    /// Creates a detached tiled geometry layer.
    pub fn tiled_geometry(id: impl Into<LayerId>, source: SourceHandle) -> Self {
        Self::new(id, LayerKind::TiledGeometry(GeometryState::default()), source)
    }

    /// Creates a detached color overlay layer.
    pub fn color(id: impl Into<LayerId>, source: SourceHandle) -> Self {
        Self::new(id, LayerKind::Color(OverlayState::default()), source)
    }

    /// Creates a detached elevation overlay layer.
    pub fn elevation(id: impl Into<LayerId>, source: SourceHandle) -> Self {
        Self::new(id, LayerKind::Elevation(OverlayState::default()), source)
    }

    fn new(id: impl Into<LayerId>, kind: LayerKind, source: SourceHandle) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            crs: None,
            extent: None,
            ready: false,
            sequence: 0,
            attached: Vec::new(),
            config: RefinementConfig::default(),
        }
    }

    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.extent = Some(extent);
        self
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn with_config(mut self, config: RefinementConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn is_geometry(&self) -> bool {
        self.kind.is_geometry()
    }

    pub fn is_overlay(&self) -> bool {
        self.kind.is_overlay()
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    pub fn crs(&self) -> Option<&Crs> {
        self.crs.as_ref()
    }

    pub fn extent(&self) -> Option<&Extent> {
        self.extent.as_ref()
    }

    /// True once all of the layer's initialization work has resolved.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Compositing position among sibling overlays.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Ids of layers attached under this one.
    pub fn attached_layers(&self) -> &[LayerId] {
        &self.attached
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub(crate) fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    pub(crate) fn attach_child(&mut self, id: LayerId) {
        self.attached.push(id);
    }

    pub(crate) fn detach_child(&mut self, id: &LayerId) {
        self.attached.retain(|child| child != id);
    }

    /// Inherits extent and CRS from the parent (or the view's reference
    /// CRS) where unset, then builds the geometry tree.
    pub(crate) fn resolve_inheritance(
        &mut self,
        parent_extent: Option<&Extent>,
        parent_crs: Option<&Crs>,
        reference_crs: &Crs,
    ) {
        if self.crs.is_none() {
            self.crs = Some(parent_crs.cloned().unwrap_or_else(|| reference_crs.clone()));
        }
        if self.extent.is_none() {
            self.extent = parent_extent.cloned();
        }
        if let (LayerKind::TiledGeometry(state), Some(extent)) = (&mut self.kind, &self.extent) {
            if state.root.is_none() {
                state.root = Some(TileNode::new(TileId::root(), extent.clone()));
            }
        }
    }

    /// Whether this cycle's change set warrants recomputing refinement:
    /// camera or viewport moved, or this layer (or one attached under it)
    /// changed.
    pub fn is_affected_by(&self, changes: &ChangeSet) -> bool {
        changes.iter().any(|change| match change {
            crate::view::ChangeSource::Camera | crate::view::ChangeSource::Viewport => true,
            crate::view::ChangeSource::Layer(id) => {
                id == &self.id || self.attached.contains(id)
            }
            crate::view::ChangeSource::External(_) => false,
        })
    }

    /// Tiles currently displayed by this geometry layer, the set overlays
    /// are applied onto.
    pub fn displayed_tiles(&self) -> Vec<TileId> {
        let LayerKind::TiledGeometry(state) = &self.kind else {
            return Vec::new();
        };
        let Some(root) = &state.root else {
            return Vec::new();
        };
        let mut tiles = Vec::new();
        root.visit(&mut |node| {
            if node.state() == TileState::Displayed {
                tiles.push(node.tile());
            }
        });
        tiles
    }

    /// Looks up a node's state, if its path has been materialized.
    pub fn tile_state(&self, tile: TileId) -> Option<TileState> {
        let LayerKind::TiledGeometry(state) = &self.kind else {
            return None;
        };
        state.root.as_ref()?.find(tile).map(|node| node.state())
    }

    // -------------------------------------------------------------------------
    // Per-frame refinement
    // -------------------------------------------------------------------------

    /// Computes the desired tile set from camera state.
    ///
    /// Returns `None` when the change set does not affect this layer, so
    /// an idle layer costs nothing per cycle. Overlay layers return an
    /// empty plan; their work is driven by the parent's displayed set in
    /// [`Layer::update_overlay`].
    pub fn pre_update(&mut self, camera: &Camera, changes: &ChangeSet) -> Option<RefinePlan> {
        if !self.is_affected_by(changes) {
            return None;
        }
        let (z_min, z_max) = self.config.height_range;
        let config = self.config.clone();
        let LayerKind::TiledGeometry(state) = &mut self.kind else {
            return Some(RefinePlan::default());
        };
        let root = state.root.as_mut()?;
        let frustum = camera.frustum();
        let mut plan = RefinePlan::default();
        Self::select(root, camera, &frustum, &config, z_min, z_max, &mut plan);
        trace!(layer = %self.id, desired = plan.desired.len(), "Computed refinement plan");
        Some(plan)
    }

    /// Recursive selection: descend while the screen-space error exceeds
    /// the threshold, keep a coarser parent displayed as fallback until
    /// every visible child can display.
    fn select(
        node: &mut TileNode,
        camera: &Camera,
        frustum: &crate::camera::Frustum,
        config: &RefinementConfig,
        z_min: f64,
        z_max: f64,
        plan: &mut RefinePlan,
    ) {
        if !frustum.intersects_extent(node.extent(), z_min, z_max) {
            return;
        }
        let distance = camera.distance_to_extent(node.extent(), z_min, z_max);
        let sse = camera.screen_space_error(node.extent().diagonal(), distance);
        let refine = sse > config.sse_threshold
            && node.tile().level() < config.max_level
            && node.ensure_children();
        if !refine {
            plan.desired.push(DesiredTile {
                tile: node.tile(),
                sse,
                distance,
            });
            return;
        }

        let children_ready = node
            .children()
            .expect("ensure_children() succeeded")
            .iter()
            .all(|child| {
                !frustum.intersects_extent(child.extent(), z_min, z_max) || child.displayable()
            });
        for child in node.children_mut().expect("ensure_children() succeeded") {
            Self::select(child, camera, frustum, config, z_min, z_max, plan);
        }
        if !children_ready {
            // Coarse fallback: stay displayed until the children arrive.
            plan.desired.push(DesiredTile {
                tile: node.tile(),
                sse,
                distance,
            });
        }
    }

    /// Diffs the desired set against the tree: requests missing tiles,
    /// restores culled ones, culls no-longer-desired ones, and evicts
    /// beyond the retained budget.
    pub fn update(
        &mut self,
        plan: &RefinePlan,
        scheduler: &mut Scheduler,
        renderer: &dyn Renderer,
        metrics: &StreamingMetrics,
    ) -> LayerUpdateOutcome {
        let mut outcome = LayerUpdateOutcome::default();
        let Some(crs) = self.crs.clone() else {
            return outcome;
        };

        // Request order: worst screen-space error first; siblings tying on
        // error prefer the one closer to the camera.
        let mut order: Vec<&DesiredTile> = plan.desired.iter().collect();
        order.sort_by(|a, b| {
            b.sse
                .partial_cmp(&a.sse)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        let desired_set: HashSet<TileId> = plan.desired.iter().map(|d| d.tile).collect();

        let id = self.id.clone();
        let source = self.source.clone();
        let retry = self.config.retry.clone();
        let LayerKind::TiledGeometry(state) = &mut self.kind else {
            return outcome;
        };
        let Some(root) = state.root.as_mut() else {
            return outcome;
        };

        for desired in order {
            let Some(node) = root.find_mut(desired.tile) else {
                continue;
            };
            match node.state() {
                TileState::Pending => {
                    let key = source.build_key(desired.tile, &crs);
                    if let Some(payload) = source.cache().acquire(&key) {
                        metrics.cache_hit();
                        renderer.attach(SceneKey::new(id.clone(), desired.tile), &payload);
                        node.mark_displayed(payload);
                        metrics.tile_displayed();
                        outcome.restored += 1;
                        outcome.needs_redraw = true;
                    } else {
                        metrics.cache_miss();
                        let handle = scheduler.submit(
                            FetchCommand::new(
                                key,
                                Requester::new(id.clone(), desired.tile),
                                source.source().clone(),
                            )
                            .with_priority(Priority::for_refinement(desired.sse))
                            .with_retry(retry.clone()),
                        );
                        state.handles.insert(desired.tile, handle);
                        node.begin_loading();
                        outcome.submitted += 1;
                    }
                }
                TileState::Culled => {
                    let payload = node.restore().clone();
                    renderer.attach(SceneKey::new(id.clone(), desired.tile), &payload);
                    outcome.restored += 1;
                    outcome.needs_redraw = true;
                }
                // Loading keeps its single outstanding command; Displayed
                // and Error need nothing.
                TileState::Loading | TileState::Displayed | TileState::Error => {}
            }
        }

        // Cull displayed tiles that fell out of the desired set.
        let now = Instant::now();
        let mut to_cull = Vec::new();
        root.visit(&mut |node| {
            if node.state() == TileState::Displayed && !desired_set.contains(&node.tile()) {
                to_cull.push(node.tile());
            }
        });
        for tile in to_cull {
            if let Some(node) = root.find_mut(tile) {
                node.cull(now);
                renderer.detach(&SceneKey::new(id.clone(), tile));
                outcome.culled += 1;
                outcome.needs_redraw = true;
            }
        }

        // Evict: culled tiles idle past the deadline, plus the oldest
        // beyond the retained budget. Loading tiles hold no payload and
        // never count.
        let mut culled: Vec<(TileId, Instant)> = Vec::new();
        root.visit(&mut |node| {
            if node.state() == TileState::Culled {
                if let Some(at) = node.culled_at() {
                    culled.push((node.tile(), at));
                }
            }
        });
        culled.sort_by_key(|(_, at)| *at);
        let over_budget = culled.len().saturating_sub(self.config.retained_budget);
        let idle_after = self.config.idle_evict_after;
        let to_evict: Vec<TileId> = culled
            .iter()
            .enumerate()
            .filter(|(i, (_, at))| *i < over_budget || now.duration_since(*at) >= idle_after)
            .map(|(_, (tile, _))| *tile)
            .collect();
        for tile in to_evict {
            if let Some(node) = root.find_mut(tile) {
                node.evict();
                source.cache().release(&source.build_key(tile, &crs));
                state.retries.remove(&tile);
                metrics.tile_evicted();
                outcome.evicted += 1;
            }
        }

        if outcome.submitted > 0 || outcome.evicted > 0 {
            debug!(
                layer = %id,
                submitted = outcome.submitted,
                restored = outcome.restored,
                culled = outcome.culled,
                evicted = outcome.evicted,
                "Layer update"
            );
        }
        outcome
    }

    /// Applies overlay payloads onto the parent geometry's displayed
    /// tiles and withdraws them from tiles no longer displayed.
    pub fn update_overlay(
        &mut self,
        parent_displayed: &[TileId],
        scheduler: &mut Scheduler,
        renderer: &dyn Renderer,
        metrics: &StreamingMetrics,
    ) -> bool {
        let Some(crs) = self.crs.clone() else {
            return false;
        };
        let id = self.id.clone();
        let source = self.source.clone();
        let retry = self.config.retry.clone();
        let (LayerKind::Color(state) | LayerKind::Elevation(state)) = &mut self.kind else {
            return false;
        };

        let mut changed = false;
        for tile in parent_displayed {
            if state.tiles.contains_key(tile) {
                continue;
            }
            let key = source.build_key(*tile, &crs);
            if let Some(payload) = source.cache().acquire(&key) {
                metrics.cache_hit();
                renderer.attach(SceneKey::new(id.clone(), *tile), &payload);
                state.tiles.insert(
                    *tile,
                    OverlayTile {
                        state: OverlayTileState::Applied,
                        handle: None,
                    },
                );
                changed = true;
            } else {
                metrics.cache_miss();
                let handle = scheduler.submit(
                    FetchCommand::new(key, Requester::new(id.clone(), *tile), source.source().clone())
                        .with_priority(Priority::REFINE)
                        .with_retry(retry.clone()),
                );
                state.tiles.insert(
                    *tile,
                    OverlayTile {
                        state: OverlayTileState::Loading,
                        handle: Some(handle),
                    },
                );
            }
        }

        let desired: HashSet<TileId> = parent_displayed.iter().copied().collect();
        let stale: Vec<TileId> = state
            .tiles
            .keys()
            .filter(|tile| !desired.contains(tile))
            .copied()
            .collect();
        for tile in stale {
            let Some(entry) = state.tiles.remove(&tile) else {
                continue;
            };
            match entry.state {
                OverlayTileState::Loading => {
                    if let Some(handle) = &entry.handle {
                        scheduler.cancel(handle);
                    }
                }
                OverlayTileState::Applied => {
                    renderer.detach(&SceneKey::new(id.clone(), tile));
                    source.cache().release(&source.build_key(tile, &crs));
                    changed = true;
                }
                OverlayTileState::Error => {}
            }
            state.retries.remove(&tile);
        }
        changed
    }

    /// Routes a scheduler completion to the node or overlay tile that
    /// requested it. Returns true if the scene changed and a redraw is
    /// needed.
    pub fn apply_completion(
        &mut self,
        completion: Completion,
        renderer: &dyn Renderer,
        metrics: &StreamingMetrics,
    ) -> bool {
        let id = self.id.clone();
        let source = self.source.clone();
        let max_retries = self.config.max_retries;
        let tile = completion.requester.tile;
        match &mut self.kind {
            LayerKind::TiledGeometry(state) => {
                state.handles.remove(&tile);
                let Some(node) = state.root.as_mut().and_then(|root| root.find_mut(tile)) else {
                    return false;
                };
                if node.state() != TileState::Loading {
                    // Evicted or reset while the fetch was in flight.
                    trace!(layer = %id, %tile, "Dropping completion for non-loading tile");
                    return false;
                }
                match completion.result {
                    Ok(payload) => {
                        let shared = source.cache().insert_and_acquire(completion.key, payload);
                        renderer.attach(SceneKey::new(id, tile), &shared);
                        node.mark_displayed(shared);
                        state.retries.remove(&tile);
                        metrics.tile_displayed();
                        true
                    }
                    Err(error) => {
                        let attempts = state.retries.entry(tile).or_insert(0);
                        *attempts += 1;
                        if error.is_transient() && *attempts <= max_retries {
                            debug!(layer = %id, %tile, attempt = *attempts, "Re-requesting after transient failure");
                            node.reset_for_retry();
                        } else {
                            warn!(layer = %id, %tile, %error, "Tile failed permanently");
                            node.mark_error();
                        }
                        false
                    }
                }
            }
            LayerKind::Color(state) | LayerKind::Elevation(state) => {
                let Some(entry) = state.tiles.get_mut(&tile) else {
                    // Parent tile was culled before the overlay arrived.
                    return false;
                };
                if entry.state != OverlayTileState::Loading {
                    return false;
                }
                match completion.result {
                    Ok(payload) => {
                        let shared = source.cache().insert_and_acquire(completion.key, payload);
                        renderer.attach(SceneKey::new(id, tile), &shared);
                        entry.state = OverlayTileState::Applied;
                        entry.handle = None;
                        state.retries.remove(&tile);
                        true
                    }
                    Err(error) => {
                        let attempts = state.retries.entry(tile).or_insert(0);
                        *attempts += 1;
                        if error.is_transient() && *attempts <= max_retries {
                            // Dropping the entry re-requests it next cycle.
                            state.tiles.remove(&tile);
                        } else {
                            warn!(layer = %id, %tile, %error, "Overlay tile failed permanently");
                            entry.state = OverlayTileState::Error;
                            entry.handle = None;
                        }
                        false
                    }
                }
            }
        }
    }

    /// Cancels outstanding work and releases every payload and cache
    /// reference this layer holds. Called before the layer is dropped.
    pub(crate) fn release_resources(&mut self, scheduler: &mut Scheduler, renderer: &dyn Renderer) {
        let id = self.id.clone();
        let source = self.source.clone();
        let crs = self.crs.clone();
        match &mut self.kind {
            LayerKind::TiledGeometry(state) => {
                for (_, handle) in state.handles.drain() {
                    scheduler.cancel(&handle);
                }
                if let (Some(root), Some(crs)) = (state.root.take(), crs) {
                    root.visit(&mut |node| match node.state() {
                        TileState::Displayed => {
                            renderer.detach(&SceneKey::new(id.clone(), node.tile()));
                            source.cache().release(&source.build_key(node.tile(), &crs));
                        }
                        TileState::Culled => {
                            if node.payload().is_some() {
                                source.cache().release(&source.build_key(node.tile(), &crs));
                            }
                        }
                        _ => {}
                    });
                }
                state.retries.clear();
            }
            LayerKind::Color(state) | LayerKind::Elevation(state) => {
                for (tile, entry) in state.tiles.drain() {
                    match entry.state {
                        OverlayTileState::Loading => {
                            if let Some(handle) = &entry.handle {
                                scheduler.cancel(handle);
                            }
                        }
                        OverlayTileState::Applied => {
                            renderer.detach(&SceneKey::new(id.clone(), tile));
                            if let Some(crs) = &crs {
                                source.cache().release(&source.build_key(tile, crs));
                            }
                        }
                        OverlayTileState::Error => {}
                    }
                }
                state.retries.clear();
            }
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source.name())
            .field("ready", &self.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Viewport;
    use crate::render::HeadlessRenderer;
    use crate::scheduler::SchedulerConfig;
    use crate::source::{PayloadKind, SourceError, SyntheticSource, TilePayload};
    use crate::view::ChangeSource;
    use bytes::Bytes;
    use glam::DVec3;
    use std::sync::Arc;

    const TEST_CRS: &str = "EPSG:3857";

    fn extent() -> Extent {
        Extent::new(Crs::new(TEST_CRS), 0.0, 0.0, 1024.0, 1024.0).unwrap()
    }

    /// Camera hovering over the extent center looking straight down.
    fn camera(height: f64) -> Camera {
        Camera::new(
            DVec3::new(512.0, 512.0, height),
            DVec3::new(512.0, 512.0, 0.0),
            Viewport::new(800, 600),
        )
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            tokio::runtime::Handle::current(),
            Arc::new(StreamingMetrics::new()),
        )
    }

    fn camera_changed() -> ChangeSet {
        [ChangeSource::Camera].into_iter().collect()
    }

    fn geometry_layer(config: RefinementConfig) -> Layer {
        let source = SourceHandle::new(SyntheticSource::terrain("ground"));
        let mut layer = Layer::tiled_geometry("ground", source)
            .with_extent(extent())
            .with_config(config);
        layer.resolve_inheritance(None, None, &Crs::new(TEST_CRS));
        layer
    }

    fn payload() -> TilePayload {
        TilePayload::new(PayloadKind::Terrain, Bytes::from_static(b"terrain-tile"))
    }

    fn complete_ok(layer: &mut Layer, tile: TileId, renderer: &dyn Renderer) {
        let key = layer
            .source()
            .build_key(tile, &Crs::new(TEST_CRS));
        let completion = Completion {
            requester: Requester::new(layer.id().clone(), tile),
            key,
            result: Ok(payload()),
        };
        let metrics = StreamingMetrics::new();
        layer.apply_completion(completion, renderer, &metrics);
    }

    #[test]
    fn test_far_camera_desires_only_root() {
        let mut layer = geometry_layer(RefinementConfig::default());
        let plan = layer
            .pre_update(&camera(100_000.0), &camera_changed())
            .unwrap();
        assert_eq!(plan.desired.len(), 1);
        assert_eq!(plan.desired[0].tile, TileId::root());
    }

    #[test]
    fn test_near_camera_refines_with_coarse_fallback() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(1));
        let plan = layer.pre_update(&camera(2000.0), &camera_changed()).unwrap();

        let tiles: HashSet<TileId> = plan.desired.iter().map(|d| d.tile).collect();
        // All four children plus the root as fallback until they display.
        assert!(tiles.contains(&TileId::root()));
        for child in TileId::root().children().unwrap() {
            assert!(tiles.contains(&child), "missing child {}", child);
        }
    }

    #[test]
    fn test_unaffected_change_set_skips_work() {
        let mut layer = geometry_layer(RefinementConfig::default());
        let changes: ChangeSet = [ChangeSource::Layer(LayerId::new("unrelated"))]
            .into_iter()
            .collect();
        assert!(layer.pre_update(&camera(2000.0), &changes).is_none());
    }

    #[tokio::test]
    async fn test_update_submits_once_per_tile() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(0));
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.submitted, 1);
        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Loading));

        // A second cycle must not duplicate the outstanding command.
        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.submitted, 0);
        assert_eq!(scheduler.commands_waiting_execution_count(), 1);
    }

    #[tokio::test]
    async fn test_completion_displays_tile_and_caches_payload() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(0));
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);
        complete_ok(&mut layer, TileId::root(), &renderer);

        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Displayed));
        assert!(renderer.is_attached(&SceneKey::new(LayerId::new("ground"), TileId::root())));
        let key = layer.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
        assert_eq!(layer.source().cache().usage(&key), Some(1));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let source = SourceHandle::new(SyntheticSource::terrain("ground"));
        let key = source.build_key(TileId::root(), &Crs::new(TEST_CRS));
        source.cache().insert_and_acquire(key.clone(), payload());
        source.cache().release(&key);

        let mut layer = Layer::tiled_geometry("ground", source)
            .with_extent(extent())
            .with_config(RefinementConfig::default().with_max_level(0));
        layer.resolve_inheritance(None, None, &Crs::new(TEST_CRS));

        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();
        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);

        assert_eq!(outcome.submitted, 0);
        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Displayed));
        assert_eq!(metrics.snapshot().cache_hits, 1);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_cull_retains_payload_and_restores_without_fetch() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(1));
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        // Refine: children load, then display.
        let plan = layer.pre_update(&camera(2000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);
        let children = TileId::root().children().unwrap();
        for child in children {
            complete_ok(&mut layer, child, &renderer);
        }
        complete_ok(&mut layer, TileId::root(), &renderer);

        // Zoom out: children fall out of the desired set and are culled.
        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.culled, 4);
        for child in children {
            assert_eq!(layer.tile_state(child), Some(TileState::Culled));
            assert!(!renderer.is_attached(&SceneKey::new(LayerId::new("ground"), child)));
        }

        // Zoom back in: culled children restore with no new commands.
        let plan = layer.pre_update(&camera(2000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.restored, 4);
        for child in children {
            assert_eq!(layer.tile_state(child), Some(TileState::Displayed));
        }
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_retained_budget_boundary_counts_culled_tiles() {
        // Budget of 3: culling four children must evict exactly one.
        let config = RefinementConfig::default()
            .with_max_level(1)
            .with_retained_budget(3);
        let mut layer = geometry_layer(config);
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let plan = layer.pre_update(&camera(2000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);
        for child in TileId::root().children().unwrap() {
            complete_ok(&mut layer, child, &renderer);
        }
        complete_ok(&mut layer, TileId::root(), &renderer);

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.culled, 4);
        assert_eq!(outcome.evicted, 1);

        let children = TileId::root().children().unwrap();
        let evicted = children
            .iter()
            .filter(|c| layer.tile_state(**c) == Some(TileState::Pending))
            .count();
        let culled = children
            .iter()
            .filter(|c| layer.tile_state(**c) == Some(TileState::Culled))
            .count();
        assert_eq!(evicted, 1);
        assert_eq!(culled, 3);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_mark_error() {
        let config = RefinementConfig {
            max_retries: 1,
            ..RefinementConfig::default()
        }
        .with_max_level(0);
        let mut layer = geometry_layer(config);
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let fail = |layer: &mut Layer| {
            let key = layer.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
            layer.apply_completion(
                Completion {
                    requester: Requester::new(LayerId::new("ground"), TileId::root()),
                    key,
                    result: Err(SourceError::Transient("timeout".into())),
                },
                &renderer,
                &metrics,
            );
        };

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);

        // First transient failure: back to pending for a retry.
        fail(&mut layer);
        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Pending));

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);

        // Second failure exhausts max_retries = 1: the tile fails for good.
        fail(&mut layer);
        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Error));

        // And it is never requested again.
        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        let outcome = layer.update(&plan, &mut scheduler, &renderer, &metrics);
        assert_eq!(outcome.submitted, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_error_immediately() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(0));
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);

        let key = layer.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
        layer.apply_completion(
            Completion {
                requester: Requester::new(LayerId::new("ground"), TileId::root()),
                key,
                result: Err(SourceError::Decode("bad header".into())),
            },
            &renderer,
            &metrics,
        );
        assert_eq!(layer.tile_state(TileId::root()), Some(TileState::Error));
    }

    #[tokio::test]
    async fn test_overlay_follows_parent_displayed_set() {
        let source = SourceHandle::new(SyntheticSource::imagery("sat"));
        let mut overlay = Layer::color("sat", source);
        overlay.resolve_inheritance(Some(&extent()), Some(&Crs::new(TEST_CRS)), &Crs::new(TEST_CRS));

        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        // Parent displays the root tile: overlay requests it.
        overlay.update_overlay(&[TileId::root()], &mut scheduler, &renderer, &metrics);
        assert_eq!(scheduler.commands_waiting_execution_count(), 1);

        let key = overlay.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
        overlay.apply_completion(
            Completion {
                requester: Requester::new(LayerId::new("sat"), TileId::root()),
                key: key.clone(),
                result: Ok(TilePayload::new(PayloadKind::Imagery, Bytes::from_static(b"img"))),
            },
            &renderer,
            &metrics,
        );
        assert!(renderer.is_attached(&SceneKey::new(LayerId::new("sat"), TileId::root())));
        assert_eq!(overlay.source().cache().usage(&key), Some(1));

        // Parent culls the tile: overlay withdraws and releases.
        overlay.update_overlay(&[], &mut scheduler, &renderer, &metrics);
        assert!(!renderer.is_attached(&SceneKey::new(LayerId::new("sat"), TileId::root())));
        assert_eq!(overlay.source().cache().usage(&key), Some(0));
    }

    #[tokio::test]
    async fn test_overlay_completion_after_parent_cull_is_dropped() {
        let source = SourceHandle::new(SyntheticSource::imagery("sat"));
        let mut overlay = Layer::color("sat", source);
        overlay.resolve_inheritance(Some(&extent()), Some(&Crs::new(TEST_CRS)), &Crs::new(TEST_CRS));

        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        overlay.update_overlay(&[TileId::root()], &mut scheduler, &renderer, &metrics);
        // Parent culled before the overlay payload arrived.
        overlay.update_overlay(&[], &mut scheduler, &renderer, &metrics);

        let key = overlay.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
        let changed = overlay.apply_completion(
            Completion {
                requester: Requester::new(LayerId::new("sat"), TileId::root()),
                key,
                result: Ok(TilePayload::new(PayloadKind::Imagery, Bytes::from_static(b"img"))),
            },
            &renderer,
            &metrics,
        );
        assert!(!changed);
        assert!(!renderer.is_attached(&SceneKey::new(LayerId::new("sat"), TileId::root())));
    }

    #[tokio::test]
    async fn test_release_resources_returns_cache_references() {
        let mut layer = geometry_layer(RefinementConfig::default().with_max_level(0));
        let mut scheduler = scheduler();
        let renderer = HeadlessRenderer::new();
        let metrics = StreamingMetrics::new();

        let plan = layer.pre_update(&camera(100_000.0), &camera_changed()).unwrap();
        layer.update(&plan, &mut scheduler, &renderer, &metrics);
        complete_ok(&mut layer, TileId::root(), &renderer);

        let key = layer.source().build_key(TileId::root(), &Crs::new(TEST_CRS));
        assert_eq!(layer.source().cache().usage(&key), Some(1));

        layer.release_resources(&mut scheduler, &renderer);
        assert_eq!(layer.source().cache().usage(&key), Some(0));
        assert_eq!(renderer.attached_count(), 0);
        assert!(layer.displayed_tiles().is_empty());
    }
}
