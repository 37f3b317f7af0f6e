//! Top-level view coordination.
//!
//! A [`View`] owns the camera, the layer collection, the scheduler, and
//! the dirty/"needs redraw" bookkeeping for one rendered scene. All of
//! its methods run on the coordinating thread; asynchronous fetch results
//! enter through [`View::pump_scheduler`] during the main-loop cycle.
//!
//! Layer management follows the cross-view cache contract: adding a layer
//! retains its source cache for the layer's CRS, removing it forwards the
//! release so cache memory for a CRS is freed only once no view anywhere
//! still needs it (the accounting lives in the shared
//! [`DecodeCache`](crate::source::DecodeCache); the [`ViewRegistry`]
//! tracks which views are alive and catches double-dispose).

mod events;
mod main_loop;
mod picking;
mod registry;

pub use events::{ViewEvent, EVENT_CHANNEL_CAPACITY};
pub use main_loop::{
    AttachPoint, FrameTick, MainLoop, RenderingState, RequesterDirective, RequesterId,
};
pub use registry::ViewRegistry;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::coord::Crs;
use crate::layer::{Layer, LayerId};
use crate::render::{BufferRegion, DepthBuffer, Renderer};
use crate::scheduler::{Completion, CompletionSink, Scheduler, SchedulerConfig};
use crate::source::SourceError;
use crate::telemetry::StreamingMetrics;
use events::EventHub;

/// Unique id of a view within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub(crate) u32);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// What changed since the last redraw; accumulated by
/// [`View::notify_change`] and handed to the layers each cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// Camera pose or projection changed.
    Camera,
    /// Viewport dimensions changed.
    Viewport,
    /// A layer's content changed (completion applied, retry pending).
    Layer(LayerId),
    /// An external driver (controls, animation) requested an update.
    External(&'static str),
}

/// The set of change sources accumulated for one cycle.
pub type ChangeSet = HashSet<ChangeSource>;

/// Errors from view configuration and layer management.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ViewError {
    #[error("Layer id '{0}' is already used in this view")]
    DuplicateLayer(LayerId),

    #[error("No layer '{0}' in this view")]
    UnknownLayer(LayerId),

    #[error("Unknown parent layer '{0}'")]
    UnknownParent(LayerId),

    #[error("Overlay layer '{0}' must attach under a tiled geometry layer")]
    OverlayNeedsGeometryParent(LayerId),

    #[error("Parent layer '{0}' does not host attached layers")]
    NotGeometryParent(LayerId),

    #[error("Tiled geometry layer '{0}' has no extent and none to inherit")]
    MissingExtent(LayerId),

    #[error("View was disposed")]
    Disposed,

    #[error(transparent)]
    SourceInit(#[from] SourceError),
}

/// Completion handle for a layer's readiness: resolves once all of the
/// layer's startup work finished, or with the error that prevented it.
///
/// This is the only externally observed readiness signal; configuration
/// errors resolve it immediately instead of being thrown.
pub struct ReadySignal {
    rx: oneshot::Receiver<Result<(), ViewError>>,
}

impl ReadySignal {
    fn pending() -> (oneshot::Sender<Result<(), ViewError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn rejected(error: ViewError) -> Self {
        let (tx, signal) = Self::pending();
        // The receiver is held by `signal`, so the send cannot fail.
        let _ = tx.send(Err(error));
        signal
    }

    /// Waits for the layer to become ready.
    pub async fn wait(self) -> Result<(), ViewError> {
        self.rx.await.unwrap_or(Err(ViewError::Disposed))
    }

    /// Non-blocking poll: `None` while initialization is still running.
    pub fn try_wait(&mut self) -> Option<Result<(), ViewError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ViewError::Disposed)),
        }
    }
}

/// Depth values at or above this bound count as "no surface hit" when
/// picking. With the default near plane this corresponds to roughly a
/// hundred kilometers, far past any pickable surface.
pub const MAX_PICK_DEPTH: f32 = 0.99999;

struct LayerEntry {
    layer: Layer,
    parent: Option<LayerId>,
}

/// One rendered scene: camera, layers, scheduler, and redraw state.
pub struct View {
    id: ViewId,
    reference_crs: Crs,
    camera: Camera,
    renderer: Arc<dyn Renderer>,
    runtime: tokio::runtime::Handle,
    metrics: Arc<StreamingMetrics>,
    scheduler: Scheduler,
    layers: HashMap<LayerId, LayerEntry>,
    root_order: Vec<LayerId>,
    pending_changes: ChangeSet,
    change_epoch: u64,
    needs_redraw: bool,
    depth_cache: Option<DepthBuffer>,
    depth_stale: bool,
    events: EventHub,
    init_tx: mpsc::UnboundedSender<(LayerId, Result<(), SourceError>)>,
    init_rx: mpsc::UnboundedReceiver<(LayerId, Result<(), SourceError>)>,
    pending_ready: HashSet<LayerId>,
    initialized_fired: bool,
    disposed: bool,
}

impl View {
    /// Creates a view registered in `registry`.
    pub fn new(
        registry: &mut ViewRegistry,
        reference_crs: Crs,
        camera: Camera,
        renderer: Arc<dyn Renderer>,
        scheduler_config: SchedulerConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let metrics = Arc::new(StreamingMetrics::new());
        let scheduler = Scheduler::new(scheduler_config, runtime.clone(), metrics.clone());
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let id = registry.allocate();
        info!(%id, crs = %reference_crs, "Created view");
        Self {
            id,
            reference_crs,
            camera,
            renderer,
            runtime,
            metrics,
            scheduler,
            layers: HashMap::new(),
            root_order: Vec::new(),
            pending_changes: ChangeSet::new(),
            change_epoch: 0,
            needs_redraw: false,
            depth_cache: None,
            depth_stale: true,
            events: EventHub::new(),
            init_tx,
            init_rx,
            pending_ready: HashSet::new(),
            initialized_fired: false,
            disposed: false,
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn reference_crs(&self) -> &Crs {
        &self.reference_crs
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn metrics(&self) -> &Arc<StreamingMetrics> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    /// Applies a camera mutation and marks the view dirty.
    pub fn update_camera(&mut self, mutate: impl FnOnce(&mut Camera)) {
        mutate(&mut self.camera);
        self.notify_change(ChangeSource::Camera, true);
    }

    // -------------------------------------------------------------------------
    // Dirty tracking
    // -------------------------------------------------------------------------

    /// Records that `source` changed. With `needs_redraw` false this is a
    /// bookkeeping-only change that schedules an update without forcing a
    /// render.
    pub fn notify_change(&mut self, source: ChangeSource, needs_redraw: bool) {
        if self.disposed {
            warn!(view = %self.id, "notify_change on disposed view");
            return;
        }
        // Camera motion and displayed-geometry changes invalidate the
        // cached depth frame used for picking while paused.
        let invalidates_depth = match &source {
            ChangeSource::Camera | ChangeSource::Viewport => true,
            ChangeSource::Layer(id) => self
                .layers
                .get(id)
                .is_some_and(|entry| entry.layer.is_geometry()),
            ChangeSource::External(_) => false,
        };
        if invalidates_depth {
            self.depth_stale = true;
        }
        self.pending_changes.insert(source);
        self.change_epoch += 1;
        if needs_redraw {
            self.needs_redraw = true;
        }
    }

    /// True if an update cycle is warranted. Layers whose initialization
    /// has not resolved yet keep the view dirty so their readiness is
    /// observed promptly.
    pub fn is_dirty(&self) -> bool {
        !self.pending_changes.is_empty() || self.needs_redraw || !self.pending_ready.is_empty()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }

    /// Monotonic count of `notify_change` calls; the main loop uses it to
    /// classify first vs. continuation updates.
    pub fn change_epoch(&self) -> u64 {
        self.change_epoch
    }

    /// Starts a cycle: applies finished layer initializations and drains
    /// the accumulated change set.
    pub(crate) fn begin_cycle(&mut self) -> ChangeSet {
        self.drain_layer_inits();
        std::mem::take(&mut self.pending_changes)
    }

    // -------------------------------------------------------------------------
    // Layer management
    // -------------------------------------------------------------------------

    /// Attaches a layer, optionally under a parent geometry layer.
    ///
    /// Configuration problems (duplicate id, overlay without a geometry
    /// parent, missing extent) reject the returned [`ReadySignal`] and
    /// leave the view unchanged; nothing is thrown across the loop. On
    /// success the signal resolves once the layer's source finished its
    /// startup work.
    pub fn add_layer(&mut self, mut layer: Layer, parent: Option<&LayerId>) -> ReadySignal {
        if self.disposed {
            return ReadySignal::rejected(ViewError::Disposed);
        }
        let id = layer.id().clone();
        if self.layers.contains_key(&id) {
            warn!(view = %self.id, layer = %id, "Rejecting duplicate layer id");
            return ReadySignal::rejected(ViewError::DuplicateLayer(id));
        }

        // Validate the attach point and resolve inheritance.
        match parent {
            Some(parent_id) => {
                let Some(parent_entry) = self.layers.get(parent_id) else {
                    return ReadySignal::rejected(ViewError::UnknownParent(parent_id.clone()));
                };
                if !parent_entry.layer.is_geometry() {
                    return ReadySignal::rejected(ViewError::NotGeometryParent(parent_id.clone()));
                }
                let parent_extent = parent_entry.layer.extent().cloned();
                let parent_crs = parent_entry.layer.crs().cloned();
                layer.resolve_inheritance(
                    parent_extent.as_ref(),
                    parent_crs.as_ref(),
                    &self.reference_crs,
                );
            }
            None => {
                if layer.is_overlay() {
                    return ReadySignal::rejected(ViewError::OverlayNeedsGeometryParent(id));
                }
                layer.resolve_inheritance(None, None, &self.reference_crs);
            }
        }
        if layer.is_geometry() && layer.extent().is_none() {
            return ReadySignal::rejected(ViewError::MissingExtent(id));
        }

        // Cross-view cache accounting: this view now needs the layer's CRS.
        let crs = layer
            .crs()
            .cloned()
            .expect("resolve_inheritance always assigns a CRS");
        layer.source().cache().retain_crs(&crs);

        // Compositing order among siblings and hierarchy wiring.
        match parent {
            Some(parent_id) => {
                let parent_entry = self
                    .layers
                    .get_mut(parent_id)
                    .expect("parent validated above");
                layer.set_sequence(parent_entry.layer.attached_layers().len() as u32);
                parent_entry.layer.attach_child(id.clone());
            }
            None => {
                layer.set_sequence(self.root_order.len() as u32);
                self.root_order.push(id.clone());
            }
        }

        // Spawn the source's startup work; readiness resolves when it
        // lands back on the coordinating thread.
        let source = layer.source().source().clone();
        let init_tx = self.init_tx.clone();
        let init_id = id.clone();
        let (ready_tx, signal) = ReadySignal::pending();
        self.runtime.spawn(async move {
            let result = source.initialize().await;
            let _ = init_tx.send((init_id, result.clone()));
            let _ = ready_tx.send(result.map_err(ViewError::from));
        });

        self.pending_ready.insert(id.clone());
        self.layers.insert(
            id.clone(),
            LayerEntry {
                layer,
                parent: parent.cloned(),
            },
        );
        debug!(view = %self.id, layer = %id, "Layer added");
        self.events.emit(ViewEvent::LayerAdded { layer: id.clone() });
        self.notify_change(ChangeSource::Layer(id), true);
        signal
    }

    /// Removes a layer and its entire attached subtree, releasing tile
    /// payloads and forwarding cache releases across views sharing the
    /// source.
    pub fn remove_layer(&mut self, id: &LayerId) -> Result<(), ViewError> {
        if !self.layers.contains_key(id) {
            return Err(ViewError::UnknownLayer(id.clone()));
        }

        // Collect the subtree before mutating anything.
        let mut subtree = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.layers.get(&current) {
                stack.extend(entry.layer.attached_layers().iter().cloned());
            }
            subtree.push(current);
        }

        // Detach from the parent (renumbering siblings) or the root set.
        let parent = self.layers.get(id).and_then(|entry| entry.parent.clone());
        match &parent {
            Some(parent_id) => {
                if let Some(parent_entry) = self.layers.get_mut(parent_id) {
                    parent_entry.layer.detach_child(id);
                    let siblings = parent_entry.layer.attached_layers().to_vec();
                    for (index, sibling) in siblings.into_iter().enumerate() {
                        if let Some(entry) = self.layers.get_mut(&sibling) {
                            entry.layer.set_sequence(index as u32);
                        }
                    }
                }
            }
            None => {
                self.root_order.retain(|root| root != id);
                let roots = self.root_order.clone();
                for (index, root) in roots.into_iter().enumerate() {
                    if let Some(entry) = self.layers.get_mut(&root) {
                        entry.layer.set_sequence(index as u32);
                    }
                }
            }
        }

        let renderer = self.renderer.clone();
        for layer_id in subtree {
            let Some(mut entry) = self.layers.remove(&layer_id) else {
                continue;
            };
            entry
                .layer
                .release_resources(&mut self.scheduler, &*renderer);
            if let Some(crs) = entry.layer.crs().cloned() {
                let freed = entry.layer.source().cache().release_crs(&crs);
                if freed {
                    entry.layer.source().source().on_layer_removed(Some(&crs));
                }
            }
            self.pending_ready.remove(&layer_id);
            debug!(view = %self.id, layer = %layer_id, "Layer removed");
            self.events.emit(ViewEvent::LayerRemoved { layer: layer_id });
        }

        self.needs_redraw = true;
        self.depth_stale = true;
        Ok(())
    }

    /// Looks up a layer by id.
    pub fn get_layer_by_id(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id).map(|entry| &entry.layer)
    }

    /// All layers, root and attached.
    pub fn get_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values().map(|entry| &entry.layer)
    }

    /// Root layer ids in compositing order.
    pub fn root_layers(&self) -> &[LayerId] {
        &self.root_order
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    // -------------------------------------------------------------------------
    // Per-cycle work
    // -------------------------------------------------------------------------

    /// Runs `pre_update`/`update` over every ready root layer and applies
    /// overlays onto their displayed tiles.
    pub(crate) fn update_layers(&mut self, changes: &ChangeSet) {
        let camera = self.camera.clone();
        let renderer = self.renderer.clone();
        let metrics = self.metrics.clone();
        let roots = self.root_order.clone();
        for root_id in roots {
            let Some(entry) = self.layers.get_mut(&root_id) else {
                continue;
            };
            if !entry.layer.is_ready() {
                continue;
            }
            let Some(plan) = entry.layer.pre_update(&camera, changes) else {
                continue;
            };
            let outcome = entry
                .layer
                .update(&plan, &mut self.scheduler, &*renderer, &metrics);
            if outcome.needs_redraw {
                self.needs_redraw = true;
                self.depth_stale = true;
            }

            let displayed = entry.layer.displayed_tiles();
            let children = entry.layer.attached_layers().to_vec();
            for child_id in children {
                let Some(child) = self.layers.get_mut(&child_id) else {
                    continue;
                };
                if !child.layer.is_ready() {
                    continue;
                }
                if child
                    .layer
                    .update_overlay(&displayed, &mut self.scheduler, &*renderer, &metrics)
                {
                    self.needs_redraw = true;
                }
            }
        }
    }

    /// Pumps the scheduler, routing completions to their layers. Returns
    /// the number of completions applied.
    pub(crate) fn pump_scheduler(&mut self) -> usize {
        struct RoutingSink<'a> {
            layers: &'a mut HashMap<LayerId, LayerEntry>,
            renderer: &'a dyn Renderer,
            metrics: &'a StreamingMetrics,
            changed: Vec<LayerId>,
            geometry_changed: bool,
            redraw: bool,
        }
        impl CompletionSink for RoutingSink<'_> {
            fn apply(&mut self, completion: Completion) {
                let layer_id = completion.requester.layer.clone();
                let Some(entry) = self.layers.get_mut(&layer_id) else {
                    // Layer removed while the fetch was in flight; its
                    // cancellation should normally beat the completion.
                    return;
                };
                if entry
                    .layer
                    .apply_completion(completion, self.renderer, self.metrics)
                {
                    self.redraw = true;
                    if entry.layer.is_geometry() {
                        self.geometry_changed = true;
                    }
                }
                // Either way the layer may have retry or overlay work next
                // cycle.
                self.changed.push(layer_id);
            }
        }

        let renderer = self.renderer.clone();
        let metrics = self.metrics.clone();
        let mut sink = RoutingSink {
            layers: &mut self.layers,
            renderer: &*renderer,
            metrics: &metrics,
            changed: Vec::new(),
            geometry_changed: false,
            redraw: false,
        };
        let applied = self.scheduler.pump(&mut sink);

        let changed = std::mem::take(&mut sink.changed);
        let redraw = sink.redraw;
        let geometry_changed = sink.geometry_changed;
        for layer_id in changed {
            self.pending_changes.insert(ChangeSource::Layer(layer_id));
            self.change_epoch += 1;
        }
        if redraw {
            self.needs_redraw = true;
        }
        if geometry_changed {
            self.depth_stale = true;
        }
        applied
    }

    fn drain_layer_inits(&mut self) {
        let mut resolved_any = false;
        while let Ok((layer_id, result)) = self.init_rx.try_recv() {
            resolved_any = true;
            self.pending_ready.remove(&layer_id);
            match result {
                Ok(()) => {
                    if let Some(entry) = self.layers.get_mut(&layer_id) {
                        entry.layer.set_ready(true);
                        info!(view = %self.id, layer = %layer_id, "Layer ready");
                        self.pending_changes
                            .insert(ChangeSource::Layer(layer_id));
                        self.change_epoch += 1;
                        self.needs_redraw = true;
                    }
                }
                Err(error) => {
                    warn!(view = %self.id, layer = %layer_id, %error, "Layer initialization failed");
                }
            }
        }
        if resolved_any && self.pending_ready.is_empty() {
            self.events.emit(ViewEvent::LayersInitialized);
            if !self.initialized_fired {
                self.initialized_fired = true;
                self.events.emit(ViewEvent::Initialized);
            }
        }
    }

    /// Renders the frame: refreshes the cached full-resolution depth
    /// buffer and clears the redraw flag.
    pub(crate) fn render_frame(&mut self) {
        let viewport = self.camera.viewport();
        let buffer = self.renderer.render_view_to_buffer(
            &self.camera,
            BufferRegion::new(0, 0, viewport.width, viewport.height),
        );
        self.depth_cache = Some(buffer);
        self.depth_stale = false;
        self.needs_redraw = false;
    }

    pub(crate) fn take_needs_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    // -------------------------------------------------------------------------
    // Resize & dispose
    // -------------------------------------------------------------------------

    /// Resizes the viewport. Idempotent: repeating the current dimensions
    /// neither notifies nor redraws; invalid dimensions are rejected with
    /// a warning, leaving prior buffers intact.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let current = self.camera.viewport();
        if current.width == width && current.height == height {
            return false;
        }
        if !self.camera.set_viewport(width, height) {
            return false;
        }
        self.renderer.on_window_resize(width, height);
        self.depth_cache = None;
        self.notify_change(ChangeSource::Viewport, true);
        true
    }

    /// Disposes the view: removes every layer (releasing caches across
    /// views) and unregisters from `registry`. A second dispose logs and
    /// returns without double-freeing.
    pub fn dispose(&mut self, registry: &mut ViewRegistry) {
        if !registry.release(self.id) {
            warn!(view = %self.id, "Ignoring dispose of already-disposed view");
            return;
        }
        let roots = self.root_order.clone();
        for root in roots {
            // Subtree removal can only fail for an unknown id, and these
            // come straight from the root set.
            let _ = self.remove_layer(&root);
        }
        self.disposed = true;
        self.pending_changes.clear();
        self.needs_redraw = false;
        self.events.emit(ViewEvent::Disposed);
        info!(view = %self.id, "View disposed");
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("layers", &self.layers.len())
            .field("dirty", &self.is_dirty())
            .field("disposed", &self.disposed)
            .finish()
    }
}
