//! Tile tree nodes and their refinement state machine.
//!
//! Each geometry layer owns a quadtree of [`TileNode`]s subdividing its
//! root extent. Children are created lazily on first refinement; a node's
//! payload stays resident while the node is displayed or merely culled
//! (cheap to keep for camera oscillation) and is released on eviction.
//!
//! # State machine
//!
//! ```text
//! Pending ──► Loading ──► Displayed ◄──► Culled
//!                │                          │
//!                ▼                          ▼ (evict)
//!              Error                     Pending
//! ```
//!
//! A `Loading` node has exactly one outstanding scheduler command; the
//! owning layer enforces that by never re-submitting a loading tile.

use std::time::Instant;

use crate::coord::{Extent, TileId};
use crate::source::TilePayload;

/// Refinement/visibility state of one tile node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// No payload and no outstanding request.
    Pending,
    /// Exactly one fetch command is outstanding.
    Loading,
    /// Payload attached to the scene graph and visible.
    Displayed,
    /// Out of view; payload retained for cheap re-display.
    Culled,
    /// Permanent fetch/decode failure; not requested again.
    Error,
}

/// One node of a layer's spatial tree.
#[derive(Debug)]
pub struct TileNode {
    tile: TileId,
    extent: Extent,
    state: TileState,
    payload: Option<TilePayload>,
    children: Option<Box<[TileNode; 4]>>,
    culled_at: Option<Instant>,
}

impl TileNode {
    pub fn new(tile: TileId, extent: Extent) -> Self {
        Self {
            tile,
            extent,
            state: TileState::Pending,
            payload: None,
            children: None,
            culled_at: None,
        }
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn payload(&self) -> Option<&TilePayload> {
        self.payload.as_ref()
    }

    pub fn culled_at(&self) -> Option<Instant> {
        self.culled_at
    }

    /// True if the node can be shown without a fetch: it is displayed, or
    /// culled with its payload still resident.
    pub fn displayable(&self) -> bool {
        match self.state {
            TileState::Displayed => true,
            TileState::Culled => self.payload.is_some(),
            _ => false,
        }
    }

    /// Creates the four children if absent. No-op at the maximum level.
    ///
    /// Returns true if children exist after the call.
    pub fn ensure_children(&mut self) -> bool {
        if self.children.is_some() {
            return true;
        }
        let Some(tiles) = self.tile.children() else {
            return false;
        };
        let extents = self.extent.split();
        let [e0, e1, e2, e3] = extents;
        self.children = Some(Box::new([
            TileNode::new(tiles[0], e0),
            TileNode::new(tiles[1], e1),
            TileNode::new(tiles[2], e2),
            TileNode::new(tiles[3], e3),
        ]));
        true
    }

    pub fn children(&self) -> Option<&[TileNode; 4]> {
        self.children.as_deref()
    }

    pub fn children_mut(&mut self) -> Option<&mut [TileNode; 4]> {
        self.children.as_deref_mut()
    }

    /// Finds the node for `target` in this subtree, if its path has been
    /// materialized.
    pub fn find(&self, target: TileId) -> Option<&TileNode> {
        if target == self.tile {
            return Some(self);
        }
        let step = Self::step_toward(self.tile, target)?;
        self.children.as_deref()?[step.quadrant()].find(target)
    }

    /// Mutable variant of [`Self::find`].
    pub fn find_mut(&mut self, target: TileId) -> Option<&mut TileNode> {
        if target == self.tile {
            return Some(self);
        }
        let step = Self::step_toward(self.tile, target)?;
        self.children.as_deref_mut()?[step.quadrant()].find_mut(target)
    }

    /// The ancestor of `to` one level below `from`, or `None` if `to` is
    /// outside `from`'s subtree.
    fn step_toward(from: TileId, to: TileId) -> Option<TileId> {
        if to.level() <= from.level() {
            return None;
        }
        let mut step = to;
        while step.level() > from.level() + 1 {
            step = step.parent()?;
        }
        (step.parent() == Some(from)).then_some(step)
    }

    /// Depth-first visit of every materialized node.
    pub fn visit<F: FnMut(&TileNode)>(&self, f: &mut F) {
        f(self);
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.visit(f);
            }
        }
    }

    /// Depth-first mutable visit of every materialized node.
    pub fn visit_mut<F: FnMut(&mut TileNode)>(&mut self, f: &mut F) {
        f(self);
        if let Some(children) = &mut self.children {
            for child in children.iter_mut() {
                child.visit_mut(f);
            }
        }
    }

    // -------------------------------------------------------------------------
    // State transitions
    // -------------------------------------------------------------------------

    /// `Pending -> Loading`: a fetch command was submitted.
    pub fn begin_loading(&mut self) {
        debug_assert_eq!(self.state, TileState::Pending, "tile {}", self.tile);
        self.state = TileState::Loading;
    }

    /// `Loading | Pending -> Displayed`: payload attached to the scene
    /// graph. `Pending` covers the decode-cache hit path where no fetch
    /// was needed.
    pub fn mark_displayed(&mut self, payload: TilePayload) {
        debug_assert!(
            matches!(self.state, TileState::Loading | TileState::Pending),
            "tile {} in state {:?}",
            self.tile,
            self.state
        );
        self.payload = Some(payload);
        self.state = TileState::Displayed;
        self.culled_at = None;
    }

    /// `Displayed -> Culled`: visibility lost, payload retained.
    pub fn cull(&mut self, now: Instant) {
        debug_assert_eq!(self.state, TileState::Displayed, "tile {}", self.tile);
        self.state = TileState::Culled;
        self.culled_at = Some(now);
    }

    /// `Culled -> Displayed`: visibility regained, no re-fetch.
    ///
    /// Returns the retained payload for re-attachment.
    pub fn restore(&mut self) -> &TilePayload {
        debug_assert_eq!(self.state, TileState::Culled, "tile {}", self.tile);
        debug_assert!(self.payload.is_some(), "culled tile {} lost payload", self.tile);
        self.state = TileState::Displayed;
        self.culled_at = None;
        self.payload.as_ref().expect("restore() requires a retained payload")
    }

    /// `Culled -> Pending`: payload released under budget pressure.
    pub fn evict(&mut self) {
        debug_assert_eq!(self.state, TileState::Culled, "tile {}", self.tile);
        self.payload = None;
        self.state = TileState::Pending;
        self.culled_at = None;
    }

    /// `Loading -> Pending`: transient failure, will be re-requested.
    pub fn reset_for_retry(&mut self) {
        debug_assert_eq!(self.state, TileState::Loading, "tile {}", self.tile);
        self.state = TileState::Pending;
    }

    /// `Loading -> Error`: permanent failure, never requested again.
    pub fn mark_error(&mut self) {
        debug_assert_eq!(self.state, TileState::Loading, "tile {}", self.tile);
        self.state = TileState::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Crs;
    use crate::source::PayloadKind;
    use bytes::Bytes;

    fn root_node() -> TileNode {
        let extent = Extent::new(Crs::new("EPSG:3857"), 0.0, 0.0, 1024.0, 1024.0).unwrap();
        TileNode::new(TileId::root(), extent)
    }

    fn payload() -> TilePayload {
        TilePayload::new(PayloadKind::Terrain, Bytes::from_static(b"data"))
    }

    #[test]
    fn test_new_node_is_pending() {
        let node = root_node();
        assert_eq!(node.state(), TileState::Pending);
        assert!(node.payload().is_none());
        assert!(node.children().is_none());
        assert!(!node.displayable());
    }

    #[test]
    fn test_ensure_children_extents_match_quadrants() {
        let mut node = root_node();
        assert!(node.ensure_children());
        let children = node.children().unwrap();
        for (child, expected) in children.iter().zip(node.extent().split().iter()) {
            assert_eq!(child.extent(), expected);
        }
    }

    #[test]
    fn test_ensure_children_is_idempotent() {
        let mut node = root_node();
        node.ensure_children();
        node.children_mut().unwrap()[0].begin_loading();
        node.ensure_children();
        // Existing children survive.
        assert_eq!(node.children().unwrap()[0].state(), TileState::Loading);
    }

    #[test]
    fn test_find_descends_materialized_path() {
        let mut node = root_node();
        node.ensure_children();
        node.children_mut().unwrap()[2].ensure_children();

        let target = TileId::root().children().unwrap()[2].children().unwrap()[1];
        assert_eq!(node.find(target).unwrap().tile(), target);
        assert_eq!(node.find_mut(target).unwrap().tile(), target);

        // Unmaterialized path.
        let missing = TileId::root().children().unwrap()[0].children().unwrap()[0];
        assert!(node.find(missing).is_none());
    }

    #[test]
    fn test_find_rejects_foreign_tile() {
        let mut node = root_node();
        node.ensure_children();
        // A level-0 search from a level-1 node is out of subtree.
        let child = &node.children().unwrap()[0];
        assert!(child.find(TileId::root()).is_none());
    }

    #[test]
    fn test_lifecycle_fetch_cull_restore_evict() {
        let mut node = root_node();

        node.begin_loading();
        assert_eq!(node.state(), TileState::Loading);

        node.mark_displayed(payload());
        assert_eq!(node.state(), TileState::Displayed);
        assert!(node.displayable());

        node.cull(Instant::now());
        assert_eq!(node.state(), TileState::Culled);
        assert!(node.culled_at().is_some());
        // Payload retained: still displayable without a fetch.
        assert!(node.displayable());

        node.restore();
        assert_eq!(node.state(), TileState::Displayed);
        assert!(node.culled_at().is_none());

        node.cull(Instant::now());
        node.evict();
        assert_eq!(node.state(), TileState::Pending);
        assert!(node.payload().is_none());
        assert!(!node.displayable());
    }

    #[test]
    fn test_cache_hit_path_skips_loading() {
        let mut node = root_node();
        node.mark_displayed(payload());
        assert_eq!(node.state(), TileState::Displayed);
    }

    #[test]
    fn test_retry_and_error_paths() {
        let mut node = root_node();
        node.begin_loading();
        node.reset_for_retry();
        assert_eq!(node.state(), TileState::Pending);

        node.begin_loading();
        node.mark_error();
        assert_eq!(node.state(), TileState::Error);
        assert!(!node.displayable());
    }

    #[test]
    fn test_visit_counts_materialized_nodes() {
        let mut node = root_node();
        node.ensure_children();
        node.children_mut().unwrap()[3].ensure_children();

        let mut count = 0;
        node.visit(&mut |_| count += 1);
        assert_eq!(count, 1 + 4 + 4);
    }
}
