//! Scene-graph renderer contract and the built-in headless renderer.
//!
//! The engine never rasterizes anything itself: a [`Renderer`] attaches
//! and detaches tile payloads as scene-graph nodes and answers depth
//! read-back queries for picking. A GPU backend implements this trait;
//! the [`HeadlessRenderer`] shipped here stands in for it in tests and
//! the CLI simulator, tracking attachments and synthesizing depth from a
//! flat ground plane.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::camera::Camera;
use crate::coord::TileId;
use crate::layer::LayerId;
use crate::source::TilePayload;

/// Identity of one attached scene-graph node: a tile of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SceneKey {
    pub layer: LayerId,
    pub tile: TileId,
}

impl SceneKey {
    pub fn new(layer: LayerId, tile: TileId) -> Self {
        Self { layer, tile }
    }
}

impl fmt::Display for SceneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.tile)
    }
}

/// Pixel rectangle of the render target to read depth from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BufferRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// One-pixel region, the common case for interactive picking.
    pub fn pixel(x: u32, y: u32) -> Self {
        Self::new(x, y, 1, 1)
    }
}

/// Zero-to-one depth values read back from a render.
///
/// Carries its viewport origin so single-pixel and full-frame buffers
/// sample through the same interface.
#[derive(Debug, Clone)]
pub struct DepthBuffer {
    region: BufferRegion,
    depths: Vec<f32>,
}

impl DepthBuffer {
    pub fn new(region: BufferRegion, depths: Vec<f32>) -> Self {
        debug_assert_eq!(depths.len(), (region.width * region.height) as usize);
        Self { region, depths }
    }

    pub fn region(&self) -> BufferRegion {
        self.region
    }

    /// Samples the depth at absolute viewport coordinates, or `None`
    /// outside the buffer's region.
    pub fn sample(&self, px: u32, py: u32) -> Option<f32> {
        if px < self.region.x
            || py < self.region.y
            || px >= self.region.x + self.region.width
            || py >= self.region.y + self.region.height
        {
            return None;
        }
        let local_x = px - self.region.x;
        let local_y = py - self.region.y;
        self.depths
            .get((local_y * self.region.width + local_x) as usize)
            .copied()
    }
}

/// Scene-graph mutation and depth read-back, implemented by the GPU
/// backend.
///
/// `attach`/`detach` are called on the coordinating thread during frame
/// updates; implementations may defer actual GPU work but must reflect
/// attachment state immediately.
pub trait Renderer: Send + Sync {
    /// Adds a tile payload to the scene graph under `key`.
    fn attach(&self, key: SceneKey, payload: &TilePayload);

    /// Removes the node for `key` from the scene graph, if present.
    fn detach(&self, key: &SceneKey);

    /// Renders depth for `region` and returns the buffer.
    fn render_view_to_buffer(&self, camera: &Camera, region: BufferRegion) -> DepthBuffer;

    /// Propagates a viewport resize to the backend.
    fn on_window_resize(&self, width: u32, height: u32);
}

// =============================================================================
// Headless renderer
// =============================================================================

/// Renderer stand-in without a GPU: tracks attachments and synthesizes
/// depth from a flat ground plane at a configurable height.
///
/// Depth queries report a hit only while at least one node is attached,
/// so an empty scene picks as "no surface".
pub struct HeadlessRenderer {
    ground_height: f64,
    attached: RwLock<HashMap<SceneKey, usize>>,
    last_resize: RwLock<Option<(u32, u32)>>,
}

impl HeadlessRenderer {
    /// Ground plane at height zero.
    pub fn new() -> Self {
        Self::with_ground_height(0.0)
    }

    pub fn with_ground_height(ground_height: f64) -> Self {
        Self {
            ground_height,
            attached: RwLock::new(HashMap::new()),
            last_resize: RwLock::new(None),
        }
    }

    /// Number of currently attached scene nodes.
    pub fn attached_count(&self) -> usize {
        self.attached.read().len()
    }

    pub fn is_attached(&self, key: &SceneKey) -> bool {
        self.attached.read().contains_key(key)
    }

    /// Total bytes of attached payloads.
    pub fn attached_bytes(&self) -> usize {
        self.attached.read().values().sum()
    }

    /// Last resize forwarded by the view, if any.
    pub fn last_resize(&self) -> Option<(u32, u32)> {
        *self.last_resize.read()
    }

    fn depth_at(&self, camera: &Camera, px: u32, py: u32) -> f32 {
        if self.attached.read().is_empty() {
            return 1.0;
        }
        let eye = camera.eye();
        let toward = camera.unproject(px as f64, py as f64, 0.5);
        let dir = (toward - eye).normalize_or_zero();
        if dir.z.abs() < 1e-12 {
            return 1.0;
        }
        let t = (self.ground_height - eye.z) / dir.z;
        if t <= 0.0 {
            return 1.0;
        }
        let hit = eye + dir * t;
        let clip = camera.view_projection().project_point3(hit);
        if clip.z < 0.0 || clip.z >= 1.0 {
            return 1.0;
        }
        clip.z as f32
    }
}

impl Default for HeadlessRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for HeadlessRenderer {
    fn attach(&self, key: SceneKey, payload: &TilePayload) {
        self.attached.write().insert(key, payload.byte_len());
    }

    fn detach(&self, key: &SceneKey) {
        self.attached.write().remove(key);
    }

    fn render_view_to_buffer(&self, camera: &Camera, region: BufferRegion) -> DepthBuffer {
        let mut depths = Vec::with_capacity((region.width * region.height) as usize);
        for y in region.y..region.y + region.height {
            for x in region.x..region.x + region.width {
                depths.push(self.depth_at(camera, x, y));
            }
        }
        DepthBuffer::new(region, depths)
    }

    fn on_window_resize(&self, width: u32, height: u32) {
        *self.last_resize.write() = Some((width, height));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Viewport;
    use crate::source::PayloadKind;
    use bytes::Bytes;
    use glam::DVec3;

    fn key(layer: &str) -> SceneKey {
        SceneKey::new(LayerId::new(layer), TileId::root())
    }

    fn payload() -> TilePayload {
        TilePayload::new(PayloadKind::Terrain, Bytes::from_static(b"mesh"))
    }

    fn camera() -> Camera {
        Camera::new(
            DVec3::new(0.0, 0.0, 500.0),
            DVec3::ZERO,
            Viewport::new(64, 64),
        )
    }

    #[test]
    fn test_attach_detach_tracking() {
        let renderer = HeadlessRenderer::new();
        renderer.attach(key("a"), &payload());
        renderer.attach(key("b"), &payload());
        assert_eq!(renderer.attached_count(), 2);
        assert!(renderer.is_attached(&key("a")));
        assert_eq!(renderer.attached_bytes(), 8);

        renderer.detach(&key("a"));
        assert_eq!(renderer.attached_count(), 1);
        assert!(!renderer.is_attached(&key("a")));

        // Detaching an absent key is a no-op.
        renderer.detach(&key("a"));
        assert_eq!(renderer.attached_count(), 1);
    }

    #[test]
    fn test_empty_scene_has_no_depth_hit() {
        let renderer = HeadlessRenderer::new();
        let buffer = renderer.render_view_to_buffer(&camera(), BufferRegion::pixel(32, 32));
        assert_eq!(buffer.sample(32, 32), Some(1.0));
    }

    #[test]
    fn test_ground_plane_depth_under_camera() {
        let renderer = HeadlessRenderer::new();
        renderer.attach(key("terrain"), &payload());
        let buffer = renderer.render_view_to_buffer(&camera(), BufferRegion::pixel(32, 32));
        let depth = buffer.sample(32, 32).unwrap();
        assert!(depth < 1.0, "expected a surface hit, got far plane");
        assert!(depth > 0.0);
    }

    #[test]
    fn test_depth_buffer_sampling_bounds() {
        let region = BufferRegion::new(10, 20, 2, 2);
        let buffer = DepthBuffer::new(region, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(buffer.sample(10, 20), Some(0.1));
        assert_eq!(buffer.sample(11, 21), Some(0.4));
        assert_eq!(buffer.sample(9, 20), None);
        assert_eq!(buffer.sample(12, 20), None);
    }

    #[test]
    fn test_resize_forwarded() {
        let renderer = HeadlessRenderer::new();
        assert_eq!(renderer.last_resize(), None);
        renderer.on_window_resize(1920, 1080);
        assert_eq!(renderer.last_resize(), Some((1920, 1080)));
    }
}
