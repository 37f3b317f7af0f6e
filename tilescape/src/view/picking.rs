//! Screen-coordinate picking via depth read-back.
//!
//! Converts a viewport pixel to a world position by reading the depth
//! under the cursor and unprojecting it through the camera. While the
//! render loop is active a single pixel is read back per query; while it
//! is paused the cached full-frame depth from the last render answers
//! queries without touching the renderer.

use glam::DVec3;
use tracing::trace;

use super::{View, MAX_PICK_DEPTH};
use crate::render::BufferRegion;

impl View {
    /// Resolves a viewport pixel to a world position, or `None` when
    /// nothing is under the cursor (depth at the sanity bound) or the
    /// pixel is outside the viewport. Never errors.
    pub fn pick_position(&self, px: u32, py: u32) -> Option<DVec3> {
        let viewport = self.camera.viewport();
        if px >= viewport.width || py >= viewport.height {
            return None;
        }
        let depth = match (&self.depth_cache, self.depth_stale) {
            // Paused loop with a valid cached frame: no render needed.
            (Some(cache), false) => cache.sample(px, py)?,
            // Live loop (or stale cache): read back a single pixel.
            _ => {
                let buffer = self
                    .renderer
                    .render_view_to_buffer(&self.camera, BufferRegion::pixel(px, py));
                buffer.sample(px, py)?
            }
        };
        if depth >= MAX_PICK_DEPTH {
            trace!(px, py, depth, "Pick found no surface");
            return None;
        }
        Some(self.camera.unproject(px as f64, py as f64, depth as f64))
    }
}
