//! Camera pose, view frustum, and screen-space error estimation.
//!
//! The camera is the input to every refinement decision: each frame the
//! layers ask it which tiles intersect the view frustum and how large a
//! tile's geometric error would appear on screen. Screen-space error
//! drives refine/stop decisions; see the glossary entry in the project
//! docs.
//!
//! Matrices follow the right-handed, zero-to-one depth convention, so a
//! depth read-back value of `1.0` means "nothing between the camera and
//! the far plane".

use glam::{DMat4, DVec3, DVec4};
use tracing::warn;

use crate::coord::Extent;

/// Default vertical field of view in degrees.
pub const DEFAULT_FOV_Y_DEGREES: f64 = 60.0;

/// Default near plane distance.
///
/// A one-meter near plane keeps usable f32 depth precision across the
/// kilometer-scale distances geospatial cameras work at.
pub const DEFAULT_NEAR: f64 = 1.0;

/// Default far plane distance.
pub const DEFAULT_FAR: f64 = 1_000_000.0;

// =============================================================================
// Viewport
// =============================================================================

/// Pixel dimensions of the render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}

// =============================================================================
// Camera
// =============================================================================

/// Camera pose and projection state.
///
/// Positions are in the view's reference CRS with z up; the ground plane
/// of a tiled layer lies at z = 0 unless the layer's payload says
/// otherwise.
#[derive(Debug, Clone)]
pub struct Camera {
    eye: DVec3,
    target: DVec3,
    up: DVec3,
    fov_y_radians: f64,
    near: f64,
    far: f64,
    viewport: Viewport,
}

impl Camera {
    /// Creates a camera looking from `eye` toward `target`.
    pub fn new(eye: DVec3, target: DVec3, viewport: Viewport) -> Self {
        Self {
            eye,
            target,
            up: DVec3::Z,
            fov_y_radians: DEFAULT_FOV_Y_DEGREES.to_radians(),
            near: DEFAULT_NEAR,
            far: DEFAULT_FAR,
            viewport,
        }
    }

    pub fn eye(&self) -> DVec3 {
        self.eye
    }

    pub fn target(&self) -> DVec3 {
        self.target
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn fov_y_radians(&self) -> f64 {
        self.fov_y_radians
    }

    /// Moves the camera, keeping projection parameters.
    pub fn set_pose(&mut self, eye: DVec3, target: DVec3) {
        self.eye = eye;
        self.target = target;
    }

    /// Overrides the vertical field of view (radians).
    pub fn set_fov_y_radians(&mut self, fov_y: f64) {
        self.fov_y_radians = fov_y;
    }

    /// Updates the viewport dimensions.
    ///
    /// Zero-sized viewports are rejected with a warning and leave the
    /// previous dimensions intact, matching the engine's resize policy.
    pub fn set_viewport(&mut self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            warn!(width, height, "Rejecting invalid viewport dimensions");
            return false;
        }
        self.viewport = Viewport::new(width, height);
        true
    }

    pub fn view_matrix(&self) -> DMat4 {
        // Nadir views (straight down) are the common case for geospatial
        // cameras; fall back to a horizontal up vector when the look
        // direction is parallel to the configured one.
        let forward = (self.target - self.eye).normalize_or_zero();
        let up = if forward.cross(self.up).length_squared() < 1e-12 {
            DVec3::Y
        } else {
            self.up
        };
        DMat4::look_at_rh(self.eye, self.target, up)
    }

    pub fn projection_matrix(&self) -> DMat4 {
        DMat4::perspective_rh(
            self.fov_y_radians,
            self.viewport.aspect_ratio(),
            self.near,
            self.far,
        )
    }

    pub fn view_projection(&self) -> DMat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Extracts the view frustum for culling.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.view_projection())
    }

    /// Euclidean distance from the eye to the closest point of the
    /// extent's bounding box with the given vertical bounds.
    pub fn distance_to_extent(&self, extent: &Extent, z_min: f64, z_max: f64) -> f64 {
        let closest = DVec3::new(
            self.eye.x.clamp(extent.min_x(), extent.max_x()),
            self.eye.y.clamp(extent.min_y(), extent.max_y()),
            self.eye.z.clamp(z_min, z_max),
        );
        (self.eye - closest).length()
    }

    /// Estimates the on-screen pixel error of rendering a tile with the
    /// given geometric error at the given distance.
    ///
    /// Standard perspective LOD metric: the error shrinks linearly with
    /// distance and scales with viewport height over the field of view.
    /// A zero distance (camera inside the tile) maps to infinity so the
    /// tile always refines.
    pub fn screen_space_error(&self, geometric_error: f64, distance: f64) -> f64 {
        if distance <= f64::EPSILON {
            return f64::INFINITY;
        }
        let screen_factor =
            self.viewport.height as f64 / (2.0 * (self.fov_y_radians / 2.0).tan());
        geometric_error / distance * screen_factor
    }

    /// Unprojects a pixel plus depth value back to world coordinates.
    ///
    /// `depth` is the zero-to-one depth buffer value at that pixel.
    pub fn unproject(&self, px: f64, py: f64, depth: f64) -> DVec3 {
        let ndc = DVec3::new(
            2.0 * (px + 0.5) / self.viewport.width as f64 - 1.0,
            1.0 - 2.0 * (py + 0.5) / self.viewport.height as f64,
            depth,
        );
        self.view_projection().inverse().project_point3(ndc)
    }
}

// =============================================================================
// Frustum
// =============================================================================

/// Six view-frustum planes in world space.
///
/// Planes are stored as `(a, b, c, d)` with `ax + by + cz + d >= 0` on the
/// inside, extracted from the view-projection matrix (Gribb/Hartmann).
#[derive(Debug, Clone)]
pub struct Frustum {
    planes: [DVec4; 6],
}

impl Frustum {
    /// Extracts frustum planes from a view-projection matrix with
    /// zero-to-one depth.
    pub fn from_matrix(m: DMat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        Self {
            planes: [
                r3 + r0, // left
                r3 - r0, // right
                r3 + r1, // bottom
                r3 - r1, // top
                r2,      // near (z >= 0 in zero-to-one depth)
                r3 - r2, // far
            ],
        }
    }

    /// Tests an axis-aligned box against the frustum.
    ///
    /// Conservative: returns true for boxes that intersect or contain the
    /// frustum; never false for a visible box.
    pub fn intersects_aabb(&self, min: DVec3, max: DVec3) -> bool {
        for plane in &self.planes {
            // Positive vertex: the box corner furthest along the plane normal.
            let p = DVec3::new(
                if plane.x >= 0.0 { max.x } else { min.x },
                if plane.y >= 0.0 { max.y } else { min.y },
                if plane.z >= 0.0 { max.z } else { min.z },
            );
            if plane.x * p.x + plane.y * p.y + plane.z * p.z + plane.w < 0.0 {
                return false;
            }
        }
        true
    }

    /// Tests a tile extent with vertical bounds against the frustum.
    pub fn intersects_extent(&self, extent: &Extent, z_min: f64, z_max: f64) -> bool {
        self.intersects_aabb(
            DVec3::new(extent.min_x(), extent.min_y(), z_min),
            DVec3::new(extent.max_x(), extent.max_y(), z_max),
        )
    }
}
