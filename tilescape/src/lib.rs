//! Tilescape - tiled level-of-detail streaming for geospatial views.
//!
//! Tilescape decides, every frame, which tiles of which layers must be
//! fetched, refined, displayed, or evicted for the current camera pose,
//! and coordinates the asynchronous fetch/decode work with a render loop
//! that stays responsive. Rendering itself, projection math, and tile
//! codecs are external collaborators behind narrow traits.
//!
//! # Architecture
//!
//! ```text
//! MainLoop ──cycle──► View ──pre_update/update──► Layer (tile tree)
//!    │                 │                             │ fetch commands
//!    │                 │◄──completions── Scheduler ◄─┘
//!    │                 │                    │ spawns
//!    └── requesters    └── picking       Source (fetch + decode cache)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tilescape::prelude::*;
//!
//! let mut registry = ViewRegistry::new();
//! let renderer = Arc::new(HeadlessRenderer::new());
//! let mut view = View::new(
//!     &mut registry,
//!     Crs::new("EPSG:3857"),
//!     camera,
//!     renderer,
//!     SchedulerConfig::default(),
//!     tokio::runtime::Handle::current(),
//! );
//! let ground = Layer::tiled_geometry("ground", SourceHandle::new(source))
//!     .with_extent(extent);
//! let ready = view.add_layer(ground, None);
//! let mut main_loop = MainLoop::new();
//! loop {
//!     main_loop.step(&mut view, dt);
//! }
//! ```

pub mod camera;
pub mod coord;
pub mod layer;
pub mod render;
pub mod scheduler;
pub mod source;
pub mod telemetry;
pub mod view;

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::camera::{Camera, Viewport};
    pub use crate::coord::{Crs, Extent, TileId};
    pub use crate::layer::{Layer, LayerId, RefinementConfig, TileState};
    pub use crate::render::{HeadlessRenderer, Renderer, SceneKey};
    pub use crate::scheduler::{Priority, RetryPolicy, Scheduler, SchedulerConfig};
    pub use crate::source::{
        PayloadKind, Source, SourceHandle, SourceKey, SyntheticSource, SyntheticSourceConfig,
        TilePayload,
    };
    pub use crate::telemetry::{StreamingMetrics, TelemetrySnapshot};
    pub use crate::view::{
        AttachPoint, ChangeSource, FrameTick, MainLoop, ReadySignal, RenderingState,
        RequesterDirective, View, ViewError, ViewEvent, ViewRegistry,
    };
}
