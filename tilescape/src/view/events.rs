//! Public view lifecycle events.
//!
//! Events are fan-out broadcast: every subscriber gets every event sent
//! after it subscribed. Emission never blocks; a view with no subscribers
//! simply drops the event.

use tokio::sync::broadcast;
use tracing::debug;

use crate::layer::LayerId;

/// Capacity of the event broadcast channel; slow subscribers past this
/// lag start losing the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events a view publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// A layer was attached.
    LayerAdded { layer: LayerId },
    /// A layer (and its attached subtree) was removed.
    LayerRemoved { layer: LayerId },
    /// Every layer of the current initialization round became ready.
    /// Fires again whenever a later round of added layers completes.
    LayersInitialized,
    /// First `LayersInitialized` of the view's lifetime. Fires once.
    Initialized,
    /// The view was disposed.
    Disposed,
}

pub(super) struct EventHub {
    tx: broadcast::Sender<ViewEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ViewEvent) {
        debug!(?event, "View event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
