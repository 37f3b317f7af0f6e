//! The per-frame update cycle and frame-requester registry.
//!
//! The main loop is single-threaded and cooperative: one cycle per
//! animation frame while the view is dirty or the scheduler has work in
//! flight. Each cycle runs the fixed sequence from the engine contract:
//!
//! 1. controls/camera requesters (`BeforeLayerUpdate`)
//! 2. per root layer: `pre_update` then `update`
//! 3. `AfterLayerUpdate` and `UpdateEnd` requesters
//! 4. scheduler pump
//! 5. render if any redraw was requested, else pause until the next
//!    `notify_change` (`AfterRender` requesters run on render)
//!
//! A cycle is a *first* update when no `notify_change` arrived during the
//! previous cycle's execution; requesters receive this flag to reset
//! animation state.
//!
//! Requester removal is deferred: a requester removed mid-cycle (by
//! returning [`RequesterDirective::Remove`] from its own invocation or
//! via [`MainLoop::remove_frame_requester`]) stops being invoked at once
//! but is only unlinked at the start of the next cycle, so the iteration
//! in progress is never corrupted.

use std::collections::HashMap;
use std::time::Duration;

use tracing::trace;

use super::View;

/// Fixed set of per-cycle hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachPoint {
    /// Before layer updates; controls and camera animators attach here.
    BeforeLayerUpdate,
    /// After every layer updated, before the scheduler pump.
    AfterLayerUpdate,
    /// After a frame was actually rendered.
    AfterRender,
    /// End of the update phase, whether or not a render follows.
    UpdateEnd,
}

/// Per-invocation timing information passed to every requester.
#[derive(Debug, Clone, Copy)]
pub struct FrameTick {
    /// Time since the previous cycle.
    pub dt: Duration,
    /// True when no `notify_change` arrived during the previous cycle's
    /// execution.
    pub first_update: bool,
}

/// What a requester wants done with itself after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterDirective {
    /// Keep invoking on future cycles.
    Continue,
    /// Unregister; takes effect at the start of the next cycle.
    Remove,
}

/// Handle identifying a registered frame requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId(u64);

type RequesterFn = Box<dyn FnMut(&mut View, FrameTick) -> RequesterDirective>;

struct FrameRequester {
    id: RequesterId,
    callback: RequesterFn,
}

/// Whether the loop is actively rendering or waiting for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingState {
    Active,
    Paused,
}

/// Drives the per-frame cycle over one view.
pub struct MainLoop {
    requesters: HashMap<AttachPoint, Vec<FrameRequester>>,
    pending_removals: Vec<RequesterId>,
    next_requester: u64,
    state: RenderingState,
    continuation: bool,
}

impl MainLoop {
    pub fn new() -> Self {
        Self {
            requesters: HashMap::new(),
            pending_removals: Vec::new(),
            next_requester: 0,
            state: RenderingState::Paused,
            continuation: false,
        }
    }

    pub fn rendering_state(&self) -> RenderingState {
        self.state
    }

    /// Registers a callback invoked once per cycle at `point`.
    pub fn register(
        &mut self,
        point: AttachPoint,
        callback: impl FnMut(&mut View, FrameTick) -> RequesterDirective + 'static,
    ) -> RequesterId {
        let id = RequesterId(self.next_requester);
        self.next_requester += 1;
        self.requesters.entry(point).or_default().push(FrameRequester {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Schedules a requester for removal at the start of the next cycle.
    /// It is not invoked again in the current cycle.
    pub fn remove_frame_requester(&mut self, id: RequesterId) {
        if !self.pending_removals.contains(&id) {
            self.pending_removals.push(id);
        }
    }

    /// Number of currently linked requesters at `point` (pending removals
    /// still count until the next cycle unlinks them).
    pub fn requester_count(&self, point: AttachPoint) -> usize {
        self.requesters.get(&point).map(Vec::len).unwrap_or(0)
    }

    /// Runs one cycle if the view is dirty or the scheduler is working.
    ///
    /// Returns true if a cycle ran. When the loop is paused and nothing
    /// changed, this is a cheap no-op for the frame driver to call every
    /// tick.
    pub fn step(&mut self, view: &mut View, dt: Duration) -> bool {
        if !view.is_dirty() && view.scheduler().is_idle() {
            self.state = RenderingState::Paused;
            return false;
        }
        self.run_cycle(view, dt);
        true
    }

    /// Runs one full update cycle unconditionally.
    pub fn run_cycle(&mut self, view: &mut View, dt: Duration) {
        self.apply_pending_removals();
        let epoch_at_start = view.change_epoch();
        let tick = FrameTick {
            dt,
            first_update: !self.continuation,
        };
        trace!(first_update = tick.first_update, "Main loop cycle");

        // 1. Controls/camera drivers.
        self.invoke(AttachPoint::BeforeLayerUpdate, view, tick);

        // 2./3. Layer refinement against the accumulated change set.
        let changes = view.begin_cycle();
        view.update_layers(&changes);

        // 4. Post-update hooks.
        self.invoke(AttachPoint::AfterLayerUpdate, view, tick);
        self.invoke(AttachPoint::UpdateEnd, view, tick);

        // 5. Advance async work and apply completions.
        view.pump_scheduler();

        // 6. Render or pause.
        if view.take_needs_redraw() {
            view.render_frame();
            self.state = RenderingState::Active;
            self.invoke(AttachPoint::AfterRender, view, tick);
        } else {
            self.state = RenderingState::Paused;
        }

        self.continuation = view.change_epoch() > epoch_at_start;
    }

    fn invoke(&mut self, point: AttachPoint, view: &mut View, tick: FrameTick) {
        // Take the list out so callbacks can freely mutate the view;
        // registration is not possible mid-invocation (the loop is
        // exclusively borrowed), so putting the list back cannot clobber
        // anything.
        let Some(mut list) = self.requesters.remove(&point) else {
            return;
        };
        for requester in &mut list {
            if self.pending_removals.contains(&requester.id) {
                continue;
            }
            if (requester.callback)(view, tick) == RequesterDirective::Remove {
                self.pending_removals.push(requester.id);
            }
        }
        self.requesters.insert(point, list);
    }

    fn apply_pending_removals(&mut self) {
        if self.pending_removals.is_empty() {
            return;
        }
        for list in self.requesters.values_mut() {
            list.retain(|requester| !self.pending_removals.contains(&requester.id));
        }
        self.pending_removals.clear();
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Viewport};
    use crate::coord::Crs;
    use crate::render::HeadlessRenderer;
    use crate::scheduler::SchedulerConfig;
    use crate::view::{ChangeSource, ViewRegistry};
    use glam::DVec3;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    const DT: Duration = Duration::from_millis(16);

    fn make_view(registry: &mut ViewRegistry) -> View {
        View::new(
            registry,
            Crs::new("EPSG:3857"),
            Camera::new(
                DVec3::new(0.0, 0.0, 1000.0),
                DVec3::ZERO,
                Viewport::new(640, 480),
            ),
            Arc::new(HeadlessRenderer::new()),
            SchedulerConfig::default(),
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_requesters_invoked_in_registration_order() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            main_loop.register(AttachPoint::BeforeLayerUpdate, move |_, _| {
                calls.borrow_mut().push(name);
                RequesterDirective::Continue
            });
        }
        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*calls.borrow(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_self_removal_is_deferred_to_next_cycle() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();
        let count = Rc::new(RefCell::new(0));

        let counter = count.clone();
        main_loop.register(AttachPoint::BeforeLayerUpdate, move |_, _| {
            *counter.borrow_mut() += 1;
            RequesterDirective::Remove
        });

        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*count.borrow(), 1);
        // Still linked until the next cycle starts.
        assert_eq!(main_loop.requester_count(AttachPoint::BeforeLayerUpdate), 1);

        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*count.borrow(), 1, "removed requester ran again");
        assert_eq!(main_loop.requester_count(AttachPoint::BeforeLayerUpdate), 0);
    }

    #[tokio::test]
    async fn test_external_removal_skips_remaining_invocations() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();
        let count = Rc::new(RefCell::new(0));

        let counter = count.clone();
        let id = main_loop.register(AttachPoint::UpdateEnd, move |_, _| {
            *counter.borrow_mut() += 1;
            RequesterDirective::Continue
        });

        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*count.borrow(), 1);

        main_loop.remove_frame_requester(id);
        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*count.borrow(), 1);
    }

    #[tokio::test]
    async fn test_first_update_flag_tracks_changes_during_cycle() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();
        let flags = Rc::new(RefCell::new(Vec::new()));
        let notified_once = Rc::new(RefCell::new(false));

        let flags_clone = flags.clone();
        let notified = notified_once.clone();
        main_loop.register(AttachPoint::BeforeLayerUpdate, move |view, tick| {
            flags_clone.borrow_mut().push(tick.first_update);
            // Simulate a control driving the camera on the first cycle
            // only.
            if !*notified.borrow() {
                *notified.borrow_mut() = true;
                view.notify_change(ChangeSource::Camera, true);
            }
            RequesterDirective::Continue
        });

        main_loop.run_cycle(&mut view, DT);
        main_loop.run_cycle(&mut view, DT);
        main_loop.run_cycle(&mut view, DT);

        // Cycle 1 is first (nothing preceded it); cycle 2 is a
        // continuation of the notify during cycle 1; cycle 3 is first
        // again.
        assert_eq!(*flags.borrow(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_step_skips_when_clean_and_idle() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();

        // Fresh view: no changes, nothing scheduled.
        assert!(!main_loop.step(&mut view, DT));
        assert_eq!(main_loop.rendering_state(), RenderingState::Paused);

        view.notify_change(ChangeSource::Camera, true);
        assert!(main_loop.step(&mut view, DT));
        assert_eq!(main_loop.rendering_state(), RenderingState::Active);

        // The change was consumed; the loop pauses again.
        assert!(!main_loop.step(&mut view, DT));
    }

    #[tokio::test]
    async fn test_after_render_only_fires_on_redraw() {
        let mut registry = ViewRegistry::new();
        let mut view = make_view(&mut registry);
        let mut main_loop = MainLoop::new();
        let renders = Rc::new(RefCell::new(0));

        let counter = renders.clone();
        main_loop.register(AttachPoint::AfterRender, move |_, _| {
            *counter.borrow_mut() += 1;
            RequesterDirective::Continue
        });

        // Bookkeeping-only change: no render, no AfterRender.
        view.notify_change(ChangeSource::External("bookkeeping"), false);
        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*renders.borrow(), 0);

        view.notify_change(ChangeSource::Camera, true);
        main_loop.run_cycle(&mut view, DT);
        assert_eq!(*renders.borrow(), 1);
    }
}
