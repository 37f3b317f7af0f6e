//! Scheduling priority and retry policies.
//!
//! Commands are ordered by [`Priority`] (higher first), recomputed at each
//! submission from the current screen-space error so near/large-impact
//! tiles starve less relevant ones. [`RetryPolicy`] controls how a fetch
//! handles transient failures before giving up.

use std::time::Duration;

// =============================================================================
// Priority constants
// =============================================================================

/// Base priority for refinement of currently visible tiles.
pub const PRIORITY_REFINE: i32 = 100;

/// Priority for speculative prefetch work.
pub const PRIORITY_PREFETCH: i32 = 0;

/// Priority for cleanup and maintenance commands.
pub const PRIORITY_HOUSEKEEPING: i32 = -50;

/// Screen-space-error contribution cap on top of [`PRIORITY_REFINE`].
///
/// Bounds the dynamic range so a pathological SSE can never outrank by
/// more than one level band.
pub const REFINE_SSE_CAP: i32 = 100;

/// Command scheduling priority. Higher values execute first; ties are
/// FIFO in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Refinement of a visible tile at the base screen-space error.
    pub const REFINE: Priority = Priority(PRIORITY_REFINE);

    /// Speculative prefetch around the current view.
    pub const PREFETCH: Priority = Priority(PRIORITY_PREFETCH);

    /// Maintenance work that runs when nothing else needs the slots.
    pub const HOUSEKEEPING: Priority = Priority(PRIORITY_HOUSEKEEPING);

    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    /// Priority of a refinement command, scaled by how badly the tile
    /// needs refining.
    ///
    /// The screen-space error in pixels is added on top of the refine
    /// base, capped at [`REFINE_SSE_CAP`], so a tile that is grossly
    /// under-resolved outranks one barely past the threshold.
    pub fn for_refinement(screen_space_error: f64) -> Self {
        let boost = screen_space_error.clamp(0.0, REFINE_SSE_CAP as f64) as i32;
        Self(PRIORITY_REFINE + boost)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::PREFETCH
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Default initial delay for exponential backoff.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum backoff delay.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How a command handles transient fetch failures.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,

    /// Up to `max_attempts` total attempts with a constant delay.
    Fixed { max_attempts: u32, delay: Duration },

    /// Exponentially growing delay, capped at `max_delay`.
    ExponentialBackoff {
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Exponential backoff with the default delay parameters.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based), or `None` when the attempts are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = (initial_delay.as_millis() as f64 * factor)
                    .min(max_delay.as_millis() as f64);
                Some(Duration::from_millis(delay_ms as u64))
            }
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}
