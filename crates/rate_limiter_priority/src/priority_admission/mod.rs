//! Gate requests to a rate-limited upstream behind a priority queue.

mod limiter;
mod queue;
mod stats;
mod window;

pub mod backoff;
pub mod error;

use std::time::Duration;

pub use backoff::JitterMode;
pub use error::AdmissionError;
pub use limiter::{RateLimitStatus, RequestRateLimiter};

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

use bon::Builder;

/// Configuration of the admission gate.
///
/// The defaults suit a single generative-AI upstream with a per-minute token
/// quota. All fields are private; configure through the builder.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_concurrency` | 4 | Requests allowed in flight at once |
/// | `window_budget` | 100_000 | Cost units admitted per accounting window |
/// | `window_length` | 60s | Fixed window cadence; usage zeroes at each boundary |
/// | `max_queue_depth` | 256 | Pending requests before `QueueFull` |
/// | `initial_backoff` | 60s | Cooldown for an unhinted overload signal |
/// | `backoff_base` | 2 | Escalation factor for consecutive overloads |
/// | `max_backoff` | 300s | Ceiling for escalated cooldowns |
/// | `jitter` | `None` | Optional full jitter on escalated cooldowns |
///
/// # Example
///
/// ```rust
/// use rate_limiter_priority::priority_admission::PriorityAdmissionSettings;
///
/// let settings = PriorityAdmissionSettings::builder()
///     .max_concurrency(2)
///     .window_budget(32_000)
///     .build();
/// assert_eq!(settings.get_max_concurrency(), 2);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct PriorityAdmissionSettings {
    /// Maximum number of admitted-but-unfinished requests.
    ///
    /// Completion of any admitted request frees a slot for the next eligible
    /// queued one.
    #[builder(default = default_max_concurrency())]
    pub(super) max_concurrency: usize,

    /// Accumulated cost admitted within one accounting window.
    ///
    /// Cost is whatever unit the caller estimates in (token counts for LLM
    /// upstreams). Accounting only; a wrong estimate skews smoothing, not
    /// correctness.
    #[builder(default = default_window_budget())]
    pub(super) window_budget: u64,

    /// Length of the fixed accounting window.
    #[builder(default = default_window_length())]
    pub(super) window_length: Duration,

    /// Pending requests held before new calls are rejected outright.
    #[builder(default = default_max_queue_depth())]
    pub(super) max_queue_depth: usize,

    /// Cooldown applied to the first overload signal that carries no
    /// `retryDelay` hint.
    #[builder(default = default_initial_backoff())]
    pub(super) initial_backoff: Duration,

    /// Multiplier applied per consecutive unhinted overload.
    #[builder(default = default_backoff_base())]
    pub(super) backoff_base: u32,

    /// Ceiling for escalated cooldowns.
    #[builder(default = default_max_backoff())]
    pub(super) max_backoff: Duration,

    /// Jitter mode for escalated cooldowns. Hinted cooldowns are always
    /// applied exactly as hinted.
    #[builder(default)]
    pub(super) jitter: JitterMode,
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_window_budget() -> u64 {
    100_000
}

const fn default_window_length() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_queue_depth() -> usize {
    256
}

/// Matches the common "try again in a minute" guidance of LLM quota errors.
const fn default_initial_backoff() -> Duration {
    Duration::from_secs(60)
}

const fn default_backoff_base() -> u32 {
    2
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

impl Default for PriorityAdmissionSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            window_budget: default_window_budget(),
            window_length: default_window_length(),
            max_queue_depth: default_max_queue_depth(),
            initial_backoff: default_initial_backoff(),
            backoff_base: default_backoff_base(),
            max_backoff: default_max_backoff(),
            jitter: JitterMode::None,
        }
    }
}

impl PriorityAdmissionSettings {
    pub fn get_max_concurrency(&self) -> usize {
        self.max_concurrency
    }
    pub fn get_window_budget(&self) -> u64 {
        self.window_budget
    }
    pub fn get_window_length(&self) -> Duration {
        self.window_length
    }
    pub fn get_max_queue_depth(&self) -> usize {
        self.max_queue_depth
    }
}
