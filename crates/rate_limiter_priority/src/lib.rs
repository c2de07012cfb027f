//! Priority-queued request rate limiter with upstream backoff handling.
//!
//! This crate gates access to a rate-limited upstream dependency (typically a
//! generative-AI HTTP API). Callers hand the limiter a unit of async work
//! tagged with a priority and an estimated cost; the limiter queues it, admits
//! it under a concurrency cap and a per-window cost budget, and reacts to
//! upstream overload signals by suspending all admission for a cooldown
//! period.
//!
//! # Behavior
//!
//! 1. **Priority admission**: pending work is admitted highest-priority first,
//!    FIFO within a priority tier, so equal-priority work cannot starve.
//! 2. **Windowed budget**: admitted cost accumulates against a fixed window
//!    that resets on a wall-clock cadence.
//! 3. **Backoff**: an error that looks like upstream overload (HTTP 429,
//!    quota or rate-limit wording) arms a cooldown during which new calls
//!    fail fast instead of queueing. Hinted cooldowns (`retryDelay:"37s"`)
//!    are honored exactly; unhinted ones escalate exponentially until a
//!    request succeeds again.
//!
//! The limiter never retries on its own; callers observe the rejection and
//! decide.
//!
//! # Basic usage
//!
//! ```
//! use rate_limiter_priority::priority_admission::{
//!     PriorityAdmissionSettings, RequestRateLimiter,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RequestRateLimiter::new(PriorityAdmissionSettings::default());
//! let reply = limiter
//!     .execute_request(5, 1_200, || async {
//!         Ok::<_, std::io::Error>("upstream reply")
//!     })
//!     .await?;
//! assert_eq!(reply, "upstream reply");
//! # Ok(())
//! # }
//! ```
//!
//! # Safety & concurrency
//!
//! All shared state lives behind one short-lived lock that is never held
//! across a suspension point; admitted work runs entirely outside it. No
//! unsafe code.

pub mod priority_admission;
