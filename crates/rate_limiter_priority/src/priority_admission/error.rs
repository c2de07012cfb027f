//! Error surface of [`RequestRateLimiter::execute_request`].
//!
//! [`RequestRateLimiter::execute_request`]: super::RequestRateLimiter::execute_request

use std::time::Duration;

use snafu::Snafu;

/// Outcome of a refused or failed request.
///
/// `RateLimited` and `QueueFull` are raised by the limiter itself, before the
/// caller's work runs. `Upstream` wraps whatever the work produced, verbatim;
/// the limiter only inspects it for overload wording before re-raising.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdmissionError<E>
where
    E: std::error::Error + 'static,
{
    /// The upstream signalled overload recently; admission is suspended.
    #[snafu(display("upstream is cooling down; admission resumes in {}s", retry_in.as_secs()))]
    RateLimited { retry_in: Duration },

    /// The pending queue is at capacity. The queue was not mutated.
    #[snafu(display("pending queue is full ({depth} requests waiting)"))]
    QueueFull { depth: usize },

    /// The admitted work failed.
    #[snafu(display("{source}"))]
    Upstream { source: E },
}

impl<E> AdmissionError<E>
where
    E: std::error::Error + 'static,
{
    /// True for the fail-fast rejection raised during an active backoff
    /// window.
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, AdmissionError::RateLimited { .. })
    }

    /// Remaining cooldown, when this is a `RateLimited` rejection.
    pub const fn retry_in(&self) -> Option<Duration> {
        match self {
            AdmissionError::RateLimited { retry_in } => Some(*retry_in),
            _ => None,
        }
    }

    /// Unwrap the upstream error, if the work ran and failed.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            AdmissionError::Upstream { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct Failure;

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "validation failed")
        }
    }

    impl std::error::Error for Failure {}

    #[test]
    fn upstream_display_is_verbatim() {
        let error: AdmissionError<Failure> = AdmissionError::Upstream { source: Failure };
        assert_eq!(error.to_string(), "validation failed");
    }

    #[test]
    fn rate_limited_reports_remaining_cooldown() {
        let error: AdmissionError<Failure> = AdmissionError::RateLimited {
            retry_in: Duration::from_secs(42),
        };
        assert!(error.is_rate_limited());
        assert_eq!(error.retry_in(), Some(Duration::from_secs(42)));
        assert!(error.to_string().contains("42s"));
    }
}
