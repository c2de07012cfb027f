//! Overload-signal detection and cooldown scheduling.
//!
//! The limiter treats an upstream error as an overload signal purely on its
//! rendered message: a `429` status token, "too many requests", "quota" or
//! "rate limit" wording marks it, case-insensitively. When the message also
//! carries a `retryDelay:"37s"` hint (the shape Google APIs embed in
//! RetryInfo error details), that hint sets the cooldown exactly; otherwise an
//! exponential schedule decides.

use std::cmp;
use std::time::Duration;

/// The jitter mode applied to scheduled (unhinted) cooldowns.
#[derive(Clone, Copy, Debug, Default)]
pub enum JitterMode {
    /// Use the scheduled delay as-is.
    #[default]
    None,

    /// Full jitter.
    ///
    /// The applied delay is anywhere from 0 up to the scheduled delay.
    /// Spreads recovery out when many clients back off from the same
    /// upstream at once.
    Full,
}

const OVERLOAD_MARKERS: [&str; 4] = ["429", "too many requests", "quota", "rate limit"];

/// Whether `message` reads as an upstream overload rather than an ordinary
/// failure.
pub fn is_overload_signal(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    OVERLOAD_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Extract a `retryDelay:"<N>s"` hint from an error message.
///
/// Accepts the quoting/spacing variants Google error payloads show up with
/// (`retryDelay:"37s"`, `"retryDelay": "0.5s"`). Returns `None` when the
/// field is absent or malformed; the caller then falls back to its schedule.
pub fn retry_after_hint(message: &str) -> Option<Duration> {
    let lowered = message.to_ascii_lowercase();
    let field = lowered.find("retrydelay")?;
    let rest = &lowered[field + "retrydelay".len()..];

    let digits = rest.find(|c: char| c.is_ascii_digit())?;
    if !rest[..digits]
        .chars()
        .all(|c| matches!(c, ':' | '=' | '"' | '\'' | ' '))
    {
        return None;
    }

    let rest = &rest[digits..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    if !rest[end..].starts_with('s') {
        return None;
    }

    let seconds: f64 = rest[..end].parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Exponential cooldown schedule for overloads that carry no hint.
///
/// The first overload cools down for `initial`; each consecutive overload
/// without an intervening success multiplies the delay by `base`, capped at
/// `max`. A successful completion resets the schedule.
#[derive(Clone, Debug)]
pub(super) struct BackoffSchedule {
    initial: Duration,
    base: u32,
    max: Duration,
    jitter: JitterMode,
    current: Duration,
}

impl BackoffSchedule {
    pub(super) fn new(initial: Duration, base: u32, max: Duration, jitter: JitterMode) -> Self {
        Self {
            initial,
            base,
            max,
            jitter,
            current: initial,
        }
    }

    /// The delay to apply now, advancing the escalation for the next one.
    pub(super) fn next_delay(&mut self) -> Duration {
        let scheduled = cmp::min(self.current, self.max);
        self.current = cmp::min(
            self.current.saturating_mul(self.base.max(1)),
            self.max,
        );
        self.apply_jitter(scheduled)
    }

    pub(super) fn reset(&mut self) {
        self.current = self.initial;
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterMode::None => delay,
            JitterMode::Full => {
                if delay.as_millis() == 0 {
                    return delay;
                }
                let jitter = (rand::random::<u64>() % (delay.as_millis() as u64)) + 1;
                Duration::from_millis(jitter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_overload_wording() {
        assert!(is_overload_signal("429 Too Many Requests"));
        assert!(is_overload_signal("RESOURCE_EXHAUSTED: Quota exceeded for model"));
        assert!(is_overload_signal("upstream Rate Limit hit, slow down"));
        assert!(is_overload_signal("TOO MANY REQUESTS"));
    }

    #[test]
    fn ordinary_failures_are_not_overload() {
        assert!(!is_overload_signal("validation failed"));
        assert!(!is_overload_signal("500 Internal Server Error"));
        assert!(!is_overload_signal("connection reset by peer"));
    }

    #[test]
    fn parses_retry_delay_hint() {
        assert_eq!(
            retry_after_hint(r#"quota exceeded, retryDelay:"37s""#),
            Some(Duration::from_secs(37))
        );
        assert_eq!(
            retry_after_hint(r#"{"retryDelay": "5s"}"#),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            retry_after_hint(r#"retryDelay: "0.5s""#),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn malformed_hints_fall_back() {
        assert_eq!(retry_after_hint("quota exceeded"), None);
        assert_eq!(retry_after_hint(r#"retryDelay:"soon""#), None);
        assert_eq!(retry_after_hint(r#"retryDelay:"37""#), None);
        assert_eq!(retry_after_hint(r#"retryDelay is 37 something"#), None);
    }

    #[test]
    fn schedule_grows_to_max() {
        let mut schedule = BackoffSchedule::new(
            Duration::from_secs(60),
            2,
            Duration::from_secs(300),
            JitterMode::None,
        );

        assert_eq!(schedule.next_delay(), Duration::from_secs(60));
        assert_eq!(schedule.next_delay(), Duration::from_secs(120));
        assert_eq!(schedule.next_delay(), Duration::from_secs(240));
        assert_eq!(schedule.next_delay(), Duration::from_secs(300));
        assert_eq!(schedule.next_delay(), Duration::from_secs(300));
    }

    #[test]
    fn success_resets_the_schedule() {
        let mut schedule = BackoffSchedule::new(
            Duration::from_secs(60),
            2,
            Duration::from_secs(300),
            JitterMode::None,
        );
        schedule.next_delay();
        schedule.next_delay();

        schedule.reset();
        assert_eq!(schedule.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn full_jitter_stays_within_the_scheduled_delay() {
        let mut schedule = BackoffSchedule::new(
            Duration::from_secs(10),
            2,
            Duration::from_secs(10),
            JitterMode::Full,
        );

        for _ in 0..32 {
            let delay = schedule.next_delay();
            assert!(
                !delay.is_zero() && delay <= Duration::from_secs(10),
                "expected jittered delay within (0, 10s], got {delay:?}"
            );
        }
    }
}
