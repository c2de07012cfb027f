use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window cost accounting.
///
/// The window origin advances by whole multiples of the window length and
/// accumulated usage drops to zero at each boundary. This is deliberately the
/// fixed variant, not a sliding decay: a burst admitted late in one window can
/// be followed by another right after the boundary, and the tests pin that
/// behavior down.
pub(super) struct UsageWindow {
    origin: Instant,
    length: Duration,
    used: u64,
}

impl UsageWindow {
    pub(super) fn new(length: Duration, now: Instant) -> Self {
        Self {
            origin: now,
            length,
            used: 0,
        }
    }

    /// Advance the origin past `now`, zeroing usage once a boundary is
    /// crossed.
    pub(super) fn roll(&mut self, now: Instant) {
        if self.length.is_zero() {
            // Degenerate configuration: every access sees a fresh window.
            self.used = 0;
            return;
        }
        let elapsed = now.duration_since(self.origin);
        if elapsed < self.length {
            return;
        }
        let crossed = elapsed.as_nanos() / self.length.as_nanos();
        self.origin = u32::try_from(crossed)
            .ok()
            .and_then(|crossed| self.origin.checked_add(self.length.checked_mul(crossed)?))
            .unwrap_or(now);
        self.used = 0;
    }

    /// Whether `cost` fits the remaining budget.
    ///
    /// A fresh window admits any cost, so a request bigger than the whole
    /// budget still runs (alone) instead of stalling the queue forever.
    pub(super) fn admits(&self, cost: u64, budget: u64) -> bool {
        self.used == 0 || self.used.saturating_add(cost) <= budget
    }

    pub(super) fn charge(&mut self, cost: u64) {
        self.used = self.used.saturating_add(cost);
    }

    /// Undo a charge for work that never ran.
    pub(super) fn refund(&mut self, cost: u64) {
        self.used = self.used.saturating_sub(cost);
    }

    pub(super) fn next_reset(&self) -> Instant {
        self.origin + self.length
    }

    #[cfg(test)]
    pub(super) fn used(&self) -> u64 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn usage_accumulates_within_a_window() {
        let start = Instant::now();
        let mut window = UsageWindow::new(MINUTE, start);

        assert!(window.admits(40, 100));
        window.charge(40);
        assert!(window.admits(60, 100));
        assert!(!window.admits(61, 100));

        window.roll(start + Duration::from_secs(59));
        assert_eq!(window.used(), 40);
    }

    #[test]
    fn usage_resets_on_the_fixed_cadence() {
        let start = Instant::now();
        let mut window = UsageWindow::new(MINUTE, start);
        window.charge(100);

        window.roll(start + Duration::from_secs(61));
        assert_eq!(window.used(), 0);
        assert!(window.admits(100, 100));
    }

    #[test]
    fn origin_advances_by_whole_windows() {
        let start = Instant::now();
        let mut window = UsageWindow::new(MINUTE, start);

        // Two and a half windows later the next boundary is at the third.
        window.roll(start + Duration::from_secs(150));
        assert_eq!(window.next_reset(), start + Duration::from_secs(180));
    }

    #[test]
    fn fresh_window_admits_oversized_cost() {
        let start = Instant::now();
        let mut window = UsageWindow::new(MINUTE, start);

        assert!(window.admits(250, 100));
        window.charge(250);
        assert!(!window.admits(1, 100));

        window.roll(start + MINUTE);
        assert!(window.admits(1, 100));
    }

    #[test]
    fn refund_releases_budget() {
        let start = Instant::now();
        let mut window = UsageWindow::new(MINUTE, start);
        window.charge(80);
        window.refund(30);
        assert!(window.admits(50, 100));
    }
}
