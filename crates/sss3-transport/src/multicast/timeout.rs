//! Adaptive receive timeout for loss detection
//!
//! Every receive timeout halves the timeout, down to a floor, so a degraded
//! link is detected faster on subsequent iterations. A successfully decoded
//! frame restores the base value.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveTimeout {
    base: Duration,
    floor: Duration,
    current: Duration,
}

impl ReceiveTimeout {
    pub fn new(base: Duration, floor: Duration) -> Self {
        let floor = floor.min(base);
        Self {
            base,
            floor,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Record a timeout; returns the new value if it changed
    pub fn tighten(&mut self) -> Option<Duration> {
        let next = (self.current / 2).max(self.floor);
        self.update(next)
    }

    /// Record a successful receive; returns the new value if it changed
    pub fn reset(&mut self) -> Option<Duration> {
        self.update(self.base)
    }

    fn update(&mut self, next: Duration) -> Option<Duration> {
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    /// Successive values after each timeout until the floor is reached
    #[rstest]
    #[case(400, 40, &[200, 100, 50, 40])]
    #[case(40, 10, &[20, 10])]
    #[case(100, 30, &[50, 30])]
    #[case(10, 40, &[])]
    fn test_tighten_halves_down_to_floor(
        #[case] base: u64,
        #[case] floor: u64,
        #[case] steps: &[u64],
    ) {
        let mut timeout = ReceiveTimeout::new(Duration::from_millis(base), Duration::from_millis(floor));

        let observed: Vec<Duration> = std::iter::from_fn(|| timeout.tighten()).collect();
        assert_eq!(observed, ms(steps));
        assert_eq!(timeout.current(), Duration::from_millis(floor.min(base)));
    }

    #[test]
    fn test_reset_restores_base() {
        let mut timeout = ReceiveTimeout::new(Duration::from_millis(400), Duration::from_millis(40));
        assert_eq!(timeout.reset(), None);

        timeout.tighten();
        assert_eq!(timeout.reset(), Some(Duration::from_millis(400)));
        assert_eq!(timeout.base(), Duration::from_millis(400));
    }
}
