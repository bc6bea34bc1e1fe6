use std::time::Duration;

/// Exponential restart delay: starts at `initial`, doubles up to `max`.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self { Self { initial, max, current: initial } }

    /// Delay to apply now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) { self.current = self.initial; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap_and_resets() {
        let mut b = RestartBackoff::new(Duration::from_millis(200), Duration::from_secs(1));
        let seq: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(seq, vec![200, 400, 800, 1000, 1000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(200));
    }
}
