use std::time::Duration;

/// Forever yields wait times that grow geometrically up to a ceiling.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    starting: Duration,
    current: Duration,
    multiplier: u32,
    max: Duration,
}

impl ExpDecay {
    pub const fn constant(duration: Duration) -> Self {
        Self {
            starting: duration,
            current: duration,
            multiplier: 1,
            max: duration,
        }
    }

    /// Doubles the wait every step.
    pub const fn quadratic(starting: Duration, max: Duration) -> Self {
        Self {
            starting,
            current: starting,
            multiplier: 2,
            max,
        }
    }

    pub fn next_duration(&mut self) -> Duration {
        let duration = self.current;
        self.current = std::cmp::min(self.max, self.current.saturating_mul(self.multiplier));
        duration
    }

    /// Restart from the starting wait, e.g. after the awaited thing made progress.
    pub fn reset(&mut self) {
        self.current = self.starting;
    }
}

impl Iterator for ExpDecay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_duration())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ExpDecay;

    #[test]
    fn constant_never_grows() {
        let waits: Vec<_> = ExpDecay::constant(Duration::from_secs(2)).take(50).collect();
        assert_eq!(waits.len(), 50);
        assert!(waits.iter().all(|w| *w == Duration::from_secs(2)));
    }

    #[test]
    fn quadratic_caps_at_max() {
        let waits: Vec<_> =
            ExpDecay::quadratic(Duration::from_millis(100), Duration::from_millis(1_000))
                .take(7)
                .map(|d| d.as_millis())
                .collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1_000, 1_000, 1_000]);
    }

    #[test]
    fn reset_starts_over() {
        let mut decay = ExpDecay::quadratic(Duration::from_secs(1), Duration::from_secs(60));
        decay.next_duration();
        decay.next_duration();
        assert_eq!(decay.next_duration(), Duration::from_secs(4));

        decay.reset();
        assert_eq!(decay.next_duration(), Duration::from_secs(1));
    }
}
