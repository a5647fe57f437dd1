//! Sources of the current time.
//!
//! Every time-dependent decision the queue makes (enqueue timestamps, worker silence) reads
//! through a [Clock], so that tests can drive time with a [FakeClock].

use std::{
    fmt,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use crate::{atomic::ORDERING, time::EpochMillis};

pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> EpochMillis;
}

pub type SharedClock = Arc<dyn Clock>;

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EpochMillis {
        EpochMillis::now()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, ORDERING);
    }

    pub fn set(&self, to: EpochMillis) {
        self.millis.store(to.as_millis(), ORDERING);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(EpochMillis::from_millis(1_000_000))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> EpochMillis {
        EpochMillis::from_millis(self.millis.load(ORDERING))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Clock, FakeClock};
    use crate::time::EpochMillis;

    #[test]
    fn fake_clock_only_moves_when_advanced() {
        let clock = FakeClock::new(EpochMillis::from_millis(10));
        assert_eq!(clock.now(), EpochMillis::from_millis(10));
        assert_eq!(clock.now(), EpochMillis::from_millis(10));

        clock.advance(Duration::from_millis(25));
        assert_eq!(clock.now(), EpochMillis::from_millis(35));

        clock.set(EpochMillis::from_millis(5));
        assert_eq!(clock.now(), EpochMillis::from_millis(5));
    }
}
