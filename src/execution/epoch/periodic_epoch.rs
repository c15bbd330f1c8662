use std::time::Instant;

use crate::inputs::EpochInterval;

use super::EpochBoundary;

/// Increment epochs at regular system time intervals.
///
/// This is the default with 10 second epoch intervals. A zero
/// interval closes an epoch after every item.
pub struct PeriodicEpoch {
    interval: EpochInterval,
    started: Instant,
}

impl PeriodicEpoch {
    pub fn new(interval: EpochInterval) -> Self {
        Self {
            interval,
            started: Instant::now(),
        }
    }
}

impl EpochBoundary for PeriodicEpoch {
    fn start(&mut self) {
        self.started = Instant::now();
    }

    fn should_close(&mut self, items_in_epoch: usize, _batch_ended: bool) -> bool {
        items_in_epoch > 0 && self.started.elapsed() >= self.interval.duration()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn zero_interval_closes_on_items() {
        let mut boundary = PeriodicEpoch::new(EpochInterval::new(Duration::ZERO));
        boundary.start();
        assert!(!boundary.should_close(0, false));
        assert!(boundary.should_close(1, false));
    }

    #[test]
    fn waits_for_interval() {
        let mut boundary = PeriodicEpoch::new(EpochInterval::new(Duration::from_secs(3600)));
        boundary.start();
        assert!(!boundary.should_close(100, true));
    }
}
