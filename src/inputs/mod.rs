//! Internal code for input.
//!
//! A [`Source`] is pulled one event at a time by the execution loop.
//! At the close of every epoch the execution asks it for a
//! [`Source::snapshot`] of its cursor and commits that together with
//! the epoch's state. On resume the last committed snapshot is handed
//! back to [`Source::resume`] so committed input is never replayed.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::BoxError;
use crate::errors::RecoveryError;
use crate::recovery::BackupInterval;
use crate::recovery::SerializedState;

pub(crate) mod testing_input;

pub use testing_input::TestingSource;

/// Length of epochs in system time.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct EpochInterval(Duration);

impl EpochInterval {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Number of whole epochs needed to cover a backup interval.
    ///
    /// With a zero-length epoch any positive backup interval would
    /// need unbounded history, so this saturates.
    pub fn epochs_per(&self, backup_interval: BackupInterval) -> u64 {
        let backup = backup_interval.duration();
        if backup.is_zero() {
            0
        } else if self.0.is_zero() {
            u64::MAX
        } else {
            let epochs = backup.as_secs_f64() / self.0.as_secs_f64();
            epochs.ceil() as u64
        }
    }
}

impl Default for EpochInterval {
    fn default() -> Self {
        Self(Duration::from_secs(10))
    }
}

impl TryFrom<chrono::Duration> for EpochInterval {
    type Error = RecoveryError;

    fn try_from(dur: chrono::Duration) -> Result<Self, Self::Error> {
        dur.to_std()
            .map(Self)
            .map_err(|err| RecoveryError::Config(format!("invalid epoch interval: {err}")))
    }
}

impl TryFrom<f64> for EpochInterval {
    type Error = RecoveryError;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Duration::try_from_secs_f64(secs)
            .map(Self)
            .map_err(|err| RecoveryError::Config(format!("invalid epoch interval {secs:?}: {err}")))
    }
}

impl From<EpochInterval> for f64 {
    fn from(interval: EpochInterval) -> Self {
        interval.0.as_secs_f64()
    }
}

/// What a [`Source`] produced on a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent<T> {
    Item(T),
    /// The source finished a natural batch of input.
    BatchEnd,
    /// Nothing is ready right now; poll again later.
    Pending,
    /// The source is exhausted.
    Eof,
}

/// An input that can be resumed from a committed cursor.
pub trait Source<T> {
    /// Position the source right after the last item of the last
    /// committed epoch.
    ///
    /// `resume_state` is the last committed [`Source::snapshot`], or
    /// [`None`] if nothing has been committed yet.
    fn resume(&mut self, resume_state: Option<SerializedState>) -> Result<(), BoxError>;

    fn next(&mut self) -> Result<SourceEvent<T>, BoxError>;

    /// Cursor to resume from if the current epoch commits.
    ///
    /// Called after the last item of an epoch. Sources that can't
    /// resume return [`None`] and start over on every execution.
    fn snapshot(&self) -> Result<Option<SerializedState>, BoxError>;

    fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_per_rounds_up() {
        let interval = EpochInterval::new(Duration::from_secs(10));
        assert_eq!(interval.epochs_per(BackupInterval::default()), 0);
        assert_eq!(
            interval.epochs_per(BackupInterval::new(Duration::from_secs(10))),
            1
        );
        assert_eq!(
            interval.epochs_per(BackupInterval::new(Duration::from_secs(25))),
            3
        );
    }

    #[test]
    fn epochs_per_zero_interval() {
        let interval = EpochInterval::new(Duration::ZERO);
        assert_eq!(interval.epochs_per(BackupInterval::default()), 0);
        assert_eq!(
            interval.epochs_per(BackupInterval::new(Duration::from_secs(1))),
            u64::MAX
        );
    }

    #[test]
    fn negative_interval_rejected() {
        assert!(EpochInterval::try_from(chrono::Duration::seconds(-3)).is_err());
        assert!(EpochInterval::try_from(-0.5).is_err());
        assert_eq!(
            EpochInterval::try_from(0.5).unwrap().duration(),
            Duration::from_millis(500)
        );
    }
}
