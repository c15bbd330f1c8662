//! When to close an epoch.
//!
//! The execution loop asks its [`EpochBoundary`] after every input
//! event whether the current epoch is done. An epoch that has not
//! consumed any items is never closed, so idle time never advances
//! the commit marker.

use serde::Deserialize;
use serde::Serialize;

use crate::inputs::EpochInterval;

pub(crate) mod batch_epoch;
pub(crate) mod periodic_epoch;
pub(crate) mod testing_epoch;

pub use batch_epoch::SourceBatchEpoch;
pub use periodic_epoch::PeriodicEpoch;
pub use testing_epoch::TestingEpoch;

pub trait EpochBoundary {
    /// A new epoch has just started.
    fn start(&mut self);

    /// Whether the current epoch should be committed now.
    ///
    /// `batch_ended` is true when the source just signaled the end of
    /// a batch.
    fn should_close(&mut self, items_in_epoch: usize, batch_ended: bool) -> bool;
}

/// Which [`EpochBoundary`] an execution uses.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochBoundaryConfig {
    /// Close epochs every epoch interval of system time.
    #[default]
    Periodic,
    /// Close an epoch after every item.
    PerItem,
    /// Close an epoch whenever the source ends a batch.
    SourceBatch,
}

impl EpochBoundaryConfig {
    pub fn build(&self, epoch_interval: EpochInterval) -> Box<dyn EpochBoundary> {
        match self {
            Self::Periodic => Box::new(PeriodicEpoch::new(epoch_interval)),
            Self::PerItem => Box::new(TestingEpoch::new()),
            Self::SourceBatch => Box::new(SourceBatchEpoch::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_json() {
        let config: EpochBoundaryConfig = serde_json::from_str(r#""source_batch""#).unwrap();
        assert_eq!(config, EpochBoundaryConfig::SourceBatch);
        let config: EpochBoundaryConfig = serde_json::from_str(r#""per_item""#).unwrap();
        assert_eq!(config, EpochBoundaryConfig::PerItem);
    }
}
