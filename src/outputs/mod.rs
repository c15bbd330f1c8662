//! Internal code for output.
//!
//! Items reach a [`Sink`] as soon as they are produced, before their
//! epoch commits. A sink that needs exactly-once output can hold
//! items until [`Sink::epoch_committed`] and use [`Sink::resume`] to
//! drop anything from epochs at or after the resume epoch.

use crate::errors::BoxError;
use crate::recovery::Epoch;

pub(crate) mod std_output;
pub(crate) mod testing_output;

pub use std_output::StdOutSink;
pub use testing_output::TestingSink;

pub trait Sink<T> {
    fn resume(&mut self, _resume_epoch: Epoch) -> Result<(), BoxError> {
        Ok(())
    }

    fn write(&mut self, epoch: Epoch, item: T) -> Result<(), BoxError>;

    /// Called once all local recovery partitions committed `epoch`.
    fn epoch_committed(&mut self, _epoch: Epoch) -> Result<(), BoxError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
