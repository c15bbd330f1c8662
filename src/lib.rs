//! Epoch-based recovery for stateful dataflows.
//!
//! State for each key of each stateful step is snapshotted at the end
//! of every epoch into a fixed set of recovery partitions on disk.
//! Restarting against the same recovery directory, with any number of
//! workers, resumes at the epoch after the last one committed.
//!
//! See [`recovery`] for how the store is laid out and
//! [`execution`] for the epoch state machine.

pub mod dataflow;
pub mod errors;
pub mod execution;
pub mod inputs;
pub mod metrics;
pub(crate) mod operators;
pub mod outputs;
pub mod recovery;
pub mod tracing;
pub mod worker;

pub use dataflow::Dataflow;
pub use dataflow::Stream;
pub use errors::RecoveryError;
pub use errors::RecoveryResult;
pub use execution::cluster_main;
pub use execution::run_main;
pub use execution::ExecutionConfig;
