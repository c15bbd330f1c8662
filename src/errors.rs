//! Error types for the recovery engine.
//!
//! Every condition here is fatal to the worker that raises it. There
//! is no retry inside the engine: the process stops with the error
//! and restarting against the same recovery directory resumes from
//! the last committed epoch.
//!
//! The startup conditions ([`RecoveryError::NoPartitions`],
//! [`RecoveryError::MissingPartitions`],
//! [`RecoveryError::InconsistentPartitions`]) are distinct variants
//! so operators can pick the right remediation: initialize, restore,
//! or investigate.

use std::collections::BTreeMap;
use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

use crate::recovery::Epoch;
use crate::recovery::PartitionCount;
use crate::recovery::PartitionIndex;
use crate::recovery::StateKey;
use crate::recovery::StepId;

/// Errors raised by user-supplied code (transforms, sources, sinks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The recovery directory has no initialized partitions.
    #[error("no recovery partitions found in {0:?}; run `init_db_dir` first")]
    NoPartitions(PathBuf),

    /// Some, but not all, of the expected partition files exist.
    #[error("recovery directory {dir:?} is missing partitions {missing:?} of {count:?}")]
    MissingPartitions {
        dir: PathBuf,
        count: PartitionCount,
        missing: Vec<PartitionIndex>,
    },

    /// Partitions loaded but disagree on their last committed epoch.
    #[error(
        "recovery partitions disagree on the last committed epoch {committed:?}; \
         was a partition restored independently of its peers?"
    )]
    InconsistentPartitions {
        committed: BTreeMap<PartitionIndex, Option<Epoch>>,
    },

    /// [`crate::recovery::init_db_dir`] was run against a directory
    /// that already holds a different number of partitions.
    ///
    /// Like [`RecoveryError::NoPartitions`] this is a problem with how
    /// the directory was initialized. See
    /// [`RecoveryError::is_init_error`].
    #[error("recovery directory {dir:?} already holds {found:?}; can't init with {requested:?}")]
    PartitionCountMismatch {
        dir: PathBuf,
        found: PartitionCount,
        requested: PartitionCount,
    },

    #[error("invalid recovery partition at {path:?}: {reason}")]
    InvalidPartition { path: PathBuf, reason: String },

    /// Writes and commits must land on the next epoch after the last
    /// committed one.
    #[error("{part:?} expected epoch {expected:?} but got {got:?}")]
    NonContiguousEpoch {
        part: PartitionIndex,
        expected: Epoch,
        got: Epoch,
    },

    #[error("state for {step_id} / {key:?} lives in {part:?}, which this process does not own")]
    PartitionNotLocal {
        step_id: StepId,
        key: StateKey,
        part: PartitionIndex,
    },

    #[error("error in step {step_id}: {source}")]
    Transform {
        step_id: StepId,
        #[source]
        source: BoxError,
    },

    #[error("error in input {step_id}: {source}")]
    Source {
        step_id: StepId,
        #[source]
        source: BoxError,
    },

    #[error("error in output {step_id}: {source}")]
    Sink {
        step_id: StepId,
        #[source]
        source: BoxError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The execution already crashed and can't be driven further.
    /// Restart the process to resume from the last committed epoch.
    #[error("execution crashed; restart it to resume from the last committed epoch")]
    Crashed,

    /// Some other error with added context. See [`Reraise::reraise`].
    #[error("{msg}\nCaused by => {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<RecoveryError>,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl RecoveryError {
    /// Strip any [`RecoveryError::Context`] layers to get at the
    /// underlying condition.
    pub fn root(&self) -> &RecoveryError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the recovery directory was never initialized or was
    /// initialized with a different partition count. Fixing either
    /// means running [`crate::recovery::init_db_dir`] correctly.
    pub fn is_init_error(&self) -> bool {
        matches!(
            self.root(),
            Self::NoPartitions(_) | Self::PartitionCountMismatch { .. }
        )
    }

    pub(crate) fn transform(step_id: &StepId, err: impl Into<BoxError>) -> Self {
        Self::Transform {
            step_id: step_id.clone(),
            source: err.into(),
        }
    }

    pub(crate) fn input(step_id: &StepId, err: impl Into<BoxError>) -> Self {
        Self::Source {
            step_id: step_id.clone(),
            source: err.into(),
        }
    }

    pub(crate) fn output(step_id: &StepId, err: impl Into<BoxError>) -> Self {
        Self::Sink {
            step_id: step_id.clone(),
            source: err.into(),
        }
    }
}

/// Add context to any error that can become a [`RecoveryError`].
pub trait Reraise<T> {
    /// Only this needs to be implemented.
    fn into_result(self) -> RecoveryResult<T>;

    /// Wrap the existing error with a message prefixed by the caller
    /// location.
    ///
    /// Example:
    ///     part.commit(epoch).reraise("error committing partition")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> RecoveryResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_result().map_err(|err| RecoveryError::Context {
            msg: prepend_caller(caller, msg),
            source: Box::new(err),
        })
    }

    /// Like [`Reraise::reraise`] but only builds the message on error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> RecoveryResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_result().map_err(|err| RecoveryError::Context {
            msg: prepend_caller(caller, &msg()),
            source: Box::new(err),
        })
    }
}

impl<T, E> Reraise<T> for Result<T, E>
where
    E: Into<RecoveryError>,
{
    fn into_result(self) -> RecoveryResult<T> {
        self.map_err(Into::into)
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}
