//! Internal code for implementing recovery.
//!
//! Architecture
//! ------------
//!
//! Recovery is based around snapshotting the state of each key in
//! each stateful step at the end of every epoch and durably writing
//! those snapshots into a fixed set of **recovery partitions**. The
//! partition count is chosen once at [`init_db_dir`] time and is a
//! property of the recovery directory, not of any one execution's
//! worker count.
//!
//! Each partition is a SQLite DB ([`RecoveryPart`]) holding three
//! tables:
//!
//! - `parts`: which partition index of how many this file is.
//!
//! - `commits`: the history of epochs that have been durably
//!   committed. The max of this is the partition's last committed
//!   epoch.
//!
//! - `snaps`: a history of [`StateChange`]s per `(step_id,
//!   state_key)` tagged with the epoch they were written in. A `NULL`
//!   serialized change is a tombstone.
//!
//! State for a `(step_id, state_key)` always lives in the partition
//! picked by [`partition_of`]. That hash does not depend on the
//! number of workers, so rescaling never moves data between
//! partitions: workers just open whichever partitions
//! [`crate::worker::assign_parts`] hands them.
//!
//! Writes during an epoch are staged in memory per partition and
//! written together with the commit marker in a single transaction
//! ([`RecoveryPart::commit`]). Reads only ever see rows at or before
//! the last committed epoch, so writes from an epoch that was
//! interrupted are never visible.
//!
//! On resume, every partition must report the same last committed
//! epoch ([`RecoveryStore::resume_epoch`]). Execution resumes at the
//! epoch after it and the input is asked to skip everything it
//! emitted before that.
//!
//! GC
//! --
//!
//! Once an epoch commits, older snapshots that have been superseded
//! can be thrown away ([`RecoveryPart::gc`]). The latest snapshot for
//! a key is never GCd while no newer write exists, no matter how old
//! it is; otherwise a key that is quiet for a while would lose its
//! state. A [`BackupInterval`] delays GC so that a window of history
//! is kept around for backups taken off of the workers.

use std::fmt;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::time::Duration;

use seahash::SeaHasher;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;

pub(crate) mod part;
pub(crate) mod store;

pub use part::RecoveryPart;
pub use store::init_db_dir;
pub use store::RecoveryStore;

/// IDs a specific recovery partition.
///
/// The inner value will be up to [`PartitionCount`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub usize);

impl Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part-{}", self.0)
    }
}

/// Total number of recovery partitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCount(pub usize);

impl PartitionCount {
    pub fn new(count: usize) -> RecoveryResult<Self> {
        if count == 0 {
            Err(RecoveryError::Config(String::from(
                "partition count must be positive",
            )))
        } else {
            Ok(Self(count))
        }
    }

    /// Return an iter of all partitions.
    pub fn iter(&self) -> impl Iterator<Item = PartitionIndex> {
        (0..self.0).map(PartitionIndex)
    }
}

/// Metadata about a recovery partition.
///
/// This represents a row in the `parts` table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta(pub PartitionIndex, pub PartitionCount);

/// Logical timestamp of a batch of input.
///
/// All items ingested between two epoch boundaries belong to the same
/// epoch. The first epoch of a fresh execution is `0`.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Unique ID for a step in a dataflow.
///
/// Recovery data is keyed off of this to ensure state is not mixed
/// between operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Key to route state within a dataflow step.
///
/// This is the user-facing "state key" since users only work with
/// state within a step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey(pub String);

impl From<&str> for StateKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for StateKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A state snapshot as stored in a recovery partition.
///
/// The recovery system only deals in serialized state so each step
/// can store its own types without going through generic gymnastics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState(pub String);

impl SerializedState {
    /// Serialize a state object from an operator into something the
    /// recovery system can store.
    pub fn ser<T: Serialize>(obj: &T) -> RecoveryResult<Self> {
        Ok(Self(serde_json::to_string(obj)?))
    }

    /// Deserialize back into the state object an operator can use.
    pub fn de<T: DeserializeOwned>(&self) -> RecoveryResult<T> {
        Ok(serde_json::from_str(&self.0)?)
    }
}

/// Each step's state is modeled as a key-value store, with
/// [`StateKey`] being the key, and this enum representing changes to
/// the value.
///
/// A [`StateChange::Discard`] is a write just like an upsert: after
/// it the key reads as absent until written again. It is not the same
/// as never having been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    /// Value was updated.
    Upsert(SerializedState),
    /// Key was deleted.
    Discard,
}

impl StateChange {
    pub(crate) fn into_ser(self) -> Option<String> {
        match self {
            Self::Upsert(SerializedState(ser)) => Some(ser),
            Self::Discard => None,
        }
    }

    pub(crate) fn from_ser(ser: Option<String>) -> Self {
        match ser {
            Some(ser) => Self::Upsert(SerializedState(ser)),
            None => Self::Discard,
        }
    }
}

/// Find the partition that owns state for a key in a step.
///
/// Deterministic and independent of the number of workers.
pub fn partition_of(step_id: &StepId, key: &StateKey, count: PartitionCount) -> PartitionIndex {
    let mut hasher = SeaHasher::default();
    step_id.hash(&mut hasher);
    key.hash(&mut hasher);
    let index = hasher.finish() % (count.0 as u64);
    PartitionIndex(index as usize)
}

/// System time duration to keep around state snapshots, even after
/// they are no longer needed by the current execution.
///
/// This is used to delay GC of state data so that if durable backup
/// of recovery partitions are not instantaneous or synchronized,
/// there is still history to roll back to.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct BackupInterval(pub(crate) Duration);

impl BackupInterval {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl TryFrom<chrono::Duration> for BackupInterval {
    type Error = RecoveryError;

    fn try_from(dur: chrono::Duration) -> Result<Self, Self::Error> {
        dur.to_std().map(Self).map_err(|_err| {
            RecoveryError::Config(String::from("backup interval must be a positive duration"))
        })
    }
}

impl TryFrom<f64> for BackupInterval {
    type Error = RecoveryError;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Duration::try_from_secs_f64(secs).map(Self).map_err(|err| {
            RecoveryError::Config(format!("invalid backup interval {secs:?}: {err}"))
        })
    }
}

impl From<BackupInterval> for f64 {
    fn from(interval: BackupInterval) -> Self {
        interval.0.as_secs_f64()
    }
}

/// Configuration settings for recovery.
///
/// `db_dir` is the local filesystem directory to search for recovery
/// partitions. It must have been set up with [`init_db_dir`].
///
/// `backup_interval` is the amount of system time to wait to
/// permanently delete a state snapshot after it is no longer
/// needed. You should set this to the interval at which you are
/// backing up the recovery partitions off of the workers into
/// archival storage. Defaults to zero duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub db_dir: PathBuf,
    #[serde(default)]
    pub backup_interval: BackupInterval,
}

impl RecoveryConfig {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            backup_interval: BackupInterval::default(),
        }
    }

    pub fn with_backup_interval(mut self, backup_interval: BackupInterval) -> Self {
        self.backup_interval = backup_interval;
        self
    }

    /// Open all the recovery partitions in the configured directory.
    pub fn build(&self) -> RecoveryResult<RecoveryStore> {
        RecoveryStore::load(&self.db_dir)
    }
}
