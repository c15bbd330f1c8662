//! The ensemble of recovery partitions a process works against.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tracing::instrument;

use super::partition_of;
use super::Epoch;
use super::PartitionCount;
use super::PartitionIndex;
use super::RecoveryPart;
use super::SerializedState;
use super::StateChange;
use super::StateKey;
use super::StepId;
use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;
use crate::errors::Reraise;

const PART_EXT: &str = "sqlite3";

fn part_file(db_dir: &Path, index: PartitionIndex) -> PathBuf {
    db_dir.join(format!("part-{}.{PART_EXT}", index.0))
}

/// Open every partition file in a directory, whatever its metadata
/// says.
fn open_all(db_dir: &Path) -> RecoveryResult<Vec<RecoveryPart>> {
    if !db_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(db_dir).reraise_with(|| format!("error listing {db_dir:?}"))? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == PART_EXT) && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    files
        .iter()
        .map(|file| RecoveryPart::open(file))
        .collect()
}

/// Check that a set of opened partitions forms one complete store.
fn assemble(
    db_dir: &Path,
    opened: Vec<RecoveryPart>,
) -> RecoveryResult<(PartitionCount, BTreeMap<PartitionIndex, RecoveryPart>)> {
    let count = match opened.first() {
        Some(part) => part.meta().1,
        None => return Err(RecoveryError::NoPartitions(db_dir.to_owned())),
    };

    let mut parts = BTreeMap::new();
    for part in opened {
        let meta = part.meta();
        if meta.1 != count {
            return Err(RecoveryError::InvalidPartition {
                path: part_file(db_dir, meta.0),
                reason: format!(
                    "partition claims {:?} but its peers claim {count:?}; \
                     are multiple recovery directories mixed together?",
                    meta.1
                ),
            });
        }
        if parts.insert(meta.0, part).is_some() {
            return Err(RecoveryError::InvalidPartition {
                path: db_dir.to_owned(),
                reason: format!("duplicate files for {:?}", meta.0),
            });
        }
    }

    let missing: Vec<_> = count
        .iter()
        .filter(|index| !parts.contains_key(index))
        .collect();
    if !missing.is_empty() {
        return Err(RecoveryError::MissingPartitions {
            dir: db_dir.to_owned(),
            count,
            missing,
        });
    }

    Ok((count, parts))
}

/// Create a set of empty recovery partitions in a directory.
///
/// Running this against a directory that already holds the same
/// number of partitions does nothing. A different number is an error;
/// re-partitioning is not supported.
pub fn init_db_dir(db_dir: &Path, count: PartitionCount) -> RecoveryResult<()> {
    if count.0 == 0 {
        return Err(RecoveryError::Config(String::from(
            "partition count must be positive",
        )));
    }
    fs::create_dir_all(db_dir).reraise_with(|| format!("can't create {db_dir:?}"))?;

    let existing = open_all(db_dir)?;
    if let Some(found) = existing.first().map(|part| part.meta().1) {
        if found != count {
            return Err(RecoveryError::PartitionCountMismatch {
                dir: db_dir.to_owned(),
                found,
                requested: count,
            });
        }
        assemble(db_dir, existing)?;
        tracing::warn!("{db_dir:?} already holds {count:?} recovery partitions; not re-creating");
        return Ok(());
    }

    tracing::warn!("Creating {count:?} recovery partitions in {db_dir:?}");
    for index in count.iter() {
        RecoveryPart::init(&part_file(db_dir, index), index, count)
            .reraise("error init-ing recovery partition")?;
    }
    Ok(())
}

/// All the recovery partitions of one recovery directory.
///
/// After loading, a process keeps only the partitions its workers are
/// assigned ([`RecoveryStore::retain_local`]) and all reads and
/// writes route to them by [`partition_of`].
pub struct RecoveryStore {
    db_dir: Option<PathBuf>,
    count: PartitionCount,
    parts: BTreeMap<PartitionIndex, RecoveryPart>,
}

impl RecoveryStore {
    /// Load all the partitions in a directory. The directory must
    /// have been set up with [`init_db_dir`].
    #[instrument(name = "load_recovery_store", skip_all)]
    pub fn load(db_dir: &Path) -> RecoveryResult<Self> {
        let opened = open_all(db_dir)?;
        let (count, parts) = assemble(db_dir, opened)?;
        tracing::info!("Loaded {count:?} recovery partitions from {db_dir:?}");

        Ok(Self {
            db_dir: Some(db_dir.to_owned()),
            count,
            parts,
        })
    }

    /// A single in-memory partition. Nothing survives the process.
    pub fn ephemeral() -> RecoveryResult<Self> {
        let part = RecoveryPart::init_open_mem()?;
        let meta = part.meta();

        Ok(Self {
            db_dir: None,
            count: meta.1,
            parts: BTreeMap::from([(meta.0, part)]),
        })
    }

    pub fn db_dir(&self) -> Option<&Path> {
        self.db_dir.as_deref()
    }

    pub fn partition_count(&self) -> PartitionCount {
        self.count
    }

    pub fn local_parts(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        self.parts.keys().copied()
    }

    pub fn part(&self, index: PartitionIndex) -> Option<&RecoveryPart> {
        self.parts.get(&index)
    }

    /// The epoch execution should continue at.
    ///
    /// Every loaded partition must agree on its last committed epoch.
    /// If none has committed anything yet, this is epoch `0`.
    pub fn resume_epoch(&self) -> RecoveryResult<Epoch> {
        let committed: BTreeMap<_, _> = self
            .parts
            .iter()
            .map(|(index, part)| (*index, part.last_committed_epoch()))
            .collect();
        let mut distinct: BTreeSet<_> = committed.values().copied().collect();
        if distinct.len() > 1 {
            return Err(RecoveryError::InconsistentPartitions { committed });
        }

        let last = distinct.pop_first().flatten();
        let resume_epoch = last.map_or(Epoch(0), |epoch| epoch.next());
        tracing::info!("Resuming at epoch {resume_epoch}");
        Ok(resume_epoch)
    }

    /// Close every partition not in `keep` and throw away anything
    /// uncommitted in the rest.
    pub fn retain_local(&mut self, keep: &BTreeSet<PartitionIndex>) -> RecoveryResult<()> {
        self.parts.retain(|index, _part| keep.contains(index));
        for part in self.parts.values_mut() {
            part.discard_uncommitted()?;
        }
        tracing::debug!("Keeping recovery partitions {keep:?}");
        Ok(())
    }

    fn route(&self, step_id: &StepId, key: &StateKey) -> RecoveryResult<PartitionIndex> {
        let index = partition_of(step_id, key, self.count);
        if self.parts.contains_key(&index) {
            Ok(index)
        } else {
            Err(RecoveryError::PartitionNotLocal {
                step_id: step_id.clone(),
                key: key.clone(),
                part: index,
            })
        }
    }

    pub fn get_latest(
        &self,
        step_id: &StepId,
        key: &StateKey,
    ) -> RecoveryResult<Option<SerializedState>> {
        let index = self.route(step_id, key)?;
        match self.parts.get(&index) {
            Some(part) => part.get_latest(step_id, key),
            None => Ok(None),
        }
    }

    pub fn stage_write(
        &mut self,
        step_id: &StepId,
        key: &StateKey,
        epoch: Epoch,
        change: StateChange,
    ) -> RecoveryResult<()> {
        let index = self.route(step_id, key)?;
        match self.parts.get_mut(&index) {
            Some(part) => part.stage_write(step_id, key, epoch, change),
            None => Ok(()),
        }
    }

    /// Commit an epoch on some of the local partitions.
    pub fn commit_parts<'a>(
        &mut self,
        epoch: Epoch,
        indices: impl IntoIterator<Item = &'a PartitionIndex>,
    ) -> RecoveryResult<()> {
        for index in indices {
            if let Some(part) = self.parts.get_mut(index) {
                part.commit(epoch)
                    .reraise_with(|| format!("error committing {index:?} @ {epoch}"))?;
            }
        }
        Ok(())
    }

    /// Commit an epoch on every local partition.
    pub fn commit(&mut self, epoch: Epoch) -> RecoveryResult<()> {
        let indices: Vec<_> = self.parts.keys().copied().collect();
        self.commit_parts(epoch, &indices)
    }

    /// GC every local partition. Returns the total number of
    /// snapshots deleted.
    pub fn gc(&mut self, before: Epoch) -> RecoveryResult<usize> {
        let mut deleted = 0;
        for (index, part) in self.parts.iter_mut() {
            deleted += part
                .gc(before)
                .reraise_with(|| format!("error GCing {index:?}"))?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_all_parts() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(3)).unwrap();

        for i in 0..3 {
            assert!(dir.path().join(format!("part-{i}.sqlite3")).exists());
        }
        let store = RecoveryStore::load(dir.path()).unwrap();
        assert_eq!(store.partition_count(), PartitionCount(3));
        assert_eq!(store.resume_epoch().unwrap(), Epoch(0));
    }

    #[test]
    fn init_twice_same_count_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(2)).unwrap();
        {
            let mut store = RecoveryStore::load(dir.path()).unwrap();
            store.commit(Epoch(0)).unwrap();
        }
        init_db_dir(dir.path(), PartitionCount(2)).unwrap();

        let store = RecoveryStore::load(dir.path()).unwrap();
        assert_eq!(store.resume_epoch().unwrap(), Epoch(1));
    }

    #[test]
    fn init_twice_different_count_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(2)).unwrap();

        let err = init_db_dir(dir.path(), PartitionCount(3)).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::PartitionCountMismatch {
                found: PartitionCount(2),
                requested: PartitionCount(3),
                ..
            }
        ));
    }

    #[test]
    fn init_zero_count_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(init_db_dir(dir.path(), PartitionCount(0)).is_err());
    }

    #[test]
    fn load_empty_dir_is_no_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecoveryStore::load(dir.path()).err().unwrap();
        assert!(matches!(err, RecoveryError::NoPartitions(_)));

        let err = RecoveryStore::load(&dir.path().join("nope")).err().unwrap();
        assert!(matches!(err, RecoveryError::NoPartitions(_)));
    }

    #[test]
    fn load_missing_part() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(3)).unwrap();
        fs::remove_file(dir.path().join("part-1.sqlite3")).unwrap();

        let err = RecoveryStore::load(dir.path()).err().unwrap();
        match err {
            RecoveryError::MissingPartitions { count, missing, .. } => {
                assert_eq!(count, PartitionCount(3));
                assert_eq!(missing, vec![PartitionIndex(1)]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = init_db_dir(dir.path(), PartitionCount(3)).unwrap_err();
        assert!(matches!(err, RecoveryError::MissingPartitions { .. }));
    }

    #[test]
    fn load_mixed_counts_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(2)).unwrap();
        init_db_dir(other.path(), PartitionCount(3)).unwrap();
        fs::copy(
            other.path().join("part-2.sqlite3"),
            dir.path().join("part-2.sqlite3"),
        )
        .unwrap();

        let err = RecoveryStore::load(dir.path()).err().unwrap();
        assert!(matches!(err, RecoveryError::InvalidPartition { .. }));
    }

    #[test]
    fn resume_epoch_requires_agreement() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(2)).unwrap();
        {
            let mut store = RecoveryStore::load(dir.path()).unwrap();
            store.commit(Epoch(0)).unwrap();
            store.commit_parts(Epoch(1), &[PartitionIndex(0)]).unwrap();
        }

        let store = RecoveryStore::load(dir.path()).unwrap();
        match store.resume_epoch().unwrap_err() {
            RecoveryError::InconsistentPartitions { committed } => {
                assert_eq!(
                    committed,
                    BTreeMap::from([
                        (PartitionIndex(0), Some(Epoch(1))),
                        (PartitionIndex(1), Some(Epoch(0))),
                    ])
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn writes_route_to_owning_part() {
        let dir = tempfile::tempdir().unwrap();
        init_db_dir(dir.path(), PartitionCount(4)).unwrap();
        let step_id = StepId::new("s");
        let key = StateKey::from("k");
        let owner = partition_of(&step_id, &key, PartitionCount(4));
        {
            let mut store = RecoveryStore::load(dir.path()).unwrap();
            let change = StateChange::Upsert(SerializedState(String::from("1")));
            store
                .stage_write(&step_id, &key, Epoch(0), change)
                .unwrap();
            store.commit(Epoch(0)).unwrap();
        }

        let mut store = RecoveryStore::load(dir.path()).unwrap();
        for index in PartitionCount(4).iter() {
            let history = store.part(index).unwrap().history(&step_id, &key).unwrap();
            assert_eq!(history.is_empty(), index != owner);
        }

        store.retain_local(&BTreeSet::from([owner])).unwrap();
        assert_eq!(
            store.get_latest(&step_id, &key).unwrap(),
            Some(SerializedState(String::from("1")))
        );

        store.retain_local(&BTreeSet::new()).unwrap();
        let err = store.get_latest(&step_id, &key).unwrap_err();
        assert!(matches!(err, RecoveryError::PartitionNotLocal { .. }));
    }
}
