//! Definition of a worker and which recovery partitions it owns.
//!
//! Assignment is recomputed from scratch on every execution from only
//! the partition count and the worker count, so every worker in a
//! cluster arrives at the same answer without talking to the others.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::RecoveryResult;
use crate::errors::Reraise;
use crate::recovery::Epoch;
use crate::recovery::PartitionCount;
use crate::recovery::PartitionIndex;
use crate::recovery::RecoveryStore;

/// Index of a worker within the whole cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerIndex(pub usize);

/// Total number of workers in the cluster for this execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCount(pub usize);

impl WorkerCount {
    /// Return an iter of all worker indexes.
    pub fn iter(&self) -> impl Iterator<Item = WorkerIndex> {
        (0..self.0).map(WorkerIndex)
    }
}

/// Which worker is responsible for a partition.
pub fn owner_of(part: PartitionIndex, workers: WorkerCount) -> WorkerIndex {
    WorkerIndex(part.0 % workers.0)
}

/// All the partitions a worker is responsible for.
///
/// Across all workers this covers every partition exactly once and
/// each worker gets either `floor(N / W)` or `ceil(N / W)` of them.
pub fn assign_parts(
    count: PartitionCount,
    workers: WorkerCount,
    worker: WorkerIndex,
) -> BTreeSet<PartitionIndex> {
    count
        .iter()
        .filter(|part| owner_of(*part, workers) == worker)
        .collect()
}

/// One worker's slice of the recovery store.
#[derive(Debug, Clone)]
pub struct Worker {
    index: WorkerIndex,
    parts: BTreeSet<PartitionIndex>,
}

impl Worker {
    pub fn new(index: WorkerIndex, workers: WorkerCount, count: PartitionCount) -> Self {
        let parts = assign_parts(count, workers, index);
        if parts.is_empty() {
            tracing::warn!(
                "Worker {} of {} owns no recovery partitions; \
                 there are more workers than the {count:?} partitions",
                index.0,
                workers.0
            );
        } else {
            tracing::debug!("Worker {} owns {parts:?}", index.0);
        }
        Self { index, parts }
    }

    pub fn index(&self) -> WorkerIndex {
        self.index
    }

    pub fn parts(&self) -> &BTreeSet<PartitionIndex> {
        &self.parts
    }

    /// Commit this worker's partitions. The epoch only counts as
    /// committed for the worker once all of them succeed.
    pub fn commit(&self, store: &mut RecoveryStore, epoch: Epoch) -> RecoveryResult<()> {
        store
            .commit_parts(epoch, &self.parts)
            .reraise_with(|| format!("worker {} error committing epoch {epoch}", self.index.0))
    }
}

/// The workers that run in one process of a cluster.
///
/// Worker indexes are global: process `proc_id` runs workers
/// `proc_id * workers_per_proc` up to the next process's first
/// worker.
pub fn proc_workers(
    proc_id: usize,
    proc_count: usize,
    workers_per_proc: usize,
    count: PartitionCount,
) -> Vec<Worker> {
    let workers = WorkerCount(proc_count * workers_per_proc);
    let first = proc_id * workers_per_proc;
    (first..first + workers_per_proc)
        .map(|index| Worker::new(WorkerIndex(index), workers, count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_covers_all_parts_once() {
        for n in 1..12 {
            for w in 1..8 {
                let count = PartitionCount(n);
                let workers = WorkerCount(w);
                let mut seen = BTreeSet::new();
                for worker in workers.iter() {
                    let parts = assign_parts(count, workers, worker);
                    let len = parts.len();
                    assert!(len == n / w || len == (n + w - 1) / w);
                    for part in parts {
                        assert!(seen.insert(part), "{part:?} assigned twice");
                    }
                }
                assert_eq!(seen, count.iter().collect::<BTreeSet<_>>());
            }
        }
    }

    #[test]
    fn more_workers_than_parts() {
        let parts = assign_parts(PartitionCount(2), WorkerCount(5), WorkerIndex(4));
        assert!(parts.is_empty());
        let parts = assign_parts(PartitionCount(2), WorkerCount(5), WorkerIndex(1));
        assert_eq!(parts, BTreeSet::from([PartitionIndex(1)]));
    }

    #[test]
    fn proc_workers_are_global() {
        let workers = proc_workers(1, 2, 2, PartitionCount(5));
        let indexes: Vec<_> = workers.iter().map(Worker::index).collect();
        assert_eq!(indexes, vec![WorkerIndex(2), WorkerIndex(3)]);
        assert_eq!(
            workers[0].parts(),
            &BTreeSet::from([PartitionIndex(2)])
        );
        assert_eq!(
            workers[1].parts(),
            &BTreeSet::from([PartitionIndex(3)])
        );
    }
}
