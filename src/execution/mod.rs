//! Internal code for dataflow execution.
//!
//! An [`Execution`] is a small state machine:
//!
//! ```text
//! Starting -> Running -> (Committing -> Running)* -> Draining -> Stopped
//! ```
//!
//! Any error moves it to [`ExecutionState::Crashed`] and is returned
//! to the caller. There is no retry in here: restarting the process
//! against the same recovery directory resumes from the last
//! committed epoch and replays the input from there.
//!
//! The input's cursor is snapshotted at the close of every epoch and
//! committed with the epoch's state under the input's step ID, so the
//! input resumes exactly after the last committed item.
//!
//! [`run_main`] and [`cluster_main`] are the entry points.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use crate::dataflow::Dataflow;
use crate::dataflow::EpochContext;
use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;
use crate::errors::Reraise;
use crate::inputs::EpochInterval;
use crate::inputs::SourceEvent;
use crate::metrics::ExecutionMetrics;
use crate::recovery::Epoch;
use crate::recovery::RecoveryConfig;
use crate::recovery::RecoveryStore;
use crate::recovery::StateChange;
use crate::recovery::StateKey;
use crate::with_timer;
use crate::worker::proc_workers;
use crate::worker::Worker;

pub(crate) mod epoch;

pub use epoch::EpochBoundary;
pub use epoch::EpochBoundaryConfig;

/// State key the input's cursor is stored under, within the input's
/// step ID.
const SOURCE_CURSOR_KEY: &str = "cursor";

/// Everything needed to run a dataflow, other than the dataflow.
///
/// `worker_count` is the number of workers in each process. A
/// cluster of `proc_count` processes has `proc_count * worker_count`
/// workers in total and that is what recovery partitions are
/// assigned over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub epoch_interval: EpochInterval,
    pub worker_count: usize,
    pub epoch_boundary: EpochBoundaryConfig,
    pub recovery: Option<RecoveryConfig>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            epoch_interval: EpochInterval::default(),
            worker_count: 1,
            epoch_boundary: EpochBoundaryConfig::default(),
            recovery: None,
        }
    }
}

impl ExecutionConfig {
    pub fn from_json(json: &str) -> RecoveryResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> RecoveryResult<Self> {
        let json =
            fs::read_to_string(path).reraise_with(|| format!("can't read config {path:?}"))?;
        Self::from_json(&json).reraise_with(|| format!("invalid config in {path:?}"))
    }

    pub fn validate(&self) -> RecoveryResult<()> {
        if self.worker_count == 0 {
            return Err(RecoveryError::Config(String::from(
                "worker count must be positive",
            )));
        }
        Ok(())
    }

    /// Number of committed epochs to keep history for before GC.
    fn gc_lag(&self) -> u64 {
        self.recovery.as_ref().map_or(0, |recovery| {
            self.epoch_interval.epochs_per(recovery.backup_interval)
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Running,
    Committing,
    Draining,
    Stopped,
    Crashed,
}

/// Highest epoch GC may clean up to after committing `epoch`.
fn gc_bound(epoch: Epoch, lag: u64) -> Option<Epoch> {
    (epoch.0 + 1)
        .checked_sub(lag)
        .filter(|before| *before > 0)
        .map(Epoch)
}

/// One process's run of a dataflow.
pub struct Execution<I, O> {
    flow: Dataflow<I, O>,
    config: ExecutionConfig,
    proc_id: usize,
    proc_count: usize,
    state: ExecutionState,
    store: Option<RecoveryStore>,
    workers: Vec<Worker>,
    epoch: Epoch,
    items_in_epoch: usize,
    boundary: Box<dyn EpochBoundary>,
    metrics: ExecutionMetrics,
}

impl<I: 'static, O: 'static> Execution<I, O> {
    pub fn new(
        flow: Dataflow<I, O>,
        proc_id: usize,
        proc_count: usize,
        config: ExecutionConfig,
    ) -> Self {
        let boundary = config.epoch_boundary.build(config.epoch_interval);
        Self {
            flow,
            config,
            proc_id,
            proc_count,
            state: ExecutionState::Starting,
            store: None,
            workers: Vec::new(),
            epoch: Epoch::default(),
            items_in_epoch: 0,
            boundary,
            metrics: ExecutionMetrics::new(proc_id),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// The epoch currently being processed.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Drive the state machine until the input is exhausted or
    /// something fails.
    #[instrument(name = "execution", skip_all, fields(proc_id = self.proc_id))]
    pub fn run(&mut self) -> RecoveryResult<()> {
        loop {
            let res = match self.state {
                ExecutionState::Starting => self.start(),
                ExecutionState::Running => self.pump(),
                ExecutionState::Committing => self.commit_epoch(),
                ExecutionState::Draining => self.drain(),
                ExecutionState::Stopped => return Ok(()),
                ExecutionState::Crashed => return Err(RecoveryError::Crashed),
            };
            if let Err(err) = res {
                tracing::error!("Execution crashed in epoch {}: {err}", self.epoch);
                self.state = ExecutionState::Crashed;
                return Err(err);
            }
        }
    }

    fn start(&mut self) -> RecoveryResult<()> {
        tracing::info!("Execution start");
        self.config.validate()?;
        self.flow.validate()?;
        if self.proc_id >= self.proc_count {
            return Err(RecoveryError::Config(format!(
                "process {} is not part of a cluster of {} processes",
                self.proc_id, self.proc_count
            )));
        }
        if self.proc_count != 1 {
            return Err(RecoveryError::Config(format!(
                "can't run a cluster of {} processes; every partition must \
                 commit every epoch, which needs agreement between processes \
                 that this execution does not provide",
                self.proc_count
            )));
        }

        let mut store = match &self.config.recovery {
            Some(recovery) => recovery
                .build()
                .reraise("error loading recovery store")?,
            None => {
                tracing::info!("No recovery configured; state will not be persisted");
                RecoveryStore::ephemeral()?
            }
        };
        let resume_epoch = store.resume_epoch()?;

        self.workers = proc_workers(
            self.proc_id,
            self.proc_count,
            self.config.worker_count,
            store.partition_count(),
        );
        let local: BTreeSet<_> = self
            .workers
            .iter()
            .flat_map(|worker| worker.parts().iter().copied())
            .collect();
        store.retain_local(&local)?;

        let input = &mut self.flow.input;
        let cursor_key = StateKey::from(SOURCE_CURSOR_KEY);
        let resume_state = store
            .get_latest(&input.step_id, &cursor_key)
            .reraise("error loading input cursor")?;
        tracing::info!("Resuming input {} at {resume_state:?}", input.step_id);
        input
            .source
            .resume(resume_state)
            .map_err(|err| RecoveryError::input(&input.step_id, err))?;
        let output = &mut self.flow.output;
        output
            .sink
            .resume(resume_epoch)
            .map_err(|err| RecoveryError::output(&output.step_id, err))?;

        self.store = Some(store);
        self.epoch = resume_epoch;
        self.items_in_epoch = 0;
        self.boundary.start();
        self.state = ExecutionState::Running;
        Ok(())
    }

    fn store_mut(store: &mut Option<RecoveryStore>) -> RecoveryResult<&mut RecoveryStore> {
        store
            .as_mut()
            .ok_or_else(|| RecoveryError::Config(String::from("execution has not started")))
    }

    fn pump(&mut self) -> RecoveryResult<()> {
        let input = &mut self.flow.input;
        let event = input
            .source
            .next()
            .map_err(|err| RecoveryError::input(&input.step_id, err))?;

        match event {
            SourceEvent::Item(item) => {
                self.items_in_epoch += 1;
                self.metrics
                    .item_inp_count
                    .add(1, &self.metrics.labels);

                let store = Self::store_mut(&mut self.store)?;
                let mut ctx = EpochContext::new(self.epoch, store);
                self.flow.process(&mut ctx, item)?;

                if self.boundary.should_close(self.items_in_epoch, false) {
                    self.state = ExecutionState::Committing;
                }
            }
            SourceEvent::BatchEnd => {
                if self.boundary.should_close(self.items_in_epoch, true) {
                    self.state = ExecutionState::Committing;
                }
            }
            SourceEvent::Pending => {
                if self.boundary.should_close(self.items_in_epoch, false) {
                    self.state = ExecutionState::Committing;
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            SourceEvent::Eof => {
                self.state = ExecutionState::Draining;
            }
        }
        Ok(())
    }

    /// Commit the current epoch, along with the input's cursor, on
    /// every local worker's partitions, then GC what is no longer
    /// needed.
    fn commit_current(&mut self) -> RecoveryResult<()> {
        let epoch = self.epoch;
        let store = Self::store_mut(&mut self.store)?;

        let input = &self.flow.input;
        let snapshot = input
            .source
            .snapshot()
            .map_err(|err| RecoveryError::input(&input.step_id, err))?;
        if let Some(snapshot) = snapshot {
            store.stage_write(
                &input.step_id,
                &StateKey::from(SOURCE_CURSOR_KEY),
                epoch,
                StateChange::Upsert(snapshot),
            )?;
        }

        with_timer!(self.metrics.commit_duration, self.metrics.labels, {
            self.workers
                .iter()
                .try_for_each(|worker| worker.commit(store, epoch))
        })?;
        self.metrics
            .epochs_committed
            .add(1, &self.metrics.labels);

        let output = &mut self.flow.output;
        output
            .sink
            .epoch_committed(epoch)
            .map_err(|err| RecoveryError::output(&output.step_id, err))?;

        if let Some(before) = gc_bound(epoch, self.config.gc_lag()) {
            let deleted = with_timer!(
                self.metrics.gc_duration,
                self.metrics.labels,
                store.gc(before)
            )?;
            tracing::trace!("GCd {deleted} snapshots before epoch {before}");
        }

        tracing::debug!("Committed epoch {epoch}");
        Ok(())
    }

    fn commit_epoch(&mut self) -> RecoveryResult<()> {
        self.commit_current()?;
        self.epoch = self.epoch.next();
        self.items_in_epoch = 0;
        self.boundary.start();
        self.state = ExecutionState::Running;
        Ok(())
    }

    fn drain(&mut self) -> RecoveryResult<()> {
        if self.items_in_epoch > 0 {
            self.commit_current()?;
        }

        let input = &mut self.flow.input;
        input
            .source
            .close()
            .map_err(|err| RecoveryError::input(&input.step_id, err))?;
        let output = &mut self.flow.output;
        output
            .sink
            .close()
            .map_err(|err| RecoveryError::output(&output.step_id, err))?;

        tracing::info!("Execution stop at epoch {}", self.epoch);
        self.state = ExecutionState::Stopped;
        Ok(())
    }
}

/// Execute a dataflow in the current process as one process of a
/// cluster.
///
/// All of this process's `worker_count` workers are driven in
/// lockstep on the current thread, so they share epochs and together
/// own every partition.
///
/// Only single process clusters are supported: `proc_count` must be
/// `1`, anything else is a [`RecoveryError::Config`] error before the
/// recovery directory is touched. Running several processes against
/// one recovery directory needs something outside of this crate to
/// route keys between them and to make every process commit the same
/// epochs.
pub fn cluster_main<I: 'static, O: 'static>(
    flow: Dataflow<I, O>,
    proc_id: usize,
    proc_count: usize,
    config: ExecutionConfig,
) -> RecoveryResult<()> {
    Execution::new(flow, proc_id, proc_count, config).run()
}

/// Execute a dataflow in the current process.
pub fn run_main<I: 'static, O: 'static>(
    flow: Dataflow<I, O>,
    config: ExecutionConfig,
) -> RecoveryResult<()> {
    cluster_main(flow, 0, 1, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::inputs::TestingSource;
    use crate::outputs::TestingSink;
    use crate::recovery::SerializedState;
    use crate::recovery::StepId;

    #[test]
    fn config_defaults() {
        let config = ExecutionConfig::from_json("{}").unwrap();
        assert_eq!(config, ExecutionConfig::default());
        assert_eq!(config.epoch_interval.duration(), Duration::from_secs(10));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.epoch_boundary, EpochBoundaryConfig::Periodic);
        assert_eq!(config.recovery, None);
    }

    #[test]
    fn config_from_json() {
        let config = ExecutionConfig::from_json(
            r#"{
                "epoch_interval": 0.0,
                "worker_count": 3,
                "epoch_boundary": "per_item",
                "recovery": {"db_dir": "/tmp/db", "backup_interval": 2.5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.epoch_interval.duration(), Duration::ZERO);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.epoch_boundary, EpochBoundaryConfig::PerItem);
        assert_eq!(
            config.recovery.unwrap().backup_interval.duration(),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(ExecutionConfig::from_json(r#"{"worker_count": 0}"#).is_err());
        assert!(ExecutionConfig::from_json(r#"{"epoch_interval": -1.0}"#).is_err());
    }

    #[test]
    fn config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"worker_count": 2}"#).unwrap();
        assert_eq!(ExecutionConfig::from_json_file(&path).unwrap().worker_count, 2);
        assert!(ExecutionConfig::from_json_file(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn gc_bound_respects_lag() {
        assert_eq!(gc_bound(Epoch(0), 0), Some(Epoch(1)));
        assert_eq!(gc_bound(Epoch(5), 2), Some(Epoch(4)));
        assert_eq!(gc_bound(Epoch(1), 2), None);
        assert_eq!(gc_bound(Epoch(5), u64::MAX), None);
    }

    #[test]
    fn ephemeral_run_stops() {
        let out = TestingSink::new();
        let flow = Dataflow::input("inp", TestingSource::new(vec![1, 2, 3]))
            .map("add_one", |x: i32| Ok::<_, BoxError>(x + 1))
            .output("out", out.clone());
        let mut execution = Execution::new(flow, 0, 1, ExecutionConfig::default());

        execution.run().unwrap();
        assert_eq!(execution.state(), ExecutionState::Stopped);
        assert_eq!(out.items(), vec![2, 3, 4]);
    }

    #[test]
    fn transform_error_crashes() {
        let flow = Dataflow::input("inp", TestingSource::new(vec![1, 2, 3]))
            .map("boom", |x: i32| {
                if x == 2 {
                    Err("BOOM")
                } else {
                    Ok(x)
                }
            })
            .output("out", TestingSink::new());
        let mut execution = Execution::new(flow, 0, 1, ExecutionConfig::default());

        let err = execution.run().unwrap_err();
        assert!(matches!(err, RecoveryError::Transform { .. }));
        assert_eq!(execution.state(), ExecutionState::Crashed);
        assert!(matches!(execution.run(), Err(RecoveryError::Crashed)));
    }

    #[test]
    fn multi_proc_cluster_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        crate::recovery::init_db_dir(dir.path(), crate::recovery::PartitionCount(2)).unwrap();
        let config = ExecutionConfig {
            recovery: Some(RecoveryConfig::new(dir.path())),
            ..ExecutionConfig::default()
        };

        for proc_id in 0..2 {
            let flow = Dataflow::input("inp", TestingSource::new(vec![1]))
                .output("out", TestingSink::new());
            let err = cluster_main(flow, proc_id, 2, config.clone()).unwrap_err();
            assert!(matches!(err, RecoveryError::Config(_)));
        }

        // Nothing was committed by either process.
        let store = RecoveryStore::load(dir.path()).unwrap();
        assert_eq!(store.resume_epoch().unwrap(), Epoch(0));
    }

    #[test]
    fn input_cursor_commits_with_epoch() {
        let dir = tempfile::tempdir().unwrap();
        crate::recovery::init_db_dir(dir.path(), crate::recovery::PartitionCount(3)).unwrap();
        let config = ExecutionConfig {
            epoch_boundary: EpochBoundaryConfig::PerItem,
            recovery: Some(RecoveryConfig::new(dir.path())),
            ..ExecutionConfig::default()
        };
        let flow = Dataflow::input("inp", TestingSource::new(vec![1, 2, 3]))
            .output("out", TestingSink::new());
        run_main(flow, config).unwrap();

        let store = RecoveryStore::load(dir.path()).unwrap();
        assert_eq!(store.resume_epoch().unwrap(), Epoch(3));
        let cursor = store
            .get_latest(&StepId::new("inp"), &StateKey::from(SOURCE_CURSOR_KEY))
            .unwrap();
        assert_eq!(cursor, Some(SerializedState(String::from("3"))));
    }

    #[test]
    fn proc_outside_cluster_is_config_error() {
        let flow = Dataflow::input("inp", TestingSource::new(vec![1]))
            .output("out", TestingSink::new());
        let err = cluster_main(flow, 2, 2, ExecutionConfig::default()).unwrap_err();
        assert!(matches!(err, RecoveryError::Config(_)));
    }
}
