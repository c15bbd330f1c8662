//! A single recovery partition backed by a SQLite DB.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::Epoch;
use super::PartitionCount;
use super::PartitionIndex;
use super::PartitionMeta;
use super::SerializedState;
use super::StateChange;
use super::StateKey;
use super::StepId;
use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;
use crate::errors::Reraise;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE parts ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             part_index INTEGER NOT NULL CHECK (part_index >= 0), \
             part_count INTEGER NOT NULL CHECK (part_count > 0), \
             PRIMARY KEY (part_index, part_count), \
             CHECK (part_index < part_count) \
             ) STRICT",
        ),
        // Commits affect the whole partition. The max is the last
        // committed epoch; older rows are kept only for inspection.
        M::up(
            "CREATE TABLE commits ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             commit_epoch INTEGER NOT NULL PRIMARY KEY CHECK (commit_epoch >= 0) \
             ) STRICT",
        ),
        // `ser_change` is NULL for a discard.
        M::up(
            "CREATE TABLE snaps ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             step_id TEXT NOT NULL, \
             state_key TEXT NOT NULL, \
             snap_epoch INTEGER NOT NULL CHECK (snap_epoch >= 0), \
             ser_change TEXT, \
             PRIMARY KEY (step_id, state_key, snap_epoch) \
             ) STRICT",
        ),
    ])
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> RecoveryResult<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

fn read_meta(conn: &Connection, file: &Path) -> RecoveryResult<PartitionMeta> {
    let mut stmt = conn.prepare("SELECT part_index, part_count FROM parts")?;
    let metas = stmt
        .query_map((), |row| {
            Ok(PartitionMeta(
                PartitionIndex(row.get(0)?),
                PartitionCount(row.get(1)?),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    match metas.as_slice() {
        [meta] => Ok(*meta),
        [] => Err(RecoveryError::InvalidPartition {
            path: file.to_owned(),
            reason: String::from("no partition metadata; was it created with `init_db_dir`?"),
        }),
        _ => Err(RecoveryError::InvalidPartition {
            path: file.to_owned(),
            reason: format!("multiple partition metadata rows {metas:?}"),
        }),
    }
}

fn read_last_committed(conn: &Connection) -> RecoveryResult<Option<Epoch>> {
    // `MAX` always returns a single row, NULL if there are no
    // commits yet.
    let epoch = conn.query_row("SELECT MAX(commit_epoch) FROM commits", (), |row| {
        row.get::<_, Option<u64>>(0)
    })?;
    Ok(epoch.map(Epoch))
}

/// One partition of the recovery store.
///
/// Writes are staged in memory and only land in the DB together with
/// the commit marker for their epoch.
pub struct RecoveryPart {
    meta: PartitionMeta,
    conn: Connection,
    last_committed: Option<Epoch>,
    staged: BTreeMap<(StepId, StateKey), StateChange>,
}

impl RecoveryPart {
    /// Create a new, empty partition file.
    pub fn init(file: &Path, index: PartitionIndex, count: PartitionCount) -> RecoveryResult<()> {
        tracing::info!("Init recovery partition {index:?} / {count:?} at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise_with(|| format!("can't create recovery DB at {file:?}"))?;
        setup_conn(&mut conn)?;

        conn.execute(
            "INSERT INTO parts (part_index, part_count) VALUES (?1, ?2)",
            (index.0, count.0),
        )
        .reraise("error writing partition metadata")?;

        Ok(())
    }

    /// Open an existing partition file. Never creates one.
    pub fn open(file: &Path) -> RecoveryResult<Self> {
        tracing::info!("Opening recovery partition at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise_with(|| format!("can't open recovery DB at {file:?}"))?;
        setup_conn(&mut conn).reraise_with(|| format!("error setting up recovery DB {file:?}"))?;

        let meta = read_meta(&conn, file)?;
        let last_committed = read_last_committed(&conn)?;
        tracing::debug!("{:?} last committed epoch {last_committed:?}", meta.0);

        Ok(Self {
            meta,
            conn,
            last_committed,
            staged: BTreeMap::new(),
        })
    }

    /// A single partition that lives only for the duration of the
    /// process. Used when recovery is disabled.
    pub fn init_open_mem() -> RecoveryResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;

        let meta = PartitionMeta(PartitionIndex(0), PartitionCount(1));
        conn.execute(
            "INSERT INTO parts (part_index, part_count) VALUES (?1, ?2)",
            (meta.0 .0, meta.1 .0),
        )?;

        Ok(Self {
            meta,
            conn,
            last_committed: None,
            staged: BTreeMap::new(),
        })
    }

    pub fn meta(&self) -> PartitionMeta {
        self.meta
    }

    pub fn index(&self) -> PartitionIndex {
        self.meta.0
    }

    pub fn last_committed_epoch(&self) -> Option<Epoch> {
        self.last_committed
    }

    /// The only epoch this partition will accept writes or a commit
    /// for.
    pub fn next_epoch(&self) -> Epoch {
        self.last_committed.map_or(Epoch(0), |epoch| epoch.next())
    }

    fn check_epoch(&self, got: Epoch) -> RecoveryResult<()> {
        let expected = self.next_epoch();
        if got == expected {
            Ok(())
        } else {
            Err(RecoveryError::NonContiguousEpoch {
                part: self.index(),
                expected,
                got,
            })
        }
    }

    /// Latest state for a key, including writes staged in the
    /// current epoch.
    ///
    /// Returns [`None`] if the key was never written or the latest
    /// write was a discard.
    pub fn get_latest(
        &self,
        step_id: &StepId,
        key: &StateKey,
    ) -> RecoveryResult<Option<SerializedState>> {
        if let Some(change) = self.staged.get(&(step_id.clone(), key.clone())) {
            return Ok(match change {
                StateChange::Upsert(state) => Some(state.clone()),
                StateChange::Discard => None,
            });
        }

        let Some(committed) = self.last_committed else {
            return Ok(None);
        };
        let ser_change = self
            .conn
            .query_row(
                "SELECT ser_change \
                 FROM snaps \
                 WHERE step_id = ?1 AND state_key = ?2 AND snap_epoch <= ?3 \
                 ORDER BY snap_epoch DESC \
                 LIMIT 1",
                (&step_id.0, &key.0, committed.0),
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;

        Ok(ser_change.flatten().map(SerializedState))
    }

    /// Stage a change to a key. Nothing is durable until
    /// [`RecoveryPart::commit`] for the same epoch.
    pub fn stage_write(
        &mut self,
        step_id: &StepId,
        key: &StateKey,
        epoch: Epoch,
        change: StateChange,
    ) -> RecoveryResult<()> {
        self.check_epoch(epoch)?;
        tracing::trace!("Staging {step_id} / {key:?} @ {epoch}: {change:?}");
        self.staged.insert((step_id.clone(), key.clone()), change);
        Ok(())
    }

    /// Durably write all staged changes and mark `epoch` as
    /// committed, all in one transaction.
    pub fn commit(&mut self, epoch: Epoch) -> RecoveryResult<()> {
        self.check_epoch(epoch)?;
        let staged = std::mem::take(&mut self.staged);
        tracing::debug!(
            "Committing {} changes to {:?} @ {epoch}",
            staged.len(),
            self.index()
        );

        let txn = self.conn.transaction()?;
        {
            let mut stmt = txn.prepare_cached(
                "INSERT INTO snaps (step_id, state_key, snap_epoch, ser_change) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (step_id, state_key, snap_epoch) DO UPDATE \
                 SET ser_change = EXCLUDED.ser_change",
            )?;
            for ((step_id, key), change) in staged {
                stmt.execute((step_id.0, key.0, epoch.0, change.into_ser()))?;
            }
        }
        txn.execute("INSERT INTO commits (commit_epoch) VALUES (?1)", (epoch.0,))?;
        txn.commit()?;

        self.last_committed = Some(epoch);
        Ok(())
    }

    /// Throw away superseded snapshots older than `before`.
    ///
    /// For each key the newest snapshot before `before` is kept, even
    /// if it is a discard, because that is still the state to resume
    /// from. Commit markers are trimmed the same way.
    ///
    /// Returns the number of snapshots deleted.
    pub fn gc(&mut self, before: Epoch) -> RecoveryResult<usize> {
        let txn = self.conn.transaction()?;
        let deleted = txn.execute(
            "DELETE FROM snaps \
             WHERE snap_epoch < ?1 \
             AND snap_epoch < ( \
             SELECT MAX(newer.snap_epoch) \
             FROM snaps AS newer \
             WHERE newer.step_id = snaps.step_id \
             AND newer.state_key = snaps.state_key \
             AND newer.snap_epoch < ?1 \
             )",
            (before.0,),
        )?;
        txn.execute(
            "DELETE FROM commits \
             WHERE commit_epoch < ?1 \
             AND commit_epoch < (SELECT MAX(commit_epoch) FROM commits)",
            (before.0,),
        )?;
        txn.commit()?;

        tracing::debug!("GCd {deleted} snapshots before {before} in {:?}", self.index());
        Ok(deleted)
    }

    /// Forget staged changes and delete any snapshot rows newer than
    /// the last committed epoch.
    pub fn discard_uncommitted(&mut self) -> RecoveryResult<usize> {
        self.staged.clear();
        let deleted = match self.last_committed {
            Some(committed) => self
                .conn
                .execute("DELETE FROM snaps WHERE snap_epoch > ?1", (committed.0,))?,
            None => self.conn.execute("DELETE FROM snaps", ())?,
        };
        if deleted > 0 {
            tracing::warn!(
                "Discarded {deleted} uncommitted snapshots in {:?}",
                self.index()
            );
        }
        Ok(deleted)
    }

    /// All retained committed changes to a key, oldest first.
    pub fn history(
        &self,
        step_id: &StepId,
        key: &StateKey,
    ) -> RecoveryResult<Vec<(Epoch, StateChange)>> {
        let Some(committed) = self.last_committed else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT snap_epoch, ser_change \
             FROM snaps \
             WHERE step_id = ?1 AND state_key = ?2 AND snap_epoch <= ?3 \
             ORDER BY snap_epoch",
        )?;
        let history = stmt
            .query_map((&step_id.0, &key.0, committed.0), |row| {
                Ok((
                    Epoch(row.get(0)?),
                    StateChange::from_ser(row.get::<_, Option<String>>(1)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }
}
