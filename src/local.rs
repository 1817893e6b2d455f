use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::{Entity, Record, RecordId, TransactionFields};

/// Newest schema this build understands. Stores written by a newer build are
/// rejected rather than migrated downward.
const SCHEMA_VERSION: i64 = 3;

// v1: records table, keyed (collection, group_id, id, id_kind): partitions
//     never share rows even when ids collide, and a legacy integer row and a
//     canonical string row with equal string forms can coexist until the
//     reconciler unifies them. last_modified/deleted are nullable because
//     rows written before the sync schema existed carry neither.
// v2: partition index for group-scoped scans.
// v3: prefs table (last active partition).
// Every statement is IF NOT EXISTS, so re-running the whole chain on each
// open is idempotent and upgrades in place without touching existing rows.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        id_kind INTEGER NOT NULL,
        group_id TEXT NOT NULL,
        last_modified TEXT,
        deleted INTEGER,
        fields TEXT NOT NULL,
        PRIMARY KEY (collection, group_id, id, id_kind)
    ) WITHOUT ROWID;
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_group ON records(collection, group_id);",
    r#"
    CREATE TABLE IF NOT EXISTS prefs (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
    "#,
];

const LAST_ACTIVE_PARTITION_KEY: &str = "last_active_partition";

const ID_KIND_LEGACY: i64 = 0;
const ID_KIND_CANONICAL: i64 = 1;

/// A record as loaded for the push phase. `backfilled` marks rows whose
/// `last_modified`/`deleted` columns were NULL and got in-memory defaults;
/// the orchestrator persists those after the remote write succeeds.
#[derive(Debug, Clone)]
pub struct LocalEntry<E> {
    pub record: Record<E>,
    pub backfilled: bool,
}

/// Durable, partition-indexed storage of records on the device. Available
/// without network access. The connection is mutex-guarded so a store shared
/// between callers serializes its operations instead of racing.
#[derive(Debug)]
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Partition-scoped point read. A record stored under another partition
    /// is invisible here even when the id matches.
    pub fn get<E: Entity>(&self, partition: &str, id: &RecordId) -> Result<Option<Record<E>>> {
        Ok(self.get_entry::<E>(partition, id)?.map(|entry| entry.record))
    }

    /// Full partition snapshot, tombstones included. Callers filter.
    pub fn list_by_partition<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>> {
        Ok(self
            .list_entries::<E>(partition)?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }

    /// User-facing listing: tombstoned records are excluded.
    pub fn list_active<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>> {
        Ok(self
            .list_by_partition::<E>(partition)?
            .into_iter()
            .filter(|record| !record.deleted)
            .collect())
    }

    /// Active transactions whose `date` falls inside `[start, end]`.
    pub fn transactions_in_range(
        &self,
        partition: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record<TransactionFields>>> {
        Ok(self
            .list_active::<TransactionFields>(partition)?
            .into_iter()
            .filter(|record| record.fields.date >= start && record.fields.date <= end)
            .collect())
    }

    /// Upsert keyed by `(group_id, id)`. A record replaces only the copy in
    /// its own partition; a same-id row in another partition is untouched.
    pub fn put<E: Entity>(&self, record: &Record<E>) -> Result<()> {
        let (id_text, id_kind) = id_columns(&record.id);
        let fields = serde_json::to_string(&record.fields)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO records \
             (collection, id, id_kind, group_id, last_modified, deleted, fields) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                E::COLLECTION,
                id_text,
                id_kind,
                record.group_id,
                record.last_modified.to_rfc3339(),
                record.deleted as i64,
                fields,
            ],
        )?;
        Ok(())
    }

    /// Marks the record deleted and refreshes `last_modified` so the
    /// tombstone wins future timestamp comparisons. Missing records are an
    /// error, never a silent no-op.
    pub fn soft_delete<E: Entity>(&self, partition: &str, id: &RecordId) -> Result<()> {
        let mut entry = self
            .get_entry::<E>(partition, id)?
            .ok_or_else(|| Error::not_found(E::COLLECTION, id.canonical()))?;
        entry.record.deleted = true;
        entry.record.touch();
        self.put(&entry.record)
    }

    /// Physical removal. Only the ID reconciler uses this, to drop the
    /// legacy-keyed row once the canonical copy is in place.
    pub(crate) fn remove<E: Entity>(&self, partition: &str, id: &RecordId) -> Result<()> {
        let (id_text, id_kind) = id_columns(id);
        self.conn().execute(
            "DELETE FROM records \
             WHERE collection = ?1 AND group_id = ?2 AND id = ?3 AND id_kind = ?4",
            params![E::COLLECTION, partition, id_text, id_kind],
        )?;
        Ok(())
    }

    /// Persisted "which partition was I looking at" preference. Explicit
    /// state passed into operations, not ambient module state.
    pub fn last_active_partition(&self) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM prefs WHERE key = ?1",
                params![LAST_ACTIVE_PARTITION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_last_active_partition(&self, partition: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO prefs (key, value) VALUES (?1, ?2)",
            params![LAST_ACTIVE_PARTITION_KEY, partition],
        )?;
        Ok(())
    }

    pub(crate) fn get_entry<E: Entity>(
        &self,
        partition: &str,
        id: &RecordId,
    ) -> Result<Option<LocalEntry<E>>> {
        let (id_text, id_kind) = id_columns(id);
        let raw = self
            .conn()
            .query_row(
                "SELECT id, id_kind, group_id, last_modified, deleted, fields \
                 FROM records \
                 WHERE collection = ?1 AND group_id = ?2 AND id = ?3 AND id_kind = ?4",
                params![E::COLLECTION, partition, id_text, id_kind],
                RawRow::from_sql,
            )
            .optional()?;
        raw.map(|row| row.decode::<E>()).transpose()
    }

    pub(crate) fn list_entries<E: Entity>(&self, partition: &str) -> Result<Vec<LocalEntry<E>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, id_kind, group_id, last_modified, deleted, fields \
             FROM records WHERE collection = ?1 AND group_id = ?2 ORDER BY id",
        )?;
        let raws = stmt
            .query_map(params![E::COLLECTION, partition], RawRow::from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(|row| row.decode::<E>()).collect()
    }

    #[cfg(test)]
    pub(crate) fn insert_unversioned_row(
        &self,
        collection: &str,
        id: &RecordId,
        partition: &str,
        fields_json: &str,
    ) -> Result<()> {
        let (id_text, id_kind) = id_columns(id);
        self.conn().execute(
            "INSERT OR REPLACE INTO records \
             (collection, id, id_kind, group_id, last_modified, deleted, fields) \
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
            params![collection, id_text, id_kind, partition, fields_json],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn schema_version(&self) -> Result<i64> {
        Ok(self.conn().query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(Error::SchemaVersion { found, supported: SCHEMA_VERSION });
    }

    for statement in MIGRATIONS {
        conn.execute_batch(statement)?;
    }
    conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;

    if found < SCHEMA_VERSION {
        debug!(from = found, to = SCHEMA_VERSION, "upgraded local store schema");
    }
    Ok(())
}

fn id_columns(id: &RecordId) -> (String, i64) {
    let kind = if id.is_legacy() { ID_KIND_LEGACY } else { ID_KIND_CANONICAL };
    (id.canonical(), kind)
}

struct RawRow {
    id: String,
    id_kind: i64,
    group_id: String,
    last_modified: Option<String>,
    deleted: Option<i64>,
    fields: String,
}

impl RawRow {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            id_kind: row.get(1)?,
            group_id: row.get(2)?,
            last_modified: row.get(3)?,
            deleted: row.get(4)?,
            fields: row.get(5)?,
        })
    }

    fn decode<E: Entity>(self) -> Result<LocalEntry<E>> {
        let id = match self.id_kind {
            ID_KIND_LEGACY => RecordId::Legacy(self.id.parse().map_err(|_| {
                Error::InvalidRecord(format!("legacy id is not an integer: {}", self.id))
            })?),
            _ => RecordId::Canonical(self.id),
        };

        // Pre-sync rows carry neither column; default them the way the first
        // push would and let the orchestrator persist the repair.
        let mut backfilled = false;
        let last_modified = match &self.last_modified {
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map_err(|e| Error::InvalidRecord(format!("bad timestamp {:?}: {}", text, e)))?
                .with_timezone(&Utc),
            None => {
                backfilled = true;
                Utc::now()
            }
        };
        let deleted = match self.deleted {
            Some(flag) => flag != 0,
            None => {
                backfilled = true;
                false
            }
        };

        let fields: E = serde_json::from_str(&self.fields)?;
        Ok(LocalEntry {
            record: Record { id, group_id: self.group_id, last_modified, deleted, fields },
            backfilled,
        })
    }
}
