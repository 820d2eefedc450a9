//! SQLite implementation of the local store.

use crate::store::{Expected, LocalStore, RecordQuery, StoreTxn};
use crate::{StorageError, StorageResult};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tillsync_model::{AuditEntry, ConflictRecord, OperationStatus, StoredRecord, SyncOperation};
use tillsync_types::{Cursor, EntityId, OperationId, StoreId, Timestamp};
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        store_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        last_synced_version INTEGER NOT NULL,
        sync_status TEXT NOT NULL,
        is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
        tombstone_expires_at INTEGER,
        updated_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_records_store_status
        ON records (entity_type, store_id, is_deleted, sync_status);

    CREATE INDEX IF NOT EXISTS idx_records_tombstones
        ON records (is_deleted, tombstone_expires_at);

    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        action TEXT NOT NULL,
        priority INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        next_attempt_at INTEGER NOT NULL,
        last_error TEXT,
        payload TEXT NOT NULL,
        UNIQUE (entity_id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_status_priority
        ON outbox (status, priority, seq);

    CREATE INDEX IF NOT EXISTS idx_outbox_entity
        ON outbox (entity_id, seq);

    CREATE TABLE IF NOT EXISTS cursors (
        store_id TEXT PRIMARY KEY,
        cursor TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS conflicts (
        entity_id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        local TEXT NOT NULL,
        remote TEXT NOT NULL,
        detected_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action TEXT NOT NULL,
        detail TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
";

const OPERATION_COLUMNS: &str = "seq, id, entity_type, entity_id, version, action, priority, \
     attempts, max_attempts, status, created_at, next_attempt_at, last_error, payload";

/// Local store backed by a single SQLite connection.
///
/// Access is serialized through a mutex; every multi-write change goes
/// through an `IMMEDIATE` transaction so it commits or rolls back as a unit.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// File-backed stores run in WAL mode with `synchronous = FULL`, so a
    /// committed transaction survives a process crash.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        debug!("opened sqlite store at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, id: &EntityId) -> StorageResult<Option<StoredRecord>> {
        let conn = self.conn()?;
        get_record(&conn, id)
    }

    fn query(&self, query: &RecordQuery) -> StorageResult<Vec<StoredRecord>> {
        let mut sql = String::from("SELECT body FROM records WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(entity_type) = &query.entity_type {
            sql.push_str(" AND entity_type = ?");
            args.push(Box::new(entity_type.clone()));
        }
        if let Some(store_id) = &query.store_id {
            sql.push_str(" AND store_id = ?");
            args.push(Box::new(store_id.as_str().to_string()));
        }
        if !query.include_deleted {
            sql.push_str(" AND is_deleted = FALSE");
        }
        if let Some(status) = query.status {
            sql.push_str(" AND sync_status = ?");
            args.push(Box::new(status.as_str()));
        }
        sql.push_str(" ORDER BY updated_at DESC, id");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str::<StoredRecord>(body).map_err(StorageError::from))
            .collect()
    }

    fn expired_tombstones(&self, now: Timestamp) -> StorageResult<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM records
             WHERE is_deleted = TRUE AND tombstone_expires_at < ?1
             ORDER BY tombstone_expires_at",
        )?;
        let bodies = stmt
            .query_map(params![now.as_millis()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str::<StoredRecord>(body).map_err(StorageError::from))
            .collect()
    }

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut conn = self.conn().map_err(E::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(StorageError::from(e)))?;

        let mut txn = SqliteTxn { conn: &tx };
        let value = f(&mut txn)?;

        tx.commit().map_err(|e| E::from(StorageError::from(e)))?;
        Ok(value)
    }

    fn operation(&self, id: &OperationId) -> StorageResult<Option<SyncOperation>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM outbox WHERE id = ?1");
        conn.query_row(&sql, params![id.to_string()], read_operation_row)
            .optional()?
            .map(OperationRow::into_operation)
            .transpose()
    }

    fn operations(&self, statuses: &[OperationStatus]) -> StorageResult<Vec<SyncOperation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM outbox
             WHERE status IN ({placeholders})
             ORDER BY priority ASC, seq ASC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(statuses.iter().map(OperationStatus::as_str)),
                read_operation_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    fn operations_for_entity(&self, id: &EntityId) -> StorageResult<Vec<SyncOperation>> {
        let conn = self.conn()?;
        entity_operations(&conn, id)
    }

    fn purge_done_operations(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM outbox WHERE status = ?1",
            params![OperationStatus::Done.as_str()],
        )?;
        Ok(removed)
    }

    fn cursor(&self, store_id: &StoreId) -> StorageResult<Option<Cursor>> {
        let conn = self.conn()?;
        let cursor: Option<String> = conn
            .query_row(
                "SELECT cursor FROM cursors WHERE store_id = ?1",
                params![store_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.map(Cursor::from))
    }

    fn conflict(&self, id: &EntityId) -> StorageResult<Option<ConflictRecord>> {
        let conn = self.conn()?;
        get_conflict(&conn, id)
    }

    fn conflicts(&self) -> StorageResult<Vec<ConflictRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id, local, remote, detected_at
             FROM conflicts ORDER BY detected_at, entity_id",
        )?;
        let rows = stmt
            .query_map([], read_conflict_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    fn audit_log(&self, limit: usize, offset: usize) -> StorageResult<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id, action, detail, timestamp
             FROM audit_log ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(entity_type, entity_id, action, detail, ts)| {
                Ok(AuditEntry {
                    entity_type,
                    entity_id: parse_entity_id(&entity_id)?,
                    action: action.parse()?,
                    detail,
                    timestamp: Timestamp::from_millis(ts),
                })
            })
            .collect()
    }
}

/// A `StoreTxn` over an open SQLite transaction.
struct SqliteTxn<'a> {
    conn: &'a Connection,
}

impl StoreTxn for SqliteTxn<'_> {
    fn get(&self, id: &EntityId) -> StorageResult<Option<StoredRecord>> {
        get_record(self.conn, id)
    }

    fn put(&mut self, record: &StoredRecord, expected: Expected) -> StorageResult<()> {
        let id = record.meta.id;
        let found: Option<u64> = self
            .conn
            .query_row(
                "SELECT version FROM records WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64);

        let matches = match expected {
            Expected::Any => true,
            Expected::Absent => found.is_none(),
            Expected::Version(v) => found == Some(v),
        };
        if !matches {
            let expected = match expected {
                Expected::Version(v) => Some(v),
                _ => None,
            };
            return Err(StorageError::VersionMismatch {
                id,
                expected,
                found,
            });
        }

        let meta = &record.meta;
        self.conn.execute(
            "INSERT INTO records (id, entity_type, tenant_id, store_id, version,
                 last_synced_version, sync_status, is_deleted, tombstone_expires_at,
                 updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 entity_type = excluded.entity_type,
                 tenant_id = excluded.tenant_id,
                 store_id = excluded.store_id,
                 version = excluded.version,
                 last_synced_version = excluded.last_synced_version,
                 sync_status = excluded.sync_status,
                 is_deleted = excluded.is_deleted,
                 tombstone_expires_at = excluded.tombstone_expires_at,
                 updated_at = excluded.updated_at,
                 body = excluded.body",
            params![
                id.to_string(),
                record.entity_type,
                meta.tenant_id.as_str(),
                meta.store_id.as_str(),
                meta.version as i64,
                meta.last_synced_version as i64,
                meta.sync_status.as_str(),
                meta.is_deleted,
                meta.tombstone_expires_at.map(|t| t.as_millis()),
                meta.updated_at.as_millis(),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn remove(&mut self, id: &EntityId) -> StorageResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1", params![id.to_string()])?;
        self.conn.execute(
            "DELETE FROM conflicts WHERE entity_id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn enqueue(&mut self, op: &SyncOperation) -> StorageResult<Option<u64>> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO outbox (id, entity_type, entity_id, version, action,
                 priority, attempts, max_attempts, status, created_at, next_attempt_at,
                 last_error, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                op.id.to_string(),
                op.entity_type,
                op.entity_id.to_string(),
                op.version as i64,
                op.action.as_str(),
                i64::from(op.priority),
                i64::from(op.attempts),
                i64::from(op.max_attempts),
                op.status.as_str(),
                op.created_at.as_millis(),
                op.next_attempt_at.as_millis(),
                op.last_error,
                serde_json::to_string(&op.payload)?,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid() as u64))
    }

    fn update_operation(&mut self, op: &SyncOperation) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE outbox SET
                 action = ?2, version = ?3, priority = ?4, attempts = ?5,
                 max_attempts = ?6, status = ?7, next_attempt_at = ?8,
                 last_error = ?9, payload = ?10
             WHERE id = ?1",
            params![
                op.id.to_string(),
                op.action.as_str(),
                op.version as i64,
                i64::from(op.priority),
                i64::from(op.attempts),
                i64::from(op.max_attempts),
                op.status.as_str(),
                op.next_attempt_at.as_millis(),
                op.last_error,
                serde_json::to_string(&op.payload)?,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::InvalidData(format!(
                "operation {} is not in the outbox",
                op.id
            )));
        }
        Ok(())
    }

    fn remove_operation(&mut self, id: &OperationId) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn operations_for_entity(&self, id: &EntityId) -> StorageResult<Vec<SyncOperation>> {
        entity_operations(self.conn, id)
    }

    fn set_cursor(
        &mut self,
        store_id: &StoreId,
        cursor: &Cursor,
        now: Timestamp,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO cursors (store_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(store_id) DO UPDATE SET
                 cursor = excluded.cursor,
                 updated_at = excluded.updated_at",
            params![store_id.as_str(), cursor.as_str(), now.as_millis()],
        )?;
        Ok(())
    }

    fn conflict(&self, id: &EntityId) -> StorageResult<Option<ConflictRecord>> {
        get_conflict(self.conn, id)
    }

    fn save_conflict(&mut self, conflict: &ConflictRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO conflicts (entity_id, entity_type, local, remote, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conflict.entity_id.to_string(),
                conflict.entity_type,
                serde_json::to_string(&conflict.local)?,
                serde_json::to_string(&conflict.remote)?,
                conflict.detected_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn clear_conflict(&mut self, id: &EntityId) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM conflicts WHERE entity_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO audit_log (entity_type, entity_id, action, detail, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.entity_type,
                entry.entity_id.to_string(),
                entry.action.to_string(),
                entry.detail,
                entry.timestamp.as_millis(),
            ],
        )?;
        Ok(())
    }
}

// ── Row mapping ──────────────────────────────────────────────────

fn get_record(conn: &Connection, id: &EntityId) -> StorageResult<Option<StoredRecord>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM records WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str::<StoredRecord>(&b).map_err(StorageError::from))
        .transpose()
}

fn get_conflict(conn: &Connection, id: &EntityId) -> StorageResult<Option<ConflictRecord>> {
    conn.query_row(
        "SELECT entity_type, entity_id, local, remote, detected_at
         FROM conflicts WHERE entity_id = ?1",
        params![id.to_string()],
        read_conflict_row,
    )
    .optional()?
    .map(ConflictRow::into_conflict)
    .transpose()
}

fn entity_operations(conn: &Connection, id: &EntityId) -> StorageResult<Vec<SyncOperation>> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM outbox WHERE entity_id = ?1 ORDER BY seq");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![id.to_string()], read_operation_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(OperationRow::into_operation).collect()
}

fn parse_entity_id(s: &str) -> StorageResult<EntityId> {
    EntityId::parse(s).map_err(|e| StorageError::InvalidData(format!("invalid entity id {s}: {e}")))
}

/// Raw outbox columns, decoded outside the rusqlite row closure so model
/// parse errors keep their own type.
struct OperationRow {
    seq: i64,
    id: String,
    entity_type: String,
    entity_id: String,
    version: i64,
    action: String,
    priority: i64,
    attempts: i64,
    max_attempts: i64,
    status: String,
    created_at: i64,
    next_attempt_at: i64,
    last_error: Option<String>,
    payload: String,
}

fn read_operation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRow> {
    Ok(OperationRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        version: row.get(4)?,
        action: row.get(5)?,
        priority: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
        next_attempt_at: row.get(11)?,
        last_error: row.get(12)?,
        payload: row.get(13)?,
    })
}

impl OperationRow {
    fn into_operation(self) -> StorageResult<SyncOperation> {
        let id = OperationId::parse(&self.id)
            .map_err(|e| StorageError::InvalidData(format!("invalid operation id: {e}")))?;
        Ok(SyncOperation {
            id,
            seq: self.seq as u64,
            entity_type: self.entity_type,
            entity_id: parse_entity_id(&self.entity_id)?,
            version: self.version as u64,
            action: self.action.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            priority: u8::try_from(self.priority)
                .map_err(|_| StorageError::InvalidData(format!("priority {}", self.priority)))?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            status: self.status.parse()?,
            created_at: Timestamp::from_millis(self.created_at),
            next_attempt_at: Timestamp::from_millis(self.next_attempt_at),
            last_error: self.last_error,
        })
    }
}

struct ConflictRow {
    entity_type: String,
    entity_id: String,
    local: String,
    remote: String,
    detected_at: i64,
}

fn read_conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRow> {
    Ok(ConflictRow {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        local: row.get(2)?,
        remote: row.get(3)?,
        detected_at: row.get(4)?,
    })
}

impl ConflictRow {
    fn into_conflict(self) -> StorageResult<ConflictRecord> {
        Ok(ConflictRecord {
            entity_type: self.entity_type,
            entity_id: parse_entity_id(&self.entity_id)?,
            local: serde_json::from_str(&self.local)?,
            remote: serde_json::from_str(&self.remote)?,
            detected_at: Timestamp::from_millis(self.detected_at),
        })
    }
}
