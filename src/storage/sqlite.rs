//! SQLite-backed [`Store`].
//!
//! All connections come from one r2d2 pool. Every statement set that must be
//! atomic runs in an `IMMEDIATE` transaction, so it takes SQLite's write lock
//! up front instead of upgrading half way through.
//!
//! SQLite has no row-level locks, so the skip-locked claim degenerates to
//! serialized claim transactions. Each claim still selects, locks and marks
//! its rows in one statement, which keeps the protocol identical to a store
//! with `FOR UPDATE SKIP LOCKED`; concurrent claimants simply queue on the
//! database lock for the duration of one short transaction.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;

use super::schema::{apply_pragmas, initialize_schema};
use super::{
    ClaimBatch, ClaimRequest, Completion, Fence, Mutation, Record, StatusCounts, Store,
    StoreError, WorkItem, WorkStatus, WriteOp,
};
use crate::id::Identifier;

/// Rows per multi-row `INSERT`, well under SQLite's bound-parameter limit.
const ROWS_PER_INSERT: usize = 500;

const RECORD_COLUMNS: &str = "id, version, payload, status, created_at, updated_at";

const WORK_ITEM_COLUMNS: &str = "id, queue, payload, status, claimed_by, claim_expires_at, \
                                 attempts, last_error, created_at, updated_at";

impl ToSql for WorkStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for WorkStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: StoreError| FromSqlError::Other(Box::new(e)))
    }
}

/// A [`Store`] over a WAL-mode SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    ///
    /// The schema is initialized on a dedicated connection before the pool
    /// is built, so pooled connections never race on the journal mode switch.
    pub fn open<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        {
            let conn = Connection::open(db_path)?;
            apply_pragmas(&conn)?;
            initialize_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(PragmaCustomizer))
            .build(manager)?;

        tracing::debug!(path = %db_path.display(), pool_size, "Opened SQLite store");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Current pool state for monitoring.
    pub fn pool_state(&self) -> r2d2::State {
        self.pool.state()
    }
}

/// Applies connection pragmas to every pooled connection.
#[derive(Debug)]
struct PragmaCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        apply_pragmas(conn)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: Identifier::from_i64(row.get(0)?),
        version: row.get::<_, i64>(1)? as u64,
        payload: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn work_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: Identifier::from_i64(row.get(0)?),
        queue: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        claimed_by: row.get(4)?,
        claim_expires_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Build `INSERT INTO table (columns) VALUES (?, ...), (?, ...)` for `rows` rows.
fn insert_sql(table: &str, columns: &str, width: usize, rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; width].join(", "));
    let values = vec![tuple.as_str(); rows].join(", ");
    format!("INSERT INTO {table} ({columns}) VALUES {values}")
}

fn push_values(op: &WriteOp, values: &mut Vec<Value>) {
    match op {
        WriteOp::InsertRecord(record) => values.extend([
            Value::Integer(record.id.as_i64()),
            Value::Integer(record.version as i64),
            Value::Blob(record.payload.clone()),
            Value::Text(record.status.clone()),
            Value::Integer(record.created_at),
            Value::Integer(record.updated_at),
        ]),
        WriteOp::Enqueue(item) => values.extend([
            Value::Integer(item.id.as_i64()),
            Value::Text(item.queue.clone()),
            Value::Blob(item.payload.clone()),
            Value::Text(item.status.as_str().to_string()),
            item.claimed_by.clone().map_or(Value::Null, Value::Text),
            item.claim_expires_at.map_or(Value::Null, Value::Integer),
            Value::Integer(i64::from(item.attempts)),
            item.last_error.clone().map_or(Value::Null, Value::Text),
            Value::Integer(item.created_at),
            Value::Integer(item.updated_at),
        ]),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

/// Find the identifier behind a primary key violation in `ops`.
fn find_duplicate(conn: &Connection, ops: &[WriteOp]) -> Result<Option<Identifier>, StoreError> {
    let mut seen = HashSet::with_capacity(ops.len());
    for op in ops {
        let id = op.id();
        if !seen.insert(id) {
            return Ok(Some(id));
        }
        let table = match op {
            WriteOp::InsertRecord(_) => "records",
            WriteOp::Enqueue(_) => "work_items",
        };
        let exists: bool = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
            [id.as_i64()],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

impl Store for SqliteStore {
    fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for group in ops.chunk_by(WriteOp::same_kind) {
            let (table, columns, width) = match group[0] {
                WriteOp::InsertRecord(_) => ("records", RECORD_COLUMNS, 6),
                WriteOp::Enqueue(_) => ("work_items", WORK_ITEM_COLUMNS, 10),
            };
            for chunk in group.chunks(ROWS_PER_INSERT) {
                let mut values = Vec::with_capacity(chunk.len() * width);
                for op in chunk {
                    push_values(op, &mut values);
                }
                let sql = insert_sql(table, columns, width, chunk.len());
                if let Err(err) = tx.execute(&sql, params_from_iter(values)) {
                    if is_constraint_violation(&err) {
                        if let Some(id) = find_duplicate(&tx, ops)? {
                            return Err(StoreError::Duplicate(id));
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_record(&self, id: Identifier) -> Result<Option<Record>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                [id.as_i64()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn update_versioned(
        &self,
        id: Identifier,
        expected_version: u64,
        mutation: &Mutation,
        now: i64,
    ) -> Result<Option<Record>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "UPDATE records
                     SET payload = COALESCE(?1, payload),
                         status = COALESCE(?2, status),
                         version = version + 1,
                         updated_at = ?3
                     WHERE id = ?4 AND version = ?5
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    mutation.payload,
                    mutation.status,
                    now,
                    id.as_i64(),
                    expected_version as i64
                ],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn claim(&self, request: &ClaimRequest) -> Result<ClaimBatch, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let dead_lettered = {
            let mut stmt = tx.prepare_cached(
                "UPDATE work_items
                 SET status = 'failed',
                     claim_expires_at = NULL,
                     updated_at = ?1,
                     last_error = COALESCE(last_error, 'lease expired after ' || attempts || ' attempts')
                 WHERE queue = ?2
                   AND status = 'claimed'
                   AND claim_expires_at <= ?1
                   AND attempts > ?3
                 RETURNING id",
            )?;
            let ids = stmt
                .query_map(
                    params![request.now, request.queue, request.max_attempts],
                    |row| row.get::<_, i64>(0).map(Identifier::from_i64),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut items = {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE work_items
                 SET status = 'claimed',
                     claimed_by = ?1,
                     claim_expires_at = ?2,
                     attempts = attempts + 1,
                     updated_at = ?3
                 WHERE id IN (
                     SELECT id FROM work_items
                     WHERE queue = ?4
                       AND (status = 'pending' OR (status = 'claimed' AND claim_expires_at <= ?3))
                     ORDER BY created_at, id
                     LIMIT ?5
                 )
                 RETURNING {WORK_ITEM_COLUMNS}"
            ))?;
            let items = stmt
                .query_map(
                    params![
                        request.worker_id,
                        request.expires_at(),
                        request.now,
                        request.queue,
                        request.limit as i64
                    ],
                    work_item_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            items
        };

        tx.commit()?;

        // RETURNING order is unspecified.
        items.sort_by_key(|item| (item.created_at, item.id));
        Ok(ClaimBatch {
            items,
            dead_lettered,
        })
    }

    fn complete(
        &self,
        fence: &Fence,
        completion: &Completion,
        now: i64,
    ) -> Result<bool, StoreError> {
        const FENCE: &str = "WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2 AND attempts = ?3";

        let conn = self.conn()?;
        let id = fence.id.as_i64();
        let worker = fence.worker_id.as_str();
        let changed = match completion {
            Completion::Ack => conn.execute(
                &format!(
                    "UPDATE work_items SET status = 'done', claim_expires_at = NULL, updated_at = ?4 {FENCE}"
                ),
                params![id, worker, fence.attempts, now],
            )?,
            Completion::Fail { reason } => conn.execute(
                &format!(
                    "UPDATE work_items SET status = 'failed', claim_expires_at = NULL, last_error = ?5, updated_at = ?4 {FENCE}"
                ),
                params![id, worker, fence.attempts, now, reason],
            )?,
            Completion::RecordFailure { reason } => conn.execute(
                &format!("UPDATE work_items SET last_error = ?5, updated_at = ?4 {FENCE}"),
                params![id, worker, fence.attempts, now, reason],
            )?,
            Completion::ExtendLease { expires_at } => conn.execute(
                &format!("UPDATE work_items SET claim_expires_at = ?5, updated_at = ?4 {FENCE}"),
                params![id, worker, fence.attempts, now, expires_at],
            )?,
        };
        Ok(changed == 1)
    }

    fn get_work_item(&self, id: Identifier) -> Result<Option<WorkItem>, StoreError> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
                [id.as_i64()],
                work_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    fn list_by_status(
        &self,
        queue: &str,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE queue = ?1 AND status = ?2
             ORDER BY created_at, id
             LIMIT ?3"
        ))?;
        let items = stmt
            .query_map(params![queue, status, limit as i64], work_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn status_counts(&self, queue: &str) -> Result<StatusCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM work_items WHERE queue = ?1 GROUP BY status",
        )?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([queue], |row| {
            Ok((row.get::<_, WorkStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_QUEUE;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(temp_dir.path().join("spillway.db"), 4).unwrap();
        (temp_dir, store)
    }

    fn item(n: u64, created_at: i64) -> WriteOp {
        WriteOp::Enqueue(WorkItem::pending(
            Identifier::from_raw(n),
            DEFAULT_QUEUE,
            format!("job-{n}").into_bytes(),
            created_at,
        ))
    }

    fn request(worker: &str, limit: usize, now: i64) -> ClaimRequest {
        ClaimRequest {
            queue: DEFAULT_QUEUE.into(),
            worker_id: worker.into(),
            limit,
            now,
            lease: Duration::from_millis(1_000),
            max_attempts: 2,
        }
    }

    #[test]
    fn test_pool_state_reports_idle_connections() {
        let (_dir, store) = open();
        let state = store.pool_state();
        assert!((1..=4).contains(&state.connections));
        assert_eq!(state.idle_connections, state.connections);

        let _held = store.conn().unwrap();
        assert_eq!(store.pool_state().idle_connections, state.connections - 1);
    }

    #[test]
    fn test_write_batch_mixed_ops() {
        let (_dir, store) = open();
        let record = Record::new(Identifier::from_raw(100), b"hello".to_vec(), 5);
        store
            .write_batch(&[
                WriteOp::InsertRecord(record.clone()),
                item(1, 1),
                item(2, 2),
            ])
            .unwrap();

        assert_eq!(store.get_record(record.id).unwrap(), Some(record));
        let stored = store.get_work_item(Identifier::from_raw(2)).unwrap().unwrap();
        assert_eq!(stored.payload, b"job-2");
        assert_eq!(stored.status, WorkStatus::Pending);
        assert_eq!(store.status_counts(DEFAULT_QUEUE).unwrap().pending, 2);
    }

    #[test]
    fn test_write_batch_is_atomic_on_duplicate() {
        let (_dir, store) = open();
        store.write_batch(&[item(1, 1)]).unwrap();

        let err = store.write_batch(&[item(2, 2), item(1, 3)]).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id.raw() == 1));
        assert!(store.get_work_item(Identifier::from_raw(2)).unwrap().is_none());
    }

    #[test]
    fn test_large_batch_spans_statements() {
        let (_dir, store) = open();
        let ops: Vec<WriteOp> = (1..=1_200).map(|n| item(n, n as i64)).collect();
        store.write_batch(&ops).unwrap();
        assert_eq!(store.status_counts(DEFAULT_QUEUE).unwrap().total(), 1_200);
    }

    #[test]
    fn test_update_versioned() {
        let (_dir, store) = open();
        let id = Identifier::from_raw(7);
        store
            .write_batch(&[WriteOp::InsertRecord(Record::new(id, b"a".to_vec(), 0))])
            .unwrap();

        let updated = store
            .update_versioned(id, 0, &Mutation::new().payload("b"), 10)
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.payload, b"b");
        assert_eq!(updated.status, "active");
        assert_eq!(updated.updated_at, 10);

        // Stale version affects nothing.
        assert!(store
            .update_versioned(id, 0, &Mutation::new().status("archived"), 11)
            .unwrap()
            .is_none());
        assert_eq!(store.get_record(id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_claim_and_dead_letter() {
        let (_dir, store) = open();
        store.write_batch(&[item(1, 1), item(2, 2), item(3, 3)]).unwrap();

        let batch = store.claim(&request("w1", 2, 0)).unwrap();
        let ids: Vec<u64> = batch.items.iter().map(|i| i.id.raw()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(batch.items[0].claim_expires_at, Some(1_000));

        // Expiry boundary: reclaimable exactly at claim_expires_at.
        let batch = store.claim(&request("w2", 10, 1_000)).unwrap();
        let ids: Vec<u64> = batch.items.iter().map(|i| i.id.raw()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(batch.items[0].attempts, 2);

        // Attempts are now 2, 2, 1; claiming again pushes them past the limit.
        let batch = store.claim(&request("w3", 10, 2_000)).unwrap();
        assert_eq!(batch.items.len(), 3);

        // Items 1 and 2 expire with attempts 3 > 2 and are dead-lettered.
        let batch = store.claim(&request("w4", 10, 3_000)).unwrap();
        let ids: Vec<u64> = batch.items.iter().map(|i| i.id.raw()).collect();
        assert_eq!(ids, vec![3]);
        let mut dead: Vec<u64> = batch.dead_lettered.iter().map(|id| id.raw()).collect();
        dead.sort_unstable();
        assert_eq!(dead, vec![1, 2]);

        let failed = store.list_by_status(DEFAULT_QUEUE, WorkStatus::Failed, 10).unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(
            failed[0].last_error.as_deref(),
            Some("lease expired after 3 attempts")
        );
        assert_eq!(failed[0].claim_expires_at, None);
    }

    #[test]
    fn test_complete_checks_fence() {
        let (_dir, store) = open();
        store.write_batch(&[item(1, 1)]).unwrap();
        let claimed = store.claim(&request("w1", 1, 0)).unwrap().items.remove(0);
        let fence = claimed.fence().unwrap();

        let wrong = Fence {
            worker_id: "w2".into(),
            ..fence.clone()
        };
        assert!(!store.complete(&wrong, &Completion::Ack, 5).unwrap());

        assert!(store
            .complete(&fence, &Completion::ExtendLease { expires_at: 9_000 }, 5)
            .unwrap());
        assert!(store
            .complete(&fence, &Completion::RecordFailure { reason: "boom".into() }, 6)
            .unwrap());
        assert!(store.complete(&fence, &Completion::Ack, 7).unwrap());
        // Already done.
        assert!(!store.complete(&fence, &Completion::Ack, 8).unwrap());

        let item = store.get_work_item(claimed.id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Done);
        assert_eq!(item.last_error.as_deref(), Some("boom"));
        assert_eq!(item.claim_expires_at, None);
    }
}
