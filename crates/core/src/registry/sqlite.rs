//! SQLite-backed worker registry and ingest slot store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{IngestStore, StoreError, WorkerStore};
use super::types::{
    IngestServer, IngestSlot, SlotPreference, Worker, WorkerHeartbeat, WorkerRegistration,
};
use crate::rpc::HostStats;

const WORKER_COLUMNS: &str =
    "id, address, workload, last_seen, tenant, shared, version, jobs, stats";

const SLOT_SELECT: &str = r#"
    SELECT s.id, s.name, s.server_id, srv.url, s.transcoding, s.stream_id, s.freed_at
    FROM ingest_slots s
    JOIN ingest_servers srv ON srv.id = s.server_id
"#;

/// SQLite-backed registry for workers and ingest slots.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `path`.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory registry (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                workload INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL,
                tenant TEXT,
                shared INTEGER NOT NULL DEFAULT 0,
                version TEXT,
                jobs TEXT NOT NULL DEFAULT '[]',
                stats TEXT
            );

            CREATE TABLE IF NOT EXISTS ingest_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_slots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                server_id INTEGER NOT NULL REFERENCES ingest_servers(id),
                transcoding INTEGER NOT NULL DEFAULT 0,
                stream_id INTEGER,
                freed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ingest_slots_stream ON ingest_slots(stream_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
        let last_seen_str: String = row.get(3)?;
        let jobs_json: String = row.get(7)?;
        let stats_json: Option<String> = row.get(8)?;

        let last_seen = parse_timestamp(&last_seen_str).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let jobs: Vec<String> = serde_json::from_str(&jobs_json).unwrap_or_default();
        let stats: Option<HostStats> = stats_json.and_then(|json| serde_json::from_str(&json).ok());

        Ok(Worker {
            id: row.get(0)?,
            address: row.get(1)?,
            workload: row.get(2)?,
            last_seen,
            tenant: row.get(4)?,
            shared: row.get(5)?,
            version: row.get(6)?,
            jobs,
            stats,
        })
    }

    fn row_to_slot(row: &rusqlite::Row) -> rusqlite::Result<IngestSlot> {
        let freed_at: Option<String> = row.get(6)?;
        Ok(IngestSlot {
            id: row.get(0)?,
            name: row.get(1)?,
            server_id: row.get(2)?,
            server_url: row.get(3)?,
            transcoding: row.get(4)?,
            stream_id: row.get(5)?,
            freed_at: freed_at.as_deref().and_then(parse_timestamp),
        })
    }

    fn fetch_worker(conn: &Connection, id: &str) -> Result<Option<Worker>, StoreError> {
        let sql = format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_worker)
            .optional()?)
    }

    fn fetch_slot_by_id(conn: &Connection, id: i64) -> Result<IngestSlot, StoreError> {
        let sql = format!("{} WHERE s.id = ?1", SLOT_SELECT);
        conn.query_row(&sql, params![id], Self::row_to_slot)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("ingest slot {}", id)))
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn encode_stats(stats: &Option<HostStats>) -> Option<String> {
    stats.as_ref().and_then(|s| serde_json::to_string(s).ok())
}

impl WorkerStore for SqliteRegistry {
    fn register(
        &self,
        registration: &WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Result<Worker, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO workers (id, address, workload, last_seen, tenant, shared, version)
            VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                last_seen = excluded.last_seen,
                tenant = excluded.tenant,
                shared = excluded.shared,
                version = COALESCE(excluded.version, workers.version)
            "#,
            params![
                registration.id,
                registration.address,
                now.to_rfc3339(),
                registration.tenant,
                registration.shared,
                registration.version,
            ],
        )?;

        Self::fetch_worker(&conn, &registration.id)?
            .ok_or_else(|| StoreError::NotFound(format!("worker {}", registration.id)))
    }

    fn record_heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> Result<Worker, StoreError> {
        let jobs_json =
            serde_json::to_string(&heartbeat.jobs).map_err(|e| StoreError::Database(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO workers (id, address, workload, last_seen, version, jobs, stats, tenant, shared)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    CASE WHEN ?8 IS NULL THEN NULL ELSE ?9 END, COALESCE(?8, 0))
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                workload = excluded.workload,
                last_seen = excluded.last_seen,
                version = COALESCE(excluded.version, workers.version),
                jobs = excluded.jobs,
                stats = excluded.stats,
                tenant = CASE WHEN ?8 IS NULL THEN workers.tenant ELSE ?9 END,
                shared = COALESCE(?8, workers.shared)
            "#,
            params![
                heartbeat.id,
                heartbeat.address,
                heartbeat.workload,
                now.to_rfc3339(),
                heartbeat.version,
                jobs_json,
                encode_stats(&heartbeat.stats),
                heartbeat.shared,
                heartbeat.tenant,
            ],
        )?;

        Self::fetch_worker(&conn, &heartbeat.id)?
            .ok_or_else(|| StoreError::NotFound(format!("worker {}", heartbeat.id)))
    }

    fn get(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let conn = self.lock()?;
        Self::fetch_worker(&conn, id)
    }

    fn list(&self) -> Result<Vec<Worker>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM workers ORDER BY rowid", WORKER_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let workers = stmt
            .query_map([], Self::row_to_worker)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    fn adjust_workload(&self, id: &str, delta: i64) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "UPDATE workers SET workload = MAX(0, workload + ?2) WHERE id = ?1 RETURNING workload",
            params![id, delta],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("worker {}", id)))
    }
}

impl IngestStore for SqliteRegistry {
    fn add_server(&self, url: &str) -> Result<IngestServer, StoreError> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO ingest_servers (url) VALUES (?1)", params![url])?;
        Ok(IngestServer {
            id: conn.last_insert_rowid(),
            url: url.to_string(),
        })
    }

    fn add_slot(
        &self,
        server_id: i64,
        name: &str,
        transcoding: bool,
    ) -> Result<IngestSlot, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ingest_slots (name, server_id, transcoding) VALUES (?1, ?2, ?3)",
            params![name, server_id, transcoding],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!("ingest slot {} already exists", name))
            }
            other => StoreError::from(other),
        })?;
        let id = conn.last_insert_rowid();
        Self::fetch_slot_by_id(&conn, id)
    }

    fn claim_slot(
        &self,
        stream_id: i64,
        preference: SlotPreference,
    ) -> Result<Option<IngestSlot>, StoreError> {
        let kinds: &[bool] = match preference {
            SlotPreference::Plain => &[false],
            SlotPreference::PreferTranscoding => &[true, false],
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut claimed = None;
        for &transcoding in kinds {
            // Conditional update: only a row that is still free can be bound.
            let id: Option<i64> = tx
                .query_row(
                    r#"
                    UPDATE ingest_slots SET stream_id = ?1
                    WHERE id = (
                        SELECT id FROM ingest_slots
                        WHERE stream_id IS NULL AND transcoding = ?2
                        ORDER BY freed_at IS NOT NULL, freed_at, id
                        LIMIT 1
                    ) AND stream_id IS NULL
                    RETURNING id
                    "#,
                    params![stream_id, transcoding],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                claimed = Some(Self::fetch_slot_by_id(&tx, id)?);
                break;
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn release_slot(&self, name: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ingest_slots SET stream_id = NULL, freed_at = ?2 WHERE name = ?1 AND stream_id IS NOT NULL",
            params![name, now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn release_slot_of(
        &self,
        name: &str,
        stream_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ingest_slots SET stream_id = NULL, freed_at = ?3 WHERE name = ?1 AND stream_id = ?2",
            params![name, stream_id, now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn get_slot(&self, name: &str) -> Result<Option<IngestSlot>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE s.name = ?1", SLOT_SELECT);
        Ok(conn.query_row(&sql, params![name], Self::row_to_slot).optional()?)
    }

    fn list_slots(&self) -> Result<Vec<IngestSlot>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("{} ORDER BY s.id", SLOT_SELECT);
        let mut stmt = conn.prepare(&sql)?;
        let slots = stmt
            .query_map([], Self::row_to_slot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(slots)
    }
}
