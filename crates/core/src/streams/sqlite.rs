//! SQLite-backed stream store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::StreamStore;
use super::types::{
    DuePremiere, DueStream, NewStream, SourceState, SourceVariant, Stream, StreamSource,
};
use crate::registry::StoreError;
use crate::silence::Silence;

/// SQLite-backed stream store.
///
/// Stream start/end are stored as unix seconds so due-window queries can
/// compare them directly.
pub struct SqliteStreamStore {
    conn: Mutex<Connection>,
}

impl SqliteStreamStore {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
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
            CREATE TABLE IF NOT EXISTS streams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                course_slug TEXT NOT NULL,
                name TEXT NOT NULL,
                tenant TEXT,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                publish_live INTEGER NOT NULL DEFAULT 1,
                publish_vod INTEGER NOT NULL DEFAULT 1,
                premiere_file TEXT,
                premiere_worker TEXT,
                premiere_slot TEXT
            );

            CREATE TABLE IF NOT EXISTS stream_sources (
                stream_id INTEGER NOT NULL REFERENCES streams(id),
                variant TEXT NOT NULL,
                url TEXT NOT NULL,
                worker_id TEXT,
                slot_name TEXT,
                live_url TEXT,
                finished_at TEXT,
                recording_path TEXT,
                duration_secs REAL,
                vod_url TEXT,
                thumbnail_url TEXT,
                PRIMARY KEY (stream_id, variant)
            );

            CREATE TABLE IF NOT EXISTS silences (
                stream_id INTEGER NOT NULL REFERENCES streams(id),
                start_secs INTEGER NOT NULL,
                end_secs INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_streams_start ON streams(start_ts);
            CREATE INDEX IF NOT EXISTS idx_silences_stream ON silences(stream_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn row_to_source(row: &rusqlite::Row) -> rusqlite::Result<SourceState> {
        let variant: String = row.get(0)?;
        let finished_at: Option<String> = row.get(5)?;
        Ok(SourceState {
            variant: parse_variant(&variant)?,
            url: row.get(1)?,
            worker_id: row.get(2)?,
            slot_name: row.get(3)?,
            live_url: row.get(4)?,
            finished_at: finished_at.as_deref().and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
            recording_path: row.get(6)?,
            duration_secs: row.get(7)?,
            vod_url: row.get(8)?,
            thumbnail_url: row.get(9)?,
        })
    }

    fn update_source(
        &self,
        sql: &str,
        stream_id: i64,
        variant: SourceVariant,
        values: &[&dyn rusqlite::ToSql],
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let mut all: Vec<&dyn rusqlite::ToSql> = vec![&stream_id];
        let variant_str = variant.as_str();
        all.push(&variant_str);
        all.extend_from_slice(values);

        let changed = conn.execute(sql, all.as_slice())?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "source {} of stream {}",
                variant, stream_id
            )));
        }
        Ok(())
    }
}

fn parse_variant(s: &str) -> rusqlite::Result<SourceVariant> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl StreamStore for SqliteStreamStore {
    fn create_stream(&self, stream: &NewStream) -> Result<i64, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO streams (course_slug, name, tenant, start_ts, end_ts,
                                 publish_live, publish_vod, premiere_file)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                stream.course_slug,
                stream.name,
                stream.tenant,
                stream.start.timestamp(),
                stream.end.timestamp(),
                stream.publish_live,
                stream.publish_vod,
                stream.premiere_file,
            ],
        )?;
        let id = tx.last_insert_rowid();
        for source in &stream.sources {
            tx.execute(
                "INSERT INTO stream_sources (stream_id, variant, url) VALUES (?1, ?2, ?3)",
                params![id, source.variant.as_str(), source.url],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    fn get_stream(&self, id: i64) -> Result<Option<Stream>, StoreError> {
        let conn = self.lock()?;
        let stream = conn
            .query_row(
                r#"
                SELECT id, course_slug, name, tenant, start_ts, end_ts, publish_live,
                       publish_vod, premiere_file, premiere_worker, premiere_slot
                FROM streams WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok(Stream {
                        id: row.get(0)?,
                        course_slug: row.get(1)?,
                        name: row.get(2)?,
                        tenant: row.get(3)?,
                        start: from_ts(row.get(4)?),
                        end: from_ts(row.get(5)?),
                        publish_live: row.get(6)?,
                        publish_vod: row.get(7)?,
                        premiere_file: row.get(8)?,
                        premiere_worker: row.get(9)?,
                        premiere_slot: row.get(10)?,
                        sources: Vec::new(),
                        silences: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut stream) = stream else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT variant, url, worker_id, slot_name, live_url, finished_at,
                   recording_path, duration_secs, vod_url, thumbnail_url
            FROM stream_sources WHERE stream_id = ?1 ORDER BY rowid
            "#,
        )?;
        stream.sources = stmt
            .query_map(params![id], Self::row_to_source)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT start_secs, end_secs FROM silences WHERE stream_id = ?1 ORDER BY start_secs",
        )?;
        stream.silences = stmt
            .query_map(params![id], |row| {
                Ok(Silence {
                    start: row.get(0)?,
                    end: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(stream))
    }

    fn due_streams(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<DueStream>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.course_slug, s.name, s.tenant, s.start_ts, s.end_ts,
                   s.publish_live, s.publish_vod, src.variant, src.url
            FROM streams s
            JOIN stream_sources src ON src.stream_id = s.id
            WHERE s.start_ts <= ?1 AND s.end_ts > ?2 AND src.worker_id IS NULL
            ORDER BY s.start_ts, s.id, src.rowid
            "#,
        )?;

        let rows = stmt.query_map(
            params![(now + lookahead).timestamp(), now.timestamp()],
            |row| {
                let variant: String = row.get(8)?;
                Ok((
                    DueStream {
                        stream_id: row.get(0)?,
                        course_slug: row.get(1)?,
                        name: row.get(2)?,
                        tenant: row.get(3)?,
                        start: from_ts(row.get(4)?),
                        end: from_ts(row.get(5)?),
                        publish_live: row.get(6)?,
                        publish_vod: row.get(7)?,
                        sources: Vec::new(),
                    },
                    StreamSource {
                        variant: parse_variant(&variant)?,
                        url: row.get(9)?,
                    },
                ))
            },
        )?;

        // Group source rows by stream, keeping query order
        let mut order = Vec::new();
        let mut grouped: BTreeMap<i64, DueStream> = BTreeMap::new();
        for row in rows {
            let (stream, source) = row?;
            grouped
                .entry(stream.stream_id)
                .or_insert_with(|| {
                    order.push(stream.stream_id);
                    stream
                })
                .sources
                .push(source);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| grouped.remove(&id))
            .collect())
    }

    fn due_premieres(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<DuePremiere>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, course_slug, name, tenant, premiere_file, end_ts
            FROM streams
            WHERE premiere_file IS NOT NULL AND premiere_slot IS NULL
              AND start_ts <= ?1 AND end_ts > ?2
            ORDER BY start_ts, id
            "#,
        )?;
        let premieres = stmt
            .query_map(
                params![(now + lookahead).timestamp(), now.timestamp()],
                |row| {
                    Ok(DuePremiere {
                        stream_id: row.get(0)?,
                        course_slug: row.get(1)?,
                        name: row.get(2)?,
                        tenant: row.get(3)?,
                        file_path: row.get(4)?,
                        end: from_ts(row.get(5)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(premieres)
    }

    fn record_dispatch(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        worker_id: &str,
        slot_name: &str,
    ) -> Result<(), StoreError> {
        self.update_source(
            "UPDATE stream_sources SET worker_id = ?3, slot_name = ?4 WHERE stream_id = ?1 AND variant = ?2",
            stream_id,
            variant,
            &[&worker_id, &slot_name],
        )
    }

    fn record_premiere_dispatch(
        &self,
        stream_id: i64,
        worker_id: &str,
        slot_name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE streams SET premiere_worker = ?2, premiere_slot = ?3 WHERE id = ?1",
            params![stream_id, worker_id, slot_name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("stream {}", stream_id)));
        }
        Ok(())
    }

    fn set_live(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        live_url: &str,
    ) -> Result<(), StoreError> {
        self.update_source(
            "UPDATE stream_sources SET live_url = ?3 WHERE stream_id = ?1 AND variant = ?2",
            stream_id,
            variant,
            &[&live_url],
        )
    }

    fn set_finished(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let at = at.to_rfc3339();
        self.update_source(
            "UPDATE stream_sources SET finished_at = ?3 WHERE stream_id = ?1 AND variant = ?2",
            stream_id,
            variant,
            &[&at],
        )
    }

    fn set_recording(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        path: &str,
        duration_secs: f64,
    ) -> Result<(), StoreError> {
        self.update_source(
            "UPDATE stream_sources SET recording_path = ?3, duration_secs = ?4 WHERE stream_id = ?1 AND variant = ?2",
            stream_id,
            variant,
            &[&path, &duration_secs],
        )
    }

    fn set_published(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        vod_url: &str,
        thumbnail_url: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_source(
            "UPDATE stream_sources SET vod_url = ?3, thumbnail_url = ?4 WHERE stream_id = ?1 AND variant = ?2",
            stream_id,
            variant,
            &[&vod_url, &thumbnail_url],
        )
    }

    fn set_silences(&self, stream_id: i64, silences: &[Silence]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM silences WHERE stream_id = ?1", params![stream_id])?;
        for silence in silences {
            tx.execute(
                "INSERT INTO silences (stream_id, start_secs, end_secs) VALUES (?1, ?2, ?3)",
                params![stream_id, silence.start, silence.end],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
