use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use tracing::debug;

use crate::error::{OmError, Result};
use crate::om::{OmMessage, OmOriginType, OmRecord, OmScope};

use super::OmStore;

const SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS om_records (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL CHECK(scope IN ('thread', 'resource')),
        scope_key TEXT NOT NULL UNIQUE,
        thread_id TEXT,
        resource_id TEXT,
        generation_count INTEGER NOT NULL DEFAULT 0,
        origin_type TEXT NOT NULL CHECK(origin_type IN ('initial', 'reflection')),
        active_observations TEXT NOT NULL DEFAULT '',
        observation_token_count INTEGER NOT NULL DEFAULT 0,
        pending_message_tokens INTEGER NOT NULL DEFAULT 0,
        last_observed_at TEXT,
        current_task TEXT,
        suggested_response TEXT,
        last_observed_message_ids_json TEXT NOT NULL DEFAULT '[]',
        observer_trigger_count_total INTEGER NOT NULL DEFAULT 0,
        reflector_trigger_count_total INTEGER NOT NULL DEFAULT 0,
        is_observing INTEGER NOT NULL DEFAULT 0,
        is_reflecting INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        carried_messages_json TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS om_messages (
        scope_key TEXT NOT NULL,
        id TEXT NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        source_thread_id TEXT,
        created_at TEXT NOT NULL,
        created_at_ns INTEGER NOT NULL,
        PRIMARY KEY(scope_key, id)
    );

    CREATE INDEX IF NOT EXISTS idx_om_messages_scope_created
    ON om_messages(scope_key, created_at_ns, id);
";

const RECORD_COLUMNS: &str = r"
    id, scope, scope_key, thread_id, resource_id,
    generation_count, origin_type, active_observations,
    observation_token_count, pending_message_tokens, last_observed_at,
    current_task, suggested_response, last_observed_message_ids_json,
    observer_trigger_count_total, reflector_trigger_count_total,
    is_observing, is_reflecting, created_at, updated_at,
    carried_messages_json
";

/// SQLite adapter. All statements run on the blocking pool.
#[derive(Clone)]
pub struct SqliteOmStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteOmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteOmStore").finish_non_exhaustive()
    }
}

impl SqliteOmStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        ensure_required_column(&conn, "om_records", "last_observed_message_ids_json")?;
        ensure_required_column(&conn, "om_messages", "created_at_ns")?;
        if !has_column(&conn, "om_records", "carried_messages_json")? {
            conn.execute_batch(
                "ALTER TABLE om_records ADD COLUMN carried_messages_json TEXT NOT NULL DEFAULT '[]'",
            )?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| OmError::mutex_poisoned("sqlite"))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| OmError::storage(format!("sqlite task failed: {err}")))?
    }
}

#[async_trait]
impl OmStore for SqliteOmStore {
    async fn get_record(&self, scope_key: &str) -> Result<Option<OmRecord>> {
        let scope_key = scope_key.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM om_records WHERE scope_key = ?1"),
                    params![scope_key],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn save_record(&self, record: &OmRecord) -> Result<()> {
        let record = record.clone();
        let message_ids_json = serde_json::to_string(&record.last_observed_message_ids)?;
        let carried_json = serde_json::to_string(&record.carried_messages)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    r"
                    INSERT INTO om_records({RECORD_COLUMNS})
                    VALUES (
                        ?1, ?2, ?3, ?4, ?5,
                        ?6, ?7, ?8,
                        ?9, ?10, ?11,
                        ?12, ?13, ?14,
                        ?15, ?16,
                        ?17, ?18, ?19, ?20,
                        ?21
                    )
                    ON CONFLICT(scope_key) DO UPDATE SET
                        scope=excluded.scope,
                        thread_id=excluded.thread_id,
                        resource_id=excluded.resource_id,
                        generation_count=excluded.generation_count,
                        origin_type=excluded.origin_type,
                        active_observations=excluded.active_observations,
                        observation_token_count=excluded.observation_token_count,
                        pending_message_tokens=excluded.pending_message_tokens,
                        last_observed_at=excluded.last_observed_at,
                        current_task=excluded.current_task,
                        suggested_response=excluded.suggested_response,
                        last_observed_message_ids_json=excluded.last_observed_message_ids_json,
                        observer_trigger_count_total=excluded.observer_trigger_count_total,
                        reflector_trigger_count_total=excluded.reflector_trigger_count_total,
                        is_observing=excluded.is_observing,
                        is_reflecting=excluded.is_reflecting,
                        updated_at=excluded.updated_at,
                        carried_messages_json=excluded.carried_messages_json
                    "
                ),
                params![
                    record.id,
                    record.scope.as_str(),
                    record.scope_key,
                    record.thread_id,
                    record.resource_id,
                    i64::from(record.generation_count),
                    record.origin_type.as_str(),
                    record.active_observations,
                    i64::from(record.observation_token_count),
                    i64::from(record.pending_message_tokens),
                    record.last_observed_at.map(|x| x.to_rfc3339()),
                    record.current_task,
                    record.suggested_response,
                    message_ids_json,
                    i64::from(record.observer_trigger_count_total),
                    i64::from(record.reflector_trigger_count_total),
                    bool_to_i64(record.is_observing),
                    bool_to_i64(record.is_reflecting),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    carried_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_messages(&self, scope_key: &str, messages: &[OmMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let scope_key = scope_key.to_string();
        let messages = messages.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx.prepare(
                    r"
                    INSERT INTO om_messages(
                        scope_key, id, role, text, source_thread_id, created_at, created_at_ns
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(scope_key, id) DO NOTHING
                    ",
                )?;
                for message in &messages {
                    inserted += stmt.execute(params![
                        scope_key,
                        message.id,
                        message.role,
                        message.text,
                        message.source_thread_id,
                        message.created_at.to_rfc3339(),
                        timestamp_key(message.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            debug!(scope_key = %scope_key, inserted, "om messages stored");
            Ok(())
        })
        .await
    }

    async fn list_unobserved_messages(
        &self,
        scope_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OmMessage>> {
        let scope_key = scope_key.to_string();
        let since_key = since.map(timestamp_key);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, role, text, source_thread_id, created_at
                FROM om_messages
                WHERE scope_key = ?1
                  AND (?2 IS NULL OR created_at_ns > ?2)
                ORDER BY created_at_ns ASC, id ASC
                ",
            )?;
            let rows = stmt.query_map(params![scope_key, since_key], |row| {
                let created_at_raw = row.get::<_, String>(4)?;
                Ok(OmMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    text: row.get(2)?,
                    source_thread_id: row.get(3)?,
                    created_at: parse_required_rfc3339(4, &created_at_raw)?,
                })
            })?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OmRecord> {
    let scope_raw = row.get::<_, String>(1)?;
    let scope = OmScope::parse(&scope_raw)
        .ok_or_else(|| invalid_text(1, format!("invalid om scope: {scope_raw}")))?;
    let origin_raw = row.get::<_, String>(6)?;
    let origin_type = OmOriginType::parse(&origin_raw)
        .ok_or_else(|| invalid_text(6, format!("invalid om origin_type: {origin_raw}")))?;
    let last_observed_raw = row.get::<_, Option<String>>(10)?;
    let message_ids_raw = row.get::<_, String>(13)?;
    let last_observed_message_ids = serde_json::from_str::<Vec<String>>(&message_ids_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(err)))?;
    let created_at_raw = row.get::<_, String>(18)?;
    let updated_at_raw = row.get::<_, String>(19)?;
    let carried_raw = row.get::<_, String>(20)?;
    let carried_messages = serde_json::from_str::<Vec<OmMessage>>(&carried_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(20, Type::Text, Box::new(err)))?;

    Ok(OmRecord {
        id: row.get(0)?,
        scope,
        scope_key: row.get(2)?,
        thread_id: row.get(3)?,
        resource_id: row.get(4)?,
        generation_count: i64_to_u32_saturating(row.get::<_, i64>(5)?),
        origin_type,
        active_observations: row.get(7)?,
        observation_token_count: i64_to_u32_saturating(row.get::<_, i64>(8)?),
        pending_message_tokens: i64_to_u32_saturating(row.get::<_, i64>(9)?),
        last_observed_at: last_observed_raw
            .as_deref()
            .map(|raw| parse_required_rfc3339(10, raw))
            .transpose()?,
        current_task: row.get(11)?,
        suggested_response: row.get(12)?,
        last_observed_message_ids,
        carried_messages,
        observer_trigger_count_total: i64_to_u32_saturating(row.get::<_, i64>(14)?),
        reflector_trigger_count_total: i64_to_u32_saturating(row.get::<_, i64>(15)?),
        is_observing: row.get::<_, i64>(16)? != 0,
        is_reflecting: row.get::<_, i64>(17)? != 0,
        created_at: parse_required_rfc3339(18, &created_at_raw)?,
        updated_at: parse_required_rfc3339(19, &updated_at_raw)?,
    })
}

fn invalid_text(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_required_rfc3339(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|x| x.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Sortable integer form of a timestamp; falls back to microseconds outside
/// the nanosecond range.
fn timestamp_key(value: DateTime<Utc>) -> i64 {
    value
        .timestamp_nanos_opt()
        .unwrap_or_else(|| value.timestamp_micros().saturating_mul(1_000))
}

fn i64_to_u32_saturating(value: i64) -> u32 {
    if value <= 0 {
        0
    } else {
        u32::try_from(value).unwrap_or(u32::MAX)
    }
}

fn bool_to_i64(value: bool) -> i64 {
    i64::from(u8::from(value))
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ensure_required_column(conn: &Connection, table: &str, column: &str) -> Result<()> {
    if has_column(conn, table, column)? {
        Ok(())
    } else {
        Err(OmError::storage(format!(
            "unsupported {table} schema: {column} is missing; reset the memory database"
        )))
    }
}
