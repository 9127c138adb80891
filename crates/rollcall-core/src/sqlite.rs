//! SQLite-backed record store.
//!
//! All queries run on the `tokio-rusqlite` connection thread. Event rows are
//! only ever inserted; removing an identity leaves its history in place.

use crate::error::StoreError;
use crate::store::{NewIdentity, RecordStore};
use crate::types::{AttendanceEvent, EventId, EventResult, Identity, IdentityId};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const TIME_FORMAT: &str = "%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        id               TEXT PRIMARY KEY,
        external_user_id TEXT NOT NULL UNIQUE,
        display_name     TEXT NOT NULL,
        reference_image  BLOB NOT NULL,
        shift_start      TEXT,
        shift_end        TEXT,
        grace_minutes    INTEGER NOT NULL DEFAULT 0,
        enrolled_at      TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance_events (
        id              TEXT PRIMARY KEY,
        identity_id     TEXT,
        result          TEXT NOT NULL,
        similarity      REAL,
        check_type      TEXT,
        status          TEXT,
        late_minutes    INTEGER,
        scheduled_start TEXT,
        scheduled_end   TEXT,
        event_time      TEXT NOT NULL,
        event_date      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_identity_date
        ON attendance_events(identity_id, event_date);
    CREATE INDEX IF NOT EXISTS idx_events_date
        ON attendance_events(event_date);
";

const IDENTITY_COLUMNS: &str =
    "id, external_user_id, display_name, shift_start, shift_end, grace_minutes";

const EVENT_COLUMNS: &str = "identity_id, result, similarity, check_type, status, late_minutes, \
     scheduled_start, scheduled_end, event_time";

/// Raw identity row, converted outside the connection thread.
type IdentityRow = (String, String, String, Option<String>, Option<String>, i64);

type EventRow = (
    Option<String>,
    String,
    Option<f64>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
);

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.init_schema().await?;
        tracing::info!(path = %path.display(), "record store opened");
        Ok(store)
    }

    /// In-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Enroll a new identity with its reference image.
    pub async fn enroll(&self, new: NewIdentity, reference_image: Vec<u8>) -> Result<Identity, StoreError> {
        let identity = new.into_identity();
        let row = identity.clone();
        let enrolled_at = chrono::Local::now().naive_local().format(DATETIME_FORMAT).to_string();

        let inserted = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE external_user_id = ?1)",
                    params![row.external_user_id],
                    |r| r.get(0),
                )?;
                if exists {
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO identities
                     (id, external_user_id, display_name, reference_image,
                      shift_start, shift_end, grace_minutes, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id.to_string(),
                        row.external_user_id,
                        row.display_name,
                        reference_image,
                        row.shift_start.map(|t| t.format(TIME_FORMAT).to_string()),
                        row.shift_end.map(|t| t.format(TIME_FORMAT).to_string()),
                        row.grace_minutes,
                        enrolled_at,
                    ],
                )?;
                Ok(true)
            })
            .await?;

        if !inserted {
            return Err(StoreError::DuplicateUser(identity.external_user_id));
        }
        tracing::info!(
            identity = %identity.id,
            user = %identity.external_user_id,
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Replace the shift fields of an identity.
    pub async fn update_shift(
        &self,
        external_user_id: &str,
        shift_start: Option<NaiveTime>,
        shift_end: Option<NaiveTime>,
        grace_minutes: u32,
    ) -> Result<Identity, StoreError> {
        let user = external_user_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE identities SET shift_start = ?1, shift_end = ?2, grace_minutes = ?3
                     WHERE external_user_id = ?4",
                    params![
                        shift_start.map(|t| t.format(TIME_FORMAT).to_string()),
                        shift_end.map(|t| t.format(TIME_FORMAT).to_string()),
                        grace_minutes,
                        user,
                    ],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(external_user_id.to_string()));
        }
        self.find_identity_by_user_id(external_user_id)
            .await?
            .ok_or_else(|| StoreError::IdentityNotFound(external_user_id.to_string()))
    }

    /// Remove an identity and its reference image. Events are kept.
    pub async fn remove_identity(&self, external_user_id: &str) -> Result<Identity, StoreError> {
        let identity = self
            .find_identity_by_user_id(external_user_id)
            .await?
            .ok_or_else(|| StoreError::IdentityNotFound(external_user_id.to_string()))?;
        let id = identity.id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        tracing::info!(identity = %identity.id, user = external_user_id, "identity removed");
        Ok(identity)
    }

    /// Every event on a date (all results, all identities), oldest first.
    pub async fn list_events_on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        let day = date.format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM attendance_events
                     WHERE event_date = ?1 ORDER BY event_time ASC"
                ))?;
                let rows = stmt
                    .query_map(params![day], event_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }
}

fn identity_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Corrupt(format!("{what}: {value:?}"))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| corrupt("id", value))
}

fn parse_time(value: Option<String>) -> Result<Option<NaiveTime>, StoreError> {
    value
        .map(|v| NaiveTime::parse_from_str(&v, TIME_FORMAT).map_err(|_| corrupt("time", &v)))
        .transpose()
}

fn parse_datetime(value: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT).map_err(|_| corrupt("timestamp", value))
}

fn parse_enum<T: std::str::FromStr>(value: Option<String>) -> Result<Option<T>, StoreError> {
    value
        .map(|v| v.parse::<T>().map_err(|_| corrupt("enum", &v)))
        .transpose()
}

fn identity_from_row(row: IdentityRow) -> Result<Identity, StoreError> {
    let (id, external_user_id, display_name, shift_start, shift_end, grace_minutes) = row;
    Ok(Identity {
        id: parse_uuid(&id)?,
        external_user_id,
        display_name,
        shift_start: parse_time(shift_start)?,
        shift_end: parse_time(shift_end)?,
        grace_minutes: u32::try_from(grace_minutes)
            .map_err(|_| corrupt("grace_minutes", &grace_minutes.to_string()))?,
    })
}

fn event_from_row(row: EventRow) -> Result<AttendanceEvent, StoreError> {
    let (identity_id, result, similarity, check_type, status, late_minutes, start, end, time) = row;
    Ok(AttendanceEvent {
        identity_id: identity_id.as_deref().map(parse_uuid).transpose()?,
        result: result.parse::<EventResult>().map_err(|_| corrupt("result", &result))?,
        similarity: similarity.map(|s| s as f32),
        check_type: parse_enum(check_type)?,
        status: parse_enum(status)?,
        late_minutes: late_minutes
            .map(|m| u32::try_from(m).map_err(|_| corrupt("late_minutes", &m.to_string())))
            .transpose()?,
        scheduled_start: start.as_deref().map(parse_datetime).transpose()?,
        scheduled_end: end.as_deref().map(parse_datetime).transpose()?,
        event_time: parse_datetime(&time)?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY enrolled_at ASC, rowid ASC"
                ))?;
                let rows = stmt
                    .query_map([], identity_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(identity_from_row).collect()
    }

    async fn find_identity_by_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let user = external_user_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE external_user_id = ?1"),
                        params![user],
                        identity_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(identity_from_row).transpose()
    }

    async fn list_success_events_for_identity_on_date(
        &self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let id = identity_id.to_string();
        let day = date.format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM attendance_events
                     WHERE identity_id = ?1 AND event_date = ?2 AND result = ?3
                     ORDER BY event_time ASC"
                ))?;
                let rows = stmt
                    .query_map(params![id, day, EventResult::Success.as_str()], event_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn create_attendance_event(&self, event: &AttendanceEvent) -> Result<EventId, StoreError> {
        let id = Uuid::new_v4();
        let e = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_events
                     (id, identity_id, result, similarity, check_type, status, late_minutes,
                      scheduled_start, scheduled_end, event_time, event_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id.to_string(),
                        e.identity_id.map(|i| i.to_string()),
                        e.result.as_str(),
                        e.similarity.map(f64::from),
                        e.check_type.map(|c| c.as_str()),
                        e.status.map(|s| s.as_str()),
                        e.late_minutes,
                        e.scheduled_start.map(|t| t.format(DATETIME_FORMAT).to_string()),
                        e.scheduled_end.map(|t| t.format(DATETIME_FORMAT).to_string()),
                        e.event_time.format(DATETIME_FORMAT).to_string(),
                        e.event_time.date().format(DATE_FORMAT).to_string(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    async fn get_reference_image(&self, identity: &Identity) -> Result<Vec<u8>, StoreError> {
        let id = identity.id.to_string();
        let image: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT reference_image FROM identities WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await?;
        image.ok_or(StoreError::ReferenceImageMissing(identity.id))
    }
}
