use chrono::{Local, TimeZone, Utc};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::{Report, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        ts INTEGER,
        groupname TEXT,
        processname TEXT,
        eventname TEXT,
        pid INTEGER
    );
    CREATE INDEX IF NOT EXISTS events_job_ts ON events (groupname, processname, ts);
";

const COLUMNS: &str = "id, ts, groupname, processname, eventname, pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Started,
    Finished,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "STARTED",
            EventKind::Finished => "FINISHED",
            EventKind::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(EventKind::Started),
            "FINISHED" => Ok(EventKind::Finished),
            "FAILED" => Ok(EventKind::Failed),
            other => Err(eyre!("Unknown event kind {other:?}")),
        }
    }
}

impl ToSql for EventKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|_| FromSqlError::InvalidType)
    }
}

/// A single observed lifecycle transition. Never modified once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    /// Seconds since the unix epoch, taken when the notification was ingested.
    pub ts: i64,
    pub group: String,
    pub job: String,
    pub kind: EventKind,
    pub pid: i32,
}

impl Event {
    pub fn new(group: impl Into<String>, job: impl Into<String>, kind: EventKind, pid: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts: Utc::now().timestamp(),
            group: group.into(),
            job: job.into(),
            kind,
            pid,
        }
    }

    pub fn local_time(&self) -> String {
        format_timestamp(self.ts)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ts: row.get(1)?,
            group: row.get(2)?,
            job: row.get(3)?,
            kind: row.get(4)?,
            pid: row.get(5)?,
        })
    }
}

/// Renders epoch seconds in local time, e.g. `2024-01-31 13:05:00`.
pub fn format_timestamp(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0).earliest() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

/// Append-only log of job events backed by SQLite.
///
/// Latest-event lookups break timestamp ties with the SQLite rowid, so two
/// events recorded within the same second resolve in insertion order.
pub struct EventStore {
    conn: Connection,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl EventStore {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .wrap_err("Failed to set busy timeout")?;
        // Lets check/list read while the listener is writing
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .wrap_err("Failed to enable WAL")?;
        debug!(%mode, "Journal mode");
        Self::init(conn)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrap_err("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .wrap_err("Failed to create events table")?;
        Ok(Self { conn })
    }

    #[instrument(skip(self), fields(id = %event.id))]
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO events (id, ts, groupname, processname, eventname, pid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.ts,
                    event.group,
                    event.job,
                    event.kind,
                    event.pid
                ],
            )
            .wrap_err_with(|| format!("Failed to record {} {}/{}", event.kind, event.group, event.job))?;
        debug!(kind = %event.kind, group = %event.group, job = %event.job, pid = event.pid, "Recorded event");
        Ok(())
    }

    pub fn latest(&self, group: &str, job: &str) -> Result<Option<Event>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM events
                     WHERE groupname = ?1 AND processname = ?2
                     ORDER BY ts DESC, rowid DESC
                     LIMIT 1"
                ),
                params![group, job],
                Event::from_row,
            )
            .optional()
            .wrap_err_with(|| format!("Failed to query latest event for {group}/{job}"))
    }

    /// Latest event of every job that has ever reported, ordered by group then job.
    pub fn latest_all(&self) -> Result<Vec<Event>> {
        self.collect(
            "SELECT e.id, e.ts, e.groupname, e.processname, e.eventname, e.pid
             FROM events e
             WHERE e.rowid = (
                 SELECT i.rowid FROM events i
                 WHERE i.groupname = e.groupname AND i.processname = e.processname
                 ORDER BY i.ts DESC, i.rowid DESC
                 LIMIT 1
             )
             ORDER BY e.groupname, e.processname",
            [],
        )
        .wrap_err("Failed to query latest events")
    }

    /// Every event for one job, oldest first.
    pub fn history(&self, group: &str, job: &str) -> Result<Vec<Event>> {
        self.collect(
            &format!(
                "SELECT {COLUMNS} FROM events
                 WHERE groupname = ?1 AND processname = ?2
                 ORDER BY ts, rowid"
            ),
            params![group, job],
        )
        .wrap_err_with(|| format!("Failed to query history for {group}/{job}"))
    }

    /// Every event recorded at or after `ts`, oldest first.
    pub fn since(&self, ts: i64) -> Result<Vec<Event>> {
        self.collect(
            &format!("SELECT {COLUMNS} FROM events WHERE ts >= ?1 ORDER BY ts, rowid"),
            params![ts],
        )
        .wrap_err("Failed to query events by time")
    }

    #[cfg(test)]
    pub(crate) fn drop_table_for_tests(&self) {
        self.conn.execute_batch("DROP TABLE events").unwrap();
    }

    fn collect<P: rusqlite::Params>(&self, sql: &str, params: P) -> rusqlite::Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, Event::from_row)?;
        rows.collect()
    }
}
