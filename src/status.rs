use crate::store::{format_timestamp, Event, EventKind, EventStore};
use chrono::Utc;
use color_eyre::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

pub const OK_EXIT: u8 = 0;
pub const CRITICAL_EXIT: u8 = 2;
/// Bad usage, unreadable config or storage failures.
pub const SYSTEM_ERROR_EXIT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub status: CheckStatus,
    pub message: String,
}

impl CheckReport {
    fn ok(message: String) -> Self {
        Self {
            status: CheckStatus::Ok,
            message,
        }
    }

    fn critical(message: String) -> Self {
        Self {
            status: CheckStatus::Critical,
            message,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.status {
            CheckStatus::Ok => OK_EXIT,
            CheckStatus::Critical => CRITICAL_EXIT,
        }
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            CheckStatus::Ok => "OK",
            CheckStatus::Critical => "CRITICAL",
        };
        write!(f, "JOB {status}: {}", self.message)
    }
}

/// Judges a job by its latest event. Staleness is checked before the event
/// kind, so an old success is still critical. A job that merely started is
/// reported OK without checking it is still alive.
pub fn evaluate(group: &str, job: &str, latest: Option<&Event>, now: i64, max_age: Duration) -> CheckReport {
    let Some(event) = latest else {
        return CheckReport::critical(format!("{group}/{job} not executed"));
    };
    let earliest = now.saturating_sub(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX));
    let at = event.local_time();
    if event.ts < earliest {
        return CheckReport::critical(format!("{group}/{job} last executed at {at}"));
    }
    let pid = event.pid;
    match event.kind {
        EventKind::Failed => CheckReport::critical(format!("{group}/{job} (pid {pid}) failed at {at}")),
        EventKind::Finished => CheckReport::ok(format!("{group}/{job} (pid {pid}) succeeded at {at}")),
        EventKind::Started => CheckReport::ok(format!("{group}/{job} (pid {pid}) started at {at}")),
    }
}

#[instrument(skip(store))]
pub fn check(store: &EventStore, group: &str, job: &str, max_age: Duration) -> Result<CheckReport> {
    let latest = store.latest(group, job)?;
    debug!(?latest, "Latest event");
    Ok(evaluate(group, job, latest.as_ref(), Utc::now().timestamp(), max_age))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub status: EventKind,
    pub ts: String,
}

/// group -> job -> latest status, both levels sorted by name.
pub type StatusDump = BTreeMap<String, BTreeMap<String, JobStatus>>;

pub fn list(store: &EventStore) -> Result<StatusDump> {
    let mut dump = StatusDump::new();
    for event in store.latest_all()? {
        let ts = event.local_time();
        dump.entry(event.group)
            .or_default()
            .insert(event.job, JobStatus { status: event.kind, ts });
    }
    Ok(dump)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub ts: String,
    pub group: String,
    pub job: String,
    pub status: EventKind,
    pub pid: i32,
}

impl From<Event> for HistoryEntry {
    fn from(event: Event) -> Self {
        Self {
            ts: format_timestamp(event.ts),
            id: event.id,
            group: event.group,
            job: event.job,
            status: event.kind,
            pid: event.pid,
        }
    }
}

pub fn history(store: &EventStore, group: &str, job: &str) -> Result<Vec<HistoryEntry>> {
    Ok(store
        .history(group, job)?
        .into_iter()
        .map(HistoryEntry::from)
        .collect())
}

/// Every event of every job recorded within `max_age` of now, oldest first.
pub fn recent(store: &EventStore, max_age: Duration) -> Result<Vec<HistoryEntry>> {
    let earliest = Utc::now()
        .timestamp()
        .saturating_sub(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX));
    Ok(store
        .since(earliest)?
        .into_iter()
        .map(HistoryEntry::from)
        .collect())
}
