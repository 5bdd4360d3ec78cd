use errand::core::job::{ErrorDetail, FailureKind, JobRecord, JobState};
use errand::core::{Bytes, DateTime, Xid};
use sqlx::sqlite::SqliteRow;
use sqlx::types::chrono::{TimeZone, Utc};
use sqlx::{Error, FromRow, Row};
use std::str::FromStr;

/// Row of `errand_jobs`. Timestamps are stored as milliseconds since the Unix epoch.
#[derive(Debug)]
pub(crate) struct JobRow(pub JobRecord);

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, Error> {
        let id = row
            .try_get("jid")
            .map(Xid::from_str)?
            .map_err(|xid_err| Error::Decode(Box::new(xid_err)))?;
        let state = row
            .try_get::<String, _>("state")
            .map(|s| JobState::from_str(&s))?
            .map_err(|e| Error::Decode(Box::new(e)))?;
        let last_error = match row.try_get::<Option<String>, _>("last_error_kind")? {
            Some(kind) => {
                let kind = FailureKind::from_str(&kind).map_err(|e| Error::Decode(e.into()))?;
                let message: Option<String> = row.try_get("last_error_message")?;
                Some(ErrorDetail::new(kind, message.unwrap_or_default()))
            }
            None => None,
        };
        Ok(Self(JobRecord {
            id,
            queue_name: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            arguments: row.try_get::<Vec<u8>, _>("arguments").map(Bytes::from)?,
            state,
            attempt_count: row.try_get("attempt_count")?,
            next_run_at: from_millis(row.try_get("next_run_at_ms")?)?,
            last_error,
            created_at: from_millis(row.try_get("created_at_ms")?)?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row
                .try_get::<Option<i64>, _>("claimed_at_ms")?
                .map(from_millis)
                .transpose()?,
        }))
    }
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        row.0
    }
}

pub(crate) fn to_millis(time: DateTime) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime, Error> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Decode(format!("Timestamp out of range: {}", ms).into()))
}
