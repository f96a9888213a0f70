//! SQL statements and row <-> Job mapping.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::job::{Job, JobId, JobState};
use crate::retry::RetryPolicy;
use crate::store::{QueueCounts, StaleOutcome};

pub(super) const JOB_COLUMNS: &str = "id, queue_name, name, payload, status, priority, \
     attempts_made, retry_policy, created_at, updated_at, process_at, locked_by, \
     lock_expires_at, progress, return_value, failed_reason, stacktrace, \
     remove_on_complete, remove_on_fail";

/// Upsert the job's full state.
pub(super) fn save(conn: &Connection, job: &Job) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(&*job.payload).unwrap_or_default();
    let retry = serde_json::to_string(&job.retry).unwrap_or_default();
    let return_value = job
        .return_value
        .as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_default());

    conn.execute(
        "INSERT INTO jobs (id, queue_name, name, payload, status, priority, attempts_made,
            max_attempts, retry_policy, created_at, updated_at, process_at, locked_by,
            lock_expires_at, progress, return_value, failed_reason, stacktrace,
            remove_on_complete, remove_on_fail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            priority = excluded.priority,
            attempts_made = excluded.attempts_made,
            max_attempts = excluded.max_attempts,
            retry_policy = excluded.retry_policy,
            updated_at = excluded.updated_at,
            process_at = excluded.process_at,
            locked_by = excluded.locked_by,
            lock_expires_at = excluded.lock_expires_at,
            progress = excluded.progress,
            return_value = excluded.return_value,
            failed_reason = excluded.failed_reason,
            stacktrace = excluded.stacktrace,
            remove_on_complete = excluded.remove_on_complete,
            remove_on_fail = excluded.remove_on_fail",
        params![
            job.id.to_string(),
            job.queue,
            job.name,
            payload,
            job.state.as_str(),
            job.priority,
            job.attempts_made,
            job.retry.max_attempts,
            retry,
            job.created_at as i64,
            job.updated_at as i64,
            job.process_at as i64,
            job.locked_by,
            job.lock_expires_at.map(|v| v as i64),
            job.progress as i32,
            return_value,
            job.failed_reason,
            job.stacktrace,
            job.remove_on_complete as i32,
            job.remove_on_fail as i32,
        ],
    )?;
    Ok(())
}

pub(super) fn find_by_id(
    conn: &Connection,
    id: &JobId,
) -> Result<Option<Job>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id.to_string()],
        row_to_job,
    )
    .optional()
}

/// Atomic claim: one conditional UPDATE selects the highest-priority eligible
/// job and leases it in the same statement, so two concurrent claimers can
/// never take the same row.
pub(super) fn claim_next(
    conn: &Connection,
    queue: &str,
    worker_id: &str,
    lease_ms: u64,
    now: u64,
) -> Result<Option<Job>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "UPDATE jobs SET
                status = 'active',
                locked_by = ?1,
                lock_expires_at = ?2,
                attempts_made = attempts_made + 1,
                updated_at = max(updated_at, ?3)
             WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = ?4
                  AND attempts_made < max_attempts
                  AND (status = 'waiting' OR (status = 'delayed' AND process_at <= ?3))
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ),
        params![worker_id, (now + lease_ms) as i64, now as i64, queue],
        row_to_job,
    )
    .optional()
}

pub(super) fn delete(conn: &Connection, id: &JobId) -> Result<bool, rusqlite::Error> {
    let rows = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])?;
    Ok(rows > 0)
}

/// Delete only while unclaimed; an Active job belongs to its worker.
pub(super) fn cancel(conn: &Connection, id: &JobId) -> Result<bool, rusqlite::Error> {
    let rows = conn.execute(
        "DELETE FROM jobs WHERE id = ?1 AND status != 'active'",
        params![id.to_string()],
    )?;
    Ok(rows > 0)
}

pub(super) fn find_stale(
    conn: &Connection,
    queue: &str,
    now: u64,
) -> Result<Vec<Job>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE queue_name = ?1 AND status = 'active' AND lock_expires_at < ?2"
    ))?;
    let rows = stmt.query_map(params![queue, now as i64], row_to_job)?;
    rows.collect()
}

/// Guarded against the owning worker (or a competing sweep) having already
/// moved the job on; only applies while the row is still Active and stale.
pub(super) fn recover_stale(
    conn: &Connection,
    id: &JobId,
    outcome: &StaleOutcome,
    now: u64,
) -> Result<bool, rusqlite::Error> {
    let rows = match outcome {
        StaleOutcome::Retry { process_at, reason } => conn.execute(
            "UPDATE jobs SET
                status = 'delayed',
                process_at = ?2,
                locked_by = NULL,
                lock_expires_at = NULL,
                failed_reason = ?3,
                updated_at = max(updated_at, ?4)
             WHERE id = ?1 AND status = 'active' AND lock_expires_at < ?4",
            params![id.to_string(), *process_at as i64, reason, now as i64],
        )?,
        StaleOutcome::Fail { reason } => conn.execute(
            "UPDATE jobs SET
                status = 'failed',
                locked_by = NULL,
                lock_expires_at = NULL,
                failed_reason = ?2,
                updated_at = max(updated_at, ?3)
             WHERE id = ?1 AND status = 'active' AND lock_expires_at < ?3",
            params![id.to_string(), reason, now as i64],
        )?,
    };
    Ok(rows > 0)
}

pub(super) fn update_progress(
    conn: &Connection,
    id: &JobId,
    progress: u8,
    now: u64,
) -> Result<bool, rusqlite::Error> {
    let rows = conn.execute(
        "UPDATE jobs SET progress = ?2, updated_at = max(updated_at, ?3)
         WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
        params![id.to_string(), progress.min(100) as i32, now as i64],
    )?;
    Ok(rows > 0)
}

pub(super) fn counts(conn: &Connection, queue: &str) -> Result<QueueCounts, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM jobs WHERE queue_name = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![queue], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
    })?;

    let mut counts = QueueCounts::default();
    for row in rows {
        let (status, n) = row?;
        match status.as_str() {
            "waiting" => counts.waiting = n,
            "delayed" => counts.delayed = n,
            "active" => counts.active = n,
            "completed" => counts.completed = n,
            "failed" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}

/// Convert a database row to a Job.
fn row_to_job(row: &rusqlite::Row) -> Result<Job, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let queue: String = row.get(1)?;
    let name: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let status: String = row.get(4)?;
    let priority: i32 = row.get(5)?;
    let attempts_made: u32 = row.get(6)?;
    let retry_str: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let updated_at: i64 = row.get(9)?;
    let process_at: i64 = row.get(10)?;
    let locked_by: Option<String> = row.get(11)?;
    let lock_expires_at: Option<i64> = row.get(12)?;
    let progress: i32 = row.get(13)?;
    let return_value_str: Option<String> = row.get(14)?;
    let failed_reason: Option<String> = row.get(15)?;
    let stacktrace: Option<String> = row.get(16)?;
    let remove_on_complete: i32 = row.get(17)?;
    let remove_on_fail: i32 = row.get(18)?;

    let id = JobId::parse(&id_str).map_err(|_| invalid_column(0, "job id"))?;
    let state = JobState::parse(&status).map_err(|_| invalid_column(4, "job status"))?;
    let retry: RetryPolicy =
        serde_json::from_str(&retry_str).map_err(|_| invalid_column(7, "retry policy"))?;
    let payload: Value = serde_json::from_str(&payload_str).unwrap_or(Value::Null);
    let return_value = return_value_str.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Job {
        id,
        queue,
        name,
        payload: Arc::new(payload),
        state,
        priority,
        attempts_made,
        retry,
        created_at: created_at as u64,
        updated_at: updated_at as u64,
        process_at: process_at as u64,
        locked_by,
        lock_expires_at: lock_expires_at.map(|v| v as u64),
        progress: progress.clamp(0, 100) as u8,
        return_value,
        failed_reason,
        stacktrace,
        remove_on_complete: remove_on_complete != 0,
        remove_on_fail: remove_on_fail != 0,
    })
}

fn invalid_column(index: usize, what: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(
        index,
        what.to_string(),
        rusqlite::types::Type::Text,
    )
}
