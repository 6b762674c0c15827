//! Durable dispatch job queue with lease locks.
//!
//! Claiming is the critical section: a single transaction selects due,
//! unlocked jobs (skipping any contact that already has a live locked job,
//! so per-contact processing stays serialized) and stamps a lease on them.
//! Lease expiry doubles as stall recovery: a job whose worker died simply
//! becomes claimable again once `locked_until` passes.

use crate::config::Config;
use crate::store::{parse_rfc3339, sql_conversion_error, with_connection};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn parse(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(Self::High),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Low),
            other => anyhow::bail!("Unknown job priority: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("Unknown job status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub id: String,
    pub business_id: String,
    pub contact_phone: String,
    pub instance_id: String,
    pub buffer_id: Option<String>,
    pub message_id: Option<String>,
    pub batch: Vec<String>,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Job payload as submitted by the buffer flush path.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub business_id: String,
    pub contact_phone: String,
    pub instance_id: String,
    pub buffer_id: Option<String>,
    pub message_id: Option<String>,
    pub batch: Vec<String>,
    pub priority: Priority,
    pub max_attempts: u32,
}

const JOB_COLUMNS: &str = "id, business_id, contact_phone, instance_id, buffer_id, message_id, \
     batch, priority, attempts, max_attempts, available_at, locked_until, locked_by, status, \
     last_error, created_at";

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchJob> {
    let batch_raw: String = row.get(6)?;
    let priority_raw: i64 = row.get(7)?;
    let attempts: i64 = row.get(8)?;
    let max_attempts: i64 = row.get(9)?;
    let locked_raw: Option<String> = row.get(11)?;
    let status_raw: String = row.get(13)?;
    Ok(DispatchJob {
        id: row.get(0)?,
        business_id: row.get(1)?,
        contact_phone: row.get(2)?,
        instance_id: row.get(3)?,
        buffer_id: row.get(4)?,
        message_id: row.get(5)?,
        batch: serde_json::from_str(&batch_raw).map_err(|e| sql_conversion_error(e.into()))?,
        priority: Priority::parse(priority_raw).map_err(sql_conversion_error)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        available_at: parse_rfc3339(&row.get::<_, String>(10)?).map_err(sql_conversion_error)?,
        locked_until: locked_raw
            .map(|raw| parse_rfc3339(&raw).map_err(sql_conversion_error))
            .transpose()?,
        locked_by: row.get(12)?,
        status: JobStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        last_error: row.get(14)?,
        created_at: parse_rfc3339(&row.get::<_, String>(15)?).map_err(sql_conversion_error)?,
    })
}

pub fn insert_job(config: &Config, new: &NewJob) -> Result<DispatchJob> {
    let now = Utc::now();
    let job = DispatchJob {
        id: Uuid::new_v4().to_string(),
        business_id: new.business_id.clone(),
        contact_phone: new.contact_phone.clone(),
        instance_id: new.instance_id.clone(),
        buffer_id: new.buffer_id.clone(),
        message_id: new.message_id.clone(),
        batch: new.batch.clone(),
        priority: new.priority,
        attempts: 0,
        max_attempts: new.max_attempts,
        available_at: now,
        locked_until: None,
        locked_by: None,
        status: JobStatus::Queued,
        last_error: None,
        created_at: now,
    };

    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO dispatch_jobs
                (id, business_id, contact_phone, instance_id, buffer_id, message_id,
                 batch, priority, max_attempts, available_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'queued', ?11)",
            params![
                job.id,
                job.business_id,
                job.contact_phone,
                job.instance_id,
                job.buffer_id,
                job.message_id,
                serde_json::to_string(&job.batch)?,
                job.priority.as_i64(),
                i64::from(job.max_attempts),
                job.available_at.to_rfc3339(),
                job.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert dispatch job")?;
        Ok(())
    })?;

    Ok(job)
}

/// Claim up to `limit` due jobs for `worker_id`, stamping each with a lease.
///
/// A job qualifies when it is queued, its `available_at` has passed, its own
/// lock (if any) has expired, and no other job for the same contact currently
/// holds a live lock.
pub fn claim_due(
    config: &Config,
    worker_id: &str,
    limit: usize,
    lease: Duration,
) -> Result<Vec<DispatchJob>> {
    let now = Utc::now();
    let until = now + lease;
    let lim = i64::try_from(limit.max(1)).context("Claim limit overflow")?;

    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;

        let mut claimed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs AS j
                 WHERE j.status = 'queued'
                   AND j.available_at <= ?1
                   AND (j.locked_until IS NULL OR j.locked_until <= ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM dispatch_jobs AS other
                       WHERE other.business_id = j.business_id
                         AND other.contact_phone = j.contact_phone
                         AND other.id != j.id
                         AND other.status = 'queued'
                         AND other.locked_until IS NOT NULL
                         AND other.locked_until > ?1
                   )
                 ORDER BY j.priority, j.created_at
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now.to_rfc3339(), lim], map_job_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            jobs
        };

        // Two due jobs for the same contact can both pass the NOT EXISTS
        // check within one claim batch; keep only the first.
        let mut seen = std::collections::HashSet::new();
        claimed.retain(|job| seen.insert((job.business_id.clone(), job.contact_phone.clone())));

        for job in &mut claimed {
            tx.execute(
                "UPDATE dispatch_jobs
                 SET locked_until = ?2, locked_by = ?3, attempts = attempts + 1
                 WHERE id = ?1",
                params![job.id, until.to_rfc3339(), worker_id],
            )
            .context("Failed to lock claimed job")?;
            job.locked_until = Some(until);
            job.locked_by = Some(worker_id.to_string());
            job.attempts += 1;
        }

        tx.commit().context("Failed to commit job claim")?;
        Ok(claimed)
    })
}

/// Renew the lease on an in-flight job.
pub fn extend_lease(config: &Config, job_id: &str, worker_id: &str, lease: Duration) -> Result<()> {
    let until = Utc::now() + lease;
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE dispatch_jobs SET locked_until = ?2
             WHERE id = ?1 AND locked_by = ?3 AND status = 'queued'",
            params![job_id, until.to_rfc3339(), worker_id],
        )
        .context("Failed to extend job lease")?;
        Ok(())
    })
}

pub fn complete(config: &Config, job_id: &str) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE dispatch_jobs
             SET status = 'completed', locked_until = NULL, locked_by = NULL
             WHERE id = ?1",
            params![job_id],
        )
        .context("Failed to complete job")?;
        Ok(())
    })
}

/// Put a failed attempt back on the queue with a delay. Clears the lock so
/// the job is claimable once `delay` elapses.
pub fn retry_later(config: &Config, job_id: &str, delay: Duration, error: &str) -> Result<()> {
    let available = Utc::now() + delay;
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE dispatch_jobs
             SET available_at = ?2, locked_until = NULL, locked_by = NULL, last_error = ?3
             WHERE id = ?1 AND status = 'queued'",
            params![
                job_id,
                available.to_rfc3339(),
                truncate_with_ellipsis(error, 500),
            ],
        )
        .context("Failed to schedule job retry")?;
        Ok(())
    })
}

/// Terminal failure after retries are exhausted.
pub fn fail(config: &Config, job_id: &str, error: &str) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE dispatch_jobs
             SET status = 'failed', locked_until = NULL, locked_by = NULL, last_error = ?2
             WHERE id = ?1",
            params![job_id, truncate_with_ellipsis(error, 500)],
        )
        .context("Failed to mark job failed")?;
        Ok(())
    })
}

pub fn get_job(config: &Config, job_id: &str) -> Result<Option<DispatchJob>> {
    with_connection(config, |conn| {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE id = ?1"),
            params![job_id],
            map_job_row,
        )
        .optional()
        .context("Failed to load dispatch job")
    })
}
