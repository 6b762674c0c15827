//! Debounce buffers: one live row per (business, contact) that accumulates
//! inbound fragments until the debounce deadline passes, then is claimed for
//! dispatch. Claimed rows carry a lease so a crashed worker's buffer becomes
//! reclaimable; exhausted rows are kept as `failed` for operator inspection.

use crate::config::Config;
use crate::store::{parse_rfc3339, sql_conversion_error, with_connection};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Pending,
    Processing,
    Failed,
}

impl BufferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("Unknown buffer status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub id: String,
    pub business_id: String,
    pub contact_phone: String,
    pub instance_id: String,
    pub last_message_id: Option<String>,
    pub fragments: Vec<String>,
    pub debounce_deadline: DateTime<Utc>,
    pub status: BufferStatus,
    pub processing_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn map_buffer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BufferEntry> {
    let fragments_raw: String = row.get(5)?;
    let status_raw: String = row.get(7)?;
    let processing_raw: Option<String> = row.get(8)?;
    Ok(BufferEntry {
        id: row.get(0)?,
        business_id: row.get(1)?,
        contact_phone: row.get(2)?,
        instance_id: row.get(3)?,
        last_message_id: row.get(4)?,
        fragments: serde_json::from_str(&fragments_raw)
            .map_err(|e| sql_conversion_error(e.into()))?,
        debounce_deadline: parse_rfc3339(&row.get::<_, String>(6)?)
            .map_err(sql_conversion_error)?,
        status: BufferStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        processing_until: processing_raw
            .map(|raw| parse_rfc3339(&raw).map_err(sql_conversion_error))
            .transpose()?,
        last_error: row.get(9)?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?).map_err(sql_conversion_error)?,
    })
}

const BUFFER_COLUMNS: &str = "id, business_id, contact_phone, instance_id, last_message_id, \
     fragments, debounce_deadline, status, processing_until, last_error, created_at";

/// Append one fragment to the contact's live buffer, creating the row if
/// none exists. Each append pushes the debounce deadline out to
/// `now + debounce`, so a rapid burst collapses into a single flush.
pub fn append_fragment(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    instance_id: &str,
    message_id: Option<&str>,
    content: &str,
    debounce: Duration,
) -> Result<BufferEntry> {
    let now = Utc::now();
    let deadline = now + debounce;

    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {BUFFER_COLUMNS} FROM message_buffers
                     WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'pending'"
                ),
                params![business_id, contact_phone],
                map_buffer_row,
            )
            .optional()
            .context("Failed to look up live buffer")?;

        let entry = match existing {
            Some(mut entry) => {
                entry.fragments.push(content.to_string());
                entry.debounce_deadline = deadline;
                entry.instance_id = instance_id.to_string();
                if let Some(mid) = message_id {
                    entry.last_message_id = Some(mid.to_string());
                }
                tx.execute(
                    "UPDATE message_buffers
                     SET fragments = ?2, debounce_deadline = ?3, instance_id = ?4,
                         last_message_id = ?5
                     WHERE id = ?1",
                    params![
                        entry.id,
                        serde_json::to_string(&entry.fragments)?,
                        deadline.to_rfc3339(),
                        entry.instance_id,
                        entry.last_message_id,
                    ],
                )
                .context("Failed to extend live buffer")?;
                entry
            }
            None => {
                let entry = BufferEntry {
                    id: Uuid::new_v4().to_string(),
                    business_id: business_id.to_string(),
                    contact_phone: contact_phone.to_string(),
                    instance_id: instance_id.to_string(),
                    last_message_id: message_id.map(str::to_string),
                    fragments: vec![content.to_string()],
                    debounce_deadline: deadline,
                    status: BufferStatus::Pending,
                    processing_until: None,
                    last_error: None,
                    created_at: now,
                };
                tx.execute(
                    "INSERT INTO message_buffers
                        (id, business_id, contact_phone, instance_id, last_message_id,
                         fragments, debounce_deadline, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
                    params![
                        entry.id,
                        entry.business_id,
                        entry.contact_phone,
                        entry.instance_id,
                        entry.last_message_id,
                        serde_json::to_string(&entry.fragments)?,
                        deadline.to_rfc3339(),
                        now.to_rfc3339(),
                    ],
                )
                .context("Failed to create buffer")?;
                entry
            }
        };

        tx.commit().context("Failed to commit buffer append")?;
        Ok(entry)
    })
}

/// Claim the contact's pending buffer for processing. Returns `None` when no
/// pending row exists (already claimed, or never created). The claim holds a
/// lease; call [`extend_claim`] while work is in flight.
pub fn claim_for_flush(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    lease: Duration,
) -> Result<Option<BufferEntry>> {
    let until = Utc::now() + lease;
    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;

        let entry = tx
            .query_row(
                &format!(
                    "SELECT {BUFFER_COLUMNS} FROM message_buffers
                     WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'pending'"
                ),
                params![business_id, contact_phone],
                map_buffer_row,
            )
            .optional()
            .context("Failed to look up pending buffer")?;

        let Some(mut entry) = entry else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE message_buffers
             SET status = 'processing', processing_until = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![entry.id, until.to_rfc3339()],
        )
        .context("Failed to claim buffer")?;
        tx.commit().context("Failed to commit buffer claim")?;

        entry.status = BufferStatus::Processing;
        entry.processing_until = Some(until);
        Ok(Some(entry))
    })
}

/// Pending buffers whose debounce deadline has passed. Recovery path for
/// buffers whose in-process flush timer died with a previous process.
pub fn list_pending_due(config: &Config, now: DateTime<Utc>) -> Result<Vec<BufferEntry>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUFFER_COLUMNS} FROM message_buffers
             WHERE status = 'pending' AND debounce_deadline <= ?1
             ORDER BY debounce_deadline"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], map_buffer_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    })
}

/// Processing buffers whose lease has expired with no live dispatch job:
/// the claiming worker died before it could enqueue. Flips them back to
/// pending so the recovery sweep can reclaim them. A buffer whose job is
/// still queued belongs to that job, even past the lease; under backlog a
/// job can wait longer than the lease before a worker picks it up.
pub fn release_stalled(config: &Config, now: DateTime<Utc>) -> Result<usize> {
    with_connection(config, |conn| {
        let changed = conn
            .execute(
                "UPDATE message_buffers
                 SET status = 'pending', processing_until = NULL, debounce_deadline = ?1
                 WHERE status = 'processing' AND processing_until IS NOT NULL
                   AND processing_until <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM dispatch_jobs
                       WHERE dispatch_jobs.buffer_id = message_buffers.id
                         AND dispatch_jobs.status = 'queued'
                   )",
                params![now.to_rfc3339()],
            )
            .context("Failed to release stalled buffers")?;
        Ok(changed)
    })
}

/// Return a claimed buffer to pending. Used when the claim raced a newer
/// fragment that pushed the debounce deadline out; the fragment updated the
/// same row before the claim, so no second pending row can exist.
pub fn release(config: &Config, buffer_id: &str) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE message_buffers
             SET status = 'pending', processing_until = NULL
             WHERE id = ?1 AND status = 'processing'",
            params![buffer_id],
        )
        .context("Failed to release buffer claim")?;
        Ok(())
    })
}

/// Renew the lease on a claimed buffer.
pub fn extend_claim(config: &Config, buffer_id: &str, lease: Duration) -> Result<()> {
    let until = Utc::now() + lease;
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE message_buffers SET processing_until = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![buffer_id, until.to_rfc3339()],
        )
        .context("Failed to extend buffer claim")?;
        Ok(())
    })
}

/// Drop a consumed buffer after its job completed.
pub fn delete(config: &Config, buffer_id: &str) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "DELETE FROM message_buffers WHERE id = ?1",
            params![buffer_id],
        )
        .context("Failed to delete buffer")?;
        Ok(())
    })
}

/// Mark a buffer failed after retries were exhausted. The far-future
/// `processing_until` keeps the row out of the stall-recovery sweep.
pub fn mark_failed(config: &Config, buffer_id: &str, error: &str) -> Result<()> {
    let parked = Utc::now() + Duration::days(3650);
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE message_buffers
             SET status = 'failed', processing_until = ?2, last_error = ?3
             WHERE id = ?1",
            params![
                buffer_id,
                parked.to_rfc3339(),
                truncate_with_ellipsis(error, 500),
            ],
        )
        .context("Failed to mark buffer failed")?;
        Ok(())
    })
}

pub fn get(config: &Config, buffer_id: &str) -> Result<Option<BufferEntry>> {
    with_connection(config, |conn| {
        conn.query_row(
            &format!("SELECT {BUFFER_COLUMNS} FROM message_buffers WHERE id = ?1"),
            params![buffer_id],
            map_buffer_row,
        )
        .optional()
        .context("Failed to load buffer")
    })
}
