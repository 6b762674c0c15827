//! Follow-up reminders and their state machine.
//!
//! A reminder starts `pending` and moves exactly once into a terminal state.
//! Every transition is a guarded `UPDATE ... WHERE status = 'pending'`, so
//! concurrent workers and cancellation racing with execution resolve to a
//! single winner without advisory locks.

use crate::config::Config;
use crate::store::{parse_rfc3339, sql_conversion_error, with_connection};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderStatus {
    Pending,
    Executed,
    Skipped,
    NoTemplate,
    MaxDailyReached,
    Failed,
    CancelledRescheduled,
    CancelledUserReplied,
}

impl ReminderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Skipped => "skipped",
            Self::NoTemplate => "no_template",
            Self::MaxDailyReached => "max_daily_reached",
            Self::Failed => "failed",
            Self::CancelledRescheduled => "cancelled_rescheduled",
            Self::CancelledUserReplied => "cancelled_user_replied",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "executed" => Ok(Self::Executed),
            "skipped" => Ok(Self::Skipped),
            "no_template" => Ok(Self::NoTemplate),
            "max_daily_reached" => Ok(Self::MaxDailyReached),
            "failed" => Ok(Self::Failed),
            "cancelled_rescheduled" => Ok(Self::CancelledRescheduled),
            "cancelled_user_replied" => Ok(Self::CancelledUserReplied),
            other => anyhow::bail!("Unknown reminder status: {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    /// Created by the inactivity scanner or the post-reply scheduler.
    Auto,
    /// Requested explicitly, by an operator or by the AI via tool call.
    Manual,
}

impl ReminderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => anyhow::bail!("Unknown reminder kind: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: String,
    pub business_id: String,
    pub contact_phone: String,
    pub config_id: String,
    pub kind: ReminderKind,
    pub attempt_number: u32,
    pub scheduled_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub custom_message: Option<String>,
    pub last_error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const REMINDER_COLUMNS: &str = "id, business_id, contact_phone, config_id, kind, attempt_number, \
     scheduled_at, status, custom_message, last_error, executed_at, created_at";

fn map_reminder_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let kind_raw: String = row.get(4)?;
    let attempt: i64 = row.get(5)?;
    let status_raw: String = row.get(7)?;
    let executed_raw: Option<String> = row.get(10)?;
    Ok(Reminder {
        id: row.get(0)?,
        business_id: row.get(1)?,
        contact_phone: row.get(2)?,
        config_id: row.get(3)?,
        kind: ReminderKind::parse(&kind_raw).map_err(sql_conversion_error)?,
        attempt_number: attempt as u32,
        scheduled_at: parse_rfc3339(&row.get::<_, String>(6)?).map_err(sql_conversion_error)?,
        status: ReminderStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        custom_message: row.get(8)?,
        last_error: row.get(9)?,
        executed_at: executed_raw
            .map(|raw| parse_rfc3339(&raw).map_err(sql_conversion_error))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(11)?).map_err(sql_conversion_error)?,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn insert_reminder(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    config_id: &str,
    kind: ReminderKind,
    attempt_number: u32,
    scheduled_at: DateTime<Utc>,
    custom_message: Option<&str>,
) -> Result<Reminder> {
    let reminder = Reminder {
        id: Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        contact_phone: contact_phone.to_string(),
        config_id: config_id.to_string(),
        kind,
        attempt_number,
        scheduled_at,
        status: ReminderStatus::Pending,
        custom_message: custom_message.map(str::to_string),
        last_error: None,
        executed_at: None,
        created_at: Utc::now(),
    };

    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO reminders
                (id, business_id, contact_phone, config_id, kind, attempt_number,
                 scheduled_at, status, custom_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)",
            params![
                reminder.id,
                reminder.business_id,
                reminder.contact_phone,
                reminder.config_id,
                reminder.kind.as_str(),
                i64::from(reminder.attempt_number),
                reminder.scheduled_at.to_rfc3339(),
                reminder.custom_message,
                reminder.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert reminder")?;
        Ok(())
    })?;

    Ok(reminder)
}

/// Atomically supersede any pending reminder for the contact with a new
/// pending one. Cancel and insert share one transaction, so two schedulers
/// racing for the same contact serialize instead of leaving two pending
/// rows; the partial unique index on pending rows backstops the invariant.
/// Returns the new reminder and how many rows were superseded.
#[allow(clippy::too_many_arguments)]
pub fn replace_pending(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    config_id: &str,
    kind: ReminderKind,
    attempt_number: u32,
    scheduled_at: DateTime<Utc>,
    custom_message: Option<&str>,
) -> Result<(Reminder, usize)> {
    let reminder = Reminder {
        id: Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        contact_phone: contact_phone.to_string(),
        config_id: config_id.to_string(),
        kind,
        attempt_number,
        scheduled_at,
        status: ReminderStatus::Pending,
        custom_message: custom_message.map(str::to_string),
        last_error: None,
        executed_at: None,
        created_at: Utc::now(),
    };

    let cancelled = with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;
        let cancelled = tx
            .execute(
                "UPDATE reminders SET status = 'cancelled_rescheduled'
                 WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'pending'",
                params![business_id, contact_phone],
            )
            .context("Failed to supersede pending reminders")?;
        tx.execute(
            "INSERT INTO reminders
                (id, business_id, contact_phone, config_id, kind, attempt_number,
                 scheduled_at, status, custom_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)",
            params![
                reminder.id,
                reminder.business_id,
                reminder.contact_phone,
                reminder.config_id,
                reminder.kind.as_str(),
                i64::from(reminder.attempt_number),
                reminder.scheduled_at.to_rfc3339(),
                reminder.custom_message,
                reminder.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert replacement reminder")?;
        tx.commit().context("Failed to commit reminder replacement")?;
        Ok(cancelled)
    })?;

    Ok((reminder, cancelled))
}

/// Pending reminders for one contact, soonest first.
pub fn pending_for_contact(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
) -> Result<Vec<Reminder>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'pending'
             ORDER BY scheduled_at"
        ))?;
        let rows = stmt.query_map(params![business_id, contact_phone], map_reminder_row)?;
        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    })
}

/// Cancel every pending reminder for a contact, recording why. Returns the
/// number of rows cancelled.
pub fn cancel_pending(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    new_status: ReminderStatus,
) -> Result<usize> {
    anyhow::ensure!(
        matches!(
            new_status,
            ReminderStatus::CancelledRescheduled | ReminderStatus::CancelledUserReplied
        ),
        "cancel_pending requires a cancellation status, got {}",
        new_status.as_str()
    );
    with_connection(config, |conn| {
        let changed = conn
            .execute(
                "UPDATE reminders SET status = ?3
                 WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'pending'",
                params![business_id, contact_phone, new_status.as_str()],
            )
            .context("Failed to cancel pending reminders")?;
        Ok(changed)
    })
}

/// Pending reminders whose scheduled time has passed, soonest first.
pub fn due_pending(config: &Config, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reminder>> {
    let lim = i64::try_from(limit.max(1)).context("Due limit overflow")?;
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339(), lim], map_reminder_row)?;
        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    })
}

/// Move a pending reminder into a terminal state. Returns false when the
/// reminder was no longer pending (lost the race to a cancel or another
/// worker), in which case nothing changed.
pub fn transition(
    config: &Config,
    reminder_id: &str,
    to: ReminderStatus,
    error: Option<&str>,
    executed_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    anyhow::ensure!(
        to.is_terminal(),
        "transition target must be terminal, got {}",
        to.as_str()
    );
    with_connection(config, |conn| {
        let changed = conn
            .execute(
                "UPDATE reminders
                 SET status = ?2, last_error = ?3, executed_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    reminder_id,
                    to.as_str(),
                    error.map(|e| truncate_with_ellipsis(e, 500)),
                    executed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to transition reminder")?;
        Ok(changed > 0)
    })
}

/// Push a still-pending reminder to a later time. Returns false when the
/// reminder already left the pending state.
pub fn reschedule(config: &Config, reminder_id: &str, new_at: DateTime<Utc>) -> Result<bool> {
    with_connection(config, |conn| {
        let changed = conn
            .execute(
                "UPDATE reminders SET scheduled_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![reminder_id, new_at.to_rfc3339()],
            )
            .context("Failed to reschedule reminder")?;
        Ok(changed > 0)
    })
}

/// Reminders executed for a contact within [start, end), the business-local
/// day bounds, converted to UTC by the caller.
pub fn executed_count_between(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u32> {
    with_connection(config, |conn| {
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM reminders
                 WHERE business_id = ?1 AND contact_phone = ?2 AND status = 'executed'
                   AND executed_at >= ?3 AND executed_at < ?4",
                params![
                    business_id,
                    contact_phone,
                    start.to_rfc3339(),
                    end.to_rfc3339()
                ],
                |row| row.get(0),
            )
            .context("Failed to count executed reminders")?;
        Ok(count as u32)
    })
}

pub fn get_reminder(config: &Config, reminder_id: &str) -> Result<Option<Reminder>> {
    with_connection(config, |conn| {
        conn.query_row(
            &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"),
            params![reminder_id],
            map_reminder_row,
        )
        .optional()
        .context("Failed to load reminder")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::test_config;
    use chrono::Duration;
    use tempfile::TempDir;

    fn seed(config: &Config, at: DateTime<Utc>) -> Reminder {
        insert_reminder(
            config,
            "biz-1",
            "+51999000111",
            "cfg-1",
            ReminderKind::Auto,
            1,
            at,
            None,
        )
        .unwrap()
    }

    #[test]
    fn transition_is_single_winner() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let reminder = seed(&config, Utc::now());

        assert!(transition(
            &config,
            &reminder.id,
            ReminderStatus::Executed,
            None,
            Some(Utc::now()),
        )
        .unwrap());

        // Second transition loses: terminal states are absorbing.
        assert!(!transition(
            &config,
            &reminder.id,
            ReminderStatus::Failed,
            Some("late failure"),
            None,
        )
        .unwrap());

        let row = get_reminder(&config, &reminder.id).unwrap().unwrap();
        assert_eq!(row.status, ReminderStatus::Executed);
        assert!(row.executed_at.is_some());
        assert!(row.last_error.is_none());
    }

    #[test]
    fn transition_rejects_pending_target() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let reminder = seed(&config, Utc::now());

        assert!(
            transition(&config, &reminder.id, ReminderStatus::Pending, None, None).is_err()
        );
    }

    #[test]
    fn cancel_pending_only_touches_pending_rows() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        let executed = seed(&config, Utc::now());
        transition(
            &config,
            &executed.id,
            ReminderStatus::Executed,
            None,
            Some(Utc::now()),
        )
        .unwrap();
        let pending = seed(&config, Utc::now() + Duration::hours(4));

        let cancelled = cancel_pending(
            &config,
            "biz-1",
            "+51999000111",
            ReminderStatus::CancelledUserReplied,
        )
        .unwrap();
        assert_eq!(cancelled, 1);

        assert_eq!(
            get_reminder(&config, &pending.id).unwrap().unwrap().status,
            ReminderStatus::CancelledUserReplied
        );
        assert_eq!(
            get_reminder(&config, &executed.id).unwrap().unwrap().status,
            ReminderStatus::Executed
        );
    }

    #[test]
    fn cancel_pending_rejects_non_cancellation_status() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        assert!(cancel_pending(
            &config,
            "biz-1",
            "+51999000111",
            ReminderStatus::Executed
        )
        .is_err());
    }

    #[test]
    fn due_pending_respects_schedule_and_limit() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let now = Utc::now();

        let past = seed(&config, now - Duration::minutes(10));
        insert_reminder(
            &config,
            "biz-1",
            "+51999000222",
            "cfg-1",
            ReminderKind::Auto,
            1,
            now + Duration::hours(2),
            None,
        )
        .unwrap();

        let due = due_pending(&config, now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);
    }

    #[test]
    fn reschedule_moves_only_pending() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let reminder = seed(&config, Utc::now());
        let later = Utc::now() + Duration::hours(12);

        assert!(reschedule(&config, &reminder.id, later).unwrap());
        transition(&config, &reminder.id, ReminderStatus::Skipped, None, None).unwrap();
        assert!(!reschedule(&config, &reminder.id, Utc::now()).unwrap());
    }

    #[test]
    fn executed_count_window_is_half_open() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let day_start = Utc::now() - Duration::hours(6);
        let day_end = day_start + Duration::hours(24);

        for offset in [1_i64, 3, 5] {
            let r = seed(&config, day_start);
            transition(
                &config,
                &r.id,
                ReminderStatus::Executed,
                None,
                Some(day_start + Duration::hours(offset)),
            )
            .unwrap();
        }
        // One outside the window.
        let outside = seed(&config, day_start);
        transition(
            &config,
            &outside.id,
            ReminderStatus::Executed,
            None,
            Some(day_end + Duration::hours(1)),
        )
        .unwrap();

        let count =
            executed_count_between(&config, "biz-1", "+51999000111", day_start, day_end).unwrap();
        assert_eq!(count, 3);
    }
}
