//! SQLite persistence for the dispatch subsystem.
//!
//! One database file per workspace; every operation opens a connection through
//! [`with_connection`], which bootstraps the schema on first use. Timestamps
//! are stored as RFC3339 UTC text, structured columns as JSON.

use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub mod buffers;
pub mod business;
pub mod messages;
pub mod queue;
pub mod reminders;

pub use buffers::{BufferEntry, BufferStatus};
pub use business::{
    Business, ChannelInstance, ChannelProvider, FollowUpConfig, Template, TemplateCategory,
    TriggerMode,
};
pub use messages::{Direction, MessageLog};
pub use queue::{DispatchJob, JobStatus, NewJob, Priority};
pub use reminders::{Reminder, ReminderKind, ReminderStatus};

pub(crate) fn with_connection<T>(
    config: &Config,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let db_path = config.workspace_dir.join("chasqui.db");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create workspace dir: {}", parent.display()))?;
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open dispatch DB: {}", db_path.display()))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;

    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;

         CREATE TABLE IF NOT EXISTS businesses (
            id            TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            timezone      TEXT NOT NULL DEFAULT 'America/Lima',
            bot_enabled   INTEGER NOT NULL DEFAULT 1,
            system_prompt TEXT,
            created_at    TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS channel_instances (
            id              TEXT PRIMARY KEY,
            business_id     TEXT NOT NULL REFERENCES businesses(id),
            provider        TEXT NOT NULL,
            access_token    TEXT,
            phone_number_id TEXT,
            base_url        TEXT,
            api_key         TEXT,
            enabled         INTEGER NOT NULL DEFAULT 1
         );
         CREATE INDEX IF NOT EXISTS idx_instances_business
            ON channel_instances(business_id);

         CREATE TABLE IF NOT EXISTS followup_configs (
            id                   TEXT PRIMARY KEY,
            business_id          TEXT NOT NULL UNIQUE REFERENCES businesses(id),
            enabled              INTEGER NOT NULL DEFAULT 1,
            allowed_start_hour   INTEGER NOT NULL DEFAULT 9,
            allowed_end_hour     INTEGER NOT NULL DEFAULT 21,
            weekends_enabled     INTEGER NOT NULL DEFAULT 1,
            max_daily_attempts   INTEGER NOT NULL DEFAULT 3,
            delays_minutes       TEXT,
            first_delay_minutes  INTEGER NOT NULL DEFAULT 30,
            second_delay_minutes INTEGER NOT NULL DEFAULT 240,
            third_delay_minutes  INTEGER NOT NULL DEFAULT 1440,
            pressure_level       INTEGER NOT NULL DEFAULT 1,
            trigger_mode         TEXT NOT NULL DEFAULT 'user_silence'
         );

         CREATE TABLE IF NOT EXISTS templates (
            id          TEXT PRIMARY KEY,
            business_id TEXT NOT NULL REFERENCES businesses(id),
            name        TEXT NOT NULL,
            language    TEXT NOT NULL DEFAULT 'es',
            category    TEXT NOT NULL DEFAULT 'utility',
            status      TEXT NOT NULL DEFAULT 'pending',
            body        TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_templates_business
            ON templates(business_id, status);

         CREATE TABLE IF NOT EXISTS messages (
            id            TEXT PRIMARY KEY,
            business_id   TEXT NOT NULL,
            contact_phone TEXT NOT NULL,
            direction     TEXT NOT NULL,
            media_type    TEXT NOT NULL DEFAULT 'text',
            content       TEXT NOT NULL,
            created_at    TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_contact
            ON messages(business_id, contact_phone, created_at);

         CREATE TABLE IF NOT EXISTS message_buffers (
            id                TEXT PRIMARY KEY,
            business_id       TEXT NOT NULL,
            contact_phone     TEXT NOT NULL,
            instance_id       TEXT NOT NULL,
            last_message_id   TEXT,
            fragments         TEXT NOT NULL,
            debounce_deadline TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'pending',
            processing_until  TEXT,
            last_error        TEXT,
            created_at        TEXT NOT NULL
         );
         -- One live buffer per contact; consumed/failed rows fall outside.
         CREATE UNIQUE INDEX IF NOT EXISTS idx_buffers_live
            ON message_buffers(business_id, contact_phone) WHERE status = 'pending';
         CREATE INDEX IF NOT EXISTS idx_buffers_deadline
            ON message_buffers(status, debounce_deadline);

         CREATE TABLE IF NOT EXISTS dispatch_jobs (
            id            TEXT PRIMARY KEY,
            business_id   TEXT NOT NULL,
            contact_phone TEXT NOT NULL,
            instance_id   TEXT NOT NULL,
            buffer_id     TEXT,
            message_id    TEXT,
            batch         TEXT NOT NULL,
            priority      INTEGER NOT NULL DEFAULT 1,
            attempts      INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL DEFAULT 3,
            available_at  TEXT NOT NULL,
            locked_until  TEXT,
            locked_by     TEXT,
            status        TEXT NOT NULL DEFAULT 'queued',
            last_error    TEXT,
            created_at    TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_jobs_due
            ON dispatch_jobs(status, available_at, priority);

         CREATE TABLE IF NOT EXISTS reminders (
            id             TEXT PRIMARY KEY,
            business_id    TEXT NOT NULL,
            contact_phone  TEXT NOT NULL,
            config_id      TEXT NOT NULL,
            kind           TEXT NOT NULL DEFAULT 'auto',
            attempt_number INTEGER NOT NULL DEFAULT 1,
            scheduled_at   TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'pending',
            custom_message TEXT,
            last_error     TEXT,
            executed_at    TEXT,
            created_at     TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_reminders_due
            ON reminders(status, scheduled_at);
         CREATE INDEX IF NOT EXISTS idx_reminders_contact
            ON reminders(business_id, contact_phone, status);
         -- At most one pending reminder per contact; scheduling replaces it.
         CREATE UNIQUE INDEX IF NOT EXISTS idx_reminders_pending
            ON reminders(business_id, contact_phone) WHERE status = 'pending';",
    )
    .context("Failed to initialize dispatch schema")?;

    f(&conn)
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in dispatch DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn test_config(tmp: &TempDir) -> Config {
        let config = Config {
            workspace_dir: tmp.path().join("workspace"),
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.workspace_dir).unwrap();
        config
    }

    pub fn seed_business(config: &Config, id: &str) -> Business {
        let business = Business {
            id: id.to_string(),
            name: format!("Tienda {id}"),
            timezone: "America/Lima".into(),
            bot_enabled: true,
            system_prompt: Some("Eres un vendedor amable.".into()),
            created_at: Utc::now(),
        };
        business::upsert_business(config, &business).unwrap();
        business
    }

    pub fn seed_instance(config: &Config, business_id: &str, id: &str) -> ChannelInstance {
        let instance = ChannelInstance {
            id: id.to_string(),
            business_id: business_id.to_string(),
            provider: ChannelProvider::WhatsappCloud,
            access_token: Some("token".into()),
            phone_number_id: Some("10001".into()),
            base_url: None,
            api_key: None,
            enabled: true,
        };
        business::upsert_instance(config, &instance).unwrap();
        instance
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_config;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        for _ in 0..2 {
            with_connection(&config, |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='reminders'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339("not-a-date").is_err());
        assert!(parse_rfc3339("2026-01-15T14:00:00Z").is_ok());
    }
}
