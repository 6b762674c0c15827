//! Message log: every inbound and outbound message, in arrival order.
//!
//! Feeds three consumers: conversation context for the AI worker, the
//! last-inbound lookup for the messaging-window resolver, and the silence
//! detection of the inactivity scanner.

use crate::config::Config;
use crate::store::{parse_rfc3339, sql_conversion_error, with_connection};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => anyhow::bail!("Unknown message direction: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    pub id: String,
    pub business_id: String,
    pub contact_phone: String,
    pub direction: Direction,
    pub media_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub fn append_message(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    direction: Direction,
    media_type: &str,
    content: &str,
) -> Result<MessageLog> {
    append_message_at(
        config,
        business_id,
        contact_phone,
        direction,
        media_type,
        content,
        Utc::now(),
    )
}

pub fn append_message_at(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    direction: Direction,
    media_type: &str,
    content: &str,
    created_at: DateTime<Utc>,
) -> Result<MessageLog> {
    let entry = MessageLog {
        id: Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        contact_phone: contact_phone.to_string(),
        direction,
        media_type: media_type.to_string(),
        content: content.to_string(),
        created_at,
    };

    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO messages (id, business_id, contact_phone, direction, media_type, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.business_id,
                entry.contact_phone,
                entry.direction.as_str(),
                entry.media_type,
                entry.content,
                entry.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert message log entry")?;
        Ok(())
    })?;

    Ok(entry)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageLog> {
    let direction_raw: String = row.get(3)?;
    Ok(MessageLog {
        id: row.get(0)?,
        business_id: row.get(1)?,
        contact_phone: row.get(2)?,
        direction: Direction::parse(&direction_raw).map_err(sql_conversion_error)?,
        media_type: row.get(4)?,
        content: row.get(5)?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?).map_err(sql_conversion_error)?,
    })
}

/// Most recent `limit` messages for a contact, oldest first.
pub fn recent_messages(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    limit: usize,
) -> Result<Vec<MessageLog>> {
    let lim = i64::try_from(limit.max(1)).context("History limit overflow")?;
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, business_id, contact_phone, direction, media_type, content, created_at
             FROM messages
             WHERE business_id = ?1 AND contact_phone = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![business_id, contact_phone, lim], map_message_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    })
}

/// Timestamp of the last message for a contact, optionally filtered by direction.
pub fn last_message_at(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    direction: Option<Direction>,
) -> Result<Option<DateTime<Utc>>> {
    with_connection(config, |conn| {
        let raw: Option<String> = match direction {
            Some(dir) => conn
                .query_row(
                    "SELECT max(created_at) FROM messages
                     WHERE business_id = ?1 AND contact_phone = ?2 AND direction = ?3",
                    params![business_id, contact_phone, dir.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to query last message timestamp")?,
            None => conn
                .query_row(
                    "SELECT max(created_at) FROM messages
                     WHERE business_id = ?1 AND contact_phone = ?2",
                    params![business_id, contact_phone],
                    |row| row.get(0),
                )
                .context("Failed to query last message timestamp")?,
        };
        match raw {
            Some(raw) => Ok(Some(parse_rfc3339(&raw)?)),
            None => Ok(None),
        }
    })
}

/// Distinct contacts that have any message history with a business.
pub fn contacts_with_history(config: &Config, business_id: &str) -> Result<Vec<String>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT contact_phone FROM messages WHERE business_id = ?1 ORDER BY contact_phone",
        )?;
        let rows = stmt.query_map(params![business_id], |row| row.get(0))?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    })
}

/// True when any inbound message exists strictly after `reference`.
pub fn replied_after(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    reference: DateTime<Utc>,
) -> Result<bool> {
    with_connection(config, |conn| {
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM messages
                 WHERE business_id = ?1 AND contact_phone = ?2
                   AND direction = 'inbound' AND created_at > ?3",
                params![business_id, contact_phone, reference.to_rfc3339()],
                |row| row.get(0),
            )
            .context("Failed to query replies after reference")?;
        Ok(count > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::test_config;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn recent_messages_returns_ascending_tail() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let base = Utc::now();

        for (idx, text) in ["hola", "quiero el producto X", "precio?", "gracias"]
            .iter()
            .enumerate()
        {
            append_message_at(
                &config,
                "biz-1",
                "+51999000111",
                Direction::Inbound,
                "text",
                text,
                base + Duration::seconds(idx as i64),
            )
            .unwrap();
        }

        let tail = recent_messages(&config, "biz-1", "+51999000111", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "precio?");
        assert_eq!(tail[1].content, "gracias");
    }

    #[test]
    fn last_message_at_respects_direction() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let base = Utc::now();

        append_message_at(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Inbound,
            "text",
            "hola",
            base,
        )
        .unwrap();
        append_message_at(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Outbound,
            "text",
            "¡Hola! ¿En qué te ayudo?",
            base + Duration::minutes(1),
        )
        .unwrap();

        let last_in =
            last_message_at(&config, "biz-1", "+51999000111", Some(Direction::Inbound)).unwrap();
        let last_any = last_message_at(&config, "biz-1", "+51999000111", None).unwrap();
        assert_eq!(last_in.unwrap(), base.with_timezone(&Utc));
        assert!(last_any.unwrap() > last_in.unwrap());

        assert!(
            last_message_at(&config, "biz-1", "+00000000000", None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn replied_after_detects_inbound_only() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let base = Utc::now();

        append_message_at(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Outbound,
            "text",
            "¿Sigues ahí?",
            base + Duration::minutes(5),
        )
        .unwrap();

        assert!(!replied_after(&config, "biz-1", "+51999000111", base).unwrap());

        append_message_at(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Inbound,
            "text",
            "sí",
            base + Duration::minutes(6),
        )
        .unwrap();
        assert!(replied_after(&config, "biz-1", "+51999000111", base).unwrap());
    }

    #[test]
    fn contacts_with_history_deduplicates() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        for contact in ["+51999000111", "+51999000111", "+51999000222"] {
            append_message(&config, "biz-1", contact, Direction::Inbound, "text", "hola").unwrap();
        }

        let contacts = contacts_with_history(&config, "biz-1").unwrap();
        assert_eq!(contacts, vec!["+51999000111", "+51999000222"]);
    }
}
