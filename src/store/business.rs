//! Business, channel instance, follow-up configuration, and template rows.
//!
//! These entities are edited by the (out-of-scope) management API; the
//! dispatch subsystem reads them and tests seed them directly.

use crate::config::Config;
use crate::store::{parse_rfc3339, sql_conversion_error, with_connection};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

#[derive(Debug, Clone)]
pub struct Business {
    pub id: String,
    pub name: String,
    pub timezone: String,
    pub bot_enabled: bool,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelProvider {
    /// WhatsApp Business Cloud API. Free-form sends are only allowed inside a
    /// rolling 24h window since the contact's last inbound message.
    WhatsappCloud,
    /// Self-hosted WhatsApp Web bridge; no messaging-window restriction.
    Bridge,
}

impl ChannelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhatsappCloud => "whatsapp_cloud",
            Self::Bridge => "bridge",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "whatsapp_cloud" => Ok(Self::WhatsappCloud),
            "bridge" => Ok(Self::Bridge),
            other => anyhow::bail!("Unknown channel provider: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInstance {
    pub id: String,
    pub business_id: String,
    pub provider: ChannelProvider,
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Contact went silent after the agent's last reply.
    UserSilence,
    /// Agent went silent after the contact's last message.
    AgentSilence,
    /// Whichever side spoke last, silence afterward qualifies.
    Either,
}

impl TriggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserSilence => "user_silence",
            Self::AgentSilence => "agent_silence",
            Self::Either => "either",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "agent_silence" => Self::AgentSilence,
            "either" => Self::Either,
            _ => Self::UserSilence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FollowUpConfig {
    pub id: String,
    pub business_id: String,
    pub enabled: bool,
    /// Allowed local-time window for proactive sends, [start, end) hours.
    pub allowed_start_hour: u32,
    pub allowed_end_hour: u32,
    pub weekends_enabled: bool,
    pub max_daily_attempts: u32,
    /// Explicit per-attempt delays in minutes; empty means use the
    /// first/second/third fallback fields.
    pub delays_minutes: Vec<i64>,
    pub first_delay_minutes: i64,
    pub second_delay_minutes: i64,
    pub third_delay_minutes: i64,
    /// 1 = casual reminder .. 3 = urgency/scarcity framing.
    pub pressure_level: u8,
    pub trigger_mode: TriggerMode,
}

impl FollowUpConfig {
    pub fn for_business(business_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_id: business_id.to_string(),
            enabled: true,
            allowed_start_hour: 9,
            allowed_end_hour: 21,
            weekends_enabled: true,
            max_daily_attempts: 3,
            delays_minutes: Vec::new(),
            first_delay_minutes: 30,
            second_delay_minutes: 240,
            third_delay_minutes: 1440,
            pressure_level: 1,
            trigger_mode: TriggerMode::UserSilence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateCategory {
    Marketing,
    Utility,
    Other,
}

impl TemplateCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Marketing => "marketing",
            Self::Utility => "utility",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "marketing" => Self::Marketing,
            "utility" => Self::Utility,
            _ => Self::Other,
        }
    }

    /// Selection preference: marketing first, then utility, then the rest.
    pub fn rank(self) -> u8 {
        match self {
            Self::Marketing => 0,
            Self::Utility => 1,
            Self::Other => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub business_id: String,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub status: String,
    pub body: String,
}

pub fn upsert_business(config: &Config, business: &Business) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO businesses (id, name, timezone, bot_enabled, system_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               timezone = excluded.timezone,
               bot_enabled = excluded.bot_enabled,
               system_prompt = excluded.system_prompt",
            params![
                business.id,
                business.name,
                business.timezone,
                i32::from(business.bot_enabled),
                business.system_prompt,
                business.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert business")?;
        Ok(())
    })
}

pub fn get_business(config: &Config, business_id: &str) -> Result<Business> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, name, timezone, bot_enabled, system_prompt, created_at
             FROM businesses WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![business_id])?;
        if let Some(row) = rows.next()? {
            Ok(Business {
                id: row.get(0)?,
                name: row.get(1)?,
                timezone: row.get(2)?,
                bot_enabled: row.get::<_, i64>(3)? != 0,
                system_prompt: row.get(4)?,
                created_at: parse_rfc3339(&row.get::<_, String>(5)?)
                    .map_err(sql_conversion_error)?,
            })
        } else {
            anyhow::bail!("Business '{business_id}' not found")
        }
    })
}

pub fn upsert_instance(config: &Config, instance: &ChannelInstance) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO channel_instances
               (id, business_id, provider, access_token, phone_number_id, base_url, api_key, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
               provider = excluded.provider,
               access_token = excluded.access_token,
               phone_number_id = excluded.phone_number_id,
               base_url = excluded.base_url,
               api_key = excluded.api_key,
               enabled = excluded.enabled",
            params![
                instance.id,
                instance.business_id,
                instance.provider.as_str(),
                instance.access_token,
                instance.phone_number_id,
                instance.base_url,
                instance.api_key,
                i32::from(instance.enabled),
            ],
        )
        .context("Failed to upsert channel instance")?;
        Ok(())
    })
}

fn map_instance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelInstance> {
    let provider_raw: String = row.get(2)?;
    Ok(ChannelInstance {
        id: row.get(0)?,
        business_id: row.get(1)?,
        provider: ChannelProvider::parse(&provider_raw).map_err(sql_conversion_error)?,
        access_token: row.get(3)?,
        phone_number_id: row.get(4)?,
        base_url: row.get(5)?,
        api_key: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
    })
}

pub fn get_instance(config: &Config, instance_id: &str) -> Result<ChannelInstance> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, business_id, provider, access_token, phone_number_id, base_url, api_key, enabled
             FROM channel_instances WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![instance_id])?;
        if let Some(row) = rows.next()? {
            map_instance_row(row).map_err(Into::into)
        } else {
            anyhow::bail!("Channel instance '{instance_id}' not found")
        }
    })
}

/// First enabled instance for a business; the window resolver and reminder
/// worker route proactive sends through it.
pub fn primary_instance(config: &Config, business_id: &str) -> Result<Option<ChannelInstance>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, business_id, provider, access_token, phone_number_id, base_url, api_key, enabled
             FROM channel_instances
             WHERE business_id = ?1 AND enabled = 1
             ORDER BY id ASC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![business_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(map_instance_row(row)?)),
            None => Ok(None),
        }
    })
}

pub fn upsert_followup_config(config: &Config, fu: &FollowUpConfig) -> Result<()> {
    let delays_json = serde_json::to_string(&fu.delays_minutes)?;
    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO followup_configs
               (id, business_id, enabled, allowed_start_hour, allowed_end_hour, weekends_enabled,
                max_daily_attempts, delays_minutes, first_delay_minutes, second_delay_minutes,
                third_delay_minutes, pressure_level, trigger_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(business_id) DO UPDATE SET
               enabled = excluded.enabled,
               allowed_start_hour = excluded.allowed_start_hour,
               allowed_end_hour = excluded.allowed_end_hour,
               weekends_enabled = excluded.weekends_enabled,
               max_daily_attempts = excluded.max_daily_attempts,
               delays_minutes = excluded.delays_minutes,
               first_delay_minutes = excluded.first_delay_minutes,
               second_delay_minutes = excluded.second_delay_minutes,
               third_delay_minutes = excluded.third_delay_minutes,
               pressure_level = excluded.pressure_level,
               trigger_mode = excluded.trigger_mode",
            params![
                fu.id,
                fu.business_id,
                i32::from(fu.enabled),
                fu.allowed_start_hour,
                fu.allowed_end_hour,
                i32::from(fu.weekends_enabled),
                fu.max_daily_attempts,
                delays_json,
                fu.first_delay_minutes,
                fu.second_delay_minutes,
                fu.third_delay_minutes,
                fu.pressure_level,
                fu.trigger_mode.as_str(),
            ],
        )
        .context("Failed to upsert follow-up config")?;
        Ok(())
    })
}

fn map_followup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowUpConfig> {
    let delays_raw: Option<String> = row.get(7)?;
    let delays_minutes = match delays_raw.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| sql_conversion_error(anyhow::anyhow!("Invalid delays JSON: {e}")))?,
        _ => Vec::new(),
    };
    let trigger_raw: String = row.get(12)?;

    Ok(FollowUpConfig {
        id: row.get(0)?,
        business_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        allowed_start_hour: row.get(3)?,
        allowed_end_hour: row.get(4)?,
        weekends_enabled: row.get::<_, i64>(5)? != 0,
        max_daily_attempts: row.get(6)?,
        delays_minutes,
        first_delay_minutes: row.get(8)?,
        second_delay_minutes: row.get(9)?,
        third_delay_minutes: row.get(10)?,
        pressure_level: row.get(11)?,
        trigger_mode: TriggerMode::parse(&trigger_raw),
    })
}

const FOLLOWUP_COLUMNS: &str = "id, business_id, enabled, allowed_start_hour, allowed_end_hour,
    weekends_enabled, max_daily_attempts, delays_minutes, first_delay_minutes,
    second_delay_minutes, third_delay_minutes, pressure_level, trigger_mode";

pub fn followup_config_for(config: &Config, business_id: &str) -> Result<Option<FollowUpConfig>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLLOWUP_COLUMNS} FROM followup_configs WHERE business_id = ?1"
        ))?;
        let mut rows = stmt.query(params![business_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(map_followup_row(row)?)),
            None => Ok(None),
        }
    })
}

/// All enabled follow-up configurations; the inactivity scanner sweeps these.
pub fn enabled_followup_configs(config: &Config) -> Result<Vec<FollowUpConfig>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLLOWUP_COLUMNS} FROM followup_configs WHERE enabled = 1"
        ))?;
        let rows = stmt.query_map([], map_followup_row)?;
        let mut configs = Vec::new();
        for row in rows {
            configs.push(row?);
        }
        Ok(configs)
    })
}

pub fn add_template(config: &Config, template: &Template) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO templates (id, business_id, name, language, category, status, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                template.id,
                template.business_id,
                template.name,
                template.language,
                template.category.as_str(),
                template.status,
                template.body,
            ],
        )
        .context("Failed to insert template")?;
        Ok(())
    })
}

pub fn approved_templates(config: &Config, business_id: &str) -> Result<Vec<Template>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, business_id, name, language, category, status, body
             FROM templates WHERE business_id = ?1 AND status = 'approved'",
        )?;
        let rows = stmt.query_map(params![business_id], |row| {
            let category_raw: String = row.get(4)?;
            Ok(Template {
                id: row.get(0)?,
                business_id: row.get(1)?,
                name: row.get(2)?,
                language: row.get(3)?,
                category: TemplateCategory::parse(&category_raw),
                status: row.get(5)?,
                body: row.get(6)?,
            })
        })?;
        let mut templates = Vec::new();
        for row in rows {
            templates.push(row?);
        }
        Ok(templates)
    })
}
