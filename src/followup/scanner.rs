//! Inactivity scanner: periodically sweeps every business with follow-ups
//! enabled and schedules a reminder for contacts that went quiet. The send
//! itself stays in the worker, so all gating (hours, cap, window) applies
//! uniformly no matter who created the reminder.

use crate::config::Config;
use crate::followup::{self, delay_for_attempt, ScheduleOutcome, ScheduleRequest};
use crate::store::{self, Direction, FollowUpConfig, ReminderKind, TriggerMode};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub async fn run(config: Arc<Config>) -> Result<()> {
    let interval = std::time::Duration::from_secs(config.followup.scan_interval_secs.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        scan_interval_secs = config.followup.scan_interval_secs,
        "Inactivity scanner started"
    );

    loop {
        ticker.tick().await;
        crate::health::mark_component_ok("inactivity-scanner");

        match scan_once(&config) {
            Ok(scheduled) if scheduled > 0 => {
                tracing::info!(scheduled, "Inactivity scan scheduled follow-ups");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!("Inactivity scan failed: {error:#}");
                crate::health::mark_component_error("inactivity-scanner", &format!("{error:#}"));
            }
        }
    }
}

/// One full sweep; returns how many follow-ups were scheduled.
pub fn scan_once(config: &Config) -> Result<usize> {
    let now = Utc::now();
    let mut scheduled = 0;

    for fu in store::business::enabled_followup_configs(config)? {
        let contacts = store::messages::contacts_with_history(config, &fu.business_id)?;
        for contact in contacts {
            match consider_contact(config, &fu, &contact, now) {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        business = fu.business_id,
                        contact,
                        "Skipping contact in scan: {error:#}"
                    );
                }
            }
        }
    }
    Ok(scheduled)
}

fn consider_contact(
    config: &Config,
    fu: &FollowUpConfig,
    contact: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    // One pending reminder per contact; an existing one owns the contact.
    if !store::reminders::pending_for_contact(config, &fu.business_id, contact)?.is_empty() {
        return Ok(false);
    }

    let Some(reference) = silence_reference(config, fu, contact)? else {
        return Ok(false);
    };

    // Only the contact's own reply resets the clock.
    if store::messages::replied_after(config, &fu.business_id, contact, reference)? {
        return Ok(false);
    }

    let required = delay_for_attempt(fu, 1);
    if now - reference < required {
        return Ok(false);
    }

    // Scheduled a minute out rather than re-deriving the ladder delay: the
    // contact has already been silent at least that long.
    let outcome = followup::schedule_follow_up(
        config,
        &ScheduleRequest {
            business_id: &fu.business_id,
            contact_phone: contact,
            kind: ReminderKind::Auto,
            delay_override_minutes: Some(1),
            custom_message: None,
        },
    )?;
    Ok(matches!(outcome, ScheduleOutcome::Scheduled(_)))
}

/// The timestamp silence is measured from, per trigger mode.
fn silence_reference(
    config: &Config,
    fu: &FollowUpConfig,
    contact: &str,
) -> Result<Option<DateTime<Utc>>> {
    let direction = match fu.trigger_mode {
        TriggerMode::UserSilence => Some(Direction::Outbound),
        TriggerMode::AgentSilence => Some(Direction::Inbound),
        TriggerMode::Either => None,
    };
    store::messages::last_message_at(config, &fu.business_id, contact, direction)
}
