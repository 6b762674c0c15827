//! Reminder execution worker: polls for due reminders and walks each one
//! through the gate sequence (enabled → allowed hours → daily cap →
//! messaging window) before sending. Every terminal outcome is recorded on
//! the reminder row; a reminder outside its allowed hours is rescheduled,
//! not consumed.

use crate::channels::client_for_instance;
use crate::config::Config;
use crate::followup::{
    business_tz, local_day_bounds, next_allowed_start, tone, within_allowed_hours,
};
use crate::providers::{provider_from_config, Provider};
use crate::store::{
    self, Direction, FollowUpConfig, Reminder, ReminderKind, ReminderStatus,
};
use crate::window;
use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;

pub async fn run(config: Arc<Config>) -> Result<()> {
    let poll = std::time::Duration::from_secs(config.followup.poll_secs.max(1));
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let provider: Option<Box<dyn Provider>> = provider_from_config(&config);
    let provider = provider.map(Arc::from);

    tracing::info!(
        poll_secs = config.followup.poll_secs,
        "Reminder worker started"
    );

    loop {
        ticker.tick().await;
        crate::health::mark_component_ok("reminder-worker");

        let due = match store::reminders::due_pending(&config, Utc::now(), config.followup.max_batch)
        {
            Ok(due) => due,
            Err(error) => {
                tracing::error!("Failed to poll due reminders: {error:#}");
                crate::health::mark_component_error("reminder-worker", &format!("{error:#}"));
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }
        tracing::debug!(count = due.len(), "Processing due reminders");

        futures_util::stream::iter(due)
            .for_each_concurrent(config.followup.max_concurrent.max(1), |reminder| {
                let config = Arc::clone(&config);
                let provider = provider.clone();
                async move {
                    let id = reminder.id.clone();
                    if let Err(error) =
                        execute_reminder(&config, provider.as_deref(), reminder).await
                    {
                        // Store or configuration trouble before any send was
                        // attempted; the row stays pending for the next poll.
                        // Send failures are settled inside execute_reminder.
                        tracing::error!(reminder = %id, "Reminder execution error: {error:#}");
                    }
                }
            })
            .await;
    }
}

async fn execute_reminder(
    config: &Config,
    provider: Option<&dyn Provider>,
    reminder: Reminder,
) -> Result<()> {
    let fu = store::business::followup_config_for(config, &reminder.business_id)?
        .unwrap_or_else(|| FollowUpConfig::for_business(&reminder.business_id));

    if !fu.enabled && reminder.kind == ReminderKind::Auto {
        store::reminders::transition(config, &reminder.id, ReminderStatus::Skipped, None, None)?;
        tracing::debug!(reminder = %reminder.id, "Follow-ups disabled, skipped");
        return Ok(());
    }

    let business = store::business::get_business(config, &reminder.business_id)?;
    let tz = business_tz(&business.timezone);
    let now = Utc::now();
    let local_now = now.with_timezone(&tz);

    if !within_allowed_hours(&fu, &local_now) {
        let next = next_allowed_start(&fu, tz, now);
        if store::reminders::reschedule(config, &reminder.id, next)? {
            tracing::info!(
                reminder = %reminder.id,
                rescheduled_to = %next,
                "Outside allowed hours, rescheduled"
            );
        }
        return Ok(());
    }

    let (day_start, day_end) = local_day_bounds(tz, now);
    let executed_today = store::reminders::executed_count_between(
        config,
        &reminder.business_id,
        &reminder.contact_phone,
        day_start,
        day_end,
    )?;
    if executed_today >= fu.max_daily_attempts {
        store::reminders::transition(
            config,
            &reminder.id,
            ReminderStatus::MaxDailyReached,
            None,
            None,
        )?;
        tracing::info!(reminder = %reminder.id, "Daily cap reached, not sent");
        return Ok(());
    }

    let status = window::check_window_status(config, &reminder.business_id, &reminder.contact_phone)?;
    let instance = store::business::primary_instance(config, &reminder.business_id)?
        .ok_or_else(|| anyhow::anyhow!("No enabled channel instance"))?;
    let client = client_for_instance(&instance)?;
    let send_timeout = std::time::Duration::from_secs(config.reliability.channel_timeout_secs);

    let sent_body = if status.requires_template {
        let Some(template) = window::default_template(config, &reminder.business_id)? else {
            store::reminders::transition(
                config,
                &reminder.id,
                ReminderStatus::NoTemplate,
                None,
                None,
            )?;
            tracing::warn!(
                reminder = %reminder.id,
                "Messaging window closed and no approved template available"
            );
            return Ok(());
        };
        if let Err(error) = send_bounded(
            send_timeout,
            client.send_template(&reminder.contact_phone, &template),
        )
        .await
        {
            return settle_send_failure(config, &reminder, &error);
        }
        format!("[template:{}]", template.name)
    } else {
        let text = match reminder.custom_message.as_deref() {
            Some(custom) => custom.to_string(),
            None => {
                let context = recent_context(config, &reminder.business_id, &reminder.contact_phone)?;
                tone::follow_up_text(
                    provider,
                    &config.provider.model,
                    config.provider.temperature,
                    &business,
                    &fu,
                    reminder.attempt_number,
                    &context,
                )
                .await?
            }
        };
        if let Err(error) =
            send_bounded(send_timeout, client.send_text(&reminder.contact_phone, &text)).await
        {
            return settle_send_failure(config, &reminder, &error);
        }
        text
    };

    let won = store::reminders::transition(
        config,
        &reminder.id,
        ReminderStatus::Executed,
        None,
        Some(Utc::now()),
    )?;
    if !won {
        // The contact replied while the send was in flight; the message went
        // out anyway, so still log it.
        tracing::warn!(reminder = %reminder.id, "Reminder finished after losing its row");
    }
    store::messages::append_message(
        config,
        &reminder.business_id,
        &reminder.contact_phone,
        Direction::Outbound,
        "text",
        &sent_body,
    )?;
    tracing::info!(
        reminder = %reminder.id,
        attempt = reminder.attempt_number,
        "Follow-up sent"
    );
    Ok(())
}

async fn send_bounded(
    timeout: std::time::Duration,
    send: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| anyhow::anyhow!("Channel send timed out"))?
}

/// A failure on the channel itself is terminal: the message may already have
/// left, so the reminder is not retried.
fn settle_send_failure(config: &Config, reminder: &Reminder, error: &anyhow::Error) -> Result<()> {
    store::reminders::transition(
        config,
        &reminder.id,
        ReminderStatus::Failed,
        Some(&format!("{error:#}")),
        None,
    )?;
    tracing::warn!(reminder = %reminder.id, "Follow-up send failed: {error:#}");
    Ok(())
}

fn recent_context(config: &Config, business_id: &str, contact_phone: &str) -> Result<String> {
    let recent = store::messages::recent_messages(config, business_id, contact_phone, 6)?;
    Ok(recent
        .iter()
        .map(|m| {
            let speaker = match m.direction {
                Direction::Inbound => "Cliente",
                Direction::Outbound => "Vendedor",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

// The gate sequence itself is exercised through the store in
// `followup::tests`; here we only pin the pure context formatting.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{seed_business, test_config};
    use tempfile::TempDir;

    #[test]
    fn recent_context_labels_speakers() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");

        store::messages::append_message(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Inbound,
            "text",
            "hola, precio?",
        )
        .unwrap();
        store::messages::append_message(
            &config,
            "biz-1",
            "+51999000111",
            Direction::Outbound,
            "text",
            "Cuesta 50 soles",
        )
        .unwrap();

        let context = recent_context(&config, "biz-1", "+51999000111").unwrap();
        assert_eq!(context, "Cliente: hola, precio?\nVendedor: Cuesta 50 soles");
    }

    #[tokio::test]
    async fn disabled_auto_reminder_is_skipped_without_send() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");
        let mut fu = FollowUpConfig::for_business("biz-1");
        fu.enabled = false;
        store::business::upsert_followup_config(&config, &fu).unwrap();

        let reminder = store::reminders::insert_reminder(
            &config,
            "biz-1",
            "+51999000111",
            &fu.id,
            ReminderKind::Auto,
            1,
            Utc::now(),
            None,
        )
        .unwrap();

        execute_reminder(&config, None, reminder.clone()).await.unwrap();
        let row = store::reminders::get_reminder(&config, &reminder.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReminderStatus::Skipped);
    }

    #[tokio::test]
    async fn closed_window_without_template_is_a_hard_stop() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");
        crate::store::test_support::seed_instance(&config, "biz-1", "inst-1");
        let mut fu = FollowUpConfig::for_business("biz-1");
        // Keep the hours gate open regardless of when the test runs.
        fu.allowed_start_hour = 0;
        fu.allowed_end_hour = 24;
        store::business::upsert_followup_config(&config, &fu).unwrap();

        // No inbound history: window requires a template, none approved.
        let reminder = store::reminders::insert_reminder(
            &config,
            "biz-1",
            "+51999000111",
            &fu.id,
            ReminderKind::Auto,
            1,
            Utc::now(),
            None,
        )
        .unwrap();

        execute_reminder(&config, None, reminder.clone()).await.unwrap();
        let row = store::reminders::get_reminder(&config, &reminder.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReminderStatus::NoTemplate);
    }

    #[tokio::test]
    async fn channel_send_failure_is_terminal() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");

        // Bridge endpoint on a port nothing listens on: the send fails fast
        // with a connection error.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        store::business::upsert_instance(
            &config,
            &crate::store::ChannelInstance {
                id: "inst-1".into(),
                business_id: "biz-1".into(),
                provider: crate::store::ChannelProvider::Bridge,
                access_token: None,
                phone_number_id: None,
                base_url: Some(format!("http://127.0.0.1:{port}")),
                api_key: None,
                enabled: true,
            },
        )
        .unwrap();

        let mut fu = FollowUpConfig::for_business("biz-1");
        // Keep the hours gate open regardless of when the test runs.
        fu.allowed_start_hour = 0;
        fu.allowed_end_hour = 24;
        store::business::upsert_followup_config(&config, &fu).unwrap();

        let reminder = store::reminders::insert_reminder(
            &config,
            "biz-1",
            "+51999000111",
            &fu.id,
            ReminderKind::Manual,
            1,
            Utc::now(),
            Some("¿Seguimos con tu pedido?"),
        )
        .unwrap();

        // The send error is settled on the row, not propagated.
        execute_reminder(&config, None, reminder.clone()).await.unwrap();
        let row = store::reminders::get_reminder(&config, &reminder.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReminderStatus::Failed);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn store_error_leaves_reminder_pending() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        // No business row: execution fails before any send is attempted.
        let reminder = store::reminders::insert_reminder(
            &config,
            "ghost-biz",
            "+51999000111",
            "cfg-1",
            ReminderKind::Auto,
            1,
            Utc::now(),
            None,
        )
        .unwrap();

        assert!(execute_reminder(&config, None, reminder.clone())
            .await
            .is_err());
        let row = store::reminders::get_reminder(&config, &reminder.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReminderStatus::Pending);
    }
}
