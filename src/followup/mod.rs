//! Follow-up scheduling: when a conversation goes quiet, a reminder is
//! queued to nudge the contact later. Scheduling enforces the single-pending
//! invariant (a new schedule cancels the old one) and the per-day attempt
//! cap; execution-time gating (allowed hours, messaging window) lives in
//! [`worker`].

use crate::config::Config;
use crate::store::{self, FollowUpConfig, Reminder, ReminderKind, ReminderStatus};
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

pub mod scanner;
pub mod tone;
pub mod worker;

/// Fallback when a business carries a bogus timezone string.
const DEFAULT_TZ: Tz = chrono_tz::America::Lima;

pub fn business_tz(timezone: &str) -> Tz {
    timezone.parse().unwrap_or_else(|_| {
        tracing::warn!("Unknown timezone '{timezone}', falling back to {DEFAULT_TZ}");
        DEFAULT_TZ
    })
}

/// UTC bounds [start, end) of the business-local calendar day containing `now`.
pub fn local_day_bounds(tz: Tz, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&tz);
    let date = local.date_naive();
    let start = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
        .earliest()
        .unwrap_or(local);
    let start_utc = start.with_timezone(&Utc);
    (start_utc, start_utc + Duration::days(1))
}

/// Delay before attempt `n` (1-based). The explicit list wins when present;
/// past its end, the last entry repeats.
pub fn delay_for_attempt(fu: &FollowUpConfig, attempt: u32) -> Duration {
    let minutes = if fu.delays_minutes.is_empty() {
        match attempt {
            0 | 1 => fu.first_delay_minutes,
            2 => fu.second_delay_minutes,
            _ => fu.third_delay_minutes,
        }
    } else {
        let idx = (attempt.max(1) as usize - 1).min(fu.delays_minutes.len() - 1);
        fu.delays_minutes[idx]
    };
    Duration::minutes(minutes.max(1))
}

/// True when `at` (business-local) falls inside the allowed send window.
pub fn within_allowed_hours<T: TimeZone>(fu: &FollowUpConfig, at: &DateTime<T>) -> bool {
    if !fu.weekends_enabled
        && matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
    {
        return false;
    }
    let hour = at.hour();
    hour >= fu.allowed_start_hour && hour < fu.allowed_end_hour
}

/// Next instant at or after `now` when sends become allowed: today's window
/// start if still ahead, else the start hour on the next permitted day.
pub fn next_allowed_start(fu: &FollowUpConfig, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let mut date = local.date_naive();

    if local.hour() >= fu.allowed_start_hour {
        date = date.succ_opt().unwrap_or(date);
    }
    for _ in 0..7 {
        let at_start = tz
            .from_local_datetime(
                &date
                    .and_hms_opt(fu.allowed_start_hour, 0, 0)
                    .unwrap_or_default(),
            )
            .earliest();
        if let Some(candidate) = at_start {
            if within_allowed_hours(fu, &candidate) && candidate.with_timezone(&Utc) > now {
                return candidate.with_timezone(&Utc);
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    // Degenerate config (e.g. start >= end); push a day out rather than spin.
    now + Duration::days(1)
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub business_id: &'a str,
    pub contact_phone: &'a str,
    pub kind: ReminderKind,
    /// Explicit delay in minutes (operator- or tool-provided); overrides the
    /// per-attempt ladder.
    pub delay_override_minutes: Option<i64>,
    pub custom_message: Option<&'a str>,
}

/// Outcome of a scheduling request.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Scheduled(Reminder),
    /// The per-day cap is already spent; nothing was created.
    DailyCapReached,
    /// Follow-ups are disabled for this business (auto kind only).
    Disabled,
}

/// Schedule a follow-up for a contact. Any pending reminder for the same
/// contact is cancelled first (`cancelled_rescheduled`), so at most one
/// pending reminder exists per contact at any time.
pub fn schedule_follow_up(config: &Config, req: &ScheduleRequest<'_>) -> Result<ScheduleOutcome> {
    let fu = store::business::followup_config_for(config, req.business_id)?
        .unwrap_or_else(|| FollowUpConfig::for_business(req.business_id));

    if !fu.enabled && req.kind == ReminderKind::Auto {
        return Ok(ScheduleOutcome::Disabled);
    }

    let business = store::business::get_business(config, req.business_id)?;
    let tz = business_tz(&business.timezone);
    let now = Utc::now();
    let (day_start, day_end) = local_day_bounds(tz, now);
    let executed_today = store::reminders::executed_count_between(
        config,
        req.business_id,
        req.contact_phone,
        day_start,
        day_end,
    )?;
    if executed_today >= fu.max_daily_attempts {
        tracing::debug!(
            business = req.business_id,
            contact = req.contact_phone,
            executed_today,
            "Daily follow-up cap reached, not scheduling"
        );
        return Ok(ScheduleOutcome::DailyCapReached);
    }

    let attempt_number = executed_today + 1;
    let delay = match req.delay_override_minutes {
        Some(minutes) => Duration::minutes(minutes.max(1)),
        None => delay_for_attempt(&fu, attempt_number),
    };

    // Cancel and create share one transaction so two schedulers racing for
    // the same contact cannot leave two pending rows.
    let (reminder, cancelled) = store::reminders::replace_pending(
        config,
        req.business_id,
        req.contact_phone,
        &fu.id,
        req.kind,
        attempt_number,
        now + delay,
        req.custom_message,
    )?;
    if cancelled > 0 {
        tracing::debug!(
            business = req.business_id,
            contact = req.contact_phone,
            cancelled,
            "Superseded pending follow-up"
        );
    }
    tracing::info!(
        business = req.business_id,
        contact = req.contact_phone,
        attempt = attempt_number,
        scheduled_at = %reminder.scheduled_at,
        "Follow-up scheduled"
    );
    Ok(ScheduleOutcome::Scheduled(reminder))
}

/// Cancel everything pending for a contact because they replied.
pub fn cancel_pending_follow_ups(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
) -> Result<usize> {
    let cancelled = store::reminders::cancel_pending(
        config,
        business_id,
        contact_phone,
        ReminderStatus::CancelledUserReplied,
    )?;
    if cancelled > 0 {
        tracing::info!(
            business = business_id,
            contact = contact_phone,
            cancelled,
            "Cancelled pending follow-ups after reply"
        );
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{seed_business, test_config};
    use tempfile::TempDir;

    fn fu() -> FollowUpConfig {
        FollowUpConfig::for_business("biz-1")
    }

    #[test]
    fn delay_ladder_uses_fallback_fields() {
        let fu = fu();
        assert_eq!(delay_for_attempt(&fu, 1), Duration::minutes(30));
        assert_eq!(delay_for_attempt(&fu, 2), Duration::minutes(240));
        assert_eq!(delay_for_attempt(&fu, 3), Duration::minutes(1440));
        assert_eq!(delay_for_attempt(&fu, 7), Duration::minutes(1440));
    }

    #[test]
    fn delay_ladder_prefers_explicit_list() {
        let mut fu = fu();
        fu.delays_minutes = vec![15, 60];
        assert_eq!(delay_for_attempt(&fu, 1), Duration::minutes(15));
        assert_eq!(delay_for_attempt(&fu, 2), Duration::minutes(60));
        // Past the end, last entry repeats.
        assert_eq!(delay_for_attempt(&fu, 5), Duration::minutes(60));
    }

    #[test]
    fn allowed_hours_are_half_open_local() {
        let fu = fu();
        let tz = business_tz("America/Lima");
        // 2026-01-14 is a Wednesday.
        let morning = tz.with_ymd_and_hms(2026, 1, 14, 9, 0, 0).unwrap();
        let night = tz.with_ymd_and_hms(2026, 1, 14, 21, 0, 0).unwrap();
        let noon = tz.with_ymd_and_hms(2026, 1, 14, 12, 30, 0).unwrap();
        assert!(within_allowed_hours(&fu, &morning));
        assert!(within_allowed_hours(&fu, &noon));
        assert!(!within_allowed_hours(&fu, &night));
    }

    #[test]
    fn weekends_gate_applies_in_local_time() {
        let mut fu = fu();
        fu.weekends_enabled = false;
        let tz = business_tz("America/Lima");
        // 2026-01-17 is a Saturday.
        let saturday = tz.with_ymd_and_hms(2026, 1, 17, 12, 0, 0).unwrap();
        assert!(!within_allowed_hours(&fu, &saturday));

        let next = next_allowed_start(&fu, tz, saturday.with_timezone(&Utc));
        let next_local = next.with_timezone(&tz);
        assert_eq!(next_local.weekday(), Weekday::Mon);
        assert_eq!(next_local.hour(), 9);
    }

    #[test]
    fn next_allowed_start_later_today_when_early() {
        let fu = fu();
        let tz = business_tz("America/Lima");
        let dawn = tz.with_ymd_and_hms(2026, 1, 14, 6, 0, 0).unwrap();
        let next = next_allowed_start(&fu, tz, dawn.with_timezone(&Utc));
        let local = next.with_timezone(&tz);
        assert_eq!(local.date_naive(), dawn.date_naive());
        assert_eq!(local.hour(), 9);
    }

    #[test]
    fn local_day_bounds_cover_24h() {
        let tz = business_tz("America/Lima");
        let now = Utc::now();
        let (start, end) = local_day_bounds(tz, now);
        assert_eq!(end - start, Duration::days(1));
        assert!(start <= now && now < end);
    }

    #[test]
    fn schedule_replaces_pending_and_keeps_single_invariant() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");

        let req = ScheduleRequest {
            business_id: "biz-1",
            contact_phone: "+51999000111",
            kind: ReminderKind::Auto,
            delay_override_minutes: None,
            custom_message: None,
        };
        let first = match schedule_follow_up(&config, &req).unwrap() {
            ScheduleOutcome::Scheduled(r) => r,
            other => panic!("expected scheduled, got {other:?}"),
        };
        let second = match schedule_follow_up(&config, &req).unwrap() {
            ScheduleOutcome::Scheduled(r) => r,
            other => panic!("expected scheduled, got {other:?}"),
        };

        let pending =
            store::reminders::pending_for_contact(&config, "biz-1", "+51999000111").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        let old = store::reminders::get_reminder(&config, &first.id)
            .unwrap()
            .unwrap();
        assert_eq!(old.status, ReminderStatus::CancelledRescheduled);
    }

    #[test]
    fn schedule_honors_daily_cap() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");
        let mut fu = FollowUpConfig::for_business("biz-1");
        fu.max_daily_attempts = 1;
        store::business::upsert_followup_config(&config, &fu).unwrap();

        // One executed today spends the cap.
        let r = store::reminders::insert_reminder(
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
        store::reminders::transition(
            &config,
            &r.id,
            ReminderStatus::Executed,
            None,
            Some(Utc::now()),
        )
        .unwrap();

        let req = ScheduleRequest {
            business_id: "biz-1",
            contact_phone: "+51999000111",
            kind: ReminderKind::Auto,
            delay_override_minutes: None,
            custom_message: None,
        };
        assert!(matches!(
            schedule_follow_up(&config, &req).unwrap(),
            ScheduleOutcome::DailyCapReached
        ));
    }

    #[test]
    fn disabled_config_blocks_auto_but_not_manual() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");
        let mut fu = FollowUpConfig::for_business("biz-1");
        fu.enabled = false;
        store::business::upsert_followup_config(&config, &fu).unwrap();

        let mut req = ScheduleRequest {
            business_id: "biz-1",
            contact_phone: "+51999000111",
            kind: ReminderKind::Auto,
            delay_override_minutes: None,
            custom_message: None,
        };
        assert!(matches!(
            schedule_follow_up(&config, &req).unwrap(),
            ScheduleOutcome::Disabled
        ));

        req.kind = ReminderKind::Manual;
        req.delay_override_minutes = Some(60);
        req.custom_message = Some("Te dejo el catálogo, ¿lo viste?");
        assert!(matches!(
            schedule_follow_up(&config, &req).unwrap(),
            ScheduleOutcome::Scheduled(_)
        ));
    }

    #[test]
    fn second_attempt_uses_second_delay_after_first_executed() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");
        let fu = FollowUpConfig::for_business("biz-1");
        store::business::upsert_followup_config(&config, &fu).unwrap();

        let first = store::reminders::insert_reminder(
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
        store::reminders::transition(
            &config,
            &first.id,
            ReminderStatus::Executed,
            None,
            Some(Utc::now()),
        )
        .unwrap();

        let req = ScheduleRequest {
            business_id: "biz-1",
            contact_phone: "+51999000111",
            kind: ReminderKind::Auto,
            delay_override_minutes: None,
            custom_message: None,
        };
        let second = match schedule_follow_up(&config, &req).unwrap() {
            ScheduleOutcome::Scheduled(r) => r,
            other => panic!("expected scheduled, got {other:?}"),
        };
        assert_eq!(second.attempt_number, 2);
        let expected = Utc::now() + Duration::minutes(240);
        let drift = (second.scheduled_at - expected).num_seconds().abs();
        assert!(drift < 5, "second attempt should use the 4h delay");
    }

    #[test]
    fn concurrent_scheduling_keeps_single_pending() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        seed_business(&config, "biz-1");

        // Scanner tick and post-reply scheduling can fire at the same time
        // for one contact; whoever lands second must supersede, not add.
        for round in 0..20 {
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let config = config.clone();
                    let barrier = std::sync::Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let req = ScheduleRequest {
                            business_id: "biz-1",
                            contact_phone: "+51999000111",
                            kind: ReminderKind::Auto,
                            delay_override_minutes: None,
                            custom_message: None,
                        };
                        barrier.wait();
                        schedule_follow_up(&config, &req).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let pending =
                store::reminders::pending_for_contact(&config, "biz-1", "+51999000111").unwrap();
            assert_eq!(pending.len(), 1, "round {round}: pending reminders");
        }
    }
}
