//! AI dispatch: turns a flushed message buffer into a provider conversation
//! and delivers the reply.
//!
//! The normal path is asynchronous: the buffer flush enqueues a durable job
//! and the worker loop claims it under a renewable lease. When the queue
//! cannot accept work (store outage, no live worker), the flush degrades to
//! processing the batch synchronously in-process, so a contact's message is
//! never silently dropped.

use crate::channels::{client_for_instance, ChannelClient};
use crate::config::Config;
use crate::followup::{self, business_tz, ScheduleOutcome, ScheduleRequest};
use crate::providers::{
    provider_from_config, ChatMessage, ChatResponse, Provider, ToolSpec,
};
use crate::store::{
    self, BufferEntry, Business, Direction, DispatchJob, NewJob, ReminderKind,
};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub mod events;

use events::{pacing_delay, parse_reply, SendEvent};

/// Last time any worker loop ticked, unix seconds. Zero = never.
static WORKER_ALIVE_AT: AtomicI64 = AtomicI64::new(0);

pub(crate) fn mark_worker_alive() {
    WORKER_ALIVE_AT.store(Utc::now().timestamp(), Ordering::Relaxed);
}

/// Serializes tests that flip the process-global liveness flag.
#[cfg(test)]
pub(crate) static LIVENESS_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A worker is considered live if it ticked within three poll intervals.
fn worker_alive(config: &Config) -> bool {
    let last = WORKER_ALIVE_AT.load(Ordering::Relaxed);
    if last == 0 {
        return false;
    }
    let window = (config.dispatch.poll_secs.max(1) * 3) as i64;
    Utc::now().timestamp() - last <= window
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued(DispatchJob),
    /// The job was not persisted; the caller must handle the batch itself.
    NotQueued,
}

/// Try to persist a dispatch job, bounded in time. Never returns an error:
/// any failure degrades to `NotQueued` so the caller can fall back.
pub async fn enqueue(config: &Config, job: NewJob) -> EnqueueOutcome {
    if !worker_alive(config) {
        tracing::warn!(
            business = job.business_id,
            contact = job.contact_phone,
            "No live dispatch worker, not queueing"
        );
        return EnqueueOutcome::NotQueued;
    }

    let timeout = std::time::Duration::from_millis(config.dispatch.enqueue_timeout_ms.max(1));
    let config_clone = config.clone();
    let job_clone = job.clone();
    let insert = tokio::task::spawn_blocking(move || {
        store::queue::insert_job(&config_clone, &job_clone)
    });

    match tokio::time::timeout(timeout, insert).await {
        Ok(Ok(Ok(stored))) => EnqueueOutcome::Queued(stored),
        Ok(Ok(Err(error))) => {
            tracing::error!("Failed to enqueue dispatch job: {error:#}");
            EnqueueOutcome::NotQueued
        }
        Ok(Err(join_error)) => {
            tracing::error!("Enqueue task panicked: {join_error}");
            EnqueueOutcome::NotQueued
        }
        Err(_) => {
            tracing::error!(
                timeout_ms = config.dispatch.enqueue_timeout_ms,
                "Enqueue timed out"
            );
            EnqueueOutcome::NotQueued
        }
    }
}

/// Hand a claimed buffer to the queue, falling back to synchronous in-process
/// dispatch when queueing is unavailable. On the fallback path the buffer is
/// consumed here: deleted on success, marked failed on error.
pub async fn submit(config: &Config, entry: BufferEntry, job: NewJob) -> Result<()> {
    match enqueue(config, job.clone()).await {
        EnqueueOutcome::Queued(stored) => {
            tracing::debug!(job = stored.id, buffer = entry.id, "Dispatch job queued");
            Ok(())
        }
        EnqueueOutcome::NotQueued => {
            tracing::warn!(buffer = entry.id, "Queue unavailable, dispatching synchronously");
            let provider = provider_from_config(config);
            match process_batch(
                config,
                provider.as_deref(),
                &job.business_id,
                &job.contact_phone,
                &job.instance_id,
                job.message_id.as_deref(),
                &job.batch,
            )
            .await
            {
                Ok(()) => store::buffers::delete(config, &entry.id),
                Err(error) => {
                    tracing::error!(buffer = entry.id, "Synchronous dispatch failed: {error:#}");
                    store::buffers::mark_failed(config, &entry.id, &format!("{error:#}"))
                }
            }
        }
    }
}

/// Dispatch worker loop: reclaims orphaned buffers, claims due jobs, and
/// processes them with bounded concurrency.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let worker_id = format!("dispatch-{}", Uuid::new_v4());
    let poll = std::time::Duration::from_secs(config.dispatch.poll_secs.max(1));
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let provider: Option<Arc<dyn Provider>> = provider_from_config(&config).map(Arc::from);
    let lease = Duration::seconds(config.dispatch.lock_lease_secs.max(1) as i64);

    tracing::info!(worker = worker_id, "Dispatch worker started");

    loop {
        ticker.tick().await;
        mark_worker_alive();
        crate::health::mark_component_ok("dispatch-worker");

        if let Err(error) = crate::buffer::flush_due(&config).await {
            tracing::error!("Buffer recovery sweep failed: {error:#}");
        }

        let claimed = match store::queue::claim_due(
            &config,
            &worker_id,
            config.dispatch.max_concurrent.max(1),
            lease,
        ) {
            Ok(claimed) => claimed,
            Err(error) => {
                tracing::error!("Failed to claim dispatch jobs: {error:#}");
                crate::health::mark_component_error("dispatch-worker", &format!("{error:#}"));
                continue;
            }
        };
        if claimed.is_empty() {
            continue;
        }
        tracing::debug!(count = claimed.len(), "Claimed dispatch jobs");

        futures_util::stream::iter(claimed)
            .map(|job| {
                let config = Arc::clone(&config);
                let provider = provider.clone();
                let worker_id = worker_id.clone();
                async move {
                    process_claimed(&config, provider.as_deref(), &worker_id, job).await;
                }
            })
            .buffer_unordered(config.dispatch.max_concurrent.max(1))
            .collect::<Vec<_>>()
            .await;
    }
}

/// Process one claimed job end to end, renewing leases while in flight and
/// settling both the job row and its owning buffer afterwards.
async fn process_claimed(
    config: &Config,
    provider: Option<&dyn Provider>,
    worker_id: &str,
    job: DispatchJob,
) {
    let lease = Duration::seconds(config.dispatch.lock_lease_secs.max(1) as i64);
    let renew_every =
        std::time::Duration::from_secs((config.dispatch.lock_lease_secs.max(2) / 2).max(1));

    let extender = {
        let config = config.clone();
        let job_id = job.id.clone();
        let buffer_id = job.buffer_id.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) =
                    store::queue::extend_lease(&config, &job_id, &worker_id, lease)
                {
                    tracing::warn!(job = job_id, "Failed to renew job lease: {error:#}");
                }
                if let Some(buffer_id) = buffer_id.as_deref() {
                    if let Err(error) = store::buffers::extend_claim(&config, buffer_id, lease) {
                        tracing::warn!(buffer = buffer_id, "Failed to renew buffer claim: {error:#}");
                    }
                }
            }
        })
    };

    let result = process_batch(
        config,
        provider,
        &job.business_id,
        &job.contact_phone,
        &job.instance_id,
        job.message_id.as_deref(),
        &job.batch,
    )
    .await;
    extender.abort();

    match result {
        Ok(()) => {
            if let Err(error) = store::queue::complete(config, &job.id) {
                tracing::error!(job = job.id, "Failed to complete job: {error:#}");
            }
            if let Some(buffer_id) = job.buffer_id.as_deref() {
                if let Err(error) = store::buffers::delete(config, buffer_id) {
                    tracing::error!(buffer = buffer_id, "Failed to delete buffer: {error:#}");
                }
            }
        }
        Err(error) => {
            let message = format!("{error:#}");
            let permanent = error
                .chain()
                .any(|cause| cause.downcast_ref::<PermanentError>().is_some());
            if permanent || job.attempts >= job.max_attempts {
                tracing::error!(
                    job = job.id,
                    attempts = job.attempts,
                    "Dispatch job failed for good: {message}"
                );
                let _ = store::queue::fail(config, &job.id, &message);
                if let Some(buffer_id) = job.buffer_id.as_deref() {
                    let _ = store::buffers::mark_failed(config, buffer_id, &message);
                }
            } else {
                let delay = retry_delay(config, job.attempts);
                tracing::warn!(
                    job = job.id,
                    attempt = job.attempts,
                    delay_ms = delay.num_milliseconds(),
                    "Dispatch job failed, retrying: {message}"
                );
                let _ = store::queue::retry_later(config, &job.id, delay, &message);
                if let Some(buffer_id) = job.buffer_id.as_deref() {
                    // Keep the buffer claimed across the backoff so the
                    // recovery sweep does not spawn a duplicate job.
                    let _ = store::buffers::extend_claim(config, buffer_id, delay + lease);
                }
            }
        }
    }
}

/// Marker for failures no amount of retrying can fix, e.g. a missing
/// provider configuration. `process_claimed` fails such jobs immediately.
#[derive(Debug)]
struct PermanentError;

impl std::fmt::Display for PermanentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("permanent dispatch error")
    }
}

impl std::error::Error for PermanentError {}

/// Exponential backoff with jitter, doubling per attempt.
fn retry_delay(config: &Config, attempt: u32) -> Duration {
    let base = config.dispatch.backoff_ms.max(1);
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
    let jitter = u64::from(Utc::now().timestamp_subsec_millis() % 250);
    Duration::milliseconds(base.saturating_mul(factor).saturating_add(jitter) as i64)
}

const DEFAULT_SYSTEM_PROMPT: &str =
    "Eres un asistente de ventas amable que atiende por WhatsApp. Responde en español, \
     con mensajes cortos y naturales.";

const MAX_HISTORY_MESSAGES: usize = 20;

fn followup_tool_spec() -> ToolSpec {
    ToolSpec {
        name: "schedule_followup".into(),
        description: "Agenda un mensaje de seguimiento para este cliente si la conversación \
                      queda pendiente de una decisión."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "delay_minutes": {
                    "type": "integer",
                    "description": "Minutos a esperar antes del seguimiento",
                    "minimum": 1
                },
                "message": {
                    "type": "string",
                    "description": "Texto exacto del mensaje de seguimiento"
                }
            },
            "required": ["delay_minutes"]
        }),
    }
}

/// Process one batch of contact messages: build the conversation, run the
/// provider (with the follow-up tool available), and deliver the reply.
async fn process_batch(
    config: &Config,
    provider: Option<&dyn Provider>,
    business_id: &str,
    contact_phone: &str,
    instance_id: &str,
    message_id: Option<&str>,
    batch: &[String],
) -> Result<()> {
    let business = store::business::get_business(config, business_id)?;
    if !business.bot_enabled {
        tracing::info!(business = business_id, "Bot disabled, dropping batch");
        return Ok(());
    }

    let instance = match store::business::get_instance(config, instance_id) {
        Ok(instance) => instance,
        Err(_) => store::business::primary_instance(config, business_id)?
            .with_context(|| format!("Business {business_id} has no usable channel instance"))?,
    };
    let client = client_for_instance(&instance)?;

    if let Some(message_id) = message_id {
        if let Err(error) = client.mark_as_read(message_id).await {
            tracing::debug!("mark_as_read failed (ignored): {error:#}");
        }
    }

    let Some(provider) = provider else {
        return Err(
            anyhow::Error::new(PermanentError).context("No AI provider configured, cannot dispatch")
        );
    };

    let mut messages = build_conversation(config, &business, contact_phone, batch)?;
    let response = chat_with_tools(config, provider, business_id, contact_phone, &mut messages)
        .await?;

    if let Some(usage) = &response.usage {
        tracing::debug!(
            business = business_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Provider token usage"
        );
    }

    let send_events = parse_reply(response.text_or_empty());
    if send_events.is_empty() {
        tracing::debug!(business = business_id, "Provider reply empty, nothing to send");
        return Ok(());
    }

    deliver(config, client.as_ref(), business_id, contact_phone, &send_events).await?;

    // Re-arm the silence follow-up now that the agent had the last word.
    match followup::schedule_follow_up(
        config,
        &ScheduleRequest {
            business_id,
            contact_phone,
            kind: ReminderKind::Auto,
            delay_override_minutes: None,
            custom_message: None,
        },
    )? {
        ScheduleOutcome::Scheduled(reminder) => {
            tracing::debug!(reminder = reminder.id, "Post-reply follow-up armed");
        }
        ScheduleOutcome::DailyCapReached | ScheduleOutcome::Disabled => {}
    }

    Ok(())
}

/// Conversation context: system prompt, a current-time line in the business
/// timezone, and the recent history. The incoming batch is appended only if
/// the log does not already end with it.
fn build_conversation(
    config: &Config,
    business: &Business,
    contact_phone: &str,
    batch: &[String],
) -> Result<Vec<ChatMessage>> {
    let tz = business_tz(&business.timezone);
    let local_now = Utc::now().with_timezone(&tz);
    let system = format!(
        "{}\n\nFecha y hora actual: {}.",
        business
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT),
        local_now.format("%A %d/%m/%Y %H:%M"),
    );

    let mut messages = vec![ChatMessage::system(system)];
    let history = store::messages::recent_messages(
        config,
        &business.id,
        contact_phone,
        MAX_HISTORY_MESSAGES,
    )?;
    for entry in &history {
        messages.push(match entry.direction {
            Direction::Inbound => ChatMessage::user(&entry.content),
            Direction::Outbound => ChatMessage::assistant(&entry.content),
        });
    }

    let joined = batch.join("\n");
    let history_covers_batch = history
        .last()
        .is_some_and(|m| m.direction == Direction::Inbound && m.content == *batch.last().unwrap_or(&String::new()));
    if !history_covers_batch && !joined.is_empty() {
        messages.push(ChatMessage::user(joined));
    }

    Ok(messages)
}

/// Run the provider, resolving `schedule_followup` tool calls in a bounded
/// loop. Returns the final response carrying the user-facing text.
async fn chat_with_tools(
    config: &Config,
    provider: &dyn Provider,
    business_id: &str,
    contact_phone: &str,
    messages: &mut Vec<ChatMessage>,
) -> Result<ChatResponse> {
    let tools = [followup_tool_spec()];

    for _ in 0..config.provider.max_tool_iterations.max(1) {
        let response = provider
            .chat(
                messages,
                &tools,
                &config.provider.model,
                config.provider.temperature,
            )
            .await?;

        if !response.has_tool_calls() {
            return Ok(response);
        }

        let raw_calls = response.tool_calls.iter().map(|c| c.raw.clone()).collect();
        messages.push(ChatMessage::assistant_tool_calls(
            response.text.clone(),
            raw_calls,
        ));

        for call in &response.tool_calls {
            let outcome = if call.name == "schedule_followup" {
                handle_followup_tool(config, business_id, contact_phone, &call.arguments)
            } else {
                Err(anyhow::anyhow!("Unknown tool: {}", call.name))
            };
            let result_text = match outcome {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(tool = call.name, "Tool call failed: {error:#}");
                    format!("Error: {error:#}")
                }
            };
            messages.push(ChatMessage::tool_result(call.id.clone(), result_text));
        }
    }

    // Iteration budget spent; one last call without tools to force text.
    provider
        .chat(
            messages,
            &[],
            &config.provider.model,
            config.provider.temperature,
        )
        .await
}

fn handle_followup_tool(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
    arguments: &str,
) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct Args {
        delay_minutes: i64,
        message: Option<String>,
    }
    let args: Args =
        serde_json::from_str(arguments).context("Invalid schedule_followup arguments")?;

    match followup::schedule_follow_up(
        config,
        &ScheduleRequest {
            business_id,
            contact_phone,
            kind: ReminderKind::Manual,
            delay_override_minutes: Some(args.delay_minutes.max(1)),
            custom_message: args.message.as_deref(),
        },
    )? {
        ScheduleOutcome::Scheduled(reminder) => Ok(format!(
            "Seguimiento agendado para {}",
            reminder.scheduled_at.to_rfc3339()
        )),
        ScheduleOutcome::DailyCapReached => {
            Ok("No agendado: se alcanzó el máximo diario de seguimientos".into())
        }
        ScheduleOutcome::Disabled => Ok("No agendado: seguimientos deshabilitados".into()),
    }
}

/// Send the parsed events in order with typing-speed pacing, logging each
/// outbound message.
async fn deliver(
    config: &Config,
    client: &dyn ChannelClient,
    business_id: &str,
    contact_phone: &str,
    send_events: &[SendEvent],
) -> Result<()> {
    let send_timeout = std::time::Duration::from_secs(config.reliability.channel_timeout_secs);

    for event in send_events {
        tokio::time::sleep(pacing_delay(event)).await;

        let (media_type, logged) = match event {
            SendEvent::Text { body } => {
                tokio::time::timeout(send_timeout, client.send_text(contact_phone, body))
                    .await
                    .map_err(|_| anyhow::anyhow!("Channel send timed out"))??;
                ("text", body.clone())
            }
            SendEvent::Image { url, caption } => {
                tokio::time::timeout(
                    send_timeout,
                    client.send_image(contact_phone, url, caption.as_deref()),
                )
                .await
                .map_err(|_| anyhow::anyhow!("Channel send timed out"))??;
                ("image", url.clone())
            }
            SendEvent::Video { url, caption } => {
                tokio::time::timeout(
                    send_timeout,
                    client.send_video(contact_phone, url, caption.as_deref()),
                )
                .await
                .map_err(|_| anyhow::anyhow!("Channel send timed out"))??;
                ("video", url.clone())
            }
            SendEvent::Audio { url } => {
                tokio::time::timeout(send_timeout, client.send_audio(contact_phone, url))
                    .await
                    .map_err(|_| anyhow::anyhow!("Channel send timed out"))??;
                ("audio", url.clone())
            }
            SendEvent::Document { url, filename } => {
                tokio::time::timeout(
                    send_timeout,
                    client.send_document(contact_phone, url, filename.as_deref()),
                )
                .await
                .map_err(|_| anyhow::anyhow!("Channel send timed out"))??;
                ("document", url.clone())
            }
        };

        store::messages::append_message(
            config,
            business_id,
            contact_phone,
            Direction::Outbound,
            media_type,
            &logged,
        )?;
    }
    Ok(())
}
