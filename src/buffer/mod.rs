//! In-process debounce layer over the durable message buffers.
//!
//! Every inbound fragment lands in SQLite immediately; a per-contact timer
//! then waits out the debounce interval and flushes the accumulated buffer
//! into a dispatch job. A fragment arriving mid-wait replaces the timer, so
//! a typing burst produces exactly one job. Timers are process-local; the
//! dispatch worker's [`flush_due`] sweep catches buffers whose timer died
//! with a previous process.

use crate::config::Config;
use crate::dispatch;
use crate::store::{self, BufferEntry, NewJob, Priority};
use anyhow::Result;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    timers: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl MessageBuffer {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn debounce(&self) -> Duration {
        Duration::milliseconds(self.inner.config.dispatch.debounce_ms.max(1) as i64)
    }

    /// Record one inbound fragment and (re)arm the contact's flush timer.
    pub fn add_fragment(
        &self,
        business_id: &str,
        contact_phone: &str,
        instance_id: &str,
        message_id: Option<&str>,
        content: &str,
    ) -> Result<BufferEntry> {
        let entry = store::buffers::append_fragment(
            &self.inner.config,
            business_id,
            contact_phone,
            instance_id,
            message_id,
            content,
            self.debounce(),
        )?;

        let key = (business_id.to_string(), contact_phone.to_string());
        let wait = std::time::Duration::from_millis(self.inner.config.dispatch.debounce_ms.max(1));
        let this = self.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            this.flush(&timer_key.0, &timer_key.1).await;
            this.inner.timers.lock().remove(&timer_key);
        });

        // Replacing the timer aborts the previous wait, extending the burst.
        if let Some(old) = self.inner.timers.lock().insert(key, handle) {
            old.abort();
        }

        Ok(entry)
    }

    /// Flush a contact's buffer immediately, bypassing the debounce wait.
    pub async fn force_flush(&self, business_id: &str, contact_phone: &str) {
        let key = (business_id.to_string(), contact_phone.to_string());
        if let Some(timer) = self.inner.timers.lock().remove(&key) {
            timer.abort();
        }
        self.flush(business_id, contact_phone).await;
    }

    async fn flush(&self, business_id: &str, contact_phone: &str) {
        if let Err(error) = flush_contact(&self.inner.config, business_id, contact_phone).await {
            tracing::error!(
                business = business_id,
                contact = contact_phone,
                "Buffer flush failed: {error:#}"
            );
        }
    }
}

/// Claim the contact's pending buffer and hand it to the dispatcher. A miss
/// is normal: the buffer may already be claimed, or a newer fragment restarted
/// the debounce.
async fn flush_contact(config: &Config, business_id: &str, contact_phone: &str) -> Result<()> {
    let lease = Duration::seconds(config.dispatch.lock_lease_secs.max(1) as i64);
    let Some(entry) = store::buffers::claim_for_flush(config, business_id, contact_phone, lease)?
    else {
        return Ok(());
    };

    // Respect a deadline pushed out by a fragment that raced the claim.
    if entry.debounce_deadline > Utc::now() + Duration::seconds(1) {
        tracing::debug!(
            buffer = entry.id,
            "Deadline moved while claiming, returning buffer"
        );
        // Put it back as pending; the rearmed timer owns it now.
        return store::buffers::release(config, &entry.id);
    }

    let job = NewJob {
        business_id: entry.business_id.clone(),
        contact_phone: entry.contact_phone.clone(),
        instance_id: entry.instance_id.clone(),
        buffer_id: Some(entry.id.clone()),
        message_id: entry.last_message_id.clone(),
        batch: entry.fragments.clone(),
        priority: Priority::Normal,
        max_attempts: config.dispatch.max_attempts,
    };
    dispatch::submit(config, entry, job).await
}

/// Recovery sweep run by the dispatch worker: release stalled claims, then
/// flush every pending buffer whose deadline has passed.
pub async fn flush_due(config: &Config) -> Result<usize> {
    let now = Utc::now();
    let released = store::buffers::release_stalled(config, now)?;
    if released > 0 {
        tracing::warn!(released, "Reclaimed stalled buffer claims");
    }

    let due = store::buffers::list_pending_due(config, now)?;
    let mut flushed = 0;
    for entry in due {
        let (business_id, contact_phone) = (entry.business_id.clone(), entry.contact_phone.clone());
        match flush_contact(config, &business_id, &contact_phone).await {
            Ok(()) => flushed += 1,
            Err(error) => {
                tracing::error!(
                    business = business_id,
                    contact = contact_phone,
                    "Recovery flush failed: {error:#}"
                );
            }
        }
    }
    Ok(flushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{seed_business, seed_instance, test_config};
    use crate::store::{BufferStatus, JobStatus};
    use tempfile::TempDir;

    fn fast_config(tmp: &TempDir) -> Config {
        let mut config = test_config(tmp);
        config.dispatch.debounce_ms = 50;
        config
    }

    // Flushing goes through the queue only while a worker looks alive, so
    // these tests hold the liveness lock and mark one.
    fn liveness() -> std::sync::MutexGuard<'static, ()> {
        let guard = dispatch::LIVENESS_TEST_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        dispatch::mark_worker_alive();
        guard
    }

    #[tokio::test]
    async fn burst_produces_single_job_with_ordered_fragments() {
        let _guard = liveness();
        let tmp = TempDir::new().unwrap();
        let config = fast_config(&tmp);
        seed_business(&config, "biz-1");
        seed_instance(&config, "biz-1", "inst-1");

        let buffer = MessageBuffer::new(config.clone());
        for text in ["Hola", "quiero el producto X", "precio?"] {
            buffer
                .add_fragment("biz-1", "+51999000111", "inst-1", None, text)
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Wait past the (restarted) debounce window.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let jobs = store::queue::claim_due(
            &config,
            "test-worker",
            10,
            Duration::seconds(60),
        )
        .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].batch,
            vec!["Hola", "quiero el producto X", "precio?"]
        );
        assert_eq!(jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn force_flush_skips_the_wait() {
        let _guard = liveness();
        let tmp = TempDir::new().unwrap();
        let mut config = fast_config(&tmp);
        config.dispatch.debounce_ms = 60_000;
        seed_business(&config, "biz-1");
        seed_instance(&config, "biz-1", "inst-1");

        let buffer = MessageBuffer::new(config.clone());
        let entry = buffer
            .add_fragment("biz-1", "+51999000111", "inst-1", None, "urgente")
            .unwrap();
        buffer.force_flush("biz-1", "+51999000111").await;

        let row = store::buffers::get(&config, &entry.id).unwrap().unwrap();
        assert_eq!(row.status, BufferStatus::Processing);
        let jobs = store::queue::claim_due(&config, "w", 10, Duration::seconds(60)).unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn flush_due_recovers_orphaned_buffers() {
        let _guard = liveness();
        let tmp = TempDir::new().unwrap();
        let config = fast_config(&tmp);
        seed_business(&config, "biz-1");
        seed_instance(&config, "biz-1", "inst-1");

        // Buffer written by a "previous process": no in-memory timer exists.
        store::buffers::append_fragment(
            &config,
            "biz-1",
            "+51999000111",
            "inst-1",
            None,
            "hola",
            Duration::milliseconds(-1000),
        )
        .unwrap();

        let flushed = flush_due(&config).await.unwrap();
        assert_eq!(flushed, 1);
        let jobs = store::queue::claim_due(&config, "w", 10, Duration::seconds(60)).unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
