//! Daemon entry: spawns every long-running component under a supervisor
//! that restarts it with exponential backoff, then waits for ctrl-c.

use crate::buffer::MessageBuffer;
use crate::config::Config;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let buffer = MessageBuffer::new(Config::clone(&config));
    let initial = config.reliability.component_initial_backoff_secs;
    let max = config.reliability.component_max_backoff_secs;

    tracing::info!(
        workspace = %config.workspace_dir.display(),
        "Daemon starting"
    );

    let gateway = {
        let config = Arc::clone(&config);
        let buffer = buffer.clone();
        spawn_component_supervisor("gateway", initial, max, move || {
            crate::gateway::run_gateway(Arc::clone(&config), buffer.clone())
        })
    };

    let dispatch = {
        let config = Arc::clone(&config);
        spawn_component_supervisor("dispatch-worker", initial, max, move || {
            crate::dispatch::run(Arc::clone(&config))
        })
    };

    let reminders = {
        let config = Arc::clone(&config);
        spawn_component_supervisor("reminder-worker", initial, max, move || {
            crate::followup::worker::run(Arc::clone(&config))
        })
    };

    let scanner = {
        let config = Arc::clone(&config);
        spawn_component_supervisor("inactivity-scanner", initial, max, move || {
            crate::followup::scanner::run(Arc::clone(&config))
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping components");

    for handle in [gateway, dispatch, reminders, scanner] {
        handle.abort();
    }
    Ok(())
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    // Clean exit resets the backoff ladder.
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    crate::health::mark_component_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_failing_component_with_backoff() {
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let handle = spawn_component_supervisor("supervisor-test", 1, 8, || async {
            RUNS.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        });

        // Advance virtual time through several backoff cycles.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        handle.abort();

        assert!(RUNS.load(Ordering::SeqCst) >= 3);
    }
}
