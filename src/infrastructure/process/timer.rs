//! Periodic scan of due TIMER entries

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::process::{EngineError, EngineMessage, ProcessRepository};

use super::runtime::ProcessRuntime;

/// Publishes `timer-fired` for every delay entry whose wake time has passed.
/// Entries are removed by the handler, so a slow handler may see an entry
/// fired twice; the second firing finds the work closed and is a no-op.
#[derive(Debug)]
pub struct TimerScanner {
    repository: Arc<dyn ProcessRepository>,
    runtime: Arc<ProcessRuntime>,
    interval: Duration,
    scanning: AtomicBool,
}

impl TimerScanner {
    pub fn new(
        repository: Arc<dyn ProcessRepository>,
        runtime: Arc<ProcessRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            runtime,
            interval,
            scanning: AtomicBool::new(false),
        }
    }

    /// Run one scan; overlapping scans return immediately
    pub async fn scan(&self) -> Result<usize, EngineError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Timer scan already running, skipping");
            return Ok(0);
        }
        let result = self.fire_due().await;
        self.scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn fire_due(&self) -> Result<usize, EngineError> {
        let due = self.repository.due_delays(Utc::now()).await?;
        for entry in &due {
            self.runtime.publish(EngineMessage::TimerFired {
                instance_id: entry.instance_id.clone(),
                delay_id: entry.id.clone(),
                work_id: entry.work_id.clone(),
            })?;
        }
        if !due.is_empty() {
            debug!(fired = due.len(), "Due timers published");
        }
        Ok(due.len())
    }

    /// Scan on every tick until the runtime shuts down
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown: watch::Receiver<bool> = self.runtime.shutdown_signal();
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Timer scanner started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan().await {
                            error!(error = %e, "Timer scan failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Timer scanner stopped");
        })
    }
}
