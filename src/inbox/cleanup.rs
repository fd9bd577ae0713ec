//! Background deletion of expired inbox records on a cron schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CleanupConfig;
use crate::error::{ConfigError, DatabaseError};
use crate::store::traits::EventInboxRepository;

/// Runs batched inbox cleanup, either on demand or from the scheduler loop.
pub struct CleanupScheduler {
    repo: Arc<dyn EventInboxRepository>,
    config: CleanupConfig,
    schedule: cron::Schedule,
}

impl CleanupScheduler {
    pub fn new(repo: Arc<dyn EventInboxRepository>, config: CleanupConfig) -> Result<Self, ConfigError> {
        let schedule = config.cron_schedule()?;
        Ok(Self {
            repo,
            config,
            schedule,
        })
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run one cleanup pass. Returns the number of deleted records.
    pub async fn run_once(&self) -> Result<usize, DatabaseError> {
        if !self.repo.is_cleanup_available().await? {
            warn!("Inbox cleanup infrastructure missing, skipping run");
            return Ok(0);
        }
        let deleted = self.repo.execute_cleanup(&self.config).await?;
        info!(deleted, "Inbox cleanup run complete");
        Ok(deleted)
    }
}

/// Spawn the cleanup loop. Cancel the returned token to stop it.
pub fn spawn_cleanup_scheduler(scheduler: Arc<CleanupScheduler>) -> (JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!(schedule = %scheduler.config.schedule, "Inbox cleanup scheduler started");

        loop {
            let now = Utc::now();
            let Some(next) = scheduler.next_fire(now) else {
                warn!("Cleanup schedule has no upcoming fire time, stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "Next inbox cleanup scheduled");

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Inbox cleanup scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = scheduler.run_once().await {
                error!(error = %e, "Inbox cleanup run failed");
            }
        }
    });

    (handle, shutdown)
}
