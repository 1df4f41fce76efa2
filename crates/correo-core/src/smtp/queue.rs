//! Outbound mail queue
//!
//! A file-spool queue: each queued message is a JSON job file plus the
//! raw message bytes next to it. A worker claims due jobs on an interval,
//! delivers them through the courier, and reschedules failures with
//! exponential backoff.

use super::courier::{Deliver, Envelope};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use correo_common::config::DeliveryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A spooled delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub envelope: Envelope,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Queue manager driving outbound deliveries.
pub struct QueueManager<D: Deliver> {
    spool_dir: PathBuf,
    courier: Arc<D>,
    poll_interval_secs: u64,
    max_attempts: i32,
}

impl<D: Deliver> QueueManager<D> {
    /// Create a queue manager over the given spool directory, creating
    /// it if absent.
    pub fn new(
        spool_dir: impl Into<PathBuf>,
        courier: Arc<D>,
        config: &DeliveryConfig,
    ) -> Result<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir)
            .with_context(|| format!("failed to create spool directory {}", spool_dir.display()))?;

        Ok(Self {
            spool_dir,
            courier,
            poll_interval_secs: config.poll_interval_secs,
            max_attempts: config.max_attempts,
        })
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.spool_dir.join(format!("{}.json", id))
    }

    fn message_path(&self, id: Uuid) -> PathBuf {
        self.spool_dir.join(format!("{}.eml", id))
    }

    /// Queue a message for delivery, one job per destination domain.
    /// Returns the ids of the created jobs.
    pub async fn enqueue(
        &self,
        from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<Vec<Uuid>> {
        let mut by_domain: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        for recipient in recipients {
            let Some(domain) = recipient.split('@').nth(1) else {
                warn!(recipient = %recipient, "recipient has no domain, skipping");
                continue;
            };
            by_domain
                .entry(domain.to_string())
                .or_default()
                .push(recipient.clone());
        }

        if by_domain.is_empty() {
            return Err(anyhow!("no deliverable recipients"));
        }

        let mut ids = Vec::new();
        for (domain, recipients) in by_domain {
            let id = Uuid::now_v7();
            let job = QueuedJob {
                id,
                envelope: Envelope {
                    from: from.to_string(),
                    domain,
                    recipients,
                },
                attempts: 0,
                max_attempts: self.max_attempts,
                scheduled_at: Utc::now(),
                last_error: None,
            };

            tokio::fs::write(self.message_path(id), message).await?;
            tokio::fs::write(self.job_path(id), serde_json::to_vec(&job)?).await?;

            info!(job = %id, domain = %job.envelope.domain, "enqueued delivery job");
            ids.push(id);
        }

        Ok(ids)
    }

    /// Run the queue worker.
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.poll_interval_secs));

        info!(
            spool = %self.spool_dir.display(),
            interval_secs = self.poll_interval_secs,
            "queue worker started"
        );

        loop {
            ticker.tick().await;

            if let Err(e) = self.process_pending().await {
                error!("Error processing queue: {}", e);
            }
        }
    }

    /// Process every due job in the spool.
    async fn process_pending(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.spool_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let job = match read_job(&path).await {
                Ok(job) => job,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "unreadable job file");
                    quarantine(&path).await;
                    continue;
                }
            };

            if job.scheduled_at > Utc::now() {
                continue;
            }

            self.process_job(job).await;
        }

        Ok(())
    }

    /// Attempt one job and update the spool accordingly.
    async fn process_job(&self, mut job: QueuedJob) {
        debug!(job = %job.id, domain = %job.envelope.domain, attempt = job.attempts + 1, "processing job");

        let message = match tokio::fs::read(self.message_path(job.id)).await {
            Ok(message) => message,
            Err(e) => {
                error!(job = %job.id, error = %e, "message file missing, dropping job");
                quarantine(&self.job_path(job.id)).await;
                return;
            }
        };

        match self.courier.deliver(&job.envelope, &message).await {
            Ok(()) => {
                info!(job = %job.id, domain = %job.envelope.domain, "job delivered");
                let _ = tokio::fs::remove_file(self.job_path(job.id)).await;
                let _ = tokio::fs::remove_file(self.message_path(job.id)).await;
            }
            Err(e) => {
                job.attempts += 1;
                job.last_error = Some(e.to_string());

                if job.attempts >= job.max_attempts {
                    error!(job = %job.id, error = %e, "job exceeded max attempts, giving up");
                    quarantine(&self.job_path(job.id)).await;
                    return;
                }

                let delay = calculate_backoff(job.attempts);
                job.scheduled_at = Utc::now() + delay;
                warn!(
                    job = %job.id,
                    error = %e,
                    retry_at = %job.scheduled_at,
                    "delivery failed, rescheduled"
                );

                match serde_json::to_vec(&job) {
                    Ok(data) => {
                        if let Err(e) = tokio::fs::write(self.job_path(job.id), data).await {
                            error!(job = %job.id, error = %e, "failed to reschedule job");
                        }
                    }
                    Err(e) => error!(job = %job.id, error = %e, "failed to encode job"),
                }
            }
        }
    }
}

async fn read_job(path: &Path) -> Result<QueuedJob> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Move a job file out of the worker's way, keeping it around for
/// inspection.
async fn quarantine(path: &Path) {
    let mut failed = path.as_os_str().to_owned();
    failed.push(".failed");
    if let Err(e) = tokio::fs::rename(path, &failed).await {
        error!(path = %path.display(), error = %e, "failed to quarantine job file");
    }
}

/// Exponential backoff delay, capped at 4 hours.
fn calculate_backoff(attempts: i32) -> Duration {
    let minutes = std::cmp::min(2_i64.pow(attempts as u32), 240);
    Duration::minutes(minutes)
}
