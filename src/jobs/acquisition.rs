//! Job acquisition and the polling worker pool

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{Command, CommandContext, CommandExecutor};
use super::model::JobId;
use super::pipeline::JobExecutionPipeline;
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};

/// Lock up to `limit` due jobs for one worker
pub struct AcquireJobsCmd {
    pub owner: String,
    pub limit: usize,
    pub lock_duration: ChronoDuration,
}

#[async_trait]
impl Command for AcquireJobsCmd {
    type Output = Vec<JobId>;

    fn name(&self) -> &'static str {
        "acquire-jobs"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<Vec<JobId>> {
        let now = cx.now();
        let candidates = cx.storage().acquirable_jobs(now, self.limit).await?;
        let mut acquired = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(mut job) = cx.job(&candidate.id).await? else {
                continue;
            };
            if !job.is_acquirable(now) {
                continue;
            }
            job.lock(&self.owner, now + self.lock_duration);
            acquired.push(job.id.clone());
            cx.update_job(job);
        }
        Ok(acquired)
    }
}

#[derive(Clone)]
struct WorkerSettings {
    batch_size: usize,
    lock_duration: ChronoDuration,
    poll_interval: Duration,
}

/// A pool of workers that poll for due jobs and run them through the pipeline.
///
/// Each worker finishes one job's business command and listener before it
/// takes the next one.
pub struct JobExecutorService {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl JobExecutorService {
    /// Spawn `worker_count` workers onto the current runtime
    pub fn start<E>(pipeline: Arc<JobExecutionPipeline<E>>, config: &EngineConfig) -> Result<Self>
    where
        E: CommandExecutor + 'static,
    {
        config.validate()?;
        let settings = WorkerSettings {
            batch_size: config.max_jobs_per_acquisition,
            lock_duration: ChronoDuration::from_std(config.job_lock_duration).map_err(|e| {
                EngineError::configuration(format!("job_lock_duration: {e}"))
            })?,
            poll_interval: config.poll_interval,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..config.worker_count)
            .map(|_| {
                let owner = format!("worker-{}", Uuid::new_v4());
                tokio::spawn(run_worker(
                    owner,
                    Arc::clone(&pipeline),
                    settings.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!("Job executor started with {} workers", config.worker_count);
        Ok(Self {
            shutdown_tx,
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for them to finish their current batch
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Job worker terminated abnormally: {}", e);
            }
        }
        info!("Job executor shut down");
    }
}

async fn run_worker<E>(
    owner: String,
    pipeline: Arc<JobExecutionPipeline<E>>,
    settings: WorkerSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    E: CommandExecutor + 'static,
{
    debug!(worker = %owner, "Job worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let acquire = AcquireJobsCmd {
            owner: owner.clone(),
            limit: settings.batch_size,
            lock_duration: settings.lock_duration,
        };
        let acquired = match pipeline.executor().execute(&acquire).await {
            Ok(ids) => ids,
            Err(err) if err.is_optimistic_lock() => {
                debug!(worker = %owner, "Acquisition raced with another worker");
                Vec::new()
            }
            Err(err) => {
                error!(worker = %owner, "Job acquisition failed: {}", err);
                Vec::new()
            }
        };

        if acquired.is_empty() {
            let wait = settings.poll_interval + jitter(settings.poll_interval);
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(wait) => {}
            }
            continue;
        }

        for job_id in acquired {
            match pipeline.execute_job(&job_id).await {
                Ok(outcome) => debug!(worker = %owner, job_id = %job_id, ?outcome, "Job done"),
                Err(err @ EngineError::FailureNotRecorded { .. }) => {
                    warn!(worker = %owner, job_id = %job_id, "Job failure not recorded: {}", err)
                }
                // already logged and recorded by the pipeline
                Err(err) => debug!(
                    worker = %owner,
                    job_id = %job_id,
                    recoverable = err.is_recoverable(),
                    "Job attempt failed"
                ),
            }
        }
    }
    debug!(worker = %owner, "Job worker stopped");
}

/// Up to a quarter of the poll interval, so idle workers spread out
fn jitter(poll_interval: Duration) -> Duration {
    let max = (poll_interval.as_millis() / 4) as u64;
    Duration::from_millis(fastrand::u64(0..=max))
}
