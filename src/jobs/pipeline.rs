//! Job execution pipeline
//!
//! Runs a job's business command in its own unit of work, then a listener
//! command: the success listener once, or the failure listener which records
//! the failed attempt on the job. Business retries are the job's persisted
//! `retries` counter. Write contention on the listener's own commit is retried
//! separately by [`retry_on_conflict`].

use async_trait::async_trait;
use chrono::Duration;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::command::{Command, CommandContext, CommandExecutor};
use super::handler::JobHandlerRegistry;
use super::metrics::JobMetrics;
use super::model::{FailureRecord, JobId};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};

/// How a job attempt ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler ran and the job was deleted
    Succeeded,
    /// The job no longer exists
    Vanished,
    /// The owning execution is gone; the job was deleted without running
    Orphaned,
}

/// Re-run `operation` while it fails with an optimistic locking conflict.
///
/// At most `max_attempts` calls are made; the last conflict is returned once
/// the bound is reached. Any other error is returned immediately.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_conflict = None;
    for attempt in 0..max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_optimistic_lock() => {
                debug!(
                    attempt = attempt + 1,
                    max_attempts,
                    error = %err,
                    "Optimistic locking conflict, retrying"
                );
                last_conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or_else(|| {
        EngineError::configuration("retry_on_conflict needs at least one attempt")
    }))
}

/// Runs the business logic of one job
pub struct ExecuteJobCmd {
    job_id: JobId,
    handlers: Arc<JobHandlerRegistry>,
}

impl ExecuteJobCmd {
    pub fn new(job_id: impl Into<JobId>, handlers: Arc<JobHandlerRegistry>) -> Self {
        Self {
            job_id: job_id.into(),
            handlers,
        }
    }
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "execute-job"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<JobOutcome> {
        let Some(job) = cx.job(&self.job_id).await? else {
            debug!(job_id = %self.job_id, "Job vanished before execution");
            return Ok(JobOutcome::Vanished);
        };
        if job.retries == 0 {
            return Err(EngineError::RetriesExhausted {
                job_id: job.id.clone(),
            });
        }

        if let (Some(process_instance_id), Some(execution)) =
            (job.process_instance_id.as_deref(), job.execution_id)
        {
            let alive = match cx.try_process(process_instance_id).await? {
                Some(process) => process.tree().contains(execution),
                None => false,
            };
            if !alive {
                info!(
                    job_id = %job.id,
                    execution = %execution,
                    "Owning execution is gone, deleting job without running it"
                );
                cx.delete_job(&job.id);
                return Ok(JobOutcome::Orphaned);
            }
        }

        let handler = self
            .handlers
            .get(&job.handler_type)
            .ok_or_else(|| EngineError::HandlerNotFound {
                handler_type: job.handler_type.clone(),
            })?;
        handler.execute(&job, cx).await?;
        cx.delete_job(&job.id);
        Ok(JobOutcome::Succeeded)
    }
}

/// What the failure listener did with a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerOutcome {
    Recorded { retries_left: u32 },
    /// The same attempt was applied by an earlier commit
    AlreadyRecorded { retries_left: u32 },
    /// The job had no retries left; nothing to decrement
    Exhausted,
    JobGone,
}

/// Records one failed attempt: decrements retries, stores the failure message,
/// releases the lock and pushes the due date.
///
/// Reads and writes the job in the same unit of work and stamps the attempt id
/// on it, so re-running after a conflict never decrements twice.
pub struct FailedJobListener {
    failure: FailureRecord,
}

impl FailedJobListener {
    pub fn new(failure: FailureRecord) -> Self {
        Self { failure }
    }
}

#[async_trait]
impl Command for FailedJobListener {
    type Output = ListenerOutcome;

    fn name(&self) -> &'static str {
        "failed-job-listener"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<ListenerOutcome> {
        let Some(mut job) = cx.job(&self.failure.job_id).await? else {
            return Ok(ListenerOutcome::JobGone);
        };
        if job.last_failure_id == Some(self.failure.attempt_id) {
            return Ok(ListenerOutcome::AlreadyRecorded {
                retries_left: job.retries,
            });
        }
        if job.retries == 0 {
            return Ok(ListenerOutcome::Exhausted);
        }

        let delay = Duration::from_std(cx.config().failed_job_retry_delay)
            .map_err(|e| EngineError::configuration(format!("failed_job_retry_delay: {e}")))?;
        job.retries -= 1;
        job.exception_message = Some(self.failure.message.clone());
        job.last_failure_id = Some(self.failure.attempt_id);
        job.unlock();
        job.due_date = cx.now() + delay;

        let retries_left = job.retries;
        cx.update_job(job);
        Ok(ListenerOutcome::Recorded { retries_left })
    }
}

/// Bookkeeping after a successful attempt
pub struct SuccessfulJobListener {
    job_id: JobId,
    metrics: Arc<JobMetrics>,
}

#[async_trait]
impl Command for SuccessfulJobListener {
    type Output = ();

    fn name(&self) -> &'static str {
        "successful-job-listener"
    }

    async fn execute(&self, _cx: &mut CommandContext) -> Result<()> {
        self.metrics.record_succeeded();
        debug!(job_id = %self.job_id, "Job succeeded");
        Ok(())
    }
}

pub struct JobExecutionPipeline<E: CommandExecutor> {
    executor: Arc<E>,
    handlers: Arc<JobHandlerRegistry>,
    metrics: Arc<JobMetrics>,
    listener_max_attempts: u32,
}

impl<E: CommandExecutor> JobExecutionPipeline<E> {
    pub fn new(executor: Arc<E>, handlers: Arc<JobHandlerRegistry>, config: &EngineConfig) -> Self {
        Self {
            executor,
            handlers,
            metrics: Arc::new(JobMetrics::new()),
            listener_max_attempts: config.failed_job_listener_max_retries,
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn handlers(&self) -> &Arc<JobHandlerRegistry> {
        &self.handlers
    }

    pub fn metrics(&self) -> &Arc<JobMetrics> {
        &self.metrics
    }

    /// Execute one job attempt and run the matching listener.
    ///
    /// A business failure is returned unchanged after it has been recorded,
    /// including a locking conflict raised by the business command itself.
    /// A panic in the business command comes back as
    /// [`EngineError::JobExecutionFailed`]. If the failure could not be
    /// recorded because of persistent write contention,
    /// [`EngineError::FailureNotRecorded`] is returned instead.
    pub async fn execute_job(&self, job_id: &str) -> Result<JobOutcome> {
        let command = ExecuteJobCmd::new(job_id, Arc::clone(&self.handlers));
        let result = match AssertUnwindSafe(self.executor.execute(&command))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(EngineError::JobExecutionFailed {
                job_id: job_id.to_string(),
                message: panic_message(panic.as_ref()),
            }),
        };

        match result {
            Ok(JobOutcome::Succeeded) => {
                self.invoke_successful_job_listener(job_id).await;
                Ok(JobOutcome::Succeeded)
            }
            Ok(outcome) => {
                debug!(job_id, ?outcome, "Job not executed, skipping listeners");
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    job_id,
                    category = err.category(),
                    "Job execution failed: {}",
                    err
                );
                let failure = FailureRecord::new(job_id, &err);
                self.invoke_failed_job_listener(failure).await?;
                Err(err)
            }
        }
    }

    async fn invoke_successful_job_listener(&self, job_id: &str) {
        let listener = SuccessfulJobListener {
            job_id: job_id.to_string(),
            metrics: Arc::clone(&self.metrics),
        };
        if let Err(err) = self.executor.execute(&listener).await {
            warn!(job_id, "Successful job listener failed: {}", err);
        }
    }

    async fn invoke_failed_job_listener(&self, failure: FailureRecord) -> Result<()> {
        let job_id = failure.job_id.clone();
        let listener = FailedJobListener::new(failure);
        let listener = &listener;
        let executor = &self.executor;
        let metrics = &self.metrics;

        let outcome = retry_on_conflict(self.listener_max_attempts, move |_| async move {
            let result = executor.execute(listener).await;
            if matches!(&result, Err(err) if err.is_optimistic_lock()) {
                metrics.record_listener_conflict();
            }
            result
        })
        .await;

        match outcome {
            Ok(ListenerOutcome::Recorded { retries_left })
            | Ok(ListenerOutcome::AlreadyRecorded { retries_left }) => {
                self.metrics.record_failed(retries_left == 0);
                if retries_left == 0 {
                    warn!(job_id = %job_id, "Job has no retries left");
                } else {
                    debug!(job_id = %job_id, retries_left, "Job failure recorded");
                }
                Ok(())
            }
            Ok(outcome) => {
                debug!(job_id = %job_id, ?outcome, "Nothing to record for failed job");
                Ok(())
            }
            Err(err) if err.is_optimistic_lock() => {
                error!(
                    job_id = %job_id,
                    attempts = self.listener_max_attempts,
                    "Could not record job failure: {}",
                    err
                );
                Err(EngineError::FailureNotRecorded {
                    job_id,
                    source: Box::new(err),
                })
            }
            Err(err) => {
                error!(job_id = %job_id, "Failed job listener failed: {}", err);
                Ok(())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
