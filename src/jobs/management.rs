//! Operator commands on jobs

use async_trait::async_trait;
use tracing::info;

use super::command::{Command, CommandContext};
use super::model::JobId;
use crate::core::errors::{EngineError, Result};

/// Re-arm jobs with a fresh retries budget.
///
/// Every listed job must exist; the whole command fails otherwise. The failure
/// details and any lock are cleared and the job becomes due immediately.
pub struct SetJobRetriesCmd {
    pub job_ids: Vec<JobId>,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetriesCmd {
    /// Number of jobs updated
    type Output = usize;

    fn name(&self) -> &'static str {
        "set-job-retries"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<usize> {
        if self.retries == 0 {
            return Err(EngineError::invalid_argument(
                "retries must be greater than 0",
            ));
        }
        if self.job_ids.is_empty() {
            return Err(EngineError::invalid_argument("no job ids given"));
        }

        let now = cx.now();
        for job_id in &self.job_ids {
            let mut job = cx
                .job(job_id)
                .await?
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            let previous = job.retries;
            job.retries = self.retries;
            job.exception_message = None;
            job.last_failure_id = None;
            job.unlock();
            job.due_date = now;
            info!(
                job_id = %job_id,
                previous,
                retries = self.retries,
                "Job retries set"
            );
            cx.update_job(job);
        }
        Ok(self.job_ids.len())
    }
}
