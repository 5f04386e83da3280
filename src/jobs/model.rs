use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::EngineError;
use crate::execution::tree::ExecutionId;

pub type JobId = String;

/// A unit of deferred work bound to an execution node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Key into the handler registry
    pub handler_type: String,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<ExecutionId>,
    pub due_date: DateTime<Utc>,
    /// Business retries left; 0 means no further executions
    pub retries: u32,
    pub exception_message: Option<String>,
    /// Failure attempt already applied to `retries`
    pub last_failure_id: Option<Uuid>,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Storage version; assigned by the storage layer on commit
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its due date or a worker
    Pending,
    /// Held by a worker until the lock expires
    Locked,
    /// No retries left; needs operator attention
    Exhausted,
}

impl JobRecord {
    pub fn new(handler_type: impl Into<String>, retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: cuid2::create_id(),
            handler_type: handler_type.into(),
            process_instance_id: None,
            execution_id: None,
            due_date: now,
            retries,
            exception_message: None,
            last_failure_id: None,
            lock_owner: None,
            lock_expiration: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn for_execution(mut self, process_instance_id: impl Into<String>, execution: ExecutionId) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self.execution_id = Some(execution);
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = due_date;
        self
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.retries == 0 {
            JobState::Exhausted
        } else if self.is_locked(now) {
            JobState::Locked
        } else {
            JobState::Pending
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.map(|exp| exp > now).unwrap_or(false)
    }

    /// Due, unlocked (or lock expired) and with retries left
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == JobState::Pending && self.due_date <= now
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

/// One failed execution attempt of a job.
///
/// The attempt id lets the failure listener recognise an attempt it has
/// already applied when its own commit is retried.
#[derive(Clone, Debug)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub attempt_id: Uuid,
    pub message: String,
    pub category: &'static str,
}

impl FailureRecord {
    pub fn new(job_id: impl Into<JobId>, error: &EngineError) -> Self {
        Self {
            job_id: job_id.into(),
            attempt_id: Uuid::new_v4(),
            message: error.to_string(),
            category: error.category(),
        }
    }
}
