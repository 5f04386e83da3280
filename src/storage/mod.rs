//! Storage layer for the process engine
//!
//! Two kinds of versioned documents are persisted: one execution tree per
//! process instance and one record per job. Writes are grouped into a
//! [`WriteBatch`] that commits atomically; every write states the version it
//! expects to replace and the whole batch fails with an optimistic locking
//! conflict if any expectation does not hold.

pub mod memory;
pub mod sled_storage;

pub use memory::MemoryStorage;
pub use sled_storage::SledStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::errors::{EngineError, Result};
use crate::execution::tree::{ExecutionId, ExecutionTree};
use crate::jobs::model::{JobId, JobRecord};

/// Version a write expects to find in storage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    /// The document must not exist yet
    Absent,
    /// The document must exist at exactly this version
    Version(u64),
    /// No check; used for cascade deletes
    Any,
}

impl Expected {
    /// Expectation for re-writing a document that was read at `version`
    pub fn from_read(version: Option<u64>) -> Self {
        match version {
            Some(v) => Expected::Version(v),
            None => Expected::Absent,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Write {
    PutProcess {
        tree: ExecutionTree,
        expected: Expected,
    },
    PutJob {
        job: JobRecord,
        expected: Expected,
    },
    DeleteJob {
        job_id: JobId,
        expected: Expected,
    },
}

/// Writes that commit together or not at all
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    pub fn put_process(&mut self, tree: ExecutionTree, expected: Expected) {
        self.push(Write::PutProcess { tree, expected });
    }

    pub fn put_job(&mut self, job: JobRecord, expected: Expected) {
        self.push(Write::PutJob { job, expected });
    }

    pub fn delete_job(&mut self, job_id: impl Into<JobId>, expected: Expected) {
        self.push(Write::DeleteJob {
            job_id: job_id.into(),
            expected,
        });
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = Write;
    type IntoIter = std::vec::IntoIter<Write>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Compare an expectation with the stored version and return the version to write.
///
/// Deletes ignore the returned value.
pub(crate) fn check_version(
    entity: &'static str,
    id: &str,
    expected: Expected,
    found: Option<u64>,
) -> Result<u64> {
    let matches = match expected {
        Expected::Absent => found.is_none(),
        Expected::Version(v) => found == Some(v),
        Expected::Any => true,
    };
    if !matches {
        let expected = match expected {
            Expected::Version(v) => Some(v),
            _ => None,
        };
        return Err(EngineError::optimistic_lock(entity, id, expected, found));
    }
    Ok(found.map(|v| v + 1).unwrap_or(1))
}

/// Persistence for execution trees and jobs
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the execution tree of a process instance
    async fn load_process(&self, process_instance_id: &str) -> Result<Option<ExecutionTree>>;

    /// Get a job by ID
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Jobs bound to one execution node
    async fn jobs_for_execution(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> Result<Vec<JobRecord>>;

    /// Due, unlocked jobs with retries left, oldest due date first
    async fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>>;

    /// Every stored job, including exhausted ones
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Apply a batch atomically, checking every expected version
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
