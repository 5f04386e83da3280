use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_version, Storage, Write, WriteBatch};
use crate::core::errors::Result;
use crate::execution::tree::{ExecutionId, ExecutionTree};
use crate::jobs::model::{JobId, JobRecord};

#[derive(Default)]
struct State {
    processes: HashMap<String, ExecutionTree>,
    jobs: HashMap<JobId, JobRecord>,
}

/// In-memory storage; one lock guards both tables so a batch is atomic
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_process(&self, process_instance_id: &str) -> Result<Option<ExecutionTree>> {
        let state = self.state.read().await;
        Ok(state.processes.get(process_instance_id).cloned())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn jobs_for_execution(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.process_instance_id.as_deref() == Some(process_instance_id)
                    && job.execution_id == Some(execution)
            })
            .cloned()
            .collect())
    }

    async fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.is_acquirable(now))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobRecord> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.write().await;

        // check everything before touching anything
        let mut versions = Vec::with_capacity(batch.len());
        for write in batch.writes() {
            let version = match write {
                Write::PutProcess { tree, expected } => {
                    let id = tree.process_instance_id();
                    let found = state.processes.get(id).map(|t| t.version);
                    check_version("process", id, *expected, found)?
                }
                Write::PutJob { job, expected } => {
                    let found = state.jobs.get(&job.id).map(|j| j.version);
                    check_version("job", &job.id, *expected, found)?
                }
                Write::DeleteJob { job_id, expected } => {
                    let found = state.jobs.get(job_id).map(|j| j.version);
                    check_version("job", job_id, *expected, found)?
                }
            };
            versions.push(version);
        }

        let count = batch.len();
        for (write, version) in batch.into_iter().zip(versions) {
            match write {
                Write::PutProcess { mut tree, .. } => {
                    tree.version = version;
                    tree.mark_clean();
                    state
                        .processes
                        .insert(tree.process_instance_id().to_string(), tree);
                }
                Write::PutJob { mut job, .. } => {
                    job.version = version;
                    state.jobs.insert(job.id.clone(), job);
                }
                Write::DeleteJob { job_id, .. } => {
                    state.jobs.remove(&job_id);
                }
            }
        }
        debug!(writes = count, "Committed write batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Expected;

    #[tokio::test]
    async fn test_versions_advance_on_commit() {
        let storage = MemoryStorage::new();
        let job = JobRecord::new("noop", 3, Utc::now());
        let id = job.id.clone();

        let mut batch = WriteBatch::new();
        batch.put_job(job, Expected::Absent);
        storage.commit(batch).await.unwrap();

        let mut stored = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        stored.retries = 2;
        let mut batch = WriteBatch::new();
        batch.put_job(stored.clone(), Expected::Version(1));
        storage.commit(batch).await.unwrap();
        assert_eq!(storage.get_job(&id).await.unwrap().unwrap().version, 2);

        // a stale writer loses
        let mut batch = WriteBatch::new();
        batch.put_job(stored, Expected::Version(1));
        let err = storage.commit(batch).await.unwrap_err();
        assert!(err.is_optimistic_lock());
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let storage = MemoryStorage::new();
        let tree = ExecutionTree::new("pi-1");
        let job = JobRecord::new("noop", 3, Utc::now());
        let job_id = job.id.clone();

        let mut batch = WriteBatch::new();
        batch.put_process(tree, Expected::Absent);
        batch.put_job(job, Expected::Version(7));
        assert!(storage.commit(batch).await.is_err());

        assert!(storage.load_process("pi-1").await.unwrap().is_none());
        assert!(storage.get_job(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unconditional_delete_of_missing_job() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.delete_job("missing", Expected::Any);
        storage.commit(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquirable_jobs_ordered_by_due_date() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let later = JobRecord::new("noop", 3, now).due_at(now - chrono::Duration::seconds(1));
        let earlier = JobRecord::new("noop", 3, now).due_at(now - chrono::Duration::seconds(10));
        let mut exhausted = JobRecord::new("noop", 3, now);
        exhausted.retries = 0;
        let future = JobRecord::new("noop", 3, now).due_at(now + chrono::Duration::minutes(1));

        let mut batch = WriteBatch::new();
        for job in [later.clone(), earlier.clone(), exhausted, future] {
            batch.put_job(job, Expected::Absent);
        }
        storage.commit(batch).await.unwrap();

        let due = storage.acquirable_jobs(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
        assert_eq!(storage.acquirable_jobs(now, 1).await.unwrap().len(), 1);
    }
}
