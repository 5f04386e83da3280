//! Transactional commands
//!
//! A [`Command`] runs against a [`CommandContext`] that records which
//! versions it read and buffers every change. When the command returns, the
//! executor turns the context into one [`WriteBatch`] and commits it; a stale
//! read surfaces as [`EngineError::OptimisticLock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

use super::model::{JobId, JobRecord};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::execution::context::ProcessContext;
use crate::execution::tree::ExecutionTree;
use crate::storage::{Expected, Storage, WriteBatch};

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn execute(&self, cx: &mut CommandContext) -> Result<Self::Output>;
}

/// Runs commands inside a unit of work
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute<C>(&self, command: &C) -> Result<C::Output>
    where
        C: Command + ?Sized;
}

enum PendingJob {
    Put(JobRecord),
    Delete,
}

struct LoadedProcess {
    context: ProcessContext,
    /// `None` for a process created in this unit of work
    read_version: Option<u64>,
}

/// Unit of work for one command
pub struct CommandContext {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
    now: DateTime<Utc>,
    /// Job snapshots as read from storage; `None` records a read that found nothing
    read_jobs: HashMap<JobId, Option<JobRecord>>,
    pending_jobs: HashMap<JobId, PendingJob>,
    processes: HashMap<String, LoadedProcess>,
}

impl CommandContext {
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>, now: DateTime<Utc>) -> Self {
        Self {
            storage,
            config,
            now,
            read_jobs: HashMap::new(),
            pending_jobs: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Read a job, seeing this unit of work's own changes
    pub async fn job(&mut self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.pending_jobs.get(job_id) {
            Some(PendingJob::Put(job)) => return Ok(Some(job.clone())),
            Some(PendingJob::Delete) => return Ok(None),
            None => {}
        }
        if let Some(read) = self.read_jobs.get(job_id) {
            return Ok(read.clone());
        }
        let job = self.storage.get_job(job_id).await?;
        self.read_jobs.insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    /// Stage an update of a job previously read through [`Self::job`]
    pub fn update_job(&mut self, job: JobRecord) {
        self.pending_jobs.insert(job.id.clone(), PendingJob::Put(job));
    }

    /// Stage a new job
    pub fn insert_job(&mut self, job: JobRecord) {
        self.read_jobs.entry(job.id.clone()).or_insert(None);
        self.pending_jobs.insert(job.id.clone(), PendingJob::Put(job));
    }

    pub fn delete_job(&mut self, job_id: &str) {
        self.pending_jobs
            .insert(job_id.to_string(), PendingJob::Delete);
    }

    /// Load a process instance into the unit of work
    pub async fn process(&mut self, process_instance_id: &str) -> Result<&mut ProcessContext> {
        if !self.processes.contains_key(process_instance_id) {
            let tree = self
                .storage
                .load_process(process_instance_id)
                .await?
                .ok_or_else(|| EngineError::ProcessNotFound {
                    process_instance_id: process_instance_id.to_string(),
                })?;
            let read_version = Some(tree.version());
            self.processes.insert(
                process_instance_id.to_string(),
                LoadedProcess {
                    context: ProcessContext::new(tree, self.now, self.config.default_job_retries),
                    read_version,
                },
            );
        }
        self.processes
            .get_mut(process_instance_id)
            .map(|p| &mut p.context)
            .ok_or_else(|| EngineError::ProcessNotFound {
                process_instance_id: process_instance_id.to_string(),
            })
    }

    /// Like [`Self::process`] but `None` when the process instance does not exist
    pub async fn try_process(&mut self, process_instance_id: &str) -> Result<Option<&mut ProcessContext>> {
        match self.process(process_instance_id).await {
            Ok(process) => Ok(Some(process)),
            Err(EngineError::ProcessNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Register a new process instance with this unit of work
    pub fn start_process(&mut self, tree: ExecutionTree) -> Result<&mut ProcessContext> {
        let id = tree.process_instance_id().to_string();
        if self.processes.contains_key(&id) {
            return Err(EngineError::structure(format!(
                "process instance {id} already loaded"
            )));
        }
        let context = ProcessContext::new(tree, self.now, self.config.default_job_retries);
        let loaded = self.processes.entry(id).or_insert(LoadedProcess {
            context,
            read_version: None,
        });
        Ok(&mut loaded.context)
    }

    /// Turn the buffered changes into one batch.
    ///
    /// Jobs of executions removed from a tree are deleted with it; jobs created
    /// for executions already removed are dropped.
    pub async fn into_batch(self) -> Result<WriteBatch> {
        let Self {
            storage,
            read_jobs,
            mut pending_jobs,
            processes,
            ..
        } = self;

        let mut batch = WriteBatch::new();
        let mut cascade: BTreeSet<JobId> = BTreeSet::new();

        for (id, loaded) in processes {
            let (mut tree, created_jobs, events) = loaded.context.into_parts();
            let removed = tree.drain_removed();

            for event in &events {
                trace!(process_instance_id = %id, ?event, "Activity event");
            }

            for job in created_jobs {
                let orphaned = job
                    .execution_id
                    .map(|execution| !tree.contains(execution))
                    .unwrap_or(false);
                if orphaned {
                    debug!(job_id = %job.id, "Dropping job created for removed execution");
                    continue;
                }
                batch.put_job(job, Expected::Absent);
            }

            for execution in &removed {
                for job in storage.jobs_for_execution(&id, execution.id).await? {
                    debug!(
                        job_id = %job.id,
                        execution = %execution.id,
                        reason = %execution.reason,
                        "Deleting job of removed execution"
                    );
                    cascade.insert(job.id);
                }
            }

            if tree.is_modified() || loaded.read_version.is_none() {
                batch.put_process(tree, Expected::from_read(loaded.read_version));
            }
        }

        for (job_id, pending) in pending_jobs.drain() {
            let read_version = read_jobs
                .get(&job_id)
                .and_then(|r| r.as_ref().map(|job| job.version));
            match pending {
                PendingJob::Put(job) => {
                    cascade.remove(&job_id);
                    batch.put_job(job, Expected::from_read(read_version));
                }
                PendingJob::Delete => {
                    cascade.remove(&job_id);
                    let expected = match read_version {
                        Some(v) => Expected::Version(v),
                        None => Expected::Any,
                    };
                    batch.delete_job(job_id, expected);
                }
            }
        }

        for job_id in cascade {
            batch.delete_job(job_id, Expected::Any);
        }
        Ok(batch)
    }
}

/// Executes each command in its own unit of work and commits the result
pub struct TransactionalExecutor {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl TransactionalExecutor {
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn Storage>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            clock,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[async_trait]
impl CommandExecutor for TransactionalExecutor {
    async fn execute<C>(&self, command: &C) -> Result<C::Output>
    where
        C: Command + ?Sized,
    {
        let mut cx = CommandContext::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
            self.clock.now(),
        );
        let output = command.execute(&mut cx).await?;
        let batch = cx.into_batch().await?;
        if !batch.is_empty() {
            let writes = batch.len();
            self.storage.commit(batch).await?;
            trace!(command = command.name(), writes, "Command committed");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    struct BumpRetries {
        job_id: JobId,
    }

    #[async_trait]
    impl Command for BumpRetries {
        type Output = u32;

        fn name(&self) -> &'static str {
            "bump-retries"
        }

        async fn execute(&self, cx: &mut CommandContext) -> Result<u32> {
            let mut job = cx
                .job(&self.job_id)
                .await?
                .ok_or_else(|| EngineError::job_not_found(&self.job_id))?;
            job.retries += 1;
            let retries = job.retries;
            cx.update_job(job);
            Ok(retries)
        }
    }

    #[tokio::test]
    async fn test_command_commits_changes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let executor = TransactionalExecutor::new(storage.clone(), Arc::new(EngineConfig::default()));

        let job = JobRecord::new("noop", 1, Utc::now());
        let mut batch = WriteBatch::new();
        batch.put_job(job.clone(), Expected::Absent);
        storage.commit(batch).await.unwrap();

        let retries = executor
            .execute(&BumpRetries {
                job_id: job.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(retries, 2);

        let stored = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.retries, 2);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_cascade_deletes_jobs_of_removed_executions() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = Arc::new(EngineConfig::default());
        let now = Utc::now();

        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        let branch = tree.create_child(root).unwrap();
        let job = JobRecord::new("timer", 3, now).for_execution("pi-1", branch);
        let mut batch = WriteBatch::new();
        batch.put_process(tree, Expected::Absent);
        batch.put_job(job.clone(), Expected::Absent);
        storage.commit(batch).await.unwrap();

        let mut cx = CommandContext::new(storage.clone(), config, now);
        cx.process("pi-1")
            .await
            .unwrap()
            .tree_mut()
            .delete_cascade(branch, "cancelled")
            .unwrap();
        let batch = cx.into_batch().await.unwrap();
        storage.commit(batch).await.unwrap();

        assert!(storage.get_job(&job.id).await.unwrap().is_none());
        let tree = storage.load_process("pi-1").await.unwrap().unwrap();
        assert!(!tree.contains(branch));
        assert_eq!(tree.version(), 2);
    }
}
