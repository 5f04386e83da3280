use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::execution::multi_instance::{LeaveOutcome, ParallelMultiInstance};
use crate::execution::registry::ActivityRegistry;
use crate::execution::tree::{ExecutionId, ExecutionTree};
use crate::jobs::acquisition::JobExecutorService;
use crate::jobs::command::{Command, CommandContext, CommandExecutor, TransactionalExecutor};
use crate::jobs::handler::{BranchCompletionHandler, JobHandler, JobHandlerRegistry};
use crate::jobs::management::SetJobRetriesCmd;
use crate::jobs::model::{JobId, JobRecord, JobState};
use crate::jobs::pipeline::{JobExecutionPipeline, JobOutcome};
use crate::storage::{MemoryStorage, SledStorage, Storage};

/// Start a process instance positioned at a multi-instance activity and fork it
pub struct StartMultiInstanceCmd {
    pub process_instance_id: String,
    pub coordinator: Arc<ParallelMultiInstance>,
    pub instances: usize,
}

#[async_trait]
impl Command for StartMultiInstanceCmd {
    type Output = ExecutionId;

    fn name(&self) -> &'static str {
        "start-multi-instance"
    }

    /// Returns the multi-instance root
    async fn execute(&self, cx: &mut CommandContext) -> Result<ExecutionId> {
        let mut tree = ExecutionTree::new(self.process_instance_id.clone());
        let root = tree.create_child(tree.root())?;
        {
            let node = tree.node_mut(root)?;
            node.activity_id = Some(self.coordinator.activity().id.clone());
            node.is_scope = true;
        }
        let process = cx.start_process(tree)?;
        self.coordinator
            .create_instances(process, root, self.instances)?;
        Ok(root)
    }
}

/// Complete a waiting branch from outside (e.g. a user task was finished)
pub struct CompleteBranchCmd {
    pub process_instance_id: String,
    pub execution: ExecutionId,
    pub activities: Arc<ActivityRegistry>,
}

#[async_trait]
impl Command for CompleteBranchCmd {
    type Output = LeaveOutcome;

    fn name(&self) -> &'static str {
        "complete-branch"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<LeaveOutcome> {
        let process = cx.process(&self.process_instance_id).await?;
        let activity_id = process
            .tree()
            .node(self.execution)?
            .activity_id
            .clone()
            .unwrap_or_default();
        let coordinator = self.activities.get(&activity_id).ok_or_else(|| {
            EngineError::configuration(format!("no multi-instance activity '{activity_id}'"))
        })?;
        coordinator.leave(process, self.execution)
    }
}

/// Storage, registries and the job pipeline wired together
pub struct ProcessEngine {
    config: Arc<EngineConfig>,
    storage: Arc<dyn Storage>,
    executor: Arc<TransactionalExecutor>,
    activities: Arc<ActivityRegistry>,
    handlers: Arc<JobHandlerRegistry>,
    pipeline: Arc<JobExecutionPipeline<TransactionalExecutor>>,
}

impl ProcessEngine {
    /// Create an engine on sled when `storage_path` is set, in memory otherwise
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => {
                info!("Starting process engine with storage at: {:?}", path);
                Arc::new(SledStorage::open(path)?)
            }
            None => {
                info!("Starting process engine with in-memory storage");
                Arc::new(MemoryStorage::new())
            }
        };
        Self::with_storage(config, storage, Arc::new(SystemClock))
    }

    pub fn with_storage(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let executor = Arc::new(TransactionalExecutor::with_clock(
            Arc::clone(&storage),
            Arc::clone(&config),
            clock,
        ));
        let activities = Arc::new(ActivityRegistry::new());
        let handlers = Arc::new(JobHandlerRegistry::new());
        handlers.register(Arc::new(BranchCompletionHandler::new(Arc::clone(
            &activities,
        ))));
        let pipeline = Arc::new(JobExecutionPipeline::new(
            Arc::clone(&executor),
            Arc::clone(&handlers),
            &config,
        ));

        Ok(Self {
            config,
            storage,
            executor,
            activities,
            handlers,
            pipeline,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn executor(&self) -> &Arc<TransactionalExecutor> {
        &self.executor
    }

    pub fn pipeline(&self) -> &Arc<JobExecutionPipeline<TransactionalExecutor>> {
        &self.pipeline
    }

    pub fn activities(&self) -> &Arc<ActivityRegistry> {
        &self.activities
    }

    pub fn register_activity(&self, coordinator: Arc<ParallelMultiInstance>) -> Result<()> {
        self.activities.register(coordinator)
    }

    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        self.handlers.register(handler);
    }

    /// Start a new process instance at a registered multi-instance activity.
    ///
    /// Returns the process instance id.
    pub async fn start_multi_instance(&self, activity_id: &str, instances: usize) -> Result<String> {
        let coordinator = self.activities.get(activity_id).ok_or_else(|| {
            EngineError::configuration(format!("no multi-instance activity '{activity_id}'"))
        })?;
        let process_instance_id = cuid2::create_id();
        self.executor
            .execute(&StartMultiInstanceCmd {
                process_instance_id: process_instance_id.clone(),
                coordinator,
                instances,
            })
            .await?;
        info!(
            process_instance_id = %process_instance_id,
            activity = activity_id,
            instances,
            "Multi-instance started"
        );
        Ok(process_instance_id)
    }

    pub async fn complete_branch(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> Result<LeaveOutcome> {
        self.executor
            .execute(&CompleteBranchCmd {
                process_instance_id: process_instance_id.to_string(),
                execution,
                activities: Arc::clone(&self.activities),
            })
            .await
    }

    pub async fn execute_job(&self, job_id: &str) -> Result<JobOutcome> {
        self.pipeline.execute_job(job_id).await
    }

    pub async fn load_process(&self, process_instance_id: &str) -> Result<ExecutionTree> {
        self.storage
            .load_process(process_instance_id)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound {
                process_instance_id: process_instance_id.to_string(),
            })
    }

    /// Every job, including exhausted ones awaiting operator attention
    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        self.storage.list_jobs().await
    }

    /// Jobs with no retries left, waiting for an operator
    pub async fn exhausted_jobs(&self) -> Result<Vec<JobRecord>> {
        let now = self.executor.clock().now();
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .filter(|job| job.state(now) == JobState::Exhausted)
            .collect())
    }

    /// Give jobs a fresh retries budget and make them due now
    pub async fn set_job_retries(&self, job_ids: &[JobId], retries: u32) -> Result<()> {
        let updated = self
            .executor
            .execute(&SetJobRetriesCmd {
                job_ids: job_ids.to_vec(),
                retries,
            })
            .await?;
        info!(jobs = updated, retries, "Job retries reset");
        Ok(())
    }

    pub fn start_job_executor(&self) -> Result<JobExecutorService> {
        JobExecutorService::start(Arc::clone(&self.pipeline), &self.config)
    }

    pub async fn flush(&self) -> Result<()> {
        self.storage.flush().await
    }
}
