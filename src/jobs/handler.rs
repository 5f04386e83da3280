use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::command::CommandContext;
use super::model::JobRecord;
use crate::core::errors::{EngineError, Result};
use crate::execution::registry::ActivityRegistry;

/// Business logic behind a job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type this handler serves
    fn handler_type(&self) -> &str;

    /// Run the job inside the caller's unit of work
    async fn execute(&self, job: &JobRecord, cx: &mut CommandContext) -> Result<()>;
}

/// Registry of job handlers by type
pub struct JobHandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one of the same type
    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn list(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for JobHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes an asynchronous multi-instance branch when its job fires
pub struct BranchCompletionHandler {
    activities: Arc<ActivityRegistry>,
}

impl BranchCompletionHandler {
    pub const TYPE: &'static str = "multi-instance-branch-completion";

    pub fn new(activities: Arc<ActivityRegistry>) -> Self {
        Self { activities }
    }
}

#[async_trait]
impl JobHandler for BranchCompletionHandler {
    fn handler_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, job: &JobRecord, cx: &mut CommandContext) -> Result<()> {
        let (Some(process_instance_id), Some(execution)) =
            (job.process_instance_id.as_deref(), job.execution_id)
        else {
            return Err(EngineError::structure(format!(
                "job {} is not bound to an execution",
                job.id
            )));
        };

        let process = cx.process(process_instance_id).await?;
        let activity_id = process
            .tree()
            .node(execution)?
            .activity_id
            .clone()
            .ok_or_else(|| {
                EngineError::structure(format!("{execution} is not positioned at an activity"))
            })?;
        let coordinator = self.activities.get(&activity_id).ok_or_else(|| {
            EngineError::configuration(format!("no multi-instance activity '{activity_id}'"))
        })?;

        let outcome = coordinator.leave(process, execution)?;
        debug!(
            job_id = %job.id,
            execution = %execution,
            ?outcome,
            "Branch completed by job"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = JobHandlerRegistry::new();
        registry.register(Arc::new(BranchCompletionHandler::new(Arc::new(
            ActivityRegistry::new(),
        ))));
        assert!(registry.contains(BranchCompletionHandler::TYPE));
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.list(), vec![BranchCompletionHandler::TYPE.to_string()]);
    }
}
