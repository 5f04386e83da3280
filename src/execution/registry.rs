use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use super::multi_instance::ParallelMultiInstance;
use crate::core::errors::{EngineError, Result};

/// Multi-instance coordinators keyed by activity id.
///
/// Shared between the command that forks a multi-instance and the job handler
/// that later completes its asynchronous branches.
#[derive(Default)]
pub struct ActivityRegistry {
    coordinators: DashMap<String, Arc<ParallelMultiInstance>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, coordinator: Arc<ParallelMultiInstance>) -> Result<()> {
        let activity_id = coordinator.activity().id.clone();
        if self.coordinators.contains_key(&activity_id) {
            return Err(EngineError::configuration(format!(
                "activity '{activity_id}' is already registered"
            )));
        }
        info!("Registered multi-instance activity: {}", activity_id);
        self.coordinators.insert(activity_id, coordinator);
        Ok(())
    }

    pub fn get(&self, activity_id: &str) -> Option<Arc<ParallelMultiInstance>> {
        self.coordinators.get(activity_id).map(|c| Arc::clone(c.value()))
    }

    pub fn list(&self) -> Vec<String> {
        self.coordinators.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::activity::{ActivityDefinition, PassThrough};

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ActivityRegistry::new();
        let coordinator = Arc::new(ParallelMultiInstance::new(
            ActivityDefinition::new("review"),
            Arc::new(PassThrough),
        ));
        registry.register(coordinator.clone()).unwrap();
        assert!(registry.register(coordinator).is_err());
        assert!(registry.get("review").is_some());
        assert_eq!(registry.list(), vec!["review".to_string()]);
    }
}
