// Core infrastructure modules
pub mod core;

// Execution tree and multi-instance fork/join
pub mod execution;

// Deferred work: jobs, the execution pipeline and workers
pub mod jobs;

pub mod engine;
pub mod storage;

// Re-exports for convenience
pub use crate::core::{EngineConfig, EngineError, Result};
pub use engine::ProcessEngine;
pub use execution::{
    ActivityDefinition, Completion, ExecutionId, ExecutionTree, ParallelMultiInstance,
    ProcessContext,
};
pub use jobs::{JobExecutionPipeline, JobOutcome, JobRecord};
pub use storage::{MemoryStorage, SledStorage, Storage};
