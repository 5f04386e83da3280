// Execution tree and the parallel multi-instance fork/join

pub mod activity;
pub mod context;
pub mod multi_instance;
pub mod registry;
pub mod tree;

pub use activity::{
    ActivityBehavior, ActivityDefinition, Completion, CompletionCondition, IoMapping, PassThrough,
    TimerDeclaration, WaitState,
};
pub use context::{ActivityEvent, ProcessContext};
pub use multi_instance::{
    loop_variable, LeaveOutcome, ParallelMultiInstance, LOOP_COUNTER, NUMBER_OF_ACTIVE_INSTANCES,
    NUMBER_OF_COMPLETED_INSTANCES, NUMBER_OF_INSTANCES,
};
pub use registry::ActivityRegistry;
pub use tree::{Continuation, ExecutionId, ExecutionNode, ExecutionTree, RemovedExecution, Value};
