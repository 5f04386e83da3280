// Jobs: model, commands, handlers, the execution pipeline and workers

pub mod acquisition;
pub mod command;
pub mod handler;
pub mod management;
pub mod metrics;
pub mod model;
pub mod pipeline;

pub use acquisition::{AcquireJobsCmd, JobExecutorService};
pub use command::{Command, CommandContext, CommandExecutor, TransactionalExecutor};
pub use handler::{BranchCompletionHandler, JobHandler, JobHandlerRegistry};
pub use management::SetJobRetriesCmd;
pub use metrics::{JobMetrics, JobMetricsSnapshot};
pub use model::{FailureRecord, JobId, JobRecord, JobState};
pub use pipeline::{
    retry_on_conflict, ExecuteJobCmd, FailedJobListener, JobExecutionPipeline, JobOutcome,
    ListenerOutcome, SuccessfulJobListener,
};
