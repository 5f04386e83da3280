use thiserror::Error;

/// Unified error type for the process engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A versioned document was modified by another transaction between read and commit
    #[error("Optimistic locking conflict on {entity} '{id}' (expected version {expected:?}, found {found:?})")]
    OptimisticLock {
        entity: &'static str,
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// The failed-job listener hit its contention bound; the failure itself was not recorded
    #[error("Failure of job {job_id} could not be recorded: {source}")]
    FailureNotRecorded {
        job_id: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Job does not exist (deleted, or never created)
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Job has no retries left and must not be executed again
    #[error("Job {job_id} has no retries left")]
    RetriesExhausted { job_id: String },

    /// No handler registered for a job type
    #[error("No job handler registered for type '{handler_type}'")]
    HandlerNotFound { handler_type: String },

    /// Unchecked failure while executing a job, wrapped with the job id
    #[error("Job {job_id} failed: {message}")]
    JobExecutionFailed { job_id: String, message: String },

    /// Structural invariant of the execution tree violated
    #[error("Execution tree invariant violated: {message}")]
    Structure { message: String },

    #[error("Execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    #[error("Process instance not found: {process_instance_id}")]
    ProcessNotFound { process_instance_id: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization failed: {format}: {message}")]
    Serialization { format: &'static str, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Business failure raised by a job handler or activity behavior
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl EngineError {
    pub fn optimistic_lock(
        entity: &'static str,
        id: impl Into<String>,
        expected: Option<u64>,
        found: Option<u64>,
    ) -> Self {
        Self::OptimisticLock {
            entity,
            id: id.into(),
            expected,
            found,
        }
    }

    pub fn structure(message: impl Into<String>) -> Self {
        Self::Structure {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn job_not_found(job_id: impl ToString) -> Self {
        Self::JobNotFound {
            job_id: job_id.to_string(),
        }
    }

    pub fn execution_not_found(execution_id: impl ToString) -> Self {
        Self::ExecutionNotFound {
            execution_id: execution_id.to_string(),
        }
    }

    /// True for write-contention failures that a mechanical retry may resolve
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    /// Check if the error may go away when the enclosing command is retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OptimisticLock { .. }
            | Self::FailureNotRecorded { .. }
            | Self::Io(_)
            | Self::Storage(_) => true,
            Self::Handler(_) | Self::JobExecutionFailed { .. } => true,
            Self::JobNotFound { .. }
            | Self::ExecutionNotFound { .. }
            | Self::ProcessNotFound { .. }
            | Self::RetriesExhausted { .. }
            | Self::HandlerNotFound { .. }
            | Self::Structure { .. }
            | Self::Configuration { .. }
            | Self::InvalidArgument { .. }
            | Self::Serialization { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::OptimisticLock { .. } | Self::FailureNotRecorded { .. } => "contention",
            Self::JobNotFound { .. }
            | Self::ExecutionNotFound { .. }
            | Self::ProcessNotFound { .. } => "not_found",
            Self::RetriesExhausted { .. } => "exhausted",
            Self::HandlerNotFound { .. } | Self::Configuration { .. } => "configuration",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::JobExecutionFailed { .. } | Self::Handler(_) => "business",
            Self::Structure { .. } => "structure",
            Self::Storage(_) | Self::Io(_) => "storage",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization {
            format: "bincode",
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml",
            message: err.to_string(),
        }
    }
}
