//! Activity definitions and the collaborator seams the multi-instance
//! coordinator drives: the wrapped behavior, the optional input/output
//! mapping and the optional completion condition.

use chrono::Duration;

use super::context::ProcessContext;
use super::tree::{ExecutionId, ExecutionTree};
use crate::core::errors::{EngineError, Result};
use crate::jobs::model::{JobId, JobRecord};

/// Static description of an activity in a process definition
#[derive(Clone, Debug)]
pub struct ActivityDefinition {
    pub id: String,
    /// Transitions taken when the activity completes
    pub outgoing: Vec<String>,
    /// Each instance needs its own nested scope (e.g. a subprocess with local variables)
    pub requires_scope: bool,
    /// Timers created for every instance
    pub timers: Vec<TimerDeclaration>,
}

impl ActivityDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outgoing: Vec::new(),
            requires_scope: false,
            timers: Vec::new(),
        }
    }

    pub fn with_outgoing(mut self, transition: impl Into<String>) -> Self {
        self.outgoing.push(transition.into());
        self
    }

    pub fn with_scope(mut self) -> Self {
        self.requires_scope = true;
        self
    }

    pub fn with_timer(mut self, timer: TimerDeclaration) -> Self {
        self.timers.push(timer);
        self
    }
}

/// A timer attached to an activity; instantiated as a job per instance
#[derive(Clone, Debug)]
pub struct TimerDeclaration {
    pub handler_type: String,
    pub delay: Duration,
    /// Overrides the engine-wide default when set
    pub retries: Option<u32>,
}

impl TimerDeclaration {
    pub fn new(handler_type: impl Into<String>, delay: Duration) -> Self {
        Self {
            handler_type: handler_type.into(),
            delay,
            retries: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Create the timer job bound to `execution`
    pub fn create_instance(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<JobId> {
        if !cx.tree().contains(execution) {
            return Err(EngineError::execution_not_found(execution));
        }
        let now = cx.now();
        let retries = self.retries.unwrap_or_else(|| cx.default_job_retries());
        let job = JobRecord::new(self.handler_type.clone(), retries, now)
            .for_execution(cx.tree().process_instance_id(), execution)
            .due_at(now + self.delay);
        Ok(cx.create_job(job))
    }
}

/// What the wrapped behavior did with an execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Finished synchronously; the coordinator leaves the branch
    Completed,
    /// Parked until something (usually a job) completes it later
    Waiting,
}

/// The single-instance logic of the wrapped activity
pub trait ActivityBehavior: Send + Sync {
    fn execute(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<Completion>;
}

/// Behavior that completes as soon as it is entered
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl ActivityBehavior for PassThrough {
    fn execute(&self, _cx: &mut ProcessContext, _execution: ExecutionId) -> Result<Completion> {
        Ok(Completion::Completed)
    }
}

/// Behavior that parks every instance
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitState;

impl ActivityBehavior for WaitState {
    fn execute(&self, _cx: &mut ProcessContext, _execution: ExecutionId) -> Result<Completion> {
        Ok(Completion::Waiting)
    }
}

impl<F> ActivityBehavior for F
where
    F: Fn(&mut ProcessContext, ExecutionId) -> Result<Completion> + Send + Sync,
{
    fn execute(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<Completion> {
        self(cx, execution)
    }
}

/// Input mapping applied to each instance before its behavior runs
pub trait IoMapping: Send + Sync {
    fn apply_input(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<()>;
}

impl<F> IoMapping for F
where
    F: Fn(&mut ProcessContext, ExecutionId) -> Result<()> + Send + Sync,
{
    fn apply_input(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<()> {
        self(cx, execution)
    }
}

/// Predicate that ends the multi-instance early
pub trait CompletionCondition: Send + Sync {
    fn evaluate(&self, tree: &ExecutionTree, execution: ExecutionId) -> Result<bool>;
}

impl<F> CompletionCondition for F
where
    F: Fn(&ExecutionTree, ExecutionId) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, tree: &ExecutionTree, execution: ExecutionId) -> Result<bool> {
        self(tree, execution)
    }
}

