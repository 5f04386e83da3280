use chrono::{DateTime, Utc};
use tracing::debug;

use super::tree::{Continuation, ExecutionId, ExecutionTree};
use crate::core::errors::{EngineError, Result};
use crate::jobs::model::{JobId, JobRecord};

/// Activity lifecycle notification recorded while a command runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivityEvent {
    Start {
        execution: ExecutionId,
        activity_id: String,
        activity_instance_id: String,
    },
    End {
        execution: ExecutionId,
        activity_id: String,
        activity_instance_id: Option<String>,
    },
}

/// Mutable view of one process instance inside a command.
///
/// Holds the execution tree plus the side effects produced while operating on
/// it: jobs to insert and activity events to publish.
#[derive(Debug)]
pub struct ProcessContext {
    tree: ExecutionTree,
    now: DateTime<Utc>,
    default_job_retries: u32,
    created_jobs: Vec<JobRecord>,
    events: Vec<ActivityEvent>,
}

impl ProcessContext {
    pub fn new(tree: ExecutionTree, now: DateTime<Utc>, default_job_retries: u32) -> Self {
        Self {
            tree,
            now,
            default_job_retries,
            created_jobs: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ExecutionTree {
        &mut self.tree
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn default_job_retries(&self) -> u32 {
        self.default_job_retries
    }

    pub fn create_job(&mut self, job: JobRecord) -> JobId {
        let id = job.id.clone();
        debug!(job_id = %id, handler = %job.handler_type, "Job created");
        self.created_jobs.push(job);
        id
    }

    pub fn created_jobs(&self) -> &[JobRecord] {
        &self.created_jobs
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }

    /// Give the node a fresh activity instance id and record the start.
    pub fn enter_activity(&mut self, execution: ExecutionId) -> Result<String> {
        let node = self.tree.node_mut(execution)?;
        let activity_id = node.activity_id.clone().ok_or_else(|| {
            EngineError::structure(format!("{execution} is not positioned at an activity"))
        })?;
        let activity_instance_id = format!("{}:{}", activity_id, cuid2::create_id());
        node.activity_instance_id = Some(activity_instance_id.clone());
        self.events.push(ActivityEvent::Start {
            execution,
            activity_id,
            activity_instance_id: activity_instance_id.clone(),
        });
        Ok(activity_instance_id)
    }

    /// Record the end of the activity instance the node currently holds.
    pub fn fire_activity_end(&mut self, execution: ExecutionId) -> Result<()> {
        let node = self.tree.node(execution)?;
        let activity_instance_id = node.activity_instance_id.clone();
        self.fire_activity_end_of(execution, activity_instance_id)
    }

    pub fn fire_activity_end_of(
        &mut self,
        execution: ExecutionId,
        activity_instance_id: Option<String>,
    ) -> Result<()> {
        let activity_id = self.tree.node(execution)?.activity_id.clone().unwrap_or_default();
        self.events.push(ActivityEvent::End {
            execution,
            activity_id,
            activity_instance_id,
        });
        Ok(())
    }

    /// Take the outgoing transitions from `execution`, consuming the joined branches.
    ///
    /// The joined nodes are removed and the taken transitions are queued on the
    /// tree for the engine to continue from the parent scope.
    pub fn take_all(
        &mut self,
        execution: ExecutionId,
        transitions: &[String],
        joined: &[ExecutionId],
    ) -> Result<()> {
        let node = self.tree.node(execution)?;
        let activity_id = node.activity_id.clone().unwrap_or_default();
        let scope = if node.is_concurrent {
            node.parent.ok_or_else(|| {
                EngineError::structure(format!("concurrent {execution} has no parent"))
            })?
        } else {
            execution
        };

        for id in joined {
            if *id != scope && self.tree.contains(*id) {
                self.tree.remove(*id)?;
            }
        }
        debug!(
            scope = %scope,
            joined = joined.len(),
            transitions = ?transitions,
            "Taking outgoing transitions"
        );
        self.tree.push_continuation(Continuation {
            scope,
            activity_id,
            transitions: transitions.to_vec(),
            joined: joined.to_vec(),
        });
        Ok(())
    }

    pub fn into_parts(self) -> (ExecutionTree, Vec<JobRecord>, Vec<ActivityEvent>) {
        (self.tree, self.created_jobs, self.events)
    }
}
