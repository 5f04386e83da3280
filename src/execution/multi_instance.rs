//! Parallel multi-instance coordinator
//!
//! Forks one concurrent branch per instance under the multi-instance root,
//! runs the wrapped behavior on each branch and joins the branches back into a
//! single continuation exactly once. Loop bookkeeping lives in variables on
//! the root; `loopCounter` is branch-local.

use std::sync::Arc;
use tracing::debug;

use super::activity::{
    ActivityBehavior, ActivityDefinition, Completion, CompletionCondition, IoMapping,
};
use super::context::ProcessContext;
use super::tree::{ExecutionId, ExecutionTree, Value};
use crate::core::errors::{EngineError, Result};

pub const NUMBER_OF_INSTANCES: &str = "numberOfInstances";
pub const NUMBER_OF_ACTIVE_INSTANCES: &str = "numberOfActiveInstances";
pub const NUMBER_OF_COMPLETED_INSTANCES: &str = "numberOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

const MULTI_INSTANCE_COMPLETED: &str = "multi-instance completed";

/// Outcome of one branch completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The join fired and the outgoing transitions were taken
    Joined { joined: usize },
    /// Other branches are still outstanding
    Waiting,
}

pub struct ParallelMultiInstance {
    activity: ActivityDefinition,
    behavior: Arc<dyn ActivityBehavior>,
    io_mapping: Option<Arc<dyn IoMapping>>,
    completion_condition: Option<Arc<dyn CompletionCondition>>,
}

impl ParallelMultiInstance {
    pub fn new(activity: ActivityDefinition, behavior: Arc<dyn ActivityBehavior>) -> Self {
        Self {
            activity,
            behavior,
            io_mapping: None,
            completion_condition: None,
        }
    }

    pub fn with_io_mapping(mut self, mapping: Arc<dyn IoMapping>) -> Self {
        self.io_mapping = Some(mapping);
        self
    }

    pub fn with_completion_condition(mut self, condition: Arc<dyn CompletionCondition>) -> Self {
        self.completion_condition = Some(condition);
        self
    }

    pub fn activity(&self) -> &ActivityDefinition {
        &self.activity
    }

    /// Fork `n` branches under `root` and run the wrapped behavior on each.
    ///
    /// All branches exist before the first one runs: a synchronous branch may
    /// complete the whole multi-instance and prune its later siblings.
    pub fn create_instances(
        &self,
        cx: &mut ProcessContext,
        root: ExecutionId,
        n: usize,
    ) -> Result<()> {
        let total = n as i64;
        let tree = cx.tree_mut();
        tree.set_variable_local(root, NUMBER_OF_INSTANCES, Value::Int(total))?;
        tree.set_variable_local(root, NUMBER_OF_COMPLETED_INSTANCES, Value::Int(0))?;
        tree.set_variable_local(root, NUMBER_OF_ACTIVE_INSTANCES, Value::Int(total))?;

        self.fix_mi_root_activity_instance_id(cx, root)?;

        if n == 0 {
            debug!(activity = %self.activity.id, "No instances to create, leaving immediately");
            cx.tree_mut().inactivate(root)?;
            return cx.take_all(root, &self.activity.outgoing, &[]);
        }

        let branches = self.create_concurrent_executions(cx, root, n)?;

        for (loop_counter, branch) in branches.iter().copied().enumerate() {
            let tree = cx.tree();
            // an earlier synchronous branch may have completed the whole construct
            let runnable = tree.is_active(branch)
                && tree
                    .parent(branch)
                    .map(|p| tree.is_active(p))
                    .unwrap_or(false);
            if !runnable {
                debug!(loop_counter, branch = %branch, "Skipping branch, multi-instance already completed");
                continue;
            }
            cx.tree_mut()
                .set_variable_local(branch, LOOP_COUNTER, Value::Int(loop_counter as i64))?;
            self.execute_original_behavior(cx, branch, loop_counter)?;
        }

        if cx.tree().contains(root) {
            cx.tree_mut().inactivate(root)?;
        }
        Ok(())
    }

    fn create_concurrent_executions(
        &self,
        cx: &mut ProcessContext,
        root: ExecutionId,
        n: usize,
    ) -> Result<Vec<ExecutionId>> {
        let mut branches = Vec::with_capacity(n);
        for loop_counter in 0..n {
            let concurrent = cx.tree_mut().create_child(root)?;
            {
                let node = cx.tree_mut().node_mut(concurrent)?;
                node.is_active = true;
                node.is_concurrent = true;
                node.is_scope = false;
            }

            let mut branch = concurrent;
            if self.activity.requires_scope {
                let scope = cx.tree_mut().create_child(concurrent)?;
                let node = cx.tree_mut().node_mut(scope)?;
                node.is_active = true;
                node.is_concurrent = false;
                node.is_scope = true;
                branch = scope;
            }

            if let Some(mapping) = &self.io_mapping {
                mapping.apply_input(cx, branch)?;
            }

            for timer in &self.activity.timers {
                timer.create_instance(cx, branch)?;
            }

            branches.push(branch);
            log_loop_details(branch, "initialized", loop_counter as i64, 0, n as i64, n as i64);
        }
        Ok(branches)
    }

    fn execute_original_behavior(
        &self,
        cx: &mut ProcessContext,
        branch: ExecutionId,
        loop_counter: usize,
    ) -> Result<()> {
        // the first instance shares the activity instance already started for the construct
        if loop_counter != 0 {
            cx.enter_activity(branch)?;
        }
        match self.behavior.execute(cx, branch)? {
            Completion::Completed => {
                self.leave(cx, branch)?;
            }
            Completion::Waiting => {
                debug!(branch = %branch, loop_counter, "Branch waiting");
            }
        }
        Ok(())
    }

    /// Complete one branch and join if it was the last one needed.
    pub fn leave(&self, cx: &mut ProcessContext, execution: ExecutionId) -> Result<LeaveOutcome> {
        let (is_active, parent) = {
            let node = cx.tree().node(execution)?;
            (node.is_active, node.parent)
        };
        if !is_active {
            return Err(EngineError::structure(format!(
                "{execution} already completed its instance"
            )));
        }
        let parent = parent.ok_or_else(|| {
            EngineError::structure(format!("{execution} left without a parent"))
        })?;

        let requires_scope = self.activity.requires_scope;
        if !requires_scope {
            let own = cx.tree().node(execution)?.activity_instance_id.clone();
            let parents = cx.tree().node(parent)?.activity_instance_id.clone();
            if own != parents {
                cx.fire_activity_end(execution)?;
            }
        }

        let tree = cx.tree();
        let loop_counter = loop_variable(tree, execution, LOOP_COUNTER);
        let total = loop_variable(tree, execution, NUMBER_OF_INSTANCES);
        let completed = loop_variable(tree, execution, NUMBER_OF_COMPLETED_INSTANCES) + 1;
        let active = loop_variable(tree, execution, NUMBER_OF_ACTIVE_INSTANCES) - 1;

        let mut node = execution;
        let mut ended_scope_instance = None;
        if requires_scope {
            self.reset_mi_root_activity_instance_id(cx, node)?;
            ended_scope_instance = cx.tree().node(node)?.activity_instance_id.clone();
            node = parent;
            cx.tree_mut().remove(execution)?;
        }

        let root = cx
            .tree()
            .parent(node)
            .ok_or_else(|| EngineError::structure(format!("{node} has no multi-instance root")))?;
        let tree = cx.tree_mut();
        tree.set_variable_local(root, NUMBER_OF_COMPLETED_INSTANCES, Value::Int(completed))?;
        tree.set_variable_local(root, NUMBER_OF_ACTIVE_INSTANCES, Value::Int(active))?;
        log_loop_details(node, "instance completed", loop_counter, completed, active, total);

        let removed = tree.remove_event_subscriptions(node)?;
        if !removed.is_empty() {
            debug!(execution = %node, count = removed.len(), "Removed event subscriptions");
        }
        tree.inactivate(node)?;
        tree.force_update(root)?;

        let joined = tree.inactive_concurrent_siblings(node, &self.activity.id)?;
        let condition_met = joined.len() as i64 == total || self.completion_condition_satisfied(cx, node)?;

        if condition_met {
            self.reset_mi_root_activity_instance_id(cx, node)?;

            let still_active: Vec<ExecutionId> = cx
                .tree()
                .children(root)
                .iter()
                .copied()
                .filter(|child| cx.tree().is_active(*child))
                .collect();
            for child in still_active {
                debug!(
                    execution = %child,
                    "Execution still active, but multi-instance is completed. Removing it"
                );
                let tree = cx.tree_mut();
                tree.inactivate(child)?;
                tree.delete_cascade(child, MULTI_INSTANCE_COMPLETED)?;
            }

            cx.take_all(node, &self.activity.outgoing, &joined)?;
            Ok(LeaveOutcome::Joined {
                joined: joined.len(),
            })
        } else {
            if requires_scope {
                cx.fire_activity_end_of(node, ended_scope_instance)?;
            } else {
                cx.tree_mut().node_mut(node)?.activity_instance_id = None;
            }
            Ok(LeaveOutcome::Waiting)
        }
    }

    fn completion_condition_satisfied(&self, cx: &ProcessContext, node: ExecutionId) -> Result<bool> {
        match &self.completion_condition {
            Some(condition) => condition.evaluate(cx.tree(), node),
            None => Ok(false),
        }
    }

    /// The multi-instance root takes the activity instance id of its parent,
    /// so the construct itself is not a separate visible activity instance.
    fn fix_mi_root_activity_instance_id(&self, cx: &mut ProcessContext, root: ExecutionId) -> Result<()> {
        let inherited = cx.tree().parent_activity_instance_id(root)?;
        cx.tree_mut().node_mut(root)?.activity_instance_id = inherited;
        Ok(())
    }

    /// Restore the grandparent's activity instance id from the parent's.
    fn reset_mi_root_activity_instance_id(
        &self,
        cx: &mut ProcessContext,
        execution: ExecutionId,
    ) -> Result<()> {
        let tree = cx.tree();
        let Some(entering) = tree.parent(execution) else {
            return Ok(());
        };
        let Some(mi_root) = tree.parent(entering) else {
            return Ok(());
        };
        let activity_instance_id = tree.node(entering)?.activity_instance_id.clone();
        cx.tree_mut().node_mut(mi_root)?.activity_instance_id = activity_instance_id;
        Ok(())
    }
}

/// Read a loop variable, walking up to the multi-instance root. Missing reads as 0.
pub fn loop_variable(tree: &ExecutionTree, execution: ExecutionId, name: &str) -> i64 {
    tree.variable(execution, name)
        .and_then(Value::as_int)
        .unwrap_or(0)
}

fn log_loop_details(
    execution: ExecutionId,
    state: &str,
    loop_counter: i64,
    completed: i64,
    active: i64,
    total: i64,
) {
    debug!(
        execution = %execution,
        state,
        loop_counter,
        completed,
        active,
        total,
        "Multi-instance loop details"
    );
}
