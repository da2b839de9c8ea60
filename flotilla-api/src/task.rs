// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task states, configs, and runtime records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use flotilla_common::ids::{JobId, RunId, TaskId};
use flotilla_common::resources::ResourceVector;

/// Workload class of a task, used to partition placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Batch,
    Stateless,
    Daemon,
    Stateful,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Batch
    }
}

/// Task lifecycle states shared by the resource manager and the job manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskState {
    Initialized,
    Pending,
    Ready,
    Placing,
    Placed,
    Launching,
    Launched,
    Running,
    Preempting,
    Killing,
    Succeeded,
    Failed,
    Killed,
    Lost,
    Preempted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Preempted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-task restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Retries stop once `failure_count` reaches this.
    pub max_failures: u32,
    /// Base delay before re-initializing a failed task.
    pub backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_failures: 0,
            backoff_ms: 30_000,
        }
    }
}

/// Immutable per-instance task configuration (one config version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub resource: ResourceVector,
    pub task_type: TaskType,
    pub priority: u32,
    pub preemptible: bool,
    pub restart_policy: RestartPolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            resource: ResourceVector::ZERO,
            task_type: TaskType::Batch,
            priority: 0,
            preemptible: true,
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// The resource manager's view of a task: everything the scheduler,
/// preemptor, and placement engine need, nothing more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmTaskSpec {
    pub task_id: TaskId,
    /// Current execution attempt; a requeue supersedes the tracked attempt
    /// only when this differs.
    pub run_id: RunId,
    pub job_id: JobId,
    pub gang_id: Option<String>,
    pub task_type: TaskType,
    pub priority: u32,
    pub resource: ResourceVector,
    pub preemptible: bool,
    pub hostname: Option<String>,
}

impl RmTaskSpec {
    pub fn new(task_id: TaskId, run: u64, config: &TaskConfig) -> Self {
        let job_id = task_id.job_id.clone();
        Self {
            run_id: RunId {
                task_id: task_id.clone(),
                run,
            },
            task_id,
            job_id,
            gang_id: None,
            task_type: config.task_type,
            priority: config.priority,
            resource: config.resource,
            preemptible: config.preemptible,
            hostname: None,
        }
    }
}

/// The job manager's durable per-task runtime record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub state: TaskState,
    pub goal_state: TaskState,
    pub run_id: RunId,
    pub prev_run_id: Option<RunId>,
    pub config_version: u64,
    pub desired_config_version: u64,
    pub failure_count: u32,
    pub reason: String,
    pub message: String,
    pub host: Option<String>,
    pub ports: BTreeMap<String, u32>,
    /// Monotonically increasing write version; stale writes are rejected by
    /// the store.
    pub revision: u64,
}

impl TaskRuntime {
    /// A task with no prior execution: fresh run id, zero failures.
    pub fn initial(task_id: TaskId, goal_state: TaskState) -> Self {
        Self {
            state: TaskState::Initialized,
            goal_state,
            run_id: RunId::first(task_id),
            prev_run_id: None,
            config_version: 0,
            desired_config_version: 0,
            failure_count: 0,
            reason: String::new(),
            message: String::new(),
            host: None,
            ports: BTreeMap::new(),
            revision: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::ids::JobId;

    #[test]
    fn test_terminal_states() {
        for s in [
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Killed,
            TaskState::Lost,
            TaskState::Preempted,
        ] {
            assert!(s.is_terminal());
        }
        for s in [
            TaskState::Initialized,
            TaskState::Running,
            TaskState::Preempting,
            TaskState::Killing,
        ] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn test_initial_runtime() {
        let tid = TaskId::new(JobId::from("j"), 0);
        let rt = TaskRuntime::initial(tid.clone(), TaskState::Succeeded);
        assert_eq!(rt.state, TaskState::Initialized);
        assert_eq!(rt.failure_count, 0);
        assert_eq!(rt.run_id.run, 1);
        assert_eq!(rt.run_id.task_id, tid);
        assert!(rt.prev_run_id.is_none());
    }

    #[test]
    fn test_runtime_roundtrips_through_json() {
        let rt = TaskRuntime::initial(TaskId::new(JobId::from("j"), 3), TaskState::Succeeded);
        let json = serde_json::to_string(&rt).unwrap();
        let back: TaskRuntime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rt);
    }
}
