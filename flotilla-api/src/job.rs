// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job configuration and runtime records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use flotilla_common::ids::{PoolId, UpdateId};

use crate::task::{TaskConfig, TaskState, TaskType};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Initialized,
    Pending,
    Running,
    Killing,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Job-level SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlaConfig {
    /// When non-zero, at most this many instances may be scheduled (past
    /// `Initialized`) at once.
    pub maximum_running_instances: u32,
    /// Whether instances of this job may be preempted at all.
    pub preemptible: bool,
}

/// Immutable job configuration (one version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub job_type: TaskType,
    pub pool_id: PoolId,
    pub instance_count: u32,
    /// Config for every instance unless overridden below.
    pub default_task: TaskConfig,
    /// Sparse per-instance overrides.
    pub instance_overrides: BTreeMap<u32, TaskConfig>,
    pub sla: SlaConfig,
}

impl JobConfig {
    /// Effective config of one instance.
    pub fn task_config(&self, instance: u32) -> &TaskConfig {
        self.instance_overrides
            .get(&instance)
            .unwrap_or(&self.default_task)
    }
}

/// Mutable job runtime record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRuntime {
    pub state: JobState,
    pub goal_state: JobState,
    /// Count of tasks per state, summing to at most `instance_count`.
    pub task_stats: BTreeMap<TaskState, u32>,
    pub creation_time_ms: u64,
    pub start_time_ms: Option<u64>,
    /// Set exactly when the job enters a terminal state.
    pub completion_time_ms: Option<u64>,
    pub first_task_update_time_ms: u64,
    pub last_task_update_time_ms: u64,
    pub update_id: Option<UpdateId>,
    pub revision: u64,
}

impl JobRuntime {
    pub fn new(goal_state: JobState, creation_time_ms: u64) -> Self {
        Self {
            state: JobState::Initialized,
            goal_state,
            task_stats: BTreeMap::new(),
            creation_time_ms,
            start_time_ms: None,
            completion_time_ms: None,
            first_task_update_time_ms: 0,
            last_task_update_time_ms: 0,
            update_id: None,
            revision: 0,
        }
    }
}
