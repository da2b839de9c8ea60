// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Gangs: sets of tasks scheduled atomically.

use serde::{Deserialize, Serialize};

use flotilla_common::resources::ResourceVector;

use crate::task::RmTaskSpec;

/// A set of tasks that is admitted, dequeued, and placed as one unit.
/// A single task is a gang of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gang {
    pub tasks: Vec<RmTaskSpec>,
}

impl Gang {
    pub fn new(tasks: Vec<RmTaskSpec>) -> Self {
        Self { tasks }
    }

    pub fn of_task(task: RmTaskSpec) -> Self {
        Self { tasks: vec![task] }
    }

    /// Total resources across all member tasks.
    pub fn resources(&self) -> ResourceVector {
        self.tasks
            .iter()
            .fold(ResourceVector::ZERO, |acc, t| acc.add(&t.resource))
    }

    /// Gangs are queued at the priority of their first task; callers build
    /// gangs from tasks of uniform priority.
    pub fn priority(&self) -> u32 {
        self.tasks.first().map_or(0, |t| t.priority)
    }

    pub fn task_type(&self) -> Option<crate::task::TaskType> {
        self.tasks.first().map(|t| t.task_type)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
