// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The job manager: a reconciling goal-state engine that drives jobs,
//! tasks, and updates from observed state toward goal state, with retry
//! budgets, SLA enforcement, and rollout progression.

pub mod cached;
pub mod driver;
pub mod engine;
pub mod event_listener;
pub mod job_actions;
pub mod preemption_listener;
pub mod task_actions;
pub mod update_actions;

pub use driver::{GoalStateDriver, GoalStateDriverConfig};
