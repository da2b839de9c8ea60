// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The resource manager's per-task state machine.
//!
//! Transitions are guarded by a declarative legality table; an illegal
//! transition returns `StateConflict` and leaves the task unchanged. Every
//! mutation serializes under the task's own lock.
//!
//! Two deadlines ride along with the state: a launch deadline armed on
//! entering `Launching` (expiry requeues the task with a fresh run id) and a
//! heartbeat deadline armed on entering `Running` (expiry marks the task
//! `Lost`).

use parking_lot::Mutex;

use flotilla_api::task::{RmTaskSpec, TaskState, TaskType};
use flotilla_common::ids::{PoolId, RunId, TaskId};
use flotilla_common::resources::ResourceVector;
use flotilla_common::{FlotillaError, Result};

/// Deadline configuration shared by all tracked tasks.
#[derive(Debug, Clone, Copy)]
pub struct RmTaskConfig {
    pub launch_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for RmTaskConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 600_000,
            heartbeat_timeout_ms: 300_000,
        }
    }
}

/// Legal successor states. Terminal states are absorbing; every terminal
/// state is reachable from every non-terminal state (kill, agent event).
fn allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    if from.is_terminal() {
        return false;
    }
    if to.is_terminal() {
        return true;
    }
    let successors: &[TaskState] = match from {
        Initialized => &[Pending, Ready],
        Pending => &[Ready],
        Ready => &[Placing, Pending],
        Placing => &[Placed, Ready],
        Placed => &[Launching, Ready],
        Launching => &[Launched, Running, Ready],
        Launched => &[Running, Ready],
        Running => &[Preempting, Ready],
        Preempting => &[],
        Killing => &[],
        // Terminals handled above.
        Succeeded | Failed | Killed | Lost | Preempted => &[],
    };
    successors.contains(&to)
}

struct Inner {
    spec: RmTaskSpec,
    state: TaskState,
    launch_deadline_ms: Option<u64>,
    heartbeat_deadline_ms: Option<u64>,
    start_time_ms: Option<u64>,
}

pub struct RmTask {
    pool: PoolId,
    inner: Mutex<Inner>,
}

impl RmTask {
    pub fn new(spec: RmTaskSpec, pool: PoolId) -> Self {
        Self {
            pool,
            inner: Mutex::new(Inner {
                spec,
                state: TaskState::Initialized,
                launch_deadline_ms: None,
                heartbeat_deadline_ms: None,
                start_time_ms: None,
            }),
        }
    }

    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.lock().spec.task_id.clone()
    }

    pub fn run_id(&self) -> RunId {
        self.inner.lock().spec.run_id.clone()
    }

    pub fn spec(&self) -> RmTaskSpec {
        self.inner.lock().spec.clone()
    }

    pub fn current_state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn resource(&self) -> ResourceVector {
        self.inner.lock().spec.resource
    }

    pub fn priority(&self) -> u32 {
        self.inner.lock().spec.priority
    }

    pub fn task_type(&self) -> TaskType {
        self.inner.lock().spec.task_type
    }

    pub fn preemptible(&self) -> bool {
        self.inner.lock().spec.preemptible
    }

    pub fn hostname(&self) -> Option<String> {
        self.inner.lock().spec.hostname.clone()
    }

    pub(crate) fn set_hostname(&self, hostname: Option<String>) {
        self.inner.lock().spec.hostname = hostname;
    }

    pub fn start_time_ms(&self) -> Option<u64> {
        self.inner.lock().start_time_ms
    }

    /// Point the task at a superseding attempt.
    pub fn set_run_id(&self, run_id: RunId) {
        self.inner.lock().spec.run_id = run_id;
    }

    /// Bump to the next attempt of the same instance and return it.
    pub fn renew_run(&self) -> RunId {
        let mut inner = self.inner.lock();
        let next = inner.spec.run_id.next();
        inner.spec.run_id = next.clone();
        next
    }

    /// Attempt a guarded state transition, arming/cancelling deadlines as a
    /// side effect of the target state.
    pub fn transition_to(&self, to: TaskState, now_ms: u64, config: &RmTaskConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == to {
            return Err(FlotillaError::StateConflict(format!(
                "task {} already in {to}",
                inner.spec.task_id
            )));
        }
        if !allowed(inner.state, to) {
            return Err(FlotillaError::StateConflict(format!(
                "task {}: illegal transition {} -> {to}",
                inner.spec.task_id, inner.state
            )));
        }
        match to {
            TaskState::Launching => {
                inner.launch_deadline_ms = Some(now_ms + config.launch_timeout_ms);
            }
            TaskState::Running => {
                inner.launch_deadline_ms = None;
                inner.heartbeat_deadline_ms = Some(now_ms + config.heartbeat_timeout_ms);
                inner.start_time_ms = Some(now_ms);
            }
            TaskState::Ready | TaskState::Pending => {
                inner.launch_deadline_ms = None;
                inner.heartbeat_deadline_ms = None;
            }
            _ if to.is_terminal() => {
                inner.launch_deadline_ms = None;
                inner.heartbeat_deadline_ms = None;
            }
            _ => {}
        }
        inner.state = to;
        Ok(())
    }

    /// Record a heartbeat for a running task.
    pub fn heartbeat(&self, now_ms: u64, config: &RmTaskConfig) {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Running {
            inner.heartbeat_deadline_ms = Some(now_ms + config.heartbeat_timeout_ms);
        }
    }

    /// A launch that has not progressed past its deadline.
    pub fn launch_expired(&self, now_ms: u64) -> bool {
        let inner = self.inner.lock();
        matches!(inner.state, TaskState::Launching | TaskState::Launched)
            && inner.launch_deadline_ms.is_some_and(|d| d <= now_ms)
    }

    /// A running task that has missed its heartbeat window.
    pub fn heartbeat_expired(&self, now_ms: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == TaskState::Running
            && inner.heartbeat_deadline_ms.is_some_and(|d| d <= now_ms)
    }
}
