// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The resource manager service surface.
//!
//! Batch operations return per-item failure lists instead of failing whole
//! requests; only a missing pool fails an `enqueue_gangs` call outright.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flotilla_api::event::TaskStatusEvent;
use flotilla_api::gang::Gang;
use flotilla_api::placement::Placement;
use flotilla_api::task::{RmTaskSpec, TaskState, TaskType};
use flotilla_common::ids::{JobId, PoolId, TaskId};
use flotilla_common::time::current_time_ms;
use flotilla_common::timed_queue::TimedQueue;
use flotilla_common::{FlotillaError, Result};

use crate::scheduler::Scheduler;
use crate::tracker::Tracker;
use crate::tree::Tree;

/// Default bound on placements waiting for the launcher.
const PLACEMENT_QUEUE_LIMIT: usize = 10_000;

/// One task that could not be enqueued, with the reason.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task: RmTaskSpec,
    pub message: String,
}

/// One placement that could not be recorded.
#[derive(Debug, Clone)]
pub struct FailedPlacement {
    pub placement: Placement,
    pub message: String,
}

pub struct ServiceHandler {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    scheduler: Arc<Scheduler>,
    placements: TimedQueue<Placement>,
    /// Highest agent-stream offset ever seen; the acknowledged purge offset.
    max_offset: AtomicU64,
}

impl ServiceHandler {
    pub fn new(tree: Arc<Tree>, tracker: Arc<Tracker>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            tree,
            tracker,
            scheduler,
            placements: TimedQueue::new(PLACEMENT_QUEUE_LIMIT),
            max_offset: AtomicU64::new(0),
        })
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    // ─── EnqueueGangs ────────────────────────────────────────────────────

    /// Admit gangs into a pool's pending queue. Fails whole with
    /// `PoolNotFound`; everything else is reported per task.
    pub fn enqueue_gangs(&self, pool_id: &PoolId, gangs: Vec<Gang>) -> Result<Vec<FailedTask>> {
        self.tree.get(pool_id)?;
        let mut failed = Vec::new();
        for gang in gangs {
            failed.extend(self.enqueue_gang(pool_id, gang));
        }
        Ok(failed)
    }

    fn enqueue_gang(&self, pool_id: &PoolId, gang: Gang) -> Vec<FailedTask> {
        let Ok(pool) = self.tree.get(pool_id) else {
            return gang
                .tasks
                .into_iter()
                .map(|task| FailedTask {
                    message: format!("pool {pool_id} not found"),
                    task,
                })
                .collect();
        };

        let mut failed = Vec::new();
        let mut fresh: Vec<RmTaskSpec> = Vec::new();
        for spec in gang.tasks {
            if let Err(err) = self.validate_task(&spec) {
                failed.push(FailedTask {
                    message: err.to_string(),
                    task: spec,
                });
                continue;
            }
            match self.requeue_task(&spec) {
                RequeueOutcome::NotTracked => fresh.push(spec),
                RequeueOutcome::Superseded => {}
                RequeueOutcome::Rejected(message) => {
                    failed.push(FailedTask {
                        message,
                        task: spec,
                    })
                }
            }
        }

        if !failed.is_empty() {
            // Gang admission is all-or-nothing: a failed member fails the
            // rest of the gang too.
            for spec in fresh {
                failed.push(FailedTask {
                    message: "gang member failed".into(),
                    task: spec,
                });
            }
            return failed;
        }
        if fresh.is_empty() {
            return failed;
        }

        let mut added = Vec::new();
        let now = current_time_ms();
        for spec in &fresh {
            match self.tracker.add_task(spec.clone(), pool_id.clone()) {
                Ok(task) => {
                    if let Err(err) =
                        task.transition_to(TaskState::Pending, now, self.tracker.task_config())
                    {
                        tracing::error!(task = %spec.task_id, %err, "pending transition failed");
                    }
                    added.push(spec.task_id.clone());
                }
                Err(err) => failed.push(FailedTask {
                    message: err.to_string(),
                    task: spec.clone(),
                }),
            }
        }
        if !failed.is_empty() {
            for task_id in added {
                self.tracker.delete_task(&task_id);
            }
            return failed;
        }

        let gang = Gang::new(fresh);
        let res = gang.resources();
        match pool.enqueue_gang(gang.clone()) {
            Ok(()) => pool.add_to_demand(&res),
            Err(err) => {
                for spec in gang.tasks {
                    self.tracker.delete_task(&spec.task_id);
                    failed.push(FailedTask {
                        message: err.to_string(),
                        task: spec,
                    });
                }
            }
        }
        failed
    }

    fn validate_task(&self, spec: &RmTaskSpec) -> Result<()> {
        if spec.resource.is_zero() {
            return Err(FlotillaError::InvalidConfig(format!(
                "task {} requests no resources",
                spec.task_id
            )));
        }
        Ok(())
    }

    /// Requeue policy for a task id the tracker may already know: the same
    /// run id is a duplicate; a newer run supersedes a LAUNCHING/RUNNING
    /// attempt and goes straight to the ready queue.
    fn requeue_task(&self, spec: &RmTaskSpec) -> RequeueOutcome {
        let Some(task) = self.tracker.get_task(&spec.task_id) else {
            return RequeueOutcome::NotTracked;
        };
        if task.run_id() == spec.run_id {
            return RequeueOutcome::Rejected(format!(
                "task {} with run {} already tracked",
                spec.task_id, spec.run_id.run
            ));
        }
        let state = task.current_state();
        if !matches!(state, TaskState::Launching | TaskState::Running) {
            return RequeueOutcome::Rejected(format!(
                "task {} in {state} cannot be superseded",
                spec.task_id
            ));
        }
        task.set_run_id(spec.run_id.clone());
        if let Err(err) =
            task.transition_to(TaskState::Ready, current_time_ms(), self.tracker.task_config())
        {
            return RequeueOutcome::Rejected(err.to_string());
        }
        if let Err(err) = self.scheduler.enqueue_ready(Gang::of_task(task.spec())) {
            return RequeueOutcome::Rejected(err.to_string());
        }
        tracing::info!(task = %spec.task_id, run = spec.run_id.run, "superseded with new run");
        RequeueOutcome::Superseded
    }

    // ─── DequeueGangs ────────────────────────────────────────────────────

    /// Pop up to `limit` ready gangs of one type, transitioning their tasks
    /// to PLACING. A timeout returns what was gathered so far.
    pub async fn dequeue_gangs(
        &self,
        limit: usize,
        task_type: TaskType,
        timeout: Duration,
    ) -> Vec<Gang> {
        let mut gangs = Vec::new();
        let now = current_time_ms();
        for _ in 0..limit {
            let Ok(mut gang) = self.scheduler.dequeue_ready(task_type, timeout).await else {
                break;
            };
            gang.tasks.retain(|spec| {
                match self.tracker.get_task(&spec.task_id) {
                    Some(task) => task
                        .transition_to(TaskState::Placing, now, self.tracker.task_config())
                        .map_err(|err| {
                            tracing::warn!(task = %spec.task_id, %err, "cannot move to placing");
                            err
                        })
                        .is_ok(),
                    None => false,
                }
            });
            if !gang.is_empty() {
                gangs.push(gang);
            }
        }
        gangs
    }

    /// Return a gang the placement engine could not place: tasks walk back
    /// PLACING → READY → PENDING into their pool's pending queue, and the
    /// admission is repaid (demand regained, allocation released) so the
    /// next cycle re-admits against fresh entitlement.
    pub fn return_unplaced(&self, gang: Gang) -> Result<()> {
        let first = gang
            .tasks
            .first()
            .ok_or_else(|| FlotillaError::InvalidConfig("empty gang".into()))?;
        let task = self
            .tracker
            .get_task(&first.task_id)
            .ok_or_else(|| FlotillaError::StateConflict("gang no longer tracked".into()))?;
        let pool = self.tree.get(task.pool())?;

        let now = current_time_ms();
        let mut live = Vec::new();
        for spec in &gang.tasks {
            let Some(task) = self.tracker.get_task(&spec.task_id) else {
                continue;
            };
            let back = task
                .transition_to(TaskState::Ready, now, self.tracker.task_config())
                .and_then(|_| {
                    task.transition_to(TaskState::Pending, now, self.tracker.task_config())
                });
            match back {
                Ok(()) => live.push(task.spec()),
                Err(err) => {
                    tracing::warn!(task = %spec.task_id, %err, "cannot return task to pending")
                }
            }
        }
        if live.is_empty() {
            return Ok(());
        }
        let gang = Gang::new(live);
        let res = gang.resources();
        pool.enqueue_gang(gang)?;
        pool.add_to_demand(&res);
        pool.subtract_from_allocation(&res);
        Ok(())
    }

    // ─── SetPlacements / GetPlacements ───────────────────────────────────

    /// Record placements from the placement engine: tasks move
    /// PLACING → PLACED and are indexed by host; tasks that fell out of
    /// PLACING are dropped from the placement.
    pub fn set_placements(&self, placements: Vec<Placement>) -> Vec<FailedPlacement> {
        let mut failed = Vec::new();
        for placement in placements {
            let placement =
                self.transit_placement_tasks(placement, TaskState::Placing, TaskState::Placed);
            self.tracker.set_placement_host(&placement);
            if let Err(err) = self.placements.enqueue(placement.clone()) {
                failed.push(FailedPlacement {
                    message: err.to_string(),
                    placement,
                });
            }
        }
        failed
    }

    /// Pop placements for the launcher, transitioning PLACED → LAUNCHING.
    pub async fn get_placements(&self, limit: usize, timeout: Duration) -> Vec<Placement> {
        let mut out = Vec::new();
        for _ in 0..limit {
            let Ok(placement) = self.placements.dequeue(timeout).await else {
                break;
            };
            let placement =
                self.transit_placement_tasks(placement, TaskState::Placed, TaskState::Launching);
            if !placement.tasks.is_empty() {
                out.push(placement);
            }
        }
        out
    }

    fn transit_placement_tasks(
        &self,
        mut placement: Placement,
        from: TaskState,
        to: TaskState,
    ) -> Placement {
        let now = current_time_ms();
        placement.tasks.retain(|task_id| {
            let Some(task) = self.tracker.get_task(task_id) else {
                tracing::debug!(task = %task_id, "not tracked, dropped from placement");
                return false;
            };
            if task.current_state() != from {
                tracing::warn!(task = %task_id, state = %task.current_state(),
                    "task not in {from}, dropped from placement");
                return false;
            }
            match task.transition_to(to, now, self.tracker.task_config()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(task = %task_id, %err, "placement transition failed");
                    false
                }
            }
        });
        placement
    }

    // ─── NotifyTaskUpdates ───────────────────────────────────────────────

    /// Drive task state from agent status events. Every event is
    /// acknowledged whether or not it was applied; the returned purge
    /// offset is the highest offset ever seen and never decreases.
    pub fn notify_task_updates(&self, events: Vec<TaskStatusEvent>) -> u64 {
        for event in events {
            self.apply_event(&event);
            self.acknowledge(event.offset);
        }
        self.max_offset.load(Ordering::Acquire)
    }

    fn apply_event(&self, event: &TaskStatusEvent) {
        // Only RUNNING and terminal states move the machine; everything in
        // between is driven by the RM's own queues and timers.
        if event.state != TaskState::Running && !event.state.is_terminal() {
            return;
        }
        let task_id = &event.run_id.task_id;
        let Some(task) = self.tracker.get_task(task_id) else {
            return;
        };
        if task.run_id() != event.run_id {
            tracing::debug!(task = %task_id, "event for stale run dropped");
            return;
        }
        let now = current_time_ms();
        if event.state == TaskState::Running {
            match task.transition_to(TaskState::Running, now, self.tracker.task_config()) {
                Ok(()) => self.tracker.publish_state(&task, TaskState::Running, &event.reason),
                // Repeated RUNNING reports act as heartbeats.
                Err(_) => task.heartbeat(now, self.tracker.task_config()),
            }
        } else if let Err(err) = self.tracker.mark_done(task_id, event.state) {
            tracing::warn!(task = %task_id, %err, "terminal event not applied");
        }
    }

    fn acknowledge(&self, offset: u64) {
        self.max_offset.fetch_max(offset, Ordering::AcqRel);
    }

    /// The current acknowledged purge offset.
    pub fn purge_offset(&self) -> u64 {
        self.max_offset.load(Ordering::Acquire)
    }

    // ─── KillTasks ───────────────────────────────────────────────────────

    /// Kill tasks, freeing their allocation. Returns the ids that could not
    /// be killed (unknown or already terminal).
    pub fn kill_tasks(&self, task_ids: Vec<TaskId>) -> Vec<TaskId> {
        let mut not_killed = Vec::new();
        for task_id in task_ids {
            match self.tracker.mark_done(&task_id, TaskState::Killed) {
                Ok(()) => {}
                Err(err) => {
                    tracing::debug!(task = %task_id, %err, "could not kill");
                    not_killed.push(task_id);
                }
            }
        }
        not_killed
    }

    // ─── queries ─────────────────────────────────────────────────────────

    /// Tasks of one type on the given hosts.
    pub fn get_tasks_by_hosts(
        &self,
        hosts: &[String],
        task_type: Option<TaskType>,
    ) -> std::collections::HashMap<String, Vec<RmTaskSpec>> {
        self.tracker
            .tasks_by_hosts(hosts, task_type)
            .into_iter()
            .map(|(host, tasks)| (host, tasks.iter().map(|t| t.spec()).collect()))
            .collect()
    }

    /// Task id → state, filtered by job or pool.
    pub fn get_active_tasks(
        &self,
        job_id: Option<&JobId>,
        pool_id: Option<&PoolId>,
    ) -> std::collections::HashMap<String, String> {
        self.tracker.active_tasks(job_id, pool_id)
    }
}

enum RequeueOutcome {
    /// Unknown task id; proceed with normal admission.
    NotTracked,
    /// A newer run replaced the tracked attempt; nothing left to admit.
    Superseded,
    Rejected(String),
}
