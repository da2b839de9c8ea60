// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The task tracker: authoritative owner of every RM task.
//!
//! Holds the task map plus a hostname → type → task index that lets the
//! placement engine answer "what else is on this host". The map lock is
//! taken only for map mutation; per-task state serializes under the task's
//! own lock, taken before the index lock when both are needed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use flotilla_api::event::TaskStatusEvent;
use flotilla_api::placement::Placement;
use flotilla_api::task::{RmTaskSpec, TaskState, TaskType};
use flotilla_common::ids::{JobId, PoolId, TaskId};
use flotilla_common::time::current_time_ms;
use flotilla_common::{FlotillaError, Result};
use flotilla_eventstream::EventStream;

use crate::rmtask::{RmTask, RmTaskConfig};
use crate::tree::Tree;

type HostIndex = HashMap<String, HashMap<TaskType, HashMap<TaskId, Arc<RmTask>>>>;

pub struct Tracker {
    tasks: Mutex<HashMap<TaskId, Arc<RmTask>>>,
    placements: Mutex<HostIndex>,
    tree: Arc<Tree>,
    /// Outbound task state events, consumed by the job manager.
    events: Arc<EventStream<TaskStatusEvent>>,
    /// Events the full ring could not take yet, oldest first. Flushed
    /// before any new event so ordering survives backpressure; a terminal
    /// transition is never dropped.
    unsent_events: Mutex<VecDeque<TaskStatusEvent>>,
    config: RmTaskConfig,
}

/// Tasks whose deadlines have fired, collected by [`Tracker::collect_expired`].
#[derive(Default)]
pub struct ExpiredTasks {
    /// Launching/Launched past the launch deadline; requeue with a new run.
    pub launch_timeouts: Vec<Arc<RmTask>>,
    /// Running past the heartbeat deadline; mark lost.
    pub heartbeat_timeouts: Vec<Arc<RmTask>>,
}

impl Tracker {
    pub fn new(
        tree: Arc<Tree>,
        events: Arc<EventStream<TaskStatusEvent>>,
        config: RmTaskConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            placements: Mutex::new(HashMap::new()),
            tree,
            events,
            unsent_events: Mutex::new(VecDeque::new()),
            config,
        })
    }

    pub fn task_config(&self) -> &RmTaskConfig {
        &self.config
    }

    /// Add a task to the tracker in `Initialized` state. Rejects a task id
    /// that is already tracked (requeue with a new run id goes through the
    /// handler, not here).
    pub fn add_task(&self, spec: RmTaskSpec, pool: PoolId) -> Result<Arc<RmTask>> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&spec.task_id) {
            return Err(FlotillaError::StateConflict(format!(
                "task {} already tracked",
                spec.task_id
            )));
        }
        let hostname = spec.hostname.clone();
        let task_id = spec.task_id.clone();
        let task = Arc::new(RmTask::new(spec, pool));
        tasks.insert(task_id.clone(), task.clone());
        drop(tasks);
        if let Some(host) = hostname {
            self.index_placement(&task, host);
        }
        Ok(task)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Arc<RmTask>> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn size(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn clear(&self) {
        self.tasks.lock().clear();
        self.placements.lock().clear();
    }

    /// Record where a task landed and index it by host.
    pub fn set_placement(&self, task_id: &TaskId, hostname: &str) {
        if let Some(task) = self.get_task(task_id) {
            self.clear_placement(&task);
            self.index_placement(&task, hostname.to_string());
        }
    }

    /// Index every task of a placement onto its host.
    pub fn set_placement_host(&self, placement: &Placement) {
        for task_id in &placement.tasks {
            self.set_placement(task_id, &placement.hostname);
        }
    }

    fn index_placement(&self, task: &Arc<RmTask>, hostname: String) {
        task.set_hostname(Some(hostname.clone()));
        let task_type = task.task_type();
        let mut index = self.placements.lock();
        index
            .entry(hostname)
            .or_default()
            .entry(task_type)
            .or_default()
            .insert(task.task_id(), task.clone());
    }

    fn clear_placement(&self, task: &Arc<RmTask>) {
        let Some(hostname) = task.hostname() else {
            return;
        };
        let task_id = task.task_id();
        let task_type = task.task_type();
        task.set_hostname(None);
        let mut index = self.placements.lock();
        if let Some(by_type) = index.get_mut(&hostname) {
            if let Some(by_id) = by_type.get_mut(&task_type) {
                by_id.remove(&task_id);
                if by_id.is_empty() {
                    by_type.remove(&task_type);
                }
            }
            if by_type.is_empty() {
                index.remove(&hostname);
            }
        }
    }

    /// Remove a task from the map and the host index.
    pub fn delete_task(&self, task_id: &TaskId) {
        let task = self.tasks.lock().remove(task_id);
        if let Some(task) = task {
            self.clear_placement(&task);
        }
    }

    /// Drive a task to a terminal state and release what it held: a pending
    /// task leaves its queue and gives back demand, an admitted one gives
    /// back allocation. The task is deleted and the terminal state
    /// published.
    pub fn mark_done(&self, task_id: &TaskId, terminal: TaskState) -> Result<()> {
        debug_assert!(terminal.is_terminal());
        let task = self
            .get_task(task_id)
            .ok_or_else(|| FlotillaError::StateConflict(format!("task {task_id} not tracked")))?;

        let previous = task.current_state();
        // A kill landing on a preempting task terminates as Preempted.
        let terminal = if previous == TaskState::Preempting && terminal == TaskState::Killed {
            TaskState::Preempted
        } else {
            terminal
        };
        task.transition_to(terminal, current_time_ms(), &self.config)?;

        let pool = self.tree.get(task.pool())?;
        let res = task.resource();
        match previous {
            TaskState::Initialized => {}
            TaskState::Pending => {
                pool.remove_from_pending(task_id, task.priority());
                pool.subtract_from_demand(&res);
            }
            _ => pool.subtract_from_allocation(&res),
        }

        tracing::info!(task = %task_id, state = %terminal, "task done, removed from tracker");
        self.publish_state(&task, terminal, "");
        self.delete_task(task_id);
        Ok(())
    }

    /// Emit a state event for the job manager. When the ring is full behind
    /// a lagging subscriber the event is deferred, not dropped; delivery is
    /// retried on every publish and on the scheduler tick.
    pub fn publish_state(&self, task: &RmTask, state: TaskState, reason: &str) {
        let event = TaskStatusEvent {
            offset: 0, // assigned by the stream
            run_id: task.run_id(),
            state,
            reason: reason.to_string(),
            message: String::new(),
            timestamp_ms: current_time_ms(),
        };
        let mut unsent = self.unsent_events.lock();
        unsent.push_back(event);
        self.flush_locked(&mut unsent);
    }

    /// Retry delivery of deferred events in order.
    pub fn flush_events(&self) {
        let mut unsent = self.unsent_events.lock();
        self.flush_locked(&mut unsent);
    }

    fn flush_locked(&self, unsent: &mut VecDeque<TaskStatusEvent>) {
        while let Some(event) = unsent.front() {
            if self.events.try_append(event.clone()).is_err() {
                tracing::debug!(
                    backlog = unsent.len(),
                    "event ring full, deferring task state events"
                );
                break;
            }
            unsent.pop_front();
        }
    }

    /// Events waiting for ring capacity.
    pub fn unsent_event_count(&self) -> usize {
        self.unsent_events.lock().len()
    }

    /// All tasks of the given type on the given hosts; `None` matches every
    /// type.
    pub fn tasks_by_hosts(
        &self,
        hosts: &[String],
        task_type: Option<TaskType>,
    ) -> HashMap<String, Vec<Arc<RmTask>>> {
        let index = self.placements.lock();
        let mut result: HashMap<String, Vec<Arc<RmTask>>> = HashMap::new();
        for host in hosts {
            let Some(by_type) = index.get(host) else {
                continue;
            };
            for (t, by_id) in by_type {
                if task_type.is_some_and(|want| want != *t) {
                    continue;
                }
                result
                    .entry(host.clone())
                    .or_default()
                    .extend(by_id.values().cloned());
            }
        }
        result
    }

    /// Task id → state name, filtered by job or by pool when given.
    pub fn active_tasks(
        &self,
        job_id: Option<&JobId>,
        pool_id: Option<&PoolId>,
    ) -> HashMap<String, String> {
        let tasks = self.tasks.lock();
        tasks
            .values()
            .filter(|task| {
                if job_id.is_none() && pool_id.is_none() {
                    return true;
                }
                job_id.is_some_and(|j| &task.spec().job_id == j)
                    || pool_id.is_some_and(|p| task.pool() == p)
            })
            .map(|task| (task.task_id().to_string(), task.current_state().to_string()))
            .collect()
    }

    /// Non-terminal tasks charged to one pool.
    pub fn tasks_in_pool(&self, pool_id: &PoolId) -> Vec<Arc<RmTask>> {
        self.tasks
            .lock()
            .values()
            .filter(|task| task.pool() == pool_id)
            .cloned()
            .collect()
    }

    /// Sweep for expired deadlines.
    pub fn collect_expired(&self, now_ms: u64) -> ExpiredTasks {
        let tasks = self.tasks.lock();
        let mut expired = ExpiredTasks::default();
        for task in tasks.values() {
            if task.launch_expired(now_ms) {
                expired.launch_timeouts.push(task.clone());
            } else if task.heartbeat_expired(now_ms) {
                expired.heartbeat_timeouts.push(task.clone());
            }
        }
        expired
    }
}
