// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The ready scheduler.
//!
//! A background loop that recomputes entitlements on its own cadence, walks
//! leaf pools in a deterministic share-weighted rotation, admits gangs
//! against entitlement, and feeds the global ready queue the placement
//! engine drains. The same loop sweeps task deadlines: launch timeouts
//! requeue with a fresh run id, missed heartbeats mark tasks lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flotilla_api::gang::Gang;
use flotilla_api::task::{TaskState, TaskType};
use flotilla_common::queue::PriorityQueue;
use flotilla_common::resources::ResourceVector;
use flotilla_common::time::current_time_ms;
use flotilla_common::{FlotillaError, Result};
use parking_lot::Mutex;

use crate::entitlement::EntitlementCalculator;
use crate::respool::ResPool;
use crate::tracker::Tracker;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub entitlement_interval_ms: u64,
    /// Gangs pulled from one leaf per tick.
    pub dequeue_batch: usize,
    pub ready_queue_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            entitlement_interval_ms: 10_000,
            dequeue_batch: 10,
            ready_queue_limit: 100_000,
        }
    }
}

/// The global ready queue: one priority FIFO per task type, with a blocking
/// dequeue for the placement engine.
struct ReadyQueue {
    queues: HashMap<TaskType, PriorityQueue<Gang>>,
    notify: Notify,
}

const TASK_TYPES: [TaskType; 4] = [
    TaskType::Batch,
    TaskType::Stateless,
    TaskType::Daemon,
    TaskType::Stateful,
];

impl ReadyQueue {
    fn new(limit: usize) -> Self {
        Self {
            queues: TASK_TYPES
                .iter()
                .map(|&t| (t, PriorityQueue::new(limit)))
                .collect(),
            notify: Notify::new(),
        }
    }

    fn enqueue(&self, gang: Gang) -> Result<()> {
        let task_type = gang
            .task_type()
            .ok_or_else(|| FlotillaError::InvalidConfig("gang has no tasks".into()))?;
        let queue = self
            .queues
            .get(&task_type)
            .ok_or_else(|| FlotillaError::Internal("unknown task type".into()))?;
        queue.enqueue(gang.priority(), gang)?;
        self.notify.notify_waiters();
        Ok(())
    }

    fn try_dequeue(&self, task_type: TaskType) -> Option<Gang> {
        self.queues
            .get(&task_type)
            .and_then(|q| q.dequeue())
            .map(|(_, gang)| gang)
    }

    async fn dequeue(&self, task_type: TaskType, timeout: Duration) -> Result<Gang> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(gang) = self.try_dequeue(task_type) {
                return Ok(gang);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue(task_type).ok_or(FlotillaError::TimedOut);
            }
        }
    }
}

pub struct Scheduler {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    calculator: EntitlementCalculator,
    ready: ReadyQueue,
    capacity: Mutex<ResourceVector>,
    last_entitlement_ms: AtomicU64,
    rotation: AtomicUsize,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(tree: Arc<Tree>, tracker: Arc<Tracker>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            calculator: EntitlementCalculator::new(tree.clone()),
            tree,
            tracker,
            ready: ReadyQueue::new(config.ready_queue_limit),
            capacity: Mutex::new(ResourceVector::ZERO),
            last_entitlement_ms: AtomicU64::new(0),
            rotation: AtomicUsize::new(0),
            config,
        })
    }

    /// Total capacity of the agent fleet, the root of the entitlement
    /// distribution. Updated as hosts come and go.
    pub fn set_cluster_capacity(&self, capacity: ResourceVector) {
        *self.capacity.lock() = capacity;
        // Force a recompute on the next tick.
        self.last_entitlement_ms.store(0, Ordering::Relaxed);
    }

    pub fn cluster_capacity(&self) -> ResourceVector {
        *self.capacity.lock()
    }

    /// Push a gang straight onto the ready queue (requeues with a fresh run
    /// id, superseded attempts).
    pub fn enqueue_ready(&self, gang: Gang) -> Result<()> {
        self.ready.enqueue(gang)
    }

    /// Blocking pop for the placement engine; partial timeout yields
    /// `TimedOut`.
    pub async fn dequeue_ready(&self, task_type: TaskType, timeout: Duration) -> Result<Gang> {
        self.ready.dequeue(task_type, timeout).await
    }

    /// One scheduling pass. Public so tests (and the loop) can drive it
    /// deterministically.
    pub fn schedule_once(&self, now_ms: u64) {
        // Deferred state events drain as the ring gains room, independent
        // of new publishes.
        self.tracker.flush_events();

        let last = self.last_entitlement_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= self.config.entitlement_interval_ms || last == 0 {
            self.calculator.compute(self.cluster_capacity());
            self.last_entitlement_ms.store(now_ms.max(1), Ordering::Relaxed);
        }

        let leaves = self.tree.leaves_in_share_order();
        if leaves.is_empty() {
            return;
        }
        // Rotate the starting pool each pass so no leaf waits on the tail
        // forever; every leaf is still visited every pass.
        let start = self.rotation.fetch_add(1, Ordering::Relaxed) % leaves.len();
        for i in 0..leaves.len() {
            let leaf = &leaves[(start + i) % leaves.len()];
            self.drain_leaf(leaf, now_ms);
        }

        self.sweep_deadlines(now_ms);
    }

    fn drain_leaf(&self, leaf: &Arc<ResPool>, now_ms: u64) {
        let gangs = match leaf.dequeue_gang_list(self.config.dequeue_batch) {
            Ok(gangs) => gangs,
            Err(err) => {
                tracing::debug!(pool = %leaf.name(), %err, "no admissible gangs");
                return;
            }
        };
        for mut gang in gangs {
            // Tasks may have been killed while queued; drop them from the
            // gang and give their share of the freshly-added allocation
            // back.
            gang.tasks.retain(|spec| {
                match self.tracker.get_task(&spec.task_id) {
                    Some(task) => {
                        match task.transition_to(TaskState::Ready, now_ms, self.tracker.task_config())
                        {
                            Ok(()) => true,
                            Err(err) => {
                                tracing::warn!(task = %spec.task_id, %err, "cannot ready task");
                                leaf.subtract_from_allocation(&spec.resource);
                                false
                            }
                        }
                    }
                    None => {
                        leaf.subtract_from_allocation(&spec.resource);
                        false
                    }
                }
            });
            if gang.is_empty() {
                continue;
            }
            if let Err(err) = self.ready.enqueue(gang.clone()) {
                tracing::error!(%err, "ready queue rejected gang, returning to pool");
                self.return_gang_to_pool(leaf, gang, now_ms);
            }
        }
    }

    /// Undo an admission: back to pending queue, demand restored,
    /// allocation released.
    fn return_gang_to_pool(&self, leaf: &Arc<ResPool>, gang: Gang, now_ms: u64) {
        let res = gang.resources();
        for spec in &gang.tasks {
            if let Some(task) = self.tracker.get_task(&spec.task_id) {
                if let Err(err) =
                    task.transition_to(TaskState::Pending, now_ms, self.tracker.task_config())
                {
                    tracing::warn!(task = %spec.task_id, %err, "cannot return task to pending");
                }
            }
        }
        if let Err(err) = leaf.enqueue_gang(gang) {
            tracing::error!(%err, pool = %leaf.name(), "failed to return gang to pending queue");
            return;
        }
        leaf.add_to_demand(&res);
        leaf.subtract_from_allocation(&res);
    }

    /// Launch timeouts requeue the task under a fresh run id; heartbeat
    /// timeouts mark it lost.
    fn sweep_deadlines(&self, now_ms: u64) {
        let expired = self.tracker.collect_expired(now_ms);
        for task in expired.launch_timeouts {
            let task_id = task.task_id();
            task.renew_run();
            match task.transition_to(TaskState::Ready, now_ms, self.tracker.task_config()) {
                Ok(()) => {
                    tracing::info!(task = %task_id, "launch timed out, requeued with new run");
                    if let Err(err) = self.ready.enqueue(Gang::of_task(task.spec())) {
                        tracing::error!(task = %task_id, %err, "requeue after launch timeout failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(task = %task_id, %err, "launch-expired task changed state");
                }
            }
        }
        for task in expired.heartbeat_timeouts {
            let task_id = task.task_id();
            tracing::warn!(task = %task_id, "heartbeat missed, marking lost");
            if let Err(err) = self.tracker.mark_done(&task_id, TaskState::Lost) {
                tracing::warn!(task = %task_id, %err, "could not mark task lost");
            }
        }
    }

    /// Run the scheduling loop until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!("ready scheduler started");
            let mut tick = tokio::time::interval(Duration::from_millis(this.config.tick_interval_ms));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("ready scheduler stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        this.schedule_once(current_time_ms());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmtask::RmTaskConfig;
    use crate::tree::test_support::{pool_config, root_config};
    use flotilla_api::event::TaskStatusEvent;
    use flotilla_api::task::{RmTaskSpec, TaskConfig};
    use flotilla_common::ids::{JobId, PoolId, TaskId};
    use flotilla_eventstream::EventStream;

    fn capacity() -> ResourceVector {
        ResourceVector::new(100.0, 10000.0, 1000.0, 8.0)
    }

    fn setup() -> (Arc<Tree>, Arc<Tracker>, Arc<Scheduler>) {
        let tree = Tree::new(root_config(capacity())).unwrap();
        tree.add_pool(
            PoolId::from("pool1"),
            pool_config("pool1", Some("root"), ResourceVector::ZERO, capacity()),
        )
        .unwrap();
        let events = Arc::new(EventStream::<TaskStatusEvent>::new(1024, &["jobmgr"]));
        let tracker = Tracker::new(tree.clone(), events, RmTaskConfig::default());
        let scheduler = Scheduler::new(tree.clone(), tracker.clone(), SchedulerConfig::default());
        scheduler.set_cluster_capacity(capacity());
        (tree, tracker, scheduler)
    }

    fn enqueue_task(
        tree: &Arc<Tree>,
        tracker: &Arc<Tracker>,
        job: &str,
        instance: u32,
        cpu: f64,
        priority: u32,
    ) -> RmTaskSpec {
        let config = TaskConfig {
            resource: ResourceVector::new(cpu, 10.0, 0.0, 0.0),
            priority,
            ..TaskConfig::default()
        };
        let spec = RmTaskSpec::new(TaskId::new(JobId::from(job), instance), 1, &config);
        let pool = tree.get(&PoolId::from("pool1")).unwrap();
        let task = tracker.add_task(spec.clone(), PoolId::from("pool1")).unwrap();
        pool.enqueue_gang(Gang::of_task(spec.clone())).unwrap();
        pool.add_to_demand(&spec.resource);
        task.transition_to(TaskState::Pending, 0, tracker.task_config())
            .unwrap();
        spec
    }

    #[tokio::test]
    async fn test_schedule_moves_pending_to_ready() {
        let (tree, tracker, scheduler) = setup();
        let spec = enqueue_task(&tree, &tracker, "job1", 0, 1.0, 3);

        scheduler.schedule_once(1);

        let task = tracker.get_task(&spec.task_id).unwrap();
        assert_eq!(task.current_state(), TaskState::Ready);

        let gang = scheduler
            .dequeue_ready(TaskType::Batch, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(gang.tasks[0].task_id, spec.task_id);
    }

    #[tokio::test]
    async fn test_priority_dominance_in_ready_queue() {
        let (tree, tracker, scheduler) = setup();
        enqueue_task(&tree, &tracker, "low", 0, 1.0, 1);
        enqueue_task(&tree, &tracker, "high", 0, 1.0, 9);

        scheduler.schedule_once(1);

        let first = scheduler
            .dequeue_ready(TaskType::Batch, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.tasks[0].job_id, JobId::from("high"));
        let second = scheduler
            .dequeue_ready(TaskType::Batch, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.tasks[0].job_id, JobId::from("low"));
    }

    #[tokio::test]
    async fn test_killed_pending_task_skipped() {
        let (tree, tracker, scheduler) = setup();
        let spec = enqueue_task(&tree, &tracker, "job1", 0, 2.0, 1);
        tracker.mark_done(&spec.task_id, TaskState::Killed).unwrap();

        scheduler.schedule_once(1);

        let err = scheduler
            .dequeue_ready(TaskType::Batch, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timed_out());
        let pool = tree.get(&PoolId::from("pool1")).unwrap();
        assert!(pool.allocation().is_zero());
        assert!(pool.demand().is_zero());
    }

    #[tokio::test]
    async fn test_gang_admitted_atomically() {
        let (tree, tracker, scheduler) = setup();
        // A 5-task gang of 20 cpu total against entitlement 15: stays
        // pending until entitlement covers the whole gang.
        let pool = tree.get(&PoolId::from("pool1")).unwrap();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let config = TaskConfig {
                resource: ResourceVector::new(4.0, 10.0, 0.0, 0.0),
                priority: 2,
                ..TaskConfig::default()
            };
            let spec = RmTaskSpec::new(TaskId::new(JobId::from("gangjob"), i), 1, &config);
            let task = tracker.add_task(spec.clone(), PoolId::from("pool1")).unwrap();
            task.transition_to(TaskState::Pending, 0, tracker.task_config())
                .unwrap();
            tasks.push(spec);
        }
        let gang = Gang::new(tasks.clone());
        pool.add_to_demand(&gang.resources());
        pool.enqueue_gang(gang).unwrap();

        pool.set_entitlement(ResourceVector::new(15.0, 10000.0, 1000.0, 8.0));
        let gangs = pool.dequeue_gang_list(10).unwrap();
        assert!(gangs.is_empty(), "no partial dequeue");

        pool.set_entitlement(ResourceVector::new(20.0, 10000.0, 1000.0, 8.0));
        let gangs = pool.dequeue_gang_list(10).unwrap();
        assert_eq!(gangs.len(), 1);
        assert_eq!(gangs[0].len(), 5);
    }

    #[tokio::test]
    async fn test_launch_timeout_requeues_with_new_run() {
        let tree = Tree::new(root_config(capacity())).unwrap();
        tree.add_pool(
            PoolId::from("pool1"),
            pool_config("pool1", Some("root"), ResourceVector::ZERO, capacity()),
        )
        .unwrap();
        let events = Arc::new(EventStream::<TaskStatusEvent>::new(1024, &["jobmgr"]));
        let task_config = RmTaskConfig {
            launch_timeout_ms: 50,
            heartbeat_timeout_ms: 1000,
        };
        let tracker = Tracker::new(tree.clone(), events, task_config);
        let scheduler = Scheduler::new(tree.clone(), tracker.clone(), SchedulerConfig::default());
        scheduler.set_cluster_capacity(capacity());

        let spec = RmTaskSpec::new(
            TaskId::new(JobId::from("job1"), 0),
            1,
            &TaskConfig::default(),
        );
        let task = tracker.add_task(spec.clone(), PoolId::from("pool1")).unwrap();
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
        ] {
            task.transition_to(state, 0, &task_config).unwrap();
        }
        task.transition_to(TaskState::Launching, 1000, &task_config)
            .unwrap();

        scheduler.schedule_once(2000);

        assert_eq!(task.current_state(), TaskState::Ready);
        assert_eq!(task.run_id().run, 2);
        let gang = scheduler
            .dequeue_ready(TaskType::Batch, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(gang.tasks[0].run_id.run, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_marks_lost() {
        let tree = Tree::new(root_config(capacity())).unwrap();
        tree.add_pool(
            PoolId::from("pool1"),
            pool_config("pool1", Some("root"), ResourceVector::ZERO, capacity()),
        )
        .unwrap();
        let events = Arc::new(EventStream::<TaskStatusEvent>::new(1024, &["jobmgr"]));
        let task_config = RmTaskConfig {
            launch_timeout_ms: 1000,
            heartbeat_timeout_ms: 50,
        };
        let tracker = Tracker::new(tree.clone(), events.clone(), task_config);
        let scheduler = Scheduler::new(tree.clone(), tracker.clone(), SchedulerConfig::default());
        scheduler.set_cluster_capacity(capacity());

        let spec = RmTaskSpec::new(
            TaskId::new(JobId::from("job1"), 0),
            1,
            &TaskConfig::default(),
        );
        let task = tracker.add_task(spec.clone(), PoolId::from("pool1")).unwrap();
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
        ] {
            task.transition_to(state, 0, &task_config).unwrap();
        }
        task.transition_to(TaskState::Running, 1000, &task_config)
            .unwrap();

        scheduler.schedule_once(2000);

        assert!(tracker.get_task(&spec.task_id).is_none());
        let published = events.poll(0, 10);
        assert!(published
            .iter()
            .any(|(_, e)| e.state == TaskState::Lost));
    }
}
