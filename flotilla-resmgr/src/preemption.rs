// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The preemptor.
//!
//! Watches leaf pools whose allocation has exceeded entitlement for a
//! sustained number of cycles, ranks resident tasks as eviction victims,
//! returns READY victims to the pending queue (keeping their run id), and
//! pushes RUNNING victims onto a bounded preemption queue the job manager
//! drains to issue graceful kills.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use flotilla_api::task::{RmTaskSpec, TaskState};
use flotilla_common::ids::PoolId;
use flotilla_common::resources::ResourceVector;
use flotilla_common::time::current_time_ms;
use flotilla_common::timed_queue::TimedQueue;
use flotilla_common::Result;

use crate::respool::ResPool;
use crate::rmtask::RmTask;
use crate::tracker::Tracker;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy)]
pub struct PreemptionConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Consecutive over-allocated cycles before a pool becomes eligible.
    pub sustained_threshold: u32,
    pub queue_capacity: usize,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 60_000,
            sustained_threshold: 5,
            queue_capacity: 10_000,
        }
    }
}

pub struct Preemptor {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    /// Consecutive over-allocation cycle count per leaf pool.
    over_allocation: Mutex<HashMap<PoolId, u32>>,
    /// RUNNING victims awaiting a graceful kill.
    queue: TimedQueue<RmTaskSpec>,
    config: PreemptionConfig,
}

impl Preemptor {
    pub fn new(tree: Arc<Tree>, tracker: Arc<Tracker>, config: PreemptionConfig) -> Arc<Self> {
        Arc::new(Self {
            tree,
            tracker,
            over_allocation: Mutex::new(HashMap::new()),
            queue: TimedQueue::new(config.queue_capacity),
            config,
        })
    }

    /// Pop the next RUNNING victim, waiting up to `timeout`.
    pub async fn dequeue_task(&self, timeout: Duration) -> Result<RmTaskSpec> {
        self.queue.dequeue(timeout).await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// One preemption cycle: bump/reset the per-pool counters, then evict
    /// from every pool past the sustained threshold.
    pub fn preempt_once(&self) {
        self.update_pool_state();
        for pool_id in self.eligible_pools() {
            if let Err(err) = self.process_pool(&pool_id) {
                tracing::warn!(pool = %pool_id, %err, "preemption pass failed");
            }
        }
    }

    fn update_pool_state(&self) {
        let mut state = self.over_allocation.lock();
        for pool in self.tree.all_pools(true) {
            let (above, _) = pool.allocation().subtract(&pool.entitlement());
            let counter = state.entry(pool.id().clone()).or_insert(0);
            if above.is_zero() {
                *counter = 0;
            } else {
                *counter += 1;
            }
        }
    }

    fn eligible_pools(&self) -> Vec<PoolId> {
        self.over_allocation
            .lock()
            .iter()
            .filter(|(_, &count)| count >= self.config.sustained_threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn mark_processed(&self, pool_id: &PoolId) {
        self.over_allocation.lock().insert(pool_id.clone(), 0);
    }

    fn process_pool(&self, pool_id: &PoolId) -> Result<()> {
        let pool = self.tree.get(pool_id)?;
        let (to_free, _) = pool.allocation().subtract(&pool.entitlement());
        tracing::debug!(pool = %pool.name(), %to_free, "resources to free");

        for victim in self.rank_victims(pool_id, &to_free) {
            match victim.current_state() {
                TaskState::Running => self.preempt_running(&victim),
                TaskState::Ready => self.evict_ready(&victim, &pool),
                // Ranked but not actionable mid-placement; the next cycle
                // sees them in a later state.
                other => {
                    tracing::debug!(task = %victim.task_id(), state = %other, "skipping victim")
                }
            }
        }
        self.mark_processed(pool_id);
        Ok(())
    }

    /// Victims ordered by (priority ascending, state rank ascending,
    /// start time descending), taken greedily until the deficit is covered.
    fn rank_victims(&self, pool_id: &PoolId, to_free: &ResourceVector) -> Vec<Arc<RmTask>> {
        fn state_rank(state: TaskState) -> u8 {
            match state {
                TaskState::Ready => 0,
                TaskState::Placing => 1,
                TaskState::Placed => 2,
                TaskState::Launching | TaskState::Launched => 3,
                TaskState::Running => 4,
                _ => u8::MAX,
            }
        }

        let mut candidates: Vec<Arc<RmTask>> = self
            .tracker
            .tasks_in_pool(pool_id)
            .into_iter()
            .filter(|t| t.preemptible() && state_rank(t.current_state()) != u8::MAX)
            .collect();
        candidates.sort_by_key(|t| {
            (
                t.priority(),
                state_rank(t.current_state()),
                Reverse(t.start_time_ms().unwrap_or(u64::MAX)),
            )
        });

        let mut victims = Vec::new();
        let mut freed = ResourceVector::ZERO;
        for task in candidates {
            if to_free.less_or_equal(&freed) {
                break;
            }
            freed = freed.add(&task.resource());
            victims.push(task);
        }
        victims
    }

    /// A RUNNING victim keeps running until the job manager kills it with
    /// grace; here it only moves to PREEMPTING and joins the queue.
    fn preempt_running(&self, task: &Arc<RmTask>) {
        let task_id = task.task_id();
        if let Err(err) = task.transition_to(
            TaskState::Preempting,
            current_time_ms(),
            self.tracker.task_config(),
        ) {
            tracing::debug!(task = %task_id, %err, "victim left RUNNING before preemption");
            return;
        }
        self.tracker
            .publish_state(task, TaskState::Preempting, "preempted by pool rebalance");
        if let Err(err) = self.queue.enqueue(task.spec()) {
            tracing::error!(task = %task_id, %err, "preemption queue full");
        } else {
            tracing::info!(task = %task_id, "queued running task for preemption");
        }
    }

    /// A READY victim goes back to the pending queue with its run id
    /// intact: demand regained, allocation released.
    fn evict_ready(&self, task: &Arc<RmTask>, pool: &Arc<ResPool>) {
        let task_id = task.task_id();
        if let Err(err) = task.transition_to(
            TaskState::Pending,
            current_time_ms(),
            self.tracker.task_config(),
        ) {
            tracing::debug!(task = %task_id, %err, "victim left READY before eviction");
            return;
        }
        let spec = task.spec();
        let res = spec.resource;
        if let Err(err) = pool.enqueue_gang(pool.make_task_gang(spec)) {
            tracing::error!(task = %task_id, %err, "could not re-enqueue evicted task");
            return;
        }
        pool.add_to_demand(&res);
        pool.subtract_from_allocation(&res);
        tracing::info!(task = %task_id, pool = %pool.name(), "evicted ready task");
    }

    /// Run the preemption loop until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if !this.config.enabled {
                tracing::info!("preemptor disabled");
                return;
            }
            tracing::info!("preemptor started");
            let mut tick = tokio::time::interval(Duration::from_millis(this.config.period_ms));
            // The first interval tick fires immediately; skip it so a cycle
            // always reflects a full period.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("preemptor stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        this.preempt_once();
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
    use flotilla_api::task::{TaskConfig, TaskType};
    use flotilla_common::ids::{JobId, TaskId};
    use flotilla_eventstream::EventStream;

    fn capacity() -> ResourceVector {
        ResourceVector::new(100.0, 10000.0, 1000.0, 8.0)
    }

    struct Fixture {
        tracker: Arc<Tracker>,
        preemptor: Arc<Preemptor>,
        pool: Arc<ResPool>,
    }

    fn setup(threshold: u32) -> Fixture {
        let tree = Tree::new(root_config(capacity())).unwrap();
        let pool = tree
            .add_pool(
                PoolId::from("pool-a"),
                pool_config("pool-a", Some("root"), ResourceVector::ZERO, capacity()),
            )
            .unwrap();
        let events = Arc::new(EventStream::<TaskStatusEvent>::new(4096, &["jobmgr"]));
        let tracker = Tracker::new(tree.clone(), events, RmTaskConfig::default());
        let preemptor = Preemptor::new(
            tree.clone(),
            tracker.clone(),
            PreemptionConfig {
                sustained_threshold: threshold,
                ..PreemptionConfig::default()
            },
        );
        Fixture {
            tracker,
            preemptor,
            pool,
        }
    }

    /// Admit a task into the pool and walk it to the given state.
    fn resident_task(fx: &Fixture, instance: u32, cpu: f64, priority: u32, state: TaskState) {
        let config = TaskConfig {
            resource: ResourceVector::new(cpu, 10.0, 0.0, 0.0),
            priority,
            task_type: TaskType::Batch,
            ..TaskConfig::default()
        };
        let spec = RmTaskSpec::new(TaskId::new(JobId::from("job-a"), instance), 1, &config);
        let task = fx
            .tracker
            .add_task(spec.clone(), PoolId::from("pool-a"))
            .unwrap();
        fx.pool.add_to_allocation(&spec.resource);
        let path: &[TaskState] = match state {
            TaskState::Ready => &[TaskState::Pending, TaskState::Ready],
            TaskState::Running => &[
                TaskState::Pending,
                TaskState::Ready,
                TaskState::Placing,
                TaskState::Placed,
                TaskState::Launching,
                TaskState::Running,
            ],
            _ => panic!("unsupported fixture state"),
        };
        for &s in path {
            task.transition_to(s, 0, fx.tracker.task_config()).unwrap();
        }
    }

    #[test]
    fn test_eligibility_needs_sustained_overallocation() {
        let fx = setup(3);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        resident_task(&fx, 0, 20.0, 5, TaskState::Running);

        fx.preemptor.preempt_once();
        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 0, "threshold not reached");

        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 1);
    }

    #[test]
    fn test_counter_resets_when_within_entitlement() {
        let fx = setup(2);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        resident_task(&fx, 0, 20.0, 5, TaskState::Running);

        fx.preemptor.preempt_once();
        // Entitlement catches up before the threshold.
        fx.pool
            .set_entitlement(ResourceVector::new(50.0, 10000.0, 1000.0, 8.0));
        fx.preemptor.preempt_once();
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 0, "counter must have reset");
    }

    #[tokio::test]
    async fn test_running_victims_queued_priority_ascending() {
        let fx = setup(1);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        // 20 cpu allocated against entitlement 10; two tasks must go.
        resident_task(&fx, 0, 5.0, 9, TaskState::Running);
        resident_task(&fx, 1, 5.0, 1, TaskState::Running);
        resident_task(&fx, 2, 5.0, 3, TaskState::Running);
        resident_task(&fx, 3, 5.0, 7, TaskState::Running);

        fx.preemptor.preempt_once();

        assert_eq!(fx.preemptor.queue_len(), 2);
        let first = fx
            .preemptor
            .dequeue_task(Duration::from_millis(10))
            .await
            .unwrap();
        let second = fx
            .preemptor
            .dequeue_task(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.priority, 1);
        assert_eq!(second.priority, 3);
    }

    #[test]
    fn test_ready_victims_evicted_before_running() {
        let fx = setup(1);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        resident_task(&fx, 0, 10.0, 5, TaskState::Running);
        resident_task(&fx, 1, 10.0, 5, TaskState::Ready);

        fx.preemptor.preempt_once();

        // The READY task absorbed the whole deficit: back to pending with
        // its run id, no kill queued.
        assert_eq!(fx.preemptor.queue_len(), 0);
        let ready_task = fx
            .tracker
            .get_task(&TaskId::new(JobId::from("job-a"), 1))
            .unwrap();
        assert_eq!(ready_task.current_state(), TaskState::Pending);
        assert_eq!(ready_task.run_id().run, 1, "run id kept on eviction");
        assert_eq!(fx.pool.pending_len(), 1);
        assert_eq!(fx.pool.allocation().cpu.to_f64(), 10.0);
        assert_eq!(fx.pool.demand().cpu.to_f64(), 10.0);
    }

    #[test]
    fn test_non_preemptible_tasks_are_spared() {
        let fx = setup(1);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        let config = TaskConfig {
            resource: ResourceVector::new(20.0, 10.0, 0.0, 0.0),
            preemptible: false,
            ..TaskConfig::default()
        };
        let spec = RmTaskSpec::new(TaskId::new(JobId::from("job-a"), 0), 1, &config);
        let task = fx
            .tracker
            .add_task(spec.clone(), PoolId::from("pool-a"))
            .unwrap();
        fx.pool.add_to_allocation(&spec.resource);
        for s in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
            TaskState::Running,
        ] {
            task.transition_to(s, 0, fx.tracker.task_config()).unwrap();
        }

        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 0);
        assert_eq!(task.current_state(), TaskState::Running);
    }

    #[test]
    fn test_gang_atomicity_scenario_from_spec() {
        // Pool at entitlement 10 cpu, allocation 20 cpu, threshold 3:
        // after three cycles, 10 cpu of RUNNING tasks land in the queue
        // in priority-ascending order.
        let fx = setup(3);
        fx.pool
            .set_entitlement(ResourceVector::new(10.0, 10000.0, 1000.0, 8.0));
        for i in 0..20 {
            resident_task(&fx, i, 1.0, 5, TaskState::Running);
        }
        fx.preemptor.preempt_once();
        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 0);
        fx.preemptor.preempt_once();
        assert_eq!(fx.preemptor.queue_len(), 10);
    }
}
