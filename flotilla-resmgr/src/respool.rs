// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! A single resource pool node.
//!
//! Leaf pools own a priority-FIFO pending queue of gangs and the
//! entitlement/allocation/demand accounting for the tasks below them.
//! Non-leaf pools only aggregate. A pool's accounting serializes under its
//! internal lock; queue operations serialize under the queue's own lock
//! (queue after accounting, never the reverse).

use parking_lot::Mutex;

use flotilla_api::gang::Gang;
use flotilla_api::pool::ResourcePoolConfig;
use flotilla_api::task::RmTaskSpec;
use flotilla_common::ids::{PoolId, TaskId};
use flotilla_common::queue::PriorityQueue;
use flotilla_common::resources::ResourceVector;
use flotilla_common::{FlotillaError, Result};

/// Default bound on a leaf pool's pending queue.
const PENDING_QUEUE_LIMIT: usize = 100_000;

#[derive(Debug, Default)]
struct Accounting {
    /// Fair-share target for the current cycle.
    entitlement: ResourceVector,
    /// Resources held by admitted (READY and beyond) tasks.
    allocation: ResourceVector,
    /// Resources of gangs still in the pending queue.
    demand: ResourceVector,
}

#[derive(Debug)]
pub struct ResPool {
    id: PoolId,
    config: ResourcePoolConfig,
    children: Mutex<Vec<PoolId>>,
    accounting: Mutex<Accounting>,
    pending: PriorityQueue<Gang>,
}

impl ResPool {
    pub fn new(id: PoolId, config: ResourcePoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            config,
            children: Mutex::new(Vec::new()),
            accounting: Mutex::new(Accounting::default()),
            pending: PriorityQueue::new(PENDING_QUEUE_LIMIT),
        })
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.config
    }

    pub fn parent(&self) -> Option<&PoolId> {
        self.config.parent.as_ref()
    }

    pub fn children(&self) -> Vec<PoolId> {
        self.children.lock().clone()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.lock().is_empty()
    }

    pub(crate) fn add_child(&self, child: PoolId) {
        self.children.lock().push(child);
    }

    /// Wrap a single task into a gang of one.
    pub fn make_task_gang(&self, task: RmTaskSpec) -> Gang {
        Gang::of_task(task)
    }

    // ─── pending queue ───────────────────────────────────────────────────

    /// Queue a gang on this leaf pool. Demand accounting is the caller's
    /// step (`add_to_demand`), taken after the gang is accepted.
    pub fn enqueue_gang(&self, gang: Gang) -> Result<()> {
        if gang.is_empty() {
            return Err(FlotillaError::InvalidConfig("gang has no tasks".into()));
        }
        if !self.is_leaf() {
            return Err(FlotillaError::InvalidConfig(format!(
                "pool {} is not a leaf",
                self.config.name
            )));
        }
        self.pending.enqueue(gang.priority(), gang)
    }

    /// Dequeue up to `limit` admissible gangs, highest priority first, FIFO
    /// within a level. A gang is admissible when the pool's allocation plus
    /// the gang's resources stays within entitlement on every dimension.
    ///
    /// Admitted gangs move from demand to allocation in the same step. A
    /// non-admissible gang blocks only its own priority level; lower levels
    /// may still be served.
    pub fn dequeue_gang_list(&self, limit: usize) -> Result<Vec<Gang>> {
        if limit == 0 {
            return Err(FlotillaError::InvalidConfig("limit 0 is not valid".into()));
        }
        let mut out = Vec::new();
        let mut accounting = self.accounting.lock();
        self.pending.with_list(|list| {
            for priority in list.levels() {
                while out.len() < limit {
                    let admissible = match list.iter_level(priority).next() {
                        Some(gang) => {
                            let needed = accounting.allocation.add(&gang.resources());
                            needed.less_or_equal(&accounting.entitlement)
                        }
                        None => break,
                    };
                    if !admissible {
                        // Head of this level stays; try lower priorities.
                        break;
                    }
                    let Some((_, gang)) = list.pop_at(priority) else {
                        break;
                    };
                    let res = gang.resources();
                    let (demand, _) = accounting.demand.subtract(&res);
                    accounting.demand = demand;
                    accounting.allocation = accounting.allocation.add(&res);
                    out.push(gang);
                }
                if out.len() >= limit {
                    break;
                }
            }
        });
        Ok(out)
    }

    /// Remove one task from a pending gang (used when a queued task is
    /// killed). Returns the task's spec if it was found; an emptied gang is
    /// dropped from the queue.
    pub fn remove_from_pending(&self, task_id: &TaskId, priority: u32) -> Option<RmTaskSpec> {
        let mut removed = None;
        self.pending.with_list(|list| {
            let mut emptied = false;
            for gang in list.iter_level_mut(priority) {
                if let Some(pos) = gang.tasks.iter().position(|t| &t.task_id == task_id) {
                    removed = Some(gang.tasks.remove(pos));
                    emptied = gang.is_empty();
                    break;
                }
            }
            if emptied {
                list.remove_where(priority, |g| g.is_empty());
            }
        });
        removed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_level_len(&self, priority: u32) -> usize {
        self.pending.level_len(priority)
    }

    // ─── accounting ──────────────────────────────────────────────────────

    pub fn set_entitlement(&self, entitlement: ResourceVector) {
        self.accounting.lock().entitlement = entitlement;
    }

    pub fn entitlement(&self) -> ResourceVector {
        self.accounting.lock().entitlement
    }

    pub fn allocation(&self) -> ResourceVector {
        self.accounting.lock().allocation
    }

    pub fn demand(&self) -> ResourceVector {
        self.accounting.lock().demand
    }

    /// Resources currently held by this pool's admitted tasks.
    pub fn usage(&self) -> ResourceVector {
        self.allocation()
    }

    pub fn add_to_demand(&self, res: &ResourceVector) {
        let mut accounting = self.accounting.lock();
        accounting.demand = accounting.demand.add(res);
    }

    pub fn subtract_from_demand(&self, res: &ResourceVector) {
        let mut accounting = self.accounting.lock();
        let (demand, clamped) = accounting.demand.subtract(res);
        accounting.demand = demand;
        if clamped {
            tracing::warn!(pool = %self.config.name, "demand went negative, clamped to zero");
        }
    }

    pub fn add_to_allocation(&self, res: &ResourceVector) {
        let mut accounting = self.accounting.lock();
        accounting.allocation = accounting.allocation.add(res);
    }

    pub fn subtract_from_allocation(&self, res: &ResourceVector) {
        let mut accounting = self.accounting.lock();
        let (allocation, clamped) = accounting.allocation.subtract(res);
        accounting.allocation = allocation;
        if clamped {
            tracing::warn!(pool = %self.config.name, "allocation went negative, clamped to zero");
        }
    }
}
