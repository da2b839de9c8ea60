// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The placement loop: dequeue ready gangs, solve host fit, commit
//! placements. A gang that finds no hosts goes back to the resource
//! manager whole and retries; its placement budget (rounds and wall clock)
//! is tracked here, and a gang past budget is failed so its owner can
//! react.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flotilla_api::gang::Gang;
use flotilla_api::placement::Placement;
use flotilla_api::task::{TaskState, TaskType};
use flotilla_common::ids::TaskId;
use flotilla_common::time::current_time_ms;
use flotilla_resmgr::ServiceHandler;

use crate::hosts::HostInventory;
use crate::policy::{assign_gang, HostAssignment};

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Task types this engine serves, one loop each.
    pub task_types: Vec<TaskType>,
    pub dequeue_batch: usize,
    pub dequeue_timeout_ms: u64,
    /// Placement attempts before a gang is failed.
    pub max_rounds: u32,
    /// Wall-clock budget before a gang is failed.
    pub max_duration_ms: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            task_types: vec![
                TaskType::Batch,
                TaskType::Stateless,
                TaskType::Daemon,
                TaskType::Stateful,
            ],
            dequeue_batch: 10,
            dequeue_timeout_ms: 100,
            max_rounds: 5,
            max_duration_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RoundState {
    rounds: u32,
    first_seen_ms: u64,
}

pub struct PlacementEngine {
    handler: Arc<ServiceHandler>,
    inventory: Arc<HostInventory>,
    /// Per-gang retry budget, keyed by the gang's first task.
    rounds: Mutex<HashMap<TaskId, RoundState>>,
    config: PlacementConfig,
}

impl PlacementEngine {
    pub fn new(
        handler: Arc<ServiceHandler>,
        inventory: Arc<HostInventory>,
        config: PlacementConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            inventory,
            rounds: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// One dequeue→place→commit round for one task type.
    pub async fn place_once(&self, task_type: TaskType) -> usize {
        let gangs = self
            .handler
            .dequeue_gangs(
                self.config.dequeue_batch,
                task_type,
                Duration::from_millis(self.config.dequeue_timeout_ms),
            )
            .await;
        if gangs.is_empty() {
            return 0;
        }

        let mut placements = Vec::new();
        for gang in gangs {
            match self.solve(&gang) {
                Some(assignments) => {
                    self.rounds.lock().remove(&gang.tasks[0].task_id);
                    placements.extend(assignments.into_iter().map(assignment_to_placement));
                }
                None => self.handle_unplaced(gang),
            }
        }

        let placed = placements.len();
        if placed > 0 {
            for failure in self.handler.set_placements(placements) {
                tracing::error!(
                    host = %failure.placement.hostname,
                    message = %failure.message,
                    "placement rejected by resource manager"
                );
                self.release_placement(&failure.placement);
            }
        }
        placed
    }

    /// Find hosts for the whole gang and commit the claims; an aborted
    /// claim set is rolled back so a gang is never half-placed.
    fn solve(&self, gang: &Gang) -> Option<Vec<HostAssignment>> {
        let snapshot = self.inventory.snapshot();
        let assignments = assign_gang(gang, &snapshot)?;

        let mut claimed: Vec<&HostAssignment> = Vec::new();
        for assignment in &assignments {
            if self.inventory.try_claim(
                &assignment.hostname,
                &assignment.resources,
                assignment.tasks.len(),
                assignment.exclusive,
            ) {
                claimed.push(assignment);
            } else {
                for done in claimed {
                    self.inventory
                        .release(&done.hostname, &done.resources, done.tasks.len());
                }
                return None;
            }
        }
        Some(assignments)
    }

    /// Count a failed round; within budget the gang returns whole to its
    /// pool, past budget its tasks are failed.
    fn handle_unplaced(&self, gang: Gang) {
        let key = gang.tasks[0].task_id.clone();
        let now = current_time_ms();
        let state = {
            let mut rounds = self.rounds.lock();
            let state = rounds.entry(key.clone()).or_insert(RoundState {
                rounds: 0,
                first_seen_ms: now,
            });
            state.rounds += 1;
            *state
        };

        let over_budget = state.rounds >= self.config.max_rounds
            || now.saturating_sub(state.first_seen_ms) >= self.config.max_duration_ms;
        if over_budget {
            tracing::warn!(gang = %key, rounds = state.rounds, "placement budget exhausted");
            self.rounds.lock().remove(&key);
            for spec in &gang.tasks {
                if let Err(err) = self
                    .handler
                    .tracker()
                    .mark_done(&spec.task_id, TaskState::Failed)
                {
                    tracing::warn!(task = %spec.task_id, %err, "could not fail unplaceable task");
                }
            }
            return;
        }

        tracing::debug!(gang = %key, round = state.rounds, "no hosts, returning gang");
        if let Err(err) = self.handler.return_unplaced(gang) {
            tracing::error!(gang = %key, %err, "could not return unplaced gang");
        }
    }

    fn release_placement(&self, placement: &Placement) {
        // Claims were made per assignment; compute what this placement held
        // from the tracked tasks (they are still PLACED at this point).
        let mut total = flotilla_common::resources::ResourceVector::ZERO;
        for task_id in &placement.tasks {
            if let Some(task) = self.handler.tracker().get_task(task_id) {
                total = total.add(&task.resource());
            }
        }
        self.inventory
            .release(&placement.hostname, &total, placement.tasks.len());
    }

    /// Run one placement loop per configured task type until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        self.config
            .task_types
            .iter()
            .map(|&task_type| {
                let this = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tracing::info!(?task_type, "placement loop started");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                tracing::info!(?task_type, "placement loop stopped");
                                return;
                            }
                            _ = this.place_once(task_type) => {}
                        }
                    }
                })
            })
            .collect()
    }
}

fn assignment_to_placement(assignment: HostAssignment) -> Placement {
    Placement {
        hostname: assignment.hostname,
        offer_id: Uuid::new_v4().to_string(),
        tasks: assignment.tasks.iter().map(|t| t.task_id.clone()).collect(),
        port_map: Vec::new(),
    }
}
