// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job updates (rollouts): controlled transitions between config versions.

use serde::{Deserialize, Serialize};

use flotilla_common::ids::{JobId, UpdateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    Initialized,
    RollingForward,
    Paused,
    RollingBackward,
    Aborted,
    Succeeded,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Aborted | UpdateState::Succeeded | UpdateState::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Instances moved to the new config version per batch.
    pub batch_size: u32,
    /// Per-instance retry budget while the instance is in rollout progress.
    pub max_instance_attempts: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_instance_attempts: 3,
        }
    }
}

/// Durable record of one rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub id: UpdateId,
    pub job_id: JobId,
    pub state: UpdateState,
    pub config: UpdateConfig,
    /// Target config version instances are being moved to.
    pub target_config_version: u64,
    pub instances_total: u32,
    /// Instances in the current batch, still in progress.
    pub instances_current: Vec<u32>,
    pub instances_done: u32,
    pub instances_failed: u32,
    pub revision: u64,
}

impl UpdateInfo {
    pub fn new(
        id: UpdateId,
        job_id: JobId,
        config: UpdateConfig,
        target_config_version: u64,
        instances_total: u32,
    ) -> Self {
        Self {
            id,
            job_id,
            state: UpdateState::Initialized,
            config,
            target_config_version,
            instances_total,
            instances_current: Vec::new(),
            instances_done: 0,
            instances_failed: 0,
            revision: 0,
        }
    }

    /// Whether an instance is part of the in-progress batch.
    pub fn is_instance_in_progress(&self, instance: u32) -> bool {
        self.instances_current.contains(&instance)
    }
}
