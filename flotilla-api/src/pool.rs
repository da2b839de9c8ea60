// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource pool configuration.

use serde::{Deserialize, Serialize};

use flotilla_common::ids::PoolId;
use flotilla_common::resources::{Dimension, ResourceVector};
use flotilla_common::{FlotillaError, Result};

/// How a leaf pool orders its pending gangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// Highest priority first, FIFO within a priority level.
    PriorityFifo,
}

/// Static configuration of one resource pool.
///
/// `reservation` is guaranteed-recoverable capacity, `limit` the hard cap,
/// `share` the weight used when distributing slack between siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    pub name: String,
    pub parent: Option<PoolId>,
    pub reservation: ResourceVector,
    pub limit: ResourceVector,
    pub share: ResourceVector,
    pub policy: SchedulingPolicy,
}

impl ResourcePoolConfig {
    /// Validate `reservation ≤ limit` and `share > 0` on every dimension.
    pub fn validate(&self) -> Result<()> {
        if !self.reservation.less_or_equal(&self.limit) {
            return Err(FlotillaError::InvalidConfig(format!(
                "pool {}: reservation ({}) exceeds limit ({})",
                self.name, self.reservation, self.limit
            )));
        }
        for dim in Dimension::ALL {
            if !self.share.get(dim).is_positive() {
                return Err(FlotillaError::InvalidConfig(format!(
                    "pool {}: share must be positive on {dim}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// An equal-share config helper used widely in tests and defaults.
pub fn equal_share() -> ResourceVector {
    ResourceVector::new(1.0, 1.0, 1.0, 1.0)
}
