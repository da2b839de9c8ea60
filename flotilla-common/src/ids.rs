// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Identifier types.
//!
//! A task instance is identified by `TaskId` (`<job>-<instance>`), stable
//! across restarts. Each execution attempt gets a `RunId`
//! (`<job>-<instance>-<run>`) with a monotonically increasing run number;
//! status events are matched against the current run id, so a stale attempt
//! can never update a newer one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random id.
            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_string_id!(JobId, "Identifier of a job.");
define_string_id!(PoolId, "Identifier of a resource pool.");
define_string_id!(UpdateId, "Identifier of a job update (rollout).");

/// Identifier of a task instance: a job id plus an instance index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: JobId,
    pub instance: u32,
}

impl TaskId {
    pub fn new(job_id: JobId, instance: u32) -> Self {
        Self { job_id, instance }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.job_id, self.instance)
    }
}

impl FromStr for TaskId {
    type Err = crate::FlotillaError;

    // Job ids may themselves contain '-', so the instance is the last segment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, instance) = s
            .rsplit_once('-')
            .ok_or_else(|| crate::FlotillaError::InvalidConfig(format!("bad task id: {s}")))?;
        let instance = instance
            .parse::<u32>()
            .map_err(|_| crate::FlotillaError::InvalidConfig(format!("bad task id: {s}")))?;
        Ok(Self {
            job_id: JobId(job.to_string()),
            instance,
        })
    }
}

/// Identifier of one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub task_id: TaskId,
    pub run: u64,
}

impl RunId {
    pub fn first(task_id: TaskId) -> Self {
        Self { task_id, run: 1 }
    }

    /// The id of the next attempt of the same task instance.
    pub fn next(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            run: self.run + 1,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.task_id, self.run)
    }
}

impl FromStr for RunId {
    type Err = crate::FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task, run) = s
            .rsplit_once('-')
            .ok_or_else(|| crate::FlotillaError::InvalidConfig(format!("bad run id: {s}")))?;
        let run = run
            .parse::<u64>()
            .map_err(|_| crate::FlotillaError::InvalidConfig(format!("bad run id: {s}")))?;
        Ok(Self {
            task_id: task.parse()?,
            run,
        })
    }
}
