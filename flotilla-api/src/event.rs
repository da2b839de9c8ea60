// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Status events flowing from agents to the resource manager.

use serde::{Deserialize, Serialize};

use flotilla_common::ids::RunId;

use crate::task::TaskState;

/// One task status observation, ordered by `offset` within its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    pub offset: u64,
    /// Attempt the status belongs to; dropped if it is not the tracked
    /// current attempt.
    pub run_id: RunId,
    pub state: TaskState,
    pub reason: String,
    pub message: String,
    pub timestamp_ms: u64,
}
