// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placements produced by the placement engine, consumed once by the
//! launcher.

use serde::{Deserialize, Serialize};

use flotilla_common::ids::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub hostname: String,
    pub offer_id: String,
    pub tasks: Vec<TaskId>,
    /// Ports assigned per task on the host.
    pub port_map: Vec<(TaskId, Vec<u32>)>,
}

impl Placement {
    pub fn new(hostname: String, offer_id: String, tasks: Vec<TaskId>) -> Self {
        Self {
            hostname,
            offer_id,
            tasks,
            port_map: Vec::new(),
        }
    }
}
