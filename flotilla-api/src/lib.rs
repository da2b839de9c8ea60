// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Domain types shared by every Flotilla crate: task and job states and
//! configs, resource pool configs, gangs, placements, updates, and the agent
//! status event shape.

pub mod event;
pub mod gang;
pub mod job;
pub mod placement;
pub mod pool;
pub mod task;
pub mod update;
