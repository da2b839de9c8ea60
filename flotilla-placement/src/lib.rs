// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The placement engine: pulls ready gangs from the resource manager,
//! solves host fit against the live host inventory, and hands placements
//! back. A gang is placed atomically or returned whole.

pub mod engine;
pub mod hosts;
pub mod policy;

pub use engine::{PlacementConfig, PlacementEngine};
pub use hosts::{HostInventory, HostOffer, HostSnapshot};
