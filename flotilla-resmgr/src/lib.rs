// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The resource manager: hierarchical resource pools with fair-share
//! entitlement, per-pool priority gang queues, the authoritative task state
//! machine, a ready scheduler, and a preemptor.
//!
//! Lock order is tree → pool → task → tracker index; nothing acquires
//! upward.

pub mod entitlement;
pub mod handler;
pub mod preemption;
pub mod respool;
pub mod rmtask;
pub mod scheduler;
pub mod tracker;
pub mod tree;

pub use handler::ServiceHandler;
pub use tracker::Tracker;
pub use tree::Tree;
