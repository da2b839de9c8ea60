// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for Flotilla: resource vectors, ids, errors, queues.

pub mod error;
pub mod ids;
pub mod queue;
pub mod resources;
pub mod time;
pub mod timed_queue;

pub use error::{FlotillaError, Result};
