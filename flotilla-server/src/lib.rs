// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wiring for a Flotilla process: the `Core` owns every subsystem and
//! drives leader start/stop; the Aurora shim translates the legacy verb
//! surface onto job manager and resource manager operations.

pub mod aurora;
pub mod core;

pub use crate::core::{Core, CoreConfig};
pub use aurora::AuroraBridge;
