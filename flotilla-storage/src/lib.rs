// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Persistence for Flotilla.
//!
//! The [`store::Store`] trait is the narrow contract the core consumes;
//! [`store::InMemoryStore`] is the bundled backend. [`tables`] layers typed
//! job/task/update tables with optimistic revision checks on top.

pub mod store;
pub mod tables;

pub use store::{InMemoryStore, Store, StoreError, StoreResult};
pub use tables::TableStorage;
