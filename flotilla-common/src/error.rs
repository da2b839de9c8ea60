// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Workspace-wide error type.
//!
//! Loops never die on per-entity errors: `StateConflict` and
//! `TransientStorage` are retried by the owning loop, `BudgetExhausted` is
//! surfaced to the owning entity, and only startup-time `InvalidConfig` is
//! fatal to a process.

use thiserror::Error;

/// The primary error type for Flotilla operations.
#[derive(Debug, Clone, Error)]
pub enum FlotillaError {
    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Illegal state transition or stale revision; the caller loop retries.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// Placement rounds or restart attempts used up.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    TimedOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlotillaError {
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Errors the owning loop should retry with backoff rather than surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StateConflict(_) | Self::TransientStorage(_))
    }
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
