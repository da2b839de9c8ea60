// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Store abstraction — the persistence contract the core consumes.
//!
//! Tables are logical namespaces; each is an independent key-value map.
//! Every key carries a store-managed revision, starting at 0 for absent
//! keys; `compare_and_put` rejects writes whose expected revision is stale.
//! Reads are read-your-writes within one store instance.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use flotilla_common::FlotillaError;

/// Errors from store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("revision conflict: expected {expected}, stored {stored}")]
    RevisionConflict { expected: u64, stored: u64 },
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for FlotillaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RevisionConflict { expected, stored } => FlotillaError::StateConflict(
                format!("stale revision: expected {expected}, stored {stored}"),
            ),
            StoreError::NotFound => FlotillaError::Internal("record not found".into()),
            StoreError::Encoding(msg) => FlotillaError::Internal(msg),
            StoreError::Backend(msg) => FlotillaError::TransientStorage(msg),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A value as stored: payload plus its store revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub revision: u64,
    pub data: Vec<u8>,
}

/// Async key-value operations organized by table.
#[async_trait]
pub trait Store: Send + Sync {
    /// Unconditional write; bumps the revision. Returns the new revision.
    async fn put(&self, table: &str, key: &str, data: Vec<u8>) -> StoreResult<u64>;

    /// Write only if the stored revision equals `expected_revision`
    /// (0 for a key that must not exist yet). Returns the new revision.
    async fn compare_and_put(
        &self,
        table: &str,
        key: &str,
        data: Vec<u8>,
        expected_revision: u64,
    ) -> StoreResult<u64>;

    async fn get(&self, table: &str, key: &str) -> StoreResult<Option<Row>>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, table: &str, key: &str) -> StoreResult<bool>;

    /// All rows of a table, sorted by key.
    async fn get_all(&self, table: &str) -> StoreResult<Vec<(String, Row)>>;

    /// Rows whose key starts with `prefix`, sorted by key.
    async fn get_prefix(&self, table: &str, prefix: &str) -> StoreResult<Vec<(String, Row)>>;
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: DashMap<String, DashMap<String, Row>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, table: &str, key: &str, data: Vec<u8>) -> StoreResult<u64> {
        let tbl = self.tables.entry(table.to_string()).or_default();
        let mut entry = tbl.entry(key.to_string()).or_insert(Row {
            revision: 0,
            data: Vec::new(),
        });
        entry.revision += 1;
        entry.data = data;
        Ok(entry.revision)
    }

    async fn compare_and_put(
        &self,
        table: &str,
        key: &str,
        data: Vec<u8>,
        expected_revision: u64,
    ) -> StoreResult<u64> {
        let tbl = self.tables.entry(table.to_string()).or_default();
        let mut entry = tbl.entry(key.to_string()).or_insert(Row {
            revision: 0,
            data: Vec::new(),
        });
        if entry.revision != expected_revision {
            let stored = entry.revision;
            drop(entry);
            // A brand-new row created by the failed check is garbage.
            if expected_revision != 0 && stored == 0 {
                tbl.remove_if(key, |_, row| row.revision == 0);
            }
            return Err(StoreError::RevisionConflict {
                expected: expected_revision,
                stored,
            });
        }
        entry.revision += 1;
        entry.data = data;
        Ok(entry.revision)
    }

    async fn get(&self, table: &str, key: &str) -> StoreResult<Option<Row>> {
        Ok(self
            .tables
            .get(table)
            .and_then(|tbl| tbl.get(key).map(|row| row.value().clone())))
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .get(table)
            .map_or(false, |tbl| tbl.remove(key).is_some()))
    }

    async fn get_all(&self, table: &str) -> StoreResult<Vec<(String, Row)>> {
        let mut rows: Vec<(String, Row)> = self
            .tables
            .get(table)
            .map(|tbl| {
                tbl.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn get_prefix(&self, table: &str, prefix: &str) -> StoreResult<Vec<(String, Row)>> {
        let mut rows: Vec<(String, Row)> = self
            .tables
            .get(table)
            .map(|tbl| {
                tbl.iter()
                    .filter(|e| e.key().starts_with(prefix))
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}
