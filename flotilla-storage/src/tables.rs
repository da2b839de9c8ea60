// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Typed tables over the raw store.
//!
//! Rows are JSON-encoded records. Runtime records (job, task, update) carry
//! the store revision in their `revision` field: reads stamp it from the
//! row, writes compare-and-swap against it, so a writer holding a stale
//! record gets a `StateConflict` instead of silently clobbering a newer one.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use flotilla_api::job::{JobConfig, JobRuntime};
use flotilla_api::task::{TaskRuntime, TaskState};
use flotilla_api::update::UpdateInfo;
use flotilla_common::ids::{JobId, TaskId, UpdateId};

use crate::store::{Store, StoreError, StoreResult};

mod table_names {
    pub const JOB_CONFIGS: &str = "JobConfigs";
    pub const JOB_RUNTIMES: &str = "JobRuntimes";
    pub const TASK_RUNTIMES: &str = "TaskRuntimes";
    pub const UPDATES: &str = "Updates";
    pub const UPDATES_BY_JOB: &str = "UpdatesByJob";
}

fn encode<V: Serialize>(value: &V) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn decode<V: DeserializeOwned>(data: &[u8]) -> StoreResult<V> {
    serde_json::from_slice(data).map_err(|e| StoreError::Encoding(e.to_string()))
}

/// All typed tables in one handle, created during server initialization.
#[derive(Clone)]
pub struct TableStorage {
    store: Arc<dyn Store>,
}

impl TableStorage {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ─── jobs ────────────────────────────────────────────────────────────

    /// Create a job: config version 0 plus its initial runtime. Fails if the
    /// job already exists.
    pub async fn create_job(
        &self,
        job_id: &JobId,
        config: &JobConfig,
        runtime: &JobRuntime,
    ) -> StoreResult<()> {
        self.put_job_config(job_id, 0, config).await?;
        let mut runtime = runtime.clone();
        runtime.revision = 1;
        let data = encode(&runtime)?;
        self.store
            .compare_and_put(table_names::JOB_RUNTIMES, job_id.as_str(), data, 0)
            .await?;
        Ok(())
    }

    pub async fn put_job_config(
        &self,
        job_id: &JobId,
        version: u64,
        config: &JobConfig,
    ) -> StoreResult<()> {
        let key = format!("{job_id}@{version}");
        self.store
            .put(table_names::JOB_CONFIGS, &key, encode(config)?)
            .await?;
        Ok(())
    }

    pub async fn get_job_config(
        &self,
        job_id: &JobId,
        version: u64,
    ) -> StoreResult<Option<JobConfig>> {
        let key = format!("{job_id}@{version}");
        match self.store.get(table_names::JOB_CONFIGS, &key).await? {
            Some(row) => Ok(Some(decode(&row.data)?)),
            None => Ok(None),
        }
    }

    pub async fn get_job_runtime(&self, job_id: &JobId) -> StoreResult<Option<JobRuntime>> {
        match self
            .store
            .get(table_names::JOB_RUNTIMES, job_id.as_str())
            .await?
        {
            Some(row) => {
                let mut runtime: JobRuntime = decode(&row.data)?;
                runtime.revision = row.revision;
                Ok(Some(runtime))
            }
            None => Ok(None),
        }
    }

    /// Write a job runtime read earlier; rejects if someone wrote in
    /// between. Returns the record with its new revision.
    pub async fn update_job_runtime(
        &self,
        job_id: &JobId,
        runtime: &JobRuntime,
    ) -> StoreResult<JobRuntime> {
        let expected = runtime.revision;
        let mut updated = runtime.clone();
        updated.revision = expected + 1;
        let data = encode(&updated)?;
        self.store
            .compare_and_put(table_names::JOB_RUNTIMES, job_id.as_str(), data, expected)
            .await?;
        Ok(updated)
    }

    /// All job ids with a runtime record.
    pub async fn list_jobs(&self) -> StoreResult<Vec<JobId>> {
        let rows = self.store.get_all(table_names::JOB_RUNTIMES).await?;
        Ok(rows.into_iter().map(|(key, _)| JobId(key)).collect())
    }

    pub async fn delete_job(&self, job_id: &JobId) -> StoreResult<()> {
        self.store
            .delete(table_names::JOB_RUNTIMES, job_id.as_str())
            .await?;
        let tasks = self.list_task_runtimes(job_id).await?;
        for (task_id, _) in tasks {
            self.store
                .delete(table_names::TASK_RUNTIMES, &task_id.to_string())
                .await?;
        }
        Ok(())
    }

    // ─── tasks ───────────────────────────────────────────────────────────

    /// Create the runtime record of a task that has no prior execution.
    pub async fn create_task_runtime(
        &self,
        task_id: &TaskId,
        runtime: &TaskRuntime,
    ) -> StoreResult<TaskRuntime> {
        let mut runtime = runtime.clone();
        runtime.revision = 1;
        let data = encode(&runtime)?;
        self.store
            .compare_and_put(table_names::TASK_RUNTIMES, &task_id.to_string(), data, 0)
            .await?;
        Ok(runtime)
    }

    pub async fn get_task_runtime(&self, task_id: &TaskId) -> StoreResult<Option<TaskRuntime>> {
        match self
            .store
            .get(table_names::TASK_RUNTIMES, &task_id.to_string())
            .await?
        {
            Some(row) => {
                let mut runtime: TaskRuntime = decode(&row.data)?;
                runtime.revision = row.revision;
                Ok(Some(runtime))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-swap write of a task runtime.
    pub async fn update_task_runtime(
        &self,
        task_id: &TaskId,
        runtime: &TaskRuntime,
    ) -> StoreResult<TaskRuntime> {
        let expected = runtime.revision;
        let mut updated = runtime.clone();
        updated.revision = expected + 1;
        let data = encode(&updated)?;
        self.store
            .compare_and_put(
                table_names::TASK_RUNTIMES,
                &task_id.to_string(),
                data,
                expected,
            )
            .await?;
        Ok(updated)
    }

    /// All task runtimes of one job, ordered by instance.
    pub async fn list_task_runtimes(
        &self,
        job_id: &JobId,
    ) -> StoreResult<Vec<(TaskId, TaskRuntime)>> {
        let prefix = format!("{job_id}-");
        let rows = self
            .store
            .get_prefix(table_names::TASK_RUNTIMES, &prefix)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            // Prefix matching alone is ambiguous when one job id is a
            // prefix of another; re-parse and compare exactly.
            let Ok(task_id) = key.parse::<TaskId>() else {
                continue;
            };
            if &task_id.job_id != job_id {
                continue;
            }
            let mut runtime: TaskRuntime = decode(&row.data)?;
            runtime.revision = row.revision;
            out.push((task_id, runtime));
        }
        out.sort_by_key(|(task_id, _)| task_id.instance);
        Ok(out)
    }

    /// Count of this job's tasks per state, the input of the job runtime
    /// updater.
    pub async fn task_state_summary(
        &self,
        job_id: &JobId,
    ) -> StoreResult<BTreeMap<TaskState, u32>> {
        let mut summary = BTreeMap::new();
        for (_, runtime) in self.list_task_runtimes(job_id).await? {
            *summary.entry(runtime.state).or_insert(0) += 1;
        }
        Ok(summary)
    }

    /// Instance ids of this job's tasks in one state, ordered.
    pub async fn task_instances_in_state(
        &self,
        job_id: &JobId,
        state: TaskState,
    ) -> StoreResult<Vec<u32>> {
        Ok(self
            .list_task_runtimes(job_id)
            .await?
            .into_iter()
            .filter(|(_, rt)| rt.state == state)
            .map(|(task_id, _)| task_id.instance)
            .collect())
    }

    // ─── updates ─────────────────────────────────────────────────────────

    pub async fn create_update(&self, update: &UpdateInfo) -> StoreResult<UpdateInfo> {
        let mut update = update.clone();
        update.revision = 1;
        let data = encode(&update)?;
        self.store
            .compare_and_put(table_names::UPDATES, update.id.as_str(), data, 0)
            .await?;
        let index_key = format!("{}/{}", update.job_id, update.id);
        self.store
            .put(
                table_names::UPDATES_BY_JOB,
                &index_key,
                update.id.as_str().as_bytes().to_vec(),
            )
            .await?;
        Ok(update)
    }

    pub async fn get_update(&self, update_id: &UpdateId) -> StoreResult<Option<UpdateInfo>> {
        match self.store.get(table_names::UPDATES, update_id.as_str()).await? {
            Some(row) => {
                let mut update: UpdateInfo = decode(&row.data)?;
                update.revision = row.revision;
                Ok(Some(update))
            }
            None => Ok(None),
        }
    }

    pub async fn update_update(&self, update: &UpdateInfo) -> StoreResult<UpdateInfo> {
        let expected = update.revision;
        let mut updated = update.clone();
        updated.revision = expected + 1;
        let data = encode(&updated)?;
        self.store
            .compare_and_put(table_names::UPDATES, updated.id.as_str(), data, expected)
            .await?;
        Ok(updated)
    }

    /// Update ids recorded for a job, via the secondary index.
    pub async fn updates_for_job(&self, job_id: &JobId) -> StoreResult<Vec<UpdateId>> {
        let prefix = format!("{job_id}/");
        let rows = self
            .store
            .get_prefix(table_names::UPDATES_BY_JOB, &prefix)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(_, row)| UpdateId(String::from_utf8_lossy(&row.data).into_owned()))
            .collect())
    }
}
