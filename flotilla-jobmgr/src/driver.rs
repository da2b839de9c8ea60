// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The goal-state driver.
//!
//! Owns the three reconciling engines (jobs, tasks, updates), the job
//! cache, and the clients the action modules act through. All state writes
//! go through the revision-checked storage tables; a conflict invalidates
//! the cached mirror and surfaces `StateConflict` so the engine retries
//! with backoff against fresh state.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flotilla_api::job::{JobConfig, JobRuntime, JobState};
use flotilla_api::task::{TaskRuntime, TaskState};
use flotilla_api::update::{UpdateConfig, UpdateInfo};
use flotilla_common::ids::{JobId, TaskId, UpdateId};
use flotilla_common::time::current_time_ms;
use flotilla_common::{FlotillaError, Result};
use flotilla_resmgr::ServiceHandler;
use flotilla_storage::TableStorage;

use crate::cached::JobCache;
use crate::engine::{Engine, EngineConfig, Entity};
use crate::{job_actions, task_actions, update_actions};

#[derive(Clone)]
pub struct JobEntity {
    pub job_id: JobId,
}

impl Entity for JobEntity {
    fn key(&self) -> String {
        format!("job:{}", self.job_id)
    }
}

#[derive(Clone)]
pub struct TaskEntity {
    pub task_id: TaskId,
}

impl Entity for TaskEntity {
    fn key(&self) -> String {
        format!("task:{}", self.task_id)
    }
}

#[derive(Clone)]
pub struct UpdateEntity {
    pub update_id: UpdateId,
}

impl Entity for UpdateEntity {
    fn key(&self) -> String {
        format!("update:{}", self.update_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GoalStateDriverConfig {
    pub job_workers: usize,
    pub task_workers: usize,
    pub update_workers: usize,
    /// Base delay before retrying a failed task instance.
    pub initial_task_backoff_ms: u64,
    pub max_task_backoff_ms: u64,
    /// Cadence of rollout progression checks.
    pub update_progress_interval_ms: u64,
}

impl Default for GoalStateDriverConfig {
    fn default() -> Self {
        Self {
            job_workers: 2,
            task_workers: 4,
            update_workers: 1,
            initial_task_backoff_ms: 30_000,
            max_task_backoff_ms: 3_600_000,
            update_progress_interval_ms: 5_000,
        }
    }
}

pub struct GoalStateDriver {
    storage: TableStorage,
    rm: Arc<ServiceHandler>,
    cache: JobCache,
    job_engine: Arc<Engine<JobEntity>>,
    task_engine: Arc<Engine<TaskEntity>>,
    update_engine: Arc<Engine<UpdateEntity>>,
    config: GoalStateDriverConfig,
}

impl GoalStateDriver {
    pub fn new(
        storage: TableStorage,
        rm: Arc<ServiceHandler>,
        config: GoalStateDriverConfig,
    ) -> Arc<Self> {
        let engine_config = |workers| EngineConfig {
            workers,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        };
        Arc::new(Self {
            storage,
            rm,
            cache: JobCache::new(),
            job_engine: Engine::new(engine_config(config.job_workers)),
            task_engine: Engine::new(engine_config(config.task_workers)),
            update_engine: Engine::new(engine_config(config.update_workers)),
            config,
        })
    }

    pub fn storage(&self) -> &TableStorage {
        &self.storage
    }

    pub fn rm(&self) -> &Arc<ServiceHandler> {
        &self.rm
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    pub fn config(&self) -> &GoalStateDriverConfig {
        &self.config
    }

    // ─── enqueue helpers ─────────────────────────────────────────────────

    pub fn enqueue_job(&self, job_id: JobId, delay: Duration) {
        self.job_engine.enqueue(JobEntity { job_id }, delay);
    }

    pub fn enqueue_task(&self, task_id: TaskId, delay: Duration) {
        self.task_engine.enqueue(TaskEntity { task_id }, delay);
    }

    pub fn enqueue_update(&self, update_id: UpdateId, delay: Duration) {
        self.update_engine.enqueue(UpdateEntity { update_id }, delay);
    }

    pub fn is_task_scheduled(&self, task_id: &TaskId) -> bool {
        self.task_engine.is_scheduled(&format!("task:{task_id}"))
    }

    // ─── reads (cache first, store as ground truth) ──────────────────────

    pub async fn job_config(&self, job_id: &JobId) -> Result<JobConfig> {
        let cached = self.cache.add_job(job_id);
        if let Some(config) = cached.config() {
            return Ok(config);
        }
        let config = self
            .storage
            .get_job_config(job_id, 0)
            .await?
            .ok_or_else(|| FlotillaError::Internal(format!("job {job_id} has no config")))?;
        cached.set_config(config.clone());
        Ok(config)
    }

    pub async fn job_runtime(&self, job_id: &JobId) -> Result<JobRuntime> {
        let cached = self.cache.add_job(job_id);
        if let Some(runtime) = cached.runtime() {
            return Ok(runtime);
        }
        let runtime = self
            .storage
            .get_job_runtime(job_id)
            .await?
            .ok_or_else(|| FlotillaError::Internal(format!("job {job_id} has no runtime")))?;
        cached.update_runtime(runtime.clone());
        Ok(runtime)
    }

    pub async fn task_runtime(&self, task_id: &TaskId) -> Result<Option<TaskRuntime>> {
        let cached = self.cache.add_job(&task_id.job_id).task(task_id.instance);
        if let Some(runtime) = cached.runtime() {
            return Ok(Some(runtime));
        }
        let runtime = self.storage.get_task_runtime(task_id).await?;
        if let Some(runtime) = &runtime {
            cached.update_runtime(runtime.clone());
        }
        Ok(runtime)
    }

    // ─── writes (revision-checked, cache kept in step) ───────────────────

    pub async fn write_job_runtime(
        &self,
        job_id: &JobId,
        runtime: &JobRuntime,
    ) -> Result<JobRuntime> {
        match self.storage.update_job_runtime(job_id, runtime).await {
            Ok(written) => {
                self.cache.add_job(job_id).update_runtime(written.clone());
                Ok(written)
            }
            Err(err) => {
                self.cache.add_job(job_id).invalidate_runtime();
                Err(err.into())
            }
        }
    }

    pub async fn write_task_runtime(
        &self,
        task_id: &TaskId,
        runtime: &TaskRuntime,
    ) -> Result<TaskRuntime> {
        let cached = self.cache.add_job(&task_id.job_id).task(task_id.instance);
        match self.storage.update_task_runtime(task_id, runtime).await {
            Ok(written) => {
                cached.update_runtime(written.clone());
                Ok(written)
            }
            Err(err) => {
                cached.invalidate();
                Err(err.into())
            }
        }
    }

    // ─── job lifecycle entry points ──────────────────────────────────────

    /// Create a job: persist config version 0, the job runtime, and one
    /// task runtime per instance, then hand everything to the engines.
    pub async fn create_job(&self, config: JobConfig, goal_state: JobState) -> Result<JobId> {
        if config.instance_count == 0 {
            return Err(FlotillaError::InvalidConfig(
                "job needs at least one instance".into(),
            ));
        }
        let job_id = JobId::random();
        let runtime = JobRuntime::new(goal_state, current_time_ms());
        self.storage.create_job(&job_id, &config, &runtime).await?;

        let task_goal = match goal_state {
            JobState::Killed => TaskState::Killed,
            _ => TaskState::Succeeded,
        };
        for instance in 0..config.instance_count {
            let task_id = TaskId::new(job_id.clone(), instance);
            let task_runtime = TaskRuntime::initial(task_id.clone(), task_goal);
            self.storage
                .create_task_runtime(&task_id, &task_runtime)
                .await?;
        }

        let cached = self.cache.add_job(&job_id);
        cached.set_config(config.clone());

        // Jobs with a running-instance cap admit through the job-level SLA
        // pass instead of one task entity at a time.
        if config.sla.maximum_running_instances == 0 {
            for instance in 0..config.instance_count {
                self.enqueue_task(TaskId::new(job_id.clone(), instance), Duration::ZERO);
            }
        }
        self.enqueue_job(job_id.clone(), Duration::ZERO);
        tracing::info!(job = %job_id, instances = config.instance_count, "job created");
        Ok(job_id)
    }

    /// Drive a job toward `Killed`: flip the job goal and every task goal,
    /// then let the engines do the stopping.
    pub async fn kill_job(&self, job_id: &JobId) -> Result<()> {
        let mut runtime = self.job_runtime(job_id).await?;
        if runtime.goal_state == JobState::Killed {
            return Ok(());
        }
        runtime.goal_state = JobState::Killed;
        self.write_job_runtime(job_id, &runtime).await?;

        for (task_id, mut task_runtime) in self.storage.list_task_runtimes(job_id).await? {
            if task_runtime.goal_state != TaskState::Killed {
                task_runtime.goal_state = TaskState::Killed;
                self.write_task_runtime(&task_id, &task_runtime).await?;
            }
            self.enqueue_task(task_id, Duration::ZERO);
        }
        self.enqueue_job(job_id.clone(), Duration::ZERO);
        Ok(())
    }

    // ─── updates ─────────────────────────────────────────────────────────

    /// Start a rollout to a new config version.
    pub async fn create_update(
        &self,
        job_id: &JobId,
        new_config: JobConfig,
        update_config: UpdateConfig,
    ) -> Result<UpdateId> {
        let mut runtime = self.job_runtime(job_id).await?;
        if let Some(existing) = &runtime.update_id {
            if let Some(update) = self.storage.get_update(existing).await? {
                if update.state.is_active() {
                    return Err(FlotillaError::StateConflict(format!(
                        "job {job_id} already has active update {existing}"
                    )));
                }
            }
        }

        let target_version = current_max_config_version(&self.storage, job_id).await? + 1;
        self.storage
            .put_job_config(job_id, target_version, &new_config)
            .await?;

        let update_id = UpdateId::random();
        let update = UpdateInfo::new(
            update_id.clone(),
            job_id.clone(),
            update_config,
            target_version,
            new_config.instance_count,
        );
        self.storage.create_update(&update).await?;

        runtime.update_id = Some(update_id.clone());
        self.write_job_runtime(job_id, &runtime).await?;

        self.enqueue_update(update_id.clone(), Duration::ZERO);
        tracing::info!(job = %job_id, update = %update_id, target_version, "update created");
        Ok(update_id)
    }

    pub async fn pause_update(&self, update_id: &UpdateId) -> Result<()> {
        update_actions::set_state(self, update_id, flotilla_api::update::UpdateState::Paused).await
    }

    pub async fn resume_update(&self, update_id: &UpdateId) -> Result<()> {
        let out = update_actions::set_state(
            self,
            update_id,
            flotilla_api::update::UpdateState::RollingForward,
        )
        .await;
        if out.is_ok() {
            self.enqueue_update(update_id.clone(), Duration::ZERO);
        }
        out
    }

    pub async fn abort_update(&self, update_id: &UpdateId) -> Result<()> {
        update_actions::set_state(self, update_id, flotilla_api::update::UpdateState::Aborted).await
    }

    // ─── engine wiring ───────────────────────────────────────────────────

    /// Start the three reconciliation engines.
    pub fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let driver = self.clone();
        handles.extend(self.job_engine.start(cancel.clone(), move |entity: JobEntity| {
            let driver = driver.clone();
            async move { job_actions::process(&driver, &entity.job_id).await }
        }));

        let driver = self.clone();
        handles.extend(
            self.task_engine
                .start(cancel.clone(), move |entity: TaskEntity| {
                    let driver = driver.clone();
                    async move { task_actions::process(&driver, &entity.task_id).await }
                }),
        );

        let driver = self.clone();
        handles.extend(
            self.update_engine
                .start(cancel, move |entity: UpdateEntity| {
                    let driver = driver.clone();
                    async move { update_actions::process(&driver, &entity.update_id).await }
                }),
        );

        handles
    }

    /// Reload non-terminal jobs from storage and hand them back to the
    /// engines; runs when this process takes over as leader.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for job_id in self.storage.list_jobs().await? {
            let Some(runtime) = self.storage.get_job_runtime(&job_id).await? else {
                continue;
            };
            if runtime.state.is_terminal() {
                continue;
            }
            recovered += 1;
            self.cache.add_job(&job_id).update_runtime(runtime.clone());
            for (task_id, task_runtime) in self.storage.list_task_runtimes(&job_id).await? {
                if !task_runtime.state.is_terminal() {
                    self.enqueue_task(task_id, Duration::ZERO);
                }
            }
            if let Some(update_id) = runtime.update_id {
                self.enqueue_update(update_id, Duration::ZERO);
            }
            self.enqueue_job(job_id, Duration::ZERO);
        }
        tracing::info!(recovered, "job recovery complete");
        Ok(recovered)
    }
}

async fn current_max_config_version(storage: &TableStorage, job_id: &JobId) -> Result<u64> {
    // Config versions are dense from 0; probe upward.
    let mut version = 0;
    while storage.get_job_config(job_id, version + 1).await?.is_some() {
        version += 1;
    }
    Ok(version)
}
