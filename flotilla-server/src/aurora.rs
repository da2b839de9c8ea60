// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Aurora-compatible verb surface.
//!
//! Thin translation only: each legacy verb maps onto job manager or
//! resource manager operations. Wire encoding and transport live outside
//! the core.

use std::sync::Arc;
use std::time::Duration;

use flotilla_api::job::{JobConfig, JobRuntime, JobState};
use flotilla_api::task::{TaskRuntime, TaskState};
use flotilla_api::update::UpdateConfig;
use flotilla_common::ids::{JobId, TaskId, UpdateId};
use flotilla_common::{FlotillaError, Result};
use flotilla_jobmgr::GoalStateDriver;

pub struct AuroraBridge {
    driver: Arc<GoalStateDriver>,
}

impl AuroraBridge {
    pub fn new(driver: Arc<GoalStateDriver>) -> Self {
        Self { driver }
    }

    /// `createJob`.
    pub async fn create_job(&self, config: JobConfig) -> Result<JobId> {
        self.driver.create_job(config, JobState::Succeeded).await
    }

    /// `scheduleCronJob` — the cron trigger itself lives outside the core;
    /// the job body is admitted like any other.
    pub async fn schedule_cron_job(&self, config: JobConfig, schedule: &str) -> Result<JobId> {
        tracing::info!(%schedule, "cron schedule recorded by the caller, admitting job body");
        self.create_job(config).await
    }

    /// `getJobs`.
    pub async fn get_jobs(&self) -> Result<Vec<(JobId, JobRuntime)>> {
        let mut out = Vec::new();
        for job_id in self.driver.storage().list_jobs().await? {
            if let Some(runtime) = self.driver.storage().get_job_runtime(&job_id).await? {
                out.push((job_id, runtime));
            }
        }
        Ok(out)
    }

    /// `getTasksWithoutConfigs`.
    pub async fn get_tasks_without_configs(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<(TaskId, TaskRuntime)>> {
        Ok(self.driver.storage().list_task_runtimes(job_id).await?)
    }

    /// `startJobUpdate`.
    pub async fn start_job_update(
        &self,
        job_id: &JobId,
        new_config: JobConfig,
        update_config: UpdateConfig,
    ) -> Result<UpdateId> {
        self.driver
            .create_update(job_id, new_config, update_config)
            .await
    }

    /// `pauseJobUpdate`.
    pub async fn pause_job_update(&self, update_id: &UpdateId) -> Result<()> {
        self.driver.pause_update(update_id).await
    }

    /// `abortJobUpdate`.
    pub async fn abort_job_update(&self, update_id: &UpdateId) -> Result<()> {
        self.driver.abort_update(update_id).await
    }

    /// `killTasks`: whole job, or selected instances.
    pub async fn kill_tasks(&self, job_id: &JobId, instances: Option<&[u32]>) -> Result<()> {
        match instances {
            None => self.driver.kill_job(job_id).await,
            Some(instances) => {
                for &instance in instances {
                    let task_id = TaskId::new(job_id.clone(), instance);
                    let Some(mut runtime) = self.driver.task_runtime(&task_id).await? else {
                        return Err(FlotillaError::InvalidConfig(format!(
                            "unknown instance {instance} of job {job_id}"
                        )));
                    };
                    if runtime.goal_state != TaskState::Killed {
                        runtime.goal_state = TaskState::Killed;
                        self.driver.write_task_runtime(&task_id, &runtime).await?;
                    }
                    self.driver.enqueue_task(task_id, Duration::ZERO);
                }
                self.driver.enqueue_job(job_id.clone(), Duration::ZERO);
                Ok(())
            }
        }
    }

    /// `restartShards`: give each named instance a fresh run.
    pub async fn restart_shards(&self, job_id: &JobId, instances: &[u32]) -> Result<()> {
        for &instance in instances {
            let task_id = TaskId::new(job_id.clone(), instance);
            let Some(runtime) = self.driver.task_runtime(&task_id).await? else {
                return Err(FlotillaError::InvalidConfig(format!(
                    "unknown instance {instance} of job {job_id}"
                )));
            };
            if !runtime.state.is_terminal() && runtime.state != TaskState::Initialized {
                // Stop the live run; the kill event lands before the new
                // run starts.
                let _ = self.driver.rm().kill_tasks(vec![task_id.clone()]);
            }
            let mut next = runtime.clone();
            next.prev_run_id = Some(runtime.run_id.clone());
            next.run_id = runtime.run_id.next();
            next.state = TaskState::Initialized;
            next.host = None;
            self.driver.write_task_runtime(&task_id, &next).await?;
            self.driver.enqueue_task(task_id, Duration::ZERO);
        }
        self.driver.enqueue_job(job_id.clone(), Duration::ZERO);
        Ok(())
    }
}
