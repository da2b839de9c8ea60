// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Rollout progression.
//!
//! An update moves a job's instances to a target config version in batches
//! of `batch_size`. An instance in the current batch is restarted on the
//! new version; it counts done once its new run is running (or finished),
//! and failed once it burns through `max_instance_attempts` (the retry
//! path records that). Any failed instance fails the whole update.

use std::time::Duration;

use flotilla_api::task::TaskState;
use flotilla_api::update::{UpdateInfo, UpdateState};
use flotilla_common::ids::{TaskId, UpdateId};
use flotilla_common::{FlotillaError, Result};

use crate::driver::GoalStateDriver;

pub async fn process(driver: &GoalStateDriver, update_id: &UpdateId) -> Result<()> {
    let Some(update) = driver.storage().get_update(update_id).await? else {
        return Ok(());
    };

    match update.state {
        UpdateState::Initialized => begin(driver, update).await,
        UpdateState::RollingForward | UpdateState::RollingBackward => {
            progress(driver, update).await
        }
        UpdateState::Paused => Ok(()),
        UpdateState::Aborted | UpdateState::Succeeded | UpdateState::Failed => Ok(()),
    }
}

/// Force an update into a state (pause/resume/abort verbs).
pub async fn set_state(
    driver: &GoalStateDriver,
    update_id: &UpdateId,
    state: UpdateState,
) -> Result<()> {
    let mut update = driver
        .storage()
        .get_update(update_id)
        .await?
        .ok_or_else(|| FlotillaError::Internal(format!("update {update_id} not found")))?;
    if update.state.is_terminal() {
        return Err(FlotillaError::StateConflict(format!(
            "update {update_id} already {state:?}"
        )));
    }
    update.state = state;
    driver.storage().update_update(&update).await?;
    tracing::info!(update = %update_id, ?state, "update state set");
    Ok(())
}

async fn begin(driver: &GoalStateDriver, mut update: UpdateInfo) -> Result<()> {
    update.state = UpdateState::RollingForward;
    let update = driver.storage().update_update(&update).await?;
    tracing::info!(update = %update.id, "rollout started");
    driver.enqueue_update(update.id.clone(), Duration::ZERO);
    Ok(())
}

async fn progress(driver: &GoalStateDriver, mut update: UpdateInfo) -> Result<()> {
    let job_id = update.job_id.clone();

    // Settle the current batch: an instance is done once it runs (or has
    // finished) on the target version.
    let mut still_in_progress = Vec::new();
    for &instance in &update.instances_current {
        let task_id = TaskId::new(job_id.clone(), instance);
        let Some(runtime) = driver.task_runtime(&task_id).await? else {
            continue;
        };
        let on_target = runtime.config_version == update.target_config_version;
        let settled = matches!(runtime.state, TaskState::Running | TaskState::Succeeded);
        if on_target && settled {
            update.instances_done += 1;
        } else {
            still_in_progress.push(instance);
        }
    }
    update.instances_current = still_in_progress;

    if update.instances_failed > 0 {
        update.state = UpdateState::Failed;
        driver.storage().update_update(&update).await?;
        tracing::warn!(update = %update.id, failed = update.instances_failed, "rollout failed");
        driver.enqueue_job(job_id, Duration::ZERO);
        return Ok(());
    }

    if update.instances_done >= update.instances_total && update.instances_current.is_empty() {
        update.state = UpdateState::Succeeded;
        driver.storage().update_update(&update).await?;
        tracing::info!(update = %update.id, "rollout succeeded");
        driver.enqueue_job(job_id, Duration::ZERO);
        return Ok(());
    }

    // Refill the batch with the next instances not yet on the target.
    let batch_size = update.config.batch_size.max(1) as usize;
    let mut restarted = Vec::new();
    if update.instances_current.len() < batch_size {
        let want = batch_size - update.instances_current.len();
        let candidates = next_instances(driver, &update, want).await?;
        for (task_id, runtime) in candidates {
            restart_on_target(driver, &update, &task_id, runtime).await?;
            restarted.push(task_id.instance);
        }
        update.instances_current.extend(restarted.iter().copied());
    }

    let update = driver.storage().update_update(&update).await?;
    driver.enqueue_update(
        update.id.clone(),
        Duration::from_millis(driver.config().update_progress_interval_ms),
    );
    Ok(())
}

/// Instances still on an older config version and not already in flight.
async fn next_instances(
    driver: &GoalStateDriver,
    update: &UpdateInfo,
    want: usize,
) -> Result<Vec<(TaskId, flotilla_api::task::TaskRuntime)>> {
    let mut out = Vec::new();
    for (task_id, runtime) in driver.storage().list_task_runtimes(&update.job_id).await? {
        if out.len() >= want {
            break;
        }
        if update.instances_current.contains(&task_id.instance) {
            continue;
        }
        if runtime.config_version >= update.target_config_version {
            continue;
        }
        out.push((task_id, runtime));
    }
    Ok(out)
}

/// Move one instance to the target version: a live run is stopped through
/// the resource manager, then the instance is re-initialized on the new
/// version with a fresh run id.
async fn restart_on_target(
    driver: &GoalStateDriver,
    update: &UpdateInfo,
    task_id: &TaskId,
    runtime: flotilla_api::task::TaskRuntime,
) -> Result<()> {
    let mut next = runtime.clone();
    next.desired_config_version = update.target_config_version;

    if !runtime.state.is_terminal() && runtime.state != TaskState::Initialized {
        let not_killed = driver.rm().kill_tasks(vec![task_id.clone()]);
        if !not_killed.is_empty() {
            tracing::debug!(task = %task_id, "no live run to stop for update");
        }
    }

    next.prev_run_id = Some(runtime.run_id.clone());
    next.run_id = runtime.run_id.next();
    next.state = TaskState::Initialized;
    next.config_version = update.target_config_version;
    next.failure_count = 0;
    next.host = None;
    driver.write_task_runtime(task_id, &next).await?;
    driver.enqueue_task(task_id.clone(), Duration::ZERO);
    tracing::info!(
        task = %task_id,
        version = update.target_config_version,
        "instance restarting on new version"
    );
    Ok(())
}
