// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-job reconciliation: rolling task-state counts into the job runtime
//! and enforcing the maximum-running-instances SLA.

use std::collections::BTreeMap;
use std::time::Duration;

use flotilla_api::job::{JobRuntime, JobState};
use flotilla_api::task::TaskState;
use flotilla_common::ids::JobId;
use flotilla_common::time::current_time_ms;
use flotilla_common::{FlotillaError, Result};

use crate::driver::GoalStateDriver;
use crate::task_actions;

pub async fn process(driver: &GoalStateDriver, job_id: &JobId) -> Result<()> {
    let runtime = driver.job_runtime(job_id).await?;
    if runtime.state.is_terminal() && runtime.completion_time_ms.is_some() {
        // Fully settled: drop the mirror. The durable record stays.
        driver.cache().remove_job(job_id);
        return Ok(());
    }

    update_job_runtime(driver, job_id).await?;

    let config = driver.job_config(job_id).await?;
    if config.sla.maximum_running_instances > 0 {
        let runtime = driver.job_runtime(job_id).await?;
        if runtime.goal_state != JobState::Killed && !runtime.state.is_terminal() {
            evaluate_max_running_instances(driver, job_id).await?;
        }
    }
    Ok(())
}

/// Roll the task-state summary into the job runtime: state, stats, start
/// and completion times. Writes only when something changed.
pub async fn update_job_runtime(driver: &GoalStateDriver, job_id: &JobId) -> Result<()> {
    let config = driver.job_config(job_id).await?;
    let mut runtime = driver.job_runtime(job_id).await?;
    let stats = driver.storage().task_state_summary(job_id).await?;
    let total: u32 = stats.values().sum();

    if total > config.instance_count {
        return Err(FlotillaError::Internal(format!(
            "job {job_id} has {total} tasks for {} instances",
            config.instance_count
        )));
    }
    if total < config.instance_count && runtime.goal_state != JobState::Killed {
        // Tasks are still being created; try again shortly.
        return Err(FlotillaError::TransientStorage(format!(
            "job {job_id} partially created ({total}/{})",
            config.instance_count
        )));
    }

    let new_state = derive_job_state(&runtime, &stats, config.instance_count);
    let cached = driver.cache().add_job(job_id);

    let mut changed = runtime.state != new_state || runtime.task_stats != stats;

    if runtime.start_time_ms.is_none() {
        let first = cached.first_task_update_ms();
        if first > 0 {
            runtime.start_time_ms = Some(first);
            changed = true;
        }
    }

    if new_state.is_terminal() && runtime.completion_time_ms.is_none() {
        // A job killed before any task ran has no task update time; the
        // completion time must still be set.
        let last = cached.last_task_update_ms();
        runtime.completion_time_ms = Some(if last > 0 { last } else { current_time_ms() });
        changed = true;
    }

    if !changed {
        return Ok(());
    }

    runtime.state = new_state;
    runtime.task_stats = stats;
    driver.write_job_runtime(job_id, &runtime).await?;
    tracing::debug!(job = %job_id, state = %new_state, "job runtime updated");

    if new_state.is_terminal() {
        tracing::info!(job = %job_id, state = %new_state, "job reached terminal state");
    }
    Ok(())
}

/// The job state implied by its task states.
fn derive_job_state(
    runtime: &JobRuntime,
    stats: &BTreeMap<TaskState, u32>,
    instance_count: u32,
) -> JobState {
    let count = |state: TaskState| stats.get(&state).copied().unwrap_or(0);
    let terminal: u32 = stats
        .iter()
        .filter(|(s, _)| s.is_terminal())
        .map(|(_, c)| c)
        .sum();
    let total: u32 = stats.values().sum();

    if runtime.goal_state == JobState::Killed {
        let non_terminal = total - terminal;
        return if non_terminal > 0 {
            JobState::Killing
        } else {
            JobState::Killed
        };
    }

    if terminal == instance_count && total == instance_count {
        return if count(TaskState::Succeeded) == instance_count {
            JobState::Succeeded
        } else if count(TaskState::Failed) > 0 {
            JobState::Failed
        } else if count(TaskState::Killed) > 0 || count(TaskState::Preempted) > 0 {
            JobState::Killed
        } else {
            JobState::Failed
        };
    }

    // Started means some task got past the queues.
    let started: u32 = [
        TaskState::Placing,
        TaskState::Placed,
        TaskState::Launching,
        TaskState::Launched,
        TaskState::Running,
        TaskState::Killing,
        TaskState::Preempting,
    ]
    .iter()
    .map(|&s| count(s))
    .sum();
    if started > 0 {
        JobState::Running
    } else if total == count(TaskState::Initialized) {
        JobState::Initialized
    } else {
        JobState::Pending
    }
}

/// Admit initialized instances up to the running-instance cap.
pub async fn evaluate_max_running_instances(
    driver: &GoalStateDriver,
    job_id: &JobId,
) -> Result<()> {
    let config = driver.job_config(job_id).await?;
    let max = config.sla.maximum_running_instances;
    let stats = driver.storage().task_state_summary(job_id).await?;

    let scheduled: u32 = stats
        .iter()
        .filter(|(s, _)| !s.is_terminal() && **s != TaskState::Initialized)
        .map(|(_, c)| c)
        .sum();
    if scheduled >= max {
        if scheduled > max {
            tracing::warn!(job = %job_id, scheduled, max, "scheduled instances exceed the cap");
        }
        return Ok(());
    }

    let mut headroom = (max - scheduled) as usize;
    let mut batch = Vec::new();
    for instance in driver
        .storage()
        .task_instances_in_state(job_id, TaskState::Initialized)
        .await?
    {
        if headroom == 0 {
            break;
        }
        let task_id = flotilla_common::ids::TaskId::new(job_id.clone(), instance);
        if driver.is_task_scheduled(&task_id) {
            continue;
        }
        let Some(task_runtime) = driver.task_runtime(&task_id).await? else {
            continue;
        };
        if task_runtime.state != TaskState::Initialized {
            continue;
        }
        batch.push((task_id, task_runtime));
        headroom -= 1;
    }

    if !batch.is_empty() {
        tracing::info!(job = %job_id, admitted = batch.len(), "admitting instances under SLA cap");
        task_actions::start_instances(driver, &config, batch).await?;
        driver.enqueue_job(job_id.clone(), Duration::from_millis(100));
    }
    Ok(())
}
