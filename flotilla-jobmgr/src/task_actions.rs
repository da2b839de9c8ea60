// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-task reconciliation: the action chosen from (state, goal state).

use std::time::Duration;

use flotilla_api::gang::Gang;
use flotilla_api::job::JobConfig;
use flotilla_api::task::{RmTaskSpec, TaskRuntime, TaskState};
use flotilla_common::ids::TaskId;
use flotilla_common::{FlotillaError, Result};

use crate::driver::GoalStateDriver;

/// Reason recorded when the preemptor takes a task; a killed task carrying
/// it restarts instead of staying down.
pub const PREEMPTED_REASON: &str = "preempted";

pub async fn process(driver: &GoalStateDriver, task_id: &TaskId) -> Result<()> {
    let Some(runtime) = driver.task_runtime(task_id).await? else {
        // Untracked: nothing to reconcile.
        return Ok(());
    };

    if runtime.goal_state == TaskState::Killed {
        return stop(driver, task_id, runtime).await;
    }

    match runtime.state {
        TaskState::Initialized => start(driver, task_id, runtime).await,
        TaskState::Failed | TaskState::Lost | TaskState::Preempted => {
            terminated_retry(driver, task_id, runtime).await
        }
        TaskState::Killed if runtime.reason == PREEMPTED_REASON => {
            terminated_retry(driver, task_id, runtime).await
        }
        TaskState::Succeeded | TaskState::Killed => {
            driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
            Ok(())
        }
        // In-flight states move on resource-manager events, not here.
        _ => Ok(()),
    }
}

/// Admit a task to the resource manager and persist the `Pending` state.
async fn start(driver: &GoalStateDriver, task_id: &TaskId, runtime: TaskRuntime) -> Result<()> {
    let config = driver.job_config(&task_id.job_id).await?;

    // Jobs with a running-instance cap are admitted by the job-level SLA
    // pass, not one task at a time.
    if config.sla.maximum_running_instances > 0 {
        driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
        return Ok(());
    }

    start_instances(driver, &config, vec![(task_id.clone(), runtime)]).await?;
    driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
    Ok(())
}

/// Enqueue a batch of initialized instances to the resource manager, one
/// single-task gang each, and persist their `Pending` states.
pub async fn start_instances(
    driver: &GoalStateDriver,
    config: &JobConfig,
    instances: Vec<(TaskId, TaskRuntime)>,
) -> Result<()> {
    if instances.is_empty() {
        return Ok(());
    }
    let mut gangs = Vec::with_capacity(instances.len());
    for (task_id, runtime) in &instances {
        // An updated instance runs the config of its own version.
        let versioned;
        let effective = if runtime.config_version == 0 {
            config
        } else {
            versioned = driver
                .storage()
                .get_job_config(&task_id.job_id, runtime.config_version)
                .await?;
            versioned.as_ref().unwrap_or(config)
        };
        let task_config = effective.task_config(task_id.instance);
        let mut spec = RmTaskSpec::new(task_id.clone(), runtime.run_id.run, task_config);
        spec.preemptible = task_config.preemptible && config.sla.preemptible;
        gangs.push(Gang::of_task(spec));
    }

    let failed = driver.rm().enqueue_gangs(&config.pool_id, gangs)?;
    if !failed.is_empty() {
        return Err(FlotillaError::Internal(format!(
            "{} tasks rejected by resource manager: {}",
            failed.len(),
            failed[0].message
        )));
    }

    for (task_id, runtime) in instances {
        let mut next = runtime;
        next.state = TaskState::Pending;
        driver.write_task_runtime(&task_id, &next).await?;
    }
    Ok(())
}

/// Stop a task: never-started instances are killed directly in storage,
/// anything live goes through the resource manager first.
async fn stop(driver: &GoalStateDriver, task_id: &TaskId, runtime: TaskRuntime) -> Result<()> {
    match runtime.state {
        s if s.is_terminal() => {
            driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
            Ok(())
        }
        TaskState::Initialized => {
            let mut next = runtime;
            next.state = TaskState::Killed;
            driver.write_task_runtime(task_id, &next).await?;
            driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
            Ok(())
        }
        TaskState::Killing => Ok(()),
        _ => {
            let not_killed = driver.rm().kill_tasks(vec![task_id.clone()]);
            if !not_killed.is_empty() {
                // The tracker no longer knows the task; its terminal event
                // either already arrived or never will. Finish in storage.
                let mut next = runtime;
                next.state = TaskState::Killed;
                driver.write_task_runtime(task_id, &next).await?;
                driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
                return Ok(());
            }
            let mut next = runtime;
            next.state = TaskState::Killing;
            driver.write_task_runtime(task_id, &next).await?;
            Ok(())
        }
    }
}

/// Retry policy for a terminated task: the restart budget comes from the
/// active update when the instance is part of its in-progress batch,
/// otherwise from the task's restart policy. A retry gets a fresh run id
/// chained to the previous one.
async fn terminated_retry(
    driver: &GoalStateDriver,
    task_id: &TaskId,
    runtime: TaskRuntime,
) -> Result<()> {
    let job_runtime = driver.job_runtime(&task_id.job_id).await?;
    let config = driver.job_config(&task_id.job_id).await?;
    let task_config = config.task_config(task_id.instance);

    let mut in_update_batch = false;
    let mut update_budget = 0;
    let mut active_update = None;
    if let Some(update_id) = &job_runtime.update_id {
        if let Some(update) = driver.storage().get_update(update_id).await? {
            if update.state.is_active() && update.is_instance_in_progress(task_id.instance) {
                in_update_batch = true;
                update_budget = update.config.max_instance_attempts;
                active_update = Some(update);
            }
        }
    }

    let budget = if in_update_batch {
        update_budget
    } else {
        task_config.restart_policy.max_failures
    };

    // Preemption is not the task's failure; it always restarts.
    let preempted =
        runtime.state == TaskState::Preempted || runtime.reason == PREEMPTED_REASON;

    // A budget of N failures allows N retries; the N+1th failure stops.
    if !preempted && runtime.failure_count > budget {
        if let Some(mut update) = active_update {
            update.instances_current.retain(|&i| i != task_id.instance);
            update.instances_failed += 1;
            driver.storage().update_update(&update).await?;
            driver.enqueue_update(update.id, Duration::ZERO);
            tracing::warn!(task = %task_id, "instance failed its update attempt budget");
        } else {
            tracing::info!(
                task = %task_id,
                failures = runtime.failure_count,
                "restart budget exhausted, not retrying"
            );
        }
        driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
        return Ok(());
    }

    let mut next = runtime.clone();
    next.prev_run_id = Some(runtime.run_id.clone());
    next.run_id = runtime.run_id.next();
    next.state = TaskState::Initialized;
    next.host = None;
    next.reason = String::new();
    next.message = String::new();
    driver.write_task_runtime(task_id, &next).await?;

    let delay = retry_backoff(driver, runtime.failure_count, task_config.restart_policy.backoff_ms);
    tracing::info!(task = %task_id, run = next.run_id.run, ?delay, "retrying terminated task");
    driver.enqueue_task(task_id.clone(), delay);
    driver.enqueue_job(task_id.job_id.clone(), Duration::ZERO);
    Ok(())
}

fn retry_backoff(driver: &GoalStateDriver, failures: u32, base_ms: u64) -> Duration {
    let base = if base_ms > 0 {
        base_ms
    } else {
        driver.config().initial_task_backoff_ms
    };
    let exp = base.saturating_mul(1u64 << failures.min(16));
    Duration::from_millis(exp.min(driver.config().max_task_backoff_ms))
}
