// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Goal-state behavior: job runtime derivation, terminated-task retry,
//! SLA admission, and rollout progression, driven action by action.

use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla_api::event::TaskStatusEvent;
use flotilla_api::job::{JobConfig, JobState, SlaConfig};
use flotilla_api::pool::{equal_share, ResourcePoolConfig, SchedulingPolicy};
use flotilla_api::task::{RestartPolicy, TaskConfig, TaskState, TaskType};
use flotilla_api::update::UpdateConfig;
use flotilla_common::ids::{JobId, PoolId, TaskId};
use flotilla_common::resources::ResourceVector;
use flotilla_eventstream::EventStream;
use flotilla_jobmgr::driver::GoalStateDriverConfig;
use flotilla_jobmgr::event_listener::{EventListener, SUBSCRIBER};
use flotilla_jobmgr::{job_actions, task_actions, update_actions, GoalStateDriver};
use flotilla_resmgr::rmtask::RmTaskConfig;
use flotilla_resmgr::scheduler::{Scheduler, SchedulerConfig};
use flotilla_resmgr::{ServiceHandler, Tracker, Tree};
use flotilla_storage::{InMemoryStore, TableStorage};

fn capacity() -> ResourceVector {
    ResourceVector::new(100.0, 10000.0, 1000.0, 8.0)
}

fn pool_config(name: &str, parent: Option<&str>) -> ResourcePoolConfig {
    ResourcePoolConfig {
        name: name.into(),
        parent: parent.map(PoolId::from),
        reservation: if parent.is_none() {
            capacity()
        } else {
            ResourceVector::ZERO
        },
        limit: capacity(),
        share: equal_share(),
        policy: SchedulingPolicy::PriorityFifo,
    }
}

struct Fixture {
    driver: Arc<GoalStateDriver>,
    handler: Arc<ServiceHandler>,
    listener: EventListener,
    storage: TableStorage,
}

fn fixture() -> Fixture {
    let tree = Tree::new(pool_config("root", None)).unwrap();
    tree.add_pool(PoolId::from("pool1"), pool_config("pool1", Some("root")))
        .unwrap();
    let events = Arc::new(EventStream::<TaskStatusEvent>::new(4096, &[SUBSCRIBER]));
    let tracker = Tracker::new(tree.clone(), events.clone(), RmTaskConfig::default());
    let scheduler = Scheduler::new(tree.clone(), tracker.clone(), SchedulerConfig::default());
    scheduler.set_cluster_capacity(capacity());
    let handler = ServiceHandler::new(tree, tracker, scheduler);
    let storage = TableStorage::new(Arc::new(InMemoryStore::new()));
    let driver = GoalStateDriver::new(
        storage.clone(),
        handler.clone(),
        GoalStateDriverConfig::default(),
    );
    let listener = EventListener::new(driver.clone(), events);
    Fixture {
        driver,
        handler,
        listener,
        storage,
    }
}

fn job_config(instances: u32, max_failures: u32) -> JobConfig {
    JobConfig {
        name: "test-job".into(),
        job_type: TaskType::Batch,
        pool_id: PoolId::from("pool1"),
        instance_count: instances,
        default_task: TaskConfig {
            name: "task".into(),
            resource: ResourceVector::new(1.0, 100.0, 0.0, 0.0),
            task_type: TaskType::Batch,
            priority: 1,
            preemptible: true,
            restart_policy: RestartPolicy {
                max_failures,
                backoff_ms: 1,
            },
        },
        instance_overrides: BTreeMap::new(),
        sla: SlaConfig::default(),
    }
}

/// Put a job's task runtimes into the given states, bypassing the engines.
async fn force_task_states(fx: &Fixture, job_id: &JobId, states: &[TaskState]) {
    for (instance, &state) in states.iter().enumerate() {
        let task_id = TaskId::new(job_id.clone(), instance as u32);
        let mut runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
        runtime.state = state;
        fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
        fx.driver
            .cache()
            .add_job(job_id)
            .task(task_id.instance)
            .invalidate();
    }
}

#[tokio::test]
async fn test_job_state_running_while_any_task_runs() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(4, 0), JobState::Succeeded)
        .await
        .unwrap();
    force_task_states(
        &fx,
        &job_id,
        &[
            TaskState::Pending,
            TaskState::Running,
            TaskState::Launched,
            TaskState::Succeeded,
        ],
    )
    .await;

    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();

    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Running);
    assert_eq!(runtime.task_stats.get(&TaskState::Running), Some(&1));
    assert_eq!(runtime.task_stats.get(&TaskState::Succeeded), Some(&1));
}

#[tokio::test]
async fn test_job_state_pending_before_any_start() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 0), JobState::Succeeded)
        .await
        .unwrap();
    force_task_states(&fx, &job_id, &[TaskState::Pending, TaskState::Succeeded]).await;

    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();

    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Pending);
}

#[tokio::test]
async fn test_job_succeeds_when_all_tasks_succeed() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(3, 0), JobState::Succeeded)
        .await
        .unwrap();
    fx.driver.cache().add_job(&job_id).record_task_update(12345);
    force_task_states(
        &fx,
        &job_id,
        &[TaskState::Succeeded, TaskState::Succeeded, TaskState::Succeeded],
    )
    .await;

    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();

    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Succeeded);
    assert_eq!(runtime.task_stats.get(&TaskState::Succeeded), Some(&3));
    assert_eq!(runtime.start_time_ms, Some(12345));
    assert_eq!(runtime.completion_time_ms, Some(12345));
}

#[tokio::test]
async fn test_job_fails_when_any_task_fails() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 0), JobState::Succeeded)
        .await
        .unwrap();
    force_task_states(&fx, &job_id, &[TaskState::Failed, TaskState::Succeeded]).await;

    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();

    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Failed);
    assert!(runtime.completion_time_ms.is_some());
}

#[tokio::test]
async fn test_job_goal_killed_progresses_killing_to_killed() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 0), JobState::Succeeded)
        .await
        .unwrap();
    fx.driver.kill_job(&job_id).await.unwrap();

    force_task_states(&fx, &job_id, &[TaskState::Killing, TaskState::Killed]).await;
    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();
    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Killing);
    assert!(runtime.completion_time_ms.is_none());

    force_task_states(&fx, &job_id, &[TaskState::Killed, TaskState::Killed]).await;
    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();
    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Killed);
    assert!(runtime.completion_time_ms.is_some());
}

#[tokio::test]
async fn test_killed_before_start_has_completion_time() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 0), JobState::Killed)
        .await
        .unwrap();

    // Stop actions kill never-started instances straight in storage.
    for instance in 0..2 {
        task_actions::process(&fx.driver, &TaskId::new(job_id.clone(), instance))
            .await
            .unwrap();
    }
    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();

    let runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, JobState::Killed);
    // No task ever produced an update; completion falls back to wall clock.
    assert!(runtime.completion_time_ms.is_some());
    assert!(runtime.completion_time_ms.unwrap() > 0);
}

#[tokio::test]
async fn test_terminated_retry_until_budget() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(1, 2), JobState::Succeeded)
        .await
        .unwrap();
    let task_id = TaskId::new(job_id.clone(), 0);

    // First failure: retried with a fresh run chained to the old one.
    let mut runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    runtime.state = TaskState::Failed;
    runtime.failure_count = 1;
    fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
    fx.driver.cache().add_job(&job_id).task(0).invalidate();

    task_actions::process(&fx.driver, &task_id).await.unwrap();
    let retried = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(retried.state, TaskState::Initialized);
    assert_eq!(retried.run_id.run, 2);
    assert_eq!(retried.prev_run_id.as_ref().unwrap().run, 1);

    // Third failure exceeds max_failures = 2: no further retry.
    let mut runtime = retried;
    runtime.state = TaskState::Failed;
    runtime.failure_count = 3;
    fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
    fx.driver.cache().add_job(&job_id).task(0).invalidate();

    task_actions::process(&fx.driver, &task_id).await.unwrap();
    let stopped = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(stopped.state, TaskState::Failed);
    assert_eq!(stopped.run_id.run, 2, "no new run past the budget");
    assert_eq!(stopped.failure_count, 3);

    // And the job runtime lands on FAILED for goal SUCCEEDED.
    job_actions::update_job_runtime(&fx.driver, &job_id).await.unwrap();
    let job_runtime = fx.storage.get_job_runtime(&job_id).await.unwrap().unwrap();
    assert_eq!(job_runtime.state, JobState::Failed);
}

#[tokio::test]
async fn test_failure_count_increments_via_events() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(1, 5), JobState::Succeeded)
        .await
        .unwrap();
    let task_id = TaskId::new(job_id.clone(), 0);
    let runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();

    let event = TaskStatusEvent {
        offset: 1,
        run_id: runtime.run_id.clone(),
        state: TaskState::Failed,
        reason: "exit 1".into(),
        message: "boom".into(),
        timestamp_ms: 777,
    };
    fx.listener.apply(&event).await.unwrap();

    let updated = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.state, TaskState::Failed);
    assert_eq!(updated.failure_count, 1);
    assert_eq!(updated.reason, "exit 1");
    assert_eq!(
        fx.driver.cache().add_job(&job_id).last_task_update_ms(),
        777
    );

    // A stale-run event changes nothing.
    let stale = TaskStatusEvent {
        offset: 2,
        run_id: flotilla_common::ids::RunId {
            task_id: task_id.clone(),
            run: 99,
        },
        state: TaskState::Succeeded,
        reason: String::new(),
        message: String::new(),
        timestamp_ms: 0,
    };
    fx.listener.apply(&stale).await.unwrap();
    let unchanged = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(unchanged.state, TaskState::Failed);
}

#[tokio::test]
async fn test_lost_run_consumes_restart_budget() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(1, 1), JobState::Succeeded)
        .await
        .unwrap();
    let task_id = TaskId::new(job_id.clone(), 0);

    // First run is lost to a missed heartbeat: one attempt burned, retried.
    let runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    let lost = TaskStatusEvent {
        offset: 1,
        run_id: runtime.run_id.clone(),
        state: TaskState::Lost,
        reason: String::new(),
        message: String::new(),
        timestamp_ms: 0,
    };
    fx.listener.apply(&lost).await.unwrap();
    let updated = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.state, TaskState::Lost);
    assert_eq!(updated.failure_count, 1);

    task_actions::process(&fx.driver, &task_id).await.unwrap();
    let retried = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(retried.state, TaskState::Initialized);
    assert_eq!(retried.run_id.run, 2);

    // The second lost run exceeds max_failures = 1: no further retry.
    let lost = TaskStatusEvent {
        offset: 2,
        run_id: retried.run_id.clone(),
        state: TaskState::Lost,
        reason: String::new(),
        message: String::new(),
        timestamp_ms: 0,
    };
    fx.listener.apply(&lost).await.unwrap();
    task_actions::process(&fx.driver, &task_id).await.unwrap();

    let stopped = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(stopped.state, TaskState::Lost);
    assert_eq!(stopped.failure_count, 2);
    assert_eq!(stopped.run_id.run, 2, "no new run past the budget");
}

#[tokio::test]
async fn test_sla_caps_admitted_instances() {
    let fx = fixture();
    let mut config = job_config(10, 0);
    config.sla = SlaConfig {
        maximum_running_instances: 3,
        preemptible: false,
    };
    let job_id = fx
        .driver
        .create_job(config, JobState::Succeeded)
        .await
        .unwrap();

    job_actions::evaluate_max_running_instances(&fx.driver, &job_id)
        .await
        .unwrap();

    let mut pending = 0;
    let mut initialized = 0;
    for (_, runtime) in fx.storage.list_task_runtimes(&job_id).await.unwrap() {
        match runtime.state {
            TaskState::Pending => pending += 1,
            TaskState::Initialized => initialized += 1,
            other => panic!("unexpected state {other}"),
        }
    }
    assert_eq!(pending, 3);
    assert_eq!(initialized, 7);

    // Re-evaluating with the cap full admits nothing more.
    job_actions::evaluate_max_running_instances(&fx.driver, &job_id)
        .await
        .unwrap();
    let still_pending = fx
        .storage
        .task_state_summary(&job_id)
        .await
        .unwrap()
        .get(&TaskState::Pending)
        .copied()
        .unwrap();
    assert_eq!(still_pending, 3);
}

#[tokio::test]
async fn test_start_pushes_task_to_resource_manager() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(1, 0), JobState::Succeeded)
        .await
        .unwrap();
    let task_id = TaskId::new(job_id.clone(), 0);

    task_actions::process(&fx.driver, &task_id).await.unwrap();

    let runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    assert_eq!(runtime.state, TaskState::Pending);
    let rm_task = fx.handler.tracker().get_task(&task_id).unwrap();
    assert_eq!(rm_task.current_state(), TaskState::Pending);
}

#[tokio::test]
async fn test_update_rolls_instances_in_batches() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(4, 0), JobState::Succeeded)
        .await
        .unwrap();
    // All instances running on version 0.
    force_task_states(
        &fx,
        &job_id,
        &[
            TaskState::Running,
            TaskState::Running,
            TaskState::Running,
            TaskState::Running,
        ],
    )
    .await;

    let mut new_config = job_config(4, 0);
    new_config.default_task.resource = ResourceVector::new(2.0, 100.0, 0.0, 0.0);
    let update_id = fx
        .driver
        .create_update(
            &job_id,
            new_config,
            UpdateConfig {
                batch_size: 2,
                max_instance_attempts: 3,
            },
        )
        .await
        .unwrap();

    // Begin, then fill the first batch.
    update_actions::process(&fx.driver, &update_id).await.unwrap();
    update_actions::process(&fx.driver, &update_id).await.unwrap();

    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.instances_current.len(), 2);
    assert_eq!(update.instances_done, 0);

    // The batch instances restarted on the new version.
    for &instance in &update.instances_current {
        let runtime = fx
            .storage
            .get_task_runtime(&TaskId::new(job_id.clone(), instance))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.state, TaskState::Initialized);
        assert_eq!(runtime.config_version, update.target_config_version);
        assert_eq!(runtime.run_id.run, 2);
    }

    // Those instances come up running on the target; the batch settles and
    // the next one fills.
    let current = update.instances_current.clone();
    for &instance in &current {
        let task_id = TaskId::new(job_id.clone(), instance);
        let mut runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
        runtime.state = TaskState::Running;
        fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
        fx.driver.cache().add_job(&job_id).task(instance).invalidate();
    }
    update_actions::process(&fx.driver, &update_id).await.unwrap();

    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.instances_done, 2);
    assert_eq!(update.instances_current.len(), 2);
    let second_batch = update.instances_current.clone();
    assert!(second_batch.iter().all(|i| !current.contains(i)));

    // Settle the second batch; the rollout completes.
    for &instance in &second_batch {
        let task_id = TaskId::new(job_id.clone(), instance);
        let mut runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
        runtime.state = TaskState::Running;
        fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
        fx.driver.cache().add_job(&job_id).task(instance).invalidate();
    }
    update_actions::process(&fx.driver, &update_id).await.unwrap();
    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.state, flotilla_api::update::UpdateState::Succeeded);
    assert_eq!(update.instances_done, 4);
}

#[tokio::test]
async fn test_update_instance_budget_marks_failure() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 9), JobState::Succeeded)
        .await
        .unwrap();

    let update_id = fx
        .driver
        .create_update(
            &job_id,
            job_config(2, 9),
            UpdateConfig {
                batch_size: 1,
                max_instance_attempts: 2,
            },
        )
        .await
        .unwrap();
    update_actions::process(&fx.driver, &update_id).await.unwrap();
    update_actions::process(&fx.driver, &update_id).await.unwrap();

    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    let instance = update.instances_current[0];
    let task_id = TaskId::new(job_id.clone(), instance);

    // The instance keeps failing past its per-instance attempt budget.
    let mut runtime = fx.storage.get_task_runtime(&task_id).await.unwrap().unwrap();
    runtime.state = TaskState::Failed;
    runtime.failure_count = 3;
    fx.storage.update_task_runtime(&task_id, &runtime).await.unwrap();
    fx.driver.cache().add_job(&job_id).task(instance).invalidate();

    task_actions::process(&fx.driver, &task_id).await.unwrap();

    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.instances_failed, 1);
    assert!(!update.instances_current.contains(&instance));

    // The next progression pass fails the rollout.
    update_actions::process(&fx.driver, &update_id).await.unwrap();
    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.state, flotilla_api::update::UpdateState::Failed);
}

#[tokio::test]
async fn test_pause_and_abort_update() {
    let fx = fixture();
    let job_id = fx
        .driver
        .create_job(job_config(2, 0), JobState::Succeeded)
        .await
        .unwrap();
    let update_id = fx
        .driver
        .create_update(&job_id, job_config(2, 0), UpdateConfig::default())
        .await
        .unwrap();

    fx.driver.pause_update(&update_id).await.unwrap();
    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.state, flotilla_api::update::UpdateState::Paused);

    // Paused updates do not progress.
    update_actions::process(&fx.driver, &update_id).await.unwrap();
    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert!(update.instances_current.is_empty());

    fx.driver.abort_update(&update_id).await.unwrap();
    let update = fx.storage.get_update(&update_id).await.unwrap().unwrap();
    assert_eq!(update.state, flotilla_api::update::UpdateState::Aborted);

    // Terminal updates reject further verbs.
    assert!(fx.driver.pause_update(&update_id).await.is_err());
}
