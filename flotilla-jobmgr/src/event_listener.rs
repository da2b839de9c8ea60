// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Consumes the resource manager's task state event stream and mirrors the
//! observed states into the job manager's durable task runtimes.
//!
//! Events for a run other than the runtime's current run are dropped: a
//! superseded attempt can never overwrite its successor. Acks are batched
//! per poll so the stream can purge behind the slowest consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flotilla_api::event::TaskStatusEvent;
use flotilla_api::task::TaskState;
use flotilla_common::time::current_time_ms;
use flotilla_common::Result;
use flotilla_eventstream::EventStream;

use crate::driver::GoalStateDriver;

pub const SUBSCRIBER: &str = "jobmgr";

pub struct EventListener {
    driver: Arc<GoalStateDriver>,
    events: Arc<EventStream<TaskStatusEvent>>,
}

impl EventListener {
    pub fn new(driver: Arc<GoalStateDriver>, events: Arc<EventStream<TaskStatusEvent>>) -> Self {
        Self { driver, events }
    }

    /// Poll, apply, ack — forever.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("task event listener started");
            let mut cursor = 0u64;
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("task event listener stopped");
                        return;
                    }
                    batch = self
                        .events
                        .poll_wait(cursor, 128, Duration::from_millis(500)) => batch,
                };
                for (offset, event) in batch {
                    if let Err(err) = self.apply(&event).await {
                        tracing::warn!(%err, run = %event.run_id, "event not applied");
                    }
                    cursor = cursor.max(offset);
                }
                if let Err(err) = self.events.ack(SUBSCRIBER, cursor) {
                    tracing::warn!(%err, "event ack failed");
                }
            }
        })
    }

    /// Mirror one observed state into the durable task runtime.
    pub async fn apply(&self, event: &TaskStatusEvent) -> Result<()> {
        let task_id = &event.run_id.task_id;
        let Some(runtime) = self.driver.task_runtime(task_id).await? else {
            return Ok(());
        };
        if runtime.run_id != event.run_id {
            tracing::debug!(task = %task_id, "event for stale run dropped");
            return Ok(());
        }
        if runtime.state == event.state {
            return Ok(());
        }

        let mut next = runtime.clone();
        next.state = event.state;
        if !event.reason.is_empty() {
            next.reason = event.reason.clone();
        }
        if !event.message.is_empty() {
            next.message = event.message.clone();
        }
        // A lost run burns a restart attempt the same as a failed one.
        if matches!(event.state, TaskState::Failed | TaskState::Lost) {
            next.failure_count += 1;
        }
        self.driver.write_task_runtime(task_id, &next).await?;

        let timestamp = if event.timestamp_ms > 0 {
            event.timestamp_ms
        } else {
            current_time_ms()
        };
        self.driver
            .cache()
            .add_job(&task_id.job_id)
            .record_task_update(timestamp);

        self.driver.enqueue_task(task_id.clone(), Duration::ZERO);
        self.driver
            .enqueue_job(task_id.job_id.clone(), Duration::ZERO);
        Ok(())
    }
}
