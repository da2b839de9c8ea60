// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Drains the resource manager's preemption queue.
//!
//! For each RUNNING victim the preemptor selected, the listener stamps the
//! preemption reason on the task runtime and issues the kill. The terminal
//! event then flows back through the regular event path, where the reason
//! routes the task into a restart instead of a permanent stop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flotilla_common::Result;
use flotilla_resmgr::preemption::Preemptor;

use crate::driver::GoalStateDriver;
use crate::task_actions::PREEMPTED_REASON;

pub struct PreemptionListener {
    driver: Arc<GoalStateDriver>,
    preemptor: Arc<Preemptor>,
}

impl PreemptionListener {
    pub fn new(driver: Arc<GoalStateDriver>, preemptor: Arc<Preemptor>) -> Self {
        Self { driver, preemptor }
    }

    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("preemption listener started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("preemption listener stopped");
                        return;
                    }
                    victim = self.preemptor.dequeue_task(Duration::from_millis(500)) => {
                        let Ok(victim) = victim else { continue };
                        if let Err(err) = self.preempt(&victim.task_id).await {
                            tracing::warn!(task = %victim.task_id, %err, "preemption failed");
                        }
                    }
                }
            }
        })
    }

    /// Stamp the reason, then kill with grace through the resource manager.
    pub async fn preempt(&self, task_id: &flotilla_common::ids::TaskId) -> Result<()> {
        if let Some(mut runtime) = self.driver.task_runtime(task_id).await? {
            runtime.reason = PREEMPTED_REASON.to_string();
            self.driver.write_task_runtime(task_id, &runtime).await?;
        }
        let not_killed = self.driver.rm().kill_tasks(vec![task_id.clone()]);
        if !not_killed.is_empty() {
            tracing::debug!(task = %task_id, "victim already gone before kill");
        }
        Ok(())
    }
}
