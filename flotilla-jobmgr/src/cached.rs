// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cached job and task mirrors.
//!
//! Best-effort views of what the store holds, kept to avoid a storage read
//! per reconciliation pass. The persisted runtime is ground truth: a mirror
//! ignores writes older than what it holds and is invalidated outright on a
//! revision conflict from the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use flotilla_api::job::{JobConfig, JobRuntime};
use flotilla_api::task::TaskRuntime;
use flotilla_common::ids::JobId;

#[derive(Default)]
pub struct CachedTask {
    runtime: RwLock<Option<TaskRuntime>>,
}

impl CachedTask {
    pub fn runtime(&self) -> Option<TaskRuntime> {
        self.runtime.read().clone()
    }

    /// Accept a newer runtime; an older revision is ignored.
    pub fn update_runtime(&self, runtime: TaskRuntime) {
        let mut slot = self.runtime.write();
        if let Some(existing) = slot.as_ref() {
            if runtime.revision < existing.revision {
                return;
            }
        }
        *slot = Some(runtime);
    }

    pub fn invalidate(&self) {
        *self.runtime.write() = None;
    }
}

pub struct CachedJob {
    config: RwLock<Option<JobConfig>>,
    runtime: RwLock<Option<JobRuntime>>,
    tasks: DashMap<u32, Arc<CachedTask>>,
    /// Millisecond timestamps of the first and latest task state change
    /// observed for this job; zero means never.
    first_task_update_ms: AtomicU64,
    last_task_update_ms: AtomicU64,
}

impl CachedJob {
    fn new() -> Self {
        Self {
            config: RwLock::new(None),
            runtime: RwLock::new(None),
            tasks: DashMap::new(),
            first_task_update_ms: AtomicU64::new(0),
            last_task_update_ms: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> Option<JobConfig> {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: JobConfig) {
        *self.config.write() = Some(config);
    }

    pub fn runtime(&self) -> Option<JobRuntime> {
        self.runtime.read().clone()
    }

    pub fn update_runtime(&self, runtime: JobRuntime) {
        let mut slot = self.runtime.write();
        if let Some(existing) = slot.as_ref() {
            if runtime.revision < existing.revision {
                return;
            }
        }
        *slot = Some(runtime);
    }

    pub fn invalidate_runtime(&self) {
        *self.runtime.write() = None;
    }

    pub fn task(&self, instance: u32) -> Arc<CachedTask> {
        self.tasks.entry(instance).or_default().clone()
    }

    pub fn record_task_update(&self, timestamp_ms: u64) {
        let _ = self.first_task_update_ms.compare_exchange(
            0,
            timestamp_ms,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.last_task_update_ms.fetch_max(timestamp_ms, Ordering::AcqRel);
    }

    pub fn first_task_update_ms(&self) -> u64 {
        self.first_task_update_ms.load(Ordering::Acquire)
    }

    pub fn last_task_update_ms(&self) -> u64 {
        self.last_task_update_ms.load(Ordering::Acquire)
    }
}

impl Default for CachedJob {
    fn default() -> Self {
        Self::new()
    }
}

/// The concurrent map of cached jobs.
#[derive(Default)]
pub struct JobCache {
    jobs: DashMap<JobId, Arc<CachedJob>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the mirror for a job.
    pub fn add_job(&self, job_id: &JobId) -> Arc<CachedJob> {
        self.jobs.entry(job_id.clone()).or_default().clone()
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<Arc<CachedJob>> {
        self.jobs.get(job_id).map(|e| e.value().clone())
    }

    pub fn remove_job(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_api::task::TaskState;
    use flotilla_common::ids::TaskId;

    #[test]
    fn test_task_mirror_ignores_older_revision() {
        let cached = CachedTask::default();
        let task_id = TaskId::new(JobId::from("j"), 0);
        let mut newer = TaskRuntime::initial(task_id.clone(), TaskState::Succeeded);
        newer.revision = 5;
        newer.state = TaskState::Running;
        cached.update_runtime(newer.clone());

        let mut older = TaskRuntime::initial(task_id, TaskState::Succeeded);
        older.revision = 3;
        cached.update_runtime(older);

        assert_eq!(cached.runtime().unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_invalidate_clears_mirror() {
        let cached = CachedTask::default();
        let runtime =
            TaskRuntime::initial(TaskId::new(JobId::from("j"), 0), TaskState::Succeeded);
        cached.update_runtime(runtime);
        assert!(cached.runtime().is_some());
        cached.invalidate();
        assert!(cached.runtime().is_none());
    }

    #[test]
    fn test_first_update_sticks_last_advances() {
        let job = CachedJob::new();
        assert_eq!(job.first_task_update_ms(), 0);
        job.record_task_update(100);
        job.record_task_update(50);
        job.record_task_update(200);
        assert_eq!(job.first_task_update_ms(), 100);
        assert_eq!(job.last_task_update_ms(), 200);
    }

    #[test]
    fn test_cache_shares_entries() {
        let cache = JobCache::new();
        let a = cache.add_job(&JobId::from("j"));
        let b = cache.add_job(&JobId::from("j"));
        assert!(Arc::ptr_eq(&a, &b));
        cache.remove_job(&JobId::from("j"));
        assert!(cache.get_job(&JobId::from("j")).is_none());
    }
}
