// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The generic reconciling engine.
//!
//! Entities are enqueued with a not-before deadline; workers pop due
//! entries and hand them to the processor. A processing error re-enqueues
//! the entity with exponential backoff plus jitter; success resets the
//! attempt counter. Enqueues deduplicate by entity key, keeping the
//! earliest deadline, so a hot entity is processed once per wakeup no
//! matter how many times it was poked.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flotilla_common::Result;

/// Anything the engine can reconcile.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Stable dedup key.
    fn key(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

struct QueueItem<E> {
    deadline: Instant,
    entity: E,
}

impl<E> PartialEq for QueueItem<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl<E> Eq for QueueItem<E> {}
impl<E> PartialOrd for QueueItem<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<E> Ord for QueueItem<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

struct Inner<E> {
    heap: BinaryHeap<Reverse<QueueItem<E>>>,
    /// Key → effective deadline. Heap entries not matching are stale.
    scheduled: HashMap<String, Instant>,
    attempts: HashMap<String, u32>,
}

pub struct Engine<E: Entity> {
    inner: Mutex<Inner<E>>,
    notify: Notify,
    config: EngineConfig,
}

impl<E: Entity> Engine<E> {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                scheduled: HashMap::new(),
                attempts: HashMap::new(),
            }),
            notify: Notify::new(),
            config,
        })
    }

    /// Schedule an entity to run after `delay`. An entity already queued
    /// keeps whichever deadline is earlier.
    pub fn enqueue(&self, entity: E, delay: Duration) {
        let deadline = Instant::now() + delay;
        let key = entity.key();
        {
            let mut inner = self.inner.lock();
            match inner.scheduled.get(&key) {
                Some(&existing) if existing <= deadline => return,
                _ => {}
            }
            inner.scheduled.insert(key, deadline);
            inner.heap.push(Reverse(QueueItem { deadline, entity }));
        }
        self.notify.notify_waiters();
    }

    /// Whether the entity currently waits in the queue.
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.inner.lock().scheduled.contains_key(key)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().scheduled.len()
    }

    /// Backoff for the next retry of this key: exponential with jitter,
    /// clamped to the configured maximum.
    fn backoff(&self, key: &str) -> Duration {
        let attempt = {
            let mut inner = self.inner.lock();
            let counter = inner.attempts.entry(key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let exp = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        let base = exp.min(self.config.max_backoff_ms);
        let jittered = base / 2 + rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(jittered)
    }

    fn reset_attempts(&self, key: &str) {
        self.inner.lock().attempts.remove(key);
    }

    /// Pop the next due entity, sleeping until one matures or cancellation.
    async fn next_due(&self, cancel: &CancellationToken) -> Option<E> {
        loop {
            enum Head {
                Empty,
                Stale,
                Due(String),
                Sleep(Instant),
            }
            let notified = self.notify.notified();
            let wait = {
                let mut inner = self.inner.lock();
                loop {
                    let head = match inner.heap.peek() {
                        None => Head::Empty,
                        Some(Reverse(top)) => {
                            let key = top.entity.key();
                            // A newer enqueue may have moved the deadline,
                            // leaving this heap entry stale.
                            if inner.scheduled.get(&key) != Some(&top.deadline) {
                                Head::Stale
                            } else if top.deadline <= Instant::now() {
                                Head::Due(key)
                            } else {
                                Head::Sleep(top.deadline)
                            }
                        }
                    };
                    match head {
                        Head::Empty => break None,
                        Head::Stale => {
                            inner.heap.pop();
                        }
                        Head::Due(key) => {
                            if let Some(Reverse(item)) = inner.heap.pop() {
                                inner.scheduled.remove(&key);
                                return Some(item.entity);
                            }
                        }
                        Head::Sleep(deadline) => break Some(deadline),
                    }
                }
            };
            // Sleep to the next deadline, but wake early for a fresh
            // enqueue that may have moved it up.
            let sleep = async {
                match wait {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = notified => {}
                        }
                    }
                    None => notified.await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep => {}
            }
        }
    }

    /// Run `workers` processing loops until cancelled. The processor is
    /// invoked once per due entity; errors back off and retry.
    pub fn start<F, Fut>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        processor: F,
    ) -> Vec<tokio::task::JoinHandle<()>>
    where
        F: Fn(E) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        (0..self.config.workers.max(1))
            .map(|_| {
                let this = self.clone();
                let cancel = cancel.clone();
                let processor = processor.clone();
                tokio::spawn(async move {
                    while let Some(entity) = this.next_due(&cancel).await {
                        let key = entity.key();
                        match processor(entity.clone()).await {
                            Ok(()) => this.reset_attempts(&key),
                            Err(err) => {
                                let delay = this.backoff(&key);
                                tracing::debug!(%key, %err, ?delay, "action failed, backing off");
                                this.enqueue(entity, delay);
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct Item(String);

    impl Entity for Item {
        fn key(&self) -> String {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_processes_due_entity() {
        let engine = Engine::new(EngineConfig {
            workers: 1,
            ..EngineConfig::default()
        });
        let cancel = CancellationToken::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let handles = engine.start(cancel.clone(), move |_item: Item| {
            let hits = hits2.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        engine.enqueue(Item("a".into()), Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.queue_len(), 0);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dedup_keeps_earliest_deadline() {
        let engine: Arc<Engine<Item>> = Engine::new(EngineConfig::default());
        engine.enqueue(Item("a".into()), Duration::from_secs(30));
        engine.enqueue(Item("a".into()), Duration::from_millis(1));
        engine.enqueue(Item("a".into()), Duration::from_secs(60));
        assert_eq!(engine.queue_len(), 1);
        assert!(engine.is_scheduled("a"));

        let cancel = CancellationToken::new();
        let entity = engine.next_due(&cancel).await.unwrap();
        assert_eq!(entity.key(), "a");
        assert_eq!(engine.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_error_backs_off_and_retries() {
        let engine = Engine::new(EngineConfig {
            workers: 1,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        });
        let cancel = CancellationToken::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let handles = engine.start(cancel.clone(), move |_item: Item| {
            let hits = hits2.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(flotilla_common::FlotillaError::Internal("boom".into()))
                } else {
                    Ok(())
                }
            }
        });

        engine.enqueue(Item("a".into()), Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3, "two failures then success");

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_respects_delay_ordering() {
        let engine: Arc<Engine<Item>> = Engine::new(EngineConfig::default());
        engine.enqueue(Item("late".into()), Duration::from_millis(80));
        engine.enqueue(Item("soon".into()), Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let first = engine.next_due(&cancel).await.unwrap();
        assert_eq!(first.key(), "soon");
        let second = engine.next_due(&cancel).await.unwrap();
        assert_eq!(second.key(), "late");
    }

    #[tokio::test]
    async fn test_cancel_unblocks_workers() {
        let engine: Arc<Engine<Item>> = Engine::new(EngineConfig {
            workers: 2,
            ..EngineConfig::default()
        });
        let cancel = CancellationToken::new();
        let handles = engine.start(cancel.clone(), |_item: Item| async { Ok(()) });
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
