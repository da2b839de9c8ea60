// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Bounded FIFO with a blocking dequeue-with-timeout.
//!
//! Backs the placement queue and the preemption queue: producers enqueue
//! without blocking (over-capacity is an error), consumers park until an item
//! arrives or the timeout elapses.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{FlotillaError, Result};

#[derive(Debug)]
pub struct TimedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> TimedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(FlotillaError::LimitExceeded(format!(
                    "queue capacity {} reached",
                    self.capacity
                )));
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Pop the next item, waiting up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before the re-check so a concurrent enqueue
            // between check and wait cannot be missed.
            let notified = self.notify.notified();
            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match self.try_dequeue() {
                    Some(item) => Ok(item),
                    None => Err(FlotillaError::TimedOut),
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
