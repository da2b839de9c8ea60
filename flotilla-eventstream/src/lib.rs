// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ordered, acknowledged event channel.
//!
//! One bounded ring shared by all subscribers. Writers append with
//! monotonically increasing offsets; each subscriber polls from its own
//! cursor and acknowledges the highest offset it has processed. Entries are
//! discarded only once every registered subscriber has acknowledged past
//! them, so a writer blocks when the slowest subscriber lags by more than
//! the ring size.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use flotilla_common::{FlotillaError, Result};

struct Inner<T> {
    /// Retained events, oldest first, each tagged with its offset.
    events: VecDeque<(u64, T)>,
    /// Offset the next appended event receives.
    next_offset: u64,
    /// Highest offset acknowledged per subscriber. Monotonic.
    acks: HashMap<String, u64>,
}

impl<T> Inner<T> {
    /// Drop entries every subscriber has acknowledged.
    fn purge(&mut self) -> usize {
        let Some(min_acked) = self.acks.values().copied().min() else {
            return 0;
        };
        let mut purged = 0;
        while matches!(self.events.front(), Some((offset, _)) if *offset <= min_acked) {
            self.events.pop_front();
            purged += 1;
        }
        purged
    }
}

/// A bounded multi-subscriber event stream.
pub struct EventStream<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    appended: Notify,
    acked: Notify,
}

impl<T: Clone> EventStream<T> {
    /// `capacity` bounds how far the slowest subscriber may lag. Subscribers
    /// must be registered before the first append they care about; a late
    /// registration starts at the current tail.
    pub fn new(capacity: usize, subscribers: &[&str]) -> Self {
        let acks = subscribers
            .iter()
            .map(|name| (name.to_string(), 0u64))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_offset: 1,
                acks,
            }),
            capacity,
            appended: Notify::new(),
            acked: Notify::new(),
        }
    }

    /// Append an event, blocking while the ring is full. Returns the offset
    /// assigned to the event.
    pub async fn append(&self, event: T) -> u64 {
        loop {
            let acked = self.acked.notified();
            {
                let mut inner = self.inner.lock();
                if inner.events.len() < self.capacity {
                    let offset = inner.next_offset;
                    inner.next_offset += 1;
                    inner.events.push_back((offset, event));
                    drop(inner);
                    self.appended.notify_waiters();
                    return offset;
                }
            }
            acked.await;
        }
    }

    /// Append without blocking; fails when the slowest subscriber lags by
    /// more than the ring size.
    pub fn try_append(&self, event: T) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.events.len() >= self.capacity {
            return Err(FlotillaError::LimitExceeded(
                "event ring full, slowest subscriber lagging".into(),
            ));
        }
        let offset = inner.next_offset;
        inner.next_offset += 1;
        inner.events.push_back((offset, event));
        drop(inner);
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Events with offset strictly greater than `since_offset`, up to
    /// `limit`. All subscribers observe the same order.
    pub fn poll(&self, since_offset: u64, limit: usize) -> Vec<(u64, T)> {
        let inner = self.inner.lock();
        inner
            .events
            .iter()
            .filter(|(offset, _)| *offset > since_offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Like [`poll`](Self::poll), waiting up to `timeout` for at least one
    /// event past the cursor.
    pub async fn poll_wait(
        &self,
        since_offset: u64,
        limit: usize,
        timeout: Duration,
    ) -> Vec<(u64, T)> {
        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            let batch = self.poll(since_offset, limit);
            if !batch.is_empty() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return self.poll(since_offset, limit);
            }
        }
    }

    /// Acknowledge processing through `offset` for one subscriber. Acks are
    /// monotonic: an older offset never moves the cursor backward. Returns
    /// the subscriber's effective cursor.
    pub fn ack(&self, subscriber: &str, offset: u64) -> Result<u64> {
        let purged;
        let effective;
        {
            let mut inner = self.inner.lock();
            let cursor = inner.acks.get_mut(subscriber).ok_or_else(|| {
                FlotillaError::Internal(format!("unknown subscriber {subscriber}"))
            })?;
            *cursor = (*cursor).max(offset);
            effective = *cursor;
            purged = inner.purge();
        }
        if purged > 0 {
            self.acked.notify_waiters();
        }
        Ok(effective)
    }

    /// Number of retained (un-purged) events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Highest offset assigned so far.
    pub fn head_offset(&self) -> u64 {
        self.inner.lock().next_offset - 1
    }
}
