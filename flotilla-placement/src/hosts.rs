// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Live host inventory fed by the agent offer stream.
//!
//! Offers add or refresh hosts; rescinds remove them. The inventory tracks
//! what each host has committed so concurrent placement rounds cannot
//! oversubscribe, and enforces host exclusivity (at most one exclusive
//! task per host, and nothing else beside it).

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use flotilla_common::resources::ResourceVector;

/// One agent advertisement.
#[derive(Debug, Clone)]
pub struct HostOffer {
    pub hostname: String,
    pub agent_id: String,
    pub resources: ResourceVector,
    pub attributes: BTreeMap<String, String>,
}

/// Read-only view of a host for fit decisions.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub hostname: String,
    pub agent_id: String,
    pub capacity: ResourceVector,
    pub free: ResourceVector,
    pub attributes: BTreeMap<String, String>,
    pub task_count: usize,
    pub exclusive: bool,
}

struct HostEntry {
    agent_id: String,
    capacity: ResourceVector,
    used: ResourceVector,
    attributes: BTreeMap<String, String>,
    task_count: usize,
    /// Host is dedicated to one exclusive task.
    exclusive: bool,
}

#[derive(Default)]
pub struct HostInventory {
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl HostInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an offer: new hosts join, known hosts refresh capacity and
    /// attributes (committed usage is preserved).
    pub fn add_or_update_host(&self, offer: HostOffer) {
        let mut hosts = self.hosts.lock();
        match hosts.get_mut(&offer.hostname) {
            Some(entry) => {
                entry.agent_id = offer.agent_id;
                entry.capacity = offer.resources;
                entry.attributes = offer.attributes;
            }
            None => {
                hosts.insert(
                    offer.hostname.clone(),
                    HostEntry {
                        agent_id: offer.agent_id,
                        capacity: offer.resources,
                        used: ResourceVector::ZERO,
                        attributes: offer.attributes,
                        task_count: 0,
                        exclusive: false,
                    },
                );
            }
        }
    }

    /// Rescind: the host is gone.
    pub fn remove_host(&self, hostname: &str) {
        self.hosts.lock().remove(hostname);
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }

    /// Sum of all host capacities; feeds the entitlement root.
    pub fn total_capacity(&self) -> ResourceVector {
        self.hosts
            .lock()
            .values()
            .fold(ResourceVector::ZERO, |acc, h| acc.add(&h.capacity))
    }

    /// Fit view of every host.
    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        let hosts = self.hosts.lock();
        let mut out: Vec<HostSnapshot> = hosts
            .iter()
            .map(|(hostname, entry)| {
                let (free, _) = entry.capacity.subtract(&entry.used);
                HostSnapshot {
                    hostname: hostname.clone(),
                    agent_id: entry.agent_id.clone(),
                    capacity: entry.capacity,
                    free,
                    attributes: entry.attributes.clone(),
                    task_count: entry.task_count,
                    exclusive: entry.exclusive,
                }
            })
            .collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    /// Commit resources for `task_count` tasks on a host. Fails when the
    /// host is gone, lacks room, or exclusivity would be violated.
    pub fn try_claim(
        &self,
        hostname: &str,
        res: &ResourceVector,
        task_count: usize,
        exclusive: bool,
    ) -> bool {
        let mut hosts = self.hosts.lock();
        let Some(entry) = hosts.get_mut(hostname) else {
            return false;
        };
        if entry.exclusive || (exclusive && entry.task_count > 0) {
            return false;
        }
        let needed = entry.used.add(res);
        if !needed.less_or_equal(&entry.capacity) {
            return false;
        }
        entry.used = needed;
        entry.task_count += task_count;
        entry.exclusive = exclusive;
        true
    }

    /// Give back what a claim (or a finished task) held.
    pub fn release(&self, hostname: &str, res: &ResourceVector, task_count: usize) {
        let mut hosts = self.hosts.lock();
        if let Some(entry) = hosts.get_mut(hostname) {
            let (used, _) = entry.used.subtract(res);
            entry.used = used;
            entry.task_count = entry.task_count.saturating_sub(task_count);
            if entry.task_count == 0 {
                entry.exclusive = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(host: &str, cpu: f64) -> HostOffer {
        HostOffer {
            hostname: host.into(),
            agent_id: format!("agent-{host}"),
            resources: ResourceVector::new(cpu, 1000.0, 100.0, 0.0),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_offer_and_rescind() {
        let inv = HostInventory::new();
        inv.add_or_update_host(offer("a", 4.0));
        inv.add_or_update_host(offer("b", 8.0));
        assert_eq!(inv.len(), 2);
        assert_eq!(
            inv.total_capacity(),
            ResourceVector::new(12.0, 2000.0, 200.0, 0.0)
        );

        inv.remove_host("a");
        assert_eq!(inv.len(), 1);
    }

    #[test]
    fn test_update_preserves_usage() {
        let inv = HostInventory::new();
        inv.add_or_update_host(offer("a", 4.0));
        assert!(inv.try_claim("a", &ResourceVector::new(2.0, 100.0, 0.0, 0.0), 1, false));

        // A refresh grows capacity but keeps the claim.
        inv.add_or_update_host(offer("a", 8.0));
        let snap = &inv.snapshot()[0];
        assert_eq!(snap.free, ResourceVector::new(6.0, 900.0, 100.0, 0.0));
        assert_eq!(snap.task_count, 1);
    }

    #[test]
    fn test_claim_respects_capacity() {
        let inv = HostInventory::new();
        inv.add_or_update_host(offer("a", 4.0));
        assert!(inv.try_claim("a", &ResourceVector::new(3.0, 10.0, 0.0, 0.0), 1, false));
        assert!(!inv.try_claim("a", &ResourceVector::new(2.0, 10.0, 0.0, 0.0), 1, false));
        inv.release("a", &ResourceVector::new(3.0, 10.0, 0.0, 0.0), 1);
        assert!(inv.try_claim("a", &ResourceVector::new(2.0, 10.0, 0.0, 0.0), 1, false));
    }

    #[test]
    fn test_exclusivity() {
        let inv = HostInventory::new();
        inv.add_or_update_host(offer("a", 16.0));

        assert!(inv.try_claim("a", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1, true));
        // Nothing else lands beside an exclusive task.
        assert!(!inv.try_claim("a", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1, false));

        // And an exclusive task cannot join a busy host.
        inv.add_or_update_host(offer("b", 16.0));
        assert!(inv.try_claim("b", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1, false));
        assert!(!inv.try_claim("b", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1, true));

        // Releasing the exclusive task frees the host.
        inv.release("a", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1);
        assert!(inv.try_claim("a", &ResourceVector::new(1.0, 10.0, 0.0, 0.0), 1, false));
    }
}
