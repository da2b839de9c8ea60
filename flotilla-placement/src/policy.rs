// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Host-fit policies.
//!
//! Filter candidates, score, assign — all-or-nothing per gang. Batch work
//! packs onto busy hosts to keep machines drainable; stateless work spreads
//! one task per host; stateful work takes a host exclusively.

use std::collections::{HashMap, HashSet};

use flotilla_api::gang::Gang;
use flotilla_api::task::{RmTaskSpec, TaskType};
use flotilla_common::resources::ResourceVector;

use crate::hosts::HostSnapshot;

/// One host's slice of a gang placement.
#[derive(Debug, Clone)]
pub struct HostAssignment {
    pub hostname: String,
    pub agent_id: String,
    pub tasks: Vec<RmTaskSpec>,
    pub resources: ResourceVector,
    pub exclusive: bool,
}

/// Whether a task type demands a dedicated host.
pub fn is_exclusive(task_type: TaskType) -> bool {
    matches!(task_type, TaskType::Stateful)
}

/// Fraction of the dominant dimension in use; busy hosts score high.
fn utilization(host: &HostSnapshot) -> f64 {
    use flotilla_common::resources::Dimension;
    let mut max = 0.0_f64;
    for dim in Dimension::ALL {
        let cap = host.capacity.get(dim).to_f64();
        if cap <= 0.0 {
            continue;
        }
        let used = cap - host.free.get(dim).to_f64();
        max = max.max(used / cap);
    }
    max
}

/// Solve host fit for one gang. Returns `None` when the gang cannot be
/// placed whole on the current snapshot.
pub fn assign_gang(gang: &Gang, hosts: &[HostSnapshot]) -> Option<Vec<HostAssignment>> {
    let task_type = gang.task_type()?;
    if is_exclusive(task_type) {
        assign_exclusive(gang, hosts)
    } else if task_type == TaskType::Stateless {
        assign_spread(gang, hosts)
    } else {
        assign_packed(gang, hosts)
    }
}

/// Pack: fill the busiest host that still fits, spilling to the next.
fn assign_packed(gang: &Gang, hosts: &[HostSnapshot]) -> Option<Vec<HostAssignment>> {
    let mut candidates: Vec<&HostSnapshot> = hosts.iter().filter(|h| !h.exclusive).collect();
    candidates.sort_by(|a, b| {
        utilization(b)
            .partial_cmp(&utilization(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hostname.cmp(&b.hostname))
    });

    let mut free: HashMap<&str, ResourceVector> =
        candidates.iter().map(|h| (h.hostname.as_str(), h.free)).collect();
    let mut assigned: HashMap<&str, Vec<RmTaskSpec>> = HashMap::new();

    for task in &gang.tasks {
        let hostname = candidates.iter().find_map(|h| {
            let remaining = free.get(h.hostname.as_str())?;
            task.resource
                .less_or_equal(remaining)
                .then(|| h.hostname.as_str())
        })?;
        if let Some(slot) = free.get_mut(hostname) {
            let (rest, _) = slot.subtract(&task.resource);
            *slot = rest;
        }
        assigned.entry(hostname).or_default().push(task.clone());
    }

    Some(build_assignments(assigned, hosts, false))
}

/// Spread: one task per host, least-utilized first.
fn assign_spread(gang: &Gang, hosts: &[HostSnapshot]) -> Option<Vec<HostAssignment>> {
    let mut candidates: Vec<&HostSnapshot> = hosts.iter().filter(|h| !h.exclusive).collect();
    candidates.sort_by(|a, b| {
        utilization(a)
            .partial_cmp(&utilization(b))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hostname.cmp(&b.hostname))
    });

    if candidates.len() < gang.len() {
        return None;
    }
    let mut assigned: HashMap<&str, Vec<RmTaskSpec>> = HashMap::new();
    let mut taken: HashSet<&str> = HashSet::new();
    for task in &gang.tasks {
        let host = candidates.iter().find(|h| {
            !taken.contains(h.hostname.as_str()) && task.resource.less_or_equal(&h.free)
        })?;
        taken.insert(host.hostname.as_str());
        assigned
            .entry(host.hostname.as_str())
            .or_default()
            .push(task.clone());
    }
    Some(build_assignments(assigned, hosts, false))
}

/// Exclusive: each task takes an idle host for itself.
fn assign_exclusive(gang: &Gang, hosts: &[HostSnapshot]) -> Option<Vec<HostAssignment>> {
    let mut candidates: Vec<&HostSnapshot> = hosts
        .iter()
        .filter(|h| !h.exclusive && h.task_count == 0)
        .collect();
    candidates.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    if candidates.len() < gang.len() {
        return None;
    }

    let mut assigned: HashMap<&str, Vec<RmTaskSpec>> = HashMap::new();
    let mut taken: HashSet<&str> = HashSet::new();
    for task in &gang.tasks {
        let host = candidates.iter().find(|h| {
            !taken.contains(h.hostname.as_str()) && task.resource.less_or_equal(&h.free)
        })?;
        taken.insert(host.hostname.as_str());
        assigned
            .entry(host.hostname.as_str())
            .or_default()
            .push(task.clone());
    }
    Some(build_assignments(assigned, hosts, true))
}

fn build_assignments(
    assigned: HashMap<&str, Vec<RmTaskSpec>>,
    hosts: &[HostSnapshot],
    exclusive: bool,
) -> Vec<HostAssignment> {
    let mut out = Vec::with_capacity(assigned.len());
    for (hostname, tasks) in assigned {
        let agent_id = hosts
            .iter()
            .find(|h| h.hostname == hostname)
            .map(|h| h.agent_id.clone())
            .unwrap_or_default();
        let resources = tasks
            .iter()
            .fold(ResourceVector::ZERO, |acc, t| acc.add(&t.resource));
        out.push(HostAssignment {
            hostname: hostname.to_string(),
            agent_id,
            tasks,
            resources,
            exclusive,
        });
    }
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    out
}
