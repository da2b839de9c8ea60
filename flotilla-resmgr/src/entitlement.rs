// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Fair-share entitlement distribution.
//!
//! Runs top-down from cluster capacity. At each node, per dimension:
//! reservations first, then slack proportional to share capped by limit and
//! by live usage (demand + allocation), then redistribution of unclaimed
//! slack until fixed point. Unclaimed capacity stays at the parent, so
//! children's entitlements never sum past the parent's.

use std::collections::HashMap;
use std::sync::Arc;

use flotilla_common::ids::PoolId;
use flotilla_common::resources::{Dimension, Quantity, ResourceVector};

use crate::respool::ResPool;
use crate::tree::Tree;

pub struct EntitlementCalculator {
    tree: Arc<Tree>,
}

impl EntitlementCalculator {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }

    /// Recompute every pool's entitlement for this cycle against the given
    /// cluster capacity. Deterministic: same tree state in, same
    /// entitlements out.
    pub fn compute(&self, capacity: ResourceVector) {
        let usage = self.collect_usage();
        let Ok(root) = self.tree.get(self.tree.root_id()) else {
            return;
        };
        root.set_entitlement(capacity);
        self.distribute(&root, capacity, &usage);
    }

    /// Subtree usage (demand + allocation) per pool, leaves up.
    fn collect_usage(&self) -> HashMap<PoolId, ResourceVector> {
        let mut usage = HashMap::new();
        let Ok(root) = self.tree.get(self.tree.root_id()) else {
            return usage;
        };
        self.usage_of(&root, &mut usage);
        usage
    }

    fn usage_of(&self, pool: &Arc<ResPool>, out: &mut HashMap<PoolId, ResourceVector>) -> ResourceVector {
        let total = if pool.is_leaf() {
            pool.demand().add(&pool.allocation())
        } else {
            let mut sum = ResourceVector::ZERO;
            for child_id in pool.children() {
                if let Ok(child) = self.tree.get(&child_id) {
                    sum = sum.add(&self.usage_of(&child, out));
                }
            }
            sum
        };
        out.insert(pool.id().clone(), total);
        total
    }

    fn distribute(
        &self,
        node: &Arc<ResPool>,
        budget: ResourceVector,
        usage: &HashMap<PoolId, ResourceVector>,
    ) {
        let children: Vec<Arc<ResPool>> = node
            .children()
            .into_iter()
            .filter_map(|id| self.tree.get(&id).ok())
            .collect();
        if children.is_empty() {
            return;
        }

        let mut entitlements = vec![ResourceVector::ZERO; children.len()];
        for dim in Dimension::ALL {
            let shares = distribute_dimension(dim, budget.get(dim), &children, usage);
            for (ent, value) in entitlements.iter_mut().zip(shares) {
                ent.set(dim, value);
            }
        }

        for (child, ent) in children.iter().zip(entitlements) {
            child.set_entitlement(ent);
            self.distribute(child, ent, usage);
        }
    }
}

/// Distribute one dimension's budget across sibling pools.
fn distribute_dimension(
    dim: Dimension,
    budget: Quantity,
    children: &[Arc<ResPool>],
    usage: &HashMap<PoolId, ResourceVector>,
) -> Vec<Quantity> {
    let mut remaining = budget;
    let mut granted = vec![Quantity::ZERO; children.len()];

    // Reservations first, capped by what is left.
    for (i, child) in children.iter().enumerate() {
        let give = child.config().reservation.get(dim).min(remaining);
        granted[i] = give;
        let (rest, _) = remaining.saturating_sub(give);
        remaining = rest;
    }

    // A pool can claim slack up to its limit, and no further than its live
    // usage wants (but never below its reservation).
    let cap = |i: usize| -> Quantity {
        let child = &children[i];
        let reservation = child.config().reservation.get(dim);
        let used = usage
            .get(child.id())
            .map(|u| u.get(dim))
            .unwrap_or(Quantity::ZERO);
        let want = if used > reservation { used } else { reservation };
        child.config().limit.get(dim).min(want)
    };

    // Share-proportional slack, redistributing until nothing moves.
    loop {
        if !remaining.is_positive() {
            break;
        }
        let claimants: Vec<usize> = (0..children.len())
            .filter(|&i| granted[i] < cap(i))
            .collect();
        if claimants.is_empty() {
            break;
        }
        let total_share: f64 = claimants
            .iter()
            .map(|&i| children[i].config().share.get(dim).to_f64())
            .sum();
        if total_share <= 0.0 {
            break;
        }

        let round_budget = remaining;
        let mut moved = false;
        for &i in &claimants {
            let fraction = children[i].config().share.get(dim).to_f64() / total_share;
            let want = round_budget.scale(fraction);
            let headroom = {
                let (h, _) = cap(i).saturating_sub(granted[i]);
                h
            };
            let grant = want.min(headroom).min(remaining);
            if grant.is_positive() {
                granted[i] += grant;
                let (rest, _) = remaining.saturating_sub(grant);
                remaining = rest;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_support::{pool_config, root_config};
    use flotilla_api::gang::Gang;
    use flotilla_api::task::{RmTaskSpec, TaskConfig};
    use flotilla_common::ids::{JobId, TaskId};

    fn capacity() -> ResourceVector {
        ResourceVector::new(100.0, 1000.0, 1000.0, 10.0)
    }

    fn add_demand(pool: &ResPool, cpu: f64) {
        let config = TaskConfig {
            resource: ResourceVector::new(cpu, 0.0, 0.0, 0.0),
            ..TaskConfig::default()
        };
        let task = RmTaskSpec::new(TaskId::new(JobId::random(), 0), 1, &config);
        let res = task.resource;
        pool.enqueue_gang(Gang::of_task(task)).unwrap();
        pool.add_to_demand(&res);
    }

    fn two_leaf_tree(res_a: f64, res_b: f64) -> (Arc<Tree>, Arc<ResPool>, Arc<ResPool>) {
        let tree = Tree::new(root_config(capacity())).unwrap();
        let a = tree
            .add_pool(
                PoolId::from("a"),
                pool_config(
                    "a",
                    Some("root"),
                    ResourceVector::new(res_a, 0.0, 0.0, 0.0),
                    capacity(),
                ),
            )
            .unwrap();
        let b = tree
            .add_pool(
                PoolId::from("b"),
                pool_config(
                    "b",
                    Some("root"),
                    ResourceVector::new(res_b, 0.0, 0.0, 0.0),
                    capacity(),
                ),
            )
            .unwrap();
        (tree, a, b)
    }

    #[test]
    fn test_reservation_granted_without_demand() {
        let (tree, a, b) = two_leaf_tree(30.0, 20.0);
        EntitlementCalculator::new(tree).compute(capacity());
        assert_eq!(a.entitlement().cpu, Quantity::from_f64(30.0));
        assert_eq!(b.entitlement().cpu, Quantity::from_f64(20.0));
    }

    #[test]
    fn test_slack_follows_demand() {
        let (tree, a, b) = two_leaf_tree(10.0, 10.0);
        add_demand(&a, 60.0);
        EntitlementCalculator::new(tree).compute(capacity());

        // a: reservation 10 topped up to its 60 of usage; b: reservation only.
        assert_eq!(a.entitlement().cpu, Quantity::from_f64(60.0));
        assert_eq!(b.entitlement().cpu, Quantity::from_f64(10.0));
    }

    #[test]
    fn test_equal_shares_split_contended_slack() {
        let (tree, a, b) = two_leaf_tree(0.0, 0.0);
        add_demand(&a, 100.0);
        add_demand(&b, 100.0);
        EntitlementCalculator::new(tree).compute(capacity());

        assert_eq!(a.entitlement().cpu, Quantity::from_f64(50.0));
        assert_eq!(b.entitlement().cpu, Quantity::from_f64(50.0));
    }

    #[test]
    fn test_limit_caps_entitlement_and_surplus_redistributes() {
        let tree = Tree::new(root_config(capacity())).unwrap();
        let a = tree
            .add_pool(
                PoolId::from("a"),
                pool_config(
                    "a",
                    Some("root"),
                    ResourceVector::ZERO,
                    ResourceVector::new(20.0, 1000.0, 1000.0, 10.0),
                ),
            )
            .unwrap();
        let b = tree
            .add_pool(
                PoolId::from("b"),
                pool_config("b", Some("root"), ResourceVector::ZERO, capacity()),
            )
            .unwrap();
        add_demand(&a, 100.0);
        add_demand(&b, 100.0);
        EntitlementCalculator::new(tree).compute(capacity());

        // a is limited to 20; the slack it cannot take flows to b.
        assert_eq!(a.entitlement().cpu, Quantity::from_f64(20.0));
        assert_eq!(b.entitlement().cpu, Quantity::from_f64(80.0));
    }

    #[test]
    fn test_entitlement_conservation() {
        let (tree, a, b) = two_leaf_tree(10.0, 30.0);
        add_demand(&a, 45.0);
        add_demand(&b, 80.0);
        EntitlementCalculator::new(tree.clone()).compute(capacity());

        let root = tree.get(tree.root_id()).unwrap();
        for dim in Dimension::ALL {
            let sum = a.entitlement().get(dim) + b.entitlement().get(dim);
            assert!(
                sum <= root.entitlement().get(dim),
                "conservation violated on {dim}"
            );
        }
    }

    #[test]
    fn test_nested_distribution_recurses() {
        let tree = Tree::new(root_config(capacity())).unwrap();
        tree.add_pool(
            PoolId::from("org"),
            pool_config(
                "org",
                Some("root"),
                ResourceVector::new(40.0, 0.0, 0.0, 0.0),
                capacity(),
            ),
        )
        .unwrap();
        let team = tree
            .add_pool(
                PoolId::from("team"),
                pool_config(
                    "team",
                    Some("org"),
                    ResourceVector::new(40.0, 0.0, 0.0, 0.0),
                    capacity(),
                ),
            )
            .unwrap();
        add_demand(&team, 10.0);
        EntitlementCalculator::new(tree.clone()).compute(capacity());

        let org = tree.get(&PoolId::from("org")).unwrap();
        assert_eq!(org.entitlement().cpu, Quantity::from_f64(40.0));
        assert_eq!(team.entitlement().cpu, Quantity::from_f64(40.0));
    }
}
