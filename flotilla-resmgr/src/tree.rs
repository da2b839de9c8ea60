// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The resource pool hierarchy.
//!
//! Nodes are owned by the tree in an id-indexed map; parent/child relations
//! are ids, never references, so there are no ownership cycles and the
//! locking order (tree before pool) is trivial to uphold. The structure
//! lock is taken only for add/lookup/enumerate; per-pool state lives behind
//! each pool's own lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flotilla_api::pool::ResourcePoolConfig;
use flotilla_common::ids::PoolId;
use flotilla_common::{FlotillaError, Result};

use crate::respool::ResPool;

pub struct Tree {
    pools: RwLock<HashMap<PoolId, Arc<ResPool>>>,
    root: PoolId,
}

impl Tree {
    /// Build a tree from the root config. Further pools are attached with
    /// [`add_pool`](Self::add_pool).
    pub fn new(root_config: ResourcePoolConfig) -> Result<Arc<Self>> {
        if root_config.parent.is_some() {
            return Err(FlotillaError::InvalidConfig(
                "root pool must not have a parent".into(),
            ));
        }
        let root_id = PoolId::from("root");
        let root = Arc::new(ResPool::new(root_id.clone(), root_config)?);
        let mut pools = HashMap::new();
        pools.insert(root_id.clone(), root);
        Ok(Arc::new(Self {
            pools: RwLock::new(pools),
            root: root_id,
        }))
    }

    pub fn root_id(&self) -> &PoolId {
        &self.root
    }

    /// Create a pool under its configured parent.
    ///
    /// Sibling reservations must stay within the parent's reservation on
    /// every dimension.
    pub fn add_pool(&self, id: PoolId, config: ResourcePoolConfig) -> Result<Arc<ResPool>> {
        let parent_id = config
            .parent
            .clone()
            .ok_or_else(|| FlotillaError::InvalidConfig("non-root pool needs a parent".into()))?;

        let mut pools = self.pools.write();
        if pools.contains_key(&id) {
            return Err(FlotillaError::InvalidConfig(format!(
                "pool {id} already exists"
            )));
        }
        let parent = pools
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| FlotillaError::PoolNotFound(parent_id.to_string()))?;

        let mut sibling_reservation = config.reservation;
        for sibling in parent.children() {
            if let Some(pool) = pools.get(&sibling) {
                sibling_reservation = sibling_reservation.add(&pool.config().reservation);
            }
        }
        if !sibling_reservation.less_or_equal(&parent.config().reservation) {
            return Err(FlotillaError::InvalidConfig(format!(
                "reservations under {} exceed its own reservation",
                parent.name()
            )));
        }

        let pool = Arc::new(ResPool::new(id.clone(), config)?);
        pools.insert(id.clone(), pool.clone());
        parent.add_child(id);
        Ok(pool)
    }

    pub fn get(&self, id: &PoolId) -> Result<Arc<ResPool>> {
        self.pools
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FlotillaError::PoolNotFound(id.to_string()))
    }

    /// All pools, or only leaves.
    pub fn all_pools(&self, leaves_only: bool) -> Vec<Arc<ResPool>> {
        self.pools
            .read()
            .values()
            .filter(|p| !leaves_only || p.is_leaf())
            .cloned()
            .collect()
    }

    /// Leaf pools ordered for the scheduler: descending cpu share, then id,
    /// so every cycle visits them in the same sequence.
    pub fn leaves_in_share_order(&self) -> Vec<Arc<ResPool>> {
        let mut leaves = self.all_pools(true);
        leaves.sort_by(|a, b| {
            b.config()
                .share
                .cpu
                .cmp(&a.config().share.cpu)
                .then_with(|| a.id().cmp(b.id()))
        });
        leaves
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}
