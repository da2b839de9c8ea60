// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The `Core` owns every subsystem — pool tree, tracker, scheduler,
//! preemptor, handler, host inventory, placement engine, goal-state driver
//! and its listeners — and passes references down. No global singletons;
//! tests construct fresh instances.
//!
//! Leader contract: `start()` recovers persisted state and opens the loops;
//! `stop()` drains them within a bounded grace period before the lease is
//! given up.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flotilla_api::event::TaskStatusEvent;
use flotilla_api::pool::ResourcePoolConfig;
use flotilla_common::ids::PoolId;
use flotilla_common::Result;
use flotilla_eventstream::EventStream;
use flotilla_jobmgr::driver::GoalStateDriverConfig;
use flotilla_jobmgr::event_listener::{EventListener, SUBSCRIBER};
use flotilla_jobmgr::preemption_listener::PreemptionListener;
use flotilla_jobmgr::GoalStateDriver;
use flotilla_placement::{HostInventory, HostOffer, PlacementConfig, PlacementEngine};
use flotilla_resmgr::preemption::{PreemptionConfig, Preemptor};
use flotilla_resmgr::respool::ResPool;
use flotilla_resmgr::rmtask::RmTaskConfig;
use flotilla_resmgr::scheduler::{Scheduler, SchedulerConfig};
use flotilla_resmgr::{ServiceHandler, Tracker, Tree};
use flotilla_storage::{Store, TableStorage};

#[derive(Clone)]
pub struct CoreConfig {
    pub root_pool: ResourcePoolConfig,
    pub scheduler: SchedulerConfig,
    pub preemption: PreemptionConfig,
    pub rm_task: RmTaskConfig,
    pub placement: PlacementConfig,
    pub goal_state: GoalStateDriverConfig,
    /// Retained task state events before writers block.
    pub event_capacity: usize,
    /// Drain budget for `stop()`.
    pub stop_grace_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        use flotilla_api::pool::{equal_share, SchedulingPolicy};
        use flotilla_common::resources::ResourceVector;
        let unbounded = ResourceVector::new(1e9, 1e12, 1e12, 1e6);
        Self {
            root_pool: ResourcePoolConfig {
                name: "root".into(),
                parent: None,
                reservation: unbounded,
                limit: unbounded,
                share: equal_share(),
                policy: SchedulingPolicy::PriorityFifo,
            },
            scheduler: SchedulerConfig::default(),
            preemption: PreemptionConfig::default(),
            rm_task: RmTaskConfig::default(),
            placement: PlacementConfig::default(),
            goal_state: GoalStateDriverConfig::default(),
            event_capacity: 65_536,
            stop_grace_ms: 30_000,
        }
    }
}

pub struct Core {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    scheduler: Arc<Scheduler>,
    handler: Arc<ServiceHandler>,
    preemptor: Arc<Preemptor>,
    inventory: Arc<HostInventory>,
    placement: Arc<PlacementEngine>,
    driver: Arc<GoalStateDriver>,
    events: Arc<EventStream<TaskStatusEvent>>,
    storage: TableStorage,
    config: CoreConfig,
    run: parking_lot::Mutex<Option<RunningLoops>>,
}

struct RunningLoops {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Core {
    pub fn new(store: Arc<dyn Store>, config: CoreConfig) -> Result<Arc<Self>> {
        let tree = Tree::new(config.root_pool.clone())?;
        let events = Arc::new(EventStream::new(config.event_capacity, &[SUBSCRIBER]));
        let tracker = Tracker::new(tree.clone(), events.clone(), config.rm_task);
        let scheduler = Scheduler::new(tree.clone(), tracker.clone(), config.scheduler);
        let handler = ServiceHandler::new(tree.clone(), tracker.clone(), scheduler.clone());
        let preemptor = Preemptor::new(tree.clone(), tracker.clone(), config.preemption);
        let inventory = Arc::new(HostInventory::new());
        let placement = PlacementEngine::new(
            handler.clone(),
            inventory.clone(),
            config.placement.clone(),
        );
        let storage = TableStorage::new(store);
        let driver = GoalStateDriver::new(storage.clone(), handler.clone(), config.goal_state);

        Ok(Arc::new(Self {
            tree,
            tracker,
            scheduler,
            handler,
            preemptor,
            inventory,
            placement,
            driver,
            events,
            storage,
            config,
            run: parking_lot::Mutex::new(None),
        }))
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn handler(&self) -> &Arc<ServiceHandler> {
        &self.handler
    }

    pub fn preemptor(&self) -> &Arc<Preemptor> {
        &self.preemptor
    }

    pub fn inventory(&self) -> &Arc<HostInventory> {
        &self.inventory
    }

    pub fn driver(&self) -> &Arc<GoalStateDriver> {
        &self.driver
    }

    pub fn storage(&self) -> &TableStorage {
        &self.storage
    }

    pub fn add_pool(&self, id: PoolId, config: ResourcePoolConfig) -> Result<Arc<ResPool>> {
        self.tree.add_pool(id, config)
    }

    /// Apply an agent offer and refresh cluster capacity.
    pub fn register_host(&self, offer: HostOffer) {
        self.inventory.add_or_update_host(offer);
        self.scheduler
            .set_cluster_capacity(self.inventory.total_capacity());
    }

    /// Rescind a host.
    pub fn unregister_host(&self, hostname: &str) {
        self.inventory.remove_host(hostname);
        self.scheduler
            .set_cluster_capacity(self.inventory.total_capacity());
    }

    /// Called on winning the leader lease: recover persisted state, then
    /// open every loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let run = self.run.lock();
            if run.is_some() {
                return Ok(());
            }
        }
        let recovered = self.driver.recover().await?;
        tracing::info!(recovered, "core starting as leader");

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        handles.push(self.scheduler.start(cancel.clone()));
        handles.push(self.preemptor.start(cancel.clone()));
        handles.extend(self.placement.start(cancel.clone()));
        handles.extend(self.driver.start(cancel.clone()));
        handles.push(
            EventListener::new(self.driver.clone(), self.events.clone()).start(cancel.clone()),
        );
        handles.push(
            PreemptionListener::new(self.driver.clone(), self.preemptor.clone())
                .start(cancel.clone()),
        );

        *self.run.lock() = Some(RunningLoops { cancel, handles });
        Ok(())
    }

    /// Called before giving up the leader lease: signal every loop and wait
    /// out the drain, abandoning stragglers past the grace period.
    pub async fn stop(&self) {
        let Some(RunningLoops { cancel, handles }) = self.run.lock().take() else {
            return;
        };
        cancel.cancel();
        let grace = Duration::from_millis(self.config.stop_grace_ms);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("stop grace period elapsed with loops still running");
        }
        tracing::info!("core stopped");
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }
}
