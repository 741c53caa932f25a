//! # Pipeline assembly
//!
//! Wires the four stages onto a [`MessageBus`]:
//!
//! ```text
//! raw_data/machine_sensors/+ ──► ContextAggregator (by machine)
//!                                   │
//! context/machine_status/+  ◄───────┘──► DecisionRouter
//!                                          │
//! decision/#                ◄──────────────┘──► ActionDispatcher
//!                                                 │
//! simulated_actions/+       ◄─────────────────────┘
//!
//! context + simulated_actions + heartbeat ──► ObservabilitySink
//! ```
//!
//! Every stage is its own tokio task. Stages never call each other; the bus
//! is the only coupling. Subscriptions are taken before any task starts, so
//! nothing published after [`Pipeline::spawn`] returns is missed.

pub mod heartbeat;
pub mod stage;
pub mod worker;

pub use stage::{Outbound, Stage, StageCounters, WorkerStats};
pub use worker::{run_sharded, run_stage, shard_for, WorkerContext};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::aggregator::{AggregatorSettings, AnomalyDetector, ContextAggregator};
use crate::bus::{BusError, MessageBus, Topics};
use crate::config::PipelineConfig;
use crate::contracts::ContractRegistry;
use crate::dispatcher::{ActionDispatcher, ActionExecutor, DispatcherSettings, SimulatedExecutor};
use crate::monitor::{ObservabilitySink, SinkSettings};
use crate::router::{DecisionRouter, FeatureSet, Predictor, RouterSettings};
use crate::window::WindowStore;

/// The four stages, built and ready to run
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<ContractRegistry>,
    topics: Topics,
    aggregator: Arc<ContextAggregator>,
    router: Arc<DecisionRouter>,
    dispatcher: Arc<ActionDispatcher>,
    sink: Arc<ObservabilitySink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ContractRegistry>,
        features: FeatureSet,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self::with_executor(config, registry, features, predictor, Arc::new(SimulatedExecutor))
    }

    pub fn with_executor(
        config: PipelineConfig,
        registry: Arc<ContractRegistry>,
        features: FeatureSet,
        predictor: Arc<dyn Predictor>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let topics = Topics::new(config.topics.clone());

        let aggregator = Arc::new(ContextAggregator::new(
            registry.clone(),
            topics.clone(),
            WindowStore::new(config.buffer_capacity),
            AnomalyDetector::new(config.temperature_threshold, config.vibration_threshold),
            AggregatorSettings::from_config(&config),
        ));

        let router = Arc::new(DecisionRouter::new(
            registry.clone(),
            topics.clone(),
            features,
            predictor,
            RouterSettings {
                agent_id: config.agents.decision.clone(),
                ttl_secs: config.decision_ttl_secs,
            },
        ));

        let dispatcher = Arc::new(ActionDispatcher::new(
            registry.clone(),
            topics.clone(),
            executor,
            DispatcherSettings {
                agent_id: config.agents.action.clone(),
                ttl_secs: config.confirmation_ttl_secs,
            },
        ));

        let sink = Arc::new(ObservabilitySink::new(
            registry.clone(),
            topics.clone(),
            SinkSettings {
                agent_id: config.agents.monitor.clone(),
                retention: ChronoDuration::seconds(config.retention_secs),
            },
        ));

        Self {
            config,
            registry,
            topics,
            aggregator,
            router,
            dispatcher,
            sink,
        }
    }

    /// Subscribe every stage, then start one task per stage
    pub async fn spawn(self, bus: Arc<dyn MessageBus>) -> Result<PipelineHandle, BusError> {
        let ctx = WorkerContext {
            bus: bus.clone(),
            registry: self.registry.clone(),
            topics: self.topics.clone(),
            housekeeping: Duration::from_millis(self.config.housekeeping_ms.max(1)),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Downstream first so nothing upstream publishes into the void
        let sink_sub = bus.subscribe(&self.sink.subscriptions()).await?;
        let dispatcher_sub = bus.subscribe(&self.dispatcher.subscriptions()).await?;
        let router_sub = bus.subscribe(&self.router.subscriptions()).await?;
        let aggregator_sub = bus.subscribe(&self.aggregator.subscriptions()).await?;

        let mut tasks: Vec<(String, JoinHandle<WorkerStats>)> = Vec::with_capacity(4);

        let sink: Arc<dyn Stage> = self.sink.clone();
        tasks.push((
            sink.agent_id().to_string(),
            tokio::spawn(run_stage(sink, ctx.clone(), sink_sub, shutdown_rx.clone())),
        ));

        let dispatcher: Arc<dyn Stage> = self.dispatcher.clone();
        tasks.push((
            dispatcher.agent_id().to_string(),
            tokio::spawn(run_stage(dispatcher, ctx.clone(), dispatcher_sub, shutdown_rx.clone())),
        ));

        let router: Arc<dyn Stage> = self.router.clone();
        tasks.push((
            router.agent_id().to_string(),
            tokio::spawn(run_stage(router, ctx.clone(), router_sub, shutdown_rx.clone())),
        ));

        let aggregator: Arc<dyn Stage> = self.aggregator.clone();
        tasks.push((
            aggregator.agent_id().to_string(),
            tokio::spawn(run_sharded(
                aggregator,
                ctx,
                aggregator_sub,
                shutdown_rx,
                self.config.shards,
                self.config.channel_buffer,
            )),
        ));

        log::info!(
            "Pipeline running: {} aggregation shards, housekeeping every {}ms",
            self.config.shards,
            self.config.housekeeping_ms
        );

        Ok(PipelineHandle {
            shutdown_tx,
            tasks,
            sink: self.sink,
            aggregator: self.aggregator,
        })
    }
}

/// Running pipeline
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<WorkerStats>)>,
    sink: Arc<ObservabilitySink>,
    aggregator: Arc<ContextAggregator>,
}

impl PipelineHandle {
    pub fn sink(&self) -> &ObservabilitySink {
        &self.sink
    }

    pub fn aggregator(&self) -> &ContextAggregator {
        &self.aggregator
    }

    /// Stop every worker (each publishes an offline heartbeat) and collect
    /// their final counters
    pub async fn shutdown(self) -> Vec<(String, WorkerStats)> {
        // Err only means every worker already exited
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for workers to stop on their own (e.g. after the bus closed)
    pub async fn join(self) -> Vec<(String, WorkerStats)> {
        let mut stats = Vec::with_capacity(self.tasks.len());
        for (agent_id, task) in self.tasks {
            match task.await {
                Ok(s) => stats.push((agent_id, s)),
                Err(e) => log::error!("[{}] worker task failed: {}", agent_id, e),
            }
        }
        stats
    }
}
