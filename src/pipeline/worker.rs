//! Worker loops that drive a stage from its bus subscription
//!
//! Each loop `select!`s between the next message, the housekeeping timer and
//! the shutdown signal. A housekeeping tick runs the stage's own maintenance,
//! refreshes its heartbeat and logs throughput.

use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::heartbeat;
use super::stage::{Stage, StageCounters, WorkerStats};
use crate::bus::{entity_segment, BusError, BusMessage, MessageBus, Subscription, Topics};
use crate::contracts::ContractRegistry;
use crate::messages::AgentStatus;

/// Everything a worker needs besides its stage
#[derive(Clone)]
pub struct WorkerContext {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<ContractRegistry>,
    pub topics: Topics,
    pub housekeeping: Duration,
}

/// Handle one message and publish whatever it produced
async fn process(
    stage: &dyn Stage,
    bus: &dyn MessageBus,
    counters: &StageCounters,
    message: BusMessage,
) {
    counters.record_processed();

    match stage.handle(&message.topic, &message.payload).await {
        Ok(outbound) => {
            for out in outbound {
                match bus.publish(&out.topic, out.payload, out.retain).await {
                    Ok(()) => counters.record_published(),
                    Err(e) => {
                        log::warn!("[{}] publish to {} failed: {}", stage.agent_id(), out.topic, e)
                    }
                }
            }
        }
        Err(e) => {
            counters.record_dropped();
            e.log(stage.agent_id());
        }
    }
}

fn record_lag(stage: &dyn Stage, counters: &StageCounters, skipped: u64) {
    counters.record_lagged(skipped);
    log::warn!("[{}] fell behind, {} messages lost", stage.agent_id(), skipped);
}

fn housekeeping_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(
    stage: &dyn Stage,
    ctx: &WorkerContext,
    counters: &StageCounters,
    last: &mut WorkerStats,
) {
    let now = Utc::now();
    stage.housekeeping(now);
    heartbeat::announce(
        stage,
        ctx.bus.as_ref(),
        &ctx.registry,
        &ctx.topics,
        AgentStatus::Online,
        now,
    )
    .await;

    let stats = counters.snapshot();
    let secs = ctx.housekeeping.as_secs_f64().max(f64::EPSILON);
    log::info!(
        "[{}] {:.1} msg/sec | processed {} dropped {} published {}",
        stage.agent_id(),
        (stats.processed - last.processed) as f64 / secs,
        stats.processed,
        stats.dropped,
        stats.published
    );
    *last = stats;
}

/// Drive `stage` sequentially until shutdown or until the bus closes
pub async fn run_stage(
    stage: Arc<dyn Stage>,
    ctx: WorkerContext,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let counters = StageCounters::default();
    let mut last = WorkerStats::default();
    let mut timer = housekeeping_timer(ctx.housekeeping);

    log::info!(
        "[{}] online, subscribed to {:?}",
        stage.agent_id(),
        subscription.filters()
    );
    heartbeat::announce(
        stage.as_ref(),
        ctx.bus.as_ref(),
        &ctx.registry,
        &ctx.topics,
        AgentStatus::Online,
        Utc::now(),
    )
    .await;

    loop {
        tokio::select! {
            received = subscription.recv() => match received {
                Ok(message) => process(stage.as_ref(), ctx.bus.as_ref(), &counters, message).await,
                Err(BusError::Lagged(skipped)) => record_lag(stage.as_ref(), &counters, skipped),
                Err(e) => {
                    log::warn!("[{}] subscription ended: {}", stage.agent_id(), e);
                    break;
                }
            },

            _ = timer.tick() => {
                tick(stage.as_ref(), &ctx, &counters, &mut last).await;
            }

            _ = shutdown.changed() => break,
        }
    }

    finish(stage.as_ref(), &ctx, &counters).await
}

/// Drive `stage` on `shards` parallel tasks
///
/// Messages are routed by a hash of the topic's last level (the machine id),
/// so one machine is always handled by the same shard, in arrival order,
/// while different machines proceed in parallel.
pub async fn run_sharded(
    stage: Arc<dyn Stage>,
    ctx: WorkerContext,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    shards: usize,
    channel_buffer: usize,
) -> WorkerStats {
    let counters = Arc::new(StageCounters::default());
    let mut last = WorkerStats::default();
    let mut timer = housekeeping_timer(ctx.housekeeping);

    let shards = shards.max(1);
    let mut senders = Vec::with_capacity(shards);
    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(shards);
    for shard in 0..shards {
        let (tx, rx) = mpsc::channel::<BusMessage>(channel_buffer.max(1));
        senders.push(tx);
        tasks.push(tokio::spawn(run_shard(
            shard,
            stage.clone(),
            ctx.bus.clone(),
            counters.clone(),
            rx,
        )));
    }

    log::info!(
        "[{}] online with {} shards, subscribed to {:?}",
        stage.agent_id(),
        shards,
        subscription.filters()
    );
    heartbeat::announce(
        stage.as_ref(),
        ctx.bus.as_ref(),
        &ctx.registry,
        &ctx.topics,
        AgentStatus::Online,
        Utc::now(),
    )
    .await;

    loop {
        tokio::select! {
            received = subscription.recv() => match received {
                Ok(message) => {
                    let shard = shard_for(entity_segment(&message.topic), shards);
                    if senders[shard].send(message).await.is_err() {
                        log::error!("[{}] shard {} is gone", stage.agent_id(), shard);
                        break;
                    }
                }
                Err(BusError::Lagged(skipped)) => record_lag(stage.as_ref(), &counters, skipped),
                Err(e) => {
                    log::warn!("[{}] subscription ended: {}", stage.agent_id(), e);
                    break;
                }
            },

            _ = timer.tick() => {
                let backlog: usize = senders
                    .iter()
                    .map(|tx| tx.max_capacity() - tx.capacity())
                    .sum();
                if backlog > shards * channel_buffer / 2 {
                    log::warn!("[{}] shard backlog high: {} queued", stage.agent_id(), backlog);
                }
                tick(stage.as_ref(), &ctx, &counters, &mut last).await;
            }

            _ = shutdown.changed() => break,
        }
    }

    // Let shards drain what they already accepted
    drop(senders);
    for task in tasks {
        if let Err(e) = task.await {
            log::error!("[{}] shard task failed: {}", stage.agent_id(), e);
        }
    }

    finish(stage.as_ref(), &ctx, &counters).await
}

async fn run_shard(
    shard: usize,
    stage: Arc<dyn Stage>,
    bus: Arc<dyn MessageBus>,
    counters: Arc<StageCounters>,
    mut rx: mpsc::Receiver<BusMessage>,
) {
    while let Some(message) = rx.recv().await {
        process(stage.as_ref(), bus.as_ref(), &counters, message).await;
    }
    log::debug!("[{}] shard {} stopped", stage.agent_id(), shard);
}

pub fn shard_for(entity_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    entity_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn finish(stage: &dyn Stage, ctx: &WorkerContext, counters: &StageCounters) -> WorkerStats {
    heartbeat::announce(
        stage,
        ctx.bus.as_ref(),
        &ctx.registry,
        &ctx.topics,
        AgentStatus::Offline,
        Utc::now(),
    )
    .await;

    let stats = counters.snapshot();
    log::info!(
        "[{}] stopped | processed {} dropped {} published {}",
        stage.agent_id(),
        stats.processed,
        stats.dropped,
        stats.published
    );
    stats
}
