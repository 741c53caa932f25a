//! Pipeline Runtime
//!
//! Runs all four stages on an in-process bus and feeds it raw readings, one
//! JSON object per line, from stdin.
//!
//! Usage:
//!   data_source | cargo run --release --bin pipeline_runtime
//!
//! Configuration comes from `SENSORFLOW_*` environment variables (a `.env`
//! file is honoured); see `PipelineConfig::from_env`. `RUST_LOG` controls
//! logging.

use dotenv::dotenv;
use env_logger::Env;
use log::{error, info, warn};
use sensorflow::bus::{InMemoryBus, MessageBus, Topics};
use sensorflow::contracts::{ContractRegistry, ALL_CONTRACTS};
use sensorflow::router::load_predictor;
use sensorflow::{Pipeline, PipelineConfig};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("Pipeline Runtime v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;

    // Startup failures below are fatal: nothing can run without contracts
    // and a predictor
    let registry = match &config.schema_dir {
        Some(dir) => {
            info!("Loading contracts from {}", dir.display());
            ContractRegistry::load_dir(dir)?
        }
        None => ContractRegistry::builtin()?,
    };
    registry.require(&ALL_CONTRACTS)?;
    for name in ALL_CONTRACTS {
        info!("Contract {} accepted at v{}", name, registry.version_of(name));
    }
    let registry = Arc::new(registry);

    let (features, predictor) = load_predictor(&config)?;
    info!(
        "Predictor: {} over {:?}",
        predictor.name(),
        features.names()
    );

    info!("Configuration:");
    info!(
        "   ├─ Windows: temp {}s / vibration {}s / power {}s",
        config.temperature_window_secs, config.vibration_window_secs, config.power_window_secs
    );
    info!(
        "   ├─ Thresholds: temp > {} / vibration > {}",
        config.temperature_threshold, config.vibration_threshold
    );
    info!("   ├─ Buffer: {} readings per machine", config.buffer_capacity);
    info!("   └─ Shards: {}", config.shards);

    let bus = InMemoryBus::new(config.channel_buffer);
    let topics = Topics::new(config.topics.clone());

    let pipeline = Pipeline::new(config, registry, features, predictor);
    let handle = pipeline.spawn(Arc::new(bus.clone())).await?;

    let feeder_bus = bus.clone();
    let feeder = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut fed = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    // Topic only; the aggregator decides whether the reading is valid
                    let entity = serde_json::from_str::<Value>(&line)
                        .ok()
                        .and_then(|v| {
                            v.get("machine_id")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .filter(|id| !id.is_empty() && !id.contains(['/', '+', '#']))
                        .unwrap_or_else(|| "unidentified".to_string());

                    if let Err(e) = feeder_bus
                        .publish(&topics.raw(&entity), line.into_bytes(), false)
                        .await
                    {
                        warn!("Reading not published: {}", e);
                        break;
                    }
                    fed += 1;
                }
                Ok(None) => {
                    info!("stdin closed after {} readings", fed);
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    info!("Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down..."),
        Err(err) => error!("Failed to listen for CTRL+C: {}", err),
    }

    feeder.abort();
    for (agent_id, stats) in handle.shutdown().await {
        info!(
            "   {}: processed {} dropped {} published {}",
            agent_id, stats.processed, stats.dropped, stats.published
        );
    }
    bus.close();

    info!("Pipeline runtime stopped");
    Ok(())
}
