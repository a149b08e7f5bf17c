//! OpenFlow overlay renderer daemon.
//!
//! Loads configuration, wires the registries to the policy manager and keeps
//! the flow store converged until interrupted.

use anyhow::Context;
use clap::Parser;
use ofoverlay_common::{FlowStore, MemoryFlowStore, OrdinalAllocator};
use ofoverlay_renderer::{
    ConfigOverrides, EndpointRegistry, OfContext, PolicyManager, PolicyResolver, RendererConfig,
    StoreConfig, SwitchRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ofoverlayd", version, about = "OpenFlow overlay policy renderer")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RendererConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RendererConfig::default(),
    };
    args.overrides.apply(&mut config);

    init_logging(&config.log_level)?;
    config.validate().context("invalid configuration")?;

    info!("ofoverlayd: Starting policy renderer");
    run(config).await?;
    info!("ofoverlayd: Exiting");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))
}

async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn FlowStore>> {
    match config {
        StoreConfig::Memory => {
            info!("ofoverlayd: Using in-memory flow store");
            Ok(Arc::new(MemoryFlowStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreConfig::Redis(redis) => {
            let store = ofoverlay_common::RedisFlowStore::connect(redis.clone()).await?;
            Ok(Arc::new(store))
        }
    }
}

async fn run(config: RendererConfig) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;

    let switches = Arc::new(SwitchRegistry::new());
    let endpoints = Arc::new(EndpointRegistry::new());
    let policy = Arc::new(PolicyResolver::new());
    let ctx = Arc::new(OfContext::new(
        switches.clone(),
        endpoints.clone(),
        Arc::new(OrdinalAllocator::new()),
    ));

    let manager = PolicyManager::new(&config, ctx, policy.clone(), store)?;
    manager.subscribe_switches(switches.subscribe());
    manager.subscribe_endpoints(endpoints.subscribe());
    manager.subscribe_policy(policy.subscribe());
    manager.schedule_update();
    info!(
        tables = ?manager.table_ids(),
        delay = ?manager.flow_update_delay(),
        "ofoverlayd: Listening for changes"
    );

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("ofoverlayd: Received shutdown signal");
    manager.close().await;
    Ok(())
}
