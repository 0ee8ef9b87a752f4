use std::path::Path;

use rpc_registry::RegistryConfig;
use rpc_registry::services::event::EventBus;
use rpc_registry::services::registry::{RegistryContext, RegistryFactory};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

const CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 优先读配置文件，否则读 REGISTRY_* 环境变量
    let config = if Path::new(CONFIG_FILE).exists() {
        RegistryConfig::load(CONFIG_FILE)?
    } else {
        RegistryConfig::from_env()?
    };

    let context = RegistryContext {
        event_bus: Some(EventBus::default()),
        ..RegistryContext::default()
    };
    let shutdown = context.shutdown.clone();
    let factory = RegistryFactory::new(context);
    let registry = factory.create(config)?;

    registry.init().await?;
    if !registry.start().await? {
        tracing::warn!("Registry did not start");
    }
    tracing::info!(protocol = %registry.config().protocol, "Registry daemon running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.shutdown();
    registry.destroy().await;
    Ok(())
}
