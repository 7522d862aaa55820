//! Aura telemetry agent binary: loads configuration, then hands control to
//! the supervisor, which owns the pipeline for the life of the process.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aura_agent::config::AgentConfig;
use aura_agent::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing from RUST_LOG (e.g., RUST_LOG=info or debug).
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AgentConfig::load()?;
    Supervisor::run(cfg).await
}
