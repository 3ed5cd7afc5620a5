//! Hoist application master binary
//!
//! Launched by the client CLI inside a resource-manager container; the
//! arguments and environment are the launch contract, not a human
//! interface.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use hoist_am::config::{AmEnvironment, LaunchOptions};
use hoist_am::error::AmError;
use hoist_am::lifecycle::{ApplicationMaster, Tuning};
use hoist_am::resource::{HttpNodeManager, HttpResourceManager};

#[tokio::main]
async fn main() {
    let options = LaunchOptions::parse();

    let log_level = if options.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hoist_am={log_level}").into()),
        )
        .init();

    info!("starting hoist application master v{}", env!("CARGO_PKG_VERSION"));

    match run(options).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("application master failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(options: LaunchOptions) -> Result<i32, AmError> {
    let env = AmEnvironment::from_env()?;

    let rm = Arc::new(HttpResourceManager::new(&options.rm_address)?);
    let nm = Arc::new(HttpNodeManager::new()?);

    let handle = ApplicationMaster::start(options, env, Tuning::default(), rm, nm).await?;
    let outcome = handle.join().await?;

    info!(
        final_status = ?outcome.final_status,
        completed = outcome.gauges.completed,
        failed = outcome.gauges.failed,
        "run finished"
    );
    Ok(outcome.exit_code())
}
