//! The `eidgate` daemon binary.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use eidgate::config::Config;
use eidgate::constants::{EIDGATE_DEFAULT_CONFIG_FILE, EIDGATE_SERVER_APP, EIDGATE_VERSION};
use eidgate::server::manager::GatewayManager;
use eidgate::server::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "eidgate", version, about = "eID gateway credential lifecycle daemon")]
struct Options {
    /// Path to the config file.
    #[arg(short, long, default_value = EIDGATE_DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let options = Options::parse();

    let config = match Config::create(&options.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Invalid configuration '{}': {}", options.config.display(), e);
            exit(1);
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("Cannot set up logging: {e}");
        exit(1);
    }

    info!("{} v{} starting", EIDGATE_SERVER_APP, EIDGATE_VERSION);

    let manager = match GatewayManager::build(config.clone()) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Cannot start: {e}");
            exit(1);
        }
    };

    let scheduler = Scheduler::build(manager, &config);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {e}");
    }

    info!("{EIDGATE_SERVER_APP} shutting down");
    scheduler.abort();
}
