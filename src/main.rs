use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod catalog;
mod config;
mod data_model;
mod ingest;
mod integration_test;
mod metrics;
mod notify;
mod processor;
mod queue;
mod service;
mod tracing;
use tracing::setup_tracing;
mod utils;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config from {}: {err:#}", path.display());
                return;
            }
        },
        None => config::ServerConfig::default(),
    };

    if let Err(e) = setup_tracing(&config) {
        eprintln!("Error setting up tracing: {e:?}");
        return;
    }

    let root_span = info_span!("cipherforge");
    let _guard = root_span.enter();

    let service = match Service::new(config).await {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {:?}", err);
            return;
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {:?}", err);
    }
}
