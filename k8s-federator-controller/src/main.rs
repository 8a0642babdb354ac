use std::process::exit;

use config::ControllerConfig;
use controller::main_controller;
use env_logger::Env;
use kube::Client;
use log::{error, info};

mod availability;
mod config;
mod controller;
mod events;
mod workqueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    configure_logger();

    let config = get_config();
    let client = create_client().await;

    info!(
        "Starting controller for '{}' host cluster with {} workers...",
        config.host_cluster_name, config.workers
    );

    main_controller(client, config).await
}

fn get_config() -> ControllerConfig {
    match ControllerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Couldn't read controller configuration! {err}");
            exit(7)
        }
    }
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(err) => {
            error!("Couldn't create client! {err:?}");
            exit(6)
        }
    }
}

fn configure_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_module_path(false)
        .init()
}
