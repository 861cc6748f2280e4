use log::{error, info, warn};
use std::sync::Arc;

use ringdir_node::{AddressBookStorage, Config, LookupNode, RealNetworkClient};

fn load_config() -> Result<Config, ringdir_node::ConfigError> {
    match std::env::var("RINGDIR_CONFIG") {
        Ok(path) => Config::from_file(path),
        Err(_) => Config::from_env(),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let addresses = config.address_book();
    // Without a chunk store every other node in the address book counts as
    // a data node.
    let data_nodes: Vec<_> = addresses
        .keys()
        .copied()
        .filter(|id| *id != config.node_id)
        .collect();
    let (network_client, lost_connections) =
        RealNetworkClient::new(config.node_id, addresses).with_connection_events();
    let network_client = Arc::new(network_client);
    let storage = Arc::new(AddressBookStorage::new(config.node_id, data_nodes));
    let bind_address = config.bind_address.clone();
    let api_port = config.api_port;

    let node = LookupNode::new(config, network_client, storage);
    node.watch_connections(lost_connections);

    // Requests must be served while joining, so the listener starts first.
    let server = node.clone();
    let listener = tokio::spawn(async move { server.start(&bind_address).await });

    if let Err(e) = node.join_overlay().await {
        error!("[{}] Could not join the overlay: {}", node.me, e);
        std::process::exit(1);
    }

    if let Some(port) = api_port {
        let api_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = ringdir_node::api::run(api_node, port).await {
                error!("API server failed: {}", e);
            }
        });
    }

    tokio::select! {
        result = listener => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[{}] Listener failed: {}", node.me, e);
                std::process::exit(1);
            }
            Err(e) => {
                error!("[{}] Listener task failed: {}", node.me, e);
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("[{}] Shutting down", node.me);
            if node.is_last_superpeer().await {
                warn!("[{}] Last reachable superpeer is leaving, the overlay is gone", node.me);
            }
            node.drain_failures().await;
            node.shutdown();
        }
    }
}
