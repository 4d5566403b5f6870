use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use p2p_gossip::config_models::cli_args::Args;
use p2p_gossip::Network;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestNode;

impl TestNode {
    /// Arguments for a node on the local network, listening on a random
    /// loopback port.
    pub fn default_args(name: &str) -> Args {
        Args::parse_from([
            "p2p-gossip",
            "--network",
            "local",
            "--node-name",
            name,
            "--listen-addr",
            "127.0.0.1",
            "--peer-port",
            "0",
            "--ping-interval",
            "1s",
        ])
    }

    /// A randomly named file in the temp directory, so tests can run in
    /// parallel.
    pub fn persist_file() -> PathBuf {
        std::env::temp_dir().join(format!(
            "p2p-gossip-integration-{:016x}.json",
            rand::random::<u64>()
        ))
    }

    pub async fn start_node(args: Args) -> anyhow::Result<Network> {
        let mut network = Network::new(args);
        network.start().await?;
        Ok(network)
    }

    /// Start a node that bootstraps from `seed`.
    pub async fn start_node_with_seed(mut args: Args, seed: SocketAddr) -> anyhow::Result<Network> {
        args.peers = vec![seed];
        Self::start_node(args).await
    }

    /// Wait until `network` has `count` active peers.
    pub async fn wait_for_peers(network: &Network, count: usize) -> anyhow::Result<()> {
        tokio::time::timeout(TIMEOUT, async {
            while network.peers().len() != count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await?;
        Ok(())
    }
}
