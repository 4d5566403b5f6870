// If code coverage tool `cargo-llvm-cov` is running with the nightly toolchain,
// enable the unstable “coverage” attribute. This allows using the annotation
// `#[coverage(off)]` to explicitly exclude certain parts of the code from
// being considered as “code under test.”
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config_models;
pub mod connect_to_peers;
mod main_loop;
pub mod models;
pub mod peer;
mod peer_loop;
pub mod util_types;


use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use config_models::cli_args;
use models::channel::ApiToMain;
use models::channel::OutboundParcel;
use models::channel::PeerParcel;
use models::peer::endpoint::BanTarget;
use models::peer::PeerInfo;
use models::state::networking_state::NetworkingState;
use models::state::persist::FileStorage;
use models::state::persist::Storage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::Instrument;

use crate::main_loop::MainLoopChannels;
use crate::main_loop::MainLoopHandler;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Channel ends the controller takes over when the network starts.
#[derive(Debug)]
struct PendingChannels {
    outbound_rx: mpsc::Receiver<OutboundParcel>,
    api_to_main_rx: mpsc::UnboundedReceiver<ApiToMain>,
    to_application_tx: mpsc::Sender<PeerParcel>,
}

/// The gossip network as seen by the rest of the node: an outbound
/// submission point, an inbound delivery point, and start/stop of the
/// controller together with the registry and directory it owns.
#[derive(Debug)]
pub struct Network {
    args: cli_args::Args,
    state: NetworkingState,
    outbound_tx: mpsc::Sender<OutboundParcel>,
    inbound_rx: mpsc::Receiver<PeerParcel>,
    api_to_main_tx: mpsc::UnboundedSender<ApiToMain>,
    pending: Option<PendingChannels>,
    cancel: CancellationToken,
    main_loop: Option<JoinHandle<Result<()>>>,
    local_addr: Option<SocketAddr>,
}

impl Network {
    /// A network persisting to the local file system.
    pub fn new(args: cli_args::Args) -> Self {
        Self::with_storage(args, Arc::new(FileStorage))
    }

    pub fn with_storage(args: cli_args::Args, storage: Arc<dyn Storage>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(args.channel_capacity);
        let (to_application_tx, inbound_rx) = mpsc::channel(args.channel_capacity);
        let (api_to_main_tx, api_to_main_rx) = mpsc::unbounded_channel();

        Self {
            args,
            state: NetworkingState::new(storage),
            outbound_tx,
            inbound_rx,
            api_to_main_tx,
            pending: Some(PendingChannels {
                outbound_rx,
                api_to_main_rx,
                to_application_tx,
            }),
            cancel: CancellationToken::new(),
            main_loop: None,
            local_addr: None,
        }
    }

    /// Bind the listener, seed the directory, and spawn the controller.
    /// A network can be started once.
    pub async fn start(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            bail!("Network was already started");
        };

        let node_id = self.args.resolve_node_id();
        let own_listen_address = self.args.get_own_listen_address();
        let listener = TcpListener::bind(own_listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind to local TCP port {own_listen_address}. Is an instance of this program already running?"
                )
            })?;
        let local_addr = listener.local_addr()?;
        if self.args.peer_port == 0 {
            self.args.peer_port = local_addr.port();
        }
        self.local_addr = Some(local_addr);
        info!(
            "Starting p2p-gossip {VERSION} on {} as node {node_id:016x}, listening on {local_addr}",
            self.args.network
        );

        let args = Arc::new(self.args.clone());
        let (peer_task_to_main_tx, peer_task_to_main_rx) = mpsc::channel(args.channel_capacity);
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();

        let main_loop_handler = MainLoopHandler::new(
            Arc::clone(&args),
            self.state.clone(),
            peer_task_to_main_tx,
            connection_events_tx,
            pending.to_application_tx,
        );
        main_loop_handler.bootstrap();

        let channels = MainLoopChannels {
            peer_task_to_main_rx,
            connection_events_rx,
            outbound_rx: pending.outbound_rx,
            api_to_main_rx: pending.api_to_main_rx,
        };
        let span = tracing::info_span!("network", node = %args.node_name);
        self.main_loop = Some(tokio::spawn(
            main_loop_handler
                .run(listener, channels, self.cancel.clone())
                .instrument(span),
        ));

        Ok(())
    }

    /// Stop the controller and every peer, persisting state on the way out.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(main_loop) = self.main_loop.take() {
            main_loop.await??;
        }
        Ok(())
    }

    /// Submission point for parcels to send.
    pub fn to_network(&self) -> mpsc::Sender<OutboundParcel> {
        self.outbound_tx.clone()
    }

    /// Delivery point for parcels received from peers.
    pub fn from_network(&mut self) -> &mut mpsc::Receiver<PeerParcel> {
        &mut self.inbound_rx
    }

    /// Ban an IP or endpoint for the manual ban duration, disconnecting
    /// every peer the ban covers.
    pub fn ban(&self, target: BanTarget) -> Result<()> {
        self.api_to_main_tx
            .send(ApiToMain::Ban(target))
            .context("Network is not running")
    }

    /// Lift a ban placed on exactly this target. Bans on a covering IP stay.
    pub fn unban(&self, target: BanTarget) -> Result<()> {
        self.api_to_main_tx
            .send(ApiToMain::Unban(target))
            .context("Network is not running")
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.peer_info()
    }

    /// The address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn args(&self) -> &cli_args::Args {
        &self.args
    }
}

/// Run a node until interrupted.
pub async fn initialize(cli_args: cli_args::Args) -> Result<()> {
    let mut network = Network::new(cli_args);
    network.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    network.stop().await
}
