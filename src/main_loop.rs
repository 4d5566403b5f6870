pub(crate) mod redial;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Result;
use itertools::Itertools;
use rand::seq::IndexedRandom;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use tracing::Instrument;

use self::redial::DialBook;
use crate::config_models::cli_args::Args;
use crate::connect_to_peers::answer_peer;
use crate::connect_to_peers::call_peer;
use crate::models::channel::ApiToMain;
use crate::models::channel::ConnectionEvent;
use crate::models::channel::OutboundParcel;
use crate::models::channel::PeerParcel;
use crate::models::channel::PeerTaskToMain;
use crate::models::channel::TargetSelector;
use crate::models::peer::endpoint::BanTarget;
use crate::models::peer::endpoint::Endpoint;
use crate::models::peer::parcel::Parcel;
use crate::models::peer::parcel::ParcelType;
use crate::models::peer::ConnectionRefusedReason;
use crate::models::peer::PeerSanctionReason;
use crate::models::state::networking_state::NetworkingState;
use crate::peer::Peer;
use crate::util_types::location::locate;

const DIAL_INTERVAL: Duration = Duration::from_secs(1);
const DIRECTORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Source label of endpoints given on the command line.
pub const SEED_SOURCE: &str = "seed";

/// Source label of endpoints returned to the directory after a disconnect.
pub const DISCONNECT_SOURCE: &str = "disconnect";

/// Receiving ends of every channel the controller listens on.
#[derive(Debug)]
pub(crate) struct MainLoopChannels {
    pub peer_task_to_main_rx: mpsc::Receiver<PeerTaskToMain>,
    pub connection_events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub outbound_rx: mpsc::Receiver<OutboundParcel>,
    pub api_to_main_rx: mpsc::UnboundedReceiver<ApiToMain>,
}

/// `MutableMainLoopState` contains the part of the controller's state that
/// only the controller itself sees.
#[derive(Debug)]
struct MutableMainLoopState {
    dial_book: DialBook,

    /// Endpoints with a dial or handshake in flight.
    dialing: HashSet<Endpoint>,
}

impl MutableMainLoopState {
    fn new(args: &Args) -> Self {
        Self {
            dial_book: DialBook::from_args(args),
            dialing: HashSet::new(),
        }
    }
}

/// The membership controller. The only writer of the peer registry and the
/// endpoint directory.
#[derive(Debug)]
pub(crate) struct MainLoopHandler {
    args: Arc<Args>,
    state: NetworkingState,
    peer_task_to_main_tx: mpsc::Sender<PeerTaskToMain>,
    connection_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    to_application_tx: mpsc::Sender<PeerParcel>,
}

/// Pick up to `fanout` distinct items uniformly at random.
pub(crate) fn select_fanout<T: Clone, R: Rng + ?Sized>(
    items: &[T],
    fanout: usize,
    rng: &mut R,
) -> Vec<T> {
    items.choose_multiple(rng, fanout).cloned().collect()
}

/// Resolve a target selector against the active peers.
pub(crate) fn select_targets<R: Rng + ?Sized>(
    peers: &[Arc<Peer>],
    target: &TargetSelector,
    fanout: usize,
    rng: &mut R,
) -> Vec<Arc<Peer>> {
    match target {
        TargetSelector::Broadcast => select_fanout(peers, fanout, rng),
        TargetSelector::FullBroadcast => peers.to_vec(),
        TargetSelector::RandomPeer => select_fanout(peers, 1, rng),
        TargetSelector::Peer(hash) => peers
            .iter()
            .filter(|peer| peer.hash() == hash)
            .cloned()
            .collect(),
    }
}

impl MainLoopHandler {
    pub(crate) fn new(
        args: Arc<Args>,
        state: NetworkingState,
        peer_task_to_main_tx: mpsc::Sender<PeerTaskToMain>,
        connection_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        to_application_tx: mpsc::Sender<PeerParcel>,
    ) -> Self {
        Self {
            args,
            state,
            peer_task_to_main_tx,
            connection_events_tx,
            to_application_tx,
        }
    }

    /// Seed the directory from persisted state, `--peers` and `--ban`.
    pub(crate) fn bootstrap(&self) {
        self.state.restore(&self.args);

        for seed in &self.args.peers {
            self.state.directory.register((*seed).into(), SEED_SOURCE);
        }

        let until = SystemTime::now() + self.args.manual_ban;
        for ip in &self.args.ban {
            self.state.directory.ban(BanTarget::Ip(*ip), until);
        }
        info!(
            "Directory bootstrapped with {} endpoints and {} bans",
            self.state.directory.len(),
            self.state.directory.bans().len()
        );
    }

    fn new_peer(&self, connected_address: SocketAddr, candidate: Endpoint, incoming: bool) -> Arc<Peer> {
        Peer::new(
            Arc::clone(&self.args),
            connected_address,
            candidate,
            incoming,
            self.peer_task_to_main_tx.clone(),
            self.connection_events_tx.clone(),
        )
    }

    fn active_peers(&self) -> Vec<Arc<Peer>> {
        self.state
            .registry
            .snapshot()
            .iter()
            .filter(|peer| peer.is_active())
            .cloned()
            .collect()
    }

    /// Our own listen endpoint, seen from this host.
    fn is_own_endpoint(&self, endpoint: &Endpoint) -> bool {
        endpoint.port == self.args.peer_port
            && (endpoint.address.is_loopback()
                || endpoint.address.is_unspecified()
                || endpoint.address == self.args.listen_addr)
    }

    /// Check if an incoming connection is allowed, before any handshake.
    fn check_incoming(&self, address: SocketAddr) -> Result<(), ConnectionRefusedReason> {
        if self.args.refuse_incoming {
            return Err(ConnectionRefusedReason::RefuseIncoming);
        }

        if self.state.directory.is_ip_banned(address.ip()) {
            return Err(ConnectionRefusedReason::Banned);
        }

        if self.state.registry.incoming() >= self.args.incoming {
            return Err(ConnectionRefusedReason::MaxIncomingExceeded);
        }

        let limit = self.args.peer_ip_limit_incoming;
        if limit > 0 && self.state.registry.count_for_address(address.ip()) >= limit {
            return Err(ConnectionRefusedReason::IpLimitExceeded);
        }

        Ok(())
    }

    fn handle_incoming_connection(&self, stream: TcpStream, address: SocketAddr) {
        if let Err(reason) = self.check_incoming(address) {
            info!("Refusing incoming connection from {address}: {reason}");
            return;
        }

        let peer = self.new_peer(address, address.into(), true);
        let span = peer.span().clone();
        tokio::spawn(answer_peer(stream, peer, self.connection_events_tx.clone()).instrument(span));
    }

    /// Endpoints to dial now, preferring locations no active peer is in.
    fn dial_candidates(
        &self,
        main_loop_state: &mut MutableMainLoopState,
        now: SystemTime,
    ) -> Vec<Endpoint> {
        let busy = self.state.registry.outgoing() + main_loop_state.dialing.len();
        let wanted = self.args.outgoing.saturating_sub(busy);
        if wanted == 0 {
            return vec![];
        }

        let active = self.state.registry.snapshot();
        let connected: HashSet<Endpoint> = active
            .iter()
            .flat_map(|peer| {
                let dialed = (!peer.is_incoming()).then(|| peer.candidate());
                std::iter::once(peer.endpoint()).chain(dialed)
            })
            .collect();
        let mut used_locations: HashSet<u32> = active
            .iter()
            .filter_map(|peer| locate(&peer.ip().to_string()).ok())
            .collect();

        let ip_limit = self.args.peer_ip_limit_outgoing;
        let mut candidates = self
            .state
            .directory
            .snapshot()
            .into_iter()
            .filter(|endpoint| {
                endpoint.is_dialable()
                    && !self.is_own_endpoint(endpoint)
                    && !connected.contains(endpoint)
                    && !main_loop_state.dialing.contains(endpoint)
                    && !self.state.directory.is_banned_at(endpoint, now)
                    && !self.state.directory.is_locked_at(endpoint, now)
                    && (ip_limit == 0
                        || self.state.registry.count_for_address(endpoint.address) < ip_limit)
            })
            .collect_vec();
        candidates.retain(|endpoint| main_loop_state.dial_book.may_dial(endpoint, now));
        candidates.shuffle(&mut rand::rng());

        let mut diverse = vec![];
        let mut others = vec![];
        for endpoint in candidates {
            match locate(&endpoint.address.to_string()) {
                Ok(location) if used_locations.insert(location) => diverse.push(endpoint),
                _ => others.push(endpoint),
            }
        }

        diverse.into_iter().chain(others).take(wanted).collect()
    }

    /// Connect to more peers if below the outgoing target.
    fn peer_discovery_and_reconnector(&self, main_loop_state: &mut MutableMainLoopState) {
        let candidates = self.dial_candidates(main_loop_state, SystemTime::now());
        if candidates.is_empty() {
            return;
        }

        debug!("Dialing {} candidates", candidates.len());
        for endpoint in candidates {
            main_loop_state.dialing.insert(endpoint);
            let peer = self.new_peer(endpoint.socket_addr(), endpoint, false);
            let span = peer.span().clone();
            tokio::spawn(
                call_peer(endpoint, peer, self.connection_events_tx.clone()).instrument(span),
            );
        }
    }

    fn handle_connection_event(
        &self,
        event: ConnectionEvent,
        main_loop_state: &mut MutableMainLoopState,
    ) {
        trace!("Connection event: {}", event.get_type());
        match event {
            ConnectionEvent::Activated(peer) => self.handle_activated(peer, main_loop_state),
            ConnectionEvent::DialFailed {
                endpoint,
                self_connect,
            } => {
                main_loop_state.dialing.remove(&endpoint);
                if self_connect {
                    info!("{endpoint} is this node. Forgetting it");
                    self.state.directory.deregister(&endpoint);
                    return;
                }

                let failures = main_loop_state
                    .dial_book
                    .record_failure(endpoint, SystemTime::now());
                if main_loop_state.dial_book.is_abandoned(&endpoint) {
                    info!("Giving up on {endpoint} after {failures} failed attempts");
                }
            }
            ConnectionEvent::Disconnected(peer) => self.handle_disconnected(&peer),
        }
    }

    fn handle_activated(&self, peer: Arc<Peer>, main_loop_state: &mut MutableMainLoopState) {
        if !peer.is_incoming() {
            main_loop_state.dialing.remove(&peer.candidate());
            main_loop_state.dial_book.record_success(&peer.candidate());
        }

        if peer.is_stopped() {
            debug!("Peer {} stopped before it was registered", peer.hash());
            return;
        }

        let endpoint = peer.endpoint();
        if self.state.directory.is_banned(&endpoint) {
            info!("Disconnecting banned peer {}", peer.hash());
            peer.stop(false);
            return;
        }

        if peer.is_incoming()
            && self.state.registry.get(peer.hash()).is_none()
            && self.state.registry.incoming() >= self.args.incoming
        {
            info!("Incoming limit reached. Disconnecting {}", peer.hash());
            peer.stop(false);
            return;
        }

        if let Some(displaced) = self.state.registry.upsert(Arc::clone(&peer)) {
            if !Arc::ptr_eq(&displaced, &peer) {
                info!("Replacing connection to {}", displaced.hash());
                displaced.stop(false);
            }
        }
        self.state.directory.deregister(&endpoint);
        if !peer.is_incoming() && peer.candidate() != endpoint {
            self.state.directory.deregister(&peer.candidate());
        }

        info!(
            "Connected to {}. {} incoming, {} outgoing",
            peer.hash(),
            self.state.registry.incoming(),
            self.state.registry.outgoing()
        );
    }

    fn handle_disconnected(&self, peer: &Arc<Peer>) {
        if !self.state.registry.remove(peer) {
            trace!("Ignoring disconnect of unregistered peer {}", peer.hash());
            return;
        }

        let endpoint = peer.endpoint();
        if endpoint.is_dialable() && !self.state.directory.is_banned(&endpoint) {
            self.state.directory.register(endpoint, DISCONNECT_SOURCE);
            self.state
                .directory
                .lock(&endpoint, self.args.disconnect_lock);
        }

        info!(
            "Disconnected from {}. {} peers left",
            peer.hash(),
            self.state.registry.len()
        );
    }

    fn handle_peer_task_message(&self, msg: PeerTaskToMain) {
        trace!("Received {} from peer task", msg.get_type());
        let PeerTaskToMain::Parcel { peer, parcel } = msg;

        match parcel.parcel_type() {
            ParcelType::Ping => {
                if let Err(err) = peer.send(Parcel::new(ParcelType::Pong, vec![])) {
                    debug!("Could not answer ping from {}: {err}", peer.hash());
                }
            }
            ParcelType::Pong => {}
            ParcelType::PeerRequest => self.share_peers(&peer),
            ParcelType::PeerResponse => self.process_peer_list(&peer, &parcel.payload),
            _ => {
                let delivery = PeerParcel {
                    origin: peer.hash().to_string(),
                    parcel: *parcel,
                };
                match self.to_application_tx.try_send(delivery) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!(
                            "Application queue full, dropping {} parcel from {}",
                            dropped.parcel.parcel_type(),
                            dropped.origin
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Application stopped listening, dropping parcel");
                    }
                }
            }
        }
    }

    /// Answer a peer request with a shuffled sample of known endpoints.
    fn share_peers(&self, peer: &Arc<Peer>) {
        if !peer.allow_peer_request(self.args.peer_request_interval) {
            self.sanction_peer(peer, PeerSanctionReason::PeerRequestFlood);
            return;
        }

        let requester = peer.endpoint();
        let active = self.active_peers();
        let mut endpoints = self
            .state
            .directory
            .snapshot()
            .into_iter()
            .chain(active.iter().map(|active_peer| active_peer.endpoint()))
            .filter(|endpoint| {
                *endpoint != requester
                    && endpoint.is_dialable()
                    && !self.state.directory.is_banned(endpoint)
            })
            .unique()
            .collect_vec();
        endpoints.shuffle(&mut rand::rng());
        endpoints.truncate(self.args.peer_share_amount);

        let payload = match bincode::serialize(&endpoints) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to encode peer list: {err}");
                return;
            }
        };
        debug!("Sharing {} endpoints with {}", endpoints.len(), peer.hash());
        if let Err(err) = peer.send(Parcel::new(ParcelType::PeerResponse, payload)) {
            debug!("Could not share peers with {}: {err}", peer.hash());
        }
    }

    /// Register the endpoints a peer shared with us.
    fn process_peer_list(&self, peer: &Arc<Peer>, payload: &[u8]) {
        let endpoints: Vec<Endpoint> = match bincode::deserialize(payload) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                debug!("Undecodable peer list from {}: {err}", peer.hash());
                self.sanction_peer(peer, PeerSanctionReason::InvalidPeerList);
                return;
            }
        };

        if endpoints.len() > self.args.peer_share_amount {
            self.sanction_peer(peer, PeerSanctionReason::FloodPeerListResponse);
            return;
        }

        let source = peer.hash().to_string();
        let mut registered = 0;
        for endpoint in endpoints
            .into_iter()
            .filter(|endpoint| endpoint.is_dialable() && !self.is_own_endpoint(endpoint))
        {
            self.state.directory.register(endpoint, &source);
            registered += 1;
        }
        debug!("Learned {registered} endpoints from {source}");
    }

    /// Lower a peer's quality score, and evict it if it drops below the
    /// minimum.
    fn sanction_peer(&self, peer: &Arc<Peer>, reason: PeerSanctionReason) {
        let quality = peer.adjust_quality(-reason.to_severity());
        warn!(
            "Sanctioning peer {} for {reason}. Quality is now {quality}",
            peer.hash()
        );
        if quality < self.args.minimum_quality_score {
            self.evict(peer);
        }
    }

    /// Stop and remove a peer, and ban its IP for the auto ban duration.
    fn evict(&self, peer: &Arc<Peer>) {
        let until = SystemTime::now() + self.args.auto_ban;
        warn!(
            "Evicting peer {} with quality {}. Banning {} for {}",
            peer.hash(),
            peer.quality(),
            peer.ip(),
            humantime::format_duration(self.args.auto_ban)
        );
        peer.stop(false);
        self.state.registry.remove(peer);
        self.state.directory.ban(BanTarget::Ip(peer.ip()), until);
    }

    fn handle_outbound(&self, outbound: OutboundParcel) {
        let targets = select_targets(
            &self.active_peers(),
            &outbound.target,
            self.args.fanout,
            &mut rand::rng(),
        );
        if targets.is_empty() {
            debug!("No active peer for parcel to {:?}", outbound.target);
            return;
        }

        for peer in targets {
            if let Err(err) = peer.send(outbound.parcel.clone()) {
                warn!("Failed to send parcel to {}: {err}", peer.hash());
            }
        }
    }

    fn handle_api_message(&self, msg: ApiToMain) {
        match msg {
            ApiToMain::Ban(target) => {
                let until = SystemTime::now() + self.args.manual_ban;
                info!(
                    "Banning {target} for {}",
                    humantime::format_duration(self.args.manual_ban)
                );
                self.state.directory.ban(target, until);

                for peer in self.state.registry.snapshot().iter() {
                    if target.covers(&peer.endpoint()) {
                        peer.stop(false);
                        self.state.registry.remove(peer);
                    }
                }
            }
            ApiToMain::Unban(target) => {
                if self.state.directory.unban(&target) {
                    info!("Lifted ban on {target}");
                } else {
                    debug!("No ban on {target} to lift");
                }
            }
        }
    }

    /// Ask a random peer for more endpoints while below the outgoing target.
    fn request_peers(&self) {
        if self.state.registry.outgoing() >= self.args.outgoing {
            return;
        }

        let Some(peer) = self.active_peers().choose(&mut rand::rng()).cloned() else {
            return;
        };
        debug!("Requesting peers from {}", peer.hash());
        if let Err(err) = peer.send(Parcel::new(ParcelType::PeerRequest, vec![])) {
            debug!("Could not request peers from {}: {err}", peer.hash());
        }
    }

    fn graceful_shutdown(&self) {
        if let Err(err) = self.state.persist(&self.args) {
            warn!("Failed to persist state on shutdown: {err:#}");
        }

        for peer in self.state.registry.snapshot().iter() {
            peer.stop(false);
        }
    }

    pub(crate) async fn run(
        self,
        incoming_peer_listener: TcpListener,
        mut channels: MainLoopChannels,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut main_loop_state = MutableMainLoopState::new(&self.args);

        // All timers must be reset every time they have run. Dialing starts
        // right away.
        let dial_timer = time::sleep(Duration::ZERO);
        tokio::pin!(dial_timer);

        let cleanup_timer = time::sleep(DIRECTORY_CLEANUP_INTERVAL);
        tokio::pin!(cleanup_timer);

        let persist_interval = self.args.persist_interval;
        let persist_timer = time::sleep(persist_interval);
        tokio::pin!(persist_timer);

        let peer_request_interval = self.args.peer_request_interval;
        let peer_request_timer = time::sleep(peer_request_interval);
        tokio::pin!(peer_request_timer);

        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("Shutting down controller");
                    break;
                }

                // Handle incoming connections from peers
                accepted = incoming_peer_listener.accept() => match accepted {
                    Ok((stream, address)) => self.handle_incoming_connection(stream, address),
                    Err(err) => warn!("Failed to accept incoming connection: {err}"),
                },

                Some(event) = channels.connection_events_rx.recv() => {
                    self.handle_connection_event(event, &mut main_loop_state);
                }

                Some(msg) = channels.peer_task_to_main_rx.recv() => {
                    self.handle_peer_task_message(msg);
                }

                Some(outbound) = channels.outbound_rx.recv() => {
                    self.handle_outbound(outbound);
                }

                Some(msg) = channels.api_to_main_rx.recv() => {
                    self.handle_api_message(msg);
                }

                _ = &mut dial_timer => {
                    self.peer_discovery_and_reconnector(&mut main_loop_state);
                    dial_timer.as_mut().reset(time::Instant::now() + DIAL_INTERVAL);
                }

                _ = &mut cleanup_timer => {
                    let removed = self.state.directory.cleanup(self.args.peer_age_limit);
                    let forgotten = main_loop_state.dial_book.prune(SystemTime::now());
                    debug!("Timer: cleanup removed {removed} directory entries and {forgotten} dial records");
                    cleanup_timer.as_mut().reset(time::Instant::now() + DIRECTORY_CLEANUP_INTERVAL);
                }

                _ = &mut persist_timer => {
                    if let Err(err) = self.state.persist(&self.args) {
                        warn!("Failed to persist state: {err:#}");
                    }
                    persist_timer.as_mut().reset(time::Instant::now() + persist_interval);
                }

                _ = &mut peer_request_timer => {
                    self.request_peers();
                    peer_request_timer.as_mut().reset(time::Instant::now() + peer_request_interval);
                }
            }
        }

        self.graceful_shutdown();
        info!("Shutdown completed.");
        Ok(())
    }
}
