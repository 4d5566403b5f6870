use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Once;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;
use std::time::SystemTime;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing::Instrument;
use tracing::Span;

use crate::config_models::cli_args::Args;
use crate::connect_to_peers;
use crate::connect_to_peers::HandshakeError;
use crate::connect_to_peers::HandshakeOutcome;
use crate::models::channel::ConnectionEvent;
use crate::models::channel::PeerTaskToMain;
use crate::models::peer::endpoint::Endpoint;
use crate::models::peer::parcel::Parcel;
use crate::models::peer::PeerInfo;
use crate::models::peer::PeerMetrics;
use crate::models::peer::PeerState;
use crate::peer_loop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerSendError {
    #[error("peer is not active")]
    NotActive,

    #[error("outbound queue is full")]
    QueueFull,
}

/// Identity a peer asserts during the handshake.
#[derive(Debug, Clone)]
struct PeerIdentity {
    hash: String,
    endpoint: Endpoint,
    node_id: u64,
    version: u16,
}

/// The identity hash of a connection: remote address, remote listen port
/// and remote node id.
pub fn peer_hash(endpoint: &Endpoint, node_id: u64) -> String {
    format!("{} {:016x}", endpoint, node_id)
}

/// One connection to a remote node.
///
/// The socket is owned by the two pumps spawned on activation; everything
/// else talks to the remote through [`Peer::send`].
#[derive(Debug)]
pub struct Peer {
    args: Arc<Args>,
    connected_address: SocketAddr,
    candidate: Endpoint,
    incoming: bool,
    placeholder_hash: String,
    identity: OnceLock<PeerIdentity>,

    state: Mutex<PeerState>,
    quality: AtomicI32,
    metrics: RwLock<PeerMetrics>,
    peer_requests: Mutex<PeerRequestPacing>,

    send_tx: Mutex<Option<mpsc::Sender<Parcel>>>,
    to_main: mpsc::Sender<PeerTaskToMain>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
    stopper: Once,
    span: Span,
}

/// When the remote last asked for our peer list. The request carried by a
/// piggybacked handshake does not start the clock.
#[derive(Debug, Default)]
struct PeerRequestPacing {
    handshake_request_pending: bool,
    last: Option<Instant>,
}

impl Peer {
    /// Create a blank peer for a socket that is about to be handshaked.
    /// `candidate` is the endpoint that was dialed, or the socket address
    /// for incoming connections.
    pub(crate) fn new(
        args: Arc<Args>,
        connected_address: SocketAddr,
        candidate: Endpoint,
        incoming: bool,
        to_main: mpsc::Sender<PeerTaskToMain>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let span = tracing::info_span!(
            "peer",
            address = %connected_address,
            incoming,
            hash = tracing::field::Empty
        );
        Arc::new(Self {
            args,
            connected_address,
            candidate,
            incoming,
            placeholder_hash: format!("pending {:016x}", rand::random::<u64>()),
            identity: OnceLock::new(),
            state: Mutex::new(PeerState::Blank),
            quality: AtomicI32::new(0),
            metrics: RwLock::new(PeerMetrics::default()),
            peer_requests: Mutex::new(PeerRequestPacing::default()),
            send_tx: Mutex::new(None),
            to_main,
            events,
            cancel: CancellationToken::new(),
            stopper: Once::new(),
            span,
        })
    }

    pub fn hash(&self) -> &str {
        self.identity
            .get()
            .map(|identity| identity.hash.as_str())
            .unwrap_or(&self.placeholder_hash)
    }

    /// The endpoint this peer listens on. Before the handshake this is the
    /// dialed endpoint, or the socket address of an incoming connection.
    pub fn endpoint(&self) -> Endpoint {
        self.identity
            .get()
            .map(|identity| identity.endpoint)
            .unwrap_or(self.candidate)
    }

    /// The endpoint that was dialed, or the socket address of an incoming
    /// connection.
    pub(crate) fn candidate(&self) -> Endpoint {
        self.candidate
    }

    pub fn ip(&self) -> IpAddr {
        self.connected_address.ip()
    }

    pub fn connected_address(&self) -> SocketAddr {
        self.connected_address
    }

    pub fn node_id(&self) -> Option<u64> {
        self.identity.get().map(|identity| identity.node_id)
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn state(&self) -> PeerState {
        *self.state_guard()
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == PeerState::Stopped
    }

    pub fn quality(&self) -> i32 {
        self.quality.load(Ordering::SeqCst)
    }

    /// Change the quality score and return the new value.
    pub fn adjust_quality(&self, delta: i32) -> i32 {
        self.quality.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn metrics(&self) -> PeerMetrics {
        *self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            hash: self.hash().to_string(),
            endpoint: self.endpoint(),
            connected_address: self.connected_address,
            node_id: self.node_id().unwrap_or_default(),
            version: self.identity.get().map(|i| i.version).unwrap_or_default(),
            incoming: self.incoming,
            quality: self.quality(),
            metrics: self.metrics(),
        }
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn args(&self) -> &Args {
        &self.args
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Run the handshake over `stream` and, on success, start the inbound and
    /// outbound pumps. On failure the peer is stopped without asking for
    /// registry removal, since it was never registered.
    pub(crate) async fn activate<S>(self: &Arc<Self>, stream: S) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.transition(PeerState::Blank, PeerState::Handshaking) {
            return Err(HandshakeError::Closed);
        }

        let mut connection = connect_to_peers::frame(stream);
        let handshake = tokio::time::timeout(
            self.args.handshake_timeout,
            connect_to_peers::handshake(&mut connection, &self.args),
        );
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(HandshakeError::Closed),
            result = handshake => result.unwrap_or(Err(HandshakeError::Timeout)),
        };

        let HandshakeOutcome {
            remote,
            listen_port,
            first_parcel,
        } = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.stop(false);
                return Err(err);
            }
        };

        let (send_tx, send_rx) = mpsc::channel(self.args.channel_capacity);
        self.assume_identity(remote.node_id, listen_port, remote.version);
        *self.send_tx_guard() = Some(send_tx);
        if !self.transition(PeerState::Handshaking, PeerState::Active) {
            self.send_tx_guard().take();
            return Err(HandshakeError::Closed);
        }
        self.metrics_mut().connected = Some(SystemTime::now());
        info!(parent: &self.span, "peer activated, version {}", remote.version);

        let (sink, stream) = connection.split();
        tokio::spawn(peer_loop::inbound_pump(Arc::clone(self), stream).instrument(self.span.clone()));
        tokio::spawn(
            peer_loop::outbound_pump(Arc::clone(self), sink, send_rx).instrument(self.span.clone()),
        );

        if let Some(parcel) = first_parcel {
            self.note_handshake_request();
            let size = bincode::serialized_size(&parcel).unwrap_or_default();
            self.receive(parcel, size);
        }

        Ok(())
    }

    /// Record the identity the remote asserted in its handshake.
    pub(crate) fn assume_identity(&self, node_id: u64, listen_port: u16, version: u16) {
        let endpoint = Endpoint::new(self.connected_address.ip(), listen_port);
        let identity = PeerIdentity {
            hash: peer_hash(&endpoint, node_id),
            endpoint,
            node_id,
            version,
        };
        self.span.record("hash", identity.hash.as_str());
        if self.identity.set(identity).is_err() {
            warn!(parent: &self.span, "peer identity already set");
        }
    }

    /// Queue a parcel for sending. Never waits for queue capacity.
    pub fn send(&self, parcel: Parcel) -> Result<(), PeerSendError> {
        if !self.is_active() {
            return Err(PeerSendError::NotActive);
        }

        match self.send_tx_guard().as_ref() {
            None => Err(PeerSendError::NotActive),
            Some(tx) => tx.try_send(parcel).map_err(|err| match err {
                TrySendError::Full(_) => PeerSendError::QueueFull,
                TrySendError::Closed(_) => PeerSendError::NotActive,
            }),
        }
    }

    /// Account for a successfully decoded inbound parcel and hand it to the
    /// controller. Drops the parcel if the controller is saturated.
    pub(crate) fn receive(self: &Arc<Self>, mut parcel: Parcel, bytes: u64) {
        self.adjust_quality(1);
        self.metrics_mut().record_receive(bytes);
        parcel.header.target_peer = self.hash().to_string();

        let parcel_type = parcel.parcel_type();
        let message = PeerTaskToMain::Parcel {
            peer: Arc::clone(self),
            parcel: Box::new(parcel),
        };
        match self.to_main.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(parent: &self.span, "inbound queue full, dropping {parcel_type} parcel");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(parent: &self.span, "controller gone, dropping {parcel_type} parcel");
            }
        }
    }

    pub(crate) fn record_send(&self, bytes: u64) {
        self.metrics_mut().record_send(bytes);
    }

    /// The next peer request rode on the handshake.
    pub(crate) fn note_handshake_request(&self) {
        self.peer_requests_guard().handshake_request_pending = true;
    }

    /// Returns true and remembers the time if the remote may ask for our
    /// peer list now. Requests closer together than half of `min_interval`
    /// are a flood; the slack absorbs jitter between two periodic requests.
    pub(crate) fn allow_peer_request(&self, min_interval: Duration) -> bool {
        let mut pacing = self.peer_requests_guard();
        if std::mem::take(&mut pacing.handshake_request_pending) {
            return true;
        }

        let now = Instant::now();
        match pacing.last {
            Some(previous) if now.duration_since(previous) < min_interval / 2 => false,
            _ => {
                pacing.last = Some(now);
                true
            }
        }
    }

    /// Tear the connection down. Only the first call has an effect; with
    /// `and_remove` it also asks the controller to drop the peer from the
    /// registry.
    pub fn stop(self: &Arc<Self>, and_remove: bool) {
        self.stopper.call_once(|| {
            *self.state_guard() = PeerState::Stopped;
            self.cancel.cancel();
            self.send_tx_guard().take();
            debug!(parent: &self.span, "peer stopped");

            if and_remove
                && self
                    .events
                    .send(ConnectionEvent::Disconnected(Arc::clone(self)))
                    .is_err()
            {
                debug!(parent: &self.span, "controller gone, not reporting disconnect");
            }
        });
    }

    fn transition(&self, from: PeerState, to: PeerState) -> bool {
        let mut state = self.state_guard();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn state_guard(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_tx_guard(&self) -> MutexGuard<'_, Option<mpsc::Sender<Parcel>>> {
        self.send_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer_requests_guard(&self) -> MutexGuard<'_, PeerRequestPacing> {
        self.peer_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, PeerMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the peer active with an outbound queue that nothing drains.
    #[cfg(test)]
    pub(crate) fn activate_detached(
        &self,
        node_id: u64,
        listen_port: u16,
    ) -> mpsc::Receiver<Parcel> {
        let (send_tx, send_rx) = mpsc::channel(self.args.channel_capacity);
        self.assume_identity(node_id, listen_port, self.args.protocol_version);
        *self.send_tx_guard() = Some(send_tx);
        *self.state_guard() = PeerState::Active;
        send_rx
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tracing_test::traced_test;

    use super::*;
    use crate::models::peer::parcel::ParcelType;
    use crate::tests::shared::get_dummy_socket_address;
    use crate::tests::shared::test_args;
    use crate::tests::shared::TestChannels;

    #[test]
    fn hash_combines_endpoint_and_node_id() {
        let endpoint: Endpoint = get_dummy_socket_address(3).into();
        assert_eq!(
            "123.123.123.3:8108 00000000000000ff",
            peer_hash(&endpoint, 255)
        );
    }

    #[tokio::test]
    async fn send_requires_active_state() {
        let channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        assert_eq!(PeerState::Blank, peer.state());
        assert!(peer.hash().starts_with("pending"));
        assert_eq!(
            Err(PeerSendError::NotActive),
            peer.send(Parcel::message(vec![]))
        );

        let mut rx = peer.activate_detached(7, 8108);
        assert_eq!("123.123.123.0:8108 0000000000000007", peer.hash());
        peer.send(Parcel::message(vec![1])).unwrap();
        assert_eq!(vec![1], rx.recv().await.unwrap().payload);
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let mut args = test_args();
        args.channel_capacity = 1;
        let channels = TestChannels::new();
        let peer = channels.peer(args, get_dummy_socket_address(0), false);
        let _rx = peer.activate_detached(7, 8108);

        peer.send(Parcel::message(vec![1])).unwrap();
        assert_eq!(
            Err(PeerSendError::QueueFull),
            peer.send(Parcel::message(vec![2]))
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_reports_once() {
        let mut channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), true);
        let _rx = peer.activate_detached(7, 8108);

        let mut handles = vec![];
        for _ in 0..8 {
            let peer = Arc::clone(&peer);
            handles.push(tokio::spawn(async move { peer.stop(true) }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        peer.stop(true);

        assert!(peer.is_stopped());
        assert_eq!(
            Err(PeerSendError::NotActive),
            peer.send(Parcel::message(vec![]))
        );

        let mut disconnects = 0;
        while let Ok(event) = channels.events_rx.try_recv() {
            assert!(matches!(event, ConnectionEvent::Disconnected(_)));
            disconnects += 1;
        }
        assert_eq!(1, disconnects);
    }

    #[tokio::test]
    async fn stop_without_removal_is_silent() {
        let mut channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        peer.stop(false);
        peer.stop(true);
        assert!(channels.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn receive_bumps_quality_and_stamps_origin() {
        let mut channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        let _rx = peer.activate_detached(7, 8108);

        peer.receive(Parcel::new(ParcelType::Alert, vec![1, 2]), 30);
        peer.receive(Parcel::message(vec![]), 20);

        assert_eq!(2, peer.quality());
        assert_eq!(50, peer.metrics().bytes_received);
        let PeerTaskToMain::Parcel { parcel, .. } = channels.to_main_rx.recv().await.unwrap();
        assert_eq!(peer.hash(), parcel.header.target_peer);
        assert_eq!(ParcelType::Alert, parcel.parcel_type());
    }

    #[test]
    fn quality_is_not_clamped() {
        let channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        assert_eq!(-50, peer.adjust_quality(-50));
        assert_eq!(-49, peer.adjust_quality(1));
    }

    #[tokio::test]
    async fn peer_requests_are_rate_limited() {
        let channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        assert!(peer.allow_peer_request(Duration::from_secs(60)));
        assert!(!peer.allow_peer_request(Duration::from_secs(60)));
        assert!(peer.allow_peer_request(Duration::ZERO));
    }

    #[tokio::test]
    async fn peer_request_slack_is_half_the_interval() {
        let channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(0), false);
        let interval = Duration::from_millis(200);
        assert!(peer.allow_peer_request(interval));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!peer.allow_peer_request(interval));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(peer.allow_peer_request(interval));
    }

    #[traced_test]
    #[tokio::test]
    async fn handshake_request_does_not_start_the_clock() {
        let (stream, remote_stream) = tokio::io::duplex(1 << 16);
        let channels = TestChannels::new();
        let peer = channels.peer(test_args(), get_dummy_socket_address(2), false);

        let remote = tokio::spawn(async move {
            let mut remote = connect_to_peers::frame(remote_stream);
            let mut request = Parcel::new(ParcelType::PeerRequest, vec![]);
            request
                .header
                .stamp(&crate::tests::shared::test_args_with_node_id(2).own_handshake_data());
            remote
                .send(crate::models::peer::PeerMessage::Parcel(Box::new(request)))
                .await
                .unwrap();
            remote
        });
        peer.activate(stream).await.unwrap();
        let _remote = remote.await.unwrap();

        let interval = Duration::from_secs(60);
        assert!(peer.allow_peer_request(interval));
        assert!(peer.allow_peer_request(interval));
        assert!(!peer.allow_peer_request(interval));
    }

    #[traced_test]
    #[tokio::test]
    async fn saturated_controller_queue_drops_parcels() {
        let (to_main_tx, mut to_main_rx) = mpsc::channel(1);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            Arc::new(test_args()),
            get_dummy_socket_address(0),
            get_dummy_socket_address(0).into(),
            false,
            to_main_tx,
            events_tx,
        );
        let _rx = peer.activate_detached(7, 8108);

        peer.receive(Parcel::message(vec![1]), 10);
        peer.receive(Parcel::message(vec![2]), 10);

        let PeerTaskToMain::Parcel { parcel, .. } = to_main_rx.try_recv().unwrap();
        assert_eq!(vec![1], parcel.payload);
        assert!(to_main_rx.try_recv().is_err());
        assert_eq!(2, peer.quality());
        assert!(logs_contain("inbound queue full, dropping message parcel"));
    }
}
