pub mod endpoint;
pub mod handshake_data;
pub mod parcel;

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use self::endpoint::Endpoint;
use self::handshake_data::HandshakeData;
use self::parcel::Parcel;

const FLOODED_PEER_LIST_RESPONSE_SEVERITY: i32 = 2;
const INVALID_PEER_LIST_SEVERITY: i32 = 5;
const PEER_REQUEST_FLOOD_SEVERITY: i32 = 1;

/// A record on the wire. The handshake record is only exchanged in legacy
/// mode, exactly once per direction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerMessage {
    Handshake(Box<HandshakeData>),
    Parcel(Box<Parcel>),
}

impl PeerMessage {
    pub fn get_type(&self) -> String {
        match self {
            PeerMessage::Handshake(_) => "handshake".to_string(),
            PeerMessage::Parcel(parcel) => parcel.parcel_type().to_string(),
        }
    }
}

/// Lifecycle of a single connection. A stopped peer is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Blank,
    Handshaking,
    Active,
    Stopped,
}

/// Reasons an inbound socket is closed before any handshake is attempted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionRefusedReason {
    #[error("address is banned")]
    Banned,

    #[error("incoming connections are refused")]
    RefuseIncoming,

    #[error("maximum number of incoming connections reached")]
    MaxIncomingExceeded,

    #[error("too many connections from this IP")]
    IpLimitExceeded,
}

/// Protocol misbehavior detected by the controller. Each reason lowers the
/// quality score of the offending peer by its severity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerSanctionReason {
    FloodPeerListResponse,
    InvalidPeerList,
    PeerRequestFlood,
}

impl Display for PeerSanctionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = match self {
            PeerSanctionReason::FloodPeerListResponse => "flood peer list response",
            PeerSanctionReason::InvalidPeerList => "invalid peer list",
            PeerSanctionReason::PeerRequestFlood => "peer request flood",
        };
        write!(f, "{string}")
    }
}

impl PeerSanctionReason {
    pub fn to_severity(self) -> i32 {
        match self {
            PeerSanctionReason::FloodPeerListResponse => FLOODED_PEER_LIST_RESPONSE_SEVERITY,
            PeerSanctionReason::InvalidPeerList => INVALID_PEER_LIST_SEVERITY,
            PeerSanctionReason::PeerRequestFlood => PEER_REQUEST_FLOOD_SEVERITY,
        }
    }
}

/// Traffic counters of one connection.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMetrics {
    pub connected: Option<SystemTime>,
    pub last_send: Option<SystemTime>,
    pub last_receive: Option<SystemTime>,
    pub parcels_sent: u64,
    pub parcels_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PeerMetrics {
    pub fn record_send(&mut self, bytes: u64) {
        self.last_send = Some(SystemTime::now());
        self.parcels_sent += 1;
        self.bytes_sent += bytes;
    }

    pub fn record_receive(&mut self, bytes: u64) {
        self.last_receive = Some(SystemTime::now());
        self.parcels_received += 1;
        self.bytes_received += bytes;
    }
}

/// Point-in-time view of a connected peer, as handed to the application.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub hash: String,
    pub endpoint: Endpoint,
    pub connected_address: SocketAddr,
    pub node_id: u64,
    pub version: u16,
    pub incoming: bool,
    pub quality: i32,
    pub metrics: PeerMetrics,
}
