use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use super::network::NetworkId;
use crate::models::peer::handshake_data::HandshakeData;
use crate::models::peer::handshake_data::HandshakeMode;

/// Declarative specification of command-line arguments
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Network namespace to join: `main`, `test`, `local`, a numeric id, or a
    /// custom network name.
    #[clap(long, default_value = "main")]
    pub network: NetworkId,

    /// Identity nonce of this node. Distinguishes multiple nodes behind one
    /// IP address and detects connections to self. Random if not set.
    #[clap(long)]
    pub node_id: Option<u64>,

    /// Name of this node as it appears in logs.
    #[clap(long, default_value = "node0")]
    pub node_name: String,

    /// IP on which to listen for peer connections.
    #[clap(short, long, default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// Port on which to listen for peer connections. Advertised to peers on
    /// every parcel.
    #[clap(long, default_value = "8108")]
    pub peer_port: u16,

    /// Endpoints to bootstrap from, e.g.: --peers 8.8.8.8:8108 --peers 8.8.4.4:1337.
    #[clap(long)]
    pub peers: Vec<SocketAddr>,

    /// IP addresses to ban for the duration of `--manual-ban` on startup.
    /// E.g.: --ban 1.2.3.4 --ban 5.6.7.8.
    #[clap(long)]
    pub ban: Vec<IpAddr>,

    /// Number of outgoing connections this node attempts to maintain.
    #[clap(long, default_value = "32")]
    pub outgoing: usize,

    /// Maximum number of incoming connections this node accepts.
    #[clap(long, default_value = "150")]
    pub incoming: usize,

    /// Number of random peers a broadcast parcel is forwarded to.
    #[clap(long, default_value = "16")]
    pub fanout: usize,

    /// Maximum number of endpoints in a shared peer list, both sent and
    /// accepted.
    #[clap(long, default_value = "128")]
    pub peer_share_amount: usize,

    /// Peers whose quality score drops below this threshold are disconnected
    /// and banned for the duration of `--auto-ban`.
    #[clap(long, default_value = "-20", allow_negative_numbers = true)]
    pub minimum_quality_score: i32,

    /// Maximum number of incoming connections from a single IP. 0 for unlimited.
    #[clap(long, default_value = "0")]
    pub peer_ip_limit_incoming: usize,

    /// Maximum number of outgoing connections to a single IP. 0 for unlimited.
    #[clap(long, default_value = "0")]
    pub peer_ip_limit_outgoing: usize,

    /// Refuse all incoming connections, e.g. when behind a NAT.
    #[clap(long)]
    pub refuse_incoming: bool,

    /// How often a peer is asked for its peer list, and the minimum spacing
    /// between peer list requests a peer may send us.
    #[clap(long, default_value = "3m", value_parser = humantime::parse_duration)]
    pub peer_request_interval: Duration,

    /// File to persist bans and active peers to. Persistence is disabled if
    /// not set.
    #[clap(long)]
    pub persist_file: Option<PathBuf>,

    /// How often state is written to `--persist-file`.
    #[clap(long, default_value = "15m", value_parser = humantime::parse_duration)]
    pub persist_interval: Duration,

    /// Endpoints not seen for this long are dropped from the address book.
    #[clap(long, default_value = "48h", value_parser = humantime::parse_duration)]
    pub peer_age_limit: Duration,

    /// Minimum time between two connection attempts to the same endpoint.
    #[clap(long, default_value = "20s", value_parser = humantime::parse_duration)]
    pub redial_interval: Duration,

    /// Time after the last connection attempt at which the attempt counter
    /// of an endpoint is reset.
    #[clap(long, default_value = "12h", value_parser = humantime::parse_duration)]
    pub redial_reset: Duration,

    /// Number of consecutive failed connection attempts after which an
    /// endpoint is considered unreachable.
    #[clap(long, default_value = "5")]
    pub redial_attempts: u32,

    /// How long an endpoint is not dialed after it disconnected, giving the
    /// remote side time to reconnect on its own.
    #[clap(long, default_value = "3m", value_parser = humantime::parse_duration)]
    pub disconnect_lock: Duration,

    /// Ban duration for manual bans.
    #[clap(long, default_value = "7days", value_parser = humantime::parse_duration)]
    pub manual_ban: Duration,

    /// Ban duration for peers whose quality score dropped too low.
    #[clap(long, default_value = "7days", value_parser = humantime::parse_duration)]
    pub auto_ban: Duration,

    /// Maximum time for the handshake to complete after a connection is
    /// established.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub handshake_timeout: Duration,

    /// Maximum time to establish an outgoing TCP connection.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub dial_timeout: Duration,

    /// Maximum time to read a single parcel. Slower connections are closed.
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub read_deadline: Duration,

    /// Maximum time to write a single parcel. Slower connections are closed.
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub write_deadline: Duration,

    /// Maximum time a connection may stay silent on our side before a ping
    /// is sent.
    #[clap(long, default_value = "15s", value_parser = humantime::parse_duration)]
    pub ping_interval: Duration,

    /// Protocol version this node speaks.
    #[clap(long, default_value = "10")]
    pub protocol_version: u16,

    /// Earliest protocol version accepted from peers.
    #[clap(long, default_value = "9")]
    pub protocol_version_minimum: u16,

    /// Capacity of every parcel queue.
    #[clap(long, default_value = "5000")]
    pub channel_capacity: usize,

    /// Send a dedicated handshake record before any parcel, for peers that
    /// do not understand the piggybacked handshake.
    #[clap(long)]
    pub legacy_handshake: bool,

    /// Send trace events to the tokio-console utility.
    #[clap(long)]
    pub tokio_console: bool,
}

impl Args {
    /// Fix the node id, drawing a random one if none was configured.
    pub fn resolve_node_id(&mut self) -> u64 {
        *self.node_id.get_or_insert_with(rand::random)
    }

    /// The node id. Zero until [`Args::resolve_node_id`] has been called.
    pub fn own_node_id(&self) -> u64 {
        self.node_id.unwrap_or_default()
    }

    pub fn handshake_mode(&self) -> HandshakeMode {
        if self.legacy_handshake {
            HandshakeMode::Legacy
        } else {
            HandshakeMode::Piggybacked
        }
    }

    /// The handshake this node presents to peers.
    pub fn own_handshake_data(&self) -> HandshakeData {
        HandshakeData {
            network: self.network,
            version: self.protocol_version,
            node_id: self.own_node_id(),
            listen_port: self.peer_port.to_string(),
        }
    }

    pub fn get_own_listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.peer_port)
    }
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}
