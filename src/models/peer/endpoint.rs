use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A dialable address: IP plus the port the node listens on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Port zero can never be dialed.
    pub fn is_dialable(&self) -> bool {
        self.port != 0 && !self.address.is_unspecified()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip(), value.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// What a ban applies to: every port of an IP, or a single endpoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum BanTarget {
    Ip(IpAddr),
    Endpoint(Endpoint),
}

impl BanTarget {
    /// Whether this ban covers the given endpoint.
    pub fn covers(&self, endpoint: &Endpoint) -> bool {
        match self {
            BanTarget::Ip(ip) => *ip == endpoint.address,
            BanTarget::Endpoint(banned) => banned == endpoint,
        }
    }
}

impl From<IpAddr> for BanTarget {
    fn from(value: IpAddr) -> Self {
        BanTarget::Ip(value)
    }
}

impl From<Endpoint> for BanTarget {
    fn from(value: Endpoint) -> Self {
        BanTarget::Endpoint(value)
    }
}

impl fmt::Display for BanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanTarget::Ip(ip) => write!(f, "{ip}"),
            BanTarget::Endpoint(endpoint) => write!(f, "{endpoint}"),
        }
    }
}

impl FromStr for BanTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(socket_addr) = s.parse::<SocketAddr>() {
            return Ok(BanTarget::Endpoint(socket_addr.into()));
        }
        s.parse::<IpAddr>()
            .map(BanTarget::Ip)
            .map_err(|_| format!("Failed to parse {} as IP or IP:port", s))
    }
}

impl From<BanTarget> for String {
    fn from(value: BanTarget) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for BanTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
