use serde::Deserialize;
use serde::Serialize;

use super::parcel::ParcelHeader;
use crate::config_models::network::NetworkId;

/// Which handshake generation a node sends when a connection starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// A dedicated handshake record is exchanged before any parcel.
    Legacy,

    /// The handshake rides on the header of the first parcel, a peer
    /// request, saving a round trip.
    #[default]
    Piggybacked,
}

/// Datastruct defining the handshake peers exchange when establishing a new
/// connection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeData {
    pub network: NetworkId,
    pub version: u16,
    pub node_id: u64,

    /// The port the sender listens on. Kept as a string on the wire and
    /// parsed during validation.
    pub listen_port: String,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HandshakeValidationError {
    #[error("connect to self")]
    SelfConnect,

    #[error("remote version ({remote}) is below minimum supported version ({minimum})")]
    VersionTooOld { minimum: u16, remote: u16 },

    #[error("local network ({local}) =/= remote network ({remote})")]
    NetworkMismatch { local: NetworkId, remote: NetworkId },

    #[error("invalid listen port {0:?}")]
    InvalidPort(String),
}

impl HandshakeData {
    /// Validate a remote handshake against local settings. Checks run in a
    /// fixed order and the first failing one is reported.
    ///
    /// # Return Value
    ///
    ///  - `Ok(port)` with the remote's parsed listen port.
    ///  - `Err(_)` naming the first violated rule.
    pub fn validate(
        &self,
        own_node_id: u64,
        minimum_version: u16,
        network: NetworkId,
    ) -> Result<u16, HandshakeValidationError> {
        if self.node_id == own_node_id {
            return Err(HandshakeValidationError::SelfConnect);
        }

        if self.version < minimum_version {
            return Err(HandshakeValidationError::VersionTooOld {
                minimum: minimum_version,
                remote: self.version,
            });
        }

        if self.network != network {
            return Err(HandshakeValidationError::NetworkMismatch {
                local: network,
                remote: self.network,
            });
        }

        match self.listen_port.trim().parse::<u32>() {
            Ok(port @ 1..=65535) => Ok(port as u16),
            _ => Err(HandshakeValidationError::InvalidPort(
                self.listen_port.clone(),
            )),
        }
    }
}

impl From<&ParcelHeader> for HandshakeData {
    fn from(header: &ParcelHeader) -> Self {
        Self {
            network: header.network,
            version: header.version,
            node_id: header.node_id,
            listen_port: header.peer_port.clone(),
        }
    }
}
