use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumIter;

use super::handshake_data::HandshakeData;
use crate::config_models::network::NetworkId;

/// The kind of a parcel. Control types are consumed by the membership
/// controller, everything else is delivered to the application.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ParcelType {
    Heartbeat,
    Ping,
    Pong,
    PeerRequest,
    PeerResponse,
    Alert,
    Message,
    MessagePart,
}

impl ParcelType {
    /// Whether parcels of this type are handled by the network layer itself
    /// instead of being passed on to the application.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ParcelType::Ping | ParcelType::Pong | ParcelType::PeerRequest | ParcelType::PeerResponse
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParcelHeader {
    pub network: NetworkId,
    pub version: u16,
    pub parcel_type: ParcelType,

    /// The sender's externally reachable listen port. Stamped on every send.
    pub peer_port: String,
    pub node_id: u64,

    /// Hash of the connection a parcel arrived on. Set by the receiver,
    /// never transmitted.
    #[serde(skip)]
    pub target_peer: String,
}

impl ParcelHeader {
    /// Overwrite the sender fields with this node's current identity.
    pub fn stamp(&mut self, own: &HandshakeData) {
        self.network = own.network;
        self.version = own.version;
        self.peer_port.clone_from(&own.listen_port);
        self.node_id = own.node_id;
    }
}

/// One application-level message exchanged after the handshake.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parcel {
    pub header: ParcelHeader,
    pub payload: Vec<u8>,
}

impl Parcel {
    /// Create a parcel with a blank header. Network, version, port and node
    /// id are stamped by the outbound pump right before encoding.
    pub fn new(parcel_type: ParcelType, payload: Vec<u8>) -> Self {
        Self {
            header: ParcelHeader {
                network: NetworkId::default(),
                version: 0,
                parcel_type,
                peer_port: String::new(),
                node_id: 0,
                target_peer: String::new(),
            },
            payload,
        }
    }

    pub fn message(payload: Vec<u8>) -> Self {
        Self::new(ParcelType::Message, payload)
    }

    pub fn parcel_type(&self) -> ParcelType {
        self.header.parcel_type
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn only_membership_types_are_control() {
        let control = ParcelType::iter()
            .filter(ParcelType::is_control)
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                ParcelType::Ping,
                ParcelType::Pong,
                ParcelType::PeerRequest,
                ParcelType::PeerResponse
            ],
            control
        );
    }

    #[test]
    fn target_peer_is_not_transmitted() {
        let mut parcel = Parcel::message(vec![1, 2, 3]);
        parcel.header.target_peer = "10.0.0.1:8108 0000000000000001".to_string();

        let bytes = bincode::serialize(&parcel).unwrap();
        let decoded: Parcel = bincode::deserialize(&bytes).unwrap();

        assert!(decoded.header.target_peer.is_empty());
        assert_eq!(parcel.payload, decoded.payload);
    }

    #[test]
    fn stamp_overwrites_sender_fields() {
        let own = HandshakeData {
            network: NetworkId::LOCAL,
            version: 10,
            node_id: 77,
            listen_port: "9000".to_string(),
        };
        let mut parcel = Parcel::new(ParcelType::Ping, vec![]);
        parcel.header.peer_port = "1".to_string();
        parcel.header.stamp(&own);

        assert_eq!(own, HandshakeData::from(&parcel.header));
        assert_eq!(ParcelType::Ping, parcel.parcel_type());
    }

    #[test]
    fn display_is_kebab_case() {
        assert_eq!("peer-request", ParcelType::PeerRequest.to_string());
        assert_eq!("message-part", ParcelType::MessagePart.to_string());
    }
}
