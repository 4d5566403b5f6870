use std::str::FromStr;
use std::sync::Arc;

use super::peer::endpoint::BanTarget;
use super::peer::endpoint::Endpoint;
use super::peer::parcel::Parcel;
use crate::peer::Peer;

/// Parcels decoded by a peer's inbound pump, on their way to the controller.
/// Delivered best effort: a saturated controller drops them.
#[derive(Debug)]
pub(crate) enum PeerTaskToMain {
    Parcel { peer: Arc<Peer>, parcel: Box<Parcel> },
}

impl PeerTaskToMain {
    pub fn get_type(&self) -> String {
        match self {
            PeerTaskToMain::Parcel { parcel, .. } => parcel.parcel_type().to_string(),
        }
    }
}

/// Changes in connection state. Never dropped, so sent over an unbounded
/// channel.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// Handshake completed, the peer's pumps are running.
    Activated(Arc<Peer>),

    /// An outgoing connection attempt failed before activation.
    DialFailed { endpoint: Endpoint, self_connect: bool },

    /// A peer stopped and asks to be removed from the registry.
    Disconnected(Arc<Peer>),
}

impl ConnectionEvent {
    pub fn get_type(&self) -> String {
        match self {
            ConnectionEvent::Activated(_) => "activated".to_string(),
            ConnectionEvent::DialFailed { .. } => "dial failed".to_string(),
            ConnectionEvent::Disconnected(_) => "disconnected".to_string(),
        }
    }
}

/// Commands from the application facade to the controller.
#[derive(Clone, Debug)]
pub(crate) enum ApiToMain {
    Ban(BanTarget),
    Unban(BanTarget),
}

/// A parcel delivered to the application, together with the hash of the
/// connection it arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerParcel {
    pub origin: String,
    pub parcel: Parcel,
}

/// Who an outbound parcel goes to. The markers are resolved by the
/// controller and never put on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetSelector {
    /// A random subset of `fanout` active peers.
    Broadcast,

    /// Every active peer.
    FullBroadcast,

    /// Exactly one random active peer.
    RandomPeer,

    /// The peer with this hash, if still connected.
    Peer(String),
}

impl FromStr for TargetSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<BROADCAST>" => Ok(TargetSelector::Broadcast),
            "<FULLBROADCAST>" => Ok(TargetSelector::FullBroadcast),
            "<RANDOMPEER>" => Ok(TargetSelector::RandomPeer),
            "" => Err("Failed to parse empty string as parcel target".to_string()),
            hash => Ok(TargetSelector::Peer(hash.to_string())),
        }
    }
}

/// A parcel submitted by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundParcel {
    pub target: TargetSelector,
    pub parcel: Parcel,
}

impl OutboundParcel {
    pub fn new(target: TargetSelector, parcel: Parcel) -> Self {
        Self { target, parcel }
    }

    /// Reply to the peer a parcel arrived from.
    pub fn reply(to: &PeerParcel, parcel: Parcel) -> Self {
        Self::new(TargetSelector::Peer(to.origin.clone()), parcel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_markers_parse() {
        assert_eq!(TargetSelector::Broadcast, "<BROADCAST>".parse().unwrap());
        assert_eq!(
            TargetSelector::FullBroadcast,
            "<FULLBROADCAST>".parse().unwrap()
        );
        assert_eq!(TargetSelector::RandomPeer, "<RANDOMPEER>".parse().unwrap());
        assert_eq!(
            TargetSelector::Peer("10.0.0.1:8108 0000000000000001".to_string()),
            "10.0.0.1:8108 0000000000000001".parse().unwrap()
        );
        assert!("".parse::<TargetSelector>().is_err());
    }

    #[test]
    fn reply_targets_origin() {
        let received = PeerParcel {
            origin: "hash".to_string(),
            parcel: Parcel::message(vec![1]),
        };
        let reply = OutboundParcel::reply(&received, Parcel::message(vec![2]));
        assert_eq!(TargetSelector::Peer("hash".to_string()), reply.target);
    }
}
