use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Namespace identifier of a gossip network. Two nodes only talk to each
/// other if their ids match exactly.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct NetworkId(pub u32);

impl NetworkId {
    /// Production network.
    pub const MAIN: NetworkId = NetworkId(0xfeed_beef);

    /// Public test network.
    pub const TEST: NetworkId = NetworkId(0xdead_beef);

    /// Network for local development and tests.
    pub const LOCAL: NetworkId = NetworkId(0xbeaf_feed);

    /// Derive a network id from a custom network name, so that operators
    /// can run private networks without coordinating numeric ids.
    pub fn from_name(name: &str) -> Self {
        // FNV-1a, stable across platforms and releases
        let hash = name.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });
        NetworkId(hash)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAIN => write!(f, "main"),
            Self::TEST => write!(f, "test"),
            Self::LOCAL => write!(f, "local"),
            NetworkId(id) => write!(f, "{:#010x}", id),
        }
    }
}

impl FromStr for NetworkId {
    type Err = String;
    fn from_str(input: &str) -> Result<NetworkId, Self::Err> {
        match input {
            "main" => Ok(Self::MAIN),
            "test" => Ok(Self::TEST),
            "local" => Ok(Self::LOCAL),
            _ => {
                if let Some(hex) = input.strip_prefix("0x") {
                    return u32::from_str_radix(hex, 16)
                        .map(NetworkId)
                        .map_err(|e| format!("Failed to parse {} as network: {}", input, e));
                }
                if let Ok(id) = input.parse::<u32>() {
                    return Ok(NetworkId(id));
                }
                if input.is_empty() {
                    return Err("Failed to parse empty string as network".to_string());
                }
                Ok(Self::from_name(input))
            }
        }
    }
}
