use std::net::IpAddr;

use anyhow::Context;
use anyhow::Result;

/// Map an IP address to a coarse topological bucket. IPv4 addresses map to
/// their 32 bit value, IPv6 addresses to their first 32 bits.
pub fn locate(address: &str) -> Result<u32> {
    let ip: IpAddr = address
        .parse()
        .with_context(|| format!("Cannot locate {address:?}"))?;

    Ok(match ip {
        IpAddr::V4(ipv4) => u32::from(ipv4),
        IpAddr::V6(ipv6) => {
            let [a, b, c, d, ..] = ipv6.octets();
            u32::from_be_bytes([a, b, c, d])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_maps_to_its_value() {
        assert_eq!(0x0a00_0001, locate("10.0.0.1").unwrap());
        assert_eq!(0, locate("0.0.0.0").unwrap());
        assert_ne!(locate("10.0.0.1").unwrap(), locate("10.0.0.2").unwrap());
    }

    #[test]
    fn ipv6_uses_the_routing_prefix() {
        assert_eq!(0x2001_0db8, locate("2001:db8::1").unwrap());
        assert_eq!(locate("2001:db8::1").unwrap(), locate("2001:db8::2").unwrap());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(locate("").is_err());
        assert!(locate("example.com").is_err());
    }
}
