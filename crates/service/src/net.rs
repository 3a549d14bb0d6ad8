//! IP prefix arithmetic shared by the admission filter, the router and the
//! route acceptance policies.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// An IP network: an address and a prefix length.
///
/// Parses from the usual `address/prefix` notation, which is also how it
/// appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(address: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        (prefix_len <= max).then_some(Self {
            address,
            prefix_len,
        })
    }

    /// The all-of-a-family network (`0.0.0.0/0` or `::/0`).
    pub fn default_route(v4: bool) -> Self {
        if v4 {
            Self {
                address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                prefix_len: 0,
            }
        } else {
            Self {
                address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                prefix_len: 0,
            }
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Whether the prefix designates a single host.
    pub fn is_host(&self) -> bool {
        match self.address {
            IpAddr::V4(_) => self.prefix_len == 32,
            IpAddr::V6(_) => self.prefix_len == 128,
        }
    }

    /// Address family aware prefix containment test. An address of the
    /// other family never matches.
    ///
    /// # Test
    ///
    /// ```
    /// use fscp_node_service::net::IpNetwork;
    ///
    /// let network: IpNetwork = "10.0.0.0/8".parse().unwrap();
    ///
    /// assert!(network.contains("10.1.2.3".parse().unwrap()));
    /// assert!(!network.contains("11.0.0.1".parse().unwrap()));
    /// assert!(!network.contains("::1".parse().unwrap()));
    /// ```
    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.address, address) {
            (IpAddr::V4(network), IpAddr::V4(address)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(network) & mask == u32::from(address) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(address)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(network) & mask == u128::from(address) & mask
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[derive(Debug)]
pub struct InvalidNetwork;

impl std::error::Error for InvalidNetwork {}

impl std::fmt::Display for InvalidNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid network notation")
    }
}

impl FromStr for IpNetwork {
    type Err = InvalidNetwork;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('/') {
            Some((address, prefix)) => {
                let address: IpAddr = address.parse().map_err(|_| InvalidNetwork)?;
                let prefix_len: u8 = prefix.parse().map_err(|_| InvalidNetwork)?;

                IpNetwork::new(address, prefix_len).ok_or(InvalidNetwork)
            }
            None => {
                let address: IpAddr = value.parse().map_err(|_| InvalidNetwork)?;
                let prefix_len = if address.is_ipv4() { 32 } else { 128 };

                Ok(Self {
                    address,
                    prefix_len,
                })
            }
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for IpNetwork {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for IpNetwork {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len => u32::MAX << (32 - len.min(32) as u32),
    }
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len => u128::MAX << (128 - len.min(128) as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_contains() {
        let network: IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert!(network.contains("192.168.1.200".parse().unwrap()));
        assert!(!network.contains("192.168.2.1".parse().unwrap()));

        let network: IpNetwork = "2001:db8::/32".parse().unwrap();
        assert!(network.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!network.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_a_host_network() {
        let network: IpNetwork = "10.0.0.1".parse().unwrap();
        assert_eq!(network.prefix_len(), 32);
        assert!(network.is_host());
        assert!(network.contains("10.0.0.1".parse().unwrap()));
        assert!(!network.contains("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("10.0.0.0/x".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn zero_prefix_contains_everything_in_family() {
        let network = IpNetwork::default_route(true);
        assert!(network.contains("255.255.255.255".parse().unwrap()));
        assert!(!network.contains("::1".parse().unwrap()));
    }
}
