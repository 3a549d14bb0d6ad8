//! Route and DNS distribution payloads.
//!
//! These ride inside DATA channel 1 once a session is established. A one
//! byte discriminator distinguishes the empty ROUTES_REQUEST from a ROUTES
//! announcement, which carries a version number followed by typed entries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::Error;

/// The data channel reserved for route exchange.
pub const CHANNEL: u8 = 1;

const KIND_ROUTES_REQUEST: u8 = 0x01;
const KIND_ROUTES: u8 = 0x02;

const TAG_IPV4_ROUTE: u8 = 0x01;
const TAG_IPV4_ROUTE_GW: u8 = 0x02;
const TAG_IPV6_ROUTE: u8 = 0x03;
const TAG_IPV6_ROUTE_GW: u8 = 0x04;
const TAG_DNS_IPV4: u8 = 0x05;
const TAG_DNS_IPV6: u8 = 0x06;

/// A route announced by a peer: a destination prefix and an optional
/// gateway of the same address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRoute {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
}

impl IpRoute {
    pub fn new(network: IpAddr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len,
            gateway: None,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }
}

impl std::fmt::Display for IpRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)?;
        if let Some(gateway) = &self.gateway {
            write!(f, " via {}", gateway)?;
        }

        Ok(())
    }
}

/// A versioned ROUTES announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutesMessage {
    pub version: u32,
    pub routes: Vec<IpRoute>,
    pub dns_servers: Vec<IpAddr>,
}

/// Either side of the route exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutesExchange {
    Request,
    Routes(RoutesMessage),
}

impl RoutesExchange {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Request => vec![KIND_ROUTES_REQUEST],
            Self::Routes(message) => {
                let mut buf = BytesMut::with_capacity(5 + message.routes.len() * 38);
                buf.put_u8(KIND_ROUTES);
                buf.put_u32(message.version);

                for route in &message.routes {
                    match (route.network, route.gateway) {
                        (IpAddr::V4(network), None) => {
                            buf.put_u8(TAG_IPV4_ROUTE);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                        }
                        (IpAddr::V4(network), Some(IpAddr::V4(gateway))) => {
                            buf.put_u8(TAG_IPV4_ROUTE_GW);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                            buf.put_slice(&gateway.octets());
                        }
                        (IpAddr::V6(network), None) => {
                            buf.put_u8(TAG_IPV6_ROUTE);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                        }
                        (IpAddr::V6(network), Some(IpAddr::V6(gateway))) => {
                            buf.put_u8(TAG_IPV6_ROUTE_GW);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                            buf.put_slice(&gateway.octets());
                        }
                        // Mixed-family gateways cannot be represented;
                        // announce the bare prefix instead.
                        (IpAddr::V4(network), Some(IpAddr::V6(_))) => {
                            buf.put_u8(TAG_IPV4_ROUTE);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                        }
                        (IpAddr::V6(network), Some(IpAddr::V4(_))) => {
                            buf.put_u8(TAG_IPV6_ROUTE);
                            buf.put_u8(route.prefix_len);
                            buf.put_slice(&network.octets());
                        }
                    }
                }

                for server in &message.dns_servers {
                    match server {
                        IpAddr::V4(ip) => {
                            buf.put_u8(TAG_DNS_IPV4);
                            buf.put_slice(&ip.octets());
                        }
                        IpAddr::V6(ip) => {
                            buf.put_u8(TAG_DNS_IPV6);
                            buf.put_slice(&ip.octets());
                        }
                    }
                }

                buf.to_vec()
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        match *payload.first().ok_or(Error::BadLength)? {
            KIND_ROUTES_REQUEST => {
                if payload.len() != 1 {
                    return Err(Error::BadLength);
                }

                Ok(Self::Request)
            }
            KIND_ROUTES => Ok(Self::Routes(decode_routes(&payload[1..])?)),
            _ => Err(Error::UnknownType),
        }
    }
}

fn take<'a>(payload: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8], Error> {
    let bytes = payload.get(*at..*at + n).ok_or(Error::BadLength)?;
    *at += n;

    Ok(bytes)
}

fn take_v4(payload: &[u8], at: &mut usize) -> Result<Ipv4Addr, Error> {
    let bytes: [u8; 4] = take(payload, at, 4)?.try_into()?;

    Ok(Ipv4Addr::from(bytes))
}

fn take_v6(payload: &[u8], at: &mut usize) -> Result<Ipv6Addr, Error> {
    let bytes: [u8; 16] = take(payload, at, 16)?.try_into()?;

    Ok(Ipv6Addr::from(bytes))
}

fn decode_routes(payload: &[u8]) -> Result<RoutesMessage, Error> {
    let mut at = 0usize;
    let version = u32::from_be_bytes(take(payload, &mut at, 4)?.try_into()?);

    let mut routes = Vec::new();
    let mut dns_servers = Vec::new();

    while at < payload.len() {
        let tag = take(payload, &mut at, 1)?[0];
        match tag {
            TAG_IPV4_ROUTE | TAG_IPV4_ROUTE_GW => {
                let prefix_len = take(payload, &mut at, 1)?[0];
                let network = IpAddr::V4(take_v4(payload, &mut at)?);
                let gateway = (tag == TAG_IPV4_ROUTE_GW)
                    .then(|| take_v4(payload, &mut at).map(IpAddr::V4))
                    .transpose()?;

                routes.push(IpRoute {
                    network,
                    prefix_len,
                    gateway,
                });
            }
            TAG_IPV6_ROUTE | TAG_IPV6_ROUTE_GW => {
                let prefix_len = take(payload, &mut at, 1)?[0];
                let network = IpAddr::V6(take_v6(payload, &mut at)?);
                let gateway = (tag == TAG_IPV6_ROUTE_GW)
                    .then(|| take_v6(payload, &mut at).map(IpAddr::V6))
                    .transpose()?;

                routes.push(IpRoute {
                    network,
                    prefix_len,
                    gateway,
                });
            }
            TAG_DNS_IPV4 => dns_servers.push(IpAddr::V4(take_v4(payload, &mut at)?)),
            TAG_DNS_IPV6 => dns_servers.push(IpAddr::V6(take_v6(payload, &mut at)?)),
            _ => return Err(Error::UnknownRouteTag),
        }
    }

    Ok(RoutesMessage {
        version,
        routes,
        dns_servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let encoded = RoutesExchange::Request.encode();
        assert_eq!(encoded, vec![0x01]);
        assert_eq!(
            RoutesExchange::decode(&encoded).unwrap(),
            RoutesExchange::Request
        );
    }

    #[test]
    fn routes_round_trip() {
        let message = RoutesMessage {
            version: 9,
            routes: vec![
                IpRoute::new("192.168.1.0".parse().unwrap(), 24),
                IpRoute {
                    network: "10.0.0.0".parse().unwrap(),
                    prefix_len: 8,
                    gateway: Some("10.0.0.1".parse().unwrap()),
                },
                IpRoute::new("2001:db8::".parse().unwrap(), 64),
                IpRoute {
                    network: "fd00::".parse().unwrap(),
                    prefix_len: 8,
                    gateway: Some("fd00::1".parse().unwrap()),
                },
            ],
            dns_servers: vec![
                "9.9.9.9".parse().unwrap(),
                "2620:fe::fe".parse().unwrap(),
            ],
        };

        let exchange = RoutesExchange::Routes(message.clone());
        match RoutesExchange::decode(&exchange.encode()).unwrap() {
            RoutesExchange::Routes(decoded) => assert_eq!(decoded, message),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn truncated_entry_is_rejected() {
        let mut encoded = RoutesExchange::Routes(RoutesMessage {
            version: 1,
            routes: vec![IpRoute::new("10.0.0.0".parse().unwrap(), 8)],
            dns_servers: vec![],
        })
        .encode();

        encoded.pop();
        assert!(RoutesExchange::decode(&encoded).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        // version 0 followed by tag 0x7F.
        let payload = [0x02, 0, 0, 0, 0, 0x7F];
        assert!(matches!(
            RoutesExchange::decode(&payload),
            Err(Error::UnknownRouteTag)
        ));
    }
}
