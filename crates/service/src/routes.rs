//! Acceptance and bookkeeping of routes and DNS servers announced by
//! peers.
//!
//! Every peer announces a versioned set; only strictly newer versions
//! replace what it previously announced, and everything passes the
//! configured acceptance policies before it reaches the router or the
//! system installers.

use std::net::{IpAddr, SocketAddr};

use ahash::{HashMap, HashMapExt};
use codec::routes::{IpRoute, RoutesMessage};

use crate::net::IpNetwork;

/// Which routes announced by peers are accepted into the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RouteAcceptancePolicy {
    /// Accept nothing.
    None,
    /// Host routes inside the local networks only.
    #[default]
    UnicastInNetwork,
    /// Any host route.
    Unicast,
    /// Any route contained in the local networks.
    Subnet,
    /// Everything.
    Any,
}

/// Which accepted routes are additionally handed to the system route
/// installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum SystemRouteScope {
    #[default]
    None,
    Unicast,
    Any,
    UnicastWithGateway,
    AnyWithGateway,
}

/// Which announced DNS servers are handed to the DNS installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DnsScope {
    #[default]
    None,
    InNetwork,
    Any,
}

pub struct RoutesOptions {
    pub accept_routes: RouteAcceptancePolicy,
    pub system_route_scope: SystemRouteScope,
    pub dns_scope: DnsScope,
    /// Per address family cap on accepted routes from one peer.
    pub maximum_routes_limit: usize,
    /// The networks of the local TAP interface, used by the `in-network`
    /// flavors of the policies.
    pub local_networks: Vec<IpNetwork>,
}

impl Default for RoutesOptions {
    fn default() -> Self {
        Self {
            accept_routes: RouteAcceptancePolicy::default(),
            system_route_scope: SystemRouteScope::default(),
            dns_scope: DnsScope::default(),
            maximum_routes_limit: 256,
            local_networks: Vec::new(),
        }
    }
}

/// What survived the filters for one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedRoutes {
    pub version: u32,
    /// Routes for the router table.
    pub routes: Vec<IpRoute>,
    /// The subset to hand to the system route installer.
    pub system_routes: Vec<IpRoute>,
    /// DNS servers to hand to the DNS installer.
    pub dns_servers: Vec<IpAddr>,
}

pub struct RoutesDirectory {
    options: RoutesOptions,
    versions: HashMap<SocketAddr, u32>,
}

impl RoutesDirectory {
    pub fn new(options: RoutesOptions) -> Self {
        Self {
            options,
            versions: HashMap::with_capacity(32),
        }
    }

    /// Filter one announcement from `peer`.
    ///
    /// Returns `None` when the version does not strictly exceed the
    /// last accepted one, leaving all state untouched.
    pub fn accept(&mut self, peer: SocketAddr, message: &RoutesMessage) -> Option<AcceptedRoutes> {
        if let Some(version) = self.versions.get(&peer) {
            if message.version <= *version {
                log::debug!(
                    "routes v{} from {} ignored (have v{})",
                    message.version,
                    peer,
                    version
                );
                return None;
            }
        }

        self.versions.insert(peer, message.version);

        let mut routes = Vec::new();
        let (mut v4, mut v6) = (0usize, 0usize);
        for route in &message.routes {
            if !self.route_accepted(route) {
                log::debug!("route {} from {} rejected by policy", route, peer);
                continue;
            }

            let count = if route.is_ipv4() { &mut v4 } else { &mut v6 };
            if *count >= self.options.maximum_routes_limit {
                log::warn!("route {} from {} exceeds the routes limit", route, peer);
                continue;
            }

            *count += 1;
            routes.push(*route);
        }

        let system_routes = routes
            .iter()
            .filter(|route| self.system_route_accepted(route))
            .copied()
            .collect();

        let dns_servers = message
            .dns_servers
            .iter()
            .filter(|server| self.dns_accepted(**server))
            .copied()
            .collect();

        Some(AcceptedRoutes {
            version: message.version,
            routes,
            system_routes,
            dns_servers,
        })
    }

    /// Drop the version pin of a disconnected peer; a reconnecting peer
    /// starts from scratch.
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.versions.remove(&peer);
    }

    fn in_local_network(&self, address: IpAddr) -> bool {
        self.options
            .local_networks
            .iter()
            .any(|network| network.contains(address))
    }

    fn route_accepted(&self, route: &IpRoute) -> bool {
        let as_network = IpNetwork::new(route.network, route.prefix_len);
        let Some(as_network) = as_network else {
            return false;
        };

        match self.options.accept_routes {
            RouteAcceptancePolicy::None => false,
            RouteAcceptancePolicy::Unicast => as_network.is_host(),
            RouteAcceptancePolicy::UnicastInNetwork => {
                as_network.is_host() && self.in_local_network(route.network)
            }
            RouteAcceptancePolicy::Subnet => self
                .options
                .local_networks
                .iter()
                .any(|local| {
                    local.contains(route.network) && route.prefix_len >= local.prefix_len()
                }),
            RouteAcceptancePolicy::Any => true,
        }
    }

    fn system_route_accepted(&self, route: &IpRoute) -> bool {
        let is_host = IpNetwork::new(route.network, route.prefix_len)
            .is_some_and(|network| network.is_host());

        match self.options.system_route_scope {
            SystemRouteScope::None => false,
            SystemRouteScope::Unicast => is_host && route.gateway.is_none(),
            SystemRouteScope::Any => route.gateway.is_none(),
            SystemRouteScope::UnicastWithGateway => is_host,
            SystemRouteScope::AnyWithGateway => true,
        }
    }

    fn dns_accepted(&self, server: IpAddr) -> bool {
        match self.options.dns_scope {
            DnsScope::None => false,
            DnsScope::InNetwork => self.in_local_network(server),
            DnsScope::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "198.51.100.1:12000".parse().unwrap()
    }

    fn directory(policy: RouteAcceptancePolicy) -> RoutesDirectory {
        RoutesDirectory::new(RoutesOptions {
            accept_routes: policy,
            dns_scope: DnsScope::Any,
            local_networks: vec!["172.16.0.0/16".parse().unwrap()],
            ..RoutesOptions::default()
        })
    }

    fn message(version: u32, routes: &[&str]) -> RoutesMessage {
        RoutesMessage {
            version,
            routes: routes
                .iter()
                .map(|route| {
                    let network: IpNetwork = route.parse().unwrap();
                    IpRoute::new(network.address(), network.prefix_len())
                })
                .collect(),
            dns_servers: vec![],
        }
    }

    #[test]
    fn version_must_strictly_increase() {
        let mut directory = directory(RouteAcceptancePolicy::Any);

        assert!(directory.accept(peer(), &message(2, &["10.0.0.0/8"])).is_some());
        assert!(directory.accept(peer(), &message(2, &["10.0.0.0/8"])).is_none());
        assert!(directory.accept(peer(), &message(1, &["10.0.0.0/8"])).is_none());
        assert!(directory.accept(peer(), &message(3, &["10.0.0.0/8"])).is_some());
    }

    #[test]
    fn forgetting_a_peer_resets_its_version() {
        let mut directory = directory(RouteAcceptancePolicy::Any);

        assert!(directory.accept(peer(), &message(5, &[])).is_some());
        directory.forget_peer(peer());
        assert!(directory.accept(peer(), &message(1, &[])).is_some());
    }

    #[test]
    fn unicast_in_network_policy() {
        let mut directory = directory(RouteAcceptancePolicy::UnicastInNetwork);

        let accepted = directory
            .accept(
                peer(),
                &message(1, &["172.16.0.7/32", "172.16.1.0/24", "10.0.0.1/32"]),
            )
            .unwrap();

        assert_eq!(accepted.routes.len(), 1);
        assert_eq!(accepted.routes[0].network, "172.16.0.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn subnet_policy_accepts_contained_prefixes() {
        let mut directory = directory(RouteAcceptancePolicy::Subnet);

        let accepted = directory
            .accept(
                peer(),
                &message(1, &["172.16.1.0/24", "172.16.0.0/12", "10.0.0.0/8"]),
            )
            .unwrap();

        // 172.16.0.0/12 is wider than the local /16 and must not pass.
        assert_eq!(accepted.routes.len(), 1);
    }

    #[test]
    fn routes_limit_is_per_family() {
        let mut directory = RoutesDirectory::new(RoutesOptions {
            accept_routes: RouteAcceptancePolicy::Any,
            maximum_routes_limit: 2,
            ..RoutesOptions::default()
        });

        let accepted = directory
            .accept(
                peer(),
                &message(
                    1,
                    &["10.0.0.0/8", "10.1.0.0/16", "10.2.0.0/16", "fd00::/8", "fd01::/16"],
                ),
            )
            .unwrap();

        assert_eq!(accepted.routes.iter().filter(|it| it.is_ipv4()).count(), 2);
        assert_eq!(accepted.routes.iter().filter(|it| !it.is_ipv4()).count(), 2);
    }

    #[test]
    fn system_route_scopes() {
        let mut directory = RoutesDirectory::new(RoutesOptions {
            accept_routes: RouteAcceptancePolicy::Any,
            system_route_scope: SystemRouteScope::UnicastWithGateway,
            ..RoutesOptions::default()
        });

        let mut message = message(1, &["10.0.0.1/32", "10.1.0.0/16"]);
        message.routes[0].gateway = Some("10.0.0.254".parse().unwrap());

        let accepted = directory.accept(peer(), &message).unwrap();
        assert_eq!(accepted.routes.len(), 2);
        assert_eq!(accepted.system_routes.len(), 1);
        assert!(accepted.system_routes[0].gateway.is_some());
    }

    #[test]
    fn dns_scope_in_network() {
        let mut directory = RoutesDirectory::new(RoutesOptions {
            dns_scope: DnsScope::InNetwork,
            local_networks: vec!["172.16.0.0/16".parse().unwrap()],
            ..RoutesOptions::default()
        });

        let announcement = RoutesMessage {
            version: 1,
            routes: vec![],
            dns_servers: vec![
                "172.16.0.53".parse().unwrap(),
                "9.9.9.9".parse().unwrap(),
            ],
        };

        let accepted = directory.accept(peer(), &announcement).unwrap();
        assert_eq!(accepted.dns_servers, vec!["172.16.0.53".parse::<IpAddr>().unwrap()]);
    }
}
