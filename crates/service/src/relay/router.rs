//! Longest-prefix-match IP routing over the port set.

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt};

use crate::{net::IpNetwork, osi};

use super::{MultiWriteResult, Port, PortIndex, forwarding_allowed};

pub struct RouterOptions {
    /// Allow peer to peer forwarding, as in the switch.
    pub relay_mode_enabled: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            relay_mode_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    network: IpNetwork,
    port: PortIndex,
    /// Routes announced through ROUTES messages are replaced wholesale per
    /// port; local interface routes stay until the port unregisters.
    local: bool,
}

/// A router keyed by destination address.
///
/// The table is one insertion-ordered list per family; lookups take the
/// longest matching prefix and ties go to the earliest insertion. Tables
/// stay small (one entry per announced route), so a linear scan beats
/// maintaining a trie.
pub struct Router {
    options: RouterOptions,
    ports: HashMap<PortIndex, Port>,
    v4: Vec<RouteEntry>,
    v6: Vec<RouteEntry>,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        Self {
            options,
            ports: HashMap::with_capacity(32),
            v4: Vec::new(),
            v6: Vec::new(),
        }
    }

    /// Register a port together with its always-on local networks (for the
    /// TAP port: one host entry per configured interface address).
    pub fn register_port(&mut self, index: PortIndex, port: Port, local: &[IpNetwork]) {
        self.ports.insert(index, port);
        for network in local {
            self.insert(RouteEntry {
                network: *network,
                port: index,
                local: true,
            });
        }
    }

    pub fn unregister_port(&mut self, index: PortIndex) {
        self.ports.remove(&index);
        self.v4.retain(|entry| entry.port != index);
        self.v6.retain(|entry| entry.port != index);
    }

    pub fn is_registered(&self, index: PortIndex) -> bool {
        self.ports.contains_key(&index)
    }

    /// Replace the announced routes of a port (a newer ROUTES version
    /// arrived). Local entries are untouched.
    pub fn set_port_routes(&mut self, index: PortIndex, routes: &[IpNetwork]) {
        self.v4
            .retain(|entry| entry.port != index || entry.local);
        self.v6
            .retain(|entry| entry.port != index || entry.local);

        for network in routes {
            self.insert(RouteEntry {
                network: *network,
                port: index,
                local: false,
            });
        }
    }

    fn insert(&mut self, entry: RouteEntry) {
        if entry.network.is_ipv4() {
            self.v4.push(entry);
        } else {
            self.v6.push(entry);
        }
    }

    /// Longest prefix match; first insertion wins among equal lengths.
    pub fn lookup(&self, destination: IpAddr) -> Option<PortIndex> {
        let table = if destination.is_ipv4() {
            &self.v4
        } else {
            &self.v6
        };

        let mut best: Option<(u8, PortIndex)> = None;
        for entry in table {
            if !entry.network.contains(destination) {
                continue;
            }

            let prefix_len = entry.network.prefix_len();
            if best.is_none_or(|(len, _)| prefix_len > len) {
                best = Some((prefix_len, entry.port));
            }
        }

        best.map(|(_, port)| port)
    }

    /// Route one IP packet arriving on `from`. The IP version comes from
    /// the first nibble; anything unroutable is dropped with a debug log.
    pub fn write(&self, from: PortIndex, packet: &[u8]) -> MultiWriteResult {
        let Some(source_port) = self.ports.get(&from) else {
            return Vec::new();
        };
        let source_group = source_port.group();

        let destination = match packet.first().map(|it| it >> 4) {
            Some(4) => osi::Ipv4Packet::parse(packet).map(|it| IpAddr::V4(it.destination)),
            Some(6) => osi::Ipv6Packet::parse(packet).map(|it| IpAddr::V6(it.destination)),
            _ => None,
        };
        let Some(destination) = destination else {
            log::trace!("router: dropping malformed packet from port {}", from);
            return Vec::new();
        };

        let Some(target) = self.lookup(destination) else {
            log::debug!("router: no route to {}, dropping", destination);
            return Vec::new();
        };

        if target == from {
            return Vec::new();
        }

        let Some(port) = self.ports.get(&target) else {
            return Vec::new();
        };

        if !forwarding_allowed(source_group, port.group(), self.options.relay_mode_enabled) {
            log::debug!(
                "router: refusing peer-to-peer forward of {} towards port {}",
                destination,
                target
            );
            return Vec::new();
        }

        let result = port.write(packet);
        if let Err(error) = &result {
            log::debug!("router: write to port {} failed: {}", target, error);
        }

        vec![(target, result)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{PortGroup, testing::RecordingWriter};
    use std::sync::Arc;

    fn v4_packet(destination: &str) -> Vec<u8> {
        let destination: std::net::Ipv4Addr = destination.parse().unwrap();
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&20u16.to_be_bytes());
        packet[16..20].copy_from_slice(&destination.octets());

        packet
    }

    fn v6_packet(destination: &str) -> Vec<u8> {
        let destination: std::net::Ipv6Addr = destination.parse().unwrap();
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&destination.octets());

        packet
    }

    struct Fixture {
        router: Router,
        writers: Vec<Arc<RecordingWriter>>,
    }

    /// Port 0 is the TAP port with a local address, ports 1.. are peers.
    fn fixture(peers: usize) -> Fixture {
        let mut router = Router::new(RouterOptions::default());
        let mut writers = Vec::new();

        for index in 0..=peers {
            let writer = Arc::new(RecordingWriter::default());
            let (group, local) = if index == 0 {
                (PortGroup::Tap, vec!["172.16.0.1/32".parse().unwrap()])
            } else {
                (PortGroup::Peer, Vec::new())
            };

            router.register_port(index, Port::new(writer.clone(), group), &local);
            writers.push(writer);
        }

        Fixture { router, writers }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut fx = fixture(2);
        fx.router
            .set_port_routes(1, &["10.0.0.0/8".parse().unwrap()]);
        fx.router
            .set_port_routes(2, &["10.1.0.0/16".parse().unwrap()]);

        assert_eq!(fx.router.lookup("10.1.2.3".parse().unwrap()), Some(2));
        assert_eq!(fx.router.lookup("10.2.3.4".parse().unwrap()), Some(1));
        assert_eq!(fx.router.lookup("11.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn equal_length_ties_go_to_first_insertion() {
        let mut fx = fixture(2);
        fx.router
            .set_port_routes(1, &["10.0.0.0/8".parse().unwrap()]);
        fx.router
            .set_port_routes(2, &["10.0.0.0/8".parse().unwrap()]);

        assert_eq!(fx.router.lookup("10.1.1.1".parse().unwrap()), Some(1));
    }

    #[test]
    fn packets_follow_routes_and_locals() {
        let mut fx = fixture(1);
        fx.router
            .set_port_routes(1, &["192.168.1.0/24".parse().unwrap()]);

        // TAP to peer.
        let results = fx.router.write(0, &v4_packet("192.168.1.5"));
        assert_eq!(results.iter().map(|(port, _)| *port).collect::<Vec<_>>(), vec![1]);
        assert_eq!(fx.writers[1].take().len(), 1);

        // Peer to the TAP local address.
        let results = fx.router.write(1, &v4_packet("172.16.0.1"));
        assert_eq!(results.iter().map(|(port, _)| *port).collect::<Vec<_>>(), vec![0]);

        // No route: dropped.
        assert!(fx.router.write(0, &v4_packet("8.8.8.8")).is_empty());
    }

    #[test]
    fn ipv6_routes_work_too() {
        let mut fx = fixture(1);
        fx.router
            .set_port_routes(1, &["2001:db8::/32".parse().unwrap()]);

        let results = fx.router.write(0, &v6_packet("2001:db8::42"));
        assert_eq!(results.iter().map(|(port, _)| *port).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn peer_to_peer_is_refused_without_relay_mode() {
        let mut fx = fixture(2);
        fx.router
            .set_port_routes(2, &["10.0.0.0/8".parse().unwrap()]);

        assert!(fx.router.write(1, &v4_packet("10.0.0.1")).is_empty());

        let mut relayed = Router::new(RouterOptions {
            relay_mode_enabled: true,
        });
        let writer = Arc::new(RecordingWriter::default());
        relayed.register_port(1, Port::new(writer.clone(), PortGroup::Peer), &[]);
        relayed.register_port(2, Port::new(writer.clone(), PortGroup::Peer), &[]);
        relayed.set_port_routes(2, &["10.0.0.0/8".parse().unwrap()]);

        assert_eq!(
            relayed
                .write(1, &v4_packet("10.0.0.1"))
                .iter()
                .map(|(port, _)| *port)
                .collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn newer_route_set_replaces_the_old_one() {
        let mut fx = fixture(1);
        fx.router
            .set_port_routes(1, &["192.168.1.0/24".parse().unwrap()]);
        fx.router.set_port_routes(
            1,
            &[
                "192.168.1.0/24".parse().unwrap(),
                "10.0.0.0/8".parse().unwrap(),
            ],
        );

        assert_eq!(fx.router.lookup("10.5.5.5".parse().unwrap()), Some(1));

        fx.router.set_port_routes(1, &[]);
        assert_eq!(fx.router.lookup("192.168.1.5".parse().unwrap()), None);
    }

    #[test]
    fn version_nibble_selects_the_family() {
        let fx = fixture(1);

        // A packet claiming version 5 is dropped.
        let mut bogus = v4_packet("172.16.0.1");
        bogus[0] = 0x55;
        assert!(fx.router.write(1, &bogus).is_empty());
    }
}
