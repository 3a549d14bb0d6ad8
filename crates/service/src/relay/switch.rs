//! A learning Ethernet switch over the port set.

use ahash::{HashMap, HashMapExt};
use std::collections::VecDeque;

use crate::osi::{EthernetFrame, Mac};

use super::{MultiWriteResult, Port, PortIndex, forwarding_allowed};

/// How the switch decides where a frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RoutingMethod {
    /// Learn source addresses and forward known unicast to one port.
    #[default]
    Switch,
    /// Always flood, subject to the group rules.
    Hub,
}

pub struct SwitchOptions {
    pub routing_method: RoutingMethod,
    /// Allow peer to peer forwarding. Off by default: every node floods,
    /// so relaying between peers would loop frames through the mesh.
    pub relay_mode_enabled: bool,
    /// Upper bound of the learning table.
    pub max_entries: usize,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            routing_method: RoutingMethod::Switch,
            relay_mode_enabled: false,
            max_entries: 1024,
        }
    }
}

/// A bounded MAC learning table with insertion-order eviction.
struct MacTable {
    entries: HashMap<Mac, PortIndex>,
    order: VecDeque<Mac>,
    max_entries: usize,
}

impl MacTable {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries.min(4096)),
            order: VecDeque::with_capacity(max_entries.min(4096)),
            max_entries,
        }
    }

    fn learn(&mut self, address: Mac, port: PortIndex) {
        if let Some(existing) = self.entries.get_mut(&address) {
            // A station moved; keep its original insertion slot.
            *existing = port;
            return;
        }

        while self.entries.len() >= self.max_entries.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }

        self.entries.insert(address, port);
        self.order.push_back(address);
    }

    fn lookup(&self, address: &Mac) -> Option<PortIndex> {
        self.entries.get(address).copied()
    }

    fn forget_port(&mut self, port: PortIndex) {
        self.entries.retain(|_, it| *it != port);
        self.order
            .retain(|address| self.entries.contains_key(address));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Switch {
    options: SwitchOptions,
    ports: HashMap<PortIndex, Port>,
    table: MacTable,
}

impl Switch {
    pub fn new(options: SwitchOptions) -> Self {
        Self {
            table: MacTable::new(options.max_entries),
            ports: HashMap::with_capacity(32),
            options,
        }
    }

    pub fn register_port(&mut self, index: PortIndex, port: Port) {
        self.ports.insert(index, port);
    }

    /// Unregister a port and drop every address learned behind it.
    pub fn unregister_port(&mut self, index: PortIndex) {
        self.ports.remove(&index);
        self.table.forget_port(index);
    }

    pub fn is_registered(&self, index: PortIndex) -> bool {
        self.ports.contains_key(&index)
    }

    pub fn learned_entries(&self) -> usize {
        self.table.len()
    }

    /// Run one Ethernet frame arriving on `from` through the switch.
    ///
    /// Returns one `(port, result)` entry per attempted write; malformed
    /// frames and frames with nowhere to go yield an empty result.
    pub fn write(&mut self, from: PortIndex, frame: &[u8]) -> MultiWriteResult {
        let Some(parsed) = EthernetFrame::parse(frame) else {
            log::trace!("switch: dropping malformed frame from port {}", from);
            return Vec::new();
        };

        let Some(source_port) = self.ports.get(&from) else {
            return Vec::new();
        };
        let source_group = source_port.group();

        if self.options.routing_method == RoutingMethod::Switch && parsed.source.is_unicast() {
            self.table.learn(parsed.source, from);
        }

        let targets: Vec<PortIndex> = if self.options.routing_method == RoutingMethod::Switch
            && parsed.destination.is_unicast()
        {
            match self.table.lookup(&parsed.destination) {
                Some(port) if port != from => {
                    let allowed = self.ports.get(&port).is_some_and(|it| {
                        forwarding_allowed(
                            source_group,
                            it.group(),
                            self.options.relay_mode_enabled,
                        )
                    });

                    if allowed { vec![port] } else { Vec::new() }
                }
                Some(_) => Vec::new(),
                None => self.flood_targets(from, source_group),
            }
        } else {
            self.flood_targets(from, source_group)
        };

        targets
            .into_iter()
            .map(|index| {
                let result = self.ports[&index].write(frame);
                if let Err(error) = &result {
                    log::debug!("switch: write to port {} failed: {}", index, error);
                }

                (index, result)
            })
            .collect()
    }

    fn flood_targets(&self, from: PortIndex, source_group: super::PortGroup) -> Vec<PortIndex> {
        let mut targets: Vec<PortIndex> = self
            .ports
            .iter()
            .filter(|(index, port)| {
                **index != from
                    && forwarding_allowed(
                        source_group,
                        port.group(),
                        self.options.relay_mode_enabled,
                    )
            })
            .map(|(index, _)| *index)
            .collect();

        // Deterministic delivery order.
        targets.sort_unstable();
        targets
    }
}
