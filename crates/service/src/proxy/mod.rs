//! Local responders on the TAP/TUN side.
//!
//! These filters sit between the virtual interface and the relay. They can
//! answer a frame locally (ARP, DHCP, ICMPv6 neighbor discovery) so the
//! kernel believes the whole subnet is one hop away, and they clamp the TCP
//! MSS in both directions so tunnelled connections fit the reduced MTU.
//! The walk is single-pass and ordered lower layers first.

pub mod arp;
pub mod dhcp;
pub mod icmpv6;
pub mod mss;

use crate::osi::{ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, EthernetFrame};

use self::{arp::ArpProxy, dhcp::DhcpProxy, icmpv6::NeighborProxy};

/// What to do with a frame after the filters saw it.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterAction {
    /// Write this reply back to the interface; the original frame is
    /// consumed.
    Reply(Vec<u8>),
    /// Forward the (possibly patched) frame as usual.
    Pass,
}

pub struct ProxyPipeline {
    /// Whether the interface carries Ethernet frames (TAP) or raw IP
    /// packets (TUN). ARP and DHCP only exist in layer 2.
    pub layer2: bool,
    pub arp: Option<ArpProxy>,
    pub dhcp: Option<DhcpProxy>,
    pub neighbor: Option<NeighborProxy>,
    pub max_mss: Option<u16>,
}

impl ProxyPipeline {
    /// A pipeline with every filter disabled.
    pub fn disabled(layer2: bool) -> Self {
        Self {
            layer2,
            arp: None,
            dhcp: None,
            neighbor: None,
            max_mss: None,
        }
    }

    /// Run a frame read from the interface through the filters. Frames
    /// travelling the other way only need the MSS clamp, which the
    /// interface's write side applies on its own.
    pub fn process_outbound(&mut self, frame: &mut Vec<u8>) -> FilterAction {
        if self.layer2 {
            self.process_ethernet(frame)
        } else {
            self.process_ip(frame)
        }
    }

    fn process_ethernet(&mut self, frame: &mut Vec<u8>) -> FilterAction {
        let Some(parsed) = EthernetFrame::parse(frame) else {
            return FilterAction::Pass;
        };

        match parsed.ethertype {
            ETHERTYPE_ARP => {
                if let Some(arp) = &self.arp {
                    if let Some(reply) = arp.process(&parsed) {
                        return FilterAction::Reply(reply);
                    }
                }
            }
            ETHERTYPE_IPV4 => {
                if let Some(dhcp) = &mut self.dhcp {
                    if let Some(reply) = dhcp.process(&parsed) {
                        return FilterAction::Reply(reply);
                    }
                }

                if let Some(max_mss) = self.max_mss {
                    mss::clamp(&mut frame[EthernetFrame::HEADER_LEN..], max_mss);
                }
            }
            ETHERTYPE_IPV6 => {
                if let Some(neighbor) = &self.neighbor {
                    if let Some(reply) = neighbor.process(parsed.payload) {
                        let reply = EthernetFrame::build(
                            parsed.source,
                            neighbor.hardware_address(),
                            ETHERTYPE_IPV6,
                            &reply,
                        );
                        return FilterAction::Reply(reply);
                    }
                }

                if let Some(max_mss) = self.max_mss {
                    mss::clamp(&mut frame[EthernetFrame::HEADER_LEN..], max_mss);
                }
            }
            _ => {}
        }

        FilterAction::Pass
    }

    fn process_ip(&mut self, packet: &mut Vec<u8>) -> FilterAction {
        if packet.first().map(|it| it >> 4) == Some(6) {
            if let Some(neighbor) = &self.neighbor {
                if let Some(reply) = neighbor.process(packet) {
                    return FilterAction::Reply(reply);
                }
            }
        }

        if let Some(max_mss) = self.max_mss {
            mss::clamp(packet, max_mss);
        }

        FilterAction::Pass
    }
}
