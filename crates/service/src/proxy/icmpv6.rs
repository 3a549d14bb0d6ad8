//! The ICMPv6 neighbor discovery proxy.
//!
//! Answers Neighbor Solicitations for any address other than the
//! adapter's own with a configured fake link-layer address, the IPv6
//! equivalent of the ARP proxy.

use std::net::Ipv6Addr;

use crate::osi::{
    IPPROTO_ICMPV6, Ipv6Packet, Mac, internet_checksum, pseudo_header_v6,
};

const NEIGHBOR_SOLICITATION: u8 = 135;
const NEIGHBOR_ADVERTISEMENT: u8 = 136;

/// Solicited + override flags of an advertisement.
const NA_FLAGS: u8 = 0x60;

const OPTION_TARGET_LINK_LAYER: u8 = 2;

pub struct NeighborProxy {
    fake_hardware_address: Mac,
    own_addresses: Vec<Ipv6Addr>,
}

impl NeighborProxy {
    pub fn new(fake_hardware_address: Mac, own_addresses: Vec<Ipv6Addr>) -> Self {
        Self {
            fake_hardware_address,
            own_addresses,
        }
    }

    pub fn hardware_address(&self) -> Mac {
        self.fake_hardware_address
    }

    /// Answer a raw IPv6 packet carrying a Neighbor Solicitation. Returns
    /// the full IPv6 reply packet.
    pub fn process(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let parsed = Ipv6Packet::parse(packet)?;
        if parsed.next_header != IPPROTO_ICMPV6 || parsed.payload.len() < 24 {
            return None;
        }

        if parsed.payload[0] != NEIGHBOR_SOLICITATION || parsed.payload[1] != 0 {
            return None;
        }

        // Duplicate address detection probes come from the unspecified
        // address; answering them would make the kernel believe its own
        // address is taken.
        if parsed.source.is_unspecified() {
            return None;
        }

        let target = Ipv6Addr::from(<[u8; 16]>::try_from(&parsed.payload[8..24]).ok()?);
        if self.own_addresses.contains(&target) {
            return None;
        }

        Some(self.build_advertisement(target, parsed.source))
    }

    fn build_advertisement(&self, target: Ipv6Addr, solicitor: Ipv6Addr) -> Vec<u8> {
        // ICMPv6 advertisement body with a target link-layer option.
        let mut icmp = vec![0u8; 32];
        icmp[0] = NEIGHBOR_ADVERTISEMENT;
        icmp[4] = NA_FLAGS;
        icmp[8..24].copy_from_slice(&target.octets());
        icmp[24] = OPTION_TARGET_LINK_LAYER;
        icmp[25] = 1; // option length in units of 8 bytes
        icmp[26..32].copy_from_slice(&self.fake_hardware_address.0);

        let pseudo = pseudo_header_v6(&target, &solicitor, icmp.len() as u32, IPPROTO_ICMPV6);
        let checksum = internet_checksum(&[&pseudo, &icmp]);
        icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

        let mut packet = vec![0u8; Ipv6Packet::HEADER_LEN];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(icmp.len() as u16).to_be_bytes());
        packet[6] = IPPROTO_ICMPV6;
        packet[7] = 255; // hop limit required by neighbor discovery
        packet[8..24].copy_from_slice(&target.octets());
        packet[24..40].copy_from_slice(&solicitor.octets());
        packet.extend_from_slice(&icmp);

        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAKE: Mac = Mac([0x0A, 0, 0x27, 0, 0, 0x02]);

    fn solicitation(source: &str, target: &str) -> Vec<u8> {
        let source: Ipv6Addr = source.parse().unwrap();
        let target: Ipv6Addr = target.parse().unwrap();

        let mut icmp = vec![0u8; 24];
        icmp[0] = NEIGHBOR_SOLICITATION;
        icmp[8..24].copy_from_slice(&target.octets());

        let mut packet = vec![0u8; Ipv6Packet::HEADER_LEN];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(icmp.len() as u16).to_be_bytes());
        packet[6] = IPPROTO_ICMPV6;
        packet[7] = 255;
        packet[8..24].copy_from_slice(&source.octets());
        // Destination is the solicited-node multicast; its exact value is
        // irrelevant to the proxy.
        packet[24..40].copy_from_slice(&"ff02::1:ff00:42".parse::<Ipv6Addr>().unwrap().octets());
        packet.extend_from_slice(&icmp);

        packet
    }

    #[test]
    fn foreign_target_is_advertised_with_the_fake_mac() {
        let proxy = NeighborProxy::new(FAKE, vec!["fd00::1".parse().unwrap()]);

        let reply = proxy
            .process(&solicitation("fd00::1", "fd00::42"))
            .unwrap();

        let parsed = Ipv6Packet::parse(&reply).unwrap();
        assert_eq!(parsed.source, "fd00::42".parse::<Ipv6Addr>().unwrap());
        assert_eq!(parsed.destination, "fd00::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(parsed.payload[0], NEIGHBOR_ADVERTISEMENT);
        assert_eq!(&parsed.payload[26..32], &FAKE.0);

        // The ICMPv6 checksum verifies against the pseudo header.
        let pseudo = pseudo_header_v6(
            &parsed.source,
            &parsed.destination,
            parsed.payload.len() as u32,
            IPPROTO_ICMPV6,
        );
        assert_eq!(internet_checksum(&[&pseudo, parsed.payload]), 0);
    }

    #[test]
    fn own_address_is_left_to_the_kernel() {
        let proxy = NeighborProxy::new(FAKE, vec!["fd00::1".parse().unwrap()]);
        assert!(proxy.process(&solicitation("fd00::2", "fd00::1")).is_none());
    }

    #[test]
    fn dad_probes_are_not_answered() {
        let proxy = NeighborProxy::new(FAKE, vec![]);
        assert!(proxy.process(&solicitation("::", "fd00::42")).is_none());
    }
}
