//! The ARP proxy.
//!
//! Answers any ARP request for an address other than the adapter's own
//! with a configured fake hardware address, which convinces the local
//! kernel that the entire subnet sits behind the virtual interface.

use std::net::Ipv4Addr;

use crate::osi::{ARP_REPLY, ARP_REQUEST, ArpPacket, ETHERTYPE_ARP, EthernetFrame, Mac};

pub struct ArpProxy {
    fake_hardware_address: Mac,
    /// The adapter's own addresses; requests for these go unanswered so
    /// the kernel resolves itself normally.
    own_addresses: Vec<Ipv4Addr>,
}

impl ArpProxy {
    pub fn new(fake_hardware_address: Mac, own_addresses: Vec<Ipv4Addr>) -> Self {
        Self {
            fake_hardware_address,
            own_addresses,
        }
    }

    /// Answer an ARP request frame. Returns the full reply frame, or
    /// `None` when the frame is not ours to answer.
    pub fn process(&self, frame: &EthernetFrame<'_>) -> Option<Vec<u8>> {
        let request = ArpPacket::parse(frame.payload)?;
        if request.operation != ARP_REQUEST
            || self.own_addresses.contains(&request.target_protocol)
        {
            return None;
        }

        let reply = ArpPacket {
            operation: ARP_REPLY,
            sender_hardware: self.fake_hardware_address,
            sender_protocol: request.target_protocol,
            target_hardware: request.sender_hardware,
            target_protocol: request.sender_protocol,
        };

        Some(EthernetFrame::build(
            frame.source,
            self.fake_hardware_address,
            ETHERTYPE_ARP,
            &reply.build(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAKE: Mac = Mac([0x0A, 0x00, 0x27, 0x00, 0x00, 0x01]);
    const KERNEL: Mac = Mac([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn request(target: &str) -> Vec<u8> {
        let packet = ArpPacket {
            operation: ARP_REQUEST,
            sender_hardware: KERNEL,
            sender_protocol: "172.16.0.1".parse().unwrap(),
            target_hardware: Mac([0; 6]),
            target_protocol: target.parse().unwrap(),
        };

        EthernetFrame::build(Mac::BROADCAST, KERNEL, ETHERTYPE_ARP, &packet.build())
    }

    #[test]
    fn foreign_addresses_are_answered_with_the_fake_mac() {
        let proxy = ArpProxy::new(FAKE, vec!["172.16.0.1".parse().unwrap()]);

        let reply = proxy
            .process(&EthernetFrame::parse(&request("172.16.0.99")).unwrap())
            .unwrap();

        let frame = EthernetFrame::parse(&reply).unwrap();
        assert_eq!(frame.destination, KERNEL);
        assert_eq!(frame.source, FAKE);

        let arp = ArpPacket::parse(frame.payload).unwrap();
        assert_eq!(arp.operation, ARP_REPLY);
        assert_eq!(arp.sender_hardware, FAKE);
        assert_eq!(arp.sender_protocol, "172.16.0.99".parse::<Ipv4Addr>().unwrap());
        assert_eq!(arp.target_hardware, KERNEL);
    }

    #[test]
    fn own_address_is_left_alone() {
        let proxy = ArpProxy::new(FAKE, vec!["172.16.0.1".parse().unwrap()]);

        assert!(proxy
            .process(&EthernetFrame::parse(&request("172.16.0.1")).unwrap())
            .is_none());
    }

    #[test]
    fn replies_are_not_answered() {
        let proxy = ArpProxy::new(FAKE, vec![]);

        let mut frame = request("172.16.0.99");
        // Flip the operation to a reply.
        frame[EthernetFrame::HEADER_LEN + 7] = 2;

        assert!(proxy
            .process(&EthernetFrame::parse(&frame).unwrap())
            .is_none());
    }
}
