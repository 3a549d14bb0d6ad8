//! A minimal DHCP responder.
//!
//! Answers DISCOVER with OFFER and REQUEST with ACK out of a static
//! `MAC -> (address, prefix)` table, posing as a server at the adapter's
//! own address. Nothing here ever reaches the wire; it only persuades the
//! local kernel to take a statically planned address.

use std::net::Ipv4Addr;

use ahash::{HashMap, HashMapExt};

use crate::osi::{
    ETHERTYPE_IPV4, EthernetFrame, IPPROTO_UDP, Ipv4Packet, Mac, internet_checksum,
};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_MAGIC_COOKIE: u32 = 0x6382_5363;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MESSAGE_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_END: u8 = 255;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;

pub struct DhcpProxy {
    server_hardware_address: Mac,
    server_address: Ipv4Addr,
    leases: HashMap<Mac, (Ipv4Addr, u8)>,
}

impl DhcpProxy {
    pub fn new(server_hardware_address: Mac, server_address: Ipv4Addr) -> Self {
        Self {
            server_hardware_address,
            server_address,
            leases: HashMap::with_capacity(4),
        }
    }

    /// Plan an address for a hardware address.
    pub fn add_lease(&mut self, hardware_address: Mac, address: Ipv4Addr, prefix_len: u8) {
        self.leases
            .insert(hardware_address, (address, prefix_len));
    }

    /// Answer a DHCP request frame, if it is one and a lease is planned
    /// for its sender.
    pub fn process(&mut self, frame: &EthernetFrame<'_>) -> Option<Vec<u8>> {
        let packet = Ipv4Packet::parse(frame.payload)?;
        if packet.protocol != IPPROTO_UDP || packet.payload.len() < 8 {
            return None;
        }

        let destination_port = u16::from_be_bytes([packet.payload[2], packet.payload[3]]);
        if destination_port != DHCP_SERVER_PORT {
            return None;
        }

        let bootp = &packet.payload[8..];
        // Fixed BOOTP header plus the magic cookie and at least one option.
        if bootp.len() < 241 || bootp[0] != BOOTREQUEST {
            return None;
        }

        if u32::from_be_bytes([bootp[236], bootp[237], bootp[238], bootp[239]])
            != DHCP_MAGIC_COOKIE
        {
            return None;
        }

        let client = Mac(bootp[28..34].try_into().ok()?);
        let (address, prefix_len) = *self.leases.get(&client)?;

        let message_type = find_option(&bootp[240..], OPTION_MESSAGE_TYPE)?;
        let reply_type = match message_type.first()? {
            &DISCOVER => OFFER,
            &REQUEST => ACK,
            _ => return None,
        };

        log::debug!(
            "dhcp: answering {} for {} with {}/{}",
            if reply_type == OFFER { "discover" } else { "request" },
            client,
            address,
            prefix_len
        );

        let xid: [u8; 4] = bootp[4..8].try_into().ok()?;
        Some(self.build_reply(client, xid, address, prefix_len, reply_type))
    }

    fn build_reply(
        &self,
        client: Mac,
        xid: [u8; 4],
        address: Ipv4Addr,
        prefix_len: u8,
        reply_type: u8,
    ) -> Vec<u8> {
        let mut bootp = vec![0u8; 240];
        bootp[0] = BOOTREPLY;
        bootp[1] = 1; // ethernet
        bootp[2] = 6;
        bootp[4..8].copy_from_slice(&xid);
        bootp[16..20].copy_from_slice(&address.octets()); // yiaddr
        bootp[20..24].copy_from_slice(&self.server_address.octets()); // siaddr
        bootp[28..34].copy_from_slice(&client.0);
        bootp[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE.to_be_bytes());

        let mask = match prefix_len {
            0 => 0u32,
            len => u32::MAX << (32 - u32::from(len.min(32))),
        };

        bootp.extend_from_slice(&[OPTION_MESSAGE_TYPE, 1, reply_type]);
        bootp.extend_from_slice(&[OPTION_SERVER_ID, 4]);
        bootp.extend_from_slice(&self.server_address.octets());
        bootp.extend_from_slice(&[OPTION_SUBNET_MASK, 4]);
        bootp.extend_from_slice(&mask.to_be_bytes());
        // An indefinite lease; the table is static anyway.
        bootp.extend_from_slice(&[OPTION_LEASE_TIME, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
        bootp.push(OPTION_END);

        // UDP header. The checksum is optional over IPv4 and left zero.
        let mut udp = Vec::with_capacity(8 + bootp.len());
        udp.extend_from_slice(&DHCP_SERVER_PORT.to_be_bytes());
        udp.extend_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
        udp.extend_from_slice(&((8 + bootp.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(&bootp);

        // IPv4 header towards the broadcast address.
        let total_len = (20 + udp.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64; // ttl
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&self.server_address.octets());
        ip[16..20].copy_from_slice(&Ipv4Addr::BROADCAST.octets());

        let checksum = internet_checksum(&[&ip]);
        ip[10..12].copy_from_slice(&checksum.to_be_bytes());
        ip.extend_from_slice(&udp);

        EthernetFrame::build(client, self.server_hardware_address, ETHERTYPE_IPV4, &ip)
    }
}

/// Walk the option block for one option's payload.
fn find_option(options: &[u8], wanted: u8) -> Option<&[u8]> {
    let mut at = 0usize;
    while at < options.len() {
        match options[at] {
            OPTION_END => return None,
            0 => at += 1, // padding
            kind => {
                let len = *options.get(at + 1)? as usize;
                let payload = options.get(at + 2..at + 2 + len)?;
                if kind == wanted {
                    return Some(payload);
                }

                at += 2 + len;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_MAC: Mac = Mac([0x0A, 0, 0x27, 0, 0, 0x01]);
    const CLIENT_MAC: Mac = Mac([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn proxy() -> DhcpProxy {
        let mut proxy = DhcpProxy::new(SERVER_MAC, "172.16.0.1".parse().unwrap());
        proxy.add_lease(CLIENT_MAC, "172.16.0.10".parse().unwrap(), 24);

        proxy
    }

    fn request_frame(message_type: u8) -> Vec<u8> {
        let mut bootp = vec![0u8; 240];
        bootp[0] = BOOTREQUEST;
        bootp[1] = 1;
        bootp[2] = 6;
        bootp[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        bootp[28..34].copy_from_slice(&CLIENT_MAC.0);
        bootp[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE.to_be_bytes());
        bootp.extend_from_slice(&[OPTION_MESSAGE_TYPE, 1, message_type, OPTION_END]);

        let mut udp = Vec::new();
        udp.extend_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
        udp.extend_from_slice(&DHCP_SERVER_PORT.to_be_bytes());
        udp.extend_from_slice(&((8 + bootp.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(&bootp);

        let total_len = (20 + udp.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = IPPROTO_UDP;
        ip[16..20].copy_from_slice(&Ipv4Addr::BROADCAST.octets());
        ip.extend_from_slice(&udp);

        EthernetFrame::build(Mac::BROADCAST, CLIENT_MAC, ETHERTYPE_IPV4, &ip)
    }

    fn reply_bootp(reply: &[u8]) -> &[u8] {
        let frame = EthernetFrame::parse(reply).unwrap();
        // Ethernet + IPv4 (20) + UDP (8).
        &frame.payload[28..]
    }

    #[test]
    fn discover_gets_an_offer() {
        let mut proxy = proxy();
        let frame = request_frame(DISCOVER);

        let reply = proxy
            .process(&EthernetFrame::parse(&frame).unwrap())
            .unwrap();

        let parsed = EthernetFrame::parse(&reply).unwrap();
        assert_eq!(parsed.destination, CLIENT_MAC);
        assert_eq!(parsed.source, SERVER_MAC);

        let bootp = reply_bootp(&reply);
        assert_eq!(bootp[0], BOOTREPLY);
        assert_eq!(&bootp[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bootp[16..20], &[172, 16, 0, 10]);
        assert_eq!(find_option(&bootp[240..], OPTION_MESSAGE_TYPE), Some(&[OFFER][..]));
        assert_eq!(
            find_option(&bootp[240..], OPTION_SUBNET_MASK),
            Some(&[255, 255, 255, 0][..])
        );
    }

    #[test]
    fn request_gets_an_ack() {
        let mut proxy = proxy();
        let frame = request_frame(REQUEST);

        let reply = proxy
            .process(&EthernetFrame::parse(&frame).unwrap())
            .unwrap();
        let bootp = reply_bootp(&reply);

        assert_eq!(find_option(&bootp[240..], OPTION_MESSAGE_TYPE), Some(&[ACK][..]));
        assert_eq!(
            find_option(&bootp[240..], OPTION_SERVER_ID),
            Some(&[172, 16, 0, 1][..])
        );
    }

    #[test]
    fn unknown_clients_are_ignored() {
        let mut proxy = DhcpProxy::new(SERVER_MAC, "172.16.0.1".parse().unwrap());
        let frame = request_frame(DISCOVER);

        assert!(proxy
            .process(&EthernetFrame::parse(&frame).unwrap())
            .is_none());
    }
}
