//! Minimal OSI frame and packet views.
//!
//! The relay only ever needs a handful of fields out of each layer, so
//! these are thin borrowing views over the raw bytes. Every parser is
//! fail-silent: malformed or truncated input yields `None` and the caller
//! drops the frame.

use std::net::{Ipv4Addr, Ipv6Addr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit of the first octet.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }
}

impl std::fmt::Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

/// A parsed Ethernet II header.
#[derive(Debug, Clone, Copy)]
pub struct EthernetFrame<'a> {
    pub destination: Mac,
    pub source: Mac,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = 14;

    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < Self::HEADER_LEN {
            return None;
        }

        Some(Self {
            destination: Mac(frame[0..6].try_into().ok()?),
            source: Mac(frame[6..12].try_into().ok()?),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: &frame[Self::HEADER_LEN..],
        })
    }

    /// Build a frame around `payload`.
    pub fn build(destination: Mac, source: Mac, ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + payload.len());
        out.extend_from_slice(&destination.0);
        out.extend_from_slice(&source.0);
        out.extend_from_slice(&ethertype.to_be_bytes());
        out.extend_from_slice(payload);

        out
    }
}

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// An ARP packet for IPv4 over Ethernet. Other hardware or protocol types
/// fail to parse.
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_hardware: Mac,
    pub sender_protocol: Ipv4Addr,
    pub target_hardware: Mac,
    pub target_protocol: Ipv4Addr,
}

impl ArpPacket {
    pub const LEN: usize = 28;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }

        let hardware = u16::from_be_bytes([payload[0], payload[1]]);
        let protocol = u16::from_be_bytes([payload[2], payload[3]]);
        if hardware != 1 || protocol != ETHERTYPE_IPV4 || payload[4] != 6 || payload[5] != 4 {
            return None;
        }

        Some(Self {
            operation: u16::from_be_bytes([payload[6], payload[7]]),
            sender_hardware: Mac(payload[8..14].try_into().ok()?),
            sender_protocol: Ipv4Addr::from(<[u8; 4]>::try_from(&payload[14..18]).ok()?),
            target_hardware: Mac(payload[18..24].try_into().ok()?),
            target_protocol: Ipv4Addr::from(<[u8; 4]>::try_from(&payload[24..28]).ok()?),
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        out.push(6);
        out.push(4);
        out.extend_from_slice(&self.operation.to_be_bytes());
        out.extend_from_slice(&self.sender_hardware.0);
        out.extend_from_slice(&self.sender_protocol.octets());
        out.extend_from_slice(&self.target_hardware.0);
        out.extend_from_slice(&self.target_protocol.octets());

        out
    }
}

/// An IPv4 header view over a full packet.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub header_len: usize,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }

        let header_len = (packet[0] & 0x0F) as usize * 4;
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if header_len < 20 || total_len < header_len || packet.len() < total_len {
            return None;
        }

        Some(Self {
            header_len,
            protocol: packet[9],
            source: Ipv4Addr::from(<[u8; 4]>::try_from(&packet[12..16]).ok()?),
            destination: Ipv4Addr::from(<[u8; 4]>::try_from(&packet[16..20]).ok()?),
            payload: &packet[header_len..total_len],
        })
    }
}

/// The fixed IPv6 header. Extension headers are not walked: the relay only
/// needs addresses and the first next-header value.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Packet<'a> {
    pub next_header: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub const HEADER_LEN: usize = 40;

    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < Self::HEADER_LEN || packet[0] >> 4 != 6 {
            return None;
        }

        let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        if packet.len() < Self::HEADER_LEN + payload_len {
            return None;
        }

        Some(Self {
            next_header: packet[6],
            source: Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?),
            destination: Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?),
            payload: &packet[Self::HEADER_LEN..Self::HEADER_LEN + payload_len],
        })
    }
}

/// The RFC 1071 internet checksum.
pub fn internet_checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum = 0u32;
    for chunk in chunks {
        let mut iter = chunk.chunks_exact(2);
        for pair in &mut iter {
            sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }

        if let [odd] = iter.remainder() {
            sum += u32::from(u16::from_be_bytes([*odd, 0]));
        }
    }

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// The IPv6 pseudo header used by TCP/UDP/ICMPv6 checksums.
pub fn pseudo_header_v6(source: &Ipv6Addr, destination: &Ipv6Addr, length: u32, protocol: u8) -> [u8; 40] {
    let mut out = [0u8; 40];
    out[..16].copy_from_slice(&source.octets());
    out[16..32].copy_from_slice(&destination.octets());
    out[32..36].copy_from_slice(&length.to_be_bytes());
    out[39] = protocol;

    out
}

pub fn pseudo_header_v4(source: &Ipv4Addr, destination: &Ipv4Addr, length: u16, protocol: u8) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&source.octets());
    out[4..8].copy_from_slice(&destination.octets());
    out[9] = protocol;
    out[10..12].copy_from_slice(&length.to_be_bytes());

    out
}

/// TCP header fields relevant to MSS clamping.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub data_offset: usize,
    pub flags: u8,
}

pub const TCP_FLAG_SYN: u8 = 0x02;

impl TcpSegment {
    pub fn parse(segment: &[u8]) -> Option<Self> {
        if segment.len() < 20 {
            return None;
        }

        let data_offset = (segment[12] >> 4) as usize * 4;
        if data_offset < 20 || segment.len() < data_offset {
            return None;
        }

        Some(Self {
            data_offset,
            flags: segment[13],
        })
    }

    /// Find the MSS option inside the option block. Returns the byte offset
    /// of its 16 bit value within `segment`.
    pub fn find_mss_option(&self, segment: &[u8]) -> Option<usize> {
        let mut at = 20usize;
        while at < self.data_offset {
            match segment[at] {
                0 => return None,
                1 => at += 1,
                kind => {
                    let len = *segment.get(at + 1)? as usize;
                    if len < 2 || at + len > self.data_offset {
                        return None;
                    }

                    if kind == 2 && len == 4 {
                        return Some(at + 2);
                    }

                    at += len;
                }
            }
        }

        None
    }
}

/// Incrementally patch a 16 bit value inside a checksummed header,
/// adjusting the checksum per RFC 1624 (equation 3).
pub fn patch_u16(bytes: &mut [u8], value_at: usize, checksum_at: usize, new_value: u16) {
    let old_value = u16::from_be_bytes([bytes[value_at], bytes[value_at + 1]]);
    if old_value == new_value {
        return;
    }

    let checksum = u16::from_be_bytes([bytes[checksum_at], bytes[checksum_at + 1]]);
    let mut sum = u32::from(!checksum) + u32::from(!old_value) + u32::from(new_value);
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    bytes[value_at..value_at + 2].copy_from_slice(&new_value.to_be_bytes());
    bytes[checksum_at..checksum_at + 2].copy_from_slice(&(!(sum as u16)).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_parse_and_build() {
        let frame = EthernetFrame::build(
            Mac::BROADCAST,
            Mac([0, 1, 2, 3, 4, 5]),
            ETHERTYPE_ARP,
            &[0u8; 28],
        );

        let parsed = EthernetFrame::parse(&frame).unwrap();
        assert!(parsed.destination.is_broadcast());
        assert_eq!(parsed.source, Mac([0, 1, 2, 3, 4, 5]));
        assert_eq!(parsed.ethertype, ETHERTYPE_ARP);
        assert_eq!(parsed.payload.len(), 28);

        assert!(EthernetFrame::parse(&frame[..10]).is_none());
    }

    #[test]
    fn arp_round_trip() {
        let packet = ArpPacket {
            operation: ARP_REQUEST,
            sender_hardware: Mac([1; 6]),
            sender_protocol: "10.0.0.1".parse().unwrap(),
            target_hardware: Mac([0; 6]),
            target_protocol: "10.0.0.2".parse().unwrap(),
        };

        let parsed = ArpPacket::parse(&packet.build()).unwrap();
        assert_eq!(parsed.operation, ARP_REQUEST);
        assert_eq!(parsed.target_protocol, packet.target_protocol);
    }

    #[test]
    fn ipv4_parse() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&40u16.to_be_bytes());
        packet[9] = IPPROTO_TCP;
        packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let parsed = Ipv4Packet::parse(&packet).unwrap();
        assert_eq!(parsed.protocol, IPPROTO_TCP);
        assert_eq!(parsed.source, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(parsed.payload.len(), 20);

        // Not IPv4.
        packet[0] = 0x65;
        assert!(Ipv4Packet::parse(&packet).is_none());
    }

    #[test]
    fn checksum_is_zero_over_a_valid_header() {
        // A known-good IPv4 header (checksum field included).
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];

        assert_eq!(internet_checksum(&[&header]), 0);
    }

    #[test]
    fn mss_option_is_found_and_patched() {
        // 24 byte TCP header: SYN with a single MSS option of 1460.
        let mut segment = vec![0u8; 24];
        segment[12] = 6 << 4;
        segment[13] = TCP_FLAG_SYN;
        segment[20] = 2;
        segment[21] = 4;
        segment[22..24].copy_from_slice(&1460u16.to_be_bytes());

        // Give the segment a valid checksum first.
        let checksum = internet_checksum(&[&segment]);
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());

        let tcp = TcpSegment::parse(&segment).unwrap();
        let at = tcp.find_mss_option(&segment).unwrap();
        assert_eq!(at, 22);

        patch_u16(&mut segment, at, 16, 1300);
        assert_eq!(u16::from_be_bytes([segment[22], segment[23]]), 1300);
        assert_eq!(internet_checksum(&[&segment]), 0);
    }
}
