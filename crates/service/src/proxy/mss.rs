//! TCP MSS clamping.
//!
//! Tunnelled TCP connections negotiate their MSS against the physical
//! interface MTU, which overshoots once the FSCP overhead is added. The
//! clamp rewrites the MSS option of any SYN passing in either direction
//! and patches the checksum incrementally.

use crate::osi::{self, IPPROTO_TCP, Ipv4Packet, Ipv6Packet, TCP_FLAG_SYN, TcpSegment};

/// Clamp the MSS option of a raw IP packet in place. Non-TCP and non-SYN
/// packets pass through untouched.
pub fn clamp(packet: &mut [u8], max_mss: u16) {
    match packet.first().map(|it| it >> 4) {
        Some(4) => clamp_v4(packet, max_mss),
        Some(6) => clamp_v6(packet, max_mss),
        _ => {}
    }
}

fn clamp_v4(packet: &mut [u8], max_mss: u16) {
    let Some(parsed) = Ipv4Packet::parse(packet) else {
        return;
    };

    if parsed.protocol != IPPROTO_TCP {
        return;
    }

    let header_len = parsed.header_len;
    clamp_tcp(&mut packet[header_len..], max_mss);
}

fn clamp_v6(packet: &mut [u8], max_mss: u16) {
    let Some(parsed) = Ipv6Packet::parse(packet) else {
        return;
    };

    if parsed.next_header != IPPROTO_TCP {
        return;
    }

    clamp_tcp(&mut packet[Ipv6Packet::HEADER_LEN..], max_mss);
}

fn clamp_tcp(segment: &mut [u8], max_mss: u16) {
    let Some(tcp) = TcpSegment::parse(segment) else {
        return;
    };

    if tcp.flags & TCP_FLAG_SYN == 0 {
        return;
    }

    let Some(value_at) = tcp.find_mss_option(segment) else {
        return;
    };

    let current = u16::from_be_bytes([segment[value_at], segment[value_at + 1]]);
    if current > max_mss {
        log::trace!("clamping tcp mss {} -> {}", current, max_mss);
        osi::patch_u16(segment, value_at, 16, max_mss);
    }
}
