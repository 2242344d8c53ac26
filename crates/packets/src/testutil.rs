//! Wire-format helpers for building inbound packets in tests.

use crate::builder::{ICMP_PROTOCOL, ICMPV6_PROTOCOL, IPV4_HEADER_LEN, IPV6_HEADER_LEN};
use crate::checksum::checksum;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Wraps `payload` in a minimal IPv4 header carrying ICMP, the way
/// the kernel hands raw-socket reads to us.
pub fn ipv4_datagram(src: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; IPV4_HEADER_LEN];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[8] = 64;
    buf[9] = ICMP_PROTOCOL;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&Ipv4Addr::new(203, 0, 113, 9).octets());
    let sum = checksum(&buf);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Wraps `payload` in a fixed IPv6 header carrying ICMPv6; used for
/// the embedded datagram inside time-exceeded messages.
pub fn ipv6_datagram(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; IPV6_HEADER_LEN];
    buf[0] = 0x60;
    buf[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buf[6] = ICMPV6_PROTOCOL;
    buf[7] = 64;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());
    buf.extend_from_slice(payload);
    buf
}

/// Builds an ICMPv4 message: type, code 0, computed checksum, four
/// rest-of-header bytes, payload.
pub fn icmpv4_message(icmp_type: u8, rest: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + payload.len()];
    buf[0] = icmp_type;
    buf[4..8].copy_from_slice(&rest);
    buf[8..].copy_from_slice(payload);
    let sum = checksum(&buf);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// Builds an ICMPv6 message. The checksum is left zero: it covers a
/// pseudo-header and the classifier does not validate it.
pub fn icmpv6_message(icmp_type: u8, rest: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + payload.len()];
    buf[0] = icmp_type;
    buf[4..8].copy_from_slice(&rest);
    buf[8..].copy_from_slice(payload);
    buf
}
