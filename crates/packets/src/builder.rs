//! ICMP echo request serialization.

use crate::checksum::checksum;
use icmprobe_common::{IpFamily, ProbeIdentifier};
use std::net::Ipv4Addr;

/// Total size of an echo request datagram: 8 header bytes plus a
/// zero-filled payload, matching the packet size of common tools.
pub const ECHO_DATAGRAM_LEN: usize = 64;
/// Minimal IPv4 header emitted in header-include mode.
pub const IPV4_HEADER_LEN: usize = 20;
/// ICMP(v4/v6) echo and time-exceeded headers are all 8 bytes.
pub const ICMP_HEADER_LEN: usize = 8;
/// Fixed IPv6 header length; ICMPv6 time-exceeded embeds one.
pub const IPV6_HEADER_LEN: usize = 40;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;

pub const ICMP_PROTOCOL: u8 = 1;
pub const ICMPV6_PROTOCOL: u8 = 58;

/// Serializer for one ICMP echo request.
///
/// Field layout (byte offsets within the ICMP message, all
/// multi-byte fields big-endian): type 0, code 1, checksum 2..4,
/// identifier 4..6, sequence 6..8, zero payload 8..64.
#[derive(Debug, Clone, Copy)]
pub struct EchoRequest {
    pub ident: ProbeIdentifier,
}

impl EchoRequest {
    pub fn new(ident: ProbeIdentifier) -> Self {
        Self { ident }
    }

    /// Serializes an ICMP-only datagram; the kernel supplies the IP
    /// header.
    ///
    /// The v4 checksum covers the whole 64-byte buffer. The v6
    /// checksum is left zero: it covers a pseudo-header this layer
    /// never sees, so the kernel fills it in.
    pub fn encode(&self, family: IpFamily) -> Vec<u8> {
        let mut buf = vec![0u8; ECHO_DATAGRAM_LEN];
        buf[0] = match family {
            IpFamily::V4 => ICMP_ECHO_REQUEST,
            IpFamily::V6 => ICMPV6_ECHO_REQUEST,
        };
        buf[1] = 0;
        buf[4..6].copy_from_slice(&self.ident.id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.ident.seq.to_be_bytes());
        if family == IpFamily::V4 {
            let sum = checksum(&buf);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());
        }
        buf
    }

    /// Serializes a full IPv4 datagram for a transport opened in
    /// header-include mode: a minimal 20-byte header followed by the
    /// echo request, each layer checksummed independently.
    ///
    /// Identification mirrors the sequence number. Precondition: the
    /// transport must not let the kernel rebuild the IP header.
    pub fn encode_with_ipv4_header(&self, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> Vec<u8> {
        let icmp = self.encode(IpFamily::V4);
        let total_len = IPV4_HEADER_LEN + icmp.len();
        let mut buf = vec![0u8; IPV4_HEADER_LEN];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        buf[4..6].copy_from_slice(&self.ident.seq.to_be_bytes());
        buf[8] = ttl;
        buf[9] = ICMP_PROTOCOL;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        let sum = checksum(&buf);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
        buf.extend_from_slice(&icmp);
        buf
    }
}
