//! Inbound ICMP parsing and probe matching.

use crate::builder::{
    ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HEADER_LEN, ICMP_TIME_EXCEEDED, ICMPV6_ECHO_REPLY,
    ICMPV6_ECHO_REQUEST, ICMPV6_TIME_EXCEEDED, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
};
use icmprobe_common::{IpFamily, ProbeError};
use std::net::IpAddr;
use tracing::trace;

/// What an inbound datagram turned out to be.
///
/// The source address is the transport-level sender, not anything
/// embedded in the payload: forwarding may rewrite embedded headers,
/// but the outer sender is who actually answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The destination answered an echo request of ours.
    EchoReply { source: IpAddr, seq: u16 },
    /// A router discarded a probe of ours when its TTL ran out.
    TimeExceeded { source: IpAddr, seq: u16 },
    /// Valid ICMP, but not addressed to this session.
    Unrecognized,
}

/// Classifies `buf` as received from `sender` against this session's
/// identifier.
///
/// For IPv4 the kernel prepends the IP header even when we did not
/// send one, so the ICMP message starts after `ihl * 4` bytes. For
/// ICMPv6 raw sockets the kernel strips the IP header and the message
/// starts at byte 0. Anything too short to hold the headers it claims
/// is a malformed reply, never a panic.
pub fn classify(
    family: IpFamily,
    buf: &[u8],
    sender: IpAddr,
    session_id: u16,
) -> Result<Classification, ProbeError> {
    match family {
        IpFamily::V4 => classify_v4(buf, sender, session_id),
        IpFamily::V6 => classify_v6(buf, sender, session_id),
    }
}

fn too_short(expected: usize, actual: usize) -> ProbeError {
    ProbeError::MalformedReply { expected, actual }
}

/// Reads the identifier and sequence fields of an echo message.
fn echo_fields(icmp: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    )
}

fn classify_v4(buf: &[u8], sender: IpAddr, session_id: u16) -> Result<Classification, ProbeError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(too_short(IPV4_HEADER_LEN, buf.len()));
    }
    let ihl = ((buf[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || buf.len() < ihl + ICMP_HEADER_LEN {
        return Err(too_short(ihl.max(IPV4_HEADER_LEN) + ICMP_HEADER_LEN, buf.len()));
    }
    let icmp = &buf[ihl..];

    match icmp[0] {
        ICMP_ECHO_REPLY => {
            let (id, seq) = echo_fields(icmp);
            if id != session_id {
                trace!(expected = session_id, actual = id, "echo reply for another session");
                return Ok(Classification::Unrecognized);
            }
            Ok(Classification::EchoReply { source: sender, seq })
        }
        ICMP_TIME_EXCEEDED => {
            // The offending datagram is embedded after the ICMP
            // header: its IP header plus at least the first 8 bytes
            // of our original echo request.
            let inner = &icmp[ICMP_HEADER_LEN..];
            if inner.len() < IPV4_HEADER_LEN {
                return Err(too_short(IPV4_HEADER_LEN, inner.len()));
            }
            let inner_ihl = ((inner[0] & 0x0f) as usize) * 4;
            if inner_ihl < IPV4_HEADER_LEN || inner.len() < inner_ihl + ICMP_HEADER_LEN {
                return Err(too_short(
                    inner_ihl.max(IPV4_HEADER_LEN) + ICMP_HEADER_LEN,
                    inner.len(),
                ));
            }
            let inner_icmp = &inner[inner_ihl..];
            if inner_icmp[0] != ICMP_ECHO_REQUEST {
                return Ok(Classification::Unrecognized);
            }
            let (id, seq) = echo_fields(inner_icmp);
            if id != session_id {
                trace!(expected = session_id, actual = id, "time exceeded for another session");
                return Ok(Classification::Unrecognized);
            }
            Ok(Classification::TimeExceeded { source: sender, seq })
        }
        _ => Ok(Classification::Unrecognized),
    }
}

fn classify_v6(buf: &[u8], sender: IpAddr, session_id: u16) -> Result<Classification, ProbeError> {
    if buf.len() < ICMP_HEADER_LEN {
        return Err(too_short(ICMP_HEADER_LEN, buf.len()));
    }

    match buf[0] {
        ICMPV6_ECHO_REPLY => {
            let (id, seq) = echo_fields(buf);
            if id != session_id {
                trace!(expected = session_id, actual = id, "echo reply for another session");
                return Ok(Classification::Unrecognized);
            }
            Ok(Classification::EchoReply { source: sender, seq })
        }
        ICMPV6_TIME_EXCEEDED => {
            // The embedded datagram carries a fixed 40-byte IPv6
            // header followed by our echo request.
            let inner = &buf[ICMP_HEADER_LEN..];
            if inner.len() < IPV6_HEADER_LEN + ICMP_HEADER_LEN {
                return Err(too_short(IPV6_HEADER_LEN + ICMP_HEADER_LEN, inner.len()));
            }
            let inner_icmp = &inner[IPV6_HEADER_LEN..];
            if inner_icmp[0] != ICMPV6_ECHO_REQUEST {
                return Ok(Classification::Unrecognized);
            }
            let (id, seq) = echo_fields(inner_icmp);
            if id != session_id {
                trace!(expected = session_id, actual = id, "time exceeded for another session");
                return Ok(Classification::Unrecognized);
            }
            Ok(Classification::TimeExceeded { source: sender, seq })
        }
        _ => Ok(Classification::Unrecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EchoRequest;
    use crate::checksum::checksum;
    use crate::testutil::{icmpv4_message, icmpv6_message, ipv4_datagram, ipv6_datagram};
    use icmprobe_common::ProbeIdentifier;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SESSION: u16 = 0x4d2f;

    fn v4_sender() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))
    }

    fn v6_sender() -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x99))
    }

    fn echo_rest(id: u16, seq: u16) -> [u8; 4] {
        let mut rest = [0u8; 4];
        rest[..2].copy_from_slice(&id.to_be_bytes());
        rest[2..].copy_from_slice(&seq.to_be_bytes());
        rest
    }

    #[test]
    fn v4_echo_reply_matches() {
        let reply = icmpv4_message(ICMP_ECHO_REPLY, echo_rest(SESSION, 3), &[0u8; 56]);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &reply);

        let got = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap();
        assert_eq!(
            got,
            Classification::EchoReply {
                source: v4_sender(),
                seq: 3
            }
        );
    }

    #[test]
    fn v4_echo_reply_other_session_is_unrecognized() {
        let reply = icmpv4_message(ICMP_ECHO_REPLY, echo_rest(SESSION ^ 0xffff, 3), &[]);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &reply);

        let got = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap();
        assert_eq!(got, Classification::Unrecognized);
    }

    #[test]
    fn v4_time_exceeded_matches_embedded_request() {
        // Embed the exact datagram the builder would have sent.
        let original = EchoRequest::new(ProbeIdentifier { id: SESSION, seq: 11 })
            .encode(IpFamily::V4);
        let inner = ipv4_datagram(Ipv4Addr::new(10, 0, 0, 2), &original);
        let exceeded = icmpv4_message(ICMP_TIME_EXCEEDED, [0u8; 4], &inner);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &exceeded);

        let got = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap();
        assert_eq!(
            got,
            Classification::TimeExceeded {
                source: v4_sender(),
                seq: 11
            }
        );
    }

    #[test]
    fn v4_time_exceeded_for_other_session_is_unrecognized() {
        let original = EchoRequest::new(ProbeIdentifier {
            id: SESSION ^ 0x00ff,
            seq: 11,
        })
        .encode(IpFamily::V4);
        let inner = ipv4_datagram(Ipv4Addr::new(10, 0, 0, 2), &original);
        let exceeded = icmpv4_message(ICMP_TIME_EXCEEDED, [0u8; 4], &inner);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &exceeded);

        let got = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap();
        assert_eq!(got, Classification::Unrecognized);
    }

    #[test]
    fn v4_unrelated_type_is_unrecognized() {
        // Destination unreachable.
        let msg = icmpv4_message(3, [0u8; 4], &[0u8; 28]);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &msg);

        let got = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap();
        assert_eq!(got, Classification::Unrecognized);
    }

    #[test]
    fn v4_short_buffers_are_malformed() {
        for len in [0usize, 1, 19, 21] {
            let buf = vec![0x45u8; len];
            let err = classify(IpFamily::V4, &buf, v4_sender(), SESSION).unwrap_err();
            assert!(
                matches!(err, ProbeError::MalformedReply { .. }),
                "len {}",
                len
            );
        }
    }

    #[test]
    fn v4_truncated_time_exceeded_is_malformed() {
        let exceeded = icmpv4_message(ICMP_TIME_EXCEEDED, [0u8; 4], &[0u8; 6]);
        let packet = ipv4_datagram(Ipv4Addr::new(198, 51, 100, 7), &exceeded);
        let err = classify(IpFamily::V4, &packet, v4_sender(), SESSION).unwrap_err();
        assert!(matches!(err, ProbeError::MalformedReply { .. }));
    }

    #[test]
    fn builder_fields_round_trip_through_classifier() {
        // Identifier and sequence written by the builder re-read
        // exactly after the type is flipped to a reply.
        let ident = ProbeIdentifier { id: 0x8001, seq: 0xfffe };
        let mut msg = EchoRequest::new(ident).encode(IpFamily::V4);
        msg[0] = ICMP_ECHO_REPLY;
        msg[2..4].copy_from_slice(&[0, 0]);
        let sum = checksum(&msg);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        let packet = ipv4_datagram(Ipv4Addr::new(192, 0, 2, 1), &msg);

        let got = classify(IpFamily::V4, &packet, v4_sender(), ident.id).unwrap();
        assert_eq!(
            got,
            Classification::EchoReply {
                source: v4_sender(),
                seq: ident.seq
            }
        );
    }

    #[test]
    fn v6_echo_reply_starts_at_byte_zero() {
        let msg = icmpv6_message(ICMPV6_ECHO_REPLY, echo_rest(SESSION, 5), &[0u8; 56]);

        let got = classify(IpFamily::V6, &msg, v6_sender(), SESSION).unwrap();
        assert_eq!(
            got,
            Classification::EchoReply {
                source: v6_sender(),
                seq: 5
            }
        );
    }

    #[test]
    fn v6_time_exceeded_matches_embedded_request() {
        let original = EchoRequest::new(ProbeIdentifier { id: SESSION, seq: 2 })
            .encode(IpFamily::V6);
        let inner = ipv6_datagram(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
            &original,
        );
        let msg = icmpv6_message(ICMPV6_TIME_EXCEEDED, [0u8; 4], &inner);

        let got = classify(IpFamily::V6, &msg, v6_sender(), SESSION).unwrap();
        assert_eq!(
            got,
            Classification::TimeExceeded {
                source: v6_sender(),
                seq: 2
            }
        );
    }

    #[test]
    fn v6_short_buffer_is_malformed() {
        let err = classify(IpFamily::V6, &[129, 0, 0], v6_sender(), SESSION).unwrap_err();
        assert!(matches!(err, ProbeError::MalformedReply { .. }));
    }
}
