//! Wire-format construction, parsing, and the raw ICMP transport.

mod builder;
mod checksum;
mod classifier;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use builder::{
    EchoRequest, ECHO_DATAGRAM_LEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HEADER_LEN,
    ICMP_PROTOCOL, ICMP_TIME_EXCEEDED, ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST, ICMPV6_PROTOCOL,
    ICMPV6_TIME_EXCEEDED, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
};
pub use checksum::checksum;
pub use classifier::{classify, Classification};
pub use transport::Transport;

#[cfg(unix)]
pub use transport::RawIcmpTransport;
