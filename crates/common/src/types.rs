//! Core data model shared by every probe session.

use std::net::IpAddr;
use std::process;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Address family of a resolved probe target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

static SESSION_COUNTER: AtomicU16 = AtomicU16::new(1);

/// Returns a 16-bit identifier unique enough to tell one session's
/// replies apart from co-resident ICMP tools on the same host.
///
/// The process id disambiguates across processes; the counter keeps
/// multiple sessions inside one process distinct.
pub fn next_session_id() -> u16 {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    (process::id() as u16) ^ counter.rotate_left(8)
}

/// Identifier/sequence pair carried in an echo request.
///
/// The identifier is fixed for the session; the sequence number
/// advances per probe and wraps at 65536.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeIdentifier {
    pub id: u16,
    pub seq: u16,
}

/// What a single probe attempt resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The receive window closed with no inbound traffic at all.
    Timeout,
    /// A send or receive failed at the socket layer.
    TransportError(String),
    /// The destination answered our echo request.
    EchoReply { source: IpAddr, rtt: Duration },
    /// A router discarded the probe when its TTL ran out.
    TimeExceeded { source: IpAddr, rtt: Duration },
    /// Traffic arrived during the window but none of it matched.
    Unrecognized,
}

impl ReplyOutcome {
    pub fn is_echo_reply(&self) -> bool {
        matches!(self, Self::EchoReply { .. })
    }

    pub fn source(&self) -> Option<IpAddr> {
        match self {
            Self::EchoReply { source, .. } | Self::TimeExceeded { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        match self {
            Self::EchoReply { rtt, .. } | Self::TimeExceeded { rtt, .. } => Some(*rtt),
            _ => None,
        }
    }
}

/// Record of one completed probe round trip.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ident: ProbeIdentifier,
    /// Monotonic time from send to outcome resolution.
    pub elapsed: Duration,
    pub outcome: ReplyOutcome,
}
