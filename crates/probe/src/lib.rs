//! One send/receive probe round trip with monotonic timing.
//!
//! A probe moves through Idle → Sent → (Classifying | TimedOut |
//! Errored) → Done. Each transition is driven here; the sessions
//! above only decide how many probes to run and with which TTL.

use icmprobe_common::{IpFamily, ProbeError, ProbeIdentifier, ProbeResult, ReplyOutcome};
use icmprobe_packets::{classify, Classification, EchoRequest, Transport};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Large enough for any reply we care about: outer IP header,
/// time-exceeded header, embedded original datagram.
const RECV_BUFFER_LEN: usize = 1024;

/// TTL used when a header-include probe does not specify one.
const DEFAULT_TTL: u8 = 64;

/// How the IP header of outgoing probes is produced.
#[derive(Debug, Clone, Copy)]
pub enum PacketMode {
    /// The kernel builds the IP header; TTL set via socket option.
    Kernel,
    /// We emit the IPv4 header ourselves. Requires a transport opened
    /// in header-include mode and an IPv4 target.
    HeaderIncluded { src: std::net::Ipv4Addr },
}

/// Drives individual probes over an exclusively owned transport.
///
/// Sequence numbers advance monotonically per probe and wrap at
/// 65536; the receive window for a probe opens only after its send
/// completes and closes before the next probe's send, so a matching
/// identifier plus sequence is never ambiguous.
pub struct ProbeSequencer {
    transport: Box<dyn Transport>,
    target: IpAddr,
    family: IpFamily,
    mode: PacketMode,
    session_id: u16,
    seq: u16,
    timeout: Duration,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for ProbeSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSequencer")
            .field("target", &self.target)
            .field("family", &self.family)
            .field("mode", &self.mode)
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProbeSequencer {
    pub fn new(
        transport: Box<dyn Transport>,
        target: IpAddr,
        session_id: u16,
        mode: PacketMode,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        if matches!(mode, PacketMode::HeaderIncluded { .. }) && !target.is_ipv4() {
            return Err(ProbeError::InvalidAddress(
                "header-include mode requires an IPv4 target".to_string(),
            ));
        }
        Ok(Self {
            family: IpFamily::of(target),
            transport,
            target,
            mode,
            session_id,
            seq: 0,
            timeout,
            buffer: vec![0u8; RECV_BUFFER_LEN],
        })
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Runs one probe: send, then wait for a matching reply within
    /// the timeout.
    ///
    /// Transport failures resolve to a `TransportError` outcome
    /// rather than an error; a single bad probe never ends the
    /// enclosing session.
    pub fn probe(&mut self, ttl: Option<u8>) -> ProbeResult {
        let ident = ProbeIdentifier {
            id: self.session_id,
            seq: self.seq,
        };
        self.seq = self.seq.wrapping_add(1);

        if let (PacketMode::Kernel, Some(ttl)) = (self.mode, ttl) {
            if let Err(err) = self.transport.set_ttl(ttl) {
                return errored(ident, Duration::ZERO, err);
            }
        }

        let datagram = match (self.mode, self.target) {
            (PacketMode::Kernel, _) => EchoRequest::new(ident).encode(self.family),
            (PacketMode::HeaderIncluded { src }, IpAddr::V4(dst)) => {
                EchoRequest::new(ident).encode_with_ipv4_header(src, dst, ttl.unwrap_or(DEFAULT_TTL))
            }
            (PacketMode::HeaderIncluded { .. }, IpAddr::V6(_)) => {
                // Ruled out by the constructor.
                return errored(
                    ident,
                    Duration::ZERO,
                    ProbeError::InvalidAddress("header-include mode with IPv6 target".to_string()),
                );
            }
        };

        debug!(id = ident.id, seq = ident.seq, ttl = ?ttl, "sending echo request");
        let sent_at = Instant::now();
        if let Err(err) = self.transport.send(&datagram, self.target) {
            return errored(ident, sent_at.elapsed(), err);
        }

        self.await_reply(ident, sent_at)
    }

    /// Waits out the probe's receive window. Traffic that fails the
    /// identifier or sequence check is ignored and the wait continues
    /// on whatever budget remains.
    fn await_reply(&mut self, ident: ProbeIdentifier, sent_at: Instant) -> ProbeResult {
        let deadline = sent_at + self.timeout;
        let mut saw_unmatched = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self.transport.recv_timeout(&mut self.buffer, remaining) {
                Ok((len, sender)) => {
                    match classify(self.family, &self.buffer[..len], sender, ident.id) {
                        Ok(Classification::EchoReply { source, seq }) if seq == ident.seq => {
                            let rtt = sent_at.elapsed();
                            debug!(seq = ident.seq, source = %source, "echo reply");
                            return ProbeResult {
                                ident,
                                elapsed: rtt,
                                outcome: ReplyOutcome::EchoReply { source, rtt },
                            };
                        }
                        Ok(Classification::TimeExceeded { source, seq }) if seq == ident.seq => {
                            let rtt = sent_at.elapsed();
                            debug!(seq = ident.seq, source = %source, "time exceeded");
                            return ProbeResult {
                                ident,
                                elapsed: rtt,
                                outcome: ReplyOutcome::TimeExceeded { source, rtt },
                            };
                        }
                        Ok(other) => {
                            trace!(classification = ?other, "packet does not match this probe");
                            saw_unmatched = true;
                        }
                        Err(err) if err.is_retryable() => {
                            trace!(error = %err, "ignoring malformed packet");
                            saw_unmatched = true;
                        }
                        Err(err) => return errored(ident, sent_at.elapsed(), err),
                    }
                }
                Err(ProbeError::Timeout) => break,
                Err(err) => return errored(ident, sent_at.elapsed(), err),
            }
        }

        let elapsed = sent_at.elapsed();
        let outcome = if saw_unmatched {
            ReplyOutcome::Unrecognized
        } else {
            ReplyOutcome::Timeout
        };
        ProbeResult {
            ident,
            elapsed,
            outcome,
        }
    }
}

fn errored(ident: ProbeIdentifier, elapsed: Duration, err: ProbeError) -> ProbeResult {
    ProbeResult {
        ident,
        elapsed,
        outcome: ReplyOutcome::TransportError(err.to_string()),
    }
}
