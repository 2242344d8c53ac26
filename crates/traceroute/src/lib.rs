//! Path discovery by TTL-limited echo probing.

use icmprobe_common::{
    convert_duration_to_ms, CancellationToken, ProbeResult, DEFAULT_MAX_HOPS,
    DEFAULT_PROBES_PER_HOP,
};
use icmprobe_probe::ProbeSequencer;
use icmprobe_result::{HopEntry, SerdeIpAddr, TracerouteReport};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TracerouteConfig {
    /// Highest TTL to probe. The probe budget is `max_hops *
    /// probes_per_hop`; running it out without an echo reply is a
    /// valid outcome, not an error.
    pub max_hops: u8,
    /// Probes sent per TTL before moving on.
    pub probes_per_hop: usize,
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            probes_per_hop: DEFAULT_PROBES_PER_HOP,
        }
    }
}

/// Everything learned about one TTL.
#[derive(Debug, Clone)]
pub struct HopRecord {
    pub ttl: u8,
    pub probes: Vec<ProbeResult>,
    /// First responder seen at this TTL, router or destination.
    pub responder: Option<IpAddr>,
}

impl HopRecord {
    pub fn reached_destination(&self) -> bool {
        self.probes.iter().any(|p| p.outcome.is_echo_reply())
    }

    pub fn best_rtt(&self) -> Option<Duration> {
        self.probes.iter().filter_map(|p| p.outcome.rtt()).min()
    }
}

/// Result of one traceroute run.
#[derive(Debug, Clone)]
pub struct TracerouteOutcome {
    pub hops: Vec<HopRecord>,
    pub reached: bool,
}

impl TracerouteOutcome {
    pub fn to_report(&self, target: IpAddr) -> TracerouteReport {
        TracerouteReport {
            target: target.into(),
            reached: self.reached,
            hops: self
                .hops
                .iter()
                .map(|hop| HopEntry {
                    ttl: hop.ttl,
                    ip_address: hop
                        .responder
                        .map(SerdeIpAddr::from)
                        .unwrap_or_else(SerdeIpAddr::empty),
                    rtt_ms: hop.best_rtt().map(convert_duration_to_ms),
                    reachable: hop.responder.is_some(),
                    is_dest: hop.reached_destination(),
                })
                .collect(),
        }
    }
}

/// Serial hop-by-hop probing loop over an owned sequencer.
pub struct TracerouteSession {
    sequencer: ProbeSequencer,
    target: IpAddr,
    config: TracerouteConfig,
}

impl TracerouteSession {
    pub fn new(sequencer: ProbeSequencer, target: IpAddr, config: TracerouteConfig) -> Self {
        Self {
            sequencer,
            target,
            config,
        }
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Probes TTL 1 upward until the destination answers, the TTL
    /// range is exhausted, or the token fires. Within one TTL, probing
    /// stops as soon as the destination itself replies.
    pub fn run(
        &mut self,
        cancel: &CancellationToken,
        mut on_hop: impl FnMut(&HopRecord),
    ) -> TracerouteOutcome {
        let mut hops = Vec::new();
        let mut reached = false;
        debug!(target = %self.target, max_hops = self.config.max_hops, "starting traceroute");

        'ttl: for ttl in 1..=self.config.max_hops {
            if cancel.is_cancelled() {
                break;
            }

            let mut record = HopRecord {
                ttl,
                probes: Vec::with_capacity(self.config.probes_per_hop),
                responder: None,
            };
            for _ in 0..self.config.probes_per_hop {
                if cancel.is_cancelled() {
                    if !record.probes.is_empty() {
                        on_hop(&record);
                        hops.push(record);
                    }
                    break 'ttl;
                }
                let result = self.sequencer.probe(Some(ttl));
                let done = result.outcome.is_echo_reply();
                if record.responder.is_none() {
                    record.responder = result.outcome.source();
                }
                record.probes.push(result);
                if done {
                    break;
                }
            }

            reached = record.reached_destination();
            on_hop(&record);
            hops.push(record);
            if reached {
                break;
            }
        }

        TracerouteOutcome { hops, reached }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icmprobe_common::{ProbeError, ReplyOutcome};
    use icmprobe_packets::testutil::{icmpv4_message, ipv4_datagram};
    use icmprobe_packets::{Transport, ICMP_ECHO_REPLY, ICMP_TIME_EXCEEDED};
    use icmprobe_probe::PacketMode;
    use std::net::Ipv4Addr;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 200);
    const SESSION: u16 = 0x7777;

    /// Simulates a path of `distance` hops: below it each TTL draws a
    /// time-exceeded from router 10.0.0.<ttl>, at or past it the
    /// destination answers.
    struct PathTransport {
        distance: u8,
        ttl: u8,
        pending: Option<(Vec<u8>, IpAddr)>,
        silent_ttls: Vec<u8>,
    }

    impl PathTransport {
        fn new(distance: u8) -> Self {
            Self {
                distance,
                ttl: 64,
                pending: None,
                silent_ttls: Vec::new(),
            }
        }
    }

    impl Transport for PathTransport {
        fn send(&mut self, datagram: &[u8], _dst: IpAddr) -> Result<(), ProbeError> {
            if self.silent_ttls.contains(&self.ttl) {
                return Ok(());
            }
            if self.ttl >= self.distance {
                let mut rest = [0u8; 4];
                rest.copy_from_slice(&datagram[4..8]);
                let reply = icmpv4_message(ICMP_ECHO_REPLY, rest, &datagram[8..]);
                self.pending = Some((ipv4_datagram(TARGET, &reply), IpAddr::V4(TARGET)));
            } else {
                let router = Ipv4Addr::new(10, 0, 0, self.ttl);
                let inner = ipv4_datagram(Ipv4Addr::new(10, 0, 0, 99), datagram);
                let exceeded = icmpv4_message(ICMP_TIME_EXCEEDED, [0u8; 4], &inner);
                self.pending = Some((ipv4_datagram(router, &exceeded), IpAddr::V4(router)));
            }
            Ok(())
        }

        fn recv_timeout(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<(usize, IpAddr), ProbeError> {
            match self.pending.take() {
                Some((reply, sender)) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok((reply.len(), sender))
                }
                None => Err(ProbeError::Timeout),
            }
        }

        fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError> {
            self.ttl = ttl;
            Ok(())
        }
    }

    fn session(transport: PathTransport, config: TracerouteConfig) -> TracerouteSession {
        let sequencer = ProbeSequencer::new(
            Box::new(transport),
            IpAddr::V4(TARGET),
            SESSION,
            PacketMode::Kernel,
            Duration::from_millis(5),
        )
        .unwrap();
        TracerouteSession::new(sequencer, IpAddr::V4(TARGET), config)
    }

    #[test]
    fn destination_four_hops_away() {
        let mut session = session(PathTransport::new(4), TracerouteConfig::default());
        let mut seen = 0;
        let outcome = session.run(&CancellationToken::default(), |_| seen += 1);

        assert!(outcome.reached);
        assert_eq!(outcome.hops.len(), 4);
        assert_eq!(seen, 4);

        for (idx, hop) in outcome.hops[..3].iter().enumerate() {
            let ttl = (idx + 1) as u8;
            assert_eq!(hop.ttl, ttl);
            assert_eq!(hop.responder, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))));
            assert!(!hop.reached_destination());
            assert!(hop
                .probes
                .iter()
                .all(|p| matches!(p.outcome, ReplyOutcome::TimeExceeded { .. })));
        }

        let last = &outcome.hops[3];
        assert_eq!(last.responder, Some(IpAddr::V4(TARGET)));
        assert!(last.reached_destination());
        // The destination answered the first probe, so the rest of the
        // hop's budget is skipped.
        assert_eq!(last.probes.len(), 1);
    }

    #[test]
    fn unreachable_within_max_hops() {
        let config = TracerouteConfig {
            max_hops: 3,
            probes_per_hop: 2,
        };
        let mut session = session(PathTransport::new(10), config);
        let outcome = session.run(&CancellationToken::default(), |_| {});

        assert!(!outcome.reached);
        assert_eq!(outcome.hops.len(), 3);
        for hop in &outcome.hops {
            assert_eq!(hop.probes.len(), 2);
            assert!(!hop.reached_destination());
        }
    }

    #[test]
    fn silent_hop_still_gets_a_record() {
        let mut transport = PathTransport::new(3);
        transport.silent_ttls.push(2);
        let mut session = session(
            transport,
            TracerouteConfig {
                max_hops: 5,
                probes_per_hop: 2,
            },
        );
        let outcome = session.run(&CancellationToken::default(), |_| {});

        assert!(outcome.reached);
        assert_eq!(outcome.hops.len(), 3);
        let silent = &outcome.hops[1];
        assert_eq!(silent.ttl, 2);
        assert_eq!(silent.responder, None);
        assert!(silent
            .probes
            .iter()
            .all(|p| p.outcome == ReplyOutcome::Timeout));
        assert_eq!(silent.best_rtt(), None);
    }

    #[test]
    fn cancellation_stops_between_hops() {
        let cancel = CancellationToken::default();
        let token = cancel.clone();
        let mut session = session(PathTransport::new(20), TracerouteConfig::default());
        let outcome = session.run(&cancel, |hop| {
            if hop.ttl == 2 {
                token.cancel();
            }
        });
        assert!(!outcome.reached);
        assert_eq!(outcome.hops.len(), 2);
    }

    #[test]
    fn report_marks_destination_and_silent_hops() {
        let mut transport = PathTransport::new(3);
        transport.silent_ttls.push(1);
        let mut session = session(transport, TracerouteConfig::default());
        let outcome = session.run(&CancellationToken::default(), |_| {});
        let report = outcome.to_report(IpAddr::V4(TARGET));

        assert!(report.reached);
        assert_eq!(report.hops.len(), 3);
        assert!(!report.hops[0].reachable);
        assert_eq!(report.hops[0].rtt_ms, None);
        assert!(report.hops[1].reachable);
        assert!(!report.hops[1].is_dest);
        assert!(report.hops[2].is_dest);
        assert_eq!(report.hops[2].ip_address, SerdeIpAddr(Some(IpAddr::V4(TARGET))));
        assert!(report.hops[2].rtt_ms.unwrap() >= 0.0);
    }
}
