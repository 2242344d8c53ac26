//! Repeated echo probing of a single target.

use icmprobe_common::{
    convert_duration_to_ms, CancellationToken, ProbeResult, DEFAULT_PING_COUNT,
    DEFAULT_PING_INTERVAL_MS,
};
use icmprobe_probe::ProbeSequencer;
use icmprobe_result::{PingReport, RttStats};
use std::net::IpAddr;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How a ping session paces itself.
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Number of probes to run; `None` runs until cancelled.
    pub count: Option<u64>,
    /// Skips the inter-probe pause entirely.
    pub flood: bool,
    /// Pause between consecutive probes when not flooding.
    pub interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            count: Some(DEFAULT_PING_COUNT),
            flood: false,
            interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
        }
    }
}

/// Running aggregate over a session's probes.
#[derive(Debug, Clone, Default)]
pub struct SessionStatistics {
    pub transmitted: u64,
    pub received: u64,
    pub rtt_min: Option<Duration>,
    pub rtt_max: Option<Duration>,
    rtt_sum: Duration,
}

impl SessionStatistics {
    /// Folds one probe in. Only echo replies count as received; a
    /// time-exceeded or transport error still increments transmitted.
    pub fn record(&mut self, result: &ProbeResult) {
        self.transmitted += 1;
        if !result.outcome.is_echo_reply() {
            return;
        }
        // is_echo_reply guarantees an rtt.
        if let Some(rtt) = result.outcome.rtt() {
            self.received += 1;
            self.rtt_sum += rtt;
            self.rtt_min = Some(self.rtt_min.map_or(rtt, |min| min.min(rtt)));
            self.rtt_max = Some(self.rtt_max.map_or(rtt, |max| max.max(rtt)));
        }
    }

    pub fn loss_percent(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        (self.transmitted - self.received) as f64 * 100.0 / self.transmitted as f64
    }

    pub fn rtt_avg(&self) -> Option<Duration> {
        if self.received == 0 {
            return None;
        }
        Some(self.rtt_sum / self.received as u32)
    }

    pub fn to_report(&self, target: IpAddr) -> PingReport {
        PingReport {
            target: target.into(),
            transmitted: self.transmitted,
            received: self.received,
            packet_loss_percentage: self.loss_percent(),
            rtt: self.rtt_min.map(|min| RttStats {
                min_ms: convert_duration_to_ms(min),
                avg_ms: self.rtt_avg().map(convert_duration_to_ms).unwrap_or(0.0),
                max_ms: self.rtt_max.map(convert_duration_to_ms).unwrap_or(0.0),
            }),
        }
    }
}

/// Serial ping loop over an owned sequencer.
pub struct PingSession {
    sequencer: ProbeSequencer,
    target: IpAddr,
    config: PingConfig,
}

impl PingSession {
    pub fn new(sequencer: ProbeSequencer, target: IpAddr, config: PingConfig) -> Self {
        Self {
            sequencer,
            target,
            config,
        }
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Runs probes until the count is exhausted or the token fires.
    /// Cancellation is honored at iteration boundaries only; an
    /// in-flight probe always runs to completion.
    pub fn run(
        &mut self,
        cancel: &CancellationToken,
        mut on_probe: impl FnMut(&ProbeResult),
    ) -> SessionStatistics {
        let mut stats = SessionStatistics::default();
        debug!(target = %self.target, count = ?self.config.count, "starting ping session");

        let mut iterations: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(count) = self.config.count {
                if iterations >= count {
                    break;
                }
            }

            let result = self.sequencer.probe(None);
            stats.record(&result);
            on_probe(&result);
            iterations += 1;

            let more = self.config.count.map_or(true, |count| iterations < count);
            if more && !self.config.flood && !cancel.is_cancelled() {
                thread::sleep(self.config.interval);
            }
        }

        stats
    }
}
