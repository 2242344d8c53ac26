//! Shared types for the icmprobe probe engine.

mod cancel;
mod error;
mod types;

pub use cancel::CancellationToken;
pub use error::ProbeError;
pub use types::{
    next_session_id, IpFamily, ProbeIdentifier, ProbeResult, ReplyOutcome,
};

use std::time::Duration;

pub const DEFAULT_PING_COUNT: u64 = 4;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TRACE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_MAX_HOPS: u8 = 30;
pub const DEFAULT_PROBES_PER_HOP: usize = 3;

pub fn convert_duration_to_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_to_ms() {
        assert_eq!(convert_duration_to_ms(Duration::from_millis(1500)), 1500.0);
        assert_eq!(convert_duration_to_ms(Duration::ZERO), 0.0);
    }
}
