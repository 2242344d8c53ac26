//! Serializable session reports.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Summary of a finished ping session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingReport {
    pub target: SerdeIpAddr,
    pub transmitted: u64,
    pub received: u64,
    pub packet_loss_percentage: f64,
    pub rtt: Option<RttStats>,
}

/// Round-trip statistics in milliseconds, present only when at least
/// one reply arrived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RttStats {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// Summary of a finished traceroute session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracerouteReport {
    pub target: SerdeIpAddr,
    pub reached: bool,
    pub hops: Vec<HopEntry>,
}

/// One TTL's entry in a traceroute report. An unresponsive hop keeps
/// its ttl but serializes an empty address and no rtt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopEntry {
    pub ttl: u8,
    pub ip_address: SerdeIpAddr,
    pub rtt_ms: Option<f64>,
    pub reachable: bool,
    #[serde(skip)]
    pub is_dest: bool,
}

/// IP address rendered as a string, with `""` standing in for no
/// responder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerdeIpAddr(pub Option<IpAddr>);

impl SerdeIpAddr {
    pub fn empty() -> Self {
        Self(None)
    }
}

impl From<IpAddr> for SerdeIpAddr {
    fn from(addr: IpAddr) -> Self {
        Self(Some(addr))
    }
}

impl Serialize for SerdeIpAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.0 {
            Some(ip) => serializer.serialize_str(&ip.to_string()),
            None => serializer.serialize_str(""),
        }
    }
}

impl<'de> Deserialize<'de> for SerdeIpAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self(None));
        }
        let ip = s.parse::<IpAddr>().map_err(serde::de::Error::custom)?;
        Ok(Self(Some(ip)))
    }
}
