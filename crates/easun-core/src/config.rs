use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::discovery::DISCOVERY_PORT;
use crate::error::{ClientError, Result};

pub const POLL_INTERVAL_BOUNDS: RangeInclusive<u64> = 1..=3600;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub inverter: Ipv4Addr,
    pub local: Ipv4Addr,
    pub model: String,
    /// Port the textual client listens on for the device's connect-back.
    /// Zero picks an ephemeral port.
    pub server_port: u16,
    pub discovery_port: u16,
    pub register_port: u16,
    pub command_spacing: Duration,
    pub reply_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(inverter: Ipv4Addr, local: Ipv4Addr, model: impl Into<String>) -> Self {
        Self {
            inverter,
            local,
            model: model.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            inverter: Ipv4Addr::UNSPECIFIED,
            local: Ipv4Addr::UNSPECIFIED,
            model: "EASUN_SMW_8K".to_string(),
            server_port: 502,
            discovery_port: DISCOVERY_PORT,
            register_port: 502,
            command_spacing: Duration::from_millis(300),
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    /// Unit of the exponential backoff: failure `n` waits `base * 2^n`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl CollectorConfig {
    pub fn with_poll_interval(secs: u64) -> Result<Self> {
        if !POLL_INTERVAL_BOUNDS.contains(&secs) {
            return Err(ClientError::Config(format!(
                "poll interval {secs}s outside of {}..={}s",
                POLL_INTERVAL_BOUNDS.start(),
                POLL_INTERVAL_BOUNDS.end()
            )));
        }
        Ok(Self {
            poll_interval: Duration::from_secs(secs),
            ..Self::default()
        })
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}
