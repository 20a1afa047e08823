//! Stream configuration, consumed once when a stream is opened.

use crate::error::{Result, StreamError};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How a writer hands finished buffers to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Publish/subscribe, best-effort: a reader that is not listening misses
    /// the message.
    #[default]
    Fast,
    /// Request/reply: every connected reader pulls every step.
    Reliable,
}

impl DeliveryMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fast" | "subscribe" | "pubsub" => Ok(Self::Fast),
            "reliable" | "request" | "reqrep" => Ok(Self::Reliable),
            other => Err(StreamError::config(format!(
                "unsupported delivery mode `{}` (expected fast or reliable)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Network endpoint host or full address.
    pub address: Option<String>,

    pub port: Option<u16>,

    /// Seconds before a publish or discovery attempt gives up.
    pub timeout_secs: f64,

    /// Steps batched into one wire message (K).
    pub aggregation_factor: usize,

    pub delivery: DeliveryMode,

    /// Readers expected before a fast-mode writer proceeds.
    pub rendezvous_reader_count: usize,

    /// Publish from a dedicated thread instead of inline in `end_step`.
    pub double_buffer: bool,

    /// Capacity of the writer's buffer queue.
    pub queue_depth: usize,

    /// Above zero, opening an engine installs the stderr subscriber from
    /// [`crate::logging::init`] at this level unless one is already set.
    pub verbosity: u8,

    /// Collect per-step throughput and latency statistics.
    pub monitor: bool,

    /// Give up discovery after this many seconds. `None` blocks forever.
    pub handshake_timeout_secs: Option<f64>,

    /// Give up a reliable-mode close once readers pulled nothing for this
    /// many seconds. `None` waits until every message was delivered.
    pub drain_timeout_secs: Option<f64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            timeout_secs: 5.0,
            aggregation_factor: 1,
            delivery: DeliveryMode::Fast,
            rendezvous_reader_count: 1,
            double_buffer: true,
            queue_depth: 64,
            verbosity: 0,
            monitor: false,
            handshake_timeout_secs: None,
            drain_timeout_secs: None,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StreamError::config(format!("invalid value `{}` for {}", value, key)))
}

fn seconds(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        StreamError::config(format!(
            "{} must be a non-negative number of seconds, got {}",
            key, secs
        ))
    })
}

/// For values `validate` already accepted; anything else reads as zero.
fn seconds_or_zero(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(StreamError::config(format!(
            "invalid value `{}` for {} (expected true or false)",
            value, key
        ))),
    }
}

impl StreamConfig {
    /// Build a configuration from engine parameters. Keys are matched
    /// case-insensitively; unknown keys are ignored.
    pub fn from_params(params: &Params) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "ipaddress" | "address" => config.address = Some(value.trim().to_string()),
                "port" => config.port = Some(parse_value(key, value)?),
                "timeout" => config.timeout_secs = parse_value(key, value)?,
                "combiningsteps" | "aggregationfactor" => {
                    config.aggregation_factor = parse_value(key, value)?
                }
                "transportmode" | "deliverymode" => {
                    config.delivery = DeliveryMode::parse(value.trim())?
                }
                "rendezvousreadercount" => {
                    config.rendezvous_reader_count = parse_value(key, value)?
                }
                "doublebuffer" | "threading" => config.double_buffer = parse_bool(key, value)?,
                "queuedepth" => config.queue_depth = parse_value(key, value)?,
                "verbose" | "verbosity" => config.verbosity = parse_value(key, value)?,
                "monitor" => config.monitor = parse_bool(key, value)?,
                "handshaketimeout" => {
                    config.handshake_timeout_secs = Some(parse_value(key, value)?)
                }
                "draintimeout" => config.drain_timeout_secs = Some(parse_value(key, value)?),
                _ => debug!(key = %key, "StreamConfig::from_params: ignoring unknown parameter"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregation_factor == 0 {
            return Err(StreamError::config("aggregation factor must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(StreamError::config("queue depth must be at least 1"));
        }
        seconds("timeout", self.timeout_secs)?;
        if let Some(secs) = self.handshake_timeout_secs {
            seconds("handshake timeout", secs)?;
        }
        if let Some(secs) = self.drain_timeout_secs {
            seconds("drain timeout", secs)?;
        }
        Ok(())
    }

    /// The network endpoint this stream binds or connects to.
    pub fn endpoint(&self) -> Result<String> {
        let address = self.endpoint_host()?;
        Ok(match self.port {
            Some(port) => format!("{}:{}", address, port),
            None => address.to_string(),
        })
    }

    /// Endpoint owned by writer `rank`. Rank 0 uses the configured endpoint;
    /// other ranks take the following ports, or a `/rank` suffix when no
    /// port is configured.
    pub fn endpoint_for_rank(&self, rank: u32) -> Result<String> {
        if rank == 0 {
            return self.endpoint();
        }
        match self.port {
            Some(port) => {
                let port = u16::try_from(u32::from(port) + rank).map_err(|_| {
                    StreamError::config(format!("no port left for writer rank {}", rank))
                })?;
                Ok(format!("{}:{}", self.endpoint_host()?, port))
            }
            None => Ok(format!("{}/{}", self.endpoint()?, rank)),
        }
    }

    fn endpoint_host(&self) -> Result<&str> {
        self.address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| StreamError::config("stream requires an address"))
    }

    pub fn timeout(&self) -> Duration {
        seconds_or_zero(self.timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(seconds_or_zero)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(seconds_or_zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.aggregation_factor, 1);
        assert_eq!(config.delivery, DeliveryMode::Fast);
        assert!(config.double_buffer);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert!(config.handshake_timeout().is_none());
    }

    #[test]
    fn test_from_params_case_insensitive() {
        let config = StreamConfig::from_params(&params(&[
            ("IPAddress", "127.0.0.1"),
            ("Port", "12306"),
            ("CombiningSteps", "4"),
            ("TransportMode", "Reliable"),
            ("DoubleBuffer", "off"),
            ("Verbose", "2"),
            ("SomethingElse", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint().unwrap(), "127.0.0.1:12306");
        assert_eq!(config.aggregation_factor, 4);
        assert_eq!(config.delivery, DeliveryMode::Reliable);
        assert!(!config.double_buffer);
        assert_eq!(config.verbosity, 2);
    }

    #[test]
    fn test_unsupported_delivery_mode() {
        let err = StreamConfig::from_params(&params(&[("TransportMode", "carrier-pigeon")]))
            .unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(StreamConfig::from_params(&params(&[("Port", "http")])).is_err());
        assert!(StreamConfig::from_params(&params(&[("CombiningSteps", "0")])).is_err());
        assert!(StreamConfig::from_params(&params(&[("Monitor", "maybe")])).is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for (key, value) in [
            ("Timeout", "1e30"),
            ("Timeout", "-1"),
            ("Timeout", "NaN"),
            ("HandshakeTimeout", "-1"),
            ("HandshakeTimeout", "inf"),
            ("DrainTimeout", "1e30"),
        ] {
            let err = StreamConfig::from_params(&params(&[(key, value)])).unwrap_err();
            assert!(matches!(err, StreamError::Config(_)), "{} = {}", key, value);
        }

        let config = StreamConfig {
            timeout_secs: -3.0,
            handshake_timeout_secs: Some(1e30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        // Accessors never panic, even on a configuration that failed validation.
        assert_eq!(config.timeout(), Duration::ZERO);
        assert_eq!(config.handshake_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_optional_timeouts_from_params() {
        let config = StreamConfig::from_params(&params(&[
            ("HandshakeTimeout", "2.5"),
            ("DrainTimeout", "30"),
        ]))
        .unwrap();
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.drain_timeout(), Some(Duration::from_secs(30)));
        assert!(StreamConfig::default().drain_timeout().is_none());
    }

    #[test]
    fn test_endpoint_for_rank() {
        let mut config = StreamConfig {
            address: Some("10.0.0.1".to_string()),
            port: Some(50001),
            ..Default::default()
        };
        assert_eq!(config.endpoint_for_rank(0).unwrap(), "10.0.0.1:50001");
        assert_eq!(config.endpoint_for_rank(3).unwrap(), "10.0.0.1:50004");

        config.port = Some(u16::MAX);
        assert!(config.endpoint_for_rank(1).is_err());

        config.port = None;
        assert_eq!(config.endpoint_for_rank(2).unwrap(), "10.0.0.1/2");
    }

    #[test]
    fn test_missing_address() {
        let config = StreamConfig::default();
        assert!(matches!(config.endpoint(), Err(StreamError::Config(_))));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = StreamConfig {
            address: Some("inproc://sim".to_string()),
            delivery: DeliveryMode::Reliable,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"reliable\""));
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.delivery, DeliveryMode::Reliable);
        assert_eq!(back.address.as_deref(), Some("inproc://sim"));
    }
}
