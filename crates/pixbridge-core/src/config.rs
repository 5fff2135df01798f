//! Centralized configuration for the command bridge.
//!
//! Protocol constants live on [`ProtocolConfig`]. Runtime values (where the host
//! listens, how long a call may wait, how loud the logs are) live on
//! [`BridgeConfig`], which is loaded from `PIXBRIDGE_*` environment variables.

use crate::{BridgeError, Result};
use std::time::Duration;

/// Wire protocol and lifecycle constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Size of the big-endian length prefix in front of every frame.
    pub const HEADER_SIZE: usize = 4;
    /// Largest payload accepted by default (base64 bitmaps can get big).
    pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 9877;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Budget for captures, exports and other heavy host operations.
    pub const LONG_TIMEOUT: Duration = Duration::from_secs(120);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a closing server session may take before it is aborted.
    pub const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);
    pub const DEFAULT_LOG_LEVEL: &'static str = "info";
}

/// Environment variable names read by [`BridgeConfig::from_env`].
pub struct EnvVars;

impl EnvVars {
    pub const HOST: &'static str = "PIXBRIDGE_HOST";
    pub const PORT: &'static str = "PIXBRIDGE_PORT";
    pub const TIMEOUT: &'static str = "PIXBRIDGE_TIMEOUT";
    pub const LOG_LEVEL: &'static str = "PIXBRIDGE_LOG_LEVEL";
    pub const DEBUG: &'static str = "PIXBRIDGE_DEBUG";
}

/// Runtime configuration shared by the client and server sides.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Default per-call timeout.
    pub timeout: Duration,
    /// Timeout for operations flagged as long-running.
    pub long_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
    pub log_level: String,
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: ProtocolConfig::DEFAULT_HOST.to_string(),
            port: ProtocolConfig::DEFAULT_PORT,
            timeout: ProtocolConfig::DEFAULT_TIMEOUT,
            long_timeout: ProtocolConfig::LONG_TIMEOUT,
            connect_timeout: ProtocolConfig::CONNECT_TIMEOUT,
            max_frame_size: ProtocolConfig::MAX_FRAME_SIZE,
            log_level: ProtocolConfig::DEFAULT_LOG_LEVEL.to_string(),
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; set but unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(EnvVars::HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }

        if let Some(port) = lookup(EnvVars::PORT) {
            config.port = port.trim().parse().map_err(|_| BridgeError::Config {
                message: format!("{} must be a port number, got '{}'", EnvVars::PORT, port),
            })?;
        }

        if let Some(timeout) = lookup(EnvVars::TIMEOUT) {
            config.timeout = parse_seconds(EnvVars::TIMEOUT, &timeout)?;
        }

        if let Some(level) = lookup(EnvVars::LOG_LEVEL).filter(|l| !l.trim().is_empty()) {
            config.log_level = level.trim().to_lowercase();
        }

        if let Some(debug) = lookup(EnvVars::DEBUG) {
            config.debug = parse_flag(&debug);
        }

        Ok(config)
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Log filter directive; the debug flag wins over the configured level.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Parse a positive, possibly fractional, number of seconds.
pub fn parse_seconds(name: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw.trim().parse().map_err(|_| BridgeError::Config {
        message: format!("{} must be a number of seconds, got '{}'", name, raw),
    })?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(BridgeError::Config {
            message: format!("{} must be positive, got '{}'", name, raw),
        });
    }
    Duration::try_from_secs_f64(secs).map_err(|_| BridgeError::Config {
        message: format!("{} is out of range, got '{}'", name, raw),
    })
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.address(), "localhost:9877");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_values_are_read_from_lookup() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("PIXBRIDGE_HOST", "127.0.0.1"),
            ("PIXBRIDGE_PORT", "19000"),
            ("PIXBRIDGE_TIMEOUT", "2.5"),
            ("PIXBRIDGE_LOG_LEVEL", "WARN"),
        ]))
        .unwrap();

        assert_eq!(config.address(), "127.0.0.1:19000");
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.log_filter(), "warn");
    }

    #[test]
    fn test_debug_flag_overrides_level() {
        for raw in ["1", "true", "YES"] {
            let config =
                BridgeConfig::from_lookup(lookup_from(&[("PIXBRIDGE_DEBUG", raw)])).unwrap();
            assert!(config.debug, "'{}' should enable debug", raw);
            assert_eq!(config.log_filter(), "debug");
        }

        let config = BridgeConfig::from_lookup(lookup_from(&[("PIXBRIDGE_DEBUG", "0")])).unwrap();
        assert!(!config.debug);
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("PIXBRIDGE_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        for raw in ["0", "-3", "nan"] {
            let err = BridgeConfig::from_lookup(lookup_from(&[("PIXBRIDGE_TIMEOUT", raw)]))
                .unwrap_err();
            assert!(matches!(err, BridgeError::Config { .. }), "{}", raw);
        }
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        for raw in ["1e300", "1.8e308"] {
            let err = BridgeConfig::from_lookup(lookup_from(&[("PIXBRIDGE_TIMEOUT", raw)]))
                .unwrap_err();
            assert!(matches!(err, BridgeError::Config { .. }), "{}", raw);
        }
        assert!(matches!(
            parse_seconds("--timeout", "1e300"),
            Err(BridgeError::Config { .. })
        ));
        assert_eq!(
            parse_seconds("--timeout", "86400").unwrap(),
            Duration::from_secs(86400)
        );
    }
}
