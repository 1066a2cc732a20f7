//! Centralized configuration for Shoal.
//!
//! All tunable parameters of the connection core are defined here to
//! avoid hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection_manager::TrafficPriority;
use crate::handshake::EncryptionOptions;
use crate::tracing_setup::LogLevel;

/// Central configuration for all Shoal components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub network: NetworkConfig,
    pub handshake: HandshakeConfig,
    pub thread: ThreadConfig,
    pub logging: LoggingConfig,
}

/// Socket and admission control configuration.
///
/// Zero buffer sizes and the default priority leave the OS defaults alone.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local address outgoing connections bind to before connecting
    pub bind_address: Option<SocketAddr>,
    /// Proxy that outgoing connections are routed through
    pub proxy_address: Option<SocketAddr>,
    /// IP TOS / IPv6 traffic class for peer sockets
    pub priority: TrafficPriority,
    /// Socket send buffer size in bytes (0 = OS default)
    pub send_buffer_size: u32,
    /// Socket receive buffer size in bytes (0 = OS default)
    pub receive_buffer_size: u32,
    /// Maximum open peer sockets, handshakes included
    pub max_open_sockets: usize,
    /// Backlog for listening sockets
    pub listen_backlog: i32,
    /// Encryption policy applied to new handshakes
    pub encryption: EncryptionOptions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            proxy_address: None,
            priority: TrafficPriority::Default,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            max_open_sockets: 200,
            listen_backlog: 128,
            encryption: EncryptionOptions::ALLOW_INCOMING
                | EncryptionOptions::TRY_OUTGOING
                | EncryptionOptions::ENABLE_RETRY,
        }
    }
}

/// Handshake negotiation limits.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Candidates with more failed attempts than this are not dialed
    pub max_failed: u32,
    /// Time a handshake may take before it is timed out
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_failed: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Network thread configuration.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// OS thread name
    pub name: String,
    /// Longest the event loop sleeps when nothing is scheduled
    pub idle_timeout: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "shoal-net".to_string(),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level shown on the console
    pub console_level: LogLevel,
    /// Directory for the full debug log (defaults to "./logs")
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_level: LogLevel::Info,
            logs_dir: None,
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(address) = lookup("SHOAL_BIND_ADDRESS").and_then(|v| v.parse().ok()) {
            config.network.bind_address = Some(address);
        }

        if let Some(address) = lookup("SHOAL_PROXY_ADDRESS").and_then(|v| v.parse().ok()) {
            config.network.proxy_address = Some(address);
        }

        if let Some(count) = lookup("SHOAL_MAX_SOCKETS").and_then(|v| v.parse().ok()) {
            config.network.max_open_sockets = count;
        }

        if let Some(size) = lookup("SHOAL_SEND_BUFFER").and_then(|v| v.parse().ok()) {
            config.network.send_buffer_size = size;
        }

        if let Some(size) = lookup("SHOAL_RECEIVE_BUFFER").and_then(|v| v.parse().ok()) {
            config.network.receive_buffer_size = size;
        }

        if let Some(priority) = lookup("SHOAL_PRIORITY").and_then(|v| v.parse().ok()) {
            config.network.priority = priority;
        }

        if let Some(level) = lookup("SHOAL_LOG_LEVEL").and_then(|v| v.parse().ok()) {
            config.logging.console_level = level;
        }

        if let Some(dir) = lookup("SHOAL_LOGS_DIR") {
            config.logging.logs_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Creates a configuration for tests: short timeouts, no socket cap.
    pub fn for_testing() -> Self {
        Self {
            handshake: HandshakeConfig {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
            thread: ThreadConfig {
                name: "shoal-net-test".to_string(),
                idle_timeout: Duration::from_millis(50),
            },
            network: NetworkConfig {
                max_open_sockets: usize::MAX,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_values() {
        let config = ShoalConfig::default();

        assert_eq!(config.network.bind_address, None);
        assert_eq!(config.network.proxy_address, None);
        assert_eq!(config.network.send_buffer_size, 0);
        assert_eq!(config.network.max_open_sockets, 200);
        assert_eq!(config.handshake.max_failed, 3);
        assert_eq!(config.thread.idle_timeout, Duration::from_secs(10));
        assert!(
            config
                .network
                .encryption
                .contains(EncryptionOptions::TRY_OUTGOING)
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = ShoalConfig::from_lookup(lookup_from(&[
            ("SHOAL_PROXY_ADDRESS", "127.0.0.1:1080"),
            ("SHOAL_MAX_SOCKETS", "12"),
            ("SHOAL_RECEIVE_BUFFER", "65536"),
            ("SHOAL_PRIORITY", "throughput"),
            ("SHOAL_LOG_LEVEL", "debug"),
        ]));

        assert_eq!(
            config.network.proxy_address,
            Some("127.0.0.1:1080".parse().unwrap())
        );
        assert_eq!(config.network.max_open_sockets, 12);
        assert_eq!(config.network.receive_buffer_size, 65536);
        assert_eq!(config.network.priority, TrafficPriority::Throughput);
        assert_eq!(config.logging.console_level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let config = ShoalConfig::from_lookup(lookup_from(&[
            ("SHOAL_BIND_ADDRESS", "not-an-address"),
            ("SHOAL_MAX_SOCKETS", "-1"),
        ]));

        assert_eq!(config.network.bind_address, None);
        assert_eq!(config.network.max_open_sockets, 200);
    }

    #[test]
    fn test_testing_preset() {
        let config = ShoalConfig::for_testing();

        assert_eq!(config.network.max_open_sockets, usize::MAX);
        assert!(config.thread.idle_timeout < Duration::from_secs(1));
    }
}
