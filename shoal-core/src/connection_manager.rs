//! Process-wide admission control for peer sockets.
//!
//! Tracks how many peer sockets are open (handshakes and live
//! connections alike) and carries the socket options every new peer
//! socket is configured with.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::config::NetworkConfig;
use crate::handshake::EncryptionOptions;

/// Errors from admission control bookkeeping.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Socket count decremented below zero")]
    SocketCountUnderflow,
}

/// IP type-of-service class applied to peer sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficPriority {
    /// Leave the OS default untouched
    #[default]
    Default,
    LowDelay,
    Throughput,
    Reliability,
    MinCost,
}

impl TrafficPriority {
    /// TOS byte for this class, `None` for the OS default.
    pub fn tos(self) -> Option<u32> {
        match self {
            TrafficPriority::Default => None,
            TrafficPriority::LowDelay => Some(0x10),
            TrafficPriority::Throughput => Some(0x08),
            TrafficPriority::Reliability => Some(0x04),
            TrafficPriority::MinCost => Some(0x02),
        }
    }
}

impl FromStr for TrafficPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(TrafficPriority::Default),
            "lowdelay" | "low_delay" => Ok(TrafficPriority::LowDelay),
            "throughput" => Ok(TrafficPriority::Throughput),
            "reliability" => Ok(TrafficPriority::Reliability),
            "mincost" | "min_cost" => Ok(TrafficPriority::MinCost),
            _ => Err(format!("Invalid traffic priority: {s}")),
        }
    }
}

impl fmt::Display for TrafficPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrafficPriority::Default => "default",
            TrafficPriority::LowDelay => "lowdelay",
            TrafficPriority::Throughput => "throughput",
            TrafficPriority::Reliability => "reliability",
            TrafficPriority::MinCost => "mincost",
        };
        f.write_str(name)
    }
}

/// Address predicate; returning true rejects the address.
pub type AddressFilter = Box<dyn Fn(&SocketAddr) -> bool + Send>;

/// Global open-socket accounting and peer socket options.
///
/// Lives on the network thread; mutated only from its tick.
pub struct ConnectionManager {
    size: usize,
    max_size: usize,
    filter: Option<AddressFilter>,
    encryption_options: EncryptionOptions,
    bind_address: Option<SocketAddr>,
    proxy_address: Option<SocketAddr>,
    priority: TrafficPriority,
    send_buffer_size: u32,
    receive_buffer_size: u32,
}

impl ConnectionManager {
    /// Creates a manager from network configuration with no open sockets.
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            size: 0,
            max_size: config.max_open_sockets,
            filter: None,
            encryption_options: config.encryption,
            bind_address: config.bind_address,
            proxy_address: config.proxy_address,
            priority: config.priority,
            send_buffer_size: config.send_buffer_size,
            receive_buffer_size: config.receive_buffer_size,
        }
    }

    /// Number of open peer sockets.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Returns true if another peer socket may be opened.
    pub fn can_connect(&self) -> bool {
        self.size < self.max_size
    }

    /// Installs the address filter, replacing any previous one.
    pub fn set_filter(&mut self, filter: impl Fn(&SocketAddr) -> bool + Send + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Returns true if connections to or from `address` are rejected.
    pub fn filter(&self, address: &SocketAddr) -> bool {
        self.filter.as_ref().is_some_and(|filter| filter(address))
    }

    pub fn inc_socket_count(&mut self) {
        self.size += 1;
    }

    /// # Errors
    ///
    /// - `AdmissionError::SocketCountUnderflow` - If no socket is counted
    pub fn dec_socket_count(&mut self) -> Result<(), AdmissionError> {
        self.size = self
            .size
            .checked_sub(1)
            .ok_or(AdmissionError::SocketCountUnderflow)?;
        Ok(())
    }

    pub fn encryption_options(&self) -> EncryptionOptions {
        self.encryption_options
    }

    pub fn set_encryption_options(&mut self, options: EncryptionOptions) {
        self.encryption_options = options;
    }

    pub fn bind_address(&self) -> Option<SocketAddr> {
        self.bind_address
    }

    pub fn set_bind_address(&mut self, address: Option<SocketAddr>) {
        self.bind_address = address;
    }

    pub fn proxy_address(&self) -> Option<SocketAddr> {
        self.proxy_address
    }

    pub fn set_proxy_address(&mut self, address: Option<SocketAddr>) {
        self.proxy_address = address;
    }

    pub fn priority(&self) -> TrafficPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: TrafficPriority) {
        self.priority = priority;
    }

    pub fn send_buffer_size(&self) -> u32 {
        self.send_buffer_size
    }

    pub fn set_send_buffer_size(&mut self, size: u32) {
        self.send_buffer_size = size;
    }

    pub fn receive_buffer_size(&self) -> u32 {
        self.receive_buffer_size
    }

    pub fn set_receive_buffer_size(&mut self, size: u32) {
        self.receive_buffer_size = size;
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("has_filter", &self.filter.is_some())
            .field("encryption_options", &self.encryption_options)
            .field("bind_address", &self.bind_address)
            .field("proxy_address", &self.proxy_address)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_limit(max_open_sockets: usize) -> ConnectionManager {
        ConnectionManager::new(&NetworkConfig {
            max_open_sockets,
            ..Default::default()
        })
    }

    #[test]
    fn test_admission_follows_socket_count() {
        let mut manager = manager_with_limit(2);
        assert!(manager.can_connect());

        manager.inc_socket_count();
        manager.inc_socket_count();
        assert!(!manager.can_connect());

        manager.dec_socket_count().unwrap();
        assert!(manager.can_connect());
        assert_eq!(manager.size(), 1);
    }

    #[test]
    fn test_socket_count_underflow_is_reported() {
        let mut manager = manager_with_limit(2);

        assert_eq!(
            manager.dec_socket_count(),
            Err(AdmissionError::SocketCountUnderflow)
        );
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_filter_predicate() {
        let mut manager = manager_with_limit(10);
        let blocked: SocketAddr = "10.0.0.66:6881".parse().unwrap();
        let allowed: SocketAddr = "10.0.0.1:6881".parse().unwrap();

        assert!(!manager.filter(&blocked));

        manager.set_filter(move |address| address.ip() == blocked.ip());
        assert!(manager.filter(&blocked));
        assert!(!manager.filter(&allowed));

        manager.clear_filter();
        assert!(!manager.filter(&blocked));
    }

    #[test]
    fn test_traffic_priority_parsing() {
        assert_eq!(
            "LowDelay".parse::<TrafficPriority>(),
            Ok(TrafficPriority::LowDelay)
        );
        assert_eq!(TrafficPriority::Default.tos(), None);
        assert_eq!(TrafficPriority::Throughput.tos(), Some(0x08));
        assert!("fast".parse::<TrafficPriority>().is_err());
        assert_eq!(TrafficPriority::MinCost.to_string(), "mincost");
    }
}
