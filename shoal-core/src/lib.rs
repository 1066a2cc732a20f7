//! Shoal Core - Peer connection establishment for a BitTorrent engine
//!
//! This crate owns the path from a raw TCP socket to a live peer
//! connection: dual-stack socket handling, connection admission, the
//! handshake collection with its retry and promotion rules, and the
//! network event thread that drives it all.

pub mod config;
pub mod connection_manager;
pub mod handshake;
pub mod net;
pub mod peer;
pub mod thread;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use connection_manager::{AdmissionError, ConnectionManager, TrafficPriority};
pub use handshake::{HandshakeError, HandshakeFault, HandshakeManager};
pub use net::{SocketError, SocketFd};
pub use thread::{NetThread, NetThreadHandle, ThreadError};
pub use tracing_setup::TracingError;

/// Errors that can bubble up from any Shoal subsystem.
///
/// Everything here is a fault or a setup failure. Ordinary network and
/// handshake failures are reported as values, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Handshake fault: {0}")]
    Handshake(#[from] HandshakeFault),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),

    #[error("Tracing setup error: {0}")]
    Tracing(#[from] TracingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Checks if this error means internal state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            ShoalError::Socket(e) => e.is_fatal(),
            ShoalError::Handshake(_) | ShoalError::Admission(_) => true,
            ShoalError::Thread(e) => e.is_fatal(),
            ShoalError::Tracing(_) | ShoalError::Configuration { .. } | ShoalError::Io(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = std::io::Error::other("refused");

        assert!(!ShoalError::from(SocketError::Io(std::io::Error::other("x"))).is_fatal());
        assert!(ShoalError::from(SocketError::BadDescriptor { fd: 3 }).is_fatal());
        assert!(ShoalError::from(AdmissionError::SocketCountUnderflow).is_fatal());
        assert!(!ShoalError::from(ThreadError::Shutdown).is_fatal());
        assert!(!ShoalError::from(io).is_fatal());
        assert!(
            !ShoalError::Configuration {
                reason: "bad port".to_string()
            }
            .is_fatal()
        );
    }
}
