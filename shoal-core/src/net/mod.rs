//! Descriptor-level networking for the peer wire path.
//!
//! `SocketFd` owns one OS socket and hides the IPv4/IPv6 split behind a
//! single dual-stack handle. Operations report ordinary network failures
//! as `SocketError::Io` and lifetime bugs (invalid handle, double close)
//! as fatal variants.

pub mod address;
pub mod socket_fd;

pub use address::{is_mapped, normalize, to_mapped};
pub use socket_fd::{SocketError, SocketFd, recoverable};
