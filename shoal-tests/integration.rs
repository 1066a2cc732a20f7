//! Integration tests for Shoal
//!
//! These tests run the handshake manager inside a live network thread,
//! the way the engine hosts it, and talk to it over real loopback sockets.

#[path = "integration/handshake_thread.rs"]
mod handshake_thread;
