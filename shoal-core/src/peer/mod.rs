//! Peer identity records shared between handshakes and live connections.

pub mod bitfield;
pub mod client_list;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

pub use bitfield::Bitfield;
pub use client_list::{ClientInfo, ClientList, ClientRegistry, ClientStyle};

/// Client prefix used in generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-SH0001-";

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in the handshake and used to classify
/// the remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity record for one candidate peer of a download.
///
/// Owned by the download's peer list; handshakes and connections hold a
/// shared [`PeerHandle`] to it.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Address the peer is reached at
    pub address: SocketAddr,
    /// Peer id learned from the handshake
    pub id: Option<PeerId>,
    /// Consecutive failed connection attempts
    pub failed_counter: u32,
    /// Client classification, filled in on promotion
    pub client_info: ClientInfo,
}

impl PeerInfo {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            id: None,
            failed_counter: 0,
            client_info: ClientInfo::default(),
        }
    }

    /// Wraps the record in a shareable handle.
    pub fn into_handle(self) -> PeerHandle {
        Arc::new(Mutex::new(self))
    }
}

/// Shared, mutable reference to a [`PeerInfo`].
pub type PeerHandle = Arc<Mutex<PeerInfo>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();

        assert_eq!(&peer_id.as_bytes()[..8], CLIENT_PREFIX);
        assert_ne!(peer_id, PeerId::generate());
    }

    #[test]
    fn test_peer_id_displays_as_hex() {
        let peer_id = PeerId::new([0xab; 20]);
        assert_eq!(peer_id.to_string(), "ab".repeat(20));
    }

    #[test]
    fn test_peer_handle_shares_updates() {
        let handle = PeerInfo::new("10.0.0.1:6881".parse().unwrap()).into_handle();
        let other = Arc::clone(&handle);

        other.lock().failed_counter += 1;

        assert_eq!(handle.lock().failed_counter, 1);
    }
}
