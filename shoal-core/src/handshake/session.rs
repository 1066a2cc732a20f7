//! Contract between the manager and the handshake protocol driver.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::download::DownloadId;
use super::options::{EncryptionInfo, EncryptionOptions, ProtocolExtension};
use crate::net::{SocketError, SocketFd};
use crate::peer::{Bitfield, PeerHandle};

/// Stable key of a handshake inside the manager. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandshakeId(pub(crate) u64);

impl HandshakeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeDirection {
    Incoming,
    Outgoing,
}

/// Negotiation progress of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Outgoing socket not yet connected
    Connecting,
    Negotiating,
    Succeeded,
    Failed,
    TimedOut,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandshakeState::Succeeded | HandshakeState::Failed | HandshakeState::TimedOut
        )
    }
}

/// One in-flight handshake: buffering plus the encryption and BitTorrent
/// handshake byte protocol for a single socket.
///
/// The manager owns sessions and drives their lifecycle hooks; the
/// protocol driver reports the outcome back through the manager's
/// `receive_*` entry points. A session is always deactivated before it is
/// destroyed or its socket released.
pub trait HandshakeSession {
    fn direction(&self) -> HandshakeDirection;

    fn state(&self) -> HandshakeState;

    /// Owning download, `None` for an incoming session before the info
    /// hash is known.
    fn download(&self) -> Option<DownloadId>;

    /// Peer record, `None` until resolved.
    fn peer_info(&self) -> Option<&PeerHandle>;

    /// Address of the remote peer, never the proxy.
    fn socket_address(&self) -> SocketAddr;

    /// Piece availability the peer announced.
    fn bitfield(&self) -> &Bitfield;

    fn encryption(&self) -> &EncryptionInfo;

    fn extensions(&self) -> &ProtocolExtension;

    fn initialized_time(&self) -> Instant;

    /// Bytes read past the end of the handshake.
    fn unread_data(&self) -> &[u8];

    /// Options the next attempt should use if this one is retried.
    fn retry_options(&self) -> EncryptionOptions;

    /// Returns true if the failure is worth another attempt under
    /// [`retry_options`](Self::retry_options).
    fn should_retry(&self) -> bool;

    fn is_active(&self) -> bool;

    /// Stops polling the socket. The session must not be acted upon again.
    fn deactivate_connection(&mut self);

    /// Closes the socket and drops negotiation state.
    fn destroy_connection(&mut self) -> Result<(), SocketError>;

    /// Moves the socket out for the promoted connection.
    fn release_connection(&mut self) -> SocketFd;
}

/// Builds sessions for sockets the manager has admitted.
pub trait HandshakeFactory {
    type Session: HandshakeSession;

    fn incoming(
        &mut self,
        id: HandshakeId,
        fd: SocketFd,
        address: SocketAddr,
        options: EncryptionOptions,
    ) -> Self::Session;

    fn outgoing(
        &mut self,
        id: HandshakeId,
        fd: SocketFd,
        address: SocketAddr,
        download: DownloadId,
        peer: PeerHandle,
        options: EncryptionOptions,
    ) -> Self::Session;
}
