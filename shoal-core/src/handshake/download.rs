//! Download-side collaborators a handshake is promoted into.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::options::{ConnectOptions, EncryptionInfo, ProtocolExtension};
use crate::net::SocketFd;
use crate::peer::{Bitfield, PeerHandle};

/// Identifier of a download known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadId(pub u32);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download-{}", self.0)
    }
}

/// Lookup of downloads by id.
pub trait DownloadRegistry {
    fn download_mut(&mut self, id: DownloadId) -> Option<&mut dyn Download>;
}

pub trait Download {
    fn is_active(&self) -> bool;

    /// Returns true once every wanted piece is complete.
    fn is_done(&self) -> bool;

    fn peer_list(&mut self) -> &mut dyn PeerList;

    fn connection_list(&mut self) -> &mut dyn ConnectionList;
}

/// Candidate peers of one download.
pub trait PeerList {
    /// Resolves or creates the record for `address`, `None` when the
    /// peer is refused under `options`.
    fn connected(&mut self, address: SocketAddr, options: ConnectOptions) -> Option<PeerHandle>;

    /// Marks a candidate as no longer being connected to.
    fn disconnected(&mut self, peer: &PeerHandle);
}

/// Live connections of one download.
pub trait ConnectionList {
    fn want_connection(&self, peer: &PeerHandle, bitfield: &Bitfield) -> bool;

    /// Creates a live connection owning `fd`. On refusal the socket is
    /// handed back to the caller.
    fn insert(
        &mut self,
        peer: &PeerHandle,
        fd: SocketFd,
        bitfield: &Bitfield,
        encryption: &EncryptionInfo,
        extensions: &ProtocolExtension,
    ) -> Result<&mut dyn PeerConnection, SocketFd>;
}

/// A promoted, message-exchanging connection.
pub trait PeerConnection {
    /// Bytes the read buffer can hold.
    fn read_buffer_capacity(&self) -> usize;

    /// Queues bytes read during the handshake in front of the stream.
    fn push_unread(&mut self, data: &[u8]);

    /// Processes buffered input as if the socket had become readable.
    fn event_read(&mut self);

    fn set_have_timer(&mut self, time: Instant);
}
