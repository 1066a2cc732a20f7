//! Mock implementations for testing the handshake manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use super::download::{
    ConnectionList, Download, DownloadId, DownloadRegistry, PeerConnection, PeerList,
};
use super::options::{ConnectOptions, EncryptionInfo, EncryptionOptions, ProtocolExtension};
use super::session::{
    HandshakeDirection, HandshakeFactory, HandshakeId, HandshakeSession, HandshakeState,
};
use crate::net::{SocketError, SocketFd};
use crate::peer::{Bitfield, PeerHandle, PeerInfo};

/// Read buffer size of mock connections.
pub const MOCK_READ_BUFFER_SIZE: usize = 64;

/// Scriptable handshake session.
///
/// Fields are public so tests can move the negotiation along the way the
/// protocol driver would.
#[derive(Debug)]
pub struct MockHandshake {
    pub id: HandshakeId,
    pub fd: SocketFd,
    pub direction: HandshakeDirection,
    pub state: HandshakeState,
    pub address: SocketAddr,
    pub download: Option<DownloadId>,
    pub peer: Option<PeerHandle>,
    pub bitfield: Bitfield,
    pub encryption: EncryptionInfo,
    pub extensions: ProtocolExtension,
    pub initialized_time: Instant,
    pub unread: Vec<u8>,
    pub options: EncryptionOptions,
    pub retry_options: EncryptionOptions,
    pub should_retry: bool,
    pub active: bool,
    pub destroyed: bool,
}

impl MockHandshake {
    fn new(
        id: HandshakeId,
        fd: SocketFd,
        direction: HandshakeDirection,
        address: SocketAddr,
        options: EncryptionOptions,
    ) -> Self {
        Self {
            id,
            fd,
            direction,
            state: match direction {
                HandshakeDirection::Incoming => HandshakeState::Negotiating,
                HandshakeDirection::Outgoing => HandshakeState::Connecting,
            },
            address,
            download: None,
            peer: None,
            bitfield: Bitfield::new(8),
            encryption: EncryptionInfo::default(),
            extensions: ProtocolExtension::default(),
            initialized_time: Instant::now(),
            unread: Vec::new(),
            options,
            retry_options: options,
            should_retry: false,
            active: true,
            destroyed: false,
        }
    }

    /// Simulates the remote peer being identified for `download`.
    pub fn attach(&mut self, download: DownloadId, peer: PeerHandle) {
        self.download = Some(download);
        self.peer = Some(peer);
        self.state = HandshakeState::Negotiating;
    }
}

impl HandshakeSession for MockHandshake {
    fn direction(&self) -> HandshakeDirection {
        self.direction
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn download(&self) -> Option<DownloadId> {
        self.download
    }

    fn peer_info(&self) -> Option<&PeerHandle> {
        self.peer.as_ref()
    }

    fn socket_address(&self) -> SocketAddr {
        self.address
    }

    fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    fn encryption(&self) -> &EncryptionInfo {
        &self.encryption
    }

    fn extensions(&self) -> &ProtocolExtension {
        &self.extensions
    }

    fn initialized_time(&self) -> Instant {
        self.initialized_time
    }

    fn unread_data(&self) -> &[u8] {
        &self.unread
    }

    fn retry_options(&self) -> EncryptionOptions {
        self.retry_options
    }

    fn should_retry(&self) -> bool {
        self.should_retry
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn deactivate_connection(&mut self) {
        self.active = false;
    }

    fn destroy_connection(&mut self) -> Result<(), SocketError> {
        self.destroyed = true;
        self.fd.close()
    }

    fn release_connection(&mut self) -> SocketFd {
        self.fd.take()
    }
}

/// Factory producing [`MockHandshake`]s and recording what it built.
#[derive(Debug, Default)]
pub struct MockFactory {
    pub created: Vec<(HandshakeId, HandshakeDirection, SocketAddr, EncryptionOptions)>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandshakeFactory for MockFactory {
    type Session = MockHandshake;

    fn incoming(
        &mut self,
        id: HandshakeId,
        fd: SocketFd,
        address: SocketAddr,
        options: EncryptionOptions,
    ) -> MockHandshake {
        self.created
            .push((id, HandshakeDirection::Incoming, address, options));
        MockHandshake::new(id, fd, HandshakeDirection::Incoming, address, options)
    }

    fn outgoing(
        &mut self,
        id: HandshakeId,
        fd: SocketFd,
        address: SocketAddr,
        download: DownloadId,
        peer: PeerHandle,
        options: EncryptionOptions,
    ) -> MockHandshake {
        self.created
            .push((id, HandshakeDirection::Outgoing, address, options));
        let mut handshake =
            MockHandshake::new(id, fd, HandshakeDirection::Outgoing, address, options);
        handshake.download = Some(download);
        handshake.peer = Some(peer);
        handshake
    }
}

/// Peer list handing out one shared record per address.
#[derive(Debug, Default)]
pub struct MockPeerList {
    pub peers: HashMap<SocketAddr, PeerHandle>,
    pub connect_calls: Vec<(SocketAddr, ConnectOptions)>,
    pub disconnected: Vec<SocketAddr>,
    /// Refuse every peer while the recent-connection filter is requested
    pub refuse_filtered: bool,
}

impl PeerList for MockPeerList {
    fn connected(&mut self, address: SocketAddr, options: ConnectOptions) -> Option<PeerHandle> {
        self.connect_calls.push((address, options));

        if self.refuse_filtered && options.contains(ConnectOptions::FILTER_RECENT) {
            return None;
        }

        Some(
            self.peers
                .entry(address)
                .or_insert_with(|| PeerInfo::new(address).into_handle())
                .clone(),
        )
    }

    fn disconnected(&mut self, peer: &PeerHandle) {
        self.disconnected.push(peer.lock().address);
    }
}

/// Live connection created by [`MockConnectionList`].
#[derive(Debug)]
pub struct MockConnection {
    pub fd: SocketFd,
    pub peer: PeerHandle,
    pub unread: Vec<u8>,
    pub read_events: usize,
    pub have_timer: Option<Instant>,
}

impl PeerConnection for MockConnection {
    fn read_buffer_capacity(&self) -> usize {
        MOCK_READ_BUFFER_SIZE
    }

    fn push_unread(&mut self, data: &[u8]) {
        self.unread.extend_from_slice(data);
    }

    fn event_read(&mut self) {
        self.read_events += 1;
    }

    fn set_have_timer(&mut self, time: Instant) {
        self.have_timer = Some(time);
    }
}

#[derive(Debug)]
pub struct MockConnectionList {
    pub want: bool,
    pub accept_insert: bool,
    pub connections: Vec<MockConnection>,
}

impl Default for MockConnectionList {
    fn default() -> Self {
        Self {
            want: true,
            accept_insert: true,
            connections: Vec::new(),
        }
    }
}

impl ConnectionList for MockConnectionList {
    fn want_connection(&self, _peer: &PeerHandle, _bitfield: &Bitfield) -> bool {
        self.want
    }

    fn insert(
        &mut self,
        peer: &PeerHandle,
        fd: SocketFd,
        _bitfield: &Bitfield,
        _encryption: &EncryptionInfo,
        _extensions: &ProtocolExtension,
    ) -> Result<&mut dyn PeerConnection, SocketFd> {
        if !self.accept_insert {
            return Err(fd);
        }

        let index = self.connections.len();
        self.connections.push(MockConnection {
            fd,
            peer: peer.clone(),
            unread: Vec::new(),
            read_events: 0,
            have_timer: None,
        });
        Ok(&mut self.connections[index])
    }
}

#[derive(Debug)]
pub struct MockDownload {
    pub active: bool,
    pub done: bool,
    pub peers: MockPeerList,
    pub connections: MockConnectionList,
}

impl Default for MockDownload {
    fn default() -> Self {
        Self {
            active: true,
            done: false,
            peers: MockPeerList::default(),
            connections: MockConnectionList::default(),
        }
    }
}

impl Download for MockDownload {
    fn is_active(&self) -> bool {
        self.active
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn peer_list(&mut self) -> &mut dyn PeerList {
        &mut self.peers
    }

    fn connection_list(&mut self) -> &mut dyn ConnectionList {
        &mut self.connections
    }
}

#[derive(Debug, Default)]
pub struct MockDownloads {
    pub downloads: HashMap<DownloadId, MockDownload>,
}

impl MockDownloads {
    /// Creates a registry holding one default download per id.
    pub fn with_downloads(ids: &[DownloadId]) -> Self {
        Self {
            downloads: ids
                .iter()
                .map(|&id| (id, MockDownload::default()))
                .collect(),
        }
    }

    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn download(&mut self, id: DownloadId) -> &mut MockDownload {
        self.downloads
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} not registered"))
    }
}

impl DownloadRegistry for MockDownloads {
    fn download_mut(&mut self, id: DownloadId) -> Option<&mut dyn Download> {
        self.downloads
            .get_mut(&id)
            .map(|download| download as &mut dyn Download)
    }
}
