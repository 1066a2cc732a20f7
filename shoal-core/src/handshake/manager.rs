//! Collection of in-flight handshakes.
//!
//! Sessions live in an arena keyed by [`HandshakeId`]. The manager is
//! owned by the network thread's host state and is never shared, so none
//! of its operations lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, error, trace};

use super::download::{Download, DownloadId, DownloadRegistry};
use super::options::{ConnectOptions, EncryptionOptions, HandshakeMessage};
use super::session::{HandshakeFactory, HandshakeId, HandshakeSession, HandshakeState};
use super::{HandshakeError, HandshakeFault};
use crate::config::HandshakeConfig;
use crate::connection_manager::ConnectionManager;
use crate::net::{SocketError, SocketFd, recoverable};
use crate::peer::{Bitfield, ClientRegistry};
use crate::thread::{Scheduler, TimerId};

/// Engine collaborators the entry points act on.
pub struct HandshakeContext<'a> {
    pub connections: &'a mut ConnectionManager,
    pub downloads: &'a mut dyn DownloadRegistry,
    pub clients: &'a dyn ClientRegistry,
}

/// Result of handing a finished handshake to its download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The socket now belongs to a live connection
    Promoted,
    /// The socket was closed
    Dropped(HandshakeError),
}

/// Host state of the network thread that owns a handshake manager.
///
/// Lets timers armed by [`HandshakeManager::schedule_timeout`] reach the
/// manager and its collaborators when they fire.
pub trait HandshakeHost {
    type Factory: HandshakeFactory;

    /// Splits the host into the manager and the context it acts on.
    fn handshakes(&mut self) -> (&mut HandshakeManager<Self::Factory>, HandshakeContext<'_>);

    /// Receives a fault raised while a handshake timer ran.
    fn handshake_fault(&mut self, fault: HandshakeFault) {
        error!("handshake_manager: timeout handler failed: {fault}");
    }
}

/// Owns every in-flight handshake and brokers its admission, retries
/// and promotion.
pub struct HandshakeManager<F: HandshakeFactory> {
    handshakes: HashMap<HandshakeId, F::Session>,
    next_id: u64,
    factory: F,
    max_failed: u32,
    timeout: Duration,
}

impl<F: HandshakeFactory> HandshakeManager<F> {
    pub fn new(factory: F, config: &HandshakeConfig) -> Self {
        Self {
            handshakes: HashMap::new(),
            next_id: 0,
            factory,
            max_failed: config.max_failed,
            timeout: config.timeout,
        }
    }

    /// Time a handshake may take before [`receive_timeout`](Self::receive_timeout)
    /// fails it.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.handshakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handshakes.is_empty()
    }

    pub fn contains(&self, id: HandshakeId) -> bool {
        self.handshakes.contains_key(&id)
    }

    pub fn get(&self, id: HandshakeId) -> Option<&F::Session> {
        self.handshakes.get(&id)
    }

    /// Gives the protocol driver access to its session.
    pub fn get_mut(&mut self, id: HandshakeId) -> Option<&mut F::Session> {
        self.handshakes.get_mut(&id)
    }

    /// Ids of all in-flight handshakes, oldest first.
    pub fn ids(&self) -> Vec<HandshakeId> {
        let mut ids: Vec<_> = self.handshakes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// Number of handshakes owned by `download`.
    pub fn size_info(&self, download: DownloadId) -> usize {
        self.handshakes
            .values()
            .filter(|handshake| handshake.download() == Some(download))
            .count()
    }

    /// Returns true if a handshake with a resolved peer targets `address`.
    pub fn find(&self, address: &SocketAddr) -> bool {
        self.handshakes.values().any(|handshake| {
            handshake
                .peer_info()
                .is_some_and(|peer| peer.lock().address == *address)
        })
    }

    /// Tears down every handshake.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault` - If a socket was already closed or the socket
    ///   count is out of step
    pub fn clear(&mut self, connections: &mut ConnectionManager) -> Result<(), HandshakeFault> {
        for id in self.ids() {
            self.teardown(id, "clear", connections)?;
        }
        Ok(())
    }

    /// Tears down every handshake of `download` regardless of progress.
    ///
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault` - If a socket was already closed or the socket
    ///   count is out of step
    pub fn erase_download(
        &mut self,
        download: DownloadId,
        connections: &mut ConnectionManager,
    ) -> Result<usize, HandshakeFault> {
        let mut ids: Vec<_> = self
            .handshakes
            .iter()
            .filter(|(_, handshake)| handshake.download() == Some(download))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        for &id in &ids {
            self.teardown(id, "erase_download", connections)?;
        }

        if !ids.is_empty() {
            debug!("handshake_manager: erased {} handshakes of {download}", ids.len());
        }
        Ok(ids.len())
    }

    /// Admits an accepted socket as a new incoming handshake.
    ///
    /// Rejected sockets are closed and `None` is returned.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault::Socket` - If `fd` is invalid
    pub fn add_incoming(
        &mut self,
        mut fd: SocketFd,
        address: SocketAddr,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<Option<HandshakeId>, HandshakeFault> {
        if !ctx.connections.can_connect()
            || ctx.connections.filter(&address)
            || !Self::setup_socket(&fd, ctx.connections)?
        {
            trace!("handshake_manager->{address}: rejected incoming connection");
            fd.close()?;
            return Ok(None);
        }

        debug!(
            "handshake_manager->{address}: accepted incoming connection: fd:{}",
            fd_number(&fd)
        );

        ctx.connections.inc_socket_count();

        let id = self.allocate_id();
        let handshake =
            self.factory
                .incoming(id, fd, address, ctx.connections.encryption_options());
        self.handshakes.insert(id, handshake);

        Ok(Some(id))
    }

    /// Starts an outgoing handshake to `address` for `download` using the
    /// configured encryption options.
    ///
    /// Returns `None` when admission control, the peer list or the socket
    /// layer refuses the attempt.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault::Socket` - If a socket fault surfaces while dialing
    pub fn add_outgoing(
        &mut self,
        address: SocketAddr,
        download: DownloadId,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<Option<HandshakeId>, HandshakeFault> {
        if !ctx.connections.can_connect() || ctx.connections.filter(&address) {
            return Ok(None);
        }

        let options = ctx.connections.encryption_options();
        self.create_outgoing(address, download, options, ctx)
    }

    /// Hands a finished handshake to its download.
    ///
    /// The handshake is removed in every case. When the download accepts
    /// the peer, the socket and any bytes read past the handshake move to
    /// the new connection; otherwise the socket is closed.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault::UnknownHandshake` - If `id` is not in flight
    /// - `HandshakeFault::InactiveHandshake` - If the session was deactivated
    /// - `HandshakeFault::Incomplete` - If the session has no download or peer
    /// - `HandshakeFault::UnreadOverflow` - If the unread bytes exceed the
    ///   connection's read buffer
    pub fn receive_succeeded(
        &mut self,
        id: HandshakeId,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<HandshakeOutcome, HandshakeFault> {
        let mut handshake = self.take_active(id, "receive_succeeded")?;

        let download_id = handshake.download().ok_or(HandshakeFault::Incomplete {
            id,
            missing: "a download",
        })?;
        let peer = handshake
            .peer_info()
            .cloned()
            .ok_or(HandshakeFault::Incomplete {
                id,
                missing: "peer info",
            })?;
        let (address, peer_id) = {
            let info = peer.lock();
            (info.address, info.id)
        };
        let peer_type = if handshake.bitfield().is_all_set() {
            "seed"
        } else {
            "leech"
        };
        let peer_hex = peer_id.map(|peer_id| peer_id.to_string()).unwrap_or_default();

        let mut released = false;
        let reason = match ctx.downloads.download_mut(download_id) {
            None => HandshakeError::UnknownDownload,
            Some(download) => {
                if download.is_active()
                    && download
                        .connection_list()
                        .want_connection(&peer, handshake.bitfield())
                {
                    let fd = handshake.release_connection();
                    let inserted = download.connection_list().insert(
                        &peer,
                        fd,
                        handshake.bitfield(),
                        handshake.encryption(),
                        handshake.extensions(),
                    );

                    match inserted {
                        Ok(connection) => {
                            let client_info = peer_id
                                .map(|peer_id| ctx.clients.retrieve_id(&peer_id))
                                .unwrap_or_default();
                            peer.lock().client_info = client_info;

                            connection.set_have_timer(handshake.initialized_time());

                            debug!(
                                "handshake_manager->{address}: handshake success: type:{peer_type} id:{peer_hex}"
                            );

                            let unread = handshake.unread_data();
                            if !unread.is_empty() {
                                let capacity = connection.read_buffer_capacity();
                                if unread.len() > capacity {
                                    return Err(HandshakeFault::UnreadOverflow {
                                        unread: unread.len(),
                                        capacity,
                                    });
                                }

                                connection.push_unread(unread);
                                connection.event_read();
                            }

                            return Ok(HandshakeOutcome::Promoted);
                        }
                        Err(mut fd) => {
                            fd.close()?;
                            released = true;
                        }
                    }
                }

                drop_reason(&*download, handshake.bitfield())
            }
        };

        debug!(
            "handshake_manager->{address}: handshake dropped: type:{peer_type} id:{peer_hex} reason:'{reason}'"
        );

        ctx.connections.dec_socket_count()?;
        if !released {
            handshake.destroy_connection()?;
        }

        Ok(HandshakeOutcome::Dropped(reason))
    }

    /// Tears down a failed handshake and, when its policy allows, retries
    /// the same address with the retrying bit set.
    ///
    /// Returns the id of the retry attempt, if one was started.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault::UnknownHandshake` - If `id` is not in flight
    /// - `HandshakeFault::InactiveHandshake` - If the session was deactivated
    pub fn receive_failed(
        &mut self,
        id: HandshakeId,
        message: HandshakeMessage,
        error: HandshakeError,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<Option<HandshakeId>, HandshakeFault> {
        let mut handshake = self.take_active(id, "receive_failed")?;

        let address = handshake.socket_address();
        ctx.connections.dec_socket_count()?;
        handshake.destroy_connection()?;

        debug!("handshake_manager->{address}: received error: message:{message} {error}");

        if !handshake.should_retry() {
            return Ok(None);
        }

        let Some(download) = handshake.download() else {
            return Ok(None);
        };

        let retry_options = handshake.retry_options() | EncryptionOptions::RETRYING;

        debug!(
            "handshake_manager->{address}: retrying {}",
            if retry_options.contains(EncryptionOptions::TRY_OUTGOING) {
                "encrypted"
            } else {
                "plaintext"
            }
        );

        self.create_outgoing(address, download, retry_options, ctx)
    }

    /// Fails a handshake that ran out of time.
    ///
    /// A session still connecting is reported as unreachable, any other
    /// as timed out.
    ///
    /// # Errors
    ///
    /// - `HandshakeFault` - See [`receive_failed`](Self::receive_failed)
    pub fn receive_timeout(
        &mut self,
        id: HandshakeId,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<Option<HandshakeId>, HandshakeFault> {
        let state = self
            .handshakes
            .get(&id)
            .map(|handshake| handshake.state())
            .ok_or(HandshakeFault::UnknownHandshake {
                operation: "receive_timeout",
                id,
            })?;

        self.receive_failed(id, HandshakeMessage::Failed, timeout_error(state), ctx)
    }

    /// Arms a timer that fails handshake `id` once [`timeout`](Self::timeout)
    /// elapses. A retry started by the timeout gets a timer of its own.
    ///
    /// The timer does nothing if the handshake has finished by then; ids
    /// are never reused. Erase the returned timer to disarm it early.
    pub fn schedule_timeout<S>(&self, id: HandshakeId, scheduler: &mut Scheduler<S>) -> TimerId
    where
        F: 'static,
        S: HandshakeHost<Factory = F> + 'static,
    {
        scheduler.wait_for(self.timeout, move |host: &mut S, scheduler| {
            let result = {
                let (manager, mut ctx) = host.handshakes();
                if !manager.get(id).is_some_and(|handshake| handshake.is_active()) {
                    return;
                }

                manager.receive_timeout(id, &mut ctx).map(|retry| {
                    if let Some(retry) = retry {
                        manager.schedule_timeout(retry, scheduler);
                    }
                })
            };

            if let Err(fault) = result {
                host.handshake_fault(fault);
            }
        })
    }

    fn create_outgoing(
        &mut self,
        address: SocketAddr,
        download_id: DownloadId,
        mut options: EncryptionOptions,
        ctx: &mut HandshakeContext<'_>,
    ) -> Result<Option<HandshakeId>, HandshakeFault> {
        let mut connect_options = ConnectOptions::KEEP_HANDSHAKES;
        if !options.contains(EncryptionOptions::RETRYING) {
            connect_options |= ConnectOptions::FILTER_RECENT;
        }

        let Some(download) = ctx.downloads.download_mut(download_id) else {
            trace!("handshake_manager->{address}: unknown {download_id}");
            return Ok(None);
        };

        let Some(peer) = download.peer_list().connected(address, connect_options) else {
            return Ok(None);
        };

        if peer.lock().failed_counter > self.max_failed {
            return Ok(None);
        }

        let connect_address = match ctx.connections.proxy_address() {
            Some(proxy) => {
                options |= EncryptionOptions::USE_PROXY;
                proxy
            }
            None => address,
        };

        let Some(fd) = Self::connect_outgoing(connect_address, ctx.connections)? else {
            download.peer_list().disconnected(&peer);
            return Ok(None);
        };

        let message = HandshakeMessage::for_outgoing(options);
        debug!(
            "handshake_manager->{address}: created outgoing connection: fd:{} encryption:{options:x} message:{message}",
            fd_number(&fd)
        );

        ctx.connections.inc_socket_count();

        let id = self.allocate_id();
        let handshake = self
            .factory
            .outgoing(id, fd, address, download_id, peer, options);
        self.handshakes.insert(id, handshake);

        Ok(Some(id))
    }

    /// Opens, configures, optionally binds and connects a stream socket.
    ///
    /// Ordinary failures close the socket and yield `None`.
    fn connect_outgoing(
        connect_address: SocketAddr,
        connections: &ConnectionManager,
    ) -> Result<Option<SocketFd>, SocketError> {
        let mut fd = match SocketFd::open_stream() {
            Ok(fd) => fd,
            Err(e) => {
                debug!("handshake_manager->{connect_address}: could not open socket: {e}");
                return Ok(None);
            }
        };

        let connected = Self::setup_socket(&fd, connections)?
            && match connections.bind_address() {
                Some(bind) if !bind.ip().is_unspecified() => recoverable(fd.bind(&bind))?,
                _ => true,
            }
            && recoverable(fd.connect(&connect_address))?;

        if !connected {
            fd.close()?;
            return Ok(None);
        }

        Ok(Some(fd))
    }

    /// Applies the configured socket options. Only non-blocking mode is
    /// mandatory; zero sizes and the default priority are skipped.
    fn setup_socket(fd: &SocketFd, connections: &ConnectionManager) -> Result<bool, SocketError> {
        if !recoverable(fd.set_nonblock())? {
            return Ok(false);
        }

        if let Some(tos) = connections.priority().tos() {
            if !recoverable(fd.set_priority(tos))? {
                return Ok(false);
            }
        }

        if connections.send_buffer_size() != 0
            && !recoverable(fd.set_send_buffer_size(connections.send_buffer_size()))?
        {
            return Ok(false);
        }

        if connections.receive_buffer_size() != 0
            && !recoverable(fd.set_receive_buffer_size(connections.receive_buffer_size()))?
        {
            return Ok(false);
        }

        Ok(true)
    }

    /// Removes a session regardless of progress and tears it down. The
    /// socket count is settled before the socket is closed.
    fn teardown(
        &mut self,
        id: HandshakeId,
        operation: &'static str,
        connections: &mut ConnectionManager,
    ) -> Result<(), HandshakeFault> {
        let mut handshake = self.erase(id, operation)?;
        handshake.deactivate_connection();
        connections.dec_socket_count()?;
        handshake.destroy_connection()?;
        Ok(())
    }

    /// Removes an active session and deactivates it.
    fn take_active(
        &mut self,
        id: HandshakeId,
        operation: &'static str,
    ) -> Result<F::Session, HandshakeFault> {
        let active = self
            .handshakes
            .get(&id)
            .map(|handshake| handshake.is_active())
            .ok_or(HandshakeFault::UnknownHandshake { operation, id })?;

        if !active {
            return Err(HandshakeFault::InactiveHandshake { operation, id });
        }

        let mut handshake = self.erase(id, operation)?;
        handshake.deactivate_connection();
        Ok(handshake)
    }

    fn erase(
        &mut self,
        id: HandshakeId,
        operation: &'static str,
    ) -> Result<F::Session, HandshakeFault> {
        self.handshakes
            .remove(&id)
            .ok_or(HandshakeFault::UnknownHandshake { operation, id })
    }

    fn allocate_id(&mut self) -> HandshakeId {
        let id = HandshakeId(self.next_id);
        self.next_id += 1;
        id
    }
}

fn drop_reason(download: &dyn Download, bitfield: &Bitfield) -> HandshakeError {
    if !download.is_active() {
        HandshakeError::InactiveDownload
    } else if download.is_done() && bitfield.is_all_set() {
        HandshakeError::UnwantedConnection
    } else {
        HandshakeError::Duplicate
    }
}

fn timeout_error(state: HandshakeState) -> HandshakeError {
    if state == HandshakeState::Connecting {
        HandshakeError::NetworkUnreachable
    } else {
        HandshakeError::NetworkTimeout
    }
}

fn fd_number(fd: &SocketFd) -> RawFd {
    fd.raw_fd().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert_eq!(
            timeout_error(HandshakeState::Connecting),
            HandshakeError::NetworkUnreachable
        );
        assert_eq!(
            timeout_error(HandshakeState::Negotiating),
            HandshakeError::NetworkTimeout
        );
    }

    #[test]
    fn test_drop_reason_precedence() {
        use crate::handshake::test_mocks::MockDownload;

        let mut download = MockDownload::default();
        let seed = Bitfield::full(4);
        let leech = Bitfield::new(4);

        assert_eq!(drop_reason(&download, &seed), HandshakeError::Duplicate);

        download.done = true;
        assert_eq!(drop_reason(&download, &seed), HandshakeError::UnwantedConnection);
        assert_eq!(drop_reason(&download, &leech), HandshakeError::Duplicate);

        download.active = false;
        assert_eq!(drop_reason(&download, &seed), HandshakeError::InactiveDownload);
    }
}
