//! Handshake admission, failure and timeouts driven on a running network
//! thread through its callback queue.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use shoal_core::config::ShoalConfig;
use shoal_core::connection_manager::ConnectionManager;
use shoal_core::handshake::test_mocks::{MockDownloads, MockFactory};
use shoal_core::handshake::{
    HandshakeContext, HandshakeError, HandshakeFault, HandshakeHost, HandshakeId,
    HandshakeManager, HandshakeMessage,
};
use shoal_core::net::SocketFd;
use shoal_core::peer::ClientList;
use shoal_core::thread::{CallbackTarget, NetThread, NetThreadHandle, Scheduler, ThreadState};

const WAIT: Duration = Duration::from_secs(5);

/// Host state of the thread under test: a listening socket feeding a
/// handshake manager.
struct Peers {
    listener: SocketFd,
    manager: HandshakeManager<MockFactory>,
    connections: ConnectionManager,
    downloads: MockDownloads,
    clients: ClientList,
    faults: Vec<HandshakeFault>,
}

impl HandshakeHost for Peers {
    type Factory = MockFactory;

    fn handshakes(&mut self) -> (&mut HandshakeManager<MockFactory>, HandshakeContext<'_>) {
        (
            &mut self.manager,
            HandshakeContext {
                connections: &mut self.connections,
                downloads: &mut self.downloads,
                clients: &self.clients,
            },
        )
    }

    fn handshake_fault(&mut self, fault: HandshakeFault) {
        self.faults.push(fault);
    }
}

impl Peers {
    fn bind(config: &ShoalConfig) -> shoal_core::Result<(Self, SocketAddr)> {
        let listener = SocketFd::open_stream()?;
        listener.set_reuse_address(true)?;
        listener.bind(&"127.0.0.1:0".parse().unwrap())?;
        listener.listen(config.network.listen_backlog)?;
        let address = listener.getsockname()?;

        let peers = Self {
            listener,
            manager: HandshakeManager::new(MockFactory::new(), &config.handshake),
            connections: ConnectionManager::new(&config.network),
            downloads: MockDownloads::default(),
            clients: ClientList::new(),
            faults: Vec::new(),
        };
        Ok((peers, address))
    }

    /// Accepts one pending connection and offers it to the manager.
    fn accept_incoming(&mut self) -> shoal_core::Result<Option<HandshakeId>> {
        let Some((fd, address)) = self.listener.accept()? else {
            return Ok(None);
        };

        let (manager, mut ctx) = self.handshakes();
        Ok(manager.add_incoming(fd, address, &mut ctx)?)
    }

    fn fail(&mut self, id: HandshakeId, error: HandshakeError) -> shoal_core::Result<()> {
        let (manager, mut ctx) = self.handshakes();
        let retry = manager.receive_failed(id, HandshakeMessage::Failed, error, &mut ctx)?;
        assert_eq!(retry, None);
        Ok(())
    }
}

fn start(peers: Peers, config: &ShoalConfig) -> shoal_core::Result<NetThreadHandle<Peers>> {
    let mut thread = NetThread::create(&config.thread)?;
    thread.init_thread()?;
    let handle = thread.start_thread(peers)?;
    assert_eq!(handle.state(), ThreadState::Active);
    Ok(handle)
}

/// Runs `f` on the thread and waits for its result.
fn on_thread<R: Send + 'static>(
    handle: &NetThreadHandle<Peers>,
    f: impl FnOnce(&mut Peers, &mut Scheduler<Peers>) -> R + Send + 'static,
) -> R {
    let (done_tx, done_rx) = mpsc::channel();
    handle
        .callbacks()
        .push(CallbackTarget::unique(), move |peers, scheduler| {
            let _ = done_tx.send(f(peers, scheduler));
        });
    done_rx.recv_timeout(WAIT).unwrap()
}

/// Returns true once the remote end has closed `stream`.
fn closed_by_peer(stream: &mut TcpStream) -> bool {
    stream.set_read_timeout(Some(WAIT)).unwrap();
    matches!(stream.read(&mut [0u8; 16]), Ok(0))
}

#[test]
fn test_thread_admits_incoming_handshakes_up_to_limit() -> shoal_core::Result<()> {
    let mut config = ShoalConfig::for_testing();
    config.network.max_open_sockets = 1;

    let (peers, address) = Peers::bind(&config)?;
    let handle = start(peers, &config)?;

    let first = TcpStream::connect(address)?;
    let mut second = TcpStream::connect(address)?;

    let (admitted, refused) = on_thread(&handle, |peers, _| {
        let admitted = peers.accept_incoming().unwrap();
        let refused = peers.accept_incoming().unwrap();
        (admitted, refused)
    });
    assert!(admitted.is_some());
    assert_eq!(refused, None);
    assert!(closed_by_peer(&mut second));

    let mut peers = handle.stop_thread_wait()?;
    assert_eq!(peers.manager.len(), 1);
    assert_eq!(peers.connections.size(), 1);
    assert_eq!(peers.manager.factory().created[0].2, first.local_addr()?);

    peers.manager.clear(&mut peers.connections)?;
    assert_eq!(peers.connections.size(), 0);
    Ok(())
}

#[test]
fn test_filtered_incoming_is_closed_on_thread() -> shoal_core::Result<()> {
    let config = ShoalConfig::for_testing();
    let (mut peers, address) = Peers::bind(&config)?;
    peers
        .connections
        .set_filter(|address: &SocketAddr| address.ip().is_loopback());
    let handle = start(peers, &config)?;

    let mut client = TcpStream::connect(address)?;
    let admitted = on_thread(&handle, |peers, _| peers.accept_incoming().unwrap());
    assert_eq!(admitted, None);
    assert!(closed_by_peer(&mut client));

    let peers = handle.stop_thread_wait()?;
    assert!(peers.manager.is_empty());
    assert!(peers.manager.factory().created.is_empty());
    assert_eq!(peers.connections.size(), 0);
    Ok(())
}

#[test]
fn test_failed_handshake_frees_its_slot() -> shoal_core::Result<()> {
    let mut config = ShoalConfig::for_testing();
    config.network.max_open_sockets = 1;

    let (peers, address) = Peers::bind(&config)?;
    let handle = start(peers, &config)?;

    let mut first = TcpStream::connect(address)?;
    let id = on_thread(&handle, |peers, _| peers.accept_incoming().unwrap());
    let id = id.unwrap();

    let second = TcpStream::connect(address)?;
    let readmitted = on_thread(&handle, move |peers, _| {
        peers.fail(id, HandshakeError::NotBitTorrent).unwrap();
        peers.accept_incoming().unwrap()
    });
    assert!(closed_by_peer(&mut first));
    let readmitted = readmitted.unwrap();
    assert_ne!(readmitted, id);

    let mut peers = handle.stop_thread_wait()?;
    assert_eq!(peers.manager.ids(), vec![readmitted]);
    assert_eq!(peers.connections.size(), 1);
    assert_eq!(peers.manager.factory().created[1].2, second.local_addr()?);

    peers.manager.clear(&mut peers.connections)?;
    Ok(())
}

#[test]
fn test_stalled_handshake_times_out_on_thread() -> shoal_core::Result<()> {
    let config = ShoalConfig::for_testing();
    let (peers, address) = Peers::bind(&config)?;
    let handle = start(peers, &config)?;

    let mut client = TcpStream::connect(address)?;
    let admitted = on_thread(&handle, |peers, scheduler| {
        let id = peers.accept_incoming().unwrap()?;
        peers.manager.schedule_timeout(id, scheduler);
        Some(id)
    });
    assert!(admitted.is_some());

    // The client never speaks, so only the timer can close the socket
    assert!(closed_by_peer(&mut client));

    let peers = handle.stop_thread_wait()?;
    assert!(peers.manager.is_empty());
    assert_eq!(peers.connections.size(), 0);
    assert!(peers.faults.is_empty());
    Ok(())
}
