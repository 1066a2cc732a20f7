//! Dual-stack socket descriptor wrapper.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::address::{normalize, to_mapped};

/// Errors produced by socket operations.
///
/// Only `Io` is an ordinary network failure. The other variants mean a
/// descriptor's lifetime was mishandled upstream and must not be retried.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("SocketFd::{operation}() called on an invalid descriptor")]
    InvalidDescriptor { operation: &'static str },

    #[error("SocketFd::close() called on a descriptor the OS does not know: fd:{fd}")]
    BadDescriptor { fd: RawFd },

    #[error("SocketFd::get_error() could not read the pending socket error")]
    ErrorUnavailable(#[source] io::Error),

    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Returns true for errors that indicate a broken descriptor lifetime.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SocketError::Io(_))
    }
}

/// Collapses a socket result into success/failure, propagating only faults.
///
/// # Errors
///
/// - `SocketError` - If the failure is fatal (see [`SocketError::is_fatal`])
pub fn recoverable(result: Result<(), SocketError>) -> Result<bool, SocketError> {
    match result {
        Ok(()) => Ok(true),
        Err(SocketError::Io(e)) => {
            tracing::trace!("Socket operation failed: {e}");
            Ok(false)
        }
        Err(fault) => Err(fault),
    }
}

/// Exclusively owned OS socket that bridges IPv4 and IPv6.
///
/// Streams and datagrams are opened as IPv6 sockets with `IPV6_V6ONLY`
/// cleared whenever the host supports it, falling back to IPv4. On a
/// dual-stack socket every IPv4 address passed in is translated to its
/// v4-mapped form, and every v4-mapped address handed out is translated
/// back, so callers never observe mapped addresses.
///
/// The invalid state is a real value: a default `SocketFd`, one that has
/// been closed, or one whose descriptor was moved out with [`take`].
/// Calling anything except [`is_valid`] on it is a contract fault.
///
/// [`take`]: SocketFd::take
/// [`is_valid`]: SocketFd::is_valid
#[derive(Debug, Default)]
pub struct SocketFd {
    socket: Option<Socket>,
    ipv6_socket: bool,
}

impl SocketFd {
    fn new(socket: Socket, ipv6_socket: bool) -> Self {
        Self {
            socket: Some(socket),
            ipv6_socket,
        }
    }

    /// Returns a handle that owns no descriptor.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Opens a TCP stream socket, preferring dual-stack IPv6.
    ///
    /// # Errors
    ///
    /// - `io::Error` - If neither family can be opened, or the IPv6 socket
    ///   refuses to clear `IPV6_V6ONLY`
    pub fn open_stream() -> io::Result<Self> {
        Self::open_dual_stack(Type::STREAM, Some(Protocol::TCP))
    }

    /// Opens a UDP socket, preferring dual-stack IPv6.
    ///
    /// # Errors
    ///
    /// - `io::Error` - If neither family can be opened, or the IPv6 socket
    ///   refuses to clear `IPV6_V6ONLY`
    pub fn open_datagram() -> io::Result<Self> {
        Self::open_dual_stack(Type::DGRAM, None)
    }

    fn open_dual_stack(ty: Type, protocol: Option<Protocol>) -> io::Result<Self> {
        match Socket::new(Domain::IPV6, ty, protocol) {
            Ok(socket) => {
                let fd = Self::new(socket, true);

                if let Err(e) = fd.set_ipv6_v6only(false) {
                    tracing::debug!("Could not clear IPV6_V6ONLY, closing socket: {e}");
                    return Err(fd.abandon(e));
                }

                Ok(fd)
            }
            Err(e) => {
                tracing::trace!("IPv6 socket unavailable, falling back to IPv4: {e}");
                Socket::new(Domain::IPV4, ty, protocol).map(|socket| Self::new(socket, false))
            }
        }
    }

    /// Opens a local-domain stream socket for internal signalling.
    ///
    /// # Errors
    ///
    /// - `io::Error` - If the socket cannot be created
    pub fn open_local() -> io::Result<Self> {
        Socket::new(Domain::UNIX, Type::STREAM, None).map(|socket| Self::new(socket, false))
    }

    /// Opens a connected pair of local-domain stream sockets.
    ///
    /// # Errors
    ///
    /// - `io::Error` - If the pair cannot be created
    pub fn open_socket_pair() -> io::Result<(Self, Self)> {
        let (first, second) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        Ok((Self::new(first, false), Self::new(second, false)))
    }

    pub fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    /// Returns true if the descriptor is a dual-stack IPv6 socket.
    pub fn is_ipv6_socket(&self) -> bool {
        self.ipv6_socket
    }

    /// Returns the raw descriptor, or `None` for an invalid handle.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn checked(&self, operation: &'static str) -> Result<&Socket, SocketError> {
        self.socket
            .as_ref()
            .ok_or(SocketError::InvalidDescriptor { operation })
    }

    /// Moves the descriptor out, leaving this handle invalid.
    ///
    /// This is how ownership is handed from a handshake to the connection
    /// that replaces it.
    pub fn take(&mut self) -> SocketFd {
        mem::take(self)
    }

    /// Consumes the handle and returns the underlying socket.
    pub fn into_socket(self) -> Option<Socket> {
        self.socket
    }

    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the flag cannot be set
    pub fn set_nonblock(&self) -> Result<(), SocketError> {
        Ok(self.checked("set_nonblock")?.set_nonblocking(true)?)
    }

    /// Sets the traffic class (IPv6) or TOS byte (IPv4).
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the option is rejected
    pub fn set_priority(&self, priority: u32) -> Result<(), SocketError> {
        let socket = self.checked("set_priority")?;

        if self.ipv6_socket {
            Ok(socket.set_tclass_v6(priority)?)
        } else {
            Ok(socket.set_tos(priority)?)
        }
    }

    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the option is rejected
    pub fn set_reuse_address(&self, state: bool) -> Result<(), SocketError> {
        Ok(self.checked("set_reuse_address")?.set_reuse_address(state)?)
    }

    /// Sets `IPV6_V6ONLY`. Fails on sockets that are not IPv6.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the socket is IPv4 or the option is rejected
    pub fn set_ipv6_v6only(&self, state: bool) -> Result<(), SocketError> {
        let socket = self.checked("set_ipv6_v6only")?;

        if !self.ipv6_socket {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPV6_V6ONLY on a non-IPv6 socket",
            )
            .into());
        }

        Ok(socket.set_only_v6(state)?)
    }

    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the option is rejected
    pub fn set_send_buffer_size(&self, size: u32) -> Result<(), SocketError> {
        Ok(self
            .checked("set_send_buffer_size")?
            .set_send_buffer_size(size as usize)?)
    }

    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the option is rejected
    pub fn set_receive_buffer_size(&self, size: u32) -> Result<(), SocketError> {
        Ok(self
            .checked("set_receive_buffer_size")?
            .set_recv_buffer_size(size as usize)?)
    }

    /// Reads and clears the pending socket error (`SO_ERROR`).
    ///
    /// This is how the outcome of a non-blocking connect is learned.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::ErrorUnavailable` - If `SO_ERROR` cannot be read
    pub fn get_error(&self) -> Result<Option<io::Error>, SocketError> {
        self.checked("get_error")?
            .take_error()
            .map_err(SocketError::ErrorUnavailable)
    }

    /// Binds to `address`, mapping IPv4 onto a dual-stack socket.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the bind fails
    pub fn bind(&self, address: &SocketAddr) -> Result<(), SocketError> {
        let socket = self.checked("bind")?;
        Ok(socket.bind(&self.wire_address(*address))?)
    }

    /// Binds to a raw socket address, which carries its own length.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the bind fails
    pub fn bind_raw(&self, address: &SockAddr) -> Result<(), SocketError> {
        let socket = self.checked("bind")?;

        match address.as_socket() {
            Some(inet) => Ok(socket.bind(&self.wire_address(inet))?),
            None => Ok(socket.bind(address)?),
        }
    }

    /// Starts connecting to `address`.
    ///
    /// An in-progress non-blocking connect counts as success. The real
    /// outcome must be read later with [`get_error`](SocketFd::get_error).
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the connect fails immediately
    pub fn connect(&self, address: &SocketAddr) -> Result<(), SocketError> {
        let socket = self.checked("connect")?;

        match socket.connect(&self.wire_address(*address)) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the local address, with v4-mapped addresses normalized.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If the address cannot be read or is not inet
    pub fn getsockname(&self) -> Result<SocketAddr, SocketError> {
        let local = self.checked("getsockname")?.local_addr()?;
        self.host_address(&local)
    }

    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If listen fails
    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        Ok(self.checked("listen")?.listen(backlog)?)
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when nothing is pending on a non-blocking socket.
    /// The accepted socket inherits this socket's family flag, and the
    /// peer address is normalized to plain IPv4 when it arrives mapped.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is invalid
    /// - `SocketError::Io` - If accept fails
    pub fn accept(&self) -> Result<Option<(SocketFd, SocketAddr)>, SocketError> {
        let socket = self.checked("accept")?;

        let (accepted, peer) = match socket.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let accepted = SocketFd::new(accepted, self.ipv6_socket);
        let address = self.host_address(&peer)?;

        Ok(Some((accepted, address)))
    }

    /// Closes the descriptor.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidDescriptor` - If the handle is already invalid
    /// - `SocketError::BadDescriptor` - If the OS reports the descriptor
    ///   as already closed
    pub fn close(&mut self) -> Result<(), SocketError> {
        let socket = self
            .socket
            .take()
            .ok_or(SocketError::InvalidDescriptor { operation: "close" })?;
        let fd = socket.into_raw_fd();

        // SAFETY: `fd` was released by `socket` above and has no other owner.
        if unsafe { libc::close(fd) } != 0
            && io::Error::last_os_error().raw_os_error() == Some(libc::EBADF)
        {
            return Err(SocketError::BadDescriptor { fd });
        }

        Ok(())
    }

    /// Closes a socket whose setup failed and reports why.
    ///
    /// A fault from the close itself takes precedence over `cause`.
    fn abandon(mut self, cause: SocketError) -> io::Error {
        let error = match self.close() {
            Ok(()) => cause,
            Err(fault) => fault,
        };

        match error {
            SocketError::Io(e) => e,
            fault => io::Error::other(fault),
        }
    }

    fn wire_address(&self, address: SocketAddr) -> SockAddr {
        if self.ipv6_socket && address.is_ipv4() {
            SockAddr::from(to_mapped(address))
        } else {
            SockAddr::from(address)
        }
    }

    fn host_address(&self, address: &SockAddr) -> Result<SocketAddr, SocketError> {
        let inet = address.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "not an inet socket address")
        })?;

        Ok(if self.ipv6_socket { normalize(inet) } else { inet })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use super::*;

    fn loopback_listener() -> (SocketFd, SocketAddr) {
        let listener = SocketFd::open_stream().unwrap();
        listener.set_reuse_address(true).unwrap();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let address = listener.getsockname().unwrap();
        (listener, address)
    }

    #[test]
    fn test_open_stream_is_valid() {
        let fd = SocketFd::open_stream().unwrap();
        assert!(fd.is_valid());
        assert!(fd.raw_fd().is_some());
    }

    #[test]
    fn test_getsockname_reports_plain_v4() {
        let (_listener, address) = loopback_listener();

        assert!(address.is_ipv4());
        assert_eq!(address.ip().to_string(), "127.0.0.1");
        assert_ne!(address.port(), 0);
    }

    #[test]
    fn test_accept_normalizes_peer_address() {
        let (listener, address) = loopback_listener();
        let mut client = TcpStream::connect(address).unwrap();

        let (mut accepted, peer) = listener.accept().unwrap().expect("pending connection");

        assert!(peer.is_ipv4());
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(accepted.is_ipv6_socket(), listener.is_ipv6_socket());

        client.write_all(b"ping").unwrap();
        let mut stream: TcpStream = accepted.take().into_socket().unwrap().into();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_accept_without_pending_connection() {
        let (listener, _) = loopback_listener();
        listener.set_nonblock().unwrap();

        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_nonblocking_connect_completes_via_get_error() {
        let (listener, address) = loopback_listener();
        let fd = SocketFd::open_stream().unwrap();
        fd.set_nonblock().unwrap();

        fd.connect(&address).unwrap();

        listener.set_nonblock().unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = listener.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert!(accepted.is_some());
        assert!(fd.get_error().unwrap().is_none());
    }

    #[test]
    fn test_buffer_sizes_accepted() {
        let fd = SocketFd::open_stream().unwrap();
        assert!(recoverable(fd.set_send_buffer_size(64 * 1024)).unwrap());
        assert!(recoverable(fd.set_receive_buffer_size(64 * 1024)).unwrap());
    }

    #[test]
    fn test_priority_sets_family_option() {
        let fd = SocketFd::open_stream().unwrap();
        let ipv6 = fd.is_ipv6_socket();

        fd.set_priority(0x10).unwrap();

        let socket = fd.into_socket().unwrap();
        if ipv6 {
            assert_eq!(socket.tclass_v6().unwrap(), 0x10);
        } else {
            assert_eq!(socket.tos().unwrap(), 0x10);
        }
    }

    #[test]
    fn test_priority_rejected_on_local_socket() {
        let fd = SocketFd::open_local().unwrap();

        let err = fd.set_priority(0x10).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_abandon_reports_setup_failure() {
        let fd = SocketFd::open_stream().unwrap();

        let err = fd.abandon(io::Error::new(io::ErrorKind::Unsupported, "no dual stack").into());

        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_abandon_surfaces_close_fault() {
        let err = SocketFd::invalid().abandon(io::Error::other("setup failed").into());

        let fault = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<SocketError>())
            .expect("close fault");
        assert!(matches!(
            fault,
            SocketError::InvalidDescriptor { operation: "close" }
        ));
    }

    #[test]
    fn test_v6only_rejected_on_v4_socket() {
        let fd = SocketFd::open_stream().unwrap();

        if !fd.is_ipv6_socket() {
            assert!(!recoverable(fd.set_ipv6_v6only(true)).unwrap());
        }
    }

    #[test]
    fn test_invalid_handle_is_a_fault() {
        let fd = SocketFd::invalid();

        let err = fd.set_nonblock().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            SocketError::InvalidDescriptor {
                operation: "set_nonblock"
            }
        ));
        assert!(recoverable(fd.connect(&"127.0.0.1:1".parse().unwrap())).is_err());
    }

    #[test]
    fn test_double_close_is_a_fault() {
        let mut fd = SocketFd::open_stream().unwrap();

        fd.close().unwrap();
        assert!(!fd.is_valid());

        let err = fd.close().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_take_moves_ownership() {
        let mut fd = SocketFd::open_stream().unwrap();
        let raw = fd.raw_fd();

        let mut moved = fd.take();

        assert!(!fd.is_valid());
        assert_eq!(moved.raw_fd(), raw);
        moved.close().unwrap();
    }

    #[test]
    fn test_socket_pair_is_connected() {
        let (first, second) = SocketFd::open_socket_pair().unwrap();
        let first: std::os::unix::net::UnixStream = first.into_socket().unwrap().into();
        let second: std::os::unix::net::UnixStream = second.into_socket().unwrap().into();

        (&first).write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        (&second).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_open_datagram_and_local() {
        assert!(SocketFd::open_datagram().unwrap().is_valid());
        assert!(SocketFd::open_local().unwrap().is_valid());
    }
}
