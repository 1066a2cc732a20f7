//! Handshake collection: admission, outgoing dialing with encryption and
//! proxy fallback, and promotion of finished handshakes into live peer
//! connections.

pub mod download;
pub mod manager;
pub mod options;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

pub use download::{
    ConnectionList, Download, DownloadId, DownloadRegistry, PeerConnection, PeerList,
};
pub use manager::{HandshakeContext, HandshakeHost, HandshakeManager, HandshakeOutcome};
pub use options::{
    ConnectOptions, EncryptionInfo, EncryptionOptions, HandshakeMessage, ProtocolExtension,
};
pub use session::{
    HandshakeDirection, HandshakeFactory, HandshakeId, HandshakeSession, HandshakeState,
};

use crate::connection_manager::AdmissionError;
use crate::net::SocketError;

/// Why a handshake ended without a live connection.
///
/// These are ordinary outcomes. They travel through `receive_failed` or
/// the drop path of `receive_succeeded` and never abort the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Not a BitTorrent stream")]
    NotBitTorrent,

    #[error("Peer requires encryption")]
    NotEncrypted,

    #[error("Encryption negotiation failed")]
    Encryption,

    #[error("Unknown download")]
    UnknownDownload,

    #[error("Download is not active")]
    InactiveDownload,

    #[error("Duplicate connection")]
    Duplicate,

    #[error("Too many failed attempts")]
    TooManyFailed,

    #[error("No peer info")]
    NoPeerInfo,

    #[error("Network error")]
    NetworkError,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("Network timeout")]
    NetworkTimeout,

    #[error("Invalid value received")]
    InvalidValue,

    #[error("Unwanted connection")]
    UnwantedConnection,

    #[error("Connected to self")]
    IsSelf,

    #[error("Encryption required but not offered")]
    EncryptionRequired,
}

/// Contract violations in the handshake state machine.
///
/// Non-recoverable: the invariants were already broken upstream, so
/// callers propagate these instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeFault {
    #[error("HandshakeManager::{operation}() called on an inactive handshake: {id}")]
    InactiveHandshake {
        operation: &'static str,
        id: HandshakeId,
    },

    #[error("HandshakeManager::{operation}() could not find handshake {id}")]
    UnknownHandshake {
        operation: &'static str,
        id: HandshakeId,
    },

    #[error("Handshake {id} succeeded without {missing}")]
    Incomplete { id: HandshakeId, missing: &'static str },

    #[error("Unread data won't fit the connection's read buffer: unread:{unread} capacity:{capacity}")]
    UnreadOverflow { unread: usize, capacity: usize },

    #[error("Socket fault: {0}")]
    Socket(#[from] SocketError),

    #[error("Admission fault: {0}")]
    Admission(#[from] AdmissionError),
}
