//! Policy bitfields and diagnostic kinds carried by handshakes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Encryption and routing policy for one connection attempt.
///
/// Retries fold [`RETRYING`](Self::RETRYING) into the options of the
/// failed attempt, which disables the recent-connection throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EncryptionOptions(u32);

impl EncryptionOptions {
    pub const NONE: Self = Self(0);
    pub const ALLOW_INCOMING: Self = Self(1 << 0);
    pub const TRY_OUTGOING: Self = Self(1 << 1);
    pub const REQUIRE: Self = Self(1 << 2);
    pub const REQUIRE_RC4: Self = Self(1 << 3);
    pub const ENABLE_RETRY: Self = Self(1 << 4);
    pub const PREFER_PLAINTEXT: Self = Self(1 << 5);
    pub const RETRYING: Self = Self(1 << 6);
    pub const USE_PROXY: Self = Self(1 << 7);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for EncryptionOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EncryptionOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::LowerHex for EncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Flags for resolving a peer record in a download's peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectOptions(u32);

impl ConnectOptions {
    pub const NONE: Self = Self(0);
    /// Return the record even when a handshake for it is in flight
    pub const KEEP_HANDSHAKES: Self = Self(1 << 0);
    /// Refuse peers that were connected to recently
    pub const FILTER_RECENT: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConnectOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConnectOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Diagnostic classification of a handshake event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeMessage {
    Incoming,
    Outgoing,
    OutgoingEncrypted,
    OutgoingProxy,
    Success,
    Dropped,
    Failed,
    RetryPlaintext,
    RetryEncrypted,
}

impl HandshakeMessage {
    /// Kind of an outgoing attempt made with `options`.
    pub fn for_outgoing(options: EncryptionOptions) -> Self {
        if options.contains(EncryptionOptions::USE_PROXY) {
            HandshakeMessage::OutgoingProxy
        } else if options.intersects(EncryptionOptions::TRY_OUTGOING | EncryptionOptions::REQUIRE)
        {
            HandshakeMessage::OutgoingEncrypted
        } else {
            HandshakeMessage::Outgoing
        }
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeMessage::Incoming => "incoming",
            HandshakeMessage::Outgoing => "outgoing",
            HandshakeMessage::OutgoingEncrypted => "outgoing_encrypted",
            HandshakeMessage::OutgoingProxy => "outgoing_proxy",
            HandshakeMessage::Success => "success",
            HandshakeMessage::Dropped => "dropped",
            HandshakeMessage::Failed => "failed",
            HandshakeMessage::RetryPlaintext => "retry_plaintext",
            HandshakeMessage::RetryEncrypted => "retry_encrypted",
        };
        f.write_str(name)
    }
}

/// Outcome of encryption negotiation, handed to the promoted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncryptionInfo {
    /// Payload is RC4 encrypted in both directions
    pub encrypted: bool,
    /// Only the handshake header was obfuscated
    pub obfuscated: bool,
}

/// Protocol extensions negotiated through the reserved handshake bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolExtension {
    /// BEP 10 extension protocol
    pub extension_protocol: bool,
    /// BEP 6 fast extension
    pub fast: bool,
    /// BEP 5 DHT port message
    pub dht: bool,
}

impl Default for ProtocolExtension {
    fn default() -> Self {
        Self {
            extension_protocol: true,
            fast: false,
            dht: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_option_bits() {
        let options = EncryptionOptions::TRY_OUTGOING | EncryptionOptions::ENABLE_RETRY;

        assert!(options.contains(EncryptionOptions::TRY_OUTGOING));
        assert!(!options.contains(EncryptionOptions::TRY_OUTGOING | EncryptionOptions::REQUIRE));
        assert!(options.intersects(EncryptionOptions::TRY_OUTGOING | EncryptionOptions::REQUIRE));
        assert_eq!(options.without(EncryptionOptions::ENABLE_RETRY), EncryptionOptions::TRY_OUTGOING);
        assert_eq!(format!("{options:x}"), "12");
    }

    #[test]
    fn test_outgoing_message_kind() {
        assert_eq!(
            HandshakeMessage::for_outgoing(EncryptionOptions::NONE),
            HandshakeMessage::Outgoing
        );
        assert_eq!(
            HandshakeMessage::for_outgoing(EncryptionOptions::REQUIRE),
            HandshakeMessage::OutgoingEncrypted
        );
        assert_eq!(
            HandshakeMessage::for_outgoing(
                EncryptionOptions::TRY_OUTGOING | EncryptionOptions::USE_PROXY
            ),
            HandshakeMessage::OutgoingProxy
        );
    }
}
