//! Client identification from peer ids.

use super::PeerId;

/// Peer id encoding convention a client follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStyle {
    #[default]
    Unknown,
    /// `-XXvvvv-`: two-letter key and four version characters
    Azureus,
    /// `Xvvv--`: one-letter key and three version characters
    Compact,
    /// `Mv-v-v--`: BitTorrent mainline
    Mainline,
}

/// Classified client of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub style: ClientStyle,
    /// Raw client key taken from the peer id
    pub key: String,
    /// Version components as they appear in the peer id
    pub version: [u8; 4],
    /// Human readable name, when the key is known
    pub name: Option<&'static str>,
}

/// Classifies the client string embedded in a peer id.
pub trait ClientRegistry {
    fn retrieve_id(&self, id: &PeerId) -> ClientInfo;
}

/// Registry of well known client keys.
#[derive(Debug, Clone)]
pub struct ClientList {
    azureus: Vec<(&'static str, &'static str)>,
    compact: Vec<(&'static str, &'static str)>,
}

impl Default for ClientList {
    fn default() -> Self {
        Self {
            azureus: vec![
                ("AZ", "Azureus"),
                ("BC", "BitComet"),
                ("DE", "Deluge"),
                ("KT", "KTorrent"),
                ("LT", "libtorrent (Rasterbar)"),
                ("lt", "libTorrent (Rakshasa)"),
                ("qB", "qBittorrent"),
                ("SH", "Shoal"),
                ("TR", "Transmission"),
                ("UT", "\u{b5}Torrent"),
            ],
            compact: vec![
                ("A", "ABC"),
                ("O", "Osprey Permaseed"),
                ("Q", "BTQueue"),
                ("R", "Tribler"),
                ("S", "Shadow"),
                ("T", "BitTornado"),
                ("U", "UPnP NAT Bit Torrent"),
            ],
        }
    }
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a name for an Azureus-style two-letter key.
    pub fn insert_azureus(&mut self, key: &'static str, name: &'static str) {
        self.azureus.retain(|(existing, _)| *existing != key);
        self.azureus.push((key, name));
    }

    fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
        table
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, name)| *name)
    }
}

impl ClientRegistry for ClientList {
    fn retrieve_id(&self, id: &PeerId) -> ClientInfo {
        let bytes = id.as_bytes();

        if bytes[0] == b'-' && bytes[7] == b'-' && bytes[1..7].iter().all(u8::is_ascii_alphanumeric)
        {
            let key = String::from_utf8_lossy(&bytes[1..3]).into_owned();
            return ClientInfo {
                name: Self::lookup(&self.azureus, &key),
                style: ClientStyle::Azureus,
                key,
                version: [bytes[3], bytes[4], bytes[5], bytes[6]],
            };
        }

        if bytes[0] == b'M'
            && bytes[2] == b'-'
            && bytes[4] == b'-'
            && bytes[1].is_ascii_digit()
            && bytes[3].is_ascii_digit()
        {
            return ClientInfo {
                style: ClientStyle::Mainline,
                key: "M".to_string(),
                version: [bytes[1], bytes[3], bytes[5], b'0'],
                name: Some("Mainline"),
            };
        }

        if bytes[0].is_ascii_alphabetic()
            && bytes[4] == b'-'
            && bytes[5] == b'-'
            && bytes[1..4].iter().all(u8::is_ascii_alphanumeric)
        {
            let key = String::from_utf8_lossy(&bytes[..1]).into_owned();
            return ClientInfo {
                name: Self::lookup(&self.compact, &key),
                style: ClientStyle::Compact,
                key,
                version: [bytes[1], bytes[2], bytes[3], b'0'],
            };
        }

        ClientInfo::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(prefix: &[u8]) -> PeerId {
        let mut id = [b'x'; 20];
        id[..prefix.len()].copy_from_slice(prefix);
        PeerId::new(id)
    }

    #[test]
    fn test_azureus_style() {
        let info = ClientList::new().retrieve_id(&peer_id(b"-TR2940-"));

        assert_eq!(info.style, ClientStyle::Azureus);
        assert_eq!(info.key, "TR");
        assert_eq!(info.name, Some("Transmission"));
        assert_eq!(&info.version, b"2940");
    }

    #[test]
    fn test_unknown_azureus_key_keeps_raw_key() {
        let info = ClientList::new().retrieve_id(&peer_id(b"-ZZ0100-"));

        assert_eq!(info.style, ClientStyle::Azureus);
        assert_eq!(info.key, "ZZ");
        assert_eq!(info.name, None);
    }

    #[test]
    fn test_compact_and_mainline_styles() {
        let list = ClientList::new();

        let shadow = list.retrieve_id(&peer_id(b"S58B--"));
        assert_eq!(shadow.style, ClientStyle::Compact);
        assert_eq!(shadow.name, Some("Shadow"));

        let mainline = list.retrieve_id(&peer_id(b"M4-3-6--"));
        assert_eq!(mainline.style, ClientStyle::Mainline);
        assert_eq!(&mainline.version[..3], b"436");
    }

    #[test]
    fn test_generated_id_is_recognized() {
        let info = ClientList::new().retrieve_id(&PeerId::generate());
        assert_eq!(info.name, Some("Shoal"));
    }

    #[test]
    fn test_garbage_is_unknown() {
        let info = ClientList::new().retrieve_id(&PeerId::new([0u8; 20]));
        assert_eq!(info, ClientInfo::default());
    }

    #[test]
    fn test_insert_overrides_name() {
        let mut list = ClientList::new();
        list.insert_azureus("TR", "Transmission (patched)");

        let info = list.retrieve_id(&peer_id(b"-TR3000-"));
        assert_eq!(info.name, Some("Transmission (patched)"));
    }
}
