//! Piece availability bitfield exchanged during the handshake.

/// Piece availability of a peer, most-significant bit first.
///
/// A handshake hands the bitfield it received to the connection it is
/// promoted to; [`is_all_set`](Bitfield::is_all_set) tells seeds apart
/// from leeches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    length: usize,
}

impl Bitfield {
    /// Creates an empty bitfield covering `length` pieces.
    pub fn new(length: usize) -> Self {
        Self {
            bits: vec![0; length.div_ceil(8)],
            length,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(length: usize) -> Self {
        let mut bitfield = Self::new(length);
        for index in 0..length {
            bitfield.set(index, true);
        }
        bitfield
    }

    /// Constructs a bitfield from wire bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is too short for `length` pieces.
    pub fn from_bytes(bytes: Vec<u8>, length: usize) -> Self {
        assert!(bytes.len() >= length.div_ceil(8), "not enough bytes");
        Self {
            bits: bytes,
            length,
        }
    }

    /// # Panics
    ///
    /// Panics if `index >= length`.
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.length, "index out of range");
        let mask = 1 << (7 - index % 8);
        if value {
            self.bits[index / 8] |= mask;
        } else {
            self.bits[index / 8] &= !mask;
        }
    }

    /// # Panics
    ///
    /// Panics if `index >= length`.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.length, "index out of range");
        self.bits[index / 8] & (1 << (7 - index % 8)) != 0
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of pieces set.
    pub fn count_set(&self) -> usize {
        (0..self.length).filter(|&index| self.get(index)).count()
    }

    /// Returns true if the peer has every piece. An empty bitfield is
    /// never "all set".
    pub fn is_all_set(&self) -> bool {
        self.length != 0 && self.count_set() == self.length
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_msb_first() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0, true);
        bitfield.set(9, true);

        assert!(bitfield.get(0));
        assert!(!bitfield.get(1));
        assert!(bitfield.get(9));
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_is_all_set() {
        let mut bitfield = Bitfield::new(3);
        assert!(!bitfield.is_all_set());

        bitfield.set(0, true);
        bitfield.set(1, true);
        assert!(!bitfield.is_all_set());

        bitfield.set(2, true);
        assert!(bitfield.is_all_set());
        assert!(Bitfield::full(17).is_all_set());
        assert!(!Bitfield::default().is_all_set());
    }

    #[test]
    fn test_from_bytes_ignores_padding_bits() {
        let bitfield = Bitfield::from_bytes(vec![0xff, 0xff], 12);
        assert!(bitfield.is_all_set());
        assert_eq!(bitfield.count_set(), 12);
    }

    #[test]
    #[should_panic(expected = "index out of range")]
    fn test_get_out_of_range_panics() {
        Bitfield::new(4).get(4);
    }
}
