use anyhow::Context;

/// Piece availability set with an explicit bit length.
///
/// Bits are MSB-first within each byte, matching the wire encoding of
/// the bitfield message. The length only ever grows (elastic torrents);
/// classic and merkle torrents keep it fixed for the connection's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bytes: Vec<u8>,
    len: usize,
}

impl BitField {
    pub fn empty(pieces_amount: usize) -> Self {
        Self {
            bytes: vec![0; std::cmp::max(pieces_amount.div_ceil(8), 1)],
            len: pieces_amount,
        }
    }

    /// Build from wire bytes for a known piece count.
    /// Fails if the byte count is wrong for the piece count or any spare
    /// bit after the end is set.
    pub fn from_bytes(data: &[u8], pieces_amount: usize) -> anyhow::Result<Self> {
        let bitfield_bits = data.len() * 8;
        let leftover = bitfield_bits
            .checked_sub(pieces_amount)
            .context("bitfield has less capacity than needed")?;
        if leftover >= 8 {
            anyhow::bail!("bitfield is larger than needed");
        }
        let this = Self {
            bytes: data.to_vec(),
            len: pieces_amount,
        };
        for piece in pieces_amount..bitfield_bits {
            anyhow::ensure!(!this.bit(piece), "bit {piece} set past the end");
        }
        Ok(this)
    }

    /// Build from wire bytes without a spare-bit check, taking the byte
    /// capacity as the length. Used for elastic bitfields whose length
    /// may run past the static piece count.
    pub fn from_bytes_unchecked(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
            len: data.len() * 8,
        }
    }

    fn bit(&self, piece: usize) -> bool {
        let Some(block) = self.bytes.get(piece / 8) else {
            return false;
        };
        let position = (piece % 8) as u32;
        block & 1u8.rotate_right(position + 1) != 0
    }

    pub fn has(&self, piece: usize) -> bool {
        piece < self.len && self.bit(piece)
    }

    pub fn add(&mut self, piece: usize) -> anyhow::Result<()> {
        if piece >= self.len {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        }
        let block = &mut self.bytes[piece / 8];
        let position = (piece % 8) as u32;
        *block |= 1u8.rotate_right(position + 1);
        Ok(())
    }

    pub fn remove(&mut self, piece: usize) -> anyhow::Result<()> {
        if piece >= self.len {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        }
        let block = &mut self.bytes[piece / 8];
        let position = (piece % 8) as u32;
        *block &= !1u8.rotate_right(position + 1);
        Ok(())
    }

    /// Number of pieces this bitfield can describe
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cardinality
    pub fn count_ones(&self) -> usize {
        self.pieces().count()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Set every bit up to the length. This is the have-all expansion of
    /// an all-zero bitfield.
    pub fn set_all(&mut self) {
        for piece in 0..self.len {
            let block = &mut self.bytes[piece / 8];
            let position = (piece % 8) as u32;
            *block |= 1u8.rotate_right(position + 1);
        }
    }

    /// Grow to hold `pieces_amount` pieces. Never shrinks.
    pub fn extend(&mut self, pieces_amount: usize) {
        if pieces_amount <= self.len {
            return;
        }
        let needed = pieces_amount.div_ceil(8);
        if needed > self.bytes.len() {
            self.bytes.resize(needed, 0);
        }
        self.len = pieces_amount;
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.len;
        self.bytes.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8u32).filter_map(move |position| {
                let piece_i = i * 8 + position as usize;
                if piece_i >= len {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece_i)
            })
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod test {
    use super::BitField;

    #[test]
    fn bitfield_has() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::from_bytes(&data, 16).unwrap();
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(bitfield.has(3));
        assert!(!bitfield.has(4));
        assert!(bitfield.has(5));
        assert!(!bitfield.has(6));
        assert!(bitfield.has(7));
        assert!(!bitfield.has(8));
        assert!(bitfield.has(9));
        assert!(bitfield.has(10));
        assert!(bitfield.has(11));
        assert!(!bitfield.has(12));
        assert!(!bitfield.has(13));
        assert!(!bitfield.has(14));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(16));
        assert!(!bitfield.has(17));
    }

    #[test]
    fn bitfield_add_remove() {
        let mut bitfield = BitField::empty(18);
        bitfield.add(0).unwrap();
        bitfield.add(9).unwrap();
        bitfield.add(17).unwrap();
        assert!(bitfield.add(18).is_err());
        assert!(bitfield.has(0));
        assert!(bitfield.has(9));
        assert!(bitfield.has(17));
        assert_eq!(bitfield.count_ones(), 3);
        bitfield.remove(9).unwrap();
        assert!(!bitfield.has(9));
        assert!(bitfield.remove(20).is_err());
        assert_eq!(bitfield.count_ones(), 2);
    }

    #[test]
    fn bitfield_iterator() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::from_bytes(&data, 16).unwrap();
        let pieces: Vec<usize> = bitfield.pieces().collect();
        assert_eq!(pieces, [1, 2, 3, 5, 7, 9, 10, 11, 15]);
    }

    #[test]
    fn bitfield_from_bytes_validation() {
        let data = [0b01110101, 0b01110001, 0b00100000];
        assert!(BitField::from_bytes(&data, 16).is_err());
        assert!(BitField::from_bytes(&data, 1).is_err());
        assert!(BitField::from_bytes(&data, 13).is_err());
        assert!(BitField::from_bytes(&data, 18).is_err());
        assert!(BitField::from_bytes(&data, 19).is_ok());
        assert!(BitField::from_bytes(&data, 24).is_ok());
        assert!(BitField::from_bytes(&data, 25).is_err());
        let data = [0b11111111, 0b00000000];
        assert!(BitField::from_bytes(&data, 8).is_err());
        assert!(BitField::from_bytes(&data, 9).is_ok());
    }

    #[test]
    fn bitfield_set_all() {
        let mut bitfield = BitField::empty(13);
        bitfield.set_all();
        assert!(bitfield.is_full());
        assert_eq!(bitfield.count_ones(), 13);
        // spare bits stay clear so the wire form remains valid
        assert_eq!(bitfield.as_bytes()[1] & 0b0000_0111, 0);
    }

    #[test]
    fn bitfield_extend() {
        let mut bitfield = BitField::empty(10);
        bitfield.add(9).unwrap();
        bitfield.extend(14);
        assert_eq!(bitfield.len(), 14);
        assert!(bitfield.has(9));
        assert!(!bitfield.has(13));
        bitfield.add(13).unwrap();
        // extend never shrinks
        bitfield.extend(4);
        assert_eq!(bitfield.len(), 14);
        assert!(bitfield.has(13));
        bitfield.extend(30);
        assert_eq!(bitfield.len(), 30);
        assert_eq!(bitfield.count_ones(), 2);
    }
}
