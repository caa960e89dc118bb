use std::{fmt::Display, net::SocketAddr};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::{ALLOWED_FAST_SET_SIZE, MAX_BLOCK_LENGTH};

pub mod extension;
pub mod message;
pub mod parser;

/// Unique torrent identifier, the SHA-1 of its info dictionary
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Sub-region of a piece, the unit of wire transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

impl Block {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// A block is acceptable iff its piece exists, its length is within
    /// the block cap and it does not run past the end of the piece.
    pub fn is_valid_for(&self, storage: &StorageDescriptor) -> bool {
        self.piece < storage.num_pieces()
            && self.length > 0
            && self.length <= MAX_BLOCK_LENGTH
            && self
                .offset
                .checked_add(self.length)
                .is_some_and(|end| end <= storage.piece_length(self.piece))
    }
}

/// Piece geometry of a torrent. The total length grows over time in
/// elastic mode; the last piece may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub piece_size: u32,
    pub total_length: u64,
}

impl StorageDescriptor {
    pub fn new(piece_size: u32, total_length: u64) -> Self {
        Self {
            piece_size,
            total_length,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.total_length.div_ceil(self.piece_size as u64) as u32
    }

    pub fn piece_length(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_size as u64;
        let end = std::cmp::min(start + self.piece_size as u64, self.total_length);
        end.saturating_sub(start) as u32
    }

    /// Grow the view. Never shrinks.
    pub fn grow_to(&mut self, total_length: u64) {
        if total_length > self.total_length {
            self.total_length = total_length;
        }
    }
}

/// Content mode negotiated for a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Flat SHA-1 piece hash list
    Classic,
    /// Pieces carry hash chains to a merkle root
    Merkle,
    /// Signed growing views with per-block hash chains
    Elastic,
}

/// Signed attestation of a torrent's valid prefix length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSignature {
    pub view_length: u64,
    pub root_hash: [u8; 20],
    pub signature: Bytes,
}

impl ViewSignature {
    pub fn new(view_length: u64, root_hash: [u8; 20], signature: Bytes) -> Self {
        Self {
            view_length,
            root_hash,
            signature,
        }
    }
}

/// Sibling hashes proving a block under a view root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChain(pub Vec<[u8; 20]>);

impl HashChain {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            bytes.len() % 20 == 0,
            "hash chain length {} is not a multiple of 20",
            bytes.len()
        );
        let hashes = bytes
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().unwrap())
            .collect();
        Ok(Self(hashes))
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.concat()
    }

    pub fn byte_len(&self) -> usize {
        self.0.len() * 20
    }
}

/// Derive the allowed-fast piece set for a peer (BEP 6).
///
/// The low byte of the IPv4 address is zeroed, hashed together with the
/// info hash, and the digest is re-hashed in a chain. Each digest
/// contributes five big-endian words, each taken modulo the piece count,
/// until enough distinct indices are collected. IPv6 peers get no set.
pub fn allowed_fast_set(addr: &SocketAddr, info_hash: &InfoHash, num_pieces: u32) -> Vec<u32> {
    let SocketAddr::V4(v4) = addr else {
        return Vec::new();
    };
    if num_pieces == 0 {
        return Vec::new();
    }
    let wanted = std::cmp::min(ALLOWED_FAST_SET_SIZE, num_pieces as usize);

    let mut octets = v4.ip().octets();
    octets[3] = 0;
    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&octets);
    seed.extend_from_slice(&info_hash.0);

    let mut set = Vec::with_capacity(wanted);
    let mut digest: [u8; 20] = Sha1::digest(&seed).into();
    loop {
        for word in digest.chunks_exact(4) {
            if set.len() >= wanted {
                return set;
            }
            let index = u32::from_be_bytes(word.try_into().unwrap()) % num_pieces;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        digest = Sha1::digest(digest).into();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use super::{allowed_fast_set, Block, InfoHash, StorageDescriptor};
    use crate::MAX_BLOCK_LENGTH;

    #[test]
    fn piece_geometry() {
        let storage = StorageDescriptor::new(32 * 1024, 100 * 1024);
        assert_eq!(storage.num_pieces(), 4);
        assert_eq!(storage.piece_length(0), 32 * 1024);
        assert_eq!(storage.piece_length(2), 32 * 1024);
        assert_eq!(storage.piece_length(3), 4 * 1024);
        let even = StorageDescriptor::new(16 * 1024, 64 * 1024);
        assert_eq!(even.num_pieces(), 4);
        assert_eq!(even.piece_length(3), 16 * 1024);
    }

    #[test]
    fn block_validation() {
        let storage = StorageDescriptor::new(32 * 1024, 100 * 1024);
        assert!(Block::new(0, 0, MAX_BLOCK_LENGTH).is_valid_for(&storage));
        assert!(Block::new(3, 0, 4 * 1024).is_valid_for(&storage));
        // zero length
        assert!(!Block::new(0, 0, 0).is_valid_for(&storage));
        // oversized block
        assert!(!Block::new(0, 0, MAX_BLOCK_LENGTH + 1).is_valid_for(&storage));
        // past piece end
        assert!(!Block::new(3, 4 * 1024 - 10, 16).is_valid_for(&storage));
        // piece does not exist
        assert!(!Block::new(4, 0, 16).is_valid_for(&storage));
        // offset overflow must not wrap
        assert!(!Block::new(0, u32::MAX, 16).is_valid_for(&storage));
    }

    #[test]
    fn allowed_fast_reference_vector() {
        // reference example from BEP 6
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200)), 6881);
        let info_hash = InfoHash([0xAA; 20]);
        let set = allowed_fast_set(&addr, &info_hash, 1313);
        assert_eq!(set, [1059, 431, 808, 1217, 287, 376, 1188]);
    }

    #[test]
    fn allowed_fast_ipv6_gets_none() {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881);
        assert!(allowed_fast_set(&addr, &InfoHash([0xAA; 20]), 1313).is_empty());
    }

    #[test]
    fn allowed_fast_small_torrent() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200)), 6881);
        let set = allowed_fast_set(&addr, &InfoHash([0xAA; 20]), 3);
        assert_eq!(set.len(), 3);
        assert!(set.iter().all(|piece| *piece < 3));
    }
}
