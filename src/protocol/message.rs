use std::fmt::Display;

use anyhow::{ensure, Context};
use bytes::{BufMut, Bytes, BytesMut};

use super::{extension::ExtensionHandshake, Block, HashChain, InfoHash, ViewSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn my_id() -> Self {
        let mut id: [u8; 20] = rand::random();
        id[..8].copy_from_slice(b"-PW0100-");
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone)]
pub struct HandShake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
// reserved[5] bit 4
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
// reserved[7] bit 2
const FAST_BIT: u8 = 0x04;

impl HandShake {
    pub const SIZE: usize = 68;
    /// Everything before the trailing peer id
    pub const PREFIX_SIZE: usize = 48;

    pub fn new(info_hash: InfoHash, peer_id: PeerId, fast: bool, extensions: bool) -> Self {
        let mut reserved = [0_u8; 8];
        if extensions {
            reserved[5] |= EXTENSION_PROTOCOL_BIT;
        }
        if fast {
            reserved[7] |= FAST_BIT;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_BIT != 0
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(bytes.len() == Self::SIZE, "handshake must be 68 bytes");
        ensure!(bytes[0] == 19, "bad protocol string length");
        ensure!(&bytes[1..20] == PROTOCOL_STRING, "bad protocol string");

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        reserved.copy_from_slice(&bytes[20..28]);
        info_hash.copy_from_slice(&bytes[28..48]);
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        })
    }

    pub fn as_bytes(&self) -> [u8; 68] {
        let mut out = [0_u8; 68];
        out[0] = 19;
        out[1..20].copy_from_slice(PROTOCOL_STRING);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash.0);
        out[48..68].copy_from_slice(&self.peer_id.0);
        out
    }
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const SUGGEST_PIECE: u8 = 13;
const HAVE_ALL: u8 = 14;
const HAVE_NONE: u8 = 15;
const REJECT_REQUEST: u8 = 16;
const ALLOWED_FAST: u8 = 17;
const EXTENSION: u8 = 20;
const MERKLE_PIECE: u8 = 21;
const ELASTIC_SIGNATURE: u8 = 22;
const ELASTIC_PIECE: u8 = 23;
const ELASTIC_BITFIELD: u8 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        payload: Bytes,
    },
    Request(Block),
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel(Block),
    SuggestPiece {
        index: u32,
    },
    HaveAll,
    HaveNone,
    RejectRequest(Block),
    AllowedFast {
        index: u32,
    },
    ExtensionHandshake {
        payload: ExtensionHandshake,
    },
    Extension {
        extension_id: u8,
        payload: Bytes,
    },
    MerklePiece {
        index: u32,
        begin: u32,
        chain: HashChain,
        block: Bytes,
    },
    ElasticSignature(ViewSignature),
    ElasticPiece {
        index: u32,
        begin: u32,
        view_length: u64,
        chain: Option<HashChain>,
        block: Bytes,
    },
    ElasticBitfield {
        payload: Bytes,
    },
    Unknown {
        id: u8,
    },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {}", index),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.len())
            }
            PeerMessage::Request(block) => write!(f, "Request for {block}"),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel(block) => write!(f, "Cancel for {block}"),
            PeerMessage::SuggestPiece { index } => write!(f, "Suggest for piece {index}"),
            PeerMessage::HaveAll => write!(f, "HaveAll"),
            PeerMessage::HaveNone => write!(f, "HaveNone"),
            PeerMessage::RejectRequest(block) => write!(f, "Reject for {block}"),
            PeerMessage::AllowedFast { index } => write!(f, "AllowedFast for piece {index}"),
            PeerMessage::ExtensionHandshake { .. } => write!(f, "Extension handshake"),
            PeerMessage::Extension { extension_id, .. } => {
                write!(f, "Extension message with id {extension_id}")
            }
            PeerMessage::MerklePiece {
                index,
                begin,
                chain,
                block,
            } => write!(
                f,
                "Merkle block for piece {index} with offset {begin}, {} chain hashes and length {}",
                chain.0.len(),
                block.len()
            ),
            PeerMessage::ElasticSignature(signature) => {
                write!(f, "Elastic signature for view {}", signature.view_length)
            }
            PeerMessage::ElasticPiece {
                index,
                begin,
                view_length,
                block,
                ..
            } => write!(
                f,
                "Elastic block for piece {index} with offset {begin} and length {} under view {view_length}",
                block.len()
            ),
            PeerMessage::ElasticBitfield { payload } => {
                write!(f, "Elastic bitfield with length {}", payload.len())
            }
            PeerMessage::Unknown { id } => write!(f, "Unknown message with id {id}"),
        }
    }
}

fn read_u32(payload: &[u8], at: usize) -> anyhow::Result<u32> {
    let bytes = payload
        .get(at..at + 4)
        .with_context(|| format!("payload too short for u32 at {at}"))?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

fn read_u64(payload: &[u8], at: usize) -> anyhow::Result<u64> {
    let bytes = payload
        .get(at..at + 8)
        .with_context(|| format!("payload too short for u64 at {at}"))?;
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

fn block_payload(payload: &[u8]) -> anyhow::Result<Block> {
    ensure!(payload.len() == 12, "block triple must be 12 bytes");
    Ok(Block {
        piece: read_u32(payload, 0)?,
        offset: read_u32(payload, 4)?,
        length: read_u32(payload, 8)?,
    })
}

impl PeerMessage {
    /// Decode a single frame (without its length prefix). Empty frames
    /// are keepalives. Sizes of fixed-layout messages are enforced.
    pub fn from_frame(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let tag = frame[0];
        let payload = &frame[1..];
        match tag {
            CHOKE | UNCHOKE | INTERESTED | NOT_INTERESTED | HAVE_ALL | HAVE_NONE => {
                ensure!(payload.is_empty(), "message {tag} carries no payload");
                Ok(match tag {
                    CHOKE => PeerMessage::Choke,
                    UNCHOKE => PeerMessage::Unchoke,
                    INTERESTED => PeerMessage::Interested,
                    NOT_INTERESTED => PeerMessage::NotInterested,
                    HAVE_ALL => PeerMessage::HaveAll,
                    _ => PeerMessage::HaveNone,
                })
            }
            HAVE | SUGGEST_PIECE | ALLOWED_FAST => {
                ensure!(payload.len() == 4, "piece index must be 4 bytes");
                let index = read_u32(payload, 0)?;
                Ok(match tag {
                    HAVE => PeerMessage::Have { index },
                    SUGGEST_PIECE => PeerMessage::SuggestPiece { index },
                    _ => PeerMessage::AllowedFast { index },
                })
            }
            BITFIELD => Ok(PeerMessage::Bitfield {
                payload: frame.slice(1..),
            }),
            ELASTIC_BITFIELD => Ok(PeerMessage::ElasticBitfield {
                payload: frame.slice(1..),
            }),
            REQUEST => Ok(PeerMessage::Request(block_payload(payload)?)),
            CANCEL => Ok(PeerMessage::Cancel(block_payload(payload)?)),
            REJECT_REQUEST => Ok(PeerMessage::RejectRequest(block_payload(payload)?)),
            PIECE => {
                ensure!(payload.len() >= 8, "piece payload too short");
                Ok(PeerMessage::Piece {
                    index: read_u32(payload, 0)?,
                    begin: read_u32(payload, 4)?,
                    block: frame.slice(9..),
                })
            }
            EXTENSION => {
                ensure!(!payload.is_empty(), "extension payload too short");
                let extension_id = payload[0];
                if extension_id == 0 {
                    Ok(PeerMessage::ExtensionHandshake {
                        payload: ExtensionHandshake::from_bytes(&payload[1..])
                            .context("parse extension handshake")?,
                    })
                } else {
                    Ok(PeerMessage::Extension {
                        extension_id,
                        payload: frame.slice(2..),
                    })
                }
            }
            MERKLE_PIECE => {
                let index = read_u32(payload, 0)?;
                let begin = read_u32(payload, 4)?;
                let chain_len = read_u32(payload, 8)? as usize;
                let chain_bytes = payload
                    .get(12..12 + chain_len)
                    .context("merkle payload too short for hash chain")?;
                let chain = HashChain::from_bytes(chain_bytes)?;
                Ok(PeerMessage::MerklePiece {
                    index,
                    begin,
                    chain,
                    block: frame.slice(1 + 12 + chain_len..),
                })
            }
            ELASTIC_SIGNATURE => {
                let view_length = read_u64(payload, 0)?;
                let root_hash: [u8; 20] = payload
                    .get(8..28)
                    .context("signature payload too short for root hash")?
                    .try_into()
                    .unwrap();
                Ok(PeerMessage::ElasticSignature(ViewSignature {
                    view_length,
                    root_hash,
                    signature: frame.slice(1 + 28..),
                }))
            }
            ELASTIC_PIECE => {
                let index = read_u32(payload, 0)?;
                let begin = read_u32(payload, 4)?;
                let view_length = read_u64(payload, 8)?;
                let chain_present = *payload.get(16).context("missing chain marker")?;
                ensure!(chain_present <= 1, "bad chain marker {chain_present}");
                let (chain, block_start) = if chain_present == 1 {
                    let chain_len = read_u32(payload, 17)? as usize;
                    let chain_bytes = payload
                        .get(21..21 + chain_len)
                        .context("elastic payload too short for hash chain")?;
                    (Some(HashChain::from_bytes(chain_bytes)?), 1 + 21 + chain_len)
                } else {
                    (None, 1 + 17)
                };
                Ok(PeerMessage::ElasticPiece {
                    index,
                    begin,
                    view_length,
                    chain,
                    block: frame.slice(block_start..),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }

    /// Append the length-prefixed frame for this message
    pub fn write_frame(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => {
                dst.put_u32(1);
                dst.put_u8(CHOKE);
            }
            PeerMessage::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(UNCHOKE);
            }
            PeerMessage::Interested => {
                dst.put_u32(1);
                dst.put_u8(INTERESTED);
            }
            PeerMessage::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(NOT_INTERESTED);
            }
            PeerMessage::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(HAVE_ALL);
            }
            PeerMessage::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(HAVE_NONE);
            }
            PeerMessage::Have { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(HAVE);
                dst.put_u32(*index);
            }
            PeerMessage::SuggestPiece { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(SUGGEST_PIECE);
                dst.put_u32(*index);
            }
            PeerMessage::AllowedFast { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(ALLOWED_FAST);
                dst.put_u32(*index);
            }
            PeerMessage::Bitfield { payload } => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(BITFIELD);
                dst.put_slice(payload);
            }
            PeerMessage::ElasticBitfield { payload } => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(ELASTIC_BITFIELD);
                dst.put_slice(payload);
            }
            PeerMessage::Request(block) => put_block(dst, REQUEST, block),
            PeerMessage::Cancel(block) => put_block(dst, CANCEL, block),
            PeerMessage::RejectRequest(block) => put_block(dst, REJECT_REQUEST, block),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(1 + 4 + 4 + block.len() as u32);
                dst.put_u8(PIECE);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_slice(block);
            }
            PeerMessage::ExtensionHandshake { payload } => {
                let payload = payload.as_bytes();
                dst.put_u32(1 + 1 + payload.len() as u32);
                dst.put_u8(EXTENSION);
                dst.put_u8(0);
                dst.put_slice(&payload);
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => {
                dst.put_u32(1 + 1 + payload.len() as u32);
                dst.put_u8(EXTENSION);
                dst.put_u8(*extension_id);
                dst.put_slice(payload);
            }
            PeerMessage::MerklePiece {
                index,
                begin,
                chain,
                block,
            } => {
                let chain_len = chain.byte_len() as u32;
                dst.put_u32(1 + 4 + 4 + 4 + chain_len + block.len() as u32);
                dst.put_u8(MERKLE_PIECE);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(chain_len);
                dst.put_slice(&chain.as_bytes());
                dst.put_slice(block);
            }
            PeerMessage::ElasticSignature(signature) => {
                dst.put_u32(1 + 8 + 20 + signature.signature.len() as u32);
                dst.put_u8(ELASTIC_SIGNATURE);
                dst.put_u64(signature.view_length);
                dst.put_slice(&signature.root_hash);
                dst.put_slice(&signature.signature);
            }
            PeerMessage::ElasticPiece {
                index,
                begin,
                view_length,
                chain,
                block,
            } => {
                let chain_len = chain.as_ref().map_or(0, |c| 4 + c.byte_len() as u32);
                dst.put_u32(1 + 4 + 4 + 8 + 1 + chain_len + block.len() as u32);
                dst.put_u8(ELASTIC_PIECE);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u64(*view_length);
                match chain {
                    Some(chain) => {
                        dst.put_u8(1);
                        dst.put_u32(chain.byte_len() as u32);
                        dst.put_slice(&chain.as_bytes());
                    }
                    None => dst.put_u8(0),
                }
                dst.put_slice(block);
            }
            PeerMessage::Unknown { id } => {
                dst.put_u32(1);
                dst.put_u8(*id);
            }
        }
    }

}

/// Message ids that may only open the stream
pub(crate) fn is_availability_opener(id: u8) -> bool {
    matches!(id, BITFIELD | HAVE_ALL | HAVE_NONE | ELASTIC_BITFIELD)
}

pub(crate) fn requires_fast(id: u8) -> bool {
    matches!(
        id,
        SUGGEST_PIECE | HAVE_ALL | HAVE_NONE | REJECT_REQUEST | ALLOWED_FAST
    )
}

pub(crate) fn requires_extension_protocol(id: u8) -> bool {
    id == EXTENSION
}

pub(crate) fn requires_merkle(id: u8) -> bool {
    id == MERKLE_PIECE
}

pub(crate) fn requires_elastic(id: u8) -> bool {
    matches!(id, ELASTIC_SIGNATURE | ELASTIC_PIECE | ELASTIC_BITFIELD)
}

fn put_block(dst: &mut BytesMut, tag: u8, block: &Block) {
    dst.put_u32(1 + 4 + 4 + 4);
    dst.put_u8(tag);
    dst.put_u32(block.piece);
    dst.put_u32(block.offset);
    dst.put_u32(block.length);
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{HandShake, PeerId, PeerMessage};
    use crate::protocol::{
        extension::ExtensionHandshake, Block, HashChain, InfoHash, ViewSignature,
    };

    fn re_encode(msg: PeerMessage) {
        let mut framed = BytesMut::new();
        msg.write_frame(&mut framed);
        let length = u32::from_be_bytes(framed[..4].try_into().unwrap()) as usize;
        assert_eq!(framed.len(), 4 + length);
        let decoded = PeerMessage::from_frame(framed.freeze().slice(4..)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn frame_round_trips() {
        re_encode(PeerMessage::KeepAlive);
        re_encode(PeerMessage::Choke);
        re_encode(PeerMessage::Unchoke);
        re_encode(PeerMessage::Interested);
        re_encode(PeerMessage::NotInterested);
        re_encode(PeerMessage::Have { index: 123 });
        re_encode(PeerMessage::Bitfield {
            payload: Bytes::from_static(&[0b1010_0000, 0b0000_0001]),
        });
        re_encode(PeerMessage::Request(Block::new(22, 100, 200)));
        re_encode(PeerMessage::Piece {
            index: 22,
            begin: 100,
            block: Bytes::from_static(&[23, 222, 32]),
        });
        re_encode(PeerMessage::Cancel(Block::new(22, 100, 200)));
        re_encode(PeerMessage::ExtensionHandshake {
            payload: ExtensionHandshake::default(),
        });
        re_encode(PeerMessage::Extension {
            extension_id: 1,
            payload: Bytes::from_static(&[22, 222, 32]),
        });
    }

    #[test]
    fn fast_frame_round_trips() {
        re_encode(PeerMessage::SuggestPiece { index: 9 });
        re_encode(PeerMessage::HaveAll);
        re_encode(PeerMessage::HaveNone);
        re_encode(PeerMessage::RejectRequest(Block::new(5, 0, 16384)));
        re_encode(PeerMessage::AllowedFast { index: 1059 });
    }

    #[test]
    fn content_mode_frame_round_trips() {
        re_encode(PeerMessage::MerklePiece {
            index: 3,
            begin: 16384,
            chain: HashChain(vec![[1; 20], [2; 20]]),
            block: Bytes::from_static(&[9, 9, 9]),
        });
        re_encode(PeerMessage::ElasticSignature(ViewSignature::new(
            14 * 16384,
            [7; 20],
            Bytes::from_static(&[1, 2, 3, 4]),
        )));
        re_encode(PeerMessage::ElasticPiece {
            index: 11,
            begin: 0,
            view_length: 14 * 16384,
            chain: Some(HashChain(vec![[3; 20]])),
            block: Bytes::from_static(&[8, 8]),
        });
        re_encode(PeerMessage::ElasticPiece {
            index: 11,
            begin: 16384,
            view_length: 14 * 16384,
            chain: None,
            block: Bytes::from_static(&[8, 8]),
        });
        re_encode(PeerMessage::ElasticBitfield {
            payload: Bytes::from_static(&[0xFF, 0x0F]),
        });
    }

    #[test]
    fn truncated_frames_error() {
        // have with a short index
        assert!(PeerMessage::from_frame(Bytes::from_static(&[4, 0, 0])).is_err());
        // request with a truncated triple
        assert!(PeerMessage::from_frame(Bytes::from_static(&[6, 0, 0, 0, 1, 0])).is_err());
        // choke with a stray payload byte
        assert!(PeerMessage::from_frame(Bytes::from_static(&[0, 1])).is_err());
        // merkle chain length pointing past the frame
        assert!(PeerMessage::from_frame(Bytes::from_static(&[
            21, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 40, 1, 2
        ]))
        .is_err());
    }

    #[test]
    fn unknown_ids_decode_as_unknown() {
        let msg = PeerMessage::from_frame(Bytes::from_static(&[9, 1, 2, 3])).unwrap();
        assert_eq!(msg, PeerMessage::Unknown { id: 9 });
    }

    #[test]
    fn handshake_round_trip() {
        let handshake = HandShake::new(InfoHash([0xAA; 20]), PeerId::my_id(), true, true);
        assert!(handshake.supports_fast());
        assert!(handshake.supports_extensions());
        let bytes = handshake.as_bytes();
        let parsed = HandShake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.info_hash, handshake.info_hash);
        assert_eq!(parsed.peer_id.0, handshake.peer_id.0);
        assert!(parsed.supports_fast());
        assert!(parsed.supports_extensions());

        let plain = HandShake::new(InfoHash([0xAA; 20]), PeerId::my_id(), false, false);
        assert!(!plain.supports_fast());
        assert!(!plain.supports_extensions());
    }
}
