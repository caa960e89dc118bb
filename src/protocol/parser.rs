use anyhow::anyhow;
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::message::{
    is_availability_opener, requires_elastic, requires_extension_protocol, requires_fast,
    requires_merkle, HandShake, PeerId, PeerMessage,
};
use super::{ContentMode, InfoHash};

/// Typed event produced by the parser, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// The fixed handshake prefix: reserved capability bits and the
    /// info hash. Arrives before the peer id so an accepting side can
    /// bind the torrent mid-handshake.
    Handshake {
        fast: bool,
        extension_protocol: bool,
        info_hash: InfoHash,
    },
    PeerId(PeerId),
    Message(PeerMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHandshake,
    AwaitingPeerId,
    Framing,
}

/// Incremental wire parser.
///
/// Consumes opaque byte chunks and yields one [`WireEvent`] per
/// completed handshake stage or message frame. Message ids the
/// negotiated capabilities forbid are framing errors, as are
/// availability openers (bitfield, have-all, have-none,
/// elastic-bitfield) arriving after the stream's opening run. Any error
/// poisons the parser; no further events follow.
#[derive(Debug)]
pub struct WireParser {
    phase: Phase,
    fast_enabled: bool,
    extensions_enabled: bool,
    merkle_enabled: bool,
    elastic_enabled: bool,
    /// Availability openers are only legal while the stream has seen
    /// nothing but keepalives, extension handshakes, elastic signatures
    /// and other openers.
    opening: bool,
    poisoned: bool,
    consumed: u64,
    max_message_length: usize,
}

impl WireParser {
    pub fn new(max_message_length: usize) -> Self {
        Self {
            phase: Phase::AwaitingHandshake,
            fast_enabled: false,
            extensions_enabled: false,
            merkle_enabled: false,
            elastic_enabled: false,
            opening: true,
            poisoned: false,
            consumed: 0,
            max_message_length,
        }
    }

    /// Apply the negotiated capability bits. Until this is called every
    /// extension message is rejected.
    pub fn set_capabilities(&mut self, fast: bool, extension_protocol: bool) {
        self.fast_enabled = fast;
        self.extensions_enabled = extension_protocol;
    }

    pub fn set_content_mode(&mut self, mode: ContentMode) {
        self.merkle_enabled = mode == ContentMode::Merkle;
        self.elastic_enabled = mode == ContentMode::Elastic;
    }

    /// Wire bytes consumed since the last call, malformed frames
    /// included
    pub fn take_consumed(&mut self) -> u64 {
        std::mem::take(&mut self.consumed)
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.poisoned = true;
        err
    }

    fn check_permitted(&self, id: u8) -> anyhow::Result<()> {
        if requires_fast(id) && !self.fast_enabled {
            return Err(anyhow!("message {id} requires the fast extension"));
        }
        if requires_extension_protocol(id) && !self.extensions_enabled {
            return Err(anyhow!("message {id} requires the extension protocol"));
        }
        if requires_merkle(id) && !self.merkle_enabled {
            return Err(anyhow!("message {id} requires merkle content"));
        }
        if requires_elastic(id) && !self.elastic_enabled {
            return Err(anyhow!("message {id} requires elastic content"));
        }
        if is_availability_opener(id) && !self.opening {
            return Err(anyhow!("message {id} may only open the stream"));
        }
        Ok(())
    }
}

impl Decoder for WireParser {
    type Item = WireEvent;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.poisoned {
            return Ok(None);
        }
        match self.phase {
            Phase::AwaitingHandshake => {
                // fail fast on a wrong protocol string byte
                if !src.is_empty() && src[0] != 19 {
                    return Err(self.fail(anyhow!("bad protocol string length {}", src[0])));
                }
                if src.len() < HandShake::PREFIX_SIZE {
                    return Ok(None);
                }
                if &src[1..20] != b"BitTorrent protocol" {
                    return Err(self.fail(anyhow!("bad protocol string")));
                }
                let reserved = &src[20..28];
                let fast = reserved[7] & 0x04 != 0;
                let extension_protocol = reserved[5] & 0x10 != 0;
                let info_hash = InfoHash(src[28..48].try_into().unwrap());
                src.advance(HandShake::PREFIX_SIZE);
                self.consumed += HandShake::PREFIX_SIZE as u64;
                self.phase = Phase::AwaitingPeerId;
                Ok(Some(WireEvent::Handshake {
                    fast,
                    extension_protocol,
                    info_hash,
                }))
            }
            Phase::AwaitingPeerId => {
                if src.len() < 20 {
                    return Ok(None);
                }
                let peer_id = PeerId(src[..20].try_into().unwrap());
                src.advance(20);
                self.consumed += 20;
                self.phase = Phase::Framing;
                Ok(Some(WireEvent::PeerId(peer_id)))
            }
            Phase::Framing => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
                if length == 0 {
                    src.advance(4);
                    self.consumed += 4;
                    return Ok(Some(WireEvent::Message(PeerMessage::KeepAlive)));
                }
                if length > self.max_message_length {
                    return Err(self.fail(anyhow!(
                        "length({}) is higher than allowed({})",
                        length,
                        self.max_message_length
                    )));
                }
                if src.len() < 4 + length {
                    src.reserve(4 + length - src.len());
                    return Ok(None);
                }

                let mut frame = src.split_to(4 + length);
                frame.advance(4);
                self.consumed += (4 + length) as u64;

                let id = frame[0];
                if let Err(e) = self.check_permitted(id) {
                    return Err(self.fail(e));
                }
                let message = match PeerMessage::from_frame(frame.freeze()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        return Err(self.fail(anyhow!("failed to construct peer message: {e}")))
                    }
                };
                match &message {
                    PeerMessage::KeepAlive
                    | PeerMessage::ExtensionHandshake { .. }
                    | PeerMessage::ElasticSignature(_)
                    | PeerMessage::Bitfield { .. }
                    | PeerMessage::HaveAll
                    | PeerMessage::HaveNone
                    | PeerMessage::ElasticBitfield { .. }
                    | PeerMessage::Unknown { .. } => {}
                    _ => self.opening = false,
                }
                Ok(Some(WireEvent::Message(message)))
            }
        }
    }
}
