use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use anyhow::Context;
use bytes::{Buf, BytesMut};

use crate::{
    conn::Transport,
    coordinator::PieceDatabase,
    counters::ConnectionCounters,
    protocol::{
        message::{HandShake, PeerMessage},
        Block, ContentMode,
    },
};

// Emission classes, in drain priority order. FIFO within a class.
const CLASS_HANDSHAKE: usize = 0;
const CLASS_CHOKE: usize = 1;
const CLASS_INTERESTED: usize = 2;
const CLASS_HAVE: usize = 3;
const CLASS_AVAILABILITY: usize = 4;
const CLASS_ALLOWED_FAST: usize = 5;
const CLASS_REJECT: usize = 6;
const CLASS_CANCEL: usize = 7;
const CLASS_REQUEST: usize = 8;
const CLASS_PIECE: usize = 9;
const CLASS_EXTENSION: usize = 10;
const CLASS_KEEPALIVE: usize = 11;
const CLASS_COUNT: usize = 12;

#[derive(Debug)]
enum Outbound {
    Handshake(Box<HandShake>),
    Message(PeerMessage),
    /// Block upload; payload is read from the piece database when the
    /// frame is serialised
    PieceData(Block),
}

/// Buffered, prioritised outbound side of a connection.
///
/// Messages are queued typed and encoded lazily on drain, which is what
/// makes the cancel/reject arbitrations cheap: an unsent request or
/// piece is simply pulled back out of its class queue. The queue also
/// owns the request bookkeeping (what we asked for and still expect an
/// answer to) and both allowed-fast sets.
pub struct OutboundQueue {
    classes: [VecDeque<Outbound>; CLASS_COUNT],
    /// Encoded bytes not yet accepted by the transport
    wire: BytesMut,
    /// Requests we committed to, queued or on the wire, that are still
    /// unanswered
    outstanding: VecDeque<Block>,
    requests_plugged: bool,
    fast_ext: bool,
    mode: ContentMode,
    /// Pieces the remote granted us while it chokes
    remote_allowed_fast: HashSet<u32>,
    /// Pieces we granted the remote
    local_allowed_fast: HashSet<u32>,
    db: Arc<dyn PieceDatabase>,
    counters: ConnectionCounters,
    request_pipeline: usize,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("queued", &self.classes.iter().map(|c| c.len()).sum::<usize>())
            .field("wire", &self.wire.len())
            .field("outstanding", &self.outstanding.len())
            .field("requests_plugged", &self.requests_plugged)
            .field("fast_ext", &self.fast_ext)
            .field("mode", &self.mode)
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(
        db: Arc<dyn PieceDatabase>,
        counters: ConnectionCounters,
        mode: ContentMode,
        request_pipeline: usize,
    ) -> Self {
        Self {
            classes: std::array::from_fn(|_| VecDeque::new()),
            wire: BytesMut::new(),
            outstanding: VecDeque::new(),
            requests_plugged: false,
            fast_ext: false,
            mode,
            remote_allowed_fast: HashSet::new(),
            local_allowed_fast: HashSet::new(),
            db,
            counters,
            request_pipeline,
        }
    }

    /// Fast extension changes cancel/reject arbitration; set once the
    /// handshake capabilities are negotiated.
    pub fn set_fast_extension(&mut self, fast: bool) {
        self.fast_ext = fast;
    }

    pub fn send_handshake(&mut self, handshake: HandShake) {
        self.classes[CLASS_HANDSHAKE].push_back(Outbound::Handshake(Box::new(handshake)));
    }

    pub fn send_keepalive(&mut self) {
        self.classes[CLASS_KEEPALIVE].push_back(Outbound::Message(PeerMessage::KeepAlive));
    }

    /// Queue a choke/unchoke. Choking drops every not-yet-sent block
    /// upload; the dropped descriptors are returned so the engine can
    /// reject them explicitly under the fast extension.
    pub fn send_choke(&mut self, we_choking: bool) -> Vec<Block> {
        let message = if we_choking {
            PeerMessage::Choke
        } else {
            PeerMessage::Unchoke
        };
        self.classes[CLASS_CHOKE].push_back(Outbound::Message(message));
        let mut dropped = Vec::new();
        if we_choking {
            while let Some(entry) = self.classes[CLASS_PIECE].pop_front() {
                if let Outbound::PieceData(block) = entry {
                    dropped.push(block);
                }
            }
        }
        dropped
    }

    /// Queue interested/not-interested. A still-unsent message of the
    /// opposite polarity is collapsed instead: the net change is zero,
    /// so nothing reaches the wire.
    pub fn send_interested(&mut self, interested: bool) {
        let opposite = if interested {
            PeerMessage::NotInterested
        } else {
            PeerMessage::Interested
        };
        let class = &mut self.classes[CLASS_INTERESTED];
        if let Some(at) = class
            .iter()
            .position(|entry| matches!(entry, Outbound::Message(msg) if *msg == opposite))
        {
            class.remove(at);
            return;
        }
        let message = if interested {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        };
        class.push_back(Outbound::Message(message));
    }

    pub fn send_have(&mut self, piece: u32) {
        self.classes[CLASS_HAVE].push_back(Outbound::Message(PeerMessage::Have { index: piece }));
    }

    /// Bitfield, have-all, have-none, elastic bitfield and elastic
    /// signatures all share the availability slot right after the
    /// choke/interest traffic.
    pub fn send_availability(&mut self, message: PeerMessage) {
        self.classes[CLASS_AVAILABILITY].push_back(Outbound::Message(message));
    }

    /// Record and announce an allowed-fast grant to the remote
    pub fn grant_allowed_fast(&mut self, piece: u32) {
        if self.local_allowed_fast.insert(piece) {
            self.classes[CLASS_ALLOWED_FAST]
                .push_back(Outbound::Message(PeerMessage::AllowedFast { index: piece }));
        }
    }

    /// Is the remote allowed to request this piece while choked?
    pub fn is_piece_allowed_fast(&self, piece: u32) -> bool {
        self.local_allowed_fast.contains(&piece)
    }

    /// Drop every grant we made; the remote no longer needs them
    pub fn clear_allowed_fast_pieces(&mut self) {
        self.local_allowed_fast.clear();
    }

    /// The remote granted us this piece for requesting while choked
    pub fn set_request_allowed_fast(&mut self, piece: u32) {
        self.remote_allowed_fast.insert(piece);
    }

    pub fn is_request_allowed_fast(&self, piece: u32) -> bool {
        self.remote_allowed_fast.contains(&piece)
    }

    /// Queue block requests and track them as outstanding
    pub fn send_requests(&mut self, blocks: Vec<Block>) {
        for block in blocks {
            if self.outstanding.contains(&block) {
                continue;
            }
            self.outstanding.push_back(block);
            self.classes[CLASS_REQUEST].push_back(Outbound::Message(PeerMessage::Request(block)));
        }
    }

    /// Cancel one of our requests. A request that never reached the
    /// wire is removed silently; otherwise a cancel frame is queued.
    /// With `keep_tracking` (fast extension) the request stays
    /// outstanding until the remote answers with a piece or a reject.
    pub fn send_cancel(&mut self, block: Block, keep_tracking: bool) {
        if self.remove_queued_request(block) {
            self.remove_outstanding(block);
            return;
        }
        self.classes[CLASS_CANCEL].push_back(Outbound::Message(PeerMessage::Cancel(block)));
        if !keep_tracking {
            self.remove_outstanding(block);
        }
    }

    /// Queue a block upload. The wire form follows the content mode.
    pub fn send_piece(&mut self, block: Block) {
        self.classes[CLASS_PIECE].push_back(Outbound::PieceData(block));
    }

    /// Remove a not-yet-sent upload. True iff something was removed.
    pub fn discard_piece(&mut self, block: Block) -> bool {
        let class = &mut self.classes[CLASS_PIECE];
        if let Some(at) = class
            .iter()
            .position(|entry| matches!(entry, Outbound::PieceData(queued) if *queued == block))
        {
            class.remove(at);
            return true;
        }
        false
    }

    /// Drop every queued upload for a piece, rejecting each under the
    /// fast extension
    pub fn reject_piece_messages(&mut self, piece: u32) {
        let class = &mut self.classes[CLASS_PIECE];
        let mut dropped = Vec::new();
        class.retain(|entry| match entry {
            Outbound::PieceData(block) if block.piece == piece => {
                dropped.push(*block);
                false
            }
            _ => true,
        });
        if self.fast_ext {
            for block in dropped {
                self.send_reject(block);
            }
        }
    }

    pub fn send_reject(&mut self, block: Block) {
        self.classes[CLASS_REJECT].push_back(Outbound::Message(PeerMessage::RejectRequest(block)));
    }

    /// While plugged, queued requests stay queued instead of being
    /// serialised to the wire
    pub fn set_requests_plugged(&mut self, plugged: bool) {
        self.requests_plugged = plugged;
    }

    /// Put every outstanding request that is already on the wire back
    /// at the front of the queue. Used when the remote chokes us
    /// without the fast extension, which implicitly cancels them.
    pub fn requeue_all_requests(&mut self) {
        let queued: Vec<Block> = self.classes[CLASS_REQUEST]
            .iter()
            .filter_map(|entry| match entry {
                Outbound::Message(PeerMessage::Request(block)) => Some(*block),
                _ => None,
            })
            .collect();
        let on_wire: Vec<Block> = self
            .outstanding
            .iter()
            .filter(|block| !queued.contains(block))
            .copied()
            .collect();
        for block in on_wire.into_iter().rev() {
            self.classes[CLASS_REQUEST].push_front(Outbound::Message(PeerMessage::Request(block)));
        }
    }

    /// A block arrived for one of our requests. True iff the request
    /// was outstanding.
    pub fn request_received(&mut self, block: Block) -> bool {
        self.remove_outstanding(block)
    }

    /// The remote rejected one of our requests. False if nothing
    /// matched, which the engine treats as a protocol violation.
    pub fn reject_received(&mut self, block: Block) -> bool {
        // a reject also voids the queued copy of a requeued request
        self.remove_queued_request(block);
        self.remove_outstanding(block)
    }

    /// How many more requests the pipeline can take
    pub fn requests_needed(&self) -> usize {
        self.request_pipeline.saturating_sub(self.outstanding.len())
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn unsent_piece_count(&self) -> usize {
        self.classes[CLASS_PIECE].len()
    }

    pub fn send_extension_handshake(&mut self, handshake: crate::ExtensionHandshake) {
        self.classes[CLASS_EXTENSION].push_back(Outbound::Message(
            PeerMessage::ExtensionHandshake { payload: handshake },
        ));
    }

    pub fn send_extension(&mut self, extension_id: u8, payload: bytes::Bytes) {
        self.classes[CLASS_EXTENSION].push_back(Outbound::Message(PeerMessage::Extension {
            extension_id,
            payload,
        }));
    }

    /// Anything left to push to the wire right now?
    pub fn has_pending_data(&self) -> bool {
        if !self.wire.is_empty() {
            return true;
        }
        self.classes.iter().enumerate().any(|(class, queue)| {
            if class == CLASS_REQUEST && self.requests_plugged {
                return false;
            }
            !queue.is_empty()
        })
    }

    /// Drain as many serialised bytes as the transport accepts.
    /// Returns the byte count written.
    pub fn send_data(&mut self, transport: &mut dyn Transport) -> anyhow::Result<usize> {
        let mut written_total = 0;
        loop {
            if self.wire.is_empty() {
                let Some(entry) = self.pop_next() else { break };
                self.encode(entry)?;
            }
            match transport.write(&self.wire) {
                Ok(0) => {
                    self.counters.protocol_upload.add(written_total as u64);
                    anyhow::bail!("connection no longer accepts writes");
                }
                Ok(n) => {
                    self.wire.advance(n);
                    written_total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.counters.protocol_upload.add(written_total as u64);
                    return Err(e).context("write to peer");
                }
            }
        }
        self.counters.protocol_upload.add(written_total as u64);
        Ok(written_total)
    }

    fn pop_next(&mut self) -> Option<Outbound> {
        for class in 0..CLASS_COUNT {
            if class == CLASS_REQUEST && self.requests_plugged {
                continue;
            }
            if let Some(entry) = self.classes[class].pop_front() {
                return Some(entry);
            }
        }
        None
    }

    fn encode(&mut self, entry: Outbound) -> anyhow::Result<()> {
        match entry {
            Outbound::Handshake(handshake) => {
                self.wire.extend_from_slice(&handshake.as_bytes());
            }
            Outbound::Message(message) => {
                tracing::trace!("Sending {message} message");
                message.write_frame(&mut self.wire);
            }
            Outbound::PieceData(block) => {
                let data = self
                    .db
                    .read_block(block)
                    .with_context(|| format!("read {block} for upload"))?;
                anyhow::ensure!(
                    data.len() == block.length as usize,
                    "database returned {} bytes for {block}",
                    data.len()
                );
                let message = match self.mode {
                    ContentMode::Classic => PeerMessage::Piece {
                        index: block.piece,
                        begin: block.offset,
                        block: data,
                    },
                    ContentMode::Merkle => {
                        let chain = self
                            .db
                            .hash_chain(block)
                            .with_context(|| format!("hash chain for {block}"))?;
                        PeerMessage::MerklePiece {
                            index: block.piece,
                            begin: block.offset,
                            chain,
                            block: data,
                        }
                    }
                    ContentMode::Elastic => {
                        let view = self
                            .db
                            .current_view()
                            .context("elastic upload without a signed view")?;
                        PeerMessage::ElasticPiece {
                            index: block.piece,
                            begin: block.offset,
                            view_length: view.view_length,
                            chain: self.db.hash_chain(block),
                            block: data,
                        }
                    }
                };
                tracing::trace!("Sending {message} message");
                message.write_frame(&mut self.wire);
                self.counters.block_upload.add(block.length as u64);
            }
        }
        Ok(())
    }

    fn remove_queued_request(&mut self, block: Block) -> bool {
        let class = &mut self.classes[CLASS_REQUEST];
        if let Some(at) = class.iter().position(
            |entry| matches!(entry, Outbound::Message(PeerMessage::Request(queued)) if *queued == block),
        ) {
            class.remove(at);
            return true;
        }
        false
    }

    fn remove_outstanding(&mut self, block: Block) -> bool {
        if let Some(at) = self.outstanding.iter().position(|queued| *queued == block) {
            self.outstanding.remove(at);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Buf;

    use super::OutboundQueue;
    use crate::{
        conn::testing::Pipe,
        coordinator::testing::TestDb,
        counters::ConnectionCounters,
        protocol::{
            message::{HandShake, PeerId, PeerMessage},
            Block, ContentMode, InfoHash,
        },
    };

    fn classic_queue() -> OutboundQueue {
        let db = Arc::new(TestDb::classic(32 * 1024, 4 * 32 * 1024, &[0, 1, 2, 3]));
        OutboundQueue::new(db, ConnectionCounters::detached(), ContentMode::Classic, 16)
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<PeerMessage> {
        let mut pipe = Pipe::default();
        queue.send_data(&mut pipe).unwrap();
        let mut out = pipe.take_outgoing();
        let mut messages = Vec::new();
        while out.len() >= 4 {
            let length = u32::from_be_bytes(out[..4].try_into().unwrap()) as usize;
            let mut frame = out.split_to(4 + length);
            frame.advance(4);
            messages.push(PeerMessage::from_frame(frame.freeze()).unwrap());
        }
        assert!(out.is_empty());
        messages
    }

    fn block(piece: u32, offset: u32) -> Block {
        Block::new(piece, offset, 16 * 1024)
    }

    #[test]
    fn drains_in_priority_order() {
        let mut queue = classic_queue();
        queue.send_keepalive();
        queue.send_piece(block(1, 0));
        queue.send_requests(vec![block(2, 0)]);
        queue.send_have(7);
        queue.send_interested(true);
        queue.send_choke(false);
        let messages = drain(&mut queue);
        assert_eq!(
            messages,
            [
                PeerMessage::Unchoke,
                PeerMessage::Interested,
                PeerMessage::Have { index: 7 },
                PeerMessage::Request(block(2, 0)),
                PeerMessage::Piece {
                    index: 1,
                    begin: 0,
                    block: bytes::Bytes::from(vec![0xAB; 16 * 1024]),
                },
                PeerMessage::KeepAlive,
            ]
        );
    }

    #[test]
    fn handshake_always_first() {
        let mut queue = classic_queue();
        queue.send_interested(true);
        let handshake = HandShake::new(InfoHash([1; 20]), PeerId::my_id(), true, true);
        let raw = handshake.as_bytes();
        queue.send_handshake(handshake);
        let mut pipe = Pipe::default();
        queue.send_data(&mut pipe).unwrap();
        let out = pipe.take_outgoing();
        assert_eq!(&out[..HandShake::SIZE], &raw[..]);
    }

    #[test]
    fn cancel_before_send_collapses() {
        let mut queue = classic_queue();
        let b = Block::new(5, 0, 16384);
        queue.send_requests(vec![b]);
        queue.send_cancel(b, false);
        assert!(!queue.has_outstanding_requests());
        assert!(drain(&mut queue).is_empty());
    }

    #[test]
    fn cancel_after_send_emits_cancel() {
        let mut queue = classic_queue();
        let b = block(1, 0);
        queue.send_requests(vec![b]);
        assert_eq!(drain(&mut queue), [PeerMessage::Request(b)]);
        // without tracking the request is forgotten
        queue.send_cancel(b, false);
        assert!(!queue.has_outstanding_requests());
        assert_eq!(drain(&mut queue), [PeerMessage::Cancel(b)]);

        // with tracking it stays outstanding awaiting piece or reject
        let b2 = block(2, 0);
        queue.send_requests(vec![b2]);
        drain(&mut queue);
        queue.send_cancel(b2, true);
        assert!(queue.has_outstanding_requests());
        assert!(queue.reject_received(b2));
        assert!(!queue.has_outstanding_requests());
    }

    #[test]
    fn interested_flip_flop_is_silent() {
        let mut queue = classic_queue();
        queue.send_interested(true);
        queue.send_interested(false);
        assert!(drain(&mut queue).is_empty());
        queue.send_interested(false);
        queue.send_interested(true);
        assert!(drain(&mut queue).is_empty());
    }

    #[test]
    fn choke_drops_unsent_pieces() {
        let mut queue = classic_queue();
        queue.send_piece(block(1, 0));
        queue.send_piece(block(2, 0));
        let dropped = queue.send_choke(true);
        assert_eq!(dropped, [block(1, 0), block(2, 0)]);
        assert_eq!(queue.unsent_piece_count(), 0);
        assert_eq!(drain(&mut queue), [PeerMessage::Choke]);
    }

    #[test]
    fn reject_piece_messages_rejects_under_fast() {
        let mut queue = classic_queue();
        queue.set_fast_extension(true);
        queue.send_piece(block(1, 0));
        queue.send_piece(Block::new(1, 16 * 1024, 16 * 1024));
        queue.send_piece(block(2, 0));
        queue.reject_piece_messages(1);
        let messages = drain(&mut queue);
        assert_eq!(
            &messages[..2],
            [
                PeerMessage::RejectRequest(block(1, 0)),
                PeerMessage::RejectRequest(Block::new(1, 16 * 1024, 16 * 1024)),
            ]
        );
        assert!(matches!(messages[2], PeerMessage::Piece { index: 2, .. }));
    }

    #[test]
    fn plugged_requests_stay_queued() {
        let mut queue = classic_queue();
        queue.send_requests(vec![block(1, 0)]);
        queue.set_requests_plugged(true);
        assert!(!queue.has_pending_data());
        assert!(drain(&mut queue).is_empty());
        // outstanding bookkeeping is unaffected by the plug
        assert!(queue.has_outstanding_requests());
        queue.set_requests_plugged(false);
        assert_eq!(drain(&mut queue), [PeerMessage::Request(block(1, 0))]);
    }

    #[test]
    fn requeue_puts_wire_requests_first() {
        let mut queue = classic_queue();
        let r1 = block(1, 0);
        let r2 = block(2, 0);
        let r3 = block(3, 0);
        queue.send_requests(vec![r1, r2]);
        drain(&mut queue);
        queue.send_requests(vec![r3]);
        queue.requeue_all_requests();
        assert_eq!(
            drain(&mut queue),
            [
                PeerMessage::Request(r1),
                PeerMessage::Request(r2),
                PeerMessage::Request(r3),
            ]
        );
        assert_eq!(queue.requests_needed(), 16 - 3);
    }

    #[test]
    fn partial_writes_resume() {
        let mut queue = classic_queue();
        queue.send_piece(block(1, 0));
        let mut pipe = Pipe::default();
        pipe.write_limit = Some(100);
        let mut total = 0;
        // 16 KiB of block plus framing, 100 bytes at a time
        for _ in 0..300 {
            total += queue.send_data(&mut pipe).unwrap();
        }
        assert_eq!(total, 4 + 9 + 16 * 1024);
        assert!(!queue.has_pending_data());
    }

    #[test]
    fn allowed_fast_sets_are_tracked() {
        let mut queue = classic_queue();
        queue.grant_allowed_fast(3);
        queue.grant_allowed_fast(3);
        assert!(queue.is_piece_allowed_fast(3));
        assert!(!queue.is_piece_allowed_fast(1));
        assert_eq!(drain(&mut queue), [PeerMessage::AllowedFast { index: 3 }]);
        queue.clear_allowed_fast_pieces();
        assert!(!queue.is_piece_allowed_fast(3));

        queue.set_request_allowed_fast(9);
        assert!(queue.is_request_allowed_fast(9));
        assert!(!queue.is_request_allowed_fast(2));
    }

    #[test]
    fn merkle_uploads_carry_chains() {
        let db = Arc::new(TestDb::merkle(32 * 1024, 4 * 32 * 1024, &[0, 1]));
        let mut queue =
            OutboundQueue::new(db, ConnectionCounters::detached(), ContentMode::Merkle, 16);
        queue.send_piece(block(1, 0));
        let messages = drain(&mut queue);
        let PeerMessage::MerklePiece { index, chain, .. } = &messages[0] else {
            panic!("expected merkle piece, got {}", messages[0]);
        };
        assert_eq!(*index, 1);
        assert!(!chain.0.is_empty());
    }
}
