use std::{collections::HashSet, fmt::Display, net::SocketAddr, sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    conn::Transport,
    coordinator::{Coordinator, CoordinatorRegistry, PeerRef, PieceDatabase},
    counters::ConnectionCounters,
    protocol::{
        allowed_fast_set,
        extension::{
            ExtensionHandshake, ELASTIC_EXTENSION_ID, ELASTIC_EXTENSION_NAME, MERKLE_EXTENSION_ID,
            MERKLE_EXTENSION_NAME,
        },
        message::{HandShake, PeerId, PeerMessage},
        parser::{WireEvent, WireParser},
        Block, ContentMode, HashChain, InfoHash, StorageDescriptor, ViewSignature,
    },
    queue::OutboundQueue,
    ConnectionConfig, ALLOWED_FAST_SET_SIZE,
};

#[derive(Debug, Clone)]
pub struct PeerError {
    pub msg: String,
    pub cause: PeerErrorCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCause {
    Timeout,
    Connection,
    Protocol,
    Unhandled,
}

impl PeerError {
    pub fn new(cause: PeerErrorCause, msg: &str) -> Self {
        Self {
            cause,
            msg: msg.into(),
        }
    }

    pub fn timeout(msg: &str) -> Self {
        Self::new(PeerErrorCause::Timeout, msg)
    }

    pub fn connection(msg: &str) -> Self {
        Self::new(PeerErrorCause::Connection, msg)
    }

    pub fn protocol(msg: &str) -> Self {
        Self::new(PeerErrorCause::Protocol, msg)
    }

    pub fn unhandled(msg: &str) -> Self {
        Self::new(PeerErrorCause::Unhandled, msg)
    }
}

impl Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} peer error: {}", self.cause, self.msg)
    }
}

impl std::error::Error for PeerError {}

/// One side's choke/interest pair
#[derive(Debug, Clone, Copy)]
pub struct Status {
    choked: bool,
    interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
        }
    }
}

impl Status {
    pub fn set_choke(&mut self, force: bool) {
        self.choked = force;
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_interest(&mut self, force: bool) {
        self.interested = force;
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }
}

/// Protocol engine for a single remote peer.
///
/// Owns the connection's parser, outbound queue and all per-peer state.
/// Everything is driven by [`PeerEngine::connection_ready`] plus the
/// coordinator-facing command surface; there are no timers or tasks
/// inside. Any protocol or I/O failure closes the connection and
/// notifies the coordinator exactly once.
pub struct PeerEngine {
    id: Uuid,
    addr: SocketAddr,
    config: ConnectionConfig,
    outbound: bool,

    registry: Option<Arc<dyn CoordinatorRegistry>>,
    coordinator: Option<Arc<dyn Coordinator>>,
    db: Option<Arc<dyn PieceDatabase>>,
    queue: Option<OutboundQueue>,
    counters: ConnectionCounters,

    parser: WireParser,
    read_buf: BytesMut,

    info_hash: Option<InfoHash>,
    remote_peer_id: Option<PeerId>,
    mode: Option<ContentMode>,
    fast_ext: bool,
    ext_proto: bool,

    /// Our status towards the peer
    out_status: Status,
    /// Peer's status towards us
    in_status: Status,

    remote_bitfield: BitField,
    /// The remote's piece geometry; grows under elastic signatures
    remote_storage: StorageDescriptor,
    /// At most the two most recent remote view signatures, view lengths
    /// strictly increasing
    remote_signatures: Vec<ViewSignature>,
    remote_extensions: HashSet<String>,

    last_data_at: Instant,
    registered: bool,
    closed: bool,
}

impl std::fmt::Debug for PeerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEngine")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("mode", &self.mode)
            .field("fast_ext", &self.fast_ext)
            .field("ext_proto", &self.ext_proto)
            .field("out_status", &self.out_status)
            .field("in_status", &self.in_status)
            .field("registered", &self.registered)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PeerEngine {
    fn new_raw(addr: SocketAddr, config: ConnectionConfig, outbound: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            parser: WireParser::new(config.max_message_length),
            config,
            outbound,
            registry: None,
            coordinator: None,
            db: None,
            queue: None,
            counters: ConnectionCounters::detached(),
            read_buf: BytesMut::new(),
            info_hash: None,
            remote_peer_id: None,
            mode: None,
            fast_ext: false,
            ext_proto: false,
            out_status: Status::default(),
            in_status: Status::default(),
            remote_bitfield: BitField::empty(0),
            remote_storage: StorageDescriptor::new(1, 0),
            remote_signatures: Vec::new(),
            remote_extensions: HashSet::new(),
            last_data_at: Instant::now(),
            registered: false,
            closed: false,
        }
    }

    /// Engine for a connection we initiated. The torrent is known, so
    /// setup runs immediately and our handshake is queued.
    pub fn outgoing(
        addr: SocketAddr,
        coordinator: Arc<dyn Coordinator>,
        config: ConnectionConfig,
    ) -> Self {
        let mut this = Self::new_raw(addr, config, true);
        this.info_hash = Some(coordinator.info_hash());
        this.complete_setup(coordinator);
        this
    }

    /// Engine for an accepted connection. Setup waits until the remote
    /// handshake reveals an info hash the registry recognises.
    pub fn incoming(
        addr: SocketAddr,
        registry: Arc<dyn CoordinatorRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        let mut this = Self::new_raw(addr, config, false);
        this.registry = Some(registry);
        this
    }

    fn complete_setup(&mut self, coordinator: Arc<dyn Coordinator>) {
        let mode = coordinator.content_mode();
        let db = coordinator.piece_database();
        let storage = db.storage();
        self.counters = ConnectionCounters::for_connection(coordinator.counters());
        let mut queue = OutboundQueue::new(
            db.clone(),
            self.counters.clone(),
            mode,
            self.config.request_pipeline,
        );
        let info_hash = self.info_hash.expect("info hash known before setup");
        queue.send_handshake(HandShake::new(
            info_hash,
            coordinator.local_peer_id(),
            self.config.fast_extension,
            self.config.extension_protocol,
        ));
        // the remote starts out choking us
        queue.set_requests_plugged(true);
        self.parser.set_content_mode(mode);
        self.remote_storage = storage;
        self.remote_bitfield = BitField::empty(storage.num_pieces() as usize);
        self.mode = Some(mode);
        self.db = Some(db);
        self.queue = Some(queue);
        self.coordinator = Some(coordinator);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn out_status(&self) -> Status {
        self.out_status
    }

    pub fn in_status(&self) -> Status {
        self.in_status
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    pub fn remote_bitfield(&self) -> &BitField {
        &self.remote_bitfield
    }

    pub fn remote_signatures(&self) -> &[ViewSignature] {
        &self.remote_signatures
    }

    pub fn remote_extensions(&self) -> &HashSet<String> {
        &self.remote_extensions
    }

    pub fn has_pending_writes(&self) -> bool {
        self.queue
            .as_ref()
            .is_some_and(|queue| queue.has_pending_data())
    }

    fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: self.id,
            addr: self.addr,
            peer_id: self.remote_peer_id,
        }
    }

    fn queue_mut(&mut self) -> &mut OutboundQueue {
        self.queue.as_mut().expect("outbound queue after setup")
    }

    fn coordinator(&self) -> Arc<dyn Coordinator> {
        self.coordinator
            .clone()
            .expect("coordinator bound after setup")
    }

    fn db(&self) -> Arc<dyn PieceDatabase> {
        self.db.clone().expect("piece database after setup")
    }

    fn mode(&self) -> ContentMode {
        self.mode.expect("content mode after setup")
    }

    /// Local piece geometry, including signed elastic growth
    fn local_storage(&self) -> StorageDescriptor {
        let db = self.db();
        let mut storage = db.storage();
        if let Some(view) = db.current_view() {
            storage.grow_to(view.view_length);
        }
        storage
    }

    /// The hot path: pump inbound bytes through the parser, top up the
    /// request pipeline, drain the outbound queue. Runs under the
    /// coordinator's serialisation token.
    pub fn connection_ready(
        &mut self,
        transport: &mut dyn Transport,
        readable: bool,
        writable: bool,
    ) -> Result<(), PeerError> {
        if self.closed {
            return Ok(());
        }
        if let Some(coordinator) = self.coordinator.clone() {
            coordinator.lock();
        }
        let result = match self.ready_inner(transport, readable, writable) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        };
        // an accepting engine may have bound its coordinator (and taken
        // the token) inside this very callback
        if let Some(coordinator) = self.coordinator.clone() {
            coordinator.unlock();
        }
        result
    }

    fn ready_inner(
        &mut self,
        transport: &mut dyn Transport,
        readable: bool,
        writable: bool,
    ) -> Result<(), PeerError> {
        if readable {
            self.read_and_parse(transport)?;
        }
        if self.registered && self.out_status.is_interested() {
            self.refill_requests();
        }
        if writable {
            if let Some(queue) = self.queue.as_mut() {
                queue
                    .send_data(transport)
                    .map_err(|e| PeerError::connection(&format!("{e:#}")))?;
            }
        }
        Ok(())
    }

    fn read_and_parse(&mut self, transport: &mut dyn Transport) -> Result<(), PeerError> {
        let mut got_data = false;
        let mut eof = false;
        loop {
            match transport.read(&mut self.read_buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => got_data = true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(PeerError::connection(&e.to_string())),
            }
        }
        if got_data {
            self.last_data_at = Instant::now();
        }
        self.drain_parser()?;
        if eof {
            return Err(PeerError::connection("connection closed by peer"));
        }
        Ok(())
    }

    fn drain_parser(&mut self) -> Result<(), PeerError> {
        let result = loop {
            match self.parser.decode(&mut self.read_buf) {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle_event(event) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(PeerError::protocol(&format!("{e:#}"))),
            }
        };
        self.counters
            .protocol_download
            .add(self.parser.take_consumed());
        result
    }

    fn handle_event(&mut self, event: WireEvent) -> Result<(), PeerError> {
        match event {
            WireEvent::Handshake {
                fast,
                extension_protocol,
                info_hash,
            } => self.handle_handshake(fast, extension_protocol, info_hash),
            WireEvent::PeerId(peer_id) => self.handle_peer_id(peer_id),
            WireEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_handshake(
        &mut self,
        fast: bool,
        extension_protocol: bool,
        info_hash: InfoHash,
    ) -> Result<(), PeerError> {
        // effective capabilities are the AND of both preferences
        self.fast_ext = self.config.fast_extension && fast;
        self.ext_proto = self.config.extension_protocol && extension_protocol;
        self.parser.set_capabilities(self.fast_ext, self.ext_proto);

        if self.outbound {
            if self.info_hash != Some(info_hash) {
                return Err(PeerError::protocol("handshake for a different torrent"));
            }
        } else {
            let Some(registry) = self.registry.clone() else {
                return Err(PeerError::unhandled("accepting engine without a registry"));
            };
            let Some(coordinator) = registry.lookup(info_hash) else {
                tracing::debug!(ip = %self.addr, %info_hash, "Peer offered an unknown torrent");
                return Err(PeerError::protocol("unknown info hash"));
            };
            self.info_hash = Some(info_hash);
            // the rest of this callback runs under the torrent's token;
            // connection_ready releases it
            coordinator.lock();
            self.complete_setup(coordinator);
        }
        tracing::debug!(ip = %self.addr, fast = self.fast_ext, extensions = self.ext_proto, "Handshake capabilities negotiated");

        let fast_ext = self.fast_ext;
        self.queue_mut().set_fast_extension(fast_ext);

        let mode = self.mode();
        if mode == ContentMode::Elastic && !(self.fast_ext && self.ext_proto) {
            return Err(PeerError::protocol(
                "elastic content requires the fast extension and the extension protocol",
            ));
        }
        if self.ext_proto {
            let mut extensions = match mode {
                ContentMode::Elastic => vec![(
                    ELASTIC_EXTENSION_NAME.to_string(),
                    ELASTIC_EXTENSION_ID,
                )],
                ContentMode::Merkle => {
                    vec![(MERKLE_EXTENSION_NAME.to_string(), MERKLE_EXTENSION_ID)]
                }
                ContentMode::Classic => Vec::new(),
            };
            let coordinator = self.coordinator();
            extensions.extend(coordinator.offer_extensions_to_peer(&self.peer_ref()));
            let handshake =
                ExtensionHandshake::advertising(extensions, self.config.request_pipeline);
            self.queue_mut().send_extension_handshake(handshake);
        }
        if mode == ContentMode::Elastic {
            // announce growth past the static prefix up front
            let db = self.db();
            if let Some(view) = db.current_view() {
                if view.view_length > db.storage().total_length {
                    let bitfield = db.local_bitfield();
                    let queue = self.queue_mut();
                    queue.send_availability(PeerMessage::ElasticSignature(view));
                    queue.send_availability(PeerMessage::ElasticBitfield {
                        payload: Bytes::copy_from_slice(bitfield.as_bytes()),
                    });
                }
            }
        }
        Ok(())
    }

    fn handle_peer_id(&mut self, peer_id: PeerId) -> Result<(), PeerError> {
        self.remote_peer_id = Some(peer_id);
        let coordinator = self.coordinator();
        if !coordinator.peer_connected(&self.peer_ref()) {
            return Err(PeerError::protocol("coordinator rejected the peer"));
        }
        self.registered = true;
        tracing::debug!(ip = %self.addr, %peer_id, "Peer registered");

        // initial availability message
        let bitfield = self.db().local_bitfield();
        let mode = self.mode();
        let fast = self.fast_ext;
        let queue = self.queue_mut();
        if mode == ContentMode::Elastic {
            queue.send_availability(PeerMessage::HaveNone);
        } else if fast {
            if bitfield.count_ones() == 0 {
                queue.send_availability(PeerMessage::HaveNone);
            } else if bitfield.is_full() {
                queue.send_availability(PeerMessage::HaveAll);
            } else {
                queue.send_availability(PeerMessage::Bitfield {
                    payload: Bytes::copy_from_slice(bitfield.as_bytes()),
                });
            }
        } else if bitfield.count_ones() > 0 {
            queue.send_availability(PeerMessage::Bitfield {
                payload: Bytes::copy_from_slice(bitfield.as_bytes()),
            });
        }
        Ok(())
    }

    fn handle_message(&mut self, message: PeerMessage) -> Result<(), PeerError> {
        tracing::trace!(ip = %self.addr, "Peer sent {message} message");
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.in_status.set_choke(true);
                let fast = self.fast_ext;
                let queue = self.queue_mut();
                queue.set_requests_plugged(true);
                if !fast {
                    // without the fast extension a choke implicitly
                    // cancels everything in flight
                    queue.requeue_all_requests();
                }
            }
            PeerMessage::Unchoke => {
                self.in_status.set_choke(false);
                self.queue_mut().set_requests_plugged(false);
            }
            PeerMessage::Interested => {
                self.in_status.set_interest(true);
                let we_choking = self.out_status.is_choked();
                self.coordinator().adjust_choking(we_choking);
            }
            PeerMessage::NotInterested => {
                self.in_status.set_interest(false);
                let we_choking = self.out_status.is_choked();
                self.coordinator().adjust_choking(we_choking);
            }
            PeerMessage::Have { index } => self.handle_have(index)?,
            PeerMessage::Bitfield { payload } => self.handle_bitfield(&payload)?,
            PeerMessage::Request(block) => self.handle_request(block)?,
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                if self.mode() != ContentMode::Classic {
                    return Err(PeerError::protocol("plain piece outside classic content"));
                }
                self.handle_incoming_block(index, begin, block, None, None)?;
            }
            PeerMessage::Cancel(block) => {
                if !block.is_valid_for(&self.local_storage()) {
                    return Err(PeerError::protocol("cancel for an invalid block"));
                }
                let fast = self.fast_ext;
                let queue = self.queue_mut();
                if queue.discard_piece(block) && fast {
                    queue.send_reject(block);
                }
            }
            PeerMessage::SuggestPiece { index } => {
                if index as usize >= self.remote_bitfield.len() {
                    return Err(PeerError::protocol("suggest for a piece out of range"));
                }
                if self.remote_bitfield.has(index as usize) {
                    self.coordinator().set_piece_suggested(&self.peer_ref(), index);
                }
            }
            PeerMessage::HaveAll => {
                self.remote_bitfield.set_all();
                let wanted = self
                    .coordinator()
                    .add_available_pieces(&self.peer_ref(), &self.remote_bitfield);
                if wanted && !self.out_status.is_interested() {
                    self.set_interested_internal(true);
                }
            }
            PeerMessage::HaveNone => {
                if self.mode() != ContentMode::Elastic {
                    self.generate_allowed_fast();
                }
            }
            PeerMessage::RejectRequest(block) => {
                if !self.queue_mut().reject_received(block) {
                    return Err(PeerError::protocol("reject for a request never made"));
                }
            }
            PeerMessage::AllowedFast { index } => {
                if index as usize >= self.remote_bitfield.len() {
                    return Err(PeerError::protocol("allowed-fast out of range"));
                }
                if self.remote_bitfield.has(index as usize) {
                    self.queue_mut().set_request_allowed_fast(index);
                    self.coordinator()
                        .set_piece_allowed_fast(&self.peer_ref(), index);
                }
            }
            PeerMessage::ExtensionHandshake { payload } => {
                let added: Vec<String> = payload.added().map(str::to_string).collect();
                let removed: Vec<String> = payload.removed().map(str::to_string).collect();
                for name in &removed {
                    self.remote_extensions.remove(name);
                }
                for name in &added {
                    self.remote_extensions.insert(name.clone());
                }
                self.coordinator().enable_disable_peer_extensions(
                    &self.peer_ref(),
                    added,
                    removed,
                    &payload,
                );
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => {
                self.coordinator()
                    .process_extension_message(&self.peer_ref(), extension_id, payload);
            }
            PeerMessage::MerklePiece {
                index,
                begin,
                chain,
                block,
            } => {
                if self.mode() != ContentMode::Merkle {
                    return Err(PeerError::protocol("merkle piece outside merkle content"));
                }
                self.handle_incoming_block(index, begin, block, None, Some(chain))?;
            }
            PeerMessage::ElasticSignature(signature) => {
                self.handle_elastic_signature(signature)?;
            }
            PeerMessage::ElasticPiece {
                index,
                begin,
                view_length,
                chain,
                block,
            } => {
                let signature = self
                    .remote_signatures
                    .iter()
                    .find(|s| s.view_length == view_length)
                    .cloned();
                if chain.is_some() && signature.is_none() {
                    return Err(PeerError::protocol(
                        "elastic piece references an unknown view",
                    ));
                }
                self.handle_incoming_block(index, begin, block, signature, chain)?;
            }
            PeerMessage::ElasticBitfield { payload } => self.handle_elastic_bitfield(&payload)?,
            PeerMessage::Unknown { id } => {
                tracing::trace!(ip = %self.addr, "Ignoring unknown message with id {id}");
            }
        }
        Ok(())
    }

    fn handle_have(&mut self, index: u32) -> Result<(), PeerError> {
        if index as usize >= self.remote_bitfield.len() {
            return Err(PeerError::protocol("have for a piece out of range"));
        }
        if self.remote_bitfield.has(index as usize) {
            return Ok(());
        }
        let cardinality_before = self.remote_bitfield.count_ones();
        self.remote_bitfield
            .add(index as usize)
            .map_err(|e| PeerError::protocol(&e.to_string()))?;
        let wanted = self
            .coordinator()
            .add_available_piece(&self.peer_ref(), index);
        if wanted && !self.out_status.is_interested() {
            self.set_interested_internal(true);
        }
        // once the peer holds enough pieces it no longer needs grants
        if cardinality_before < ALLOWED_FAST_SET_SIZE
            && cardinality_before + 1 >= ALLOWED_FAST_SET_SIZE
        {
            self.queue_mut().clear_allowed_fast_pieces();
        }
        Ok(())
    }

    fn handle_bitfield(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let num_pieces = self.remote_storage.num_pieces() as usize;
        self.remote_bitfield = BitField::from_bytes(payload, num_pieces)
            .map_err(|e| PeerError::protocol(&format!("{e:#}")))?;
        let wanted = self
            .coordinator()
            .add_available_pieces(&self.peer_ref(), &self.remote_bitfield);
        if wanted && !self.out_status.is_interested() {
            self.set_interested_internal(true);
        }
        if self.fast_ext
            && self.mode() != ContentMode::Elastic
            && self.remote_bitfield.count_ones() < ALLOWED_FAST_SET_SIZE
        {
            self.generate_allowed_fast();
        }
        Ok(())
    }

    fn handle_request(&mut self, block: Block) -> Result<(), PeerError> {
        if !block.is_valid_for(&self.local_storage()) {
            return Err(PeerError::protocol("request for an invalid block"));
        }
        if !self.db().have(block.piece) {
            if self.fast_ext {
                self.queue_mut().send_reject(block);
                return Ok(());
            }
            return Err(PeerError::protocol("request for a piece we do not have"));
        }
        if !self.out_status.is_choked() {
            self.queue_mut().send_piece(block);
        } else if self.fast_ext {
            let queue = self.queue_mut();
            if queue.is_piece_allowed_fast(block.piece) {
                queue.send_piece(block);
            } else {
                queue.send_reject(block);
            }
        }
        // choked without the fast extension: the request is stale, drop it
        Ok(())
    }

    fn handle_incoming_block(
        &mut self,
        index: u32,
        begin: u32,
        data: Bytes,
        signature: Option<ViewSignature>,
        chain: Option<HashChain>,
    ) -> Result<(), PeerError> {
        let block = Block::new(index, begin, data.len() as u32);
        if !block.is_valid_for(&self.remote_storage) {
            return Err(PeerError::protocol("block with an invalid descriptor"));
        }
        if self.queue_mut().request_received(block) {
            self.counters.block_download.add(block.length as u64);
            self.coordinator().handle_block(
                &self.peer_ref(),
                block,
                signature.as_ref(),
                chain.as_ref(),
                data,
            );
        } else if self.fast_ext {
            return Err(PeerError::protocol("block we never requested"));
        } else {
            // a classic peer cannot tell a cancelled request's late
            // arrival apart, so it is dropped
            tracing::trace!(ip = %self.addr, "Dropping late block for piece {index}");
        }
        Ok(())
    }

    fn handle_elastic_signature(&mut self, signature: ViewSignature) -> Result<(), PeerError> {
        if signature.view_length > self.remote_storage.total_length {
            self.remote_storage.grow_to(signature.view_length);
            let num_pieces = self.remote_storage.num_pieces() as usize;
            if self.remote_bitfield.len() < num_pieces {
                self.remote_bitfield.extend(num_pieces);
            }
        }
        if !self.coordinator().handle_view_signature(&signature) {
            return Err(PeerError::protocol("view signature failed verification"));
        }
        let newest = self
            .remote_signatures
            .last()
            .map_or(true, |last| signature.view_length > last.view_length);
        if newest {
            self.remote_signatures.push(signature);
            while self.remote_signatures.len() > 2 {
                self.remote_signatures.remove(0);
            }
        }
        Ok(())
    }

    fn handle_elastic_bitfield(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let num_pieces = self.remote_storage.num_pieces() as usize;
        if payload.len() * 8 < num_pieces {
            return Err(PeerError::protocol("elastic bitfield smaller than the view"));
        }
        let bitfield = BitField::from_bytes_unchecked(payload);
        if bitfield.len() < self.remote_bitfield.len() {
            return Err(PeerError::protocol("elastic bitfield shrank"));
        }
        self.remote_bitfield = bitfield;
        let wanted = self
            .coordinator()
            .add_available_pieces(&self.peer_ref(), &self.remote_bitfield);
        if wanted && !self.out_status.is_interested() {
            self.set_interested_internal(true);
        }
        Ok(())
    }

    fn set_interested_internal(&mut self, interested: bool) {
        tracing::debug!(ip = %self.addr, "Setting our interested status to {interested}");
        self.out_status.set_interest(interested);
        self.queue_mut().send_interested(interested);
    }

    fn generate_allowed_fast(&mut self) {
        let Some(info_hash) = self.info_hash else {
            return;
        };
        let num_pieces = self.db().storage().num_pieces();
        for piece in allowed_fast_set(&self.addr, &info_hash, num_pieces) {
            self.queue_mut().grant_allowed_fast(piece);
        }
    }

    fn refill_requests(&mut self) {
        let needed = self.queue_mut().requests_needed();
        if needed == 0 {
            return;
        }
        let remote_choking = self.in_status.is_choked();
        let blocks = self
            .coordinator()
            .get_requests(&self.peer_ref(), needed, remote_choking);
        if !blocks.is_empty() {
            self.queue_mut().send_requests(blocks);
        }
    }

    fn fail(&mut self, error: PeerError) -> PeerError {
        tracing::debug!(ip = %self.addr, "Closing peer connection: {error}");
        self.close_internal();
        error
    }

    fn close_internal(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.registered {
            if let Some(coordinator) = self.coordinator.clone() {
                coordinator.peer_disconnected(&self.peer_ref());
            }
        }
    }

    /// Idempotent close; notifies the coordinator at most once
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        match self.coordinator.clone() {
            Some(coordinator) => {
                coordinator.lock();
                self.close_internal();
                coordinator.unlock();
            }
            None => self.close_internal(),
        }
    }

    // Command surface the coordinator drives, always under its token.

    pub fn set_we_are_choking(&mut self, choking: bool) {
        if self.queue.is_none() || self.out_status.is_choked() == choking {
            return;
        }
        tracing::debug!(ip = %self.addr, "Setting our choke status to {choking}");
        self.out_status.set_choke(choking);
        let dropped = self.queue_mut().send_choke(choking);
        if self.fast_ext {
            for block in dropped {
                self.queue_mut().send_reject(block);
            }
        }
    }

    pub fn set_we_are_interested(&mut self, interested: bool) {
        if self.queue.is_none() || self.out_status.is_interested() == interested {
            return;
        }
        self.set_interested_internal(interested);
    }

    /// Cancel our own requests. Unsent ones collapse silently; sent ones
    /// produce cancel frames and, under the fast extension, stay tracked
    /// until answered.
    pub fn cancel_requests(&mut self, blocks: &[Block]) {
        if self.queue.is_none() {
            return;
        }
        let keep_tracking = self.fast_ext;
        for block in blocks {
            self.queue_mut().send_cancel(*block, keep_tracking);
        }
    }

    /// Withdraw queued uploads for a piece we no longer serve
    pub fn reject_piece(&mut self, piece: u32) {
        if self.queue.is_none() {
            return;
        }
        self.queue_mut().reject_piece_messages(piece);
    }

    pub fn send_have_piece(&mut self, piece: u32) {
        if self.queue.is_none() {
            return;
        }
        self.queue_mut().send_have(piece);
    }

    pub fn send_view_signature(&mut self, signature: ViewSignature) {
        if self.queue.is_none() {
            return;
        }
        self.queue_mut()
            .send_availability(PeerMessage::ElasticSignature(signature));
    }

    pub fn send_extension_handshake(&mut self, handshake: ExtensionHandshake) {
        if self.queue.is_none() {
            return;
        }
        self.queue_mut().send_extension_handshake(handshake);
    }

    pub fn send_extension_message(&mut self, extension_id: u8, payload: Bytes) {
        if self.queue.is_none() {
            return;
        }
        self.queue_mut().send_extension(extension_id, payload);
    }

    /// Periodic tick from the outside: close an idle connection or queue
    /// a keepalive frame.
    pub fn send_keepalive_or_close(&mut self) -> Result<(), PeerError> {
        if self.closed {
            return Ok(());
        }
        if self.last_data_at.elapsed() > self.config.idle_interval {
            let error = PeerError::timeout("peer has been idle too long");
            match self.coordinator.clone() {
                Some(coordinator) => {
                    coordinator.lock();
                    self.close_internal();
                    coordinator.unlock();
                }
                None => self.close_internal(),
            }
            return Err(error);
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.send_keepalive();
        }
        Ok(())
    }
}
