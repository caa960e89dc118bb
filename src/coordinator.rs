use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    counters::TorrentCounters,
    protocol::{
        extension::ExtensionHandshake,
        message::PeerId,
        Block, ContentMode, HashChain, InfoHash, StorageDescriptor, ViewSignature,
    },
};

/// Identity a peer engine presents to its coordinator. The coordinator
/// owns peers by this identity and commands them through whatever
/// handle the connection manager registered; the engine itself never
/// hands out references to its own state.
#[derive(Debug, Clone)]
pub struct PeerRef {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
}

/// Read access to verified torrent content.
///
/// The piece database owns hashing and persistence; the engine only
/// reads through it while serving requests and answering handshakes.
pub trait PieceDatabase: Send + Sync {
    /// Static geometry of the torrent. For elastic torrents this is the
    /// original prefix; growth is carried by [`PieceDatabase::current_view`].
    fn storage(&self) -> StorageDescriptor;

    fn have(&self, piece: u32) -> bool;

    fn local_bitfield(&self) -> BitField;

    /// Verified block bytes for an upload
    fn read_block(&self, block: Block) -> anyhow::Result<Bytes>;

    /// Sibling hashes proving `block` under the current root
    /// (merkle and elastic content)
    fn hash_chain(&self, block: Block) -> Option<HashChain> {
        let _ = block;
        None
    }

    /// The latest locally signed view (elastic content)
    fn current_view(&self) -> Option<ViewSignature> {
        None
    }
}

/// The torrent-wide hub a peer engine reports to.
///
/// All calls are synchronous and happen under the coordinator's
/// serialisation token; the engine brackets its own callback in
/// [`Coordinator::lock`] / [`Coordinator::unlock`] and the embedder
/// holds the token around every coordinator-initiated call into the
/// engine.
pub trait Coordinator: Send + Sync {
    /// Acquire the torrent's serialisation token
    fn lock(&self);

    /// Release the torrent's serialisation token
    fn unlock(&self);

    fn info_hash(&self) -> InfoHash;

    fn content_mode(&self) -> ContentMode;

    fn local_peer_id(&self) -> PeerId;

    fn piece_database(&self) -> Arc<dyn PieceDatabase>;

    fn counters(&self) -> &TorrentCounters;

    /// Register a peer after its handshake completed. Returning false
    /// rejects the connection.
    fn peer_connected(&self, peer: &PeerRef) -> bool;

    /// Always called exactly once for every registered peer
    fn peer_disconnected(&self, peer: &PeerRef);

    /// Allocate up to `amount` block requests for this peer.
    /// `remote_is_choking` limits the allocation to allowed-fast pieces.
    fn get_requests(&self, peer: &PeerRef, amount: usize, remote_is_choking: bool) -> Vec<Block>;

    /// A piece became available at this peer. Returns whether the piece
    /// is wanted.
    fn add_available_piece(&self, peer: &PeerRef, piece: u32) -> bool;

    /// The peer announced its full availability. Returns whether any of
    /// it is wanted.
    fn add_available_pieces(&self, peer: &PeerRef, bitfield: &BitField) -> bool;

    fn set_piece_suggested(&self, peer: &PeerRef, piece: u32);

    fn set_piece_allowed_fast(&self, peer: &PeerRef, piece: u32);

    /// Deliver a downloaded block. Signature and chain are present for
    /// elastic (and chain for merkle) content.
    fn handle_block(
        &self,
        peer: &PeerRef,
        block: Block,
        signature: Option<&ViewSignature>,
        chain: Option<&HashChain>,
        data: Bytes,
    );

    /// Cryptographically verify a remote view signature
    fn handle_view_signature(&self, signature: &ViewSignature) -> bool;

    /// Additional extensions to advertise in our extension handshake
    fn offer_extensions_to_peer(&self, peer: &PeerRef) -> Vec<(String, u8)>;

    /// The remote's extension handshake arrived; `added` and `removed`
    /// are the delta its `m` dictionary encodes, `handshake` carries the
    /// opaque remaining fields.
    fn enable_disable_peer_extensions(
        &self,
        peer: &PeerRef,
        added: Vec<String>,
        removed: Vec<String>,
        handshake: &ExtensionHandshake,
    );

    fn process_extension_message(&self, peer: &PeerRef, extension_id: u8, payload: Bytes);

    /// The remote's interest changed; reconsider the choking decision
    fn adjust_choking(&self, we_are_choking: bool);
}

/// Lookup used by accepting connections, where the torrent is only
/// known once the remote handshake reveals its info hash.
pub trait CoordinatorRegistry: Send + Sync {
    fn lookup(&self, info_hash: InfoHash) -> Option<Arc<dyn Coordinator>>;
}
