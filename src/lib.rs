//! Per-peer BitTorrent protocol engine.
//!
//! Each remote peer is handled by a [`PeerEngine`]: an incremental wire
//! parser, the two-sided choke/interest state machine and an outbound
//! message queue, all driven by connection readiness callbacks. Piece
//! picking, verification and swarm policy live behind the
//! [`Coordinator`] trait and are provided by the embedder.
//!
//! Three content modes are supported: classic flat SHA-1 torrents,
//! Merkle tree torrents and elastic torrents whose length grows under
//! signed view descriptors. The fast extension (BEP 6) and the generic
//! extension protocol (BEP 10) are negotiated per connection.

use std::time::Duration;

mod bitfield;
mod conn;
mod coordinator;
mod counters;
mod engine;
mod protocol;
mod queue;

pub use bitfield::BitField;
pub use conn::{PeerConnection, Transport};
pub use coordinator::{Coordinator, CoordinatorRegistry, PeerRef, PieceDatabase};
pub use counters::{ConnectionCounters, TorrentCounters, TransferCounter};
pub use engine::{PeerEngine, PeerError, PeerErrorCause, Status};
pub use protocol::extension::ExtensionHandshake;
pub use protocol::message::{HandShake, PeerId, PeerMessage};
pub use protocol::{
    allowed_fast_set, Block, ContentMode, HashChain, InfoHash, StorageDescriptor, ViewSignature,
};

pub const CLIENT_NAME: &str = "peerwire 0.1.0";

/// Largest block a request may ask for
pub const MAX_BLOCK_LENGTH: u32 = 16 * 1024;

/// Frame size cap. Must admit a full block message with merkle/elastic
/// framing around it as well as bitfields of large torrents.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 17;

/// BEP 6 reference set size. Doubles as the remote cardinality above
/// which a peer no longer needs allowed-fast grants.
pub const ALLOWED_FAST_SET_SIZE: usize = 7;

pub const IDLE_INTERVAL: Duration = Duration::from_secs(120);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_PIPELINE: usize = 16;

/// Per-connection knobs. Local preferences only; the effective
/// capabilities of a connection are these AND-ed with what the remote
/// handshake advertises.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub fast_extension: bool,
    pub extension_protocol: bool,
    /// Target depth of the outbound request pipeline
    pub request_pipeline: usize,
    pub idle_interval: Duration,
    pub max_message_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fast_extension: true,
            extension_protocol: true,
            request_pipeline: DEFAULT_REQUEST_PIPELINE,
            idle_interval: IDLE_INTERVAL,
            max_message_length: MAX_MESSAGE_LENGTH,
        }
    }
}
