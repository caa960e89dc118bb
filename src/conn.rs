use std::{io, sync::Arc};

use bytes::BytesMut;
use tokio::{io::Interest, net::TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    coordinator::{Coordinator, CoordinatorRegistry},
    engine::{PeerEngine, PeerError},
    ConnectionConfig, KEEPALIVE_INTERVAL,
};

/// Non-blocking byte stream owned by one peer connection.
///
/// `read` returns `Ok(0)` on a closed stream and `WouldBlock` once the
/// readable data is drained; `write` accepts as much as fits and
/// reports `WouldBlock` when the stream cannot take more.
pub trait Transport {
    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if buf.capacity() - buf.len() < 4096 {
            buf.reserve(16 * 1024);
        }
        self.try_read_buf(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.try_write(data)
    }
}

/// Drives one [`PeerEngine`] over a tcp stream.
///
/// Readiness, the keepalive tick and cancellation are the only inputs;
/// everything else happens inside the engine's callback.
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    engine: PeerEngine,
    cancellation_token: CancellationToken,
}

impl PeerConnection {
    /// Connection we initiated: the torrent is known up front and our
    /// handshake is queued immediately.
    pub fn outgoing(
        stream: TcpStream,
        coordinator: Arc<dyn Coordinator>,
        config: ConnectionConfig,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            engine: PeerEngine::outgoing(addr, coordinator, config),
            cancellation_token,
        })
    }

    /// Accepted connection: setup is deferred until the remote
    /// handshake reveals an info hash the registry recognises.
    pub fn incoming(
        stream: TcpStream,
        registry: Arc<dyn CoordinatorRegistry>,
        config: ConnectionConfig,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            engine: PeerEngine::incoming(addr, registry, config),
            cancellation_token,
        })
    }

    pub async fn run(mut self) -> (Uuid, Result<(), PeerError>) {
        let id = self.engine.id();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        loop {
            let interest = if self.engine.has_pending_writes() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            tokio::select! {
                ready = self.stream.ready(interest) => {
                    let ready = match ready {
                        Ok(ready) => ready,
                        Err(e) => {
                            self.engine.close();
                            return (id, Err(PeerError::connection(&e.to_string())));
                        }
                    };
                    let readable = ready.is_readable() || ready.is_read_closed();
                    let writable = ready.is_writable();
                    if let Err(e) = self.engine.connection_ready(&mut self.stream, readable, writable) {
                        return (id, Err(e));
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.engine.send_keepalive_or_close() {
                        return (id, Err(e));
                    }
                    if let Err(e) = self.engine.connection_ready(&mut self.stream, false, true) {
                        return (id, Err(e));
                    }
                }
                _ = self.cancellation_token.cancelled() => {
                    tracing::debug!("Peer connection cancelled");
                    self.engine.close();
                    return (id, Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;

    use bytes::{Buf, BytesMut};

    use super::Transport;

    /// In-memory transport for engine tests. Bytes the engine should
    /// see are pushed into `incoming`; everything the engine writes
    /// lands in `outgoing`.
    #[derive(Debug, Default)]
    pub struct Pipe {
        pub incoming: BytesMut,
        pub outgoing: BytesMut,
        /// Per-write byte cap, to exercise partial writes
        pub write_limit: Option<usize>,
        pub closed: bool,
    }

    impl Pipe {
        pub fn push(&mut self, data: &[u8]) {
            self.incoming.extend_from_slice(data);
        }

        pub fn take_outgoing(&mut self) -> BytesMut {
            self.outgoing.split()
        }
    }

    impl Transport for Pipe {
        fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
            if self.incoming.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.incoming.len();
            buf.extend_from_slice(&self.incoming);
            self.incoming.advance(n);
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let n = match self.write_limit {
                Some(limit) if limit == 0 => return Err(io::ErrorKind::WouldBlock.into()),
                Some(limit) => data.len().min(limit),
                None => data.len(),
            };
            self.outgoing.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use tokio_util::sync::CancellationToken;

    use super::PeerConnection;
    use crate::{
        coordinator::testing::{CoordinatorEvent, RecordingCoordinator},
        protocol::message::{HandShake, PeerId, PeerMessage},
        ConnectionConfig, InfoHash,
    };

    #[tokio::test]
    async fn outgoing_connection_handshakes() {
        let info_hash = InfoHash([0xAB; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut their_handshake = [0u8; HandShake::SIZE];
            socket.read_exact(&mut their_handshake).await.unwrap();
            let parsed = HandShake::from_bytes(&their_handshake).unwrap();
            assert_eq!(parsed.info_hash, info_hash);
            assert!(parsed.supports_fast());

            let reply = HandShake::new(info_hash, PeerId::my_id(), true, false);
            socket.write_all(&reply.as_bytes()).await.unwrap();
            let mut bitfield = bytes::BytesMut::new();
            PeerMessage::HaveAll.write_frame(&mut bitfield);
            socket.write_all(&bitfield).await.unwrap();
            // give the client a moment to process before hanging up
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let coordinator = Arc::new(RecordingCoordinator::classic(info_hash, 4));
        coordinator.want_pieces(&[0, 1, 2, 3]);
        let stream = tokio::net::TcpStream::connect(listen_addr).await.unwrap();
        let connection = PeerConnection::outgoing(
            stream,
            coordinator.clone(),
            ConnectionConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        let (_, result) = tokio::time::timeout(Duration::from_secs(5), connection.run())
            .await
            .unwrap();
        // the scripted server hangs up, which surfaces as a connection error
        assert!(result.is_err());
        server.await.unwrap();

        let events = coordinator.events();
        assert!(events.contains(&CoordinatorEvent::Connected));
        assert!(events.contains(&CoordinatorEvent::Disconnected));
        assert!(events
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::AvailableAll { .. })));
    }
}
