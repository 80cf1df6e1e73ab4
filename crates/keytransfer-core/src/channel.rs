//! Encrypted, authenticated channel between the two devices.
//!
//! A [`SecureListener`] binds the serving port; [`SecureListener::accept`]
//! and [`SecureChannel::connect`] run the handshake and hand back a
//! [`SecureChannel`] carrying [`WireMessage`]s. Every blocking operation is
//! raced against a [`ChannelCloser`], so closing from any thread makes pending
//! accept/connect/receive calls return [`TransferError::Cancelled`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::error::{NetworkError, ProtocolError, TransferError};
use crate::handshake::{
    initiator_handshake, responder_handshake, sealed_len, PairingMode, SessionKeys,
};
use crate::psk::PresharedKey;

/// Application messages carried inside encrypted frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Outcome of the user's phrase comparison.
    Confirmation { confirmed: bool },
    /// The serialized key ring. Opaque to this crate.
    KeyRing { payload: Vec<u8> },
}

/// bincode prefix of `WireMessage::KeyRing`: u32 variant tag, u64 length.
const KEY_RING_HEADER_LEN: usize = 4 + 8;

/// Encrypted frame size needed to carry a key ring of `payload_len` bytes.
pub fn key_ring_frame_len(payload_len: usize) -> usize {
    sealed_len(payload_len.saturating_add(KEY_RING_HEADER_LEN))
}

/// Shared close flag. Cloning gives another handle to the same flag.
#[derive(Clone, Debug)]
pub struct ChannelCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ChannelCloser {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl ChannelCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn guarded<F, R>(closer: &ChannelCloser, fut: F) -> Result<R, TransferError>
where
    F: Future<Output = Result<R, TransferError>>,
{
    tokio::select! {
        biased;
        _ = closer.closed() => Err(TransferError::Cancelled),
        res = fut => res,
    }
}

/// What a readiness poll found on the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incoming {
    Ready,
    Idle,
    EndOfStream,
}

pub struct SecureListener {
    inner: TcpListener,
    local_addr: SocketAddr,
    closer: ChannelCloser,
}

impl SecureListener {
    pub async fn bind(addr: &str, closer: ChannelCloser) -> Result<Self, TransferError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| TransferError::Setup(format!("failed to bind {addr}: {e}")))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| TransferError::Setup(format!("failed to read local address: {e}")))?;
        info!(addr = %local_addr, "Pairing listener bound");
        Ok(Self {
            inner,
            local_addr,
            closer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for one peer and authenticate it against `psk`.
    pub async fn accept(
        &self,
        psk: &PresharedKey,
        cfg: &TransferConfig,
    ) -> Result<SecureChannel<TcpStream>, TransferError> {
        guarded(&self.closer, async {
            let (mut stream, addr) = self.inner.accept().await?;
            debug!(peer = %addr, "Accepted pairing connection");
            let keys = tokio::time::timeout(
                cfg.handshake_timeout(),
                responder_handshake(psk, cfg.allow_manual_pairing, &mut stream),
            )
            .await
            .map_err(|_| NetworkError::Timeout)??;
            debug!(peer = %addr, mode = ?keys.mode(), "Handshake complete");
            Ok(SecureChannel::new(
                stream,
                addr.to_string(),
                keys,
                self.closer.clone(),
                cfg,
            ))
        })
        .await
    }
}

pub struct SecureChannel<T = TcpStream> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
    keys: SessionKeys,
    peer: String,
    closer: ChannelCloser,
    transfer_timeout: Duration,
    max_frame_len: usize,
}

impl SecureChannel<TcpStream> {
    /// Connect and run the initiator handshake. Without a key the channel is
    /// unkeyed and the peers must confirm the comparison phrase.
    pub async fn connect(
        host: &str,
        port: u16,
        psk: Option<&PresharedKey>,
        timeout: Duration,
        closer: &ChannelCloser,
        cfg: &TransferConfig,
    ) -> Result<Self, TransferError> {
        guarded(closer, async {
            let attempt = async {
                let mut stream = TcpStream::connect((host, port)).await?;
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| format!("{host}:{port}"));
                let keys = initiator_handshake(psk, &mut stream).await?;
                Ok::<_, TransferError>((stream, peer, keys))
            };
            let (stream, peer, keys) = tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| NetworkError::Timeout)??;
            debug!(peer = %peer, mode = ?keys.mode(), "Handshake complete");
            Ok(SecureChannel::new(stream, peer, keys, closer.clone(), cfg))
        })
        .await
    }
}

impl<T> SecureChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(
        stream: T,
        peer: String,
        keys: SessionKeys,
        closer: ChannelCloser,
        cfg: &TransferConfig,
    ) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            keys,
            peer,
            closer,
            transfer_timeout: cfg.transfer_timeout(),
            max_frame_len: cfg.max_frame_len,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn mode(&self) -> PairingMode {
        self.keys.mode()
    }

    /// Unkeyed channels are not authenticated until the phrase is confirmed.
    pub fn requires_confirmation(&self) -> bool {
        self.keys.mode() == PairingMode::Unkeyed
    }

    pub fn phrase_material(&self) -> &[u8] {
        self.keys.phrase_material()
    }

    pub fn closer(&self) -> &ChannelCloser {
        &self.closer
    }

    pub async fn send(&mut self, msg: &WireMessage) -> Result<(), TransferError> {
        let bytes = bincode::serialize(msg).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let keys = &self.keys;
        let writer = &mut self.writer;
        let max_frame_len = self.max_frame_len;
        guarded(&self.closer, async move {
            keys.send_encrypted_frame(writer, &bytes, max_frame_len).await
        })
        .await
    }

    /// Wait up to `idle` for the peer to start sending. Cancel-safe: no bytes
    /// are consumed, so it can sit in a `select!` next to other wake-ups.
    pub async fn poll_incoming(&mut self, idle: Duration) -> Result<Incoming, TransferError> {
        let reader = &mut self.reader;
        guarded(&self.closer, async move {
            match tokio::time::timeout(idle, reader.fill_buf()).await {
                Err(_) => Ok(Incoming::Idle),
                Ok(Ok(buf)) if buf.is_empty() => Ok(Incoming::EndOfStream),
                Ok(Ok(_)) => Ok(Incoming::Ready),
                Ok(Err(e)) => Err(e.into()),
            }
        })
        .await
    }

    /// Read one whole message under the transfer timeout.
    pub async fn read_message(&mut self) -> Result<WireMessage, TransferError> {
        let keys = &self.keys;
        let reader = &mut self.reader;
        let max_frame_len = self.max_frame_len;
        let transfer_timeout = self.transfer_timeout;
        let frame = guarded(&self.closer, async move {
            tokio::time::timeout(transfer_timeout, keys.read_encrypted_frame(reader, max_frame_len))
                .await
                .map_err(|_| NetworkError::Timeout)?
        })
        .await?;
        bincode::deserialize(&frame).map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }

    /// Receive one message. An idle timeout returns `Network(Timeout)` and
    /// leaves the channel usable; a closed peer returns `Network(EndOfStream)`.
    pub async fn receive(&mut self, idle: Duration) -> Result<WireMessage, TransferError> {
        match self.poll_incoming(idle).await? {
            Incoming::Idle => Err(NetworkError::Timeout.into()),
            Incoming::EndOfStream => Err(NetworkError::EndOfStream.into()),
            Incoming::Ready => self.read_message().await,
        }
    }

    /// Half-close and wait for the peer to hang up so the last frame is not
    /// lost to a reset. Errors are irrelevant at this point.
    pub async fn finish(mut self) {
        if self.writer.shutdown().await.is_err() {
            return;
        }
        let mut sink = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + self.transfer_timeout;
        let reader = &mut self.reader;
        let _ = guarded(&self.closer, async move {
            loop {
                match tokio::time::timeout_at(deadline, reader.read(&mut sink)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return Ok(()),
                    Ok(Ok(_)) => continue,
                }
            }
        })
        .await;
    }

    /// Idempotent; wakes any task blocked on this channel.
    pub fn close(&self) {
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PresharedKey {
        PresharedKey::from_bytes(vec![byte; 16]).unwrap()
    }

    fn test_config() -> TransferConfig {
        TransferConfig {
            bind_address: "127.0.0.1".into(),
            listen_port: 0,
            ..TransferConfig::default()
        }
    }

    async fn connected_pair(
        psk: PresharedKey,
    ) -> (SecureChannel<TcpStream>, SecureChannel<TcpStream>) {
        let cfg = test_config();
        let listener = SecureListener::bind(&cfg.listen_addr(), ChannelCloser::new())
            .await
            .unwrap();
        let port = listener.local_addr().port();
        let server_cfg = cfg.clone();
        let server_psk = psk.clone();
        let server =
            tokio::spawn(async move { listener.accept(&server_psk, &server_cfg).await.unwrap() });
        let client = SecureChannel::connect(
            "127.0.0.1",
            port,
            Some(&psk),
            Duration::from_secs(5),
            &ChannelCloser::new(),
            &cfg,
        )
        .await
        .unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn message_travels_from_client_to_server() {
        let (mut server, mut client) = connected_pair(key(3)).await;
        assert!(!server.requires_confirmation());

        let msg = WireMessage::KeyRing {
            payload: b"-----BEGIN PGP PUBLIC KEY BLOCK-----".to_vec(),
        };
        client.send(&msg).await.unwrap();
        let received = server.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn idle_timeout_leaves_channel_usable() {
        let (mut server, mut client) = connected_pair(key(4)).await;

        let idle = server.receive(Duration::from_millis(50)).await;
        assert!(matches!(idle, Err(ref e) if e.is_timeout()));

        let msg = WireMessage::Confirmation { confirmed: true };
        client.send(&msg).await.unwrap();
        assert_eq!(server.receive(Duration::from_secs(2)).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn peer_hangup_is_end_of_stream() {
        let (mut server, client) = connected_pair(key(5)).await;
        drop(client);
        let result = server.receive(Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(TransferError::Network(NetworkError::EndOfStream))
        ));
    }

    #[tokio::test]
    async fn wrong_key_fails_authentication() {
        let cfg = test_config();
        let listener = SecureListener::bind(&cfg.listen_addr(), ChannelCloser::new())
            .await
            .unwrap();
        let port = listener.local_addr().port();
        let server_cfg = cfg.clone();
        let server =
            tokio::spawn(async move { listener.accept(&key(1), &server_cfg).await.err() });

        let client = SecureChannel::connect(
            "127.0.0.1",
            port,
            Some(&key(2)),
            Duration::from_secs(5),
            &ChannelCloser::new(),
            &cfg,
        )
        .await;
        assert!(matches!(client, Err(TransferError::Authentication)));
        assert!(matches!(
            server.await.unwrap(),
            Some(TransferError::Authentication)
        ));
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let cfg = test_config();
        let closer = ChannelCloser::new();
        let listener = SecureListener::bind(&cfg.listen_addr(), closer.clone())
            .await
            .unwrap();
        let pending = tokio::spawn(async move { listener.accept(&key(1), &cfg).await.err() });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(closer.close());
        assert!(!closer.close());
        assert!(matches!(
            pending.await.unwrap(),
            Some(TransferError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let free_port = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free_port.local_addr().unwrap().port();
        drop(free_port);

        let result = SecureChannel::connect(
            "127.0.0.1",
            port,
            Some(&key(1)),
            Duration::from_secs(2),
            &ChannelCloser::new(),
            &test_config(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TransferError::Network(NetworkError::ConnectionRefused))
        ));
    }

    #[test]
    fn key_ring_frame_len_matches_encoding() {
        for len in [0usize, 1, 700, 4096] {
            let msg = WireMessage::KeyRing {
                payload: vec![0xa5; len],
            };
            let plain = bincode::serialize(&msg).unwrap();
            assert_eq!(key_ring_frame_len(len), sealed_len(plain.len()));
        }
    }

    #[tokio::test]
    async fn send_refuses_frames_over_the_limit() {
        let (mut server, mut client) = connected_pair(key(6)).await;
        client.max_frame_len = key_ring_frame_len(16);

        let too_big = WireMessage::KeyRing {
            payload: vec![0u8; 17],
        };
        assert!(matches!(
            client.send(&too_big).await,
            Err(TransferError::Protocol(ProtocolError::FrameTooLarge(_)))
        ));

        let fits = WireMessage::KeyRing {
            payload: vec![0u8; 16],
        };
        client.send(&fits).await.unwrap();
        assert_eq!(server.receive(Duration::from_secs(2)).await.unwrap(), fits);
    }
}
