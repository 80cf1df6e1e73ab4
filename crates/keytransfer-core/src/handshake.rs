//! Handshake implementation.
//!
//! - Ephemeral X25519 keys + per-side nonces, one round trip plus a final tag.
//! - The pre-shared key from the pairing descriptor is the HKDF-SHA256 salt, so
//!   both sides only agree on keys when they hold the same secret.
//! - HMAC-SHA256 key confirmation tags in both directions, compared in
//!   constant time.
//! - Unkeyed mode (manual pairing) skips the salt; the peers then compare a
//!   phrase derived from the transcript instead.
//! - Produces an XChaCha20-Poly1305 AEAD for subsequent encrypted framing.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroize;

use crate::error::{ProtocolError, TransferError};
use crate::psk::PresharedKey;

pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed lengths
const PUBKEY_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const TAG_LEN: usize = 32;
const XNONCE_LEN: usize = 24;
const AEAD_TAG_LEN: usize = 16;
const HELLO_LEN: usize = 2 + PUBKEY_LEN + NONCE_LEN;
const REPLY_LEN: usize = PUBKEY_LEN + NONCE_LEN + TAG_LEN;

/// Handshake messages are tiny; anything bigger is not a peer of ours.
const MAX_HANDSHAKE_MESSAGE: usize = 1024;

const LABEL_CONFIRM: &[u8] = b"keytransfer/v1 confirm";
const LABEL_SESSION: &[u8] = b"keytransfer/v1 session";
const LABEL_PHRASE: &[u8] = b"keytransfer/v1 phrase";

const AAD_TO_RESPONDER: &[u8] = b"initiator->responder";
const AAD_TO_INITIATOR: &[u8] = b"responder->initiator";

type HmacSha256 = Hmac<Sha256>;

/// How the initiator learned about the responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingMode {
    /// The pre-shared key came from a scanned descriptor.
    Keyed,
    /// Host and port were typed in; needs phrase confirmation.
    Unkeyed,
}

impl PairingMode {
    fn to_byte(self) -> u8 {
        match self {
            PairingMode::Unkeyed => 0,
            PairingMode::Keyed => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TransferError> {
        match b {
            0 => Ok(PairingMode::Unkeyed),
            1 => Ok(PairingMode::Keyed),
            other => Err(ProtocolError::Decode(format!("unknown pairing mode {other}")).into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Keys established by a completed handshake.
pub struct SessionKeys {
    aead: XChaCha20Poly1305,
    role: HandshakeRole,
    mode: PairingMode,
    phrase_material: [u8; 32],
}

impl SessionKeys {
    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Transcript-bound secret both peers feed into the comparison phrase.
    pub fn phrase_material(&self) -> &[u8; 32] {
        &self.phrase_material
    }

    fn outgoing_aad(&self) -> &'static [u8] {
        match self.role {
            HandshakeRole::Initiator => AAD_TO_RESPONDER,
            HandshakeRole::Responder => AAD_TO_INITIATOR,
        }
    }

    fn incoming_aad(&self) -> &'static [u8] {
        match self.role {
            HandshakeRole::Initiator => AAD_TO_INITIATOR,
            HandshakeRole::Responder => AAD_TO_RESPONDER,
        }
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.phrase_material.zeroize();
    }
}

/// Size on the wire (excluding the length prefix) of a frame carrying
/// `plaintext_len` bytes.
pub fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len.saturating_add(XNONCE_LEN + AEAD_TAG_LEN)
}

/// Minimal length-prefixed frame helpers (u32 BE length).
async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
) -> Result<(), TransferError> {
    let len = u32::try_from(data.len()).map_err(|_| ProtocolError::FrameTooLarge(data.len()))?;
    transport.write_all(&len.to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

async fn read_lp<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
    max_len: usize,
) -> Result<Vec<u8>, TransferError> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > max_len {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

struct DerivedKeys {
    confirm: [u8; 32],
    session: [u8; 32],
    phrase: [u8; 32],
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.confirm.zeroize();
        self.session.zeroize();
        self.phrase.zeroize();
    }
}

fn derive_keys(
    shared: &[u8],
    psk: Option<&PresharedKey>,
    transcript: &[u8],
) -> Result<DerivedKeys, TransferError> {
    let hk = Hkdf::<Sha256>::new(psk.map(|k| k.as_bytes()), shared);
    let mut keys = DerivedKeys {
        confirm: [0u8; 32],
        session: [0u8; 32],
        phrase: [0u8; 32],
    };
    for (label, out) in [
        (LABEL_CONFIRM, &mut keys.confirm),
        (LABEL_SESSION, &mut keys.session),
        (LABEL_PHRASE, &mut keys.phrase),
    ] {
        hk.expand_multi_info(&[label, transcript], out)
            .map_err(|_| TransferError::Setup("HKDF expand failed".into()))?;
    }
    Ok(keys)
}

fn confirmation_mac(confirm_key: &[u8; 32], role: HandshakeRole) -> Result<HmacSha256, TransferError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(confirm_key)
        .map_err(|_| TransferError::Setup("HMAC key rejected".into()))?;
    mac.update(match role {
        HandshakeRole::Initiator => b"initiator",
        HandshakeRole::Responder => b"responder",
    });
    Ok(mac)
}

fn transcript(mode: PairingMode, x_i: &[u8], nonce_i: &[u8], x_r: &[u8], nonce_r: &[u8]) -> Vec<u8> {
    let mut t = Vec::with_capacity(HELLO_LEN + PUBKEY_LEN + NONCE_LEN);
    t.push(PROTOCOL_VERSION);
    t.push(mode.to_byte());
    t.extend_from_slice(x_i);
    t.extend_from_slice(nonce_i);
    t.extend_from_slice(x_r);
    t.extend_from_slice(nonce_r);
    t
}

fn split_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Initiator side handshake. `psk` is `None` for manual pairing.
pub async fn initiator_handshake<T>(
    psk: Option<&PresharedKey>,
    transport: &mut T,
) -> Result<SessionKeys, TransferError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mode = if psk.is_some() {
        PairingMode::Keyed
    } else {
        PairingMode::Unkeyed
    };

    let x_secret = EphemeralSecret::random_from_rng(OsRng);
    let x_pub = X25519Public::from(&x_secret);
    let mut nonce_i = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_i);

    let mut hello = Vec::with_capacity(HELLO_LEN);
    hello.push(PROTOCOL_VERSION);
    hello.push(mode.to_byte());
    hello.extend_from_slice(x_pub.as_bytes());
    hello.extend_from_slice(&nonce_i);
    write_lp(transport, &hello).await?;

    let reply = read_lp(transport, MAX_HANDSHAKE_MESSAGE).await?;
    if reply.len() != REPLY_LEN {
        return Err(ProtocolError::Decode("handshake reply has wrong length".into()).into());
    }
    let x_r: [u8; PUBKEY_LEN] = split_array(&reply, 0);
    let nonce_r: [u8; NONCE_LEN] = split_array(&reply, PUBKEY_LEN);
    let tag_r = &reply[PUBKEY_LEN + NONCE_LEN..];

    let shared = x_secret.diffie_hellman(&X25519Public::from(x_r));
    if !shared.was_contributory() {
        return Err(TransferError::Authentication);
    }

    let transcript = transcript(mode, x_pub.as_bytes(), &nonce_i, &x_r, &nonce_r);
    let keys = derive_keys(shared.as_bytes(), psk, &transcript)?;

    let responder_ok = confirmation_mac(&keys.confirm, HandshakeRole::Responder)?
        .verify_slice(tag_r)
        .is_ok();

    // Send our tag even on mismatch so the responder fails the same way.
    let tag_i = confirmation_mac(&keys.confirm, HandshakeRole::Initiator)?
        .finalize()
        .into_bytes();
    write_lp(transport, &tag_i).await?;

    if !responder_ok {
        tracing::warn!("Responder failed key confirmation");
        return Err(TransferError::Authentication);
    }

    Ok(SessionKeys {
        aead: XChaCha20Poly1305::new(&keys.session.into()),
        role: HandshakeRole::Initiator,
        mode,
        phrase_material: keys.phrase,
    })
}

/// Responder handshake. The listener's key is bound before the peer arrives.
pub async fn responder_handshake<T>(
    psk: &PresharedKey,
    accept_unkeyed: bool,
    transport: &mut T,
) -> Result<SessionKeys, TransferError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let hello = read_lp(transport, MAX_HANDSHAKE_MESSAGE).await?;
    if hello.len() != HELLO_LEN {
        return Err(ProtocolError::Decode("handshake hello has wrong length".into()).into());
    }
    if hello[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(hello[0]).into());
    }
    let mode = PairingMode::from_byte(hello[1])?;
    if mode == PairingMode::Unkeyed && !accept_unkeyed {
        tracing::warn!("Rejecting unkeyed pairing attempt");
        return Err(TransferError::Authentication);
    }
    let x_i: [u8; PUBKEY_LEN] = split_array(&hello, 2);
    let nonce_i: [u8; NONCE_LEN] = split_array(&hello, 2 + PUBKEY_LEN);

    let x_secret = EphemeralSecret::random_from_rng(OsRng);
    let x_pub = X25519Public::from(&x_secret);
    let mut nonce_r = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_r);

    let shared = x_secret.diffie_hellman(&X25519Public::from(x_i));
    if !shared.was_contributory() {
        return Err(TransferError::Authentication);
    }

    let transcript = transcript(mode, &x_i, &nonce_i, x_pub.as_bytes(), &nonce_r);
    let salt = match mode {
        PairingMode::Keyed => Some(psk),
        PairingMode::Unkeyed => None,
    };
    let keys = derive_keys(shared.as_bytes(), salt, &transcript)?;

    let tag_r = confirmation_mac(&keys.confirm, HandshakeRole::Responder)?
        .finalize()
        .into_bytes();
    let mut reply = Vec::with_capacity(REPLY_LEN);
    reply.extend_from_slice(x_pub.as_bytes());
    reply.extend_from_slice(&nonce_r);
    reply.extend_from_slice(&tag_r);
    write_lp(transport, &reply).await?;

    let tag_i = read_lp(transport, MAX_HANDSHAKE_MESSAGE).await?;
    if confirmation_mac(&keys.confirm, HandshakeRole::Initiator)?
        .verify_slice(&tag_i)
        .is_err()
    {
        tracing::warn!("Initiator failed key confirmation");
        return Err(TransferError::Authentication);
    }

    Ok(SessionKeys {
        aead: XChaCha20Poly1305::new(&keys.session.into()),
        role: HandshakeRole::Responder,
        mode,
        phrase_material: keys.phrase,
    })
}

//
// Helper encrypted frame IO for SessionKeys
//
impl SessionKeys {
    /// Send a length-prefixed encrypted frame. Nonce scheme: 24-byte random XNonce per-frame.
    /// Frames the peer would reject as larger than `max_len` are refused before
    /// anything is written.
    pub async fn send_encrypted_frame<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        plaintext: &[u8],
        max_len: usize,
    ) -> Result<(), TransferError> {
        let sealed = sealed_len(plaintext.len());
        if sealed > max_len {
            return Err(ProtocolError::FrameTooLarge(sealed).into());
        }

        let mut nonce_bytes = [0u8; XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut buf = plaintext.to_vec();
        self.aead
            .encrypt_in_place(&nonce, self.outgoing_aad(), &mut buf)
            .map_err(|_| ProtocolError::Decode("aead encrypt failed".into()))?;

        // Frame = nonce || ciphertext
        let mut frame = Vec::with_capacity(XNONCE_LEN + buf.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&buf);

        write_lp(transport, &frame).await?;
        Ok(())
    }

    /// Read an encrypted frame and return plaintext.
    pub async fn read_encrypted_frame<T: AsyncRead + Unpin + Send>(
        &self,
        transport: &mut T,
        max_len: usize,
    ) -> Result<Vec<u8>, TransferError> {
        let frame = read_lp(transport, max_len).await?;
        if frame.len() < XNONCE_LEN {
            return Err(ProtocolError::Decode("frame too small".into()).into());
        }

        let nonce = XNonce::from_slice(&frame[..XNONCE_LEN]);
        let mut cipher = frame[XNONCE_LEN..].to_vec();
        self.aead
            .decrypt_in_place(nonce, self.incoming_aad(), &mut cipher)
            .map_err(|_| ProtocolError::Decode("aead decrypt failed".into()))?;

        Ok(cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn key(byte: u8) -> PresharedKey {
        PresharedKey::from_bytes(vec![byte; 16]).unwrap()
    }

    #[tokio::test]
    async fn keyed_handshake_agrees_on_keys() {
        let (mut a, mut b) = duplex(4096);
        let psk = key(0x42);
        let psk_r = psk.clone();

        let responder = tokio::spawn(async move {
            let keys = responder_handshake(&psk_r, false, &mut b).await.unwrap();
            let msg = keys.read_encrypted_frame(&mut b, 1024).await.unwrap();
            keys.send_encrypted_frame(&mut b, b"pong", 1024).await.unwrap();
            (keys.phrase_material().to_vec(), msg)
        });

        let keys = initiator_handshake(Some(&psk), &mut a).await.unwrap();
        assert_eq!(keys.mode(), PairingMode::Keyed);
        keys.send_encrypted_frame(&mut a, b"ping", 1024).await.unwrap();
        let reply = keys.read_encrypted_frame(&mut a, 1024).await.unwrap();

        let (responder_material, received) = responder.await.unwrap();
        assert_eq!(received, b"ping");
        assert_eq!(reply, b"pong");
        assert_eq!(responder_material, keys.phrase_material().to_vec());
    }

    #[tokio::test]
    async fn mismatched_keys_fail_on_both_sides() {
        let (mut a, mut b) = duplex(4096);
        let responder =
            tokio::spawn(async move { responder_handshake(&key(1), false, &mut b).await.err() });

        let initiator = initiator_handshake(Some(&key(2)), &mut a).await;
        assert!(matches!(initiator, Err(TransferError::Authentication)));
        assert!(matches!(
            responder.await.unwrap(),
            Some(TransferError::Authentication)
        ));
    }

    #[tokio::test]
    async fn unkeyed_handshake_needs_responder_consent() {
        let (mut a, mut b) = duplex(4096);
        let responder =
            tokio::spawn(async move { responder_handshake(&key(1), false, &mut b).await.err() });
        let initiator = initiator_handshake(None, &mut a).await;
        assert!(initiator.is_err());
        assert!(matches!(
            responder.await.unwrap(),
            Some(TransferError::Authentication)
        ));

        let (mut a, mut b) = duplex(4096);
        let responder = tokio::spawn(async move {
            let keys = responder_handshake(&key(1), true, &mut b).await.unwrap();
            (keys.mode(), keys.phrase_material().to_vec())
        });
        let keys = initiator_handshake(None, &mut a).await.unwrap();
        let (mode, material) = responder.await.unwrap();
        assert_eq!(mode, PairingMode::Unkeyed);
        assert_eq!(material, keys.phrase_material().to_vec());
    }

    #[tokio::test]
    async fn frames_cannot_be_reflected() {
        let (mut a, mut b) = duplex(4096);
        let psk = key(9);
        let psk_r = psk.clone();
        let responder =
            tokio::spawn(async move { responder_handshake(&psk_r, false, &mut b).await.unwrap() });
        let keys = initiator_handshake(Some(&psk), &mut a).await.unwrap();
        let _responder_keys = responder.await.unwrap();

        // An initiator-sent frame fed back to the initiator must not decrypt.
        let mut wire = Vec::new();
        keys.send_encrypted_frame(&mut wire, b"echo", 1024).await.unwrap();
        let result = keys.read_encrypted_frame(&mut wire.as_slice(), 1024).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(4096u32).to_be_bytes());
        let result = read_lp(&mut wire.as_slice(), 1024).await;
        assert!(matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::FrameTooLarge(4096)))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_writing() {
        let (mut a, mut b) = duplex(4096);
        let psk = key(7);
        let psk_r = psk.clone();
        let responder =
            tokio::spawn(async move { responder_handshake(&psk_r, false, &mut b).await.unwrap() });
        let keys = initiator_handshake(Some(&psk), &mut a).await.unwrap();
        let _responder_keys = responder.await.unwrap();

        let mut wire = Vec::new();
        let result = keys.send_encrypted_frame(&mut wire, &[0u8; 100], 64).await;
        assert!(matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::FrameTooLarge(n))) if n == sealed_len(100)
        ));
        assert!(wire.is_empty());

        // A frame exactly at the limit is still sent.
        keys.send_encrypted_frame(&mut wire, &[1u8; 24], sealed_len(24))
            .await
            .unwrap();
        assert_eq!(wire.len(), 4 + sealed_len(24));
    }
}
