//! Session key agreement and datagram sealing.
//!
//! The handshake negotiates an X25519 shared secret; directional
//! XChaCha20-Poly1305 keys are derived from it with HKDF-SHA256 salted
//! by the responder cookie. Every established-session datagram is
//! `[session id (4, BE)][nonce counter (8, LE)][AEAD(chunk stream)]`
//! with the session id and counter authenticated as AAD.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{DecodeError, COOKIE_SIZE, NONCE_COUNTER_SIZE, PUBLIC_KEY_SIZE, SESSION_KEY_SIZE};

/// Nonce direction byte: initiator to responder.
const DIR_INITIATOR: u8 = 0x00;
/// Nonce direction byte: responder to initiator.
const DIR_RESPONDER: u8 = 0x01;

/// One directional AEAD key, zeroized on drop.
#[derive(Clone)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(key)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// An X25519 keypair scoped to one handshake.
pub struct HandshakeKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes for the keying chunk.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Derive directional session keys against the remote public key.
    ///
    /// `initiator` selects which derived half becomes the send key.
    pub fn derive(
        &self,
        remote_public: &[u8; PUBLIC_KEY_SIZE],
        cookie: &[u8; COOKIE_SIZE],
        initiator: bool,
    ) -> SessionKeys {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote_public));
        let hk = Hkdf::<Sha256>::new(Some(cookie), shared.as_bytes());
        let mut okm = [0u8; SESSION_KEY_SIZE * 2];
        hk.expand(b"rtmfp session keys", &mut okm)
            .expect("valid HKDF output length");

        let mut i2r = [0u8; SESSION_KEY_SIZE];
        let mut r2i = [0u8; SESSION_KEY_SIZE];
        i2r.copy_from_slice(&okm[..SESSION_KEY_SIZE]);
        r2i.copy_from_slice(&okm[SESSION_KEY_SIZE..]);
        okm.zeroize();

        let (send, recv, send_dir) = if initiator {
            (i2r, r2i, DIR_INITIATOR)
        } else {
            (r2i, i2r, DIR_RESPONDER)
        };
        SessionKeys {
            send: SessionKey::from_bytes(send),
            recv: SessionKey::from_bytes(recv),
            send_dir,
            send_counter: 0,
        }
    }
}

impl std::fmt::Debug for HandshakeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Directional session keys plus the outbound nonce counter.
#[derive(Debug)]
pub struct SessionKeys {
    send: SessionKey,
    recv: SessionKey,
    send_dir: u8,
    send_counter: u64,
}

impl SessionKeys {
    /// Seal a chunk stream into a full datagram for `session_id`.
    pub fn seal(&mut self, session_id: u32, chunks: &[u8]) -> Vec<u8> {
        self.send_counter += 1;
        let counter = self.send_counter;

        let aad = aad(session_id, counter);
        let nonce = nonce(self.send_dir, counter);
        let cipher = XChaCha20Poly1305::new((&self.send.0).into());
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: chunks,
                    aad: &aad,
                },
            )
            .expect("XChaCha20-Poly1305 encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(4 + NONCE_COUNTER_SIZE + ciphertext.len());
        out.extend_from_slice(&session_id.to_be_bytes());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Open the post-session-id remainder of an inbound datagram.
    pub fn open(&self, session_id: u32, rest: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if rest.len() < NONCE_COUNTER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let counter = u64::from_le_bytes(rest[..NONCE_COUNTER_SIZE].try_into().unwrap());
        let ciphertext = &rest[NONCE_COUNTER_SIZE..];

        let aad = aad(session_id, counter);
        let recv_dir = self.send_dir ^ 0x01;
        let nonce = nonce(recv_dir, counter);
        let cipher = XChaCha20Poly1305::new((&self.recv.0).into());
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| DecodeError::AuthFailed)
    }
}

fn aad(session_id: u32, counter: u64) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[..4].copy_from_slice(&session_id.to_be_bytes());
    aad[4..].copy_from_slice(&counter.to_le_bytes());
    aad
}

fn nonce(direction: u8, counter: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0] = direction;
    nonce[16..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypairs() -> (SessionKeys, SessionKeys) {
        let initiator = HandshakeKeypair::generate();
        let responder = HandshakeKeypair::generate();
        let cookie = [0x5a; COOKIE_SIZE];
        let ik = initiator.derive(&responder.public_bytes(), &cookie, true);
        let rk = responder.derive(&initiator.public_bytes(), &cookie, false);
        (ik, rk)
    }

    #[test]
    fn seal_open_both_directions() {
        let (mut ik, mut rk) = keypairs();

        let datagram = ik.seal(7, b"initiator chunks");
        let (id, rest) = crate::packet::split_datagram(&datagram).unwrap();
        assert_eq!(id, 7);
        assert_eq!(rk.open(7, rest).unwrap(), b"initiator chunks");

        let datagram = rk.seal(7, b"responder chunks");
        let (_, rest) = crate::packet::split_datagram(&datagram).unwrap();
        assert_eq!(ik.open(7, rest).unwrap(), b"responder chunks");
    }

    #[test]
    fn tampering_is_detected() {
        let (mut ik, rk) = keypairs();
        let mut datagram = ik.seal(7, b"payload");
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;
        let (_, rest) = crate::packet::split_datagram(&datagram).unwrap();
        assert_eq!(rk.open(7, rest), Err(DecodeError::AuthFailed));
    }

    #[test]
    fn wrong_session_id_fails_aad() {
        let (mut ik, rk) = keypairs();
        let datagram = ik.seal(7, b"payload");
        let (_, rest) = crate::packet::split_datagram(&datagram).unwrap();
        assert_eq!(rk.open(8, rest), Err(DecodeError::AuthFailed));
    }

    #[test]
    fn counters_advance_per_datagram() {
        let (mut ik, rk) = keypairs();
        let a = ik.seal(7, b"one");
        let b = ik.seal(7, b"two");
        assert_ne!(a, b);
        let (_, rest) = crate::packet::split_datagram(&b).unwrap();
        assert_eq!(rk.open(7, rest).unwrap(), b"two");
    }

    #[test]
    fn cookie_is_bound_into_keys() {
        let initiator = HandshakeKeypair::generate();
        let responder = HandshakeKeypair::generate();
        let mut ik = initiator.derive(&responder.public_bytes(), &[1; COOKIE_SIZE], true);
        let rk = responder.derive(&initiator.public_bytes(), &[2; COOKIE_SIZE], false);
        let datagram = ik.seal(7, b"payload");
        let (_, rest) = crate::packet::split_datagram(&datagram).unwrap();
        assert_eq!(rk.open(7, rest), Err(DecodeError::AuthFailed));
    }
}
