//! Responder side of the handshake.
//!
//! The client engine answers handshakes itself when acting as a P2P
//! endpoint (direct peer sessions, P2P publishing). Cookies are
//! stateless: a keyed BLAKE2b MAC over the initiator address, so a
//! responder holds no per-handshake state until a valid cookie echo
//! arrives.

use std::net::SocketAddr;

use blake2::digest::{KeyInit, Mac};
use blake2::Blake2bMac512;
use rand::RngCore;

use crate::core::{COOKIE_SIZE, PUBLIC_KEY_SIZE, TAG_SIZE};
use crate::packet::Chunk;

use super::crypto::{HandshakeKeypair, SessionKeys};

/// Verdict on an initiator's keying attempt, decided by the engine
/// (application name known, capacity, ...).
pub type KeyingVerdict = std::result::Result<(), String>;

/// An accepted incoming session.
#[derive(Debug)]
pub struct AcceptedSession {
    /// Session id assigned to the initiator.
    pub session_id: u32,
    /// Negotiated directional keys (responder perspective).
    pub keys: SessionKeys,
    /// Connect arguments the initiator supplied.
    pub connect_args: Vec<(String, String)>,
    /// The RIKeying chunk to send back.
    pub reply: Chunk,
}

/// Stateless handshake responder.
pub struct Responder {
    cookie_key: [u8; 32],
}

impl Responder {
    /// Create a responder with a random cookie key.
    pub fn new() -> Self {
        let mut cookie_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut cookie_key);
        Self { cookie_key }
    }

    /// Answer an IHello with an RHello carrying a stateless cookie.
    pub fn on_ihello(&self, tag: [u8; TAG_SIZE], from: SocketAddr) -> Chunk {
        Chunk::RHello {
            tag,
            cookie: self.cookie_for(from),
        }
    }

    /// Validate an IIKeying and, when the verdict accepts it, derive the
    /// session keys and build the RIKeying reply.
    ///
    /// `session_id` is the id the engine allocated for this session; it
    /// only gets consumed when the keying succeeds.
    pub fn on_iikeying(
        &self,
        cookie: [u8; COOKIE_SIZE],
        public_key: [u8; PUBLIC_KEY_SIZE],
        connect_args: Vec<(String, String)>,
        from: SocketAddr,
        session_id: u32,
        verdict: KeyingVerdict,
    ) -> std::result::Result<AcceptedSession, ResponderReject> {
        if cookie != self.cookie_for(from) {
            // Forged or stale cookie; drop silently, no reply.
            return Err(ResponderReject::BadCookie);
        }
        if let Err(reason) = verdict {
            return Err(ResponderReject::Refused(Chunk::RIKeying {
                session_id: 0,
                public_key: [0u8; PUBLIC_KEY_SIZE],
                refusal: Some(reason),
            }));
        }

        let keypair = HandshakeKeypair::generate();
        let reply = Chunk::RIKeying {
            session_id,
            public_key: keypair.public_bytes(),
            refusal: None,
        };
        let keys = keypair.derive(&public_key, &cookie, false);
        Ok(AcceptedSession {
            session_id,
            keys,
            connect_args,
            reply,
        })
    }

    fn cookie_for(&self, from: SocketAddr) -> [u8; COOKIE_SIZE] {
        let mut mac = <Blake2bMac512 as KeyInit>::new_from_slice(&self.cookie_key)
            .expect("cookie key fits BLAKE2b key size");
        mac.update(from.to_string().as_bytes());
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&mac.finalize().into_bytes());
        cookie
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// Why an IIKeying produced no session.
#[derive(Debug)]
pub enum ResponderReject {
    /// Cookie did not verify; the keying is dropped without a reply.
    BadCookie,
    /// The engine refused the connect; send this RIKeying refusal.
    Refused(Chunk),
}
