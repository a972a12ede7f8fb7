//! Cryptographic handshake.
//!
//! A multi-step cookie exchange producing an authenticated session:
//!
//! ```text
//! Initiator                       Responder
//!   | -- IHello (tag, epd) --------> |      CookieRequested
//!   | <- RHello (tag, cookie) ------ |      CookieReceived
//!   | -- IIKeying (cookie, pk, --- > |      KeysExchanged
//!   |      connect args)             |
//!   | <- RIKeying (sid, pk) -------- |      Connected
//! ```
//!
//! The cookie request is retried with exponential backoff; the responder
//! side is stateless until a cookie verifies (keyed MAC over the source
//! address). Session keys come out of X25519 + HKDF, salted by the
//! cookie, and drive the AEAD sealing of every later datagram.

mod crypto;
mod initiator;
mod responder;

pub use crypto::{HandshakeKeypair, SessionKeys};
pub use initiator::{Initiator, InitiatorAction};
pub use responder::{AcceptedSession, KeyingVerdict, Responder, ResponderReject};

/// Handshake lifecycle.
///
/// `Closed`/`Failed` are terminal; a session never resurrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Not started.
    Idle,
    /// IHello sent, waiting for the cookie.
    CookieRequested,
    /// Cookie received, keying about to go out.
    CookieReceived,
    /// IIKeying sent, waiting for the responder's keying.
    KeysExchanged,
    /// Session established.
    Connected,
    /// Torn down by either side.
    Closed,
    /// Handshake failed (timeout or rejection).
    Failed,
}
