//! Protocol constants for the RTMFP client engine.
//!
//! Defaults mirror the option table of the reference client surface;
//! wire-level values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Derived session key size (ChaCha20-Poly1305).
pub const SESSION_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Handshake cookie size.
pub const COOKIE_SIZE: usize = 64;

/// Initiator tag size (echoed by the responder in RHello).
pub const TAG_SIZE: usize = 16;

// =============================================================================
// DATAGRAM LAYOUT
// =============================================================================

/// Session id prefix on every datagram.
pub const SESSION_ID_SIZE: usize = 4;

/// Per-datagram nonce counter (LE64) preceding the encrypted chunk stream.
pub const NONCE_COUNTER_SIZE: usize = 8;

/// Payload budget per fragment; keeps a full datagram under typical
/// path MTU with headroom for headers and the AEAD tag.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1200;

/// Largest datagram the engine will ever emit.
pub const MAX_DATAGRAM_SIZE: usize =
    SESSION_ID_SIZE + NONCE_COUNTER_SIZE + MAX_FRAGMENT_PAYLOAD + 128 + AEAD_TAG_SIZE;

// =============================================================================
// TIMING
// =============================================================================

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_millis(60000);

/// Maximum retransmission attempts for a fragment before the owning
/// session fails with `DeliveryFailed`.
pub const MAX_RETRANSMITS: u32 = 10;

/// Handshake cookie request timeout (initial, doubled per retry).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum cookie request retries before `HandshakeTimeout`.
pub const HANDSHAKE_MAX_RETRIES: u32 = 5;

/// Handshake retry backoff multiplier.
pub const HANDSHAKE_BACKOFF: u32 = 2;

/// Engine tick driving retransmission, keepalive and group timers.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Interrupt predicate poll period during blocking waits.
pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Send a keepalive ping when a session has been idle this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Consider a session dead after this long without any datagram.
pub const DEAD_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// OPTION DEFAULTS (reference client option table)
// =============================================================================

/// Default UDP receive buffer size in bytes.
pub const DEFAULT_SOCKET_RECEIVE_SIZE: usize = 212992;

/// Default UDP send buffer size in bytes.
pub const DEFAULT_SOCKET_SEND_SIZE: usize = 212992;

/// Default unicast fallback timeout in milliseconds.
pub const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 8000;

/// Default push fanout (maximum minus one) for NetGroup fragments.
pub const DEFAULT_PUSH_LIMIT: u32 = 4;

/// Default interval between availability advertisements in milliseconds.
pub const DEFAULT_UPDATE_PERIOD_MS: u64 = 100;

/// Default NetGroup reassembly window duration in milliseconds.
pub const DEFAULT_WINDOW_DURATION_MS: u64 = 8000;

/// Default RTMFP port when the URI carries none.
pub const DEFAULT_PORT: u16 = 1935;

// =============================================================================
// PEER INPUT BOUNDS
// =============================================================================

/// Most sequences taken from a single availability advertisement; the
/// rest of an oversized advertisement is ignored.
pub const MAX_ADVERTISED_SEQUENCES: usize = 16384;

/// Fragments further than this past the reassembly cursor are dropped
/// as implausible.
pub const MAX_REASSEMBLY_HORIZON: u64 = 65536;

/// Most gap sequences reported per selective ack; later gaps surface
/// once earlier ones fill.
pub const MAX_REPORTED_GAP: u64 = 64;

/// Most ranges reported per selective ack; unreported tails are
/// re-acknowledged on the next data chunk.
pub const MAX_ACK_RANGES: usize = 32;

/// How long the responder replays an accepted keying reply to
/// retransmits of the same IIKeying.
pub const KEYING_REPLAY_INTERVAL: Duration = Duration::from_secs(64);

// =============================================================================
// WELL-KNOWN FLOWS
// =============================================================================

/// Session control flow (connect intents, stream open/accept/reject).
pub const CONTROL_FLOW_ID: u32 = 2;

/// First flow id assigned to media streams and group exchanges.
pub const FIRST_STREAM_FLOW_ID: u32 = 3;
