//! Error types for the RTMFP engine.

use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, RtmfpError>;

/// Top-level error taxonomy surfaced by every public operation.
///
/// Transient packet loss never surfaces here; it is absorbed by
/// retransmission and selective acknowledgment. Congestion shrinks the
/// send window instead of failing. Mid-session failures close the owning
/// session and show up on the next read or write.
#[derive(Debug, Error)]
pub enum RtmfpError {
    /// The target host name did not resolve to a usable address.
    #[error("address unresolvable: {0}")]
    AddressUnresolvable(String),

    /// The handshake retry budget was exhausted without a response.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote answered the handshake with a refusal.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The outbound fragment backlog exceeded its configured bound.
    #[error("send buffer exhausted")]
    BufferExhausted,

    /// A fragment exceeded its retransmission budget; the session is closed.
    #[error("delivery failed: retransmission budget exhausted")]
    DeliveryFailed,

    /// The caller-supplied interrupt predicate fired during a blocking wait.
    #[error("interrupted by caller")]
    Interrupted,

    /// The remote refused the publish/play stream name.
    #[error("stream rejected: {0}")]
    StreamRejected(String),

    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for RtmfpError {
    fn clone(&self) -> Self {
        match self {
            Self::AddressUnresolvable(s) => Self::AddressUnresolvable(s.clone()),
            Self::HandshakeTimeout => Self::HandshakeTimeout,
            Self::HandshakeRejected(s) => Self::HandshakeRejected(s.clone()),
            Self::BufferExhausted => Self::BufferExhausted,
            Self::DeliveryFailed => Self::DeliveryFailed,
            Self::Interrupted => Self::Interrupted,
            Self::StreamRejected(s) => Self::StreamRejected(s.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Errors local to wire format decoding.
///
/// Decode failures on inbound datagrams are logged and the datagram is
/// dropped; they never tear down a session on their own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Datagram or chunk shorter than its declared layout.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown chunk type byte.
    #[error("unknown chunk type: {0:#04x}")]
    UnknownChunk(u8),

    /// A declared length field exceeds the remaining bytes.
    #[error("invalid length field")]
    InvalidLength,

    /// AEAD tag verification failed (corrupted or foreign datagram).
    #[error("datagram authentication failed")]
    AuthFailed,
}
