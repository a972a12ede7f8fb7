//! Wire format: datagram framing and chunk codec.
//!
//! A datagram is a 4-byte session id followed by a chunk stream. Session
//! id zero marks plaintext handshake traffic; any other id selects an
//! established session whose chunk stream is AEAD-encrypted under the
//! session keys with a per-datagram nonce counter (see
//! [`crate::handshake::SessionKeys`]).
//!
//! ```text
//! +-------------+----------------------------------------+
//! | session id  | chunk | chunk | ...                    |   (id == 0)
//! +-------------+----------------------------------------+
//! | session id  | nonce counter | AEAD(chunk stream)     |   (id != 0)
//! +-------------+----------------------------------------+
//! ```
//!
//! Each chunk is `[type u8][length u16 BE][body]`.

mod chunk;
mod fragment;

pub use chunk::{AckRanges, Chunk, ChunkReader, ChunkWriter};
pub use fragment::{split_message, Fragment, FragmentFlags};

use crate::core::{DecodeError, SESSION_ID_SIZE};

/// Split a raw datagram into its session id and chunk-stream bytes.
pub fn split_datagram(data: &[u8]) -> Result<(u32, &[u8]), DecodeError> {
    if data.len() < SESSION_ID_SIZE {
        return Err(DecodeError::UnexpectedEof);
    }
    let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Ok((id, &data[SESSION_ID_SIZE..]))
}

/// Prepend a session id to a chunk stream.
pub fn frame_datagram(session_id: u32, chunks: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SESSION_ID_SIZE + chunks.len());
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(chunks);
    out
}
