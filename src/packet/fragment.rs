//! Message fragments.

use crate::core::DecodeError;

/// Position of a fragment within its original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FragmentFlags {
    /// The message fit in one fragment.
    Whole = 0x00,
    /// First fragment of a split message.
    First = 0x01,
    /// Interior fragment.
    Middle = 0x02,
    /// Final fragment of a split message.
    Last = 0x03,
}

impl FragmentFlags {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0x00 => Ok(Self::Whole),
            0x01 => Ok(Self::First),
            0x02 => Ok(Self::Middle),
            0x03 => Ok(Self::Last),
            other => Err(DecodeError::UnknownChunk(other)),
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this fragment ends a message.
    pub fn ends_message(self) -> bool {
        matches!(self, Self::Whole | Self::Last)
    }
}

/// One sequence-numbered unit of a flow, carried in a single datagram.
///
/// Transient: lives until reassembled (inbound) or acknowledged
/// (outbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Owning flow.
    pub flow_id: u32,
    /// Per-flow sequence number, strictly increasing, never reused.
    pub sequence: u64,
    /// Position within the original message.
    pub flags: FragmentFlags,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Create a fragment.
    pub fn new(flow_id: u32, sequence: u64, flags: FragmentFlags, payload: Vec<u8>) -> Self {
        Self {
            flow_id,
            sequence,
            flags,
            payload,
        }
    }

    /// Wire size of this fragment's chunk body.
    pub fn body_len(&self) -> usize {
        4 + 8 + 1 + self.payload.len()
    }
}

/// Split a message into MTU-budgeted payload slices with their flags.
pub fn split_message(data: &[u8], max_payload: usize) -> Vec<(FragmentFlags, &[u8])> {
    debug_assert!(max_payload > 0);
    if data.len() <= max_payload {
        return vec![(FragmentFlags::Whole, data)];
    }
    let chunks: Vec<&[u8]> = data.chunks(max_payload).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, slice)| {
            let flags = if i == 0 {
                FragmentFlags::First
            } else if i == last {
                FragmentFlags::Last
            } else {
                FragmentFlags::Middle
            };
            (flags, slice)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_message_stays_whole() {
        let parts = split_message(b"abc", 10);
        assert_eq!(parts, vec![(FragmentFlags::Whole, &b"abc"[..])]);
    }

    #[test]
    fn split_flags_cover_first_middle_last() {
        let data = [0u8; 25];
        let parts = split_message(&data, 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].0, FragmentFlags::First);
        assert_eq!(parts[1].0, FragmentFlags::Middle);
        assert_eq!(parts[2].0, FragmentFlags::Last);
        assert_eq!(parts[2].1.len(), 5);
    }

    #[test]
    fn exact_multiple_has_no_middle() {
        let data = [0u8; 20];
        let parts = split_message(&data, 10);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, FragmentFlags::First);
        assert_eq!(parts[1].0, FragmentFlags::Last);
    }

    #[test]
    fn flag_byte_roundtrip() {
        for flags in [
            FragmentFlags::Whole,
            FragmentFlags::First,
            FragmentFlags::Middle,
            FragmentFlags::Last,
        ] {
            assert_eq!(FragmentFlags::from_byte(flags.as_byte()).unwrap(), flags);
        }
        assert!(FragmentFlags::from_byte(0x07).is_err());
    }
}
