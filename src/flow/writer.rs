//! Outbound fragmentation and backlog accounting.

use crate::core::{Result, RtmfpError, MAX_FRAGMENT_PAYLOAD};
use crate::packet::{split_message, Fragment};

use super::reassembly::FIRST_SEQUENCE;

/// Sending half of a flow.
///
/// Chunks submissions into MTU-budgeted fragments with strictly
/// increasing, never-reused sequence numbers, and bounds the
/// unacknowledged backlog: a write that would exceed the bound fails
/// with [`RtmfpError::BufferExhausted`] instead of blocking forever.
#[derive(Debug)]
pub struct FlowWriter {
    flow_id: u32,
    next_sequence: u64,
    in_flight_bytes: usize,
    max_backlog_bytes: usize,
    max_payload: usize,
}

impl FlowWriter {
    /// Create a writer; `max_backlog_bytes` derives from the configured
    /// socket send size.
    pub fn new(flow_id: u32, max_backlog_bytes: usize) -> Self {
        Self {
            flow_id,
            next_sequence: FIRST_SEQUENCE,
            in_flight_bytes: 0,
            max_backlog_bytes,
            max_payload: MAX_FRAGMENT_PAYLOAD,
        }
    }

    /// Owning flow id.
    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Fragment one message.
    pub fn write(&mut self, data: &[u8]) -> Result<Vec<Fragment>> {
        if self.in_flight_bytes + data.len() > self.max_backlog_bytes {
            return Err(RtmfpError::BufferExhausted);
        }
        self.in_flight_bytes += data.len();

        let fragments = split_message(data, self.max_payload)
            .into_iter()
            .map(|(flags, slice)| {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                Fragment::new(self.flow_id, seq, flags, slice.to_vec())
            })
            .collect();
        Ok(fragments)
    }

    /// Release backlog once a fragment's bytes were acknowledged.
    pub fn on_acknowledged(&mut self, payload_len: usize) {
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(payload_len);
    }

    /// Next sequence the writer will assign.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Bytes written but not yet acknowledged.
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FragmentFlags;

    #[test]
    fn sequences_are_strictly_increasing_and_never_reused() {
        let mut w = FlowWriter::new(3, 1 << 20);
        let mut last = 0;
        for _ in 0..10 {
            for fragment in w.write(&[0u8; 3000]).unwrap() {
                assert!(fragment.sequence > last);
                last = fragment.sequence;
            }
        }
        assert_eq!(w.next_sequence(), last + 1);
    }

    #[test]
    fn large_message_is_fragmented_to_budget() {
        let mut w = FlowWriter::new(3, 1 << 20);
        let fragments = w.write(&vec![7u8; MAX_FRAGMENT_PAYLOAD * 2 + 10]).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].flags, FragmentFlags::First);
        assert_eq!(fragments[2].flags, FragmentFlags::Last);
        assert!(fragments.iter().all(|f| f.payload.len() <= MAX_FRAGMENT_PAYLOAD));
    }

    #[test]
    fn backlog_bound_fails_fast() {
        let mut w = FlowWriter::new(3, 100);
        w.write(&[0u8; 80]).unwrap();
        assert!(matches!(
            w.write(&[0u8; 30]),
            Err(RtmfpError::BufferExhausted)
        ));
        // Acks drain the backlog and writing resumes.
        w.on_acknowledged(80);
        assert!(w.write(&[0u8; 30]).is_ok());
        assert_eq!(w.in_flight_bytes(), 30);
    }
}
