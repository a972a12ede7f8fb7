//! Per-flow reassembly of out-of-order fragments.

use std::collections::BTreeMap;

use crate::core::{MAX_ACK_RANGES, MAX_REASSEMBLY_HORIZON, MAX_REPORTED_GAP};
use crate::packet::{AckRanges, Fragment, FragmentFlags};

/// First sequence number used on any flow (zero is reserved).
pub const FIRST_SEQUENCE: u64 = 1;

/// Reassembly buffer for one flow.
///
/// Buffers out-of-order fragments keyed by sequence number, deduplicates
/// redeliveries, and yields contiguous in-order data. Bytes cross the
/// delivery boundary exactly once.
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Lowest sequence not yet delivered.
    next_expected: u64,
    /// Out-of-order fragments waiting for the gap to fill.
    pending: BTreeMap<u64, (FragmentFlags, Vec<u8>)>,
    /// Highest sequence ever seen, for gap reporting.
    max_seen: u64,
}

impl Reassembler {
    /// Empty buffer expecting [`FIRST_SEQUENCE`].
    pub fn new() -> Self {
        Self {
            next_expected: FIRST_SEQUENCE,
            pending: BTreeMap::new(),
            max_seen: 0,
        }
    }

    /// Insert a received fragment.
    ///
    /// Returns `false` for duplicates (already delivered or already
    /// buffered); such fragments are dropped, preserving exactly-once
    /// delivery. Sequences more than [`MAX_REASSEMBLY_HORIZON`] past the
    /// delivery cursor are dropped too.
    pub fn insert(&mut self, fragment: Fragment) -> bool {
        let seq = fragment.sequence;
        if seq < self.next_expected || self.pending.contains_key(&seq) {
            return false;
        }
        if seq > self.next_expected.saturating_add(MAX_REASSEMBLY_HORIZON) {
            return false;
        }
        self.max_seen = self.max_seen.max(seq);
        self.pending.insert(seq, (fragment.flags, fragment.payload));
        true
    }

    /// Drain the next contiguous run of in-order bytes (byte-stream mode).
    ///
    /// Returns an empty vector when the head of the flow is still missing.
    pub fn pop_bytes(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(entry) = self.pending.remove(&self.next_expected) {
            out.extend_from_slice(&entry.1);
            self.next_expected += 1;
        }
        out
    }

    /// Drain one complete message (message mode, control flows).
    ///
    /// A message ends at a `Whole` or `Last` fragment; partial prefixes
    /// stay buffered until the terminator arrives in order.
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        // Find the in-order terminator first; only then consume.
        let mut end = None;
        let mut cursor = self.next_expected;
        while let Some((flags, _)) = self.pending.get(&cursor) {
            if flags.ends_message() {
                end = Some(cursor);
                break;
            }
            cursor += 1;
        }
        let end = end?;

        let mut out = Vec::new();
        for seq in self.next_expected..=end {
            let (_, payload) = self.pending.remove(&seq).expect("contiguous run");
            out.extend_from_slice(&payload);
        }
        self.next_expected = end + 1;
        Some(out)
    }

    /// Sequences received so far (delivered prefix plus buffered), as
    /// selective-ack ranges, capped at [`MAX_ACK_RANGES`] ranges.
    pub fn ack_ranges(&self) -> AckRanges {
        let mut seqs: Vec<u64> = self.pending.keys().copied().collect();
        seqs.extend(FIRST_SEQUENCE..self.next_expected);
        let mut ranges = AckRanges::from_sequences(seqs);
        ranges.truncate(MAX_ACK_RANGES);
        ranges
    }

    /// Sequences missing below the highest seen one; these gaps drive
    /// selective-repeat requests instead of full retransmission. The
    /// report covers at most [`MAX_REPORTED_GAP`] sequences past the
    /// delivery cursor.
    pub fn missing(&self) -> Vec<u64> {
        let limit = self
            .max_seen
            .min(self.next_expected.saturating_add(MAX_REPORTED_GAP));
        (self.next_expected..=limit)
            .filter(|seq| !self.pending.contains_key(seq))
            .collect()
    }

    /// Lowest undelivered sequence.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Bytes currently buffered out of order.
    pub fn buffered_bytes(&self) -> usize {
        self.pending.values().map(|(_, p)| p.len()).sum()
    }
}
