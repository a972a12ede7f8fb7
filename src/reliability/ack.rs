//! Outstanding-fragment tracking with selective acknowledgment.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::{Result, RtmfpError, MAX_RETRANSMITS};
use crate::packet::{AckRanges, Fragment};

/// A sent-but-unacknowledged fragment.
#[derive(Debug)]
struct PendingFragment {
    fragment: Fragment,
    first_sent: Instant,
    deadline: Instant,
    rto: Duration,
    retransmits: u32,
}

/// Outcome for one fragment cleared by an acknowledgment.
#[derive(Debug)]
pub struct AckedFragment {
    /// Acknowledged sequence.
    pub sequence: u64,
    /// Payload size, for backlog and window accounting.
    pub payload_len: usize,
    /// RTT sample; only present when the fragment was never
    /// retransmitted (Karn's algorithm).
    pub rtt_sample: Option<Duration>,
}

/// Per-flow acknowledgment tracker.
///
/// Acks are selective, so the tracker keeps exactly which sequences
/// remain outstanding in a sequence-keyed map, not a cumulative
/// high-water mark.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: BTreeMap<u64, PendingFragment>,
}

impl AckTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly sent fragment.
    pub fn track(&mut self, fragment: Fragment, now: Instant, rto: Duration) {
        self.pending.insert(
            fragment.sequence,
            PendingFragment {
                fragment,
                first_sent: now,
                deadline: now + rto,
                rto,
                retransmits: 0,
            },
        );
    }

    /// Clear every fragment covered by `ranges`.
    pub fn acknowledge(&mut self, ranges: &AckRanges, now: Instant) -> Vec<AckedFragment> {
        let covered: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .filter(|&seq| ranges.contains(seq))
            .collect();
        covered
            .into_iter()
            .map(|seq| {
                let entry = self.pending.remove(&seq).expect("key from map");
                AckedFragment {
                    sequence: seq,
                    payload_len: entry.fragment.payload.len(),
                    rtt_sample: (entry.retransmits == 0)
                        .then(|| now.duration_since(entry.first_sent)),
                }
            })
            .collect()
    }

    /// Collect fragments whose retransmission timer expired, doubling
    /// each one's timeout for the next round.
    ///
    /// Fails with [`RtmfpError::DeliveryFailed`] as soon as any fragment
    /// would exceed [`MAX_RETRANSMITS`]; the owning session must close.
    pub fn due_retransmits(&mut self, now: Instant) -> Result<Vec<Fragment>> {
        let mut out = Vec::new();
        for entry in self.pending.values_mut() {
            if now < entry.deadline {
                continue;
            }
            if entry.retransmits >= MAX_RETRANSMITS {
                return Err(RtmfpError::DeliveryFailed);
            }
            entry.retransmits += 1;
            entry.rto *= 2;
            entry.deadline = now + entry.rto;
            out.push(entry.fragment.clone());
        }
        Ok(out)
    }

    /// Fast retransmission for sequences a receiver reported missing.
    /// Does not touch the retry budget deadline logic beyond counting.
    pub fn retransmit_requested(&mut self, sequences: &[u64], now: Instant) -> Vec<Fragment> {
        let mut out = Vec::new();
        for seq in sequences {
            if let Some(entry) = self.pending.get_mut(seq) {
                if entry.retransmits >= MAX_RETRANSMITS {
                    continue;
                }
                entry.retransmits += 1;
                entry.deadline = now + entry.rto;
                out.push(entry.fragment.clone());
            }
        }
        out
    }

    /// Number of outstanding fragments.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Bytes outstanding, for congestion window gating.
    pub fn outstanding_bytes(&self) -> usize {
        self.pending
            .values()
            .map(|p| p.fragment.payload.len())
            .sum()
    }

    /// Earliest pending deadline, for timer scheduling.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Highest retransmit count among outstanding fragments.
    pub fn max_retransmits_used(&self) -> u32 {
        self.pending.values().map(|p| p.retransmits).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FragmentFlags;

    fn frag(seq: u64, len: usize) -> Fragment {
        Fragment::new(3, seq, FragmentFlags::Whole, vec![0u8; len])
    }

    const RTO: Duration = Duration::from_millis(100);

    #[test]
    fn selective_ack_clears_exactly_the_covered_set() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        for seq in 1..=6 {
            tracker.track(frag(seq, 10), now, RTO);
        }
        let acked = tracker.acknowledge(&AckRanges::from_sequences([1, 2, 5]), now);
        let seqs: Vec<u64> = acked.iter().map(|a| a.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 5]);
        assert_eq!(tracker.outstanding(), 3); // 3, 4, 6 remain
    }

    #[test]
    fn rtt_sample_only_for_clean_acks() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.track(frag(1, 10), now, RTO);
        tracker.track(frag(2, 10), now, RTO);
        // Fragment 1 gets retransmitted before its ack arrives.
        let due = tracker.due_retransmits(now + RTO).unwrap();
        assert_eq!(due.len(), 2);
        tracker.track(frag(3, 10), now, RTO);

        let acked =
            tracker.acknowledge(&AckRanges::from_sequences([1, 3]), now + Duration::from_millis(50));
        let one = acked.iter().find(|a| a.sequence == 1).unwrap();
        let three = acked.iter().find(|a| a.sequence == 3).unwrap();
        assert!(one.rtt_sample.is_none());
        assert!(three.rtt_sample.is_some());
    }

    #[test]
    fn retransmit_budget_is_enforced_deterministically() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.track(frag(1, 10), now, RTO);

        let mut at = now;
        let mut rto = RTO;
        for round in 1..=MAX_RETRANSMITS {
            at += rto;
            let due = tracker.due_retransmits(at).unwrap();
            assert_eq!(due.len(), 1, "round {round}");
            rto *= 2;
        }
        assert_eq!(tracker.max_retransmits_used(), MAX_RETRANSMITS);
        at += rto;
        let err = tracker.due_retransmits(at).unwrap_err();
        assert!(matches!(err, RtmfpError::DeliveryFailed));
    }

    #[test]
    fn backoff_doubles_per_retransmission() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.track(frag(1, 10), now, RTO);
        tracker.due_retransmits(now + RTO).unwrap();
        // Deadline is now + 2*RTO; nothing due before it.
        assert!(tracker
            .due_retransmits(now + RTO + RTO / 2)
            .unwrap()
            .is_empty());
        assert_eq!(tracker.due_retransmits(now + RTO * 3).unwrap().len(), 1);
    }

    #[test]
    fn requested_retransmits_resend_pending_only() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.track(frag(2, 10), now, RTO);
        let out = tracker.retransmit_requested(&[1, 2, 3], now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 2);
    }

    #[test]
    fn outstanding_bytes_track_payload_sizes() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.track(frag(1, 100), now, RTO);
        tracker.track(frag(2, 50), now, RTO);
        assert_eq!(tracker.outstanding_bytes(), 150);
        tracker.acknowledge(&AckRanges::from_sequences([1]), now);
        assert_eq!(tracker.outstanding_bytes(), 50);
    }
}
