//! Group membership and windowed fragment availability.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::core::MAX_ADVERTISED_SEQUENCES;
use crate::packet::AckRanges;

/// Sliding availability window.
///
/// Holds fragment sequences together with the instant they were observed
/// (or produced). Only entries younger than the window duration count as
/// available; older ones are stale and get evicted on every touch.
#[derive(Debug)]
pub struct FragmentWindow {
    duration: Duration,
    entries: BTreeMap<u64, Instant>,
}

impl FragmentWindow {
    /// Window over `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: BTreeMap::new(),
        }
    }

    /// Record a fragment sighting. Returns `false` when already present.
    ///
    /// A repeated sighting keeps the original timestamp: staleness is
    /// judged from when the fragment was first seen, so re-advertising
    /// cannot keep an old fragment alive forever.
    pub fn insert(&mut self, sequence: u64, now: Instant) -> bool {
        self.evict(now);
        let mut fresh = false;
        self.entries.entry(sequence).or_insert_with(|| {
            fresh = true;
            now
        });
        fresh
    }

    /// Merge an advertisement into the window, first-seen timestamps
    /// preserved. At most [`MAX_ADVERTISED_SEQUENCES`] sequences are
    /// taken per advertisement; wire ranges can claim arbitrarily wide
    /// spans, so the excess is ignored.
    pub fn merge(&mut self, ranges: &AckRanges, now: Instant) {
        self.evict(now);
        for seq in ranges.iter().take(MAX_ADVERTISED_SEQUENCES) {
            self.entries.entry(seq).or_insert(now);
        }
    }

    /// Whether `sequence` is present and still inside the window.
    pub fn contains(&self, sequence: u64, now: Instant) -> bool {
        self.entries
            .get(&sequence)
            .is_some_and(|&seen| now.duration_since(seen) < self.duration)
    }

    /// Drop entries older than the window.
    pub fn evict(&mut self, now: Instant) {
        let duration = self.duration;
        self.entries
            .retain(|_, &mut seen| now.duration_since(seen) < duration);
    }

    /// Live sequences as advertisement ranges.
    pub fn ranges(&mut self, now: Instant) -> AckRanges {
        self.evict(now);
        AckRanges::from_sequences(self.entries.keys().copied())
    }

    /// Live sequences, ascending.
    pub fn sequences(&mut self, now: Instant) -> Vec<u64> {
        self.evict(now);
        self.entries.keys().copied().collect()
    }

    /// Number of live entries (after eviction).
    pub fn len(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.entries.len()
    }

    /// True when nothing is live.
    pub fn is_empty(&mut self, now: Instant) -> bool {
        self.len(now) == 0
    }
}

/// One known group peer, keyed by its session id.
#[derive(Debug)]
pub struct GroupMember {
    /// Peer's advertised availability.
    pub availability: FragmentWindow,
    /// Last time the peer advertised anything.
    pub last_seen: Instant,
}

/// The set of known peers for one NetGroup.
#[derive(Debug)]
pub struct Membership {
    window_duration: Duration,
    members: HashMap<u32, GroupMember>,
}

impl Membership {
    /// Empty membership with the group's window duration.
    pub fn new(window_duration: Duration) -> Self {
        Self {
            window_duration,
            members: HashMap::new(),
        }
    }

    /// Add a peer (idempotent).
    pub fn add(&mut self, session_id: u32, now: Instant) {
        self.members.entry(session_id).or_insert_with(|| GroupMember {
            availability: FragmentWindow::new(self.window_duration),
            last_seen: now,
        });
    }

    /// Remove a peer.
    pub fn remove(&mut self, session_id: u32) {
        self.members.remove(&session_id);
    }

    /// Look up one peer.
    pub fn get_mut(&mut self, session_id: u32) -> Option<&mut GroupMember> {
        self.members.get_mut(&session_id)
    }

    /// Peer session ids, in stable (sorted) order.
    pub fn peer_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no peer is known.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(8000);

    #[test]
    fn window_boundary_is_exclusive() {
        let start = Instant::now();
        let mut w = FragmentWindow::new(WINDOW);
        w.insert(5, start);

        // One millisecond inside the window: still available.
        let just_inside = start + WINDOW - Duration::from_millis(1);
        assert!(w.contains(5, just_inside));

        // One millisecond past: stale, never to be requested.
        let just_outside = start + WINDOW + Duration::from_millis(1);
        assert!(!w.contains(5, just_outside));
    }

    #[test]
    fn eviction_drops_expired_entries() {
        let start = Instant::now();
        let mut w = FragmentWindow::new(WINDOW);
        w.insert(1, start);
        w.insert(2, start + WINDOW / 2);
        let later = start + WINDOW + Duration::from_millis(1);
        assert_eq!(w.sequences(later), vec![2]);
    }

    #[test]
    fn duplicate_insert_reports_false() {
        let now = Instant::now();
        let mut w = FragmentWindow::new(WINDOW);
        assert!(w.insert(1, now));
        assert!(!w.insert(1, now));
    }

    #[test]
    fn merge_preserves_first_seen_timestamps() {
        let start = Instant::now();
        let mut w = FragmentWindow::new(WINDOW);
        w.merge(&AckRanges::from_sequences([10, 11]), start);
        // Re-advertised half a window later; original timestamps stand.
        w.merge(&AckRanges::from_sequences([10, 11, 12]), start + WINDOW / 2);
        let past_first = start + WINDOW + Duration::from_millis(1);
        assert_eq!(w.sequences(past_first), vec![12]);
    }

    #[test]
    fn merge_bounds_a_hostile_advertisement() {
        let now = Instant::now();
        let mut w = FragmentWindow::new(WINDOW);
        // A wire-valid advertisement claiming every sequence ever.
        let adv = AckRanges::from_pairs(vec![(0, u64::MAX)]).unwrap();
        w.merge(&adv, now);
        assert_eq!(w.len(now), MAX_ADVERTISED_SEQUENCES);
    }

    #[test]
    fn membership_is_idempotent_and_sorted() {
        let now = Instant::now();
        let mut m = Membership::new(WINDOW);
        m.add(9, now);
        m.add(4, now);
        m.add(9, now);
        assert_eq!(m.len(), 2);
        assert_eq!(m.peer_ids(), vec![4, 9]);
        m.remove(4);
        assert_eq!(m.peer_ids(), vec![9]);
    }
}
