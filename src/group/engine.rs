//! NetGroup engine: push/pull fragment distribution among peers.
//!
//! A pure, time-parameterized state machine. The session engine feeds it
//! inbound group chunks and clock ticks; it answers with actions (what
//! to send to which peer, what to deliver to the application, whether to
//! start or stop the unicast fallback). Keeping it free of sockets and
//! tasks is what makes the window/fanout/fallback properties unit
//! testable.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::config::GroupConfig;
use crate::packet::AckRanges;
use crate::reliability::CongestionWindow;

use super::fallback::{FallbackAction, FallbackState};
use super::membership::{FragmentWindow, Membership};

/// Re-request a pulled fragment if it has not arrived within this long.
const PULL_TIMEOUT: Duration = Duration::from_millis(1000);

/// A pushed fragment not advertised back by the peer within this long
/// counts as lost for the peer link's rate control.
const PUSH_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Most fragments requested from a peer in one pull; the rest waits for
/// the next advertisement.
const PULL_BATCH_LIMIT: usize = 128;

/// Most ranges carried in one availability advertisement.
const ADVERTISE_RANGE_LIMIT: usize = 64;

/// Local membership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Joined, waiting for delivery to start.
    Joining,
    /// Fragments are flowing in order.
    Active,
    /// Leave requested, teardown in progress.
    Leaving,
    /// Fully departed; terminal.
    Left,
}

/// One thing the session engine must do on the group's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Advertise local availability to a peer.
    Advertise {
        /// Target peer session.
        peer: u32,
        /// Locally available sequences.
        ranges: AckRanges,
    },
    /// Request missing fragments from a peer.
    Pull {
        /// Source peer session.
        peer: u32,
        /// Sequences to request.
        sequences: Vec<u64>,
    },
    /// Send a fragment to a peer.
    Push {
        /// Target peer session.
        peer: u32,
        /// Group-wide fragment sequence.
        sequence: u64,
        /// Fragment bytes.
        payload: Vec<u8>,
    },
    /// Hand bytes to the application stream, in group-sequence order.
    Deliver {
        /// Delivered sequence.
        sequence: u64,
        /// Fragment bytes.
        payload: Vec<u8>,
    },
    /// Open the unicast fallback play session.
    StartFallback(String),
    /// Close the unicast fallback session (exactly once).
    StopFallback,
}

/// Rate-control state for one peer link.
///
/// Group pushes ride outside the flow ack machinery; a push counts as
/// delivered once the peer advertises the sequence back, and as lost
/// when no advertisement arrives within [`PUSH_ACK_TIMEOUT`].
#[derive(Debug)]
struct PeerLink {
    window: CongestionWindow,
    in_flight: usize,
    pushed: Vec<(u64, usize, Instant)>,
}

/// Peer-to-peer multicast group engine.
#[derive(Debug)]
pub struct GroupEngine {
    id: String,
    config: GroupConfig,
    publisher: bool,
    state: GroupState,

    /// Local fragment store, windowed: payloads kept to serve pulls.
    store: BTreeMap<u64, (Instant, Vec<u8>)>,
    /// Availability mirror of the store (windowing logic shared with
    /// peer windows).
    local_window: FragmentWindow,
    membership: Membership,
    links: HashMap<u32, PeerLink>,

    /// Outstanding pull requests: sequence -> (peer, requested at).
    pending_pulls: HashMap<u64, (u32, Instant)>,

    next_local_sequence: u64,
    next_advertise: Instant,

    /// In-order delivery cursor; `None` until the first fragment lands.
    next_deliver: Option<u64>,
    stalled_since: Option<Instant>,

    fallback: FallbackState,
}

impl GroupEngine {
    /// Join (or create) a group.
    pub fn new(id: String, config: GroupConfig, publisher: bool, now: Instant) -> Self {
        let fallback = FallbackState::new(&config, now);
        let window_duration = config.window_duration;
        let next_advertise = now + config.update_period;
        Self {
            id,
            config,
            publisher,
            state: GroupState::Joining,
            store: BTreeMap::new(),
            local_window: FragmentWindow::new(window_duration),
            membership: Membership::new(window_duration),
            links: HashMap::new(),
            pending_pulls: HashMap::new(),
            next_local_sequence: 1,
            next_advertise,
            next_deliver: None,
            stalled_since: None,
            fallback,
        }
    }

    /// Group identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Whether this member publishes into the group.
    pub fn is_publisher(&self) -> bool {
        self.publisher
    }

    /// The group stream was opened for writing.
    pub fn mark_publisher(&mut self) {
        self.publisher = true;
    }

    /// A peer session joined the group.
    pub fn add_peer(&mut self, peer: u32, now: Instant) {
        self.membership.add(peer, now);
        self.links.entry(peer).or_insert_with(|| PeerLink {
            window: CongestionWindow::new(self.config.disable_rate_control),
            in_flight: 0,
            pushed: Vec::new(),
        });
    }

    /// A peer session left or died.
    pub fn remove_peer(&mut self, peer: u32) {
        self.membership.remove(peer);
        self.links.remove(&peer);
        self.pending_pulls.retain(|_, &mut (p, _)| p != peer);
    }

    /// Known peer count.
    pub fn peer_count(&self) -> usize {
        self.membership.len()
    }

    /// Known peer session ids, sorted.
    pub fn peer_ids(&self) -> Vec<u32> {
        self.membership.peer_ids()
    }

    /// The publisher produced a new fragment: store it and push it to at
    /// most `push_limit` peers (the limit excludes the local peer).
    pub fn publish_fragment(&mut self, payload: Vec<u8>, now: Instant) -> Vec<GroupAction> {
        let sequence = self.next_local_sequence;
        self.next_local_sequence += 1;
        self.store_fragment(sequence, payload.clone(), now);

        let mut actions = Vec::new();
        let mut fanout = 0;
        for peer in self.membership.peer_ids() {
            if fanout >= self.config.push_limit {
                break;
            }
            if self.link_can_send(peer, payload.len()) {
                self.link_sent(peer, sequence, payload.len(), now);
                actions.push(GroupAction::Push {
                    peer,
                    sequence,
                    payload: payload.clone(),
                });
                fanout += 1;
            }
        }
        actions
    }

    /// A peer advertised its availability.
    pub fn on_availability(&mut self, peer: u32, ranges: &AckRanges, now: Instant) -> Vec<GroupAction> {
        self.membership.add(peer, now);
        self.expire_pending_pulls(now);

        // Advertised sequences we pushed to this peer count as delivered.
        if let Some(link) = self.links.get_mut(&peer) {
            link.pushed.retain(|&(seq, bytes, _)| {
                if ranges.contains(seq) {
                    link.in_flight = link.in_flight.saturating_sub(bytes);
                    link.window.on_ack(bytes);
                    false
                } else {
                    true
                }
            });
        }

        // Decide what to pull: advertised, still inside the window,
        // not already held, not already on order.
        let candidates = match self.membership.get_mut(peer) {
            Some(member) => {
                member.last_seen = now;
                member.availability.merge(ranges, now);
                member.availability.sequences(now)
            }
            None => return Vec::new(),
        };
        let mut wanted: Vec<u64> = candidates
            .into_iter()
            .filter(|seq| !self.store.contains_key(seq) && !self.pending_pulls.contains_key(seq))
            .filter(|seq| self.next_deliver.map_or(true, |next| *seq >= next))
            .collect();
        wanted.truncate(PULL_BATCH_LIMIT);
        if wanted.is_empty() {
            return Vec::new();
        }
        for &seq in &wanted {
            self.pending_pulls.insert(seq, (peer, now));
        }
        vec![GroupAction::Pull {
            peer,
            sequences: wanted,
        }]
    }

    /// A peer pushed a fragment (proactively or answering a pull).
    pub fn on_fragment(
        &mut self,
        peer: u32,
        sequence: u64,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<GroupAction> {
        self.membership.add(peer, now);
        self.pending_pulls.remove(&sequence);
        if self.store.contains_key(&sequence) {
            return Vec::new(); // duplicate
        }
        self.store_fragment(sequence, payload, now);
        self.drain_deliverable(now)
    }

    /// A peer asked for fragments we advertised.
    pub fn on_pull(&mut self, peer: u32, sequences: &[u64], now: Instant) -> Vec<GroupAction> {
        self.membership.add(peer, now);
        let mut actions = Vec::new();
        for &sequence in sequences {
            let Some((_, payload)) = self.store.get(&sequence) else {
                continue;
            };
            let payload = payload.clone();
            if self.link_can_send(peer, payload.len()) {
                self.link_sent(peer, sequence, payload.len(), now);
                actions.push(GroupAction::Push {
                    peer,
                    sequence,
                    payload,
                });
            }
        }
        actions
    }

    /// Periodic work: availability advertisements, window eviction,
    /// delivery stall recovery, fallback trigger.
    pub fn tick(&mut self, now: Instant) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        if self.state == GroupState::Left || self.state == GroupState::Leaving {
            return actions;
        }

        self.evict(now);
        self.expire_pending_pulls(now);

        // Pushes that never came back as availability count as losses.
        for link in self.links.values_mut() {
            link.pushed.retain(|&(_, bytes, at)| {
                if now.duration_since(at) >= PUSH_ACK_TIMEOUT {
                    link.in_flight = link.in_flight.saturating_sub(bytes);
                    link.window.on_loss();
                    false
                } else {
                    true
                }
            });
        }

        if now >= self.next_advertise {
            self.next_advertise = now + self.config.update_period;
            let mut ranges = self.local_window.ranges(now);
            ranges.truncate(ADVERTISE_RANGE_LIMIT);
            if !ranges.is_empty() {
                for peer in self.membership.peer_ids() {
                    actions.push(GroupAction::Advertise {
                        peer,
                        ranges: ranges.clone(),
                    });
                }
            }
        }

        // A delivery head that stayed missing for a full window is
        // considered lost for good; jump past it.
        if let (Some(next), Some(stalled)) = (self.next_deliver, self.stalled_since) {
            if now.duration_since(stalled) >= self.config.window_duration {
                if let Some((&skip_to, _)) = self.store.range(next..).next() {
                    self.next_deliver = Some(skip_to);
                    self.stalled_since = None;
                    actions.extend(self.drain_deliverable(now));
                }
            }
        }

        // The fallback substitutes for a group subscription; a publisher
        // has nothing to play.
        if !self.publisher {
            match self.fallback.tick(now, self.state == GroupState::Active) {
                Some(FallbackAction::Start(url)) => actions.push(GroupAction::StartFallback(url)),
                Some(FallbackAction::Stop) => actions.push(GroupAction::StopFallback),
                None => {}
            }
        }

        actions
    }

    /// Begin leaving the group; no further actions will be produced.
    pub fn leave(&mut self) {
        if self.state != GroupState::Left {
            self.state = GroupState::Leaving;
        }
    }

    /// Teardown complete.
    pub fn finish_leave(&mut self) {
        self.state = GroupState::Left;
    }

    fn store_fragment(&mut self, sequence: u64, payload: Vec<u8>, now: Instant) {
        self.store.insert(sequence, (now, payload));
        self.local_window.insert(sequence, now);
    }

    fn drain_deliverable(&mut self, now: Instant) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        if self.next_deliver.is_none() {
            // First fragment ever decides where delivery starts.
            self.next_deliver = self.store.keys().next().copied();
        }
        let Some(mut next) = self.next_deliver else {
            return actions;
        };
        while let Some((_, payload)) = self.store.get(&next) {
            actions.push(GroupAction::Deliver {
                sequence: next,
                payload: payload.clone(),
            });
            next += 1;
        }
        self.next_deliver = Some(next);

        if !actions.is_empty() {
            self.stalled_since = None;
            if self.state == GroupState::Joining {
                self.state = GroupState::Active;
            }
        } else if self.stalled_since.is_none() {
            self.stalled_since = Some(now);
        }
        actions
    }

    fn evict(&mut self, now: Instant) {
        let window = self.config.window_duration;
        self.store
            .retain(|_, &mut (seen, _)| now.duration_since(seen) < window);
        self.local_window.evict(now);
    }

    fn expire_pending_pulls(&mut self, now: Instant) {
        self.pending_pulls
            .retain(|_, &mut (_, at)| now.duration_since(at) < PULL_TIMEOUT);
    }

    fn link_can_send(&mut self, peer: u32, bytes: usize) -> bool {
        self.links
            .get(&peer)
            .map(|link| link.window.can_send(link.in_flight, bytes))
            .unwrap_or(false)
    }

    fn link_sent(&mut self, peer: u32, sequence: u64, bytes: usize, now: Instant) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.in_flight += bytes;
            link.pushed.push((sequence, bytes, now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(8000);

    fn config() -> GroupConfig {
        GroupConfig::default()
    }

    fn engine_with_peers(publisher: bool, peers: u32, now: Instant) -> GroupEngine {
        let mut g = GroupEngine::new("G:test".into(), config(), publisher, now);
        for peer in 1..=peers {
            g.add_peer(peer, now);
        }
        g
    }

    fn push_targets(actions: &[GroupAction]) -> Vec<u32> {
        actions
            .iter()
            .filter_map(|a| match a {
                GroupAction::Push { peer, .. } => Some(*peer),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn push_fanout_never_exceeds_push_limit() {
        let now = Instant::now();
        // 10 peers, default push limit 4.
        let mut g = engine_with_peers(true, 10, now);
        let actions = g.publish_fragment(vec![1, 2, 3], now);
        let targets = push_targets(&actions);
        assert_eq!(targets.len(), 4);
        // Deterministic peer order.
        assert_eq!(targets, vec![1, 2, 3, 4]);
    }

    #[test]
    fn push_respects_smaller_peer_set() {
        let now = Instant::now();
        let mut g = engine_with_peers(true, 2, now);
        let actions = g.publish_fragment(vec![0; 8], now);
        assert_eq!(push_targets(&actions).len(), 2);
    }

    #[test]
    fn stale_fragments_are_never_pulled() {
        let t0 = Instant::now();
        let mut g = engine_with_peers(false, 1, t0);

        // Peer advertises sequence 5 at t0.
        let adv = AckRanges::from_sequences([5]);
        let actions = g.on_availability(1, &adv, t0);
        assert_eq!(
            actions,
            vec![GroupAction::Pull {
                peer: 1,
                sequences: vec![5]
            }]
        );

        // Same advertisement re-seen one millisecond before expiry:
        // still pullable (the previous pull timed out long ago).
        let just_inside = t0 + WINDOW - Duration::from_millis(1);
        let actions = g.on_availability(1, &adv, just_inside);
        assert_eq!(
            actions,
            vec![GroupAction::Pull {
                peer: 1,
                sequences: vec![5]
            }]
        );

        // One millisecond past the window: stale, never requested.
        let just_outside = t0 + WINDOW + Duration::from_millis(1);
        let actions = g.on_availability(1, &adv, just_outside);
        assert!(actions.is_empty());
    }

    #[test]
    fn fragments_deliver_in_order_despite_arrival_order() {
        let now = Instant::now();
        let mut g = engine_with_peers(false, 1, now);

        assert!(g.on_fragment(1, 2, b"B".to_vec(), now).is_empty());
        let actions = g.on_fragment(1, 1, b"A".to_vec(), now);
        let delivered: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                GroupAction::Deliver { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2]);
        assert_eq!(g.state(), GroupState::Active);
    }

    #[test]
    fn duplicate_fragment_is_dropped() {
        let now = Instant::now();
        let mut g = engine_with_peers(false, 1, now);
        assert_eq!(g.on_fragment(1, 1, b"A".to_vec(), now).len(), 1);
        assert!(g.on_fragment(1, 1, b"A".to_vec(), now).is_empty());
    }

    #[test]
    fn availability_is_advertised_every_update_period() {
        let now = Instant::now();
        let mut g = engine_with_peers(true, 2, now);
        g.publish_fragment(b"x".to_vec(), now);

        // Before the period: nothing.
        assert!(g
            .tick(now + Duration::from_millis(50))
            .iter()
            .all(|a| !matches!(a, GroupAction::Advertise { .. })));

        let actions = g.tick(now + Duration::from_millis(100));
        let adverts: Vec<&GroupAction> = actions
            .iter()
            .filter(|a| matches!(a, GroupAction::Advertise { .. }))
            .collect();
        assert_eq!(adverts.len(), 2); // one per peer
    }

    #[test]
    fn fallback_starts_then_stops_once_group_goes_active() {
        let now = Instant::now();
        let cfg = GroupConfig {
            fallback_url: Some("rtmfp://backup/live/s".into()),
            fallback_timeout: Duration::from_millis(1000),
            ..GroupConfig::default()
        };
        let mut g = GroupEngine::new("G:test".into(), cfg, false, now);
        g.add_peer(1, now);

        let actions = g.tick(now + Duration::from_millis(1000));
        assert!(actions.contains(&GroupAction::StartFallback("rtmfp://backup/live/s".into())));

        // Delivery starts; the group becomes active.
        g.on_fragment(1, 1, b"A".to_vec(), now + Duration::from_millis(1500));
        let actions = g.tick(now + Duration::from_millis(1600));
        assert!(actions.contains(&GroupAction::StopFallback));
        // Exactly once.
        let actions = g.tick(now + Duration::from_millis(1700));
        assert!(!actions.contains(&GroupAction::StopFallback));
    }

    #[test]
    fn stalled_delivery_skips_past_a_dead_gap() {
        let now = Instant::now();
        let mut g = engine_with_peers(false, 1, now);
        g.on_fragment(1, 1, b"A".to_vec(), now); // delivers 1, cursor at 2
        let gap_seen = now + Duration::from_millis(100);
        g.on_fragment(1, 4, b"D".to_vec(), gap_seen); // gap at 2..3 stalls
        let later = gap_seen + Duration::from_millis(4000);
        g.on_fragment(1, 5, b"E".to_vec(), later);

        // A full window after the stall began, the head of the gap is
        // stale anyway; delivery jumps to whatever is still live.
        let actions = g.tick(gap_seen + WINDOW);
        let delivered: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                GroupAction::Deliver { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![5]);
    }

    #[test]
    fn push_gate_reopens_when_peer_advertises_receipt() {
        let now = Instant::now();
        let cfg = GroupConfig {
            push_limit: 1,
            ..GroupConfig::default()
        };
        let mut g = GroupEngine::new("G:test".into(), cfg, true, now);
        g.add_peer(1, now);

        // The initial link window admits four full segments.
        for _ in 0..4 {
            let actions = g.publish_fragment(vec![0; 1200], now);
            assert_eq!(push_targets(&actions).len(), 1);
        }
        assert!(push_targets(&g.publish_fragment(vec![0; 1200], now)).is_empty());

        // Peer advertises what it received; the link drains and reopens.
        g.on_availability(1, &AckRanges::from_sequences(1..=4), now);
        let actions = g.publish_fragment(vec![0; 1200], now);
        assert_eq!(push_targets(&actions).len(), 1);
    }

    #[test]
    fn pull_served_from_store() {
        let now = Instant::now();
        let mut g = engine_with_peers(true, 1, now);
        g.publish_fragment(b"abc".to_vec(), now);
        let actions = g.on_pull(1, &[1, 99], now);
        assert_eq!(
            actions,
            vec![GroupAction::Push {
                peer: 1,
                sequence: 1,
                payload: b"abc".to_vec()
            }]
        );
    }

    #[test]
    fn pulls_are_batched() {
        let now = Instant::now();
        let mut g = engine_with_peers(false, 1, now);
        // A wire-valid advertisement spanning far more than one batch.
        let adv = AckRanges::from_pairs(vec![(1, 100_000)]).unwrap();
        let actions = g.on_availability(1, &adv, now);
        match &actions[..] {
            [GroupAction::Pull { sequences, .. }] => {
                assert_eq!(sequences.len(), PULL_BATCH_LIMIT);
                assert_eq!(sequences[0], 1);
            }
            other => panic!("expected one pull, got {other:?}"),
        }
    }

    #[test]
    fn leave_quiesces_and_terminates() {
        let now = Instant::now();
        let mut g = engine_with_peers(true, 2, now);
        g.publish_fragment(b"x".to_vec(), now);

        g.leave();
        assert_eq!(g.state(), GroupState::Leaving);
        // No advertisements, pushes or fallback moves while departing.
        assert!(g.tick(now + Duration::from_millis(200)).is_empty());

        g.finish_leave();
        assert_eq!(g.state(), GroupState::Left);
        // Terminal; a late leave cannot resurrect the group.
        g.leave();
        assert_eq!(g.state(), GroupState::Left);
    }

    #[test]
    fn removed_peer_gets_nothing() {
        let now = Instant::now();
        let mut g = engine_with_peers(true, 3, now);
        g.remove_peer(2);
        let actions = g.publish_fragment(b"x".to_vec(), now);
        assert!(!push_targets(&actions).contains(&2));
    }
}
