//! Per-session state: flows, reliability, keepalive, teardown.
//!
//! A `Session` is a pure state machine over an established key pair: the
//! engine feeds it decrypted chunk streams and clock ticks, and drains
//! sealed datagrams from it. All policy that spans sessions (streams,
//! groups, the fallback) lives in the engine.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crate::core::{
    DecodeError, Result, RtmfpError, CONTROL_FLOW_ID, DEAD_INTERVAL, FIRST_STREAM_FLOW_ID,
    KEEPALIVE_INTERVAL, MAX_FRAGMENT_PAYLOAD,
};
use crate::flow::Flow;
use crate::handshake::SessionKeys;
use crate::packet::{AckRanges, Chunk, ChunkReader, ChunkWriter, Fragment};
use crate::reliability::CongestionWindow;
use crate::transport::RttEstimator;

use super::control::ControlMessage;

/// Session lifecycle. `Closed` and `Failed` are irrevocable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Keys exchanged, first flight not yet confirmed.
    Connecting,
    /// Fully established.
    Connected,
    /// Local close requested; final datagram pending.
    Closing,
    /// Torn down cleanly.
    Closed,
    /// Torn down by an error; the error surfaces on the next operation.
    Failed,
}

/// Something a received datagram did that the engine must act on.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete control-flow message arrived.
    Control(ControlMessage),
    /// In-order media bytes arrived on a stream flow.
    StreamData {
        /// Flow the bytes belong to.
        flow_id: u32,
        /// The delivered bytes.
        data: Vec<u8>,
    },
    /// The peer advertised NetGroup fragment availability.
    GroupAvailability(AckRanges),
    /// The peer requested NetGroup fragments.
    GroupPull(Vec<u64>),
    /// The peer pushed a NetGroup fragment.
    GroupPush {
        /// Group-wide fragment sequence.
        sequence: u64,
        /// Fragment bytes.
        payload: Vec<u8>,
    },
    /// The peer closed the session.
    Closed,
}

/// One established RTMFP session.
#[derive(Debug)]
pub struct Session {
    id: u32,
    remote: SocketAddr,
    keys: SessionKeys,
    state: SessionState,
    rtt: RttEstimator,
    window: CongestionWindow,
    flows: BTreeMap<u32, Flow>,
    next_flow_id: u32,
    flow_backlog: usize,
    /// Fragments written but not yet admitted by the congestion window.
    unsent: VecDeque<Fragment>,
    /// Fragments to resend regardless of the window.
    retransmit: Vec<Fragment>,
    /// Non-data chunks queued for the next datagram.
    outbox: Vec<Chunk>,
    last_send: Instant,
    last_recv: Instant,
    ping_counter: u64,
}

impl Session {
    /// Create a session from freshly negotiated keys.
    ///
    /// `flow_backlog` bounds each flow's unacknowledged byte backlog
    /// (derived from the configured socket send size).
    pub fn new(
        id: u32,
        remote: SocketAddr,
        keys: SessionKeys,
        flow_backlog: usize,
        disable_rate_control: bool,
        now: Instant,
    ) -> Self {
        let mut flows = BTreeMap::new();
        flows.insert(CONTROL_FLOW_ID, Flow::new(CONTROL_FLOW_ID, flow_backlog));
        Self {
            id,
            remote,
            keys,
            state: SessionState::Connecting,
            rtt: RttEstimator::new(),
            window: CongestionWindow::new(disable_rate_control),
            flows,
            next_flow_id: FIRST_STREAM_FLOW_ID,
            flow_backlog,
            unsent: VecDeque::new(),
            retransmit: Vec::new(),
            outbox: Vec::new(),
            last_send: now,
            last_recv: now,
            ping_counter: 0,
        }
    }

    /// Session id (the datagram demultiplexing key).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Remote endpoint address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Promote to `Connected`.
    pub fn mark_connected(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    /// Smoothed RTT, once sampled.
    pub fn srtt(&self) -> Option<std::time::Duration> {
        self.rtt.srtt()
    }

    /// Allocate a fresh stream flow. Flow ids are never reused.
    pub fn open_stream_flow(&mut self) -> u32 {
        let flow_id = self.next_flow_id;
        self.next_flow_id += 1;
        self.flows
            .insert(flow_id, Flow::new(flow_id, self.flow_backlog));
        flow_id
    }

    /// Keep future local allocations clear of a peer-chosen flow id.
    pub fn reserve_flow_id(&mut self, flow_id: u32) {
        if flow_id >= self.next_flow_id {
            self.next_flow_id = flow_id + 1;
        }
    }

    /// Queue a message on a flow. The bytes are fragmented immediately;
    /// transmission happens on [`flush`](Self::flush), gated by the
    /// congestion window.
    pub fn send_message(&mut self, flow_id: u32, data: &[u8]) -> Result<()> {
        let backlog = self.flow_backlog;
        let flow = self
            .flows
            .entry(flow_id)
            .or_insert_with(|| Flow::new(flow_id, backlog));
        let fragments = flow.writer_mut().write(data)?;
        self.unsent.extend(fragments);
        Ok(())
    }

    /// Queue a bare chunk (group traffic, pong, close notice).
    pub fn queue(&mut self, chunk: Chunk) {
        self.outbox.push(chunk);
    }

    /// Total unacknowledged bytes across all flows.
    pub fn in_flight_bytes(&self) -> usize {
        self.flows
            .values()
            .map(|f| f.tracker().outstanding_bytes())
            .sum()
    }

    /// Request a clean close. The final `Close` chunk leaves on the next
    /// [`flush`](Self::flush); calling this twice is harmless.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return;
        }
        if self.state != SessionState::Closing {
            self.state = SessionState::Closing;
            self.outbox.push(Chunk::Close);
        }
    }

    /// Process the encrypted remainder of an inbound datagram.
    ///
    /// Decode failures drop the whole datagram; they never tear the
    /// session down on their own.
    pub fn on_datagram(
        &mut self,
        rest: &[u8],
        now: Instant,
    ) -> std::result::Result<Vec<SessionEvent>, DecodeError> {
        let plaintext = self.keys.open(self.id, rest)?;
        let mut events = Vec::new();
        for chunk in ChunkReader::new(&plaintext) {
            self.on_chunk(chunk?, now, &mut events);
        }
        self.last_recv = now;
        Ok(events)
    }

    fn on_chunk(&mut self, chunk: Chunk, now: Instant, events: &mut Vec<SessionEvent>) {
        match chunk {
            Chunk::Data(fragment) => {
                let flow_id = fragment.flow_id;
                let backlog = self.flow_backlog;
                let flow = self
                    .flows
                    .entry(flow_id)
                    .or_insert_with(|| Flow::new(flow_id, backlog));
                flow.reassembler_mut().insert(fragment);
                // Acknowledge everything seen so far, with gaps called out.
                self.outbox.push(Chunk::Ack {
                    flow_id,
                    ranges: flow.reassembler().ack_ranges(),
                    missing: flow.reassembler().missing(),
                });
                if flow_id == CONTROL_FLOW_ID {
                    while let Some(message) = flow.reassembler_mut().pop_message() {
                        match ControlMessage::decode(&message) {
                            Ok(msg) => events.push(SessionEvent::Control(msg)),
                            Err(err) => {
                                tracing::debug!(session = self.id, %err, "bad control message")
                            }
                        }
                    }
                } else {
                    let data = flow.reassembler_mut().pop_bytes();
                    if !data.is_empty() {
                        events.push(SessionEvent::StreamData { flow_id, data });
                    }
                }
            }
            Chunk::Ack {
                flow_id,
                ranges,
                missing,
            } => {
                if let Some(flow) = self.flows.get_mut(&flow_id) {
                    let summary = flow.on_ack(&ranges, now);
                    for sample in summary.samples {
                        self.rtt.sample(sample);
                    }
                    self.window.on_ack(summary.bytes);
                    if !missing.is_empty() {
                        self.retransmit
                            .extend(flow.tracker_mut().retransmit_requested(&missing, now));
                    }
                }
            }
            Chunk::Ping(echo) => self.outbox.push(Chunk::Pong(echo)),
            Chunk::Pong(_) => {}
            Chunk::Close => {
                self.state = SessionState::Closed;
                events.push(SessionEvent::Closed);
            }
            Chunk::GroupAvailability(ranges) => {
                events.push(SessionEvent::GroupAvailability(ranges))
            }
            Chunk::GroupPull(seqs) => events.push(SessionEvent::GroupPull(seqs)),
            Chunk::GroupPush { sequence, payload } => {
                events.push(SessionEvent::GroupPush { sequence, payload })
            }
            // Handshake chunks have no business inside a sealed datagram.
            other => tracing::debug!(session = self.id, ?other, "unexpected chunk"),
        }
    }

    /// Drive timers: retransmission, keepalive, dead-interval detection.
    ///
    /// A retransmission budget overrun or a dead peer fails the session
    /// with [`RtmfpError::DeliveryFailed`].
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return Ok(());
        }
        if now.duration_since(self.last_recv) >= DEAD_INTERVAL {
            self.state = SessionState::Failed;
            self.window.on_loss();
            return Err(RtmfpError::DeliveryFailed);
        }
        let mut lost = false;
        for flow in self.flows.values_mut() {
            match flow.tracker_mut().due_retransmits(now) {
                Ok(due) => {
                    lost |= !due.is_empty();
                    self.retransmit.extend(due);
                }
                Err(err) => {
                    self.state = SessionState::Failed;
                    return Err(err);
                }
            }
        }
        if lost {
            self.window.on_loss();
        }
        if now.duration_since(self.last_send) >= KEEPALIVE_INTERVAL {
            self.ping_counter += 1;
            self.outbox.push(Chunk::Ping(self.ping_counter));
        }
        Ok(())
    }

    /// Seal everything ready to go into datagrams.
    ///
    /// Retransmissions bypass the congestion window; fresh fragments are
    /// admitted only while the window has room.
    pub fn flush(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut writer = ChunkWriter::new();

        let rotate =
            |writer: &mut ChunkWriter, datagrams: &mut Vec<Vec<u8>>, keys: &mut SessionKeys| {
                if !writer.is_empty() {
                    let chunks = std::mem::take(writer).into_bytes();
                    datagrams.push(keys.seal(self.id, &chunks));
                }
            };

        for chunk in self.outbox.drain(..) {
            let mut piece = ChunkWriter::new();
            piece.push(&chunk);
            if !writer.is_empty() && writer.len() + piece.len() > MAX_FRAGMENT_PAYLOAD {
                rotate(&mut writer, &mut datagrams, &mut self.keys);
            }
            writer.append(piece);
        }

        for fragment in self.retransmit.drain(..) {
            if !writer.is_empty() && writer.len() + fragment.body_len() > MAX_FRAGMENT_PAYLOAD {
                rotate(&mut writer, &mut datagrams, &mut self.keys);
            }
            writer.push(&Chunk::Data(fragment));
        }

        let mut in_flight = self
            .flows
            .values()
            .map(|f| f.tracker().outstanding_bytes())
            .sum::<usize>();
        while let Some(fragment) = self.unsent.pop_front() {
            if !self.window.can_send(in_flight, fragment.payload.len()) {
                self.unsent.push_front(fragment);
                break;
            }
            in_flight += fragment.payload.len();
            if let Some(flow) = self.flows.get_mut(&fragment.flow_id) {
                flow.tracker_mut()
                    .track(fragment.clone(), now, self.rtt.rto());
            }
            if !writer.is_empty() && writer.len() + fragment.body_len() > MAX_FRAGMENT_PAYLOAD {
                rotate(&mut writer, &mut datagrams, &mut self.keys);
            }
            writer.push(&Chunk::Data(fragment));
        }
        rotate(&mut writer, &mut datagrams, &mut self.keys);

        if !datagrams.is_empty() {
            self.last_send = now;
        }
        datagrams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeKeypair;
    use crate::packet::split_datagram;

    const SID: u32 = 7;
    const BACKLOG: usize = 64 * 1024;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn pair(now: Instant) -> (Session, Session) {
        let ik = HandshakeKeypair::generate();
        let rk = HandshakeKeypair::generate();
        let cookie = [0x42; 64];
        let initiator_keys = ik.derive(&rk.public_bytes(), &cookie, true);
        let responder_keys = rk.derive(&ik.public_bytes(), &cookie, false);
        let mut a = Session::new(SID, addr(4001), initiator_keys, BACKLOG, false, now);
        let mut b = Session::new(SID, addr(4000), responder_keys, BACKLOG, false, now);
        a.mark_connected();
        b.mark_connected();
        (a, b)
    }

    fn deliver(from: &mut Session, to: &mut Session, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for datagram in from.flush(now) {
            let (sid, rest) = split_datagram(&datagram).unwrap();
            assert_eq!(sid, SID);
            events.extend(to.on_datagram(rest, now).unwrap());
        }
        events
    }

    #[test]
    fn media_roundtrip_with_acks() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let flow = a.open_stream_flow();
        assert_eq!(flow, FIRST_STREAM_FLOW_ID);

        a.send_message(flow, b"some media bytes").unwrap();
        let events = deliver(&mut a, &mut b, now);
        match &events[..] {
            [SessionEvent::StreamData { flow_id, data }] => {
                assert_eq!(*flow_id, flow);
                assert_eq!(data, b"some media bytes");
            }
            other => panic!("expected stream data, got {other:?}"),
        }
        assert!(a.in_flight_bytes() > 0);

        // B's ack releases A's tracking.
        let events = deliver(&mut b, &mut a, now + std::time::Duration::from_millis(30));
        assert!(events.is_empty());
        assert_eq!(a.in_flight_bytes(), 0);
        assert!(a.srtt().is_some());
    }

    #[test]
    fn control_messages_arrive_as_events() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let msg = ControlMessage::GroupJoin {
            group: "G:99".into(),
        };
        a.send_message(CONTROL_FLOW_ID, &msg.encode()).unwrap();
        let events = deliver(&mut a, &mut b, now);
        assert!(matches!(
            &events[..],
            [SessionEvent::Control(ControlMessage::GroupJoin { group })] if group == "G:99"
        ));
    }

    #[test]
    fn large_message_fragments_and_reassembles() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let flow = a.open_stream_flow();
        let payload = vec![0xabu8; MAX_FRAGMENT_PAYLOAD * 3 + 17];
        a.send_message(flow, &payload).unwrap();

        let mut received = Vec::new();
        for event in deliver(&mut a, &mut b, now) {
            if let SessionEvent::StreamData { data, .. } = event {
                received.extend_from_slice(&data);
            }
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn keepalive_ping_gets_ponged() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let idle = now + KEEPALIVE_INTERVAL;
        a.tick(idle).unwrap();
        let events = deliver(&mut a, &mut b, idle);
        assert!(events.is_empty());
        // B answers with a pong; A absorbs it silently.
        let events = deliver(&mut b, &mut a, idle);
        assert!(events.is_empty());
    }

    #[test]
    fn remote_close_is_an_event_and_terminal() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        a.close();
        a.close(); // idempotent
        let events = deliver(&mut a, &mut b, now);
        assert!(matches!(&events[..], [SessionEvent::Closed]));
        assert_eq!(b.state(), SessionState::Closed);
    }

    #[test]
    fn unacked_fragments_eventually_fail_delivery() {
        let now = Instant::now();
        let (mut a, _b) = pair(now);
        let flow = a.open_stream_flow();
        a.send_message(flow, b"into the void").unwrap();
        a.flush(now);

        let mut at = now;
        let err = loop {
            at += std::time::Duration::from_millis(500);
            match a.tick(at) {
                Ok(()) => {
                    a.flush(at);
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(err, RtmfpError::DeliveryFailed));
        assert_eq!(a.state(), SessionState::Failed);
    }

    #[test]
    fn dead_interval_fails_the_session() {
        let now = Instant::now();
        let (mut a, _b) = pair(now);
        let err = a.tick(now + DEAD_INTERVAL).unwrap_err();
        assert!(matches!(err, RtmfpError::DeliveryFailed));
        assert_eq!(a.state(), SessionState::Failed);
    }

    #[test]
    fn backlog_bound_fails_with_buffer_exhausted() {
        let now = Instant::now();
        let ik = HandshakeKeypair::generate();
        let rk = HandshakeKeypair::generate();
        let keys = ik.derive(&rk.public_bytes(), &[0; 64], true);
        let mut a = Session::new(SID, addr(4001), keys, 1024, false, now);
        let flow = a.open_stream_flow();
        a.send_message(flow, &vec![0u8; 900]).unwrap();
        let err = a.send_message(flow, &vec![0u8; 900]).unwrap_err();
        assert!(matches!(err, RtmfpError::BufferExhausted));
    }

    #[test]
    fn queued_chunks_never_overflow_a_datagram() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        for seq in 1..=6 {
            a.queue(Chunk::GroupPush {
                sequence: seq,
                payload: vec![0x5a; MAX_FRAGMENT_PAYLOAD],
            });
        }
        let datagrams = a.flush(now);
        assert_eq!(datagrams.len(), 6);
        for datagram in &datagrams {
            assert!(datagram.len() <= crate::core::MAX_DATAGRAM_SIZE);
            let (_, rest) = split_datagram(datagram).unwrap();
            b.on_datagram(rest, now).unwrap();
        }
    }

    #[test]
    fn congestion_window_holds_back_fresh_fragments() {
        let now = Instant::now();
        let (mut a, _b) = pair(now);
        let flow = a.open_stream_flow();
        // Twice the initial window; only the first window's worth leaves.
        let payload = vec![0u8; MAX_FRAGMENT_PAYLOAD * 8];
        a.send_message(flow, &payload).unwrap();
        let datagrams = a.flush(now);
        assert_eq!(datagrams.len(), 4);
        assert_eq!(a.in_flight_bytes(), MAX_FRAGMENT_PAYLOAD * 4);
    }
}
