//! Flow multiplexing.
//!
//! A flow is an independent, ordered, reliability-tracked channel inside
//! one session: flow 2 carries session control messages, flows 3+ carry
//! media streams and NetGroup exchanges. Within one flow delivered bytes
//! preserve send order; across flows there is no ordering guarantee.

mod reassembly;
mod writer;

pub use reassembly::{Reassembler, FIRST_SEQUENCE};
pub use writer::FlowWriter;

use std::time::{Duration, Instant};

use crate::packet::AckRanges;
use crate::reliability::AckTracker;

/// What an inbound selective ack released on a flow.
#[derive(Debug, Default)]
pub struct AckSummary {
    /// RTT samples from fragments acked on their first transmission.
    pub samples: Vec<Duration>,
    /// Total payload bytes newly acknowledged.
    pub bytes: usize,
}

/// One logical channel of a session: sending, receiving and
/// acknowledgment state together.
#[derive(Debug)]
pub struct Flow {
    writer: FlowWriter,
    reassembler: Reassembler,
    tracker: AckTracker,
}

impl Flow {
    /// Open a flow.
    pub fn new(flow_id: u32, max_backlog_bytes: usize) -> Self {
        Self {
            writer: FlowWriter::new(flow_id, max_backlog_bytes),
            reassembler: Reassembler::new(),
            tracker: AckTracker::new(),
        }
    }

    /// Flow id.
    pub fn id(&self) -> u32 {
        self.writer.flow_id()
    }

    /// Sending half.
    pub fn writer_mut(&mut self) -> &mut FlowWriter {
        &mut self.writer
    }

    /// Receiving half.
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Receiving half, mutable.
    pub fn reassembler_mut(&mut self) -> &mut Reassembler {
        &mut self.reassembler
    }

    /// Acknowledgment tracker.
    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    /// Acknowledgment tracker, mutable.
    pub fn tracker_mut(&mut self) -> &mut AckTracker {
        &mut self.tracker
    }

    /// Apply an inbound selective ack, releasing writer backlog for
    /// every newly covered fragment.
    pub fn on_ack(&mut self, ranges: &AckRanges, now: Instant) -> AckSummary {
        let acked = self.tracker.acknowledge(ranges, now);
        let mut summary = AckSummary::default();
        for entry in acked {
            self.writer.on_acknowledged(entry.payload_len);
            summary.bytes += entry.payload_len;
            if let Some(rtt) = entry.rtt_sample {
                summary.samples.push(rtt);
            }
        }
        summary
    }
}
