//! Reliability: selective acknowledgment, retransmission scheduling and
//! congestion control.
//!
//! Every fragment a flow sends lands in an [`AckTracker`] until a
//! selective ack covers it or its retry budget runs out (which fails the
//! owning session with `DeliveryFailed`). The [`CongestionWindow`] gates
//! how many unacknowledged bytes a session, or one NetGroup peer link,
//! may keep in flight.

mod ack;
mod window;

pub use ack::{AckTracker, AckedFragment};
pub use window::CongestionWindow;
