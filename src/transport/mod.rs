//! Datagram transport layer.
//!
//! Owns the single UDP socket every session shares and the RTT machinery
//! feeding retransmission timeouts:
//!
//! - [`RtmfpSocket`]: tokio UDP wrapper with configurable kernel buffer
//!   sizes and optional local bind addresses.
//! - [`RttEstimator`]: RFC 6298 smoothed RTT / RTO estimation.
//!
//! The socket is exclusively owned by the engine task; all datagram
//! writes funnel through it (single-writer discipline).

mod socket;
mod timing;

pub use socket::RtmfpSocket;
pub use timing::RttEstimator;
