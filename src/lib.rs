//! # RTMFP Client Engine
//!
//! A client implementation of RTMFP (Real Time Media Flow Protocol):
//! a UDP-based, connection-oriented, multiplexed, congestion-controlled
//! streaming transport with peer-to-peer NetGroup distribution.
//!
//! The engine provides:
//!
//! - **Sessions**: cookie handshake with X25519 key agreement and
//!   authenticated datagram encryption
//! - **Flows**: independent ordered channels multiplexed over one socket,
//!   with fragmentation, reassembly, and selective acknowledgment
//! - **Rate control**: AIMD congestion window per session and per
//!   NetGroup peer link
//! - **NetGroups**: multicast-like fragment distribution among peers with
//!   push/pull exchange, windowed availability, and unicast fallback
//!
//! Media payloads are opaque bytes; codec and container framing belong to
//! the layers above.
//!
//! ## Modules
//!
//! - [`core`]: constants, error taxonomy, log/interrupt callbacks
//! - [`transport`]: UDP socket and RTT estimation
//! - [`packet`]: datagram framing and the chunk codec
//! - [`handshake`]: initiator/responder state machines and key derivation
//! - [`flow`]: per-flow write fragmentation and reassembly
//! - [`reliability`]: selective ack tracking and the congestion window
//! - [`session`]: the engine task, sessions, and the blocking facade
//! - [`group`]: the NetGroup engine
//!
//! ## Example
//!
//! ```no_run
//! use rtmfp_engine::{MediaStream, OpenFlags, Result};
//!
//! fn main() -> Result<()> {
//!     let mut stream = MediaStream::open(
//!         "rtmfp://server/live/mystream",
//!         OpenFlags::default(),
//!     )?;
//!     let mut buf = [0u8; 4096];
//!     let n = stream.read(&mut buf)?;
//!     println!("got {n} media bytes");
//!     stream.close();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod flow;
pub mod group;
pub mod handshake;
pub mod packet;
pub mod reliability;
pub mod session;
pub mod transport;
pub mod uri;

pub use config::{Config, GroupConfig};
pub use core::{
    InterruptCheck, InterruptFlag, LogLevel, LogSink, Result, RtmfpError, TracingSink,
};
pub use session::{Engine, EngineHandle, MediaStream, OpenFlags, SessionStatus};
pub use uri::TargetUri;
