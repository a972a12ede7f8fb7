//! Session management: the engine task, per-session state, the control
//! protocol, and the blocking media facade.
//!
//! Layering inside this module: [`Session`] is a pure per-connection
//! state machine; [`Engine`] is the single task owning the socket and
//! every session; [`EngineHandle`] is its async command surface;
//! [`MediaStream`] wraps a handle in the blocking open/read/write/close
//! shape the media layer consumes.

mod control;
mod engine;
mod session;
mod stream;

pub use control::{ControlMessage, StreamIntent};
pub use engine::{DataItem, Engine, EngineHandle, SessionStatus};
pub use session::{Session, SessionEvent, SessionState};
pub use stream::{MediaStream, OpenFlags};
