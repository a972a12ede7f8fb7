//! Core types shared by every layer: constants, errors, callbacks.

mod callbacks;
mod constants;
mod error;

pub use callbacks::{InterruptCheck, InterruptFlag, LogLevel, LogSink, TracingSink};
pub use constants::*;
pub use error::{DecodeError, Result, RtmfpError};
