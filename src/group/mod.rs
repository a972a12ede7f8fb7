//! NetGroup: serverless P2P multicast over RTMFP peer sessions.
//!
//! Members exchange availability advertisements, pull what they miss,
//! and push fresh fragments to a bounded set of neighbors. Delivery to
//! the application is in group-sequence order with a staleness window:
//! a fragment older than `windowduration` is dead to the group.

mod engine;
mod fallback;
mod membership;

pub use engine::{GroupAction, GroupEngine, GroupState};
pub use fallback::{FallbackAction, FallbackState};
pub use membership::{FragmentWindow, GroupMember, Membership};
