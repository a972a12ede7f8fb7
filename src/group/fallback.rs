//! Fallback-to-unicast trigger.

use std::time::Instant;

use crate::config::GroupConfig;

/// What the engine should do about the unicast fallback right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    /// Open a unicast play session against this URL and merge its output
    /// into the group's stream.
    Start(String),
    /// The group caught up; tear the fallback session down.
    Stop,
}

/// Arms when a fallback URL is configured; fires once if the group has
/// not reached active delivery inside the fallback timeout, and stops
/// exactly once when it does.
///
/// If the fallback stream and the group use different codecs the merged
/// output is undefined; that is the caller's documented responsibility,
/// not something this engine validates.
#[derive(Debug)]
pub struct FallbackState {
    url: Option<String>,
    deadline: Option<Instant>,
    started: bool,
    stopped: bool,
}

impl FallbackState {
    /// Arm from the group configuration.
    pub fn new(config: &GroupConfig, now: Instant) -> Self {
        let url = config.fallback_url.clone();
        let deadline = url.as_ref().map(|_| now + config.fallback_timeout);
        Self {
            url,
            deadline,
            started: false,
            stopped: false,
        }
    }

    /// Evaluate the trigger.
    pub fn tick(&mut self, now: Instant, group_active: bool) -> Option<FallbackAction> {
        if self.started {
            if group_active && !self.stopped {
                self.stopped = true;
                return Some(FallbackAction::Stop);
            }
            return None;
        }
        if group_active || self.stopped {
            // The group got there first; the fallback never starts.
            self.stopped = true;
            return None;
        }
        match (&self.url, self.deadline) {
            (Some(url), Some(deadline)) if now >= deadline => {
                self.started = true;
                Some(FallbackAction::Start(url.clone()))
            }
            _ => None,
        }
    }

    /// Whether the fallback session is currently open.
    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }
}
