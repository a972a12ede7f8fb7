//! Engine and NetGroup configuration.
//!
//! Plain structs with builder-style setters. Every field maps to one of
//! the recognized `key=value` options that may trail a connection URI;
//! [`Config::apply_option`] performs that mapping. Defaults mirror the
//! reference client's option table.

use std::time::Duration;

use crate::core::{
    DEFAULT_FALLBACK_TIMEOUT_MS, DEFAULT_PUSH_LIMIT, DEFAULT_SOCKET_RECEIVE_SIZE,
    DEFAULT_SOCKET_SEND_SIZE, DEFAULT_UPDATE_PERIOD_MS, DEFAULT_WINDOW_DURATION_MS,
};

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP receive buffer size in bytes (`socketreceivesize`).
    pub socket_receive_size: usize,
    /// UDP send buffer size in bytes (`socketsendsize`).
    pub socket_send_size: usize,
    /// Bypass internal audio buffering for lower latency (`audiounbuffered`).
    pub audio_unbuffered: bool,
    /// Bypass internal video buffering for lower latency (`videounbuffered`).
    pub video_unbuffered: bool,
    /// Target peer id for direct P2P play (`peerid`).
    pub peer_id: Option<String>,
    /// Advertise the publication in P2P mode (`p2ppublishing`).
    pub p2p_publishing: bool,
    /// NetGroup identifier to join or create (`netgroup`).
    pub netgroup: Option<String>,
    /// Overall connect timeout (`timeout`, seconds).
    pub connect_timeout: Duration,

    /// SWF player URL passed through to the connect intent (`swfurl`).
    pub swf_url: Option<String>,
    /// Application name override (`app`).
    pub app: Option<String>,
    /// Embedding page URL (`pageurl`).
    pub page_url: Option<String>,
    /// Player version string (`flashver`).
    pub flash_ver: Option<String>,
    /// Local IPv4 bind address (`host`).
    pub host: Option<String>,
    /// Local IPv6 bind address (`hostipv6`).
    pub host_ipv6: Option<String>,

    /// NetGroup tuning, used when `netgroup` is set.
    pub group: GroupConfig,
}

/// NetGroup-specific tuning.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Interval between fragment availability advertisements
    /// (`updateperiod`, milliseconds).
    pub update_period: Duration,
    /// Reassembly/staleness window (`windowduration`, milliseconds).
    /// Fragments older than this are never requested from peers.
    pub window_duration: Duration,
    /// Maximum number of peers, minus one, that receive pushed fragments
    /// (`pushlimit`).
    pub push_limit: u32,
    /// Unicast fallback URL played until the group is ready (`fallbackurl`).
    pub fallback_url: Option<String>,
    /// Delay before the unicast fallback starts (`fallbacktimeout`, ms).
    pub fallback_timeout: Duration,
    /// Bypass the multiplicative decrease of the per-peer rate control
    /// (`disableratecontrol`). Trades congestion fairness for fewer
    /// spurious peer disconnections.
    pub disable_rate_control: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            update_period: Duration::from_millis(DEFAULT_UPDATE_PERIOD_MS),
            window_duration: Duration::from_millis(DEFAULT_WINDOW_DURATION_MS),
            push_limit: DEFAULT_PUSH_LIMIT,
            fallback_url: None,
            fallback_timeout: Duration::from_millis(DEFAULT_FALLBACK_TIMEOUT_MS),
            disable_rate_control: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_receive_size: DEFAULT_SOCKET_RECEIVE_SIZE,
            socket_send_size: DEFAULT_SOCKET_SEND_SIZE,
            audio_unbuffered: false,
            video_unbuffered: false,
            peer_id: None,
            p2p_publishing: false,
            netgroup: None,
            connect_timeout: Duration::from_secs(30),
            swf_url: None,
            app: None,
            page_url: None,
            flash_ver: None,
            host: None,
            host_ipv6: None,
            group: GroupConfig::default(),
        }
    }
}

impl Config {
    /// Create a configuration with reference defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the NetGroup identifier.
    pub fn netgroup(mut self, id: impl Into<String>) -> Self {
        self.netgroup = Some(id.into());
        self
    }

    /// Set the target peer id for direct P2P play.
    pub fn peer_id(mut self, id: impl Into<String>) -> Self {
        self.peer_id = Some(id.into());
        self
    }

    /// Advertise the publication in P2P mode.
    pub fn p2p_publishing(mut self, enabled: bool) -> Self {
        self.p2p_publishing = enabled;
        self
    }

    /// Set the unicast fallback URL.
    pub fn fallback_url(mut self, url: impl Into<String>) -> Self {
        self.group.fallback_url = Some(url.into());
        self
    }

    /// Apply one `key=value` option from a connection URI.
    ///
    /// Unknown keys are ignored (they may belong to an outer layer);
    /// returns `true` when the key was recognized.
    pub fn apply_option(&mut self, key: &str, value: &str) -> bool {
        fn int(value: &str) -> Option<u64> {
            value.parse().ok()
        }
        fn flag(value: &str) -> bool {
            matches!(value, "1" | "true" | "yes" | "on")
        }

        match key.to_ascii_lowercase().as_str() {
            "socketreceivesize" => {
                if let Some(v) = int(value) {
                    self.socket_receive_size = v as usize;
                }
            }
            "socketsendsize" => {
                if let Some(v) = int(value) {
                    self.socket_send_size = v as usize;
                }
            }
            "audiounbuffered" => self.audio_unbuffered = flag(value),
            "videounbuffered" => self.video_unbuffered = flag(value),
            "peerid" => self.peer_id = Some(value.to_string()),
            "p2ppublishing" => self.p2p_publishing = flag(value),
            "netgroup" => self.netgroup = Some(value.to_string()),
            "fallbackurl" => self.group.fallback_url = Some(value.to_string()),
            "fallbacktimeout" => {
                if let Some(v) = int(value) {
                    self.group.fallback_timeout = Duration::from_millis(v);
                }
            }
            "disableratecontrol" => self.group.disable_rate_control = flag(value),
            "pushlimit" => {
                if let Some(v) = int(value) {
                    self.group.push_limit = v as u32;
                }
            }
            "updateperiod" => {
                if let Some(v) = int(value) {
                    self.group.update_period = Duration::from_millis(v);
                }
            }
            "windowduration" => {
                if let Some(v) = int(value) {
                    self.group.window_duration = Duration::from_millis(v);
                }
            }
            "timeout" => {
                if let Some(v) = int(value) {
                    self.connect_timeout = Duration::from_secs(v);
                }
            }
            "swfurl" => self.swf_url = Some(value.to_string()),
            "app" => self.app = Some(value.to_string()),
            "pageurl" => self.page_url = Some(value.to_string()),
            "flashver" => self.flash_ver = Some(value.to_string()),
            "host" => self.host = Some(value.to_string()),
            "hostipv6" => self.host_ipv6 = Some(value.to_string()),
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_table() {
        let cfg = Config::default();
        assert_eq!(cfg.socket_receive_size, 212992);
        assert_eq!(cfg.socket_send_size, 212992);
        assert_eq!(cfg.group.push_limit, 4);
        assert_eq!(cfg.group.update_period, Duration::from_millis(100));
        assert_eq!(cfg.group.window_duration, Duration::from_millis(8000));
        assert_eq!(cfg.group.fallback_timeout, Duration::from_millis(8000));
        assert!(!cfg.group.disable_rate_control);
    }

    #[test]
    fn apply_known_options() {
        let mut cfg = Config::default();
        assert!(cfg.apply_option("socketsendsize", "65536"));
        assert!(cfg.apply_option("netgroup", "G:0123abcd"));
        assert!(cfg.apply_option("disableratecontrol", "1"));
        assert!(cfg.apply_option("windowduration", "4000"));
        assert_eq!(cfg.socket_send_size, 65536);
        assert_eq!(cfg.netgroup.as_deref(), Some("G:0123abcd"));
        assert!(cfg.group.disable_rate_control);
        assert_eq!(cfg.group.window_duration, Duration::from_millis(4000));
    }

    #[test]
    fn unknown_option_is_ignored() {
        let mut cfg = Config::default();
        assert!(!cfg.apply_option("notarealoption", "42"));
    }

    #[test]
    fn case_insensitive_keys() {
        let mut cfg = Config::default();
        assert!(cfg.apply_option("PushLimit", "7"));
        assert_eq!(cfg.group.push_limit, 7);
    }
}
