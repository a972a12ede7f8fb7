//! Connection URI parsing.
//!
//! Grammar: `rtmfp://host[:port][/app][/playpath][ key=value]...`
//!
//! `app` is the first one or two path segments (e.g. `ondemand`,
//! `flash/live`), `playpath` is the remainder and may carry a format
//! prefix such as `mp4:` which is preserved verbatim; the publication
//! name is an opaque string to this engine. Space-separated `key=value`
//! pairs after the path tune engine options (see [`Config::apply_option`]).
//!
//! [`Config::apply_option`]: crate::config::Config::apply_option

use crate::config::Config;
use crate::core::{RtmfpError, DEFAULT_PORT};

/// A parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    /// URI scheme (expected `rtmfp`).
    pub scheme: String,
    /// Remote host name or address literal.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Application path on the server (one or two segments).
    pub app: String,
    /// Publication name, prefix included (may be empty).
    pub playpath: String,
    /// Trailing `key=value` options, in order of appearance.
    pub options: Vec<(String, String)>,
}

impl TargetUri {
    /// Parse a connection URI.
    pub fn parse(uri: &str) -> Result<Self, RtmfpError> {
        let uri = uri.trim();

        // Trailing space-separated key=value options.
        let (uri, options) = match uri.find(' ') {
            Some(idx) => {
                let opts = uri[idx..]
                    .split_whitespace()
                    .filter_map(|pair| {
                        pair.split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect();
                (&uri[..idx], opts)
            }
            None => (uri, Vec::new()),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| RtmfpError::AddressUnresolvable(format!("not a URI: {uri}")))?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(RtmfpError::AddressUnresolvable("empty host".into()));
        }

        // Bracketed IPv6 literal or host[:port].
        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| RtmfpError::AddressUnresolvable(authority.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| RtmfpError::AddressUnresolvable(authority.to_string()))?,
                None => DEFAULT_PORT,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => {
                    let port = p
                        .parse()
                        .map_err(|_| RtmfpError::AddressUnresolvable(authority.to_string()))?;
                    (host.to_string(), port)
                }
                None => (authority.to_string(), DEFAULT_PORT),
            }
        };

        let (app, playpath) = split_app_playpath(path);

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
            app,
            playpath,
            options,
        })
    }

    /// Apply the URI's trailing options onto a configuration.
    pub fn apply_options(&self, config: &mut Config) {
        for (key, value) in &self.options {
            config.apply_option(key, value);
        }
    }

    /// `host:port` pair for address resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split a URI path into application name and publication path.
///
/// The application is the first path segment, or the first two when the
/// path holds three or more; the publication is whatever remains.
fn split_app_playpath(path: &str) -> (String, String) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 => (String::new(), String::new()),
        1 => (segments[0].to_string(), String::new()),
        2 => (segments[0].to_string(), segments[1].to_string()),
        _ => (segments[..2].join("/"), segments[2..].join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_live_uri() {
        let t = TargetUri::parse("rtmfp://server/live/mystream").unwrap();
        assert_eq!(t.scheme, "rtmfp");
        assert_eq!(t.host, "server");
        assert_eq!(t.port, DEFAULT_PORT);
        assert_eq!(t.app, "live");
        assert_eq!(t.playpath, "mystream");
        assert!(t.options.is_empty());
    }

    #[test]
    fn two_segment_app() {
        let t = TargetUri::parse("rtmfp://host:1940/flash/live/stream1").unwrap();
        assert_eq!(t.port, 1940);
        assert_eq!(t.app, "flash/live");
        assert_eq!(t.playpath, "stream1");
    }

    #[test]
    fn playpath_prefix_is_preserved() {
        let t = TargetUri::parse("rtmfp://host/ondemand/mp4:movies/film.f4v").unwrap();
        assert_eq!(t.app, "ondemand/mp4:movies");
        // Prefixes only matter inside a segment; the engine never
        // interprets them.
        let t = TargetUri::parse("rtmfp://host/vod/mp4:film.f4v").unwrap();
        assert_eq!(t.app, "vod");
        assert_eq!(t.playpath, "mp4:film.f4v");
    }

    #[test]
    fn trailing_options() {
        let t =
            TargetUri::parse("rtmfp://h/app/path netgroup=G:1234 windowduration=4000").unwrap();
        assert_eq!(t.options.len(), 2);
        assert_eq!(t.options[0], ("netgroup".into(), "G:1234".into()));

        let mut cfg = Config::default();
        t.apply_options(&mut cfg);
        assert_eq!(cfg.netgroup.as_deref(), Some("G:1234"));
        assert_eq!(
            cfg.group.window_duration,
            std::time::Duration::from_millis(4000)
        );
    }

    #[test]
    fn ipv6_literal() {
        let t = TargetUri::parse("rtmfp://[::1]:2000/live/x").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.port, 2000);
    }

    #[test]
    fn rejects_non_uri() {
        assert!(matches!(
            TargetUri::parse("not a uri"),
            Err(RtmfpError::AddressUnresolvable(_))
        ));
        assert!(matches!(
            TargetUri::parse("rtmfp://"),
            Err(RtmfpError::AddressUnresolvable(_))
        ));
    }

    #[test]
    fn host_only() {
        let t = TargetUri::parse("rtmfp://server").unwrap();
        assert_eq!(t.app, "");
        assert_eq!(t.playpath, "");
    }
}
