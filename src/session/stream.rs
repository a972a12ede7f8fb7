//! Blocking media-layer facade.
//!
//! `MediaStream` does the adapter dance once: parse the URI, apply its
//! options, connect, wait for `Connected`, and open the right stream
//! intent for the configured mode. The caller gets plain blocking
//! `read`/`write`/`close` over opaque media bytes; the engine runs on a
//! private single-worker runtime underneath.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::config::Config;
use crate::core::{
    InterruptCheck, LogSink, Result, RtmfpError, TracingSink, INTERRUPT_POLL_INTERVAL,
};
use crate::uri::TargetUri;

use super::engine::{Engine, EngineHandle};

/// How the stream is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for publishing (writing) rather than playing.
    pub write: bool,
}

/// Which intent an open resolves to, decided from options and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamPlan {
    /// Join the configured NetGroup; `publisher` marks the source member.
    Group { publisher: bool },
    /// Publish to the connected server.
    Publish,
    /// Advertise a P2P publication.
    PublishP2p,
    /// Subscribe to a named stream from a specific peer.
    PeerConnect { peer_id: String },
    /// Subscribe from the connected endpoint.
    Play,
}

/// Decide the stream intent the way the reference adapter does: the
/// NetGroup option wins, then P2P publishing, then the open direction.
fn stream_plan(config: &Config, flags: OpenFlags) -> StreamPlan {
    if config.netgroup.is_some() {
        return StreamPlan::Group {
            publisher: flags.write,
        };
    }
    if flags.write {
        if config.p2p_publishing {
            return StreamPlan::PublishP2p;
        }
        return StreamPlan::Publish;
    }
    if let Some(peer_id) = &config.peer_id {
        return StreamPlan::PeerConnect {
            peer_id: peer_id.clone(),
        };
    }
    StreamPlan::Play
}

/// Await a future while polling the caller's interrupt predicate.
async fn interruptible<T>(
    interrupt: &dyn InterruptCheck,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = tokio::time::sleep(INTERRUPT_POLL_INTERVAL) => {
                if interrupt.is_interrupted() {
                    return Err(RtmfpError::Interrupted);
                }
            }
        }
    }
}

/// One open media stream with blocking I/O.
pub struct MediaStream {
    rt: Runtime,
    handle: EngineHandle,
    interrupt: Arc<dyn InterruptCheck>,
    session: u32,
    stream: u32,
    /// Delivered bytes not yet consumed by `read`.
    leftover: VecDeque<u8>,
    closed: bool,
}

impl MediaStream {
    /// Open a stream with default logging and no interrupt hook.
    pub fn open(uri: &str, flags: OpenFlags) -> Result<Self> {
        Self::open_with(uri, flags, Arc::new(TracingSink), Arc::new(|| false))
    }

    /// Open a stream with a caller-supplied log sink and interrupt
    /// predicate. The predicate is polled during every blocking wait;
    /// once it returns `true` the pending operation fails with
    /// [`RtmfpError::Interrupted`] and the stream stays closable.
    pub fn open_with(
        uri: &str,
        flags: OpenFlags,
        log: Arc<dyn LogSink>,
        interrupt: Arc<dyn InterruptCheck>,
    ) -> Result<Self> {
        let target = TargetUri::parse(uri)?;
        let mut config = Config::default();
        target.apply_options(&mut config);
        let plan = stream_plan(&config, flags);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        let (handle, _local) = {
            let _guard = rt.enter();
            Engine::spawn(config, log)?
        };

        let name = target.playpath.clone();
        let (session, stream) = rt.block_on(interruptible(interrupt.as_ref(), async {
            let session = handle.connect(&target).await?;
            handle.wait_connected(session).await?;
            let stream = match &plan {
                StreamPlan::Group { publisher } => {
                    handle.open_group_stream(session, *publisher).await?
                }
                StreamPlan::Publish => handle.publish(session, &name).await?,
                StreamPlan::PublishP2p => handle.publish_p2p(session, &name).await?,
                StreamPlan::PeerConnect { peer_id } => {
                    handle.connect_to_peer(session, peer_id, &name).await?
                }
                StreamPlan::Play => handle.play(session, &name).await?,
            };
            Ok((session, stream))
        }))?;

        Ok(Self {
            rt,
            handle,
            interrupt,
            session,
            stream,
            leftover: VecDeque::new(),
            closed: false,
        })
    }

    /// Session id of the underlying connection.
    pub fn session_id(&self) -> u32 {
        self.session
    }

    /// Stream id negotiated at open.
    pub fn stream_id(&self) -> u32 {
        self.stream
    }

    /// Read delivered media bytes into `buf`. Blocks until bytes arrive,
    /// the stream ends (`Ok(0)`), the interrupt fires, or the session
    /// fails. After a clean close every read returns `Ok(0)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.closed {
            return Ok(0);
        }
        if self.leftover.is_empty() {
            let interrupt = Arc::clone(&self.interrupt);
            let handle = &mut self.handle;
            let item = self
                .rt
                .block_on(interruptible(interrupt.as_ref(), async move {
                    Ok(handle.read().await)
                }))?;
            match item {
                Some(Ok(data)) => self.leftover.extend(data),
                Some(Err(err)) => {
                    self.closed = true;
                    return Err(err);
                }
                None => {
                    self.closed = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.leftover.len());
        for slot in buf.iter_mut().take(n) {
            // VecDeque keeps the remainder for the next read.
            *slot = match self.leftover.pop_front() {
                Some(byte) => byte,
                None => break,
            };
        }
        Ok(n)
    }

    /// Write media bytes to the stream. Returns the bytes accepted;
    /// `Ok(0)` once the stream is closed.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let interrupt = Arc::clone(&self.interrupt);
        self.rt.block_on(interruptible(
            interrupt.as_ref(),
            self.handle.write(self.session, self.stream, buf),
        ))
    }

    /// Close the stream and its session. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.rt.block_on(self.handle.close(self.session));
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("session", &self.session)
            .field("stream", &self.stream)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InterruptFlag;
    use std::time::Duration;

    fn config_with(options: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (key, value) in options {
            config.apply_option(key, value);
        }
        config
    }

    #[test]
    fn netgroup_option_wins_over_everything() {
        let config = config_with(&[("netgroup", "G:1"), ("peerid", "abc"), ("p2ppublishing", "1")]);
        assert_eq!(
            stream_plan(&config, OpenFlags { write: false }),
            StreamPlan::Group { publisher: false }
        );
        assert_eq!(
            stream_plan(&config, OpenFlags { write: true }),
            StreamPlan::Group { publisher: true }
        );
    }

    #[test]
    fn write_mode_picks_publish_variant() {
        let plain = config_with(&[]);
        assert_eq!(
            stream_plan(&plain, OpenFlags { write: true }),
            StreamPlan::Publish
        );
        let p2p = config_with(&[("p2ppublishing", "1")]);
        assert_eq!(
            stream_plan(&p2p, OpenFlags { write: true }),
            StreamPlan::PublishP2p
        );
    }

    #[test]
    fn read_mode_picks_peer_or_play() {
        let peer = config_with(&[("peerid", "0123abcd")]);
        assert_eq!(
            stream_plan(&peer, OpenFlags { write: false }),
            StreamPlan::PeerConnect {
                peer_id: "0123abcd".into()
            }
        );
        let plain = config_with(&[]);
        assert_eq!(
            stream_plan(&plain, OpenFlags { write: false }),
            StreamPlan::Play
        );
    }

    #[tokio::test]
    async fn interruptible_aborts_a_pending_wait() {
        let flag = InterruptFlag::new();
        flag.interrupt();
        let never = std::future::pending::<Result<()>>();
        let err = interruptible(&flag, never).await.unwrap_err();
        assert!(matches!(err, RtmfpError::Interrupted));
    }

    #[tokio::test]
    async fn interruptible_passes_results_through() {
        let flag = InterruptFlag::new();
        let out = interruptible(&flag, async { Ok(17u32) }).await.unwrap();
        assert_eq!(out, 17);
    }

    #[test]
    fn publish_then_subscriber_receives_bytes() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (addr, subscriber) = rt.block_on(async {
            let config = Config::default().p2p_publishing(true);
            Engine::spawn(config, Arc::new(TracingSink)).map(|(b, addr)| (addr, b))
        }).unwrap();

        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        rt.spawn(async move {
            let mut subscriber = subscriber;
            let session = loop {
                match subscriber.sessions().await {
                    Ok(ids) if !ids.is_empty() => break ids[0],
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            // The publication may not be announced yet; keep asking.
            while subscriber.play(session, "x").await.is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if let Some(Ok(data)) = subscriber.read().await {
                let _ = tx.send(data);
            }
        });

        let uri = format!("rtmfp://127.0.0.1:{}/live/x p2ppublishing=1", addr.port());
        let mut publisher = MediaStream::open(&uri, OpenFlags { write: true }).unwrap();
        assert_ne!(publisher.stream_id(), 0);

        // Writes before the subscription lands go nowhere; keep feeding
        // frames until one comes out the other side.
        let mut received = None;
        for _ in 0..250 {
            publisher.write(b"frame").unwrap();
            if let Ok(data) = rx.recv_timeout(Duration::from_millis(40)) {
                received = Some(data);
                break;
            }
        }
        assert_eq!(received.as_deref(), Some(&b"frame"[..]));

        publisher.close();
        publisher.close();
        assert_eq!(publisher.write(b"late").unwrap(), 0);
    }

    #[test]
    fn interrupt_during_open_leaves_no_stream() {
        // Nobody answers on this socket; the open blocks in the
        // handshake until the interrupt fires.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dead = rt
            .block_on(tokio::net::UdpSocket::bind("127.0.0.1:0"))
            .unwrap();
        let uri = format!("rtmfp://127.0.0.1:{}/live/x", dead.local_addr().unwrap().port());

        let flag = InterruptFlag::new();
        flag.interrupt();
        let err = MediaStream::open_with(
            &uri,
            OpenFlags::default(),
            Arc::new(TracingSink),
            Arc::new(flag),
        )
        .unwrap_err();
        assert!(matches!(err, RtmfpError::Interrupted));
    }
}
