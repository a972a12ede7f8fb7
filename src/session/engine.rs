//! The engine task and its command handle.
//!
//! One tokio task owns the UDP socket, every session, the NetGroup and
//! all cooperative timers; it is the only writer on the socket. The
//! public [`EngineHandle`] talks to it over an mpsc command channel with
//! oneshot replies, and receives delivered media bytes on a separate
//! channel. Mid-session failures close the owning session and surface
//! on the next read or write; operations on a closed session are benign
//! no-ops.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::core::{
    LogLevel, LogSink, Result, RtmfpError, CONTROL_FLOW_ID, COOKIE_SIZE, INTERRUPT_POLL_INTERVAL,
    KEYING_REPLAY_INTERVAL, MAX_FRAGMENT_PAYLOAD, PUBLIC_KEY_SIZE, TICK_INTERVAL,
};
use crate::group::{GroupAction, GroupEngine};
use crate::handshake::{Initiator, InitiatorAction, Responder, ResponderReject};
use crate::packet::{frame_datagram, split_datagram, Chunk, ChunkReader, ChunkWriter};
use crate::transport::RtmfpSocket;
use crate::uri::TargetUri;

use super::control::{ControlMessage, StreamIntent};
use super::session::{Session, SessionEvent};

/// Delivered media payload, or the error that closed its session.
pub type DataItem = std::result::Result<Vec<u8>, RtmfpError>;

/// What the engine knows about a session id.
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// The session is established and usable.
    Connected,
    /// The session was torn down, perhaps by an error.
    Closed(Option<RtmfpError>),
    /// The id is not (or no longer) known.
    Unknown,
}

enum Command {
    Connect {
        remote: SocketAddr,
        epd: String,
        connect_args: Vec<(String, String)>,
        reply: oneshot::Sender<Result<u32>>,
    },
    OpenStream {
        session: u32,
        intent: StreamIntent,
        reply: oneshot::Sender<Result<u32>>,
    },
    OpenGroupStream {
        session: u32,
        publisher: bool,
        reply: oneshot::Sender<Result<u32>>,
    },
    Write {
        session: u32,
        stream: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Close {
        session: u32,
        reply: oneshot::Sender<()>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<u32>>,
    },
    Status {
        session: u32,
        reply: oneshot::Sender<SessionStatus>,
    },
}

struct PendingConnect {
    initiator: Initiator,
    reply: Option<oneshot::Sender<Result<u32>>>,
    purpose: ConnectPurpose,
    /// Hard cap on the whole handshake, from `connect_timeout`.
    deadline: Instant,
}

/// A recently accepted keying. A retransmitted IIKeying (its RIKeying
/// got lost) is answered with the same reply instead of minting another
/// session.
struct RecentKeying {
    cookie: [u8; COOKIE_SIZE],
    public_key: [u8; PUBLIC_KEY_SIZE],
    reply: Chunk,
    at: Instant,
}

enum ConnectPurpose {
    Caller,
    Fallback { playpath: String },
}

enum OpenReply {
    Caller(oneshot::Sender<Result<u32>>),
    Fallback,
}

/// Engine clock. Goes through the tokio clock so tests may pause time.
fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// The engine task state.
pub struct Engine {
    socket: RtmfpSocket,
    config: Config,
    log: Arc<dyn LogSink>,
    responder: Responder,
    commands: mpsc::Receiver<Command>,
    data_tx: mpsc::UnboundedSender<DataItem>,

    sessions: HashMap<u32, Session>,
    pending: HashMap<SocketAddr, PendingConnect>,
    pending_opens: HashMap<(u32, u32), OpenReply>,
    closed: HashMap<u32, Option<RtmfpError>>,
    recent_keyings: HashMap<SocketAddr, RecentKeying>,

    /// Peer subscriptions to our publication: (session, flow).
    subscribers: Vec<(u32, u32)>,
    local_publication: Option<String>,
    publication_stream: Option<(u32, u32)>,
    /// P2P publications announce on their flow but deliver only through
    /// subscriber flows; server publications also feed the flow itself.
    publication_fanout_only: bool,

    group: Option<GroupEngine>,
    group_stream: Option<(u32, u32)>,
    fallback_session: Option<u32>,
}

impl Engine {
    /// Bind the socket and start the engine task.
    ///
    /// Returns the command handle and the bound local address.
    pub fn spawn(config: Config, log: Arc<dyn LogSink>) -> Result<(EngineHandle, SocketAddr)> {
        let local = local_bind_addr(&config)?;
        let socket = RtmfpSocket::bind(
            local,
            config.host_ipv6.is_some(),
            config.socket_receive_size,
            config.socket_send_size,
        )?;
        let local_addr = socket.local_addr()?;

        let group = config
            .netgroup
            .clone()
            .map(|id| GroupEngine::new(id, config.group.clone(), false, clock_now()));

        let (command_tx, command_rx) = mpsc::channel(64);
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            socket,
            config: config.clone(),
            log,
            responder: Responder::new(),
            commands: command_rx,
            data_tx,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            pending_opens: HashMap::new(),
            closed: HashMap::new(),
            recent_keyings: HashMap::new(),
            subscribers: Vec::new(),
            local_publication: None,
            publication_stream: None,
            publication_fanout_only: false,
            group,
            group_stream: None,
            fallback_session: None,
        };
        tokio::spawn(engine.run());

        let handle = EngineHandle {
            commands: command_tx,
            data: data_rx,
            config,
        };
        Ok((handle, local_addr))
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick(clock_now()).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break, // every handle dropped
                },
                incoming = Self::recv(&mut self.socket) => match incoming {
                    Ok((datagram, from)) => self.on_datagram(&datagram, from, clock_now()).await,
                    Err(err) => {
                        self.log
                            .log(LogLevel::Fatal, &format!("socket receive failed: {err}"));
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    async fn recv(socket: &mut RtmfpSocket) -> io::Result<(Vec<u8>, SocketAddr)> {
        let (bytes, from) = socket.recv_from().await?;
        Ok((bytes.to_vec(), from))
    }

    async fn on_command(&mut self, command: Command) {
        let now = clock_now();
        match command {
            Command::Connect {
                remote,
                epd,
                connect_args,
                reply,
            } => {
                let (initiator, hello) = Initiator::start(epd, connect_args, now);
                self.send_plain(&hello, remote).await;
                self.pending.insert(
                    remote,
                    PendingConnect {
                        initiator,
                        reply: Some(reply),
                        purpose: ConnectPurpose::Caller,
                        deadline: now + self.config.connect_timeout,
                    },
                );
            }
            Command::OpenStream {
                session,
                intent,
                reply,
            } => {
                let Some(s) = self.sessions.get_mut(&session) else {
                    let _ = reply.send(Err(self.closed_reason(session)));
                    return;
                };
                let flow_id = s.open_stream_flow();
                match intent {
                    StreamIntent::Publish { .. } => {
                        self.local_publication = Some(intent.name().to_string());
                        self.publication_stream = Some((session, flow_id));
                        self.publication_fanout_only = false;
                    }
                    StreamIntent::PublishP2p { .. } => {
                        self.local_publication = Some(intent.name().to_string());
                        self.publication_stream = Some((session, flow_id));
                        self.publication_fanout_only = true;
                    }
                    _ => {}
                }
                let msg = ControlMessage::OpenStream {
                    flow_id,
                    intent,
                };
                match self
                    .sessions
                    .get_mut(&session)
                    .map(|s| s.send_message(CONTROL_FLOW_ID, &msg.encode()))
                {
                    Some(Ok(())) => {
                        self.pending_opens
                            .insert((session, flow_id), OpenReply::Caller(reply));
                        self.flush_session(session, now).await;
                    }
                    Some(Err(err)) => {
                        let _ = reply.send(Err(err));
                    }
                    None => {
                        let _ = reply.send(Err(self.closed_reason(session)));
                    }
                }
            }
            Command::OpenGroupStream {
                session,
                publisher,
                reply,
            } => {
                let Some(group) = self.group.as_mut() else {
                    let _ = reply.send(Err(RtmfpError::StreamRejected(
                        "no netgroup configured".into(),
                    )));
                    return;
                };
                if publisher {
                    group.mark_publisher();
                }
                let Some(s) = self.sessions.get_mut(&session) else {
                    let _ = reply.send(Err(self.closed_reason(session)));
                    return;
                };
                let flow_id = s.open_stream_flow();
                self.group_stream = Some((session, flow_id));
                let _ = reply.send(Ok(flow_id));
            }
            Command::Write {
                session,
                stream,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(session, stream, data, now).await);
            }
            Command::Close { session, reply } => {
                self.close_session(session, now).await;
                let _ = reply.send(());
            }
            Command::Sessions { reply } => {
                let mut ids: Vec<u32> = self.sessions.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
            Command::Status { session, reply } => {
                let status = if self.sessions.contains_key(&session) {
                    SessionStatus::Connected
                } else if let Some(err) = self.closed.get(&session) {
                    SessionStatus::Closed(err.clone())
                } else {
                    SessionStatus::Unknown
                };
                let _ = reply.send(status);
            }
        }
    }

    async fn write(
        &mut self,
        session: u32,
        stream: u32,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<usize> {
        // Group publications fan out through the group engine, not flows.
        // One write may exceed the datagram budget, so the group gets
        // MTU-sized fragments.
        if self.group_stream == Some((session, stream)) {
            let mut actions = Vec::new();
            if let Some(group) = self.group.as_mut() {
                for piece in data.chunks(MAX_FRAGMENT_PAYLOAD) {
                    actions.extend(group.publish_fragment(piece.to_vec(), now));
                }
            }
            self.apply_group_actions(actions, now).await;
            return Ok(data.len());
        }

        if !self.sessions.contains_key(&session) {
            // Closed sessions absorb writes; a failure surfaces once.
            return match self.closed.get_mut(&session).and_then(Option::take) {
                Some(err) => Err(err),
                None => Ok(0),
            };
        }

        if self.publication_stream == Some((session, stream)) {
            // Publication bytes go to every subscribed peer; a server
            // publication also feeds its own flow.
            let mut targets: Vec<(u32, u32)> = Vec::new();
            if !self.publication_fanout_only {
                targets.push((session, stream));
            }
            targets.extend(
                self.subscribers
                    .iter()
                    .copied()
                    .filter(|&(ps, pf)| (ps, pf) != (session, stream)),
            );
            for (peer_session, peer_flow) in targets {
                if let Some(peer) = self.sessions.get_mut(&peer_session) {
                    if let Err(err) = peer.send_message(peer_flow, &data) {
                        tracing::warn!(session = peer_session, %err, "subscriber write failed");
                    }
                }
                self.flush_session(peer_session, now).await;
            }
            return Ok(data.len());
        }

        if let Some(s) = self.sessions.get_mut(&session) {
            s.send_message(stream, &data)?;
        }
        self.flush_session(session, now).await;
        Ok(data.len())
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let (session_id, rest) = match split_datagram(datagram) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::trace!(%from, %err, "runt datagram");
                return;
            }
        };
        if session_id == 0 {
            self.on_handshake_datagram(rest, from, now).await;
            return;
        }

        let events = match self.sessions.get_mut(&session_id) {
            Some(s) if s.remote() == from => match s.on_datagram(rest, now) {
                Ok(events) => events,
                Err(err) => {
                    tracing::debug!(session = session_id, %err, "dropped datagram");
                    return;
                }
            },
            Some(_) => {
                tracing::debug!(session = session_id, %from, "address mismatch");
                return;
            }
            None => {
                tracing::trace!(session = session_id, "datagram for unknown session");
                return;
            }
        };
        self.on_session_events(session_id, events, now).await;
        self.flush_session(session_id, now).await;
    }

    async fn on_handshake_datagram(&mut self, rest: &[u8], from: SocketAddr, now: Instant) {
        for chunk in ChunkReader::new(rest) {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::trace!(%from, %err, "bad handshake chunk");
                    return;
                }
            };
            match chunk {
                Chunk::IHello { tag, epd } => {
                    if self.accepts_incoming() {
                        tracing::debug!(%from, %epd, "answering hello");
                        let reply = self.responder.on_ihello(tag, from);
                        self.send_plain(&reply, from).await;
                    }
                }
                Chunk::IIKeying {
                    cookie,
                    public_key,
                    connect_args,
                } => {
                    self.on_incoming_keying(cookie, public_key, connect_args, from, now)
                        .await;
                }
                chunk @ (Chunk::RHello { .. } | Chunk::RIKeying { .. }) => {
                    self.on_initiator_reply(chunk, from, now).await;
                }
                other => {
                    tracing::trace!(%from, ?other, "unexpected plaintext chunk");
                }
            }
        }
    }

    async fn on_initiator_reply(&mut self, chunk: Chunk, from: SocketAddr, now: Instant) {
        let Some(pending) = self.pending.get_mut(&from) else {
            return;
        };
        match pending.initiator.handle(chunk, now) {
            Ok(InitiatorAction::Send(next)) => self.send_plain(&next, from).await,
            Ok(InitiatorAction::Established { session_id, keys }) => {
                let Some(pending) = self.pending.remove(&from) else {
                    return;
                };
                if self.sessions.contains_key(&session_id) {
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(Err(RtmfpError::HandshakeRejected(
                            "session id collision".into(),
                        )));
                    }
                    return;
                }
                let mut session = Session::new(
                    session_id,
                    from,
                    keys,
                    self.config.socket_send_size,
                    self.config.group.disable_rate_control,
                    now,
                );
                session.mark_connected();
                self.sessions.insert(session_id, session);
                self.log
                    .log(LogLevel::Info, &format!("session {session_id} connected to {from}"));
                self.on_session_connected(session_id, now);
                if let ConnectPurpose::Fallback { playpath } = pending.purpose {
                    self.fallback_session = Some(session_id);
                    self.open_fallback_play(session_id, &playpath);
                }
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Ok(session_id));
                }
                self.flush_session(session_id, now).await;
            }
            Ok(InitiatorAction::Nothing) => {}
            Err(err) => {
                self.log
                    .log(LogLevel::Error, &format!("handshake with {from} failed: {err}"));
                if let Some(pending) = self.pending.remove(&from) {
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }

    async fn on_incoming_keying(
        &mut self,
        cookie: [u8; COOKIE_SIZE],
        public_key: [u8; PUBLIC_KEY_SIZE],
        connect_args: Vec<(String, String)>,
        from: SocketAddr,
        now: Instant,
    ) {
        // A retransmit of a keying we already accepted (the reply was
        // lost) gets the original reply; the fresh ephemeral key on any
        // new handshake attempt keeps this from shadowing reconnects.
        if let Some(recent) = self.recent_keyings.get(&from) {
            if recent.cookie == cookie && recent.public_key == public_key {
                let reply = recent.reply.clone();
                tracing::debug!(%from, "replaying keying reply");
                self.send_plain(&reply, from).await;
                return;
            }
        }
        let verdict = if self.accepts_incoming() {
            Ok(())
        } else {
            Err("peer connections not accepted".to_string())
        };
        let session_id = self.allocate_session_id();
        match self
            .responder
            .on_iikeying(cookie, public_key, connect_args, from, session_id, verdict)
        {
            Ok(accepted) => {
                self.recent_keyings.insert(
                    from,
                    RecentKeying {
                        cookie,
                        public_key,
                        reply: accepted.reply.clone(),
                        at: now,
                    },
                );
                self.send_plain(&accepted.reply, from).await;
                let mut session = Session::new(
                    accepted.session_id,
                    from,
                    accepted.keys,
                    self.config.socket_send_size,
                    self.config.group.disable_rate_control,
                    now,
                );
                session.mark_connected();
                self.sessions.insert(accepted.session_id, session);
                self.log.log(
                    LogLevel::Info,
                    &format!("accepted session {} from {from}", accepted.session_id),
                );
                self.on_session_connected(accepted.session_id, now);
                self.flush_session(accepted.session_id, now).await;
            }
            Err(ResponderReject::Refused(reply)) => self.send_plain(&reply, from).await,
            Err(ResponderReject::BadCookie) => {
                tracing::debug!(%from, "stale or forged cookie");
            }
        }
    }

    /// Wiring shared by both handshake directions.
    fn on_session_connected(&mut self, session_id: u32, now: Instant) {
        if let Some(group) = self.group.as_mut() {
            group.add_peer(session_id, now);
            let join = ControlMessage::GroupJoin {
                group: group.id().to_string(),
            };
            self.send_control(session_id, &join);
        }
    }

    async fn on_session_events(&mut self, sid: u32, events: Vec<SessionEvent>, now: Instant) {
        for event in events {
            match event {
                SessionEvent::Control(message) => self.on_control(sid, message, now).await,
                SessionEvent::StreamData { data, .. } => {
                    let _ = self.data_tx.send(Ok(data));
                }
                SessionEvent::GroupAvailability(ranges) => {
                    let actions = match self.group.as_mut() {
                        Some(group) => group.on_availability(sid, &ranges, now),
                        None => Vec::new(),
                    };
                    self.apply_group_actions(actions, now).await;
                }
                SessionEvent::GroupPull(sequences) => {
                    let actions = match self.group.as_mut() {
                        Some(group) => group.on_pull(sid, &sequences, now),
                        None => Vec::new(),
                    };
                    self.apply_group_actions(actions, now).await;
                }
                SessionEvent::GroupPush { sequence, payload } => {
                    let actions = match self.group.as_mut() {
                        Some(group) => group.on_fragment(sid, sequence, payload, now),
                        None => Vec::new(),
                    };
                    self.apply_group_actions(actions, now).await;
                }
                SessionEvent::Closed => {
                    self.finish_session(sid, None, now).await;
                    return;
                }
            }
        }
    }

    async fn on_control(&mut self, sid: u32, message: ControlMessage, now: Instant) {
        match message {
            ControlMessage::OpenStream { flow_id, intent } => {
                let verdict = match &intent {
                    StreamIntent::Play { name, .. } | StreamIntent::PeerConnect { name, .. } => {
                        if self.local_publication.as_deref() == Some(name.as_str()) {
                            Ok(())
                        } else {
                            Err(format!("no such stream: {name}"))
                        }
                    }
                    StreamIntent::PublishP2p { .. } => Ok(()),
                    StreamIntent::Publish { .. } => Err("publish not accepted by a peer".into()),
                };
                match verdict {
                    Ok(()) => {
                        if matches!(
                            intent,
                            StreamIntent::Play { .. } | StreamIntent::PeerConnect { .. }
                        ) {
                            self.subscribers.push((sid, flow_id));
                        }
                        if let Some(s) = self.sessions.get_mut(&sid) {
                            s.reserve_flow_id(flow_id);
                        }
                        self.send_control(sid, &ControlMessage::AcceptStream { flow_id });
                    }
                    Err(reason) => {
                        self.send_control(sid, &ControlMessage::RejectStream { flow_id, reason });
                    }
                }
            }
            ControlMessage::AcceptStream { flow_id } => {
                match self.pending_opens.remove(&(sid, flow_id)) {
                    Some(OpenReply::Caller(reply)) => {
                        let _ = reply.send(Ok(flow_id));
                    }
                    Some(OpenReply::Fallback) => {
                        self.log
                            .log(LogLevel::Info, "fallback stream playing");
                    }
                    None => {}
                }
            }
            ControlMessage::RejectStream { flow_id, reason } => {
                match self.pending_opens.remove(&(sid, flow_id)) {
                    Some(OpenReply::Caller(reply)) => {
                        let _ = reply.send(Err(RtmfpError::StreamRejected(reason)));
                    }
                    Some(OpenReply::Fallback) => {
                        self.log.log(
                            LogLevel::Warn,
                            &format!("fallback stream rejected: {reason}"),
                        );
                        if self.fallback_session.take() == Some(sid) {
                            self.close_session(sid, now).await;
                        }
                    }
                    None => {}
                }
            }
            ControlMessage::GroupJoin { group: id } => {
                if let Some(group) = self.group.as_mut() {
                    if group.id() == id {
                        group.add_peer(sid, now);
                    }
                }
            }
            ControlMessage::GroupLeave { .. } => {
                if let Some(group) = self.group.as_mut() {
                    group.remove_peer(sid);
                }
            }
        }
    }

    async fn apply_group_actions(&mut self, actions: Vec<GroupAction>, now: Instant) {
        for action in actions {
            match action {
                GroupAction::Advertise { peer, ranges } => {
                    if let Some(s) = self.sessions.get_mut(&peer) {
                        s.queue(Chunk::GroupAvailability(ranges));
                    }
                }
                GroupAction::Pull { peer, sequences } => {
                    if let Some(s) = self.sessions.get_mut(&peer) {
                        s.queue(Chunk::GroupPull(sequences));
                    }
                }
                GroupAction::Push {
                    peer,
                    sequence,
                    payload,
                } => {
                    if let Some(s) = self.sessions.get_mut(&peer) {
                        s.queue(Chunk::GroupPush { sequence, payload });
                    }
                }
                GroupAction::Deliver { payload, .. } => {
                    let _ = self.data_tx.send(Ok(payload));
                }
                GroupAction::StartFallback(url) => self.start_fallback(&url, now).await,
                GroupAction::StopFallback => {
                    if let Some(sid) = self.fallback_session.take() {
                        self.log
                            .log(LogLevel::Info, "group active, stopping fallback");
                        self.close_session(sid, now).await;
                    }
                }
            }
        }
    }

    /// Open a unicast play session against the configured fallback URL.
    async fn start_fallback(&mut self, url: &str, now: Instant) {
        let target = match TargetUri::parse(url) {
            Ok(target) => target,
            Err(err) => {
                self.log
                    .log(LogLevel::Error, &format!("bad fallback url {url}: {err}"));
                return;
            }
        };
        let remote = match tokio::net::lookup_host(target.authority()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.log
                        .log(LogLevel::Error, &format!("fallback host unresolvable: {url}"));
                    return;
                }
            },
            Err(err) => {
                self.log
                    .log(LogLevel::Error, &format!("fallback resolution failed: {err}"));
                return;
            }
        };
        self.log
            .log(LogLevel::Info, &format!("starting unicast fallback to {url}"));
        let args = connect_args(&target, &self.config);
        let (initiator, hello) = Initiator::start(url.to_string(), args, now);
        self.send_plain(&hello, remote).await;
        self.pending.insert(
            remote,
            PendingConnect {
                initiator,
                reply: None,
                purpose: ConnectPurpose::Fallback {
                    playpath: target.playpath,
                },
                deadline: now + self.config.connect_timeout,
            },
        );
    }

    fn open_fallback_play(&mut self, session: u32, playpath: &str) {
        let Some(s) = self.sessions.get_mut(&session) else {
            return;
        };
        let flow_id = s.open_stream_flow();
        let msg = ControlMessage::OpenStream {
            flow_id,
            intent: StreamIntent::Play {
                name: playpath.to_string(),
                audio_unbuffered: self.config.audio_unbuffered,
                video_unbuffered: self.config.video_unbuffered,
            },
        };
        self.send_control(session, &msg);
        self.pending_opens
            .insert((session, flow_id), OpenReply::Fallback);
    }

    async fn on_tick(&mut self, now: Instant) {
        self.recent_keyings
            .retain(|_, keying| now.duration_since(keying.at) < KEYING_REPLAY_INTERVAL);

        // Handshake retransmissions, bounded by the connect deadline.
        let mut resend: Vec<(SocketAddr, Chunk)> = Vec::new();
        let mut failed: Vec<SocketAddr> = Vec::new();
        for (addr, pending) in self.pending.iter_mut() {
            if now >= pending.deadline {
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Err(RtmfpError::HandshakeTimeout));
                }
                failed.push(*addr);
                continue;
            }
            match pending.initiator.on_tick(now) {
                Ok(Some(chunk)) => resend.push((*addr, chunk)),
                Ok(None) => {}
                Err(err) => {
                    if let Some(reply) = pending.reply.take() {
                        let _ = reply.send(Err(err));
                    }
                    failed.push(*addr);
                }
            }
        }
        for addr in failed {
            self.log
                .log(LogLevel::Error, &format!("handshake with {addr} timed out"));
            self.pending.remove(&addr);
        }
        for (addr, chunk) in resend {
            self.send_plain(&chunk, addr).await;
        }

        // Group timers first so their chunks ride this tick's flush.
        let actions = match self.group.as_mut() {
            Some(group) => group.tick(now),
            None => Vec::new(),
        };
        self.apply_group_actions(actions, now).await;

        // Session timers.
        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for id in ids {
            let result = match self.sessions.get_mut(&id) {
                Some(s) => s.tick(now),
                None => continue,
            };
            match result {
                Ok(()) => self.flush_session(id, now).await,
                Err(err) => self.finish_session(id, Some(err), now).await,
            }
        }
    }

    /// Locally initiated close; idempotent.
    async fn close_session(&mut self, sid: u32, now: Instant) {
        if self.sessions.contains_key(&sid) && self.group_stream.map(|(s, _)| s) == Some(sid) {
            self.leave_group(now).await;
        }
        if let Some(mut session) = self.sessions.remove(&sid) {
            session.close();
            let remote = session.remote();
            for datagram in session.flush(now) {
                let _ = self.socket.send_to(&datagram, remote).await;
            }
            self.closed.insert(sid, None);
            self.forget_session(sid);
            self.log.log(LogLevel::Info, &format!("session {sid} closed"));
        }
    }

    /// Remote close or failure.
    async fn finish_session(&mut self, sid: u32, error: Option<RtmfpError>, now: Instant) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        if error.is_some() {
            // Tell the peer we are gone, best effort.
            session.close();
            let remote = session.remote();
            for datagram in session.flush(now) {
                let _ = self.socket.send_to(&datagram, remote).await;
            }
        }
        match &error {
            Some(err) => {
                self.log
                    .log(LogLevel::Error, &format!("session {sid} failed: {err}"));
                let _ = self.data_tx.send(Err(err.clone()));
            }
            None => {
                self.log
                    .log(LogLevel::Info, &format!("session {sid} closed by remote"));
            }
        }
        // Losing the group stream's session ends our membership; the
        // remaining peers still get a goodbye.
        if self.group_stream.map(|(s, _)| s) == Some(sid) {
            self.leave_group(now).await;
        }
        self.closed.insert(sid, error);
        self.forget_session(sid);
    }

    /// Say goodbye to every known peer, then retire the group engine.
    async fn leave_group(&mut self, now: Instant) {
        let Some(mut group) = self.group.take() else {
            return;
        };
        group.leave();
        let notice = ControlMessage::GroupLeave {
            group: group.id().to_string(),
        };
        for peer in group.peer_ids() {
            self.send_control(peer, &notice);
            self.flush_session(peer, now).await;
        }
        group.finish_leave();
        self.log
            .log(LogLevel::Info, &format!("left group {}", group.id()));
    }

    /// Drop every cross-session reference to a dead session.
    fn forget_session(&mut self, sid: u32) {
        if let Some(group) = self.group.as_mut() {
            group.remove_peer(sid);
        }
        self.subscribers.retain(|&(s, _)| s != sid);
        if self.publication_stream.map(|(s, _)| s) == Some(sid) {
            self.publication_stream = None;
            self.publication_fanout_only = false;
        }
        if self.group_stream.map(|(s, _)| s) == Some(sid) {
            self.group_stream = None;
        }
        if self.fallback_session == Some(sid) {
            self.fallback_session = None;
        }
        let orphaned: Vec<(u32, u32)> = self
            .pending_opens
            .keys()
            .copied()
            .filter(|&(s, _)| s == sid)
            .collect();
        for key in orphaned {
            if let Some(OpenReply::Caller(reply)) = self.pending_opens.remove(&key) {
                let _ = reply.send(Err(self.closed_reason(sid)));
            }
        }
    }

    async fn shutdown(&mut self) {
        let now = clock_now();
        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for sid in ids {
            self.close_session(sid, now).await;
        }
    }

    async fn flush_session(&mut self, sid: u32, now: Instant) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        let remote = session.remote();
        for datagram in session.flush(now) {
            if let Err(err) = self.socket.send_to(&datagram, remote).await {
                tracing::warn!(session = sid, %err, "datagram send failed");
            }
        }
    }

    async fn send_plain(&self, chunk: &Chunk, to: SocketAddr) {
        let mut writer = ChunkWriter::new();
        writer.push(chunk);
        let datagram = frame_datagram(0, &writer.into_bytes());
        if let Err(err) = self.socket.send_to(&datagram, to).await {
            tracing::warn!(%to, %err, "handshake send failed");
        }
    }

    fn send_control(&mut self, sid: u32, message: &ControlMessage) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            if let Err(err) = session.send_message(CONTROL_FLOW_ID, &message.encode()) {
                tracing::warn!(session = sid, %err, "control send failed");
            }
        }
    }

    fn closed_reason(&self, sid: u32) -> RtmfpError {
        match self.closed.get(&sid) {
            Some(Some(err)) => err.clone(),
            _ => RtmfpError::StreamRejected("session closed".into()),
        }
    }

    fn accepts_incoming(&self) -> bool {
        self.config.p2p_publishing || self.group.is_some() || self.local_publication.is_some()
    }

    fn allocate_session_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.sessions.contains_key(&id) && !self.closed.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Command handle to a running engine.
///
/// Cheap operations are request/reply over the command channel; media
/// bytes delivered by any source (unicast flow, NetGroup, fallback)
/// arrive merged on the data channel read by [`read`](Self::read).
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    data: mpsc::UnboundedReceiver<DataItem>,
    config: Config,
}

impl EngineHandle {
    /// The configuration the engine was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a target and establish a session to it.
    pub async fn connect(&self, target: &TargetUri) -> Result<u32> {
        let authority = target.authority();
        let mut addrs = tokio::net::lookup_host(authority.clone())
            .await
            .map_err(|_| RtmfpError::AddressUnresolvable(authority.clone()))?;
        let remote = addrs
            .next()
            .ok_or(RtmfpError::AddressUnresolvable(authority))?;
        let epd = format!("{}://{}/{}", target.scheme, target.authority(), target.app);
        self.request(|reply| Command::Connect {
            remote,
            epd,
            connect_args: connect_args(target, &self.config),
            reply,
        })
        .await?
    }

    /// Open a publish stream on a session.
    pub async fn publish(&self, session: u32, name: &str) -> Result<u32> {
        self.open_stream(
            session,
            StreamIntent::Publish {
                name: name.to_string(),
                audio_unbuffered: self.config.audio_unbuffered,
                video_unbuffered: self.config.video_unbuffered,
            },
        )
        .await
    }

    /// Open a play subscription on a session.
    pub async fn play(&self, session: u32, name: &str) -> Result<u32> {
        self.open_stream(
            session,
            StreamIntent::Play {
                name: name.to_string(),
                audio_unbuffered: self.config.audio_unbuffered,
                video_unbuffered: self.config.video_unbuffered,
            },
        )
        .await
    }

    /// Subscribe to a named stream published by a specific peer.
    pub async fn connect_to_peer(&self, session: u32, peer_id: &str, name: &str) -> Result<u32> {
        self.open_stream(
            session,
            StreamIntent::PeerConnect {
                peer_id: peer_id.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    /// Announce a publication peers may subscribe to directly.
    pub async fn publish_p2p(&self, session: u32, name: &str) -> Result<u32> {
        self.open_stream(
            session,
            StreamIntent::PublishP2p {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Open the logical stream of the configured NetGroup. `publisher`
    /// marks this member as the fragment source.
    pub async fn open_group_stream(&self, session: u32, publisher: bool) -> Result<u32> {
        self.request(|reply| Command::OpenGroupStream {
            session,
            publisher,
            reply,
        })
        .await?
    }

    /// Write media bytes to a stream. Returns the bytes accepted; zero
    /// after the session closed cleanly.
    pub async fn write(&self, session: u32, stream: u32, data: &[u8]) -> Result<usize> {
        self.request(|reply| Command::Write {
            session,
            stream,
            data: data.to_vec(),
            reply,
        })
        .await?
    }

    /// Next delivered media payload; `None` once the engine is gone.
    pub async fn read(&mut self) -> Option<DataItem> {
        self.data.recv().await
    }

    /// Close a session. Closing an unknown or already closed session is
    /// a no-op.
    pub async fn close(&self, session: u32) -> Result<()> {
        self.request(|reply| Command::Close { session, reply }).await
    }

    /// Ids of the currently established sessions.
    pub async fn sessions(&self) -> Result<Vec<u32>> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    /// What the engine knows about a session id.
    pub async fn status(&self, session: u32) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { session, reply }).await
    }

    /// Block until the session reports `Connected`.
    ///
    /// Callers wanting cancellation wrap this in an interruptible wait.
    pub async fn wait_connected(&self, session: u32) -> Result<()> {
        loop {
            match self.status(session).await? {
                SessionStatus::Connected => return Ok(()),
                SessionStatus::Closed(Some(err)) => return Err(err),
                SessionStatus::Closed(None) => return Err(RtmfpError::DeliveryFailed),
                SessionStatus::Unknown => {
                    tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn open_stream(&self, session: u32, intent: StreamIntent) -> Result<u32> {
        self.request(|reply| Command::OpenStream {
            session,
            intent,
            reply,
        })
        .await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }
}

fn engine_gone() -> RtmfpError {
    RtmfpError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "engine task terminated",
    ))
}

fn local_bind_addr(config: &Config) -> Result<Option<SocketAddr>> {
    let host = config.host.as_deref().or(config.host_ipv6.as_deref());
    match host {
        Some(host) => {
            let ip: IpAddr = host
                .parse()
                .map_err(|_| RtmfpError::AddressUnresolvable(host.to_string()))?;
            Ok(Some(SocketAddr::new(ip, 0)))
        }
        None => Ok(None),
    }
}

/// Opaque identity strings forwarded in the keying chunk.
fn connect_args(target: &TargetUri, config: &Config) -> Vec<(String, String)> {
    let app = config.app.clone().unwrap_or_else(|| target.app.clone());
    let mut args = vec![("app".to_string(), app)];
    if let Some(value) = &config.swf_url {
        args.push(("swfUrl".to_string(), value.clone()));
    }
    if let Some(value) = &config.page_url {
        args.push(("pageUrl".to_string(), value.clone()));
    }
    if let Some(value) = &config.flash_ver {
        args.push(("flashVer".to_string(), value.clone()));
    }
    args
}
