//! Initiator side of the handshake state machine.

use std::time::{Duration, Instant};

use rand::RngCore;

use crate::core::{
    Result, RtmfpError, COOKIE_SIZE, HANDSHAKE_BACKOFF, HANDSHAKE_MAX_RETRIES, HANDSHAKE_TIMEOUT,
    TAG_SIZE,
};
use crate::packet::Chunk;

use super::crypto::{HandshakeKeypair, SessionKeys};
use super::HandshakePhase;

/// What the caller must do after feeding the initiator an event.
#[derive(Debug)]
pub enum InitiatorAction {
    /// Transmit a handshake chunk (session id zero, plaintext).
    Send(Chunk),
    /// Handshake complete: the session may switch to encrypted datagrams.
    Established {
        /// Session id assigned by the responder.
        session_id: u32,
        /// Negotiated directional keys.
        keys: SessionKeys,
    },
    /// Nothing to do (stale or duplicate event).
    Nothing,
}

/// Handshake initiator.
///
/// Drives `Idle → CookieRequested → CookieReceived → KeysExchanged →
/// Connected`; any failure is terminal (`Failed`). The pending handshake
/// chunk is retransmitted with exponential backoff up to
/// [`HANDSHAKE_MAX_RETRIES`] before the handshake fails with
/// [`RtmfpError::HandshakeTimeout`].
#[derive(Debug)]
pub struct Initiator {
    phase: HandshakePhase,
    tag: [u8; TAG_SIZE],
    epd: String,
    connect_args: Vec<(String, String)>,
    keypair: HandshakeKeypair,
    cookie: Option<[u8; COOKIE_SIZE]>,
    retries: u32,
    rto: Duration,
    deadline: Instant,
}

impl Initiator {
    /// Start a handshake toward `epd` (the endpoint discriminator, i.e.
    /// the target URI). Returns the machine and the IHello to send.
    pub fn start(epd: String, connect_args: Vec<(String, String)>, now: Instant) -> (Self, Chunk) {
        let mut tag = [0u8; TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut tag);
        let initiator = Self {
            phase: HandshakePhase::CookieRequested,
            tag,
            epd,
            connect_args,
            keypair: HandshakeKeypair::generate(),
            cookie: None,
            retries: 0,
            rto: HANDSHAKE_TIMEOUT,
            deadline: now + HANDSHAKE_TIMEOUT,
        };
        let hello = initiator.ihello();
        (initiator, hello)
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Instant at which the pending chunk times out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Handle a received handshake chunk.
    pub fn handle(&mut self, chunk: Chunk, now: Instant) -> Result<InitiatorAction> {
        match (self.phase, chunk) {
            (HandshakePhase::CookieRequested, Chunk::RHello { tag, cookie }) => {
                if tag != self.tag {
                    // Foreign or stale hello; not ours to act on.
                    return Ok(InitiatorAction::Nothing);
                }
                self.cookie = Some(cookie);
                self.phase = HandshakePhase::CookieReceived;
                let keying = Chunk::IIKeying {
                    cookie,
                    public_key: self.keypair.public_bytes(),
                    connect_args: self.connect_args.clone(),
                };
                self.phase = HandshakePhase::KeysExchanged;
                self.arm(now);
                Ok(InitiatorAction::Send(keying))
            }
            (
                HandshakePhase::KeysExchanged,
                Chunk::RIKeying {
                    session_id,
                    public_key,
                    refusal,
                },
            ) => {
                if let Some(reason) = refusal {
                    self.phase = HandshakePhase::Failed;
                    return Err(RtmfpError::HandshakeRejected(reason));
                }
                if session_id == 0 {
                    self.phase = HandshakePhase::Failed;
                    return Err(RtmfpError::HandshakeRejected(
                        "responder assigned session id zero".into(),
                    ));
                }
                let cookie = self.cookie.expect("cookie set in CookieReceived");
                let keys = self.keypair.derive(&public_key, &cookie, true);
                self.phase = HandshakePhase::Connected;
                Ok(InitiatorAction::Established { session_id, keys })
            }
            // Duplicate RHello after we moved on, or anything else: ignore.
            _ => Ok(InitiatorAction::Nothing),
        }
    }

    /// Drive retransmission timers. Returns the chunk to resend when the
    /// deadline passed, or `HandshakeTimeout` once the budget is spent.
    pub fn on_tick(&mut self, now: Instant) -> Result<Option<Chunk>> {
        if self.phase == HandshakePhase::Connected
            || self.phase == HandshakePhase::Failed
            || now < self.deadline
        {
            return Ok(None);
        }
        if self.retries >= HANDSHAKE_MAX_RETRIES {
            self.phase = HandshakePhase::Failed;
            return Err(RtmfpError::HandshakeTimeout);
        }
        self.retries += 1;
        self.rto *= HANDSHAKE_BACKOFF;
        self.deadline = now + self.rto;
        let chunk = match self.phase {
            HandshakePhase::CookieRequested => self.ihello(),
            _ => Chunk::IIKeying {
                cookie: self.cookie.expect("cookie set before KeysExchanged"),
                public_key: self.keypair.public_bytes(),
                connect_args: self.connect_args.clone(),
            },
        };
        Ok(Some(chunk))
    }

    fn ihello(&self) -> Chunk {
        Chunk::IHello {
            tag: self.tag,
            epd: self.epd.clone(),
        }
    }

    fn arm(&mut self, now: Instant) {
        self.retries = 0;
        self.rto = HANDSHAKE_TIMEOUT;
        self.deadline = now + self.rto;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> (Initiator, Chunk, Instant) {
        let now = Instant::now();
        let (initiator, hello) =
            Initiator::start("rtmfp://server/live".into(), vec![], now);
        (initiator, hello, now)
    }

    #[test]
    fn happy_path_reaches_connected() {
        let (mut initiator, hello, now) = start();
        assert_eq!(initiator.phase(), HandshakePhase::CookieRequested);
        let tag = match hello {
            Chunk::IHello { tag, .. } => tag,
            other => panic!("expected IHello, got {other:?}"),
        };

        let cookie = [3u8; COOKIE_SIZE];
        let action = initiator
            .handle(Chunk::RHello { tag, cookie }, now)
            .unwrap();
        assert!(matches!(action, InitiatorAction::Send(Chunk::IIKeying { .. })));
        assert_eq!(initiator.phase(), HandshakePhase::KeysExchanged);

        let responder = HandshakeKeypair::generate();
        let action = initiator
            .handle(
                Chunk::RIKeying {
                    session_id: 9,
                    public_key: responder.public_bytes(),
                    refusal: None,
                },
                now,
            )
            .unwrap();
        match action {
            InitiatorAction::Established { session_id, .. } => assert_eq!(session_id, 9),
            other => panic!("expected Established, got {other:?}"),
        }
        assert_eq!(initiator.phase(), HandshakePhase::Connected);
    }

    #[test]
    fn mismatched_tag_is_ignored() {
        let (mut initiator, _, now) = start();
        let action = initiator
            .handle(
                Chunk::RHello {
                    tag: [0xee; TAG_SIZE],
                    cookie: [0; COOKIE_SIZE],
                },
                now,
            )
            .unwrap();
        assert!(matches!(action, InitiatorAction::Nothing));
        assert_eq!(initiator.phase(), HandshakePhase::CookieRequested);
    }

    #[test]
    fn refusal_fails_with_rejected() {
        let (mut initiator, hello, now) = start();
        let tag = match hello {
            Chunk::IHello { tag, .. } => tag,
            _ => unreachable!(),
        };
        initiator
            .handle(
                Chunk::RHello {
                    tag,
                    cookie: [0; COOKIE_SIZE],
                },
                now,
            )
            .unwrap();
        let err = initiator
            .handle(
                Chunk::RIKeying {
                    session_id: 0,
                    public_key: [0; 32],
                    refusal: Some("bad app".into()),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, RtmfpError::HandshakeRejected(_)));
        assert_eq!(initiator.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn retries_back_off_then_time_out() {
        let (mut initiator, _, _) = start();
        let mut expected_rto = HANDSHAKE_TIMEOUT;
        for _ in 0..HANDSHAKE_MAX_RETRIES {
            let at = initiator.deadline();
            let resend = initiator.on_tick(at).unwrap();
            assert!(matches!(resend, Some(Chunk::IHello { .. })));
            expected_rto *= HANDSHAKE_BACKOFF;
            assert_eq!(initiator.deadline() - at, expected_rto);
        }
        let at = initiator.deadline();
        let err = initiator.on_tick(at).unwrap_err();
        assert!(matches!(err, RtmfpError::HandshakeTimeout));
        assert_eq!(initiator.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn no_resend_before_deadline() {
        let (mut initiator, _, now) = start();
        assert!(initiator.on_tick(now).unwrap().is_none());
    }
}
