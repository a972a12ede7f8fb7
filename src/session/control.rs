//! Session control messages.
//!
//! Everything that is not media travels as small framed messages on the
//! control flow (flow 2): stream open intents and their verdicts, and
//! NetGroup membership signaling. Media bytes never appear here.

use crate::core::DecodeError;

/// Why a stream is being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamIntent {
    /// Publish a named stream to the remote.
    Publish {
        /// Publication name (prefix such as `mp4:` included, opaque).
        name: String,
        /// Skip remote audio buffering for lower latency.
        audio_unbuffered: bool,
        /// Skip remote video buffering for lower latency.
        video_unbuffered: bool,
    },
    /// Subscribe to a named stream.
    Play {
        /// Publication name to play.
        name: String,
        /// Skip local audio buffering for lower latency.
        audio_unbuffered: bool,
        /// Skip local video buffering for lower latency.
        video_unbuffered: bool,
    },
    /// Subscribe to a named stream published by a specific peer; the
    /// remote (usually the rendezvous server) routes accordingly.
    PeerConnect {
        /// Target peer id.
        peer_id: String,
        /// Publication name on that peer.
        name: String,
    },
    /// Announce a publication available for direct peer subscription.
    PublishP2p {
        /// Publication name peers may play.
        name: String,
    },
}

impl StreamIntent {
    /// The publication name this intent refers to.
    pub fn name(&self) -> &str {
        match self {
            Self::Publish { name, .. }
            | Self::Play { name, .. }
            | Self::PeerConnect { name, .. }
            | Self::PublishP2p { name } => name,
        }
    }
}

/// One control-flow message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Open a stream on `flow_id` with the given intent.
    OpenStream {
        /// Flow the opener will use (and the handle it gets back).
        flow_id: u32,
        /// What the stream is for.
        intent: StreamIntent,
    },
    /// The remote accepted a stream open.
    AcceptStream {
        /// Echoed flow id.
        flow_id: u32,
    },
    /// The remote refused a stream open.
    RejectStream {
        /// Echoed flow id.
        flow_id: u32,
        /// Human-readable refusal reason.
        reason: String,
    },
    /// The sender joined the named NetGroup.
    GroupJoin {
        /// Group identifier.
        group: String,
    },
    /// The sender left the named NetGroup.
    GroupLeave {
        /// Group identifier.
        group: String,
    },
}

mod tags {
    pub const OPEN_STREAM: u8 = 0x01;
    pub const ACCEPT_STREAM: u8 = 0x02;
    pub const REJECT_STREAM: u8 = 0x03;
    pub const GROUP_JOIN: u8 = 0x10;
    pub const GROUP_LEAVE: u8 = 0x11;

    pub const INTENT_PUBLISH: u8 = 0x01;
    pub const INTENT_PLAY: u8 = 0x02;
    pub const INTENT_PEER_CONNECT: u8 = 0x03;
    pub const INTENT_PUBLISH_P2P: u8 = 0x04;
}

impl ControlMessage {
    /// Serialize into a control-flow message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::OpenStream { flow_id, intent } => {
                buf.push(tags::OPEN_STREAM);
                buf.extend_from_slice(&flow_id.to_be_bytes());
                match intent {
                    StreamIntent::Publish {
                        name,
                        audio_unbuffered,
                        video_unbuffered,
                    } => {
                        buf.push(tags::INTENT_PUBLISH);
                        put_str(&mut buf, name);
                        buf.push(flags_byte(*audio_unbuffered, *video_unbuffered));
                    }
                    StreamIntent::Play {
                        name,
                        audio_unbuffered,
                        video_unbuffered,
                    } => {
                        buf.push(tags::INTENT_PLAY);
                        put_str(&mut buf, name);
                        buf.push(flags_byte(*audio_unbuffered, *video_unbuffered));
                    }
                    StreamIntent::PeerConnect { peer_id, name } => {
                        buf.push(tags::INTENT_PEER_CONNECT);
                        put_str(&mut buf, peer_id);
                        put_str(&mut buf, name);
                    }
                    StreamIntent::PublishP2p { name } => {
                        buf.push(tags::INTENT_PUBLISH_P2P);
                        put_str(&mut buf, name);
                    }
                }
            }
            Self::AcceptStream { flow_id } => {
                buf.push(tags::ACCEPT_STREAM);
                buf.extend_from_slice(&flow_id.to_be_bytes());
            }
            Self::RejectStream { flow_id, reason } => {
                buf.push(tags::REJECT_STREAM);
                buf.extend_from_slice(&flow_id.to_be_bytes());
                put_str(&mut buf, reason);
            }
            Self::GroupJoin { group } => {
                buf.push(tags::GROUP_JOIN);
                put_str(&mut buf, group);
            }
            Self::GroupLeave { group } => {
                buf.push(tags::GROUP_LEAVE);
                put_str(&mut buf, group);
            }
        }
        buf
    }

    /// Parse a control-flow message body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cur = Cursor::new(data);
        let msg = match cur.take_u8()? {
            tags::OPEN_STREAM => {
                let flow_id = cur.take_u32()?;
                let intent = match cur.take_u8()? {
                    tags::INTENT_PUBLISH => {
                        let name = cur.take_str()?;
                        let (audio_unbuffered, video_unbuffered) = split_flags(cur.take_u8()?);
                        StreamIntent::Publish {
                            name,
                            audio_unbuffered,
                            video_unbuffered,
                        }
                    }
                    tags::INTENT_PLAY => {
                        let name = cur.take_str()?;
                        let (audio_unbuffered, video_unbuffered) = split_flags(cur.take_u8()?);
                        StreamIntent::Play {
                            name,
                            audio_unbuffered,
                            video_unbuffered,
                        }
                    }
                    tags::INTENT_PEER_CONNECT => StreamIntent::PeerConnect {
                        peer_id: cur.take_str()?,
                        name: cur.take_str()?,
                    },
                    tags::INTENT_PUBLISH_P2P => StreamIntent::PublishP2p {
                        name: cur.take_str()?,
                    },
                    other => return Err(DecodeError::UnknownChunk(other)),
                };
                Self::OpenStream { flow_id, intent }
            }
            tags::ACCEPT_STREAM => Self::AcceptStream {
                flow_id: cur.take_u32()?,
            },
            tags::REJECT_STREAM => Self::RejectStream {
                flow_id: cur.take_u32()?,
                reason: cur.take_str()?,
            },
            tags::GROUP_JOIN => Self::GroupJoin {
                group: cur.take_str()?,
            },
            tags::GROUP_LEAVE => Self::GroupLeave {
                group: cur.take_str()?,
            },
            other => return Err(DecodeError::UnknownChunk(other)),
        };
        Ok(msg)
    }
}

fn flags_byte(audio: bool, video: bool) -> u8 {
    (audio as u8) | ((video as u8) << 1)
}

fn split_flags(byte: u8) -> (bool, bool) {
    (byte & 0x01 != 0, byte & 0x02 != 0)
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_str(&mut self) -> Result<String, DecodeError> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidLength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) {
        let bytes = msg.encode();
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn stream_intents_roundtrip() {
        roundtrip(ControlMessage::OpenStream {
            flow_id: 3,
            intent: StreamIntent::Publish {
                name: "mp4:movies/film.f4v".into(),
                audio_unbuffered: true,
                video_unbuffered: false,
            },
        });
        roundtrip(ControlMessage::OpenStream {
            flow_id: 4,
            intent: StreamIntent::Play {
                name: "mystream".into(),
                audio_unbuffered: false,
                video_unbuffered: true,
            },
        });
        roundtrip(ControlMessage::OpenStream {
            flow_id: 5,
            intent: StreamIntent::PeerConnect {
                peer_id: "0123abcd".into(),
                name: "camera".into(),
            },
        });
        roundtrip(ControlMessage::OpenStream {
            flow_id: 6,
            intent: StreamIntent::PublishP2p {
                name: "camera".into(),
            },
        });
    }

    #[test]
    fn verdicts_and_group_signals_roundtrip() {
        roundtrip(ControlMessage::AcceptStream { flow_id: 3 });
        roundtrip(ControlMessage::RejectStream {
            flow_id: 3,
            reason: "no such stream".into(),
        });
        roundtrip(ControlMessage::GroupJoin {
            group: "G:0123".into(),
        });
        roundtrip(ControlMessage::GroupLeave {
            group: "G:0123".into(),
        });
    }

    #[test]
    fn truncated_message_errors() {
        let bytes = ControlMessage::GroupJoin {
            group: "G:0123".into(),
        }
        .encode();
        assert_eq!(
            ControlMessage::decode(&bytes[..3]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn unknown_tag_errors() {
        assert_eq!(
            ControlMessage::decode(&[0xff]),
            Err(DecodeError::UnknownChunk(0xff))
        );
    }
}
