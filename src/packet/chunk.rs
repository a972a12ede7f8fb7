//! Chunk codec.
//!
//! Chunk type bytes follow the RTMFP convention: handshake chunks
//! (IHello 0x30, RHello 0x70, IIKeying 0x38, RIKeying 0x78) only ever
//! appear in session-id-zero datagrams; everything else rides inside an
//! established session's encrypted chunk stream.

use crate::core::{DecodeError, COOKIE_SIZE, PUBLIC_KEY_SIZE, TAG_SIZE};

use super::fragment::{Fragment, FragmentFlags};

/// Inclusive, sorted, non-overlapping sequence ranges.
///
/// Used for selective acknowledgments and for NetGroup availability
/// advertisements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckRanges(Vec<(u64, u64)>);

impl AckRanges {
    /// Empty range set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build ranges from an iterator of sequence numbers (any order).
    pub fn from_sequences(seqs: impl IntoIterator<Item = u64>) -> Self {
        let mut seqs: Vec<u64> = seqs.into_iter().collect();
        seqs.sort_unstable();
        seqs.dedup();
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for seq in seqs {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == seq => *end = seq,
                _ => ranges.push((seq, seq)),
            }
        }
        Self(ranges)
    }

    /// Whether a sequence number falls inside any range.
    pub fn contains(&self, seq: u64) -> bool {
        self.0
            .binary_search_by(|&(start, end)| {
                if seq < start {
                    std::cmp::Ordering::Greater
                } else if seq > end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Iterate over the covered sequence numbers.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().flat_map(|&(start, end)| start..=end)
    }

    /// The raw `(start, end)` pairs.
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.0
    }

    /// Number of ranges (not sequences).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no sequence is covered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Highest covered sequence, if any.
    pub fn max(&self) -> Option<u64> {
        self.0.last().map(|&(_, end)| end)
    }

    /// Keep only the first `max_ranges` ranges.
    pub fn truncate(&mut self, max_ranges: usize) {
        self.0.truncate(max_ranges);
    }

    /// Validate raw `(start, end)` pairs in wire order: inclusive,
    /// sorted, non-overlapping.
    pub fn from_pairs(ranges: Vec<(u64, u64)>) -> Result<Self, DecodeError> {
        let mut prev_end: Option<u64> = None;
        for &(start, end) in &ranges {
            if start > end || prev_end.is_some_and(|p| start <= p) {
                return Err(DecodeError::InvalidLength);
            }
            prev_end = Some(end);
        }
        Ok(Self(ranges))
    }
}

/// One protocol chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Initiator hello: opens the handshake with an endpoint
    /// discriminator and a random tag echoed by the responder.
    IHello {
        /// Random initiator tag.
        tag: [u8; TAG_SIZE],
        /// Endpoint discriminator (target URI, opaque here).
        epd: String,
    },
    /// Responder hello: returns the initiator tag plus a stateless cookie.
    RHello {
        /// Echoed initiator tag.
        tag: [u8; TAG_SIZE],
        /// Responder cookie, echoed back in IIKeying.
        cookie: [u8; COOKIE_SIZE],
    },
    /// Initiator keying: cookie echo, public key and connect arguments.
    IIKeying {
        /// Cookie from RHello.
        cookie: [u8; COOKIE_SIZE],
        /// Initiator X25519 public key.
        public_key: [u8; PUBLIC_KEY_SIZE],
        /// Opaque identity strings (app, swfUrl, pageUrl, flashVer).
        connect_args: Vec<(String, String)>,
    },
    /// Responder keying: session id assignment and responder public key,
    /// or a refusal.
    RIKeying {
        /// Session id the initiator must use from now on (non-zero).
        session_id: u32,
        /// Responder X25519 public key.
        public_key: [u8; PUBLIC_KEY_SIZE],
        /// Refusal reason; `None` means accepted.
        refusal: Option<String>,
    },
    /// A flow data fragment.
    Data(Fragment),
    /// Selective acknowledgment for one flow.
    Ack {
        /// Acknowledged flow.
        flow_id: u32,
        /// Acknowledged sequence ranges (possibly non-contiguous).
        ranges: AckRanges,
        /// Sequences the receiver is still missing below its high-water
        /// mark; the sender should retransmit them promptly.
        missing: Vec<u64>,
    },
    /// Keepalive probe with an opaque echo value.
    Ping(u64),
    /// Keepalive reply.
    Pong(u64),
    /// Session teardown notice.
    Close,
    /// NetGroup: fragments locally available, by sequence range.
    GroupAvailability(AckRanges),
    /// NetGroup: request for specific fragments.
    GroupPull(Vec<u64>),
    /// NetGroup: proactively pushed fragment.
    GroupPush {
        /// Group-wide fragment sequence.
        sequence: u64,
        /// Fragment bytes.
        payload: Vec<u8>,
    },
}

mod types {
    pub const PING: u8 = 0x01;
    pub const CLOSE: u8 = 0x0c;
    pub const DATA: u8 = 0x10;
    pub const IHELLO: u8 = 0x30;
    pub const IIKEYING: u8 = 0x38;
    pub const PONG: u8 = 0x41;
    pub const ACK: u8 = 0x51;
    pub const GROUP_AVAILABILITY: u8 = 0x61;
    pub const GROUP_PULL: u8 = 0x62;
    pub const GROUP_PUSH: u8 = 0x63;
    pub const RHELLO: u8 = 0x70;
    pub const RIKEYING: u8 = 0x78;
}

/// Serializer for a chunk stream.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    buf: Vec<u8>,
}

impl ChunkWriter {
    /// Start an empty chunk stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk.
    pub fn push(&mut self, chunk: &Chunk) {
        let mut body = Vec::new();
        let ty = match chunk {
            Chunk::IHello { tag, epd } => {
                body.extend_from_slice(tag);
                put_str(&mut body, epd);
                types::IHELLO
            }
            Chunk::RHello { tag, cookie } => {
                body.extend_from_slice(tag);
                body.extend_from_slice(cookie);
                types::RHELLO
            }
            Chunk::IIKeying {
                cookie,
                public_key,
                connect_args,
            } => {
                body.extend_from_slice(cookie);
                body.extend_from_slice(public_key);
                body.push(connect_args.len() as u8);
                for (key, value) in connect_args {
                    put_str(&mut body, key);
                    put_str(&mut body, value);
                }
                types::IIKEYING
            }
            Chunk::RIKeying {
                session_id,
                public_key,
                refusal,
            } => {
                body.extend_from_slice(&session_id.to_be_bytes());
                body.extend_from_slice(public_key);
                match refusal {
                    None => body.push(0),
                    Some(reason) => {
                        body.push(1);
                        put_str(&mut body, reason);
                    }
                }
                types::RIKEYING
            }
            Chunk::Data(fragment) => {
                body.extend_from_slice(&fragment.flow_id.to_be_bytes());
                body.extend_from_slice(&fragment.sequence.to_be_bytes());
                body.push(fragment.flags.as_byte());
                body.extend_from_slice(&fragment.payload);
                types::DATA
            }
            Chunk::Ack {
                flow_id,
                ranges,
                missing,
            } => {
                body.extend_from_slice(&flow_id.to_be_bytes());
                put_ranges(&mut body, ranges);
                body.extend_from_slice(&(missing.len() as u16).to_be_bytes());
                for seq in missing {
                    body.extend_from_slice(&seq.to_be_bytes());
                }
                types::ACK
            }
            Chunk::Ping(echo) => {
                body.extend_from_slice(&echo.to_be_bytes());
                types::PING
            }
            Chunk::Pong(echo) => {
                body.extend_from_slice(&echo.to_be_bytes());
                types::PONG
            }
            Chunk::Close => types::CLOSE,
            Chunk::GroupAvailability(ranges) => {
                put_ranges(&mut body, ranges);
                types::GROUP_AVAILABILITY
            }
            Chunk::GroupPull(seqs) => {
                body.extend_from_slice(&(seqs.len() as u16).to_be_bytes());
                for seq in seqs {
                    body.extend_from_slice(&seq.to_be_bytes());
                }
                types::GROUP_PULL
            }
            Chunk::GroupPush { sequence, payload } => {
                body.extend_from_slice(&sequence.to_be_bytes());
                body.extend_from_slice(payload);
                types::GROUP_PUSH
            }
        };
        assert!(
            body.len() <= u16::MAX as usize,
            "chunk body of {} bytes overflows the length field",
            body.len()
        );
        self.buf.push(ty);
        self.buf
            .extend_from_slice(&(body.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(&body);
    }

    /// Append the chunks already encoded into another writer.
    pub fn append(&mut self, other: ChunkWriter) {
        self.buf.extend_from_slice(&other.buf);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no chunk was pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the chunk stream bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterator over the chunks of a chunk stream.
#[derive(Debug)]
pub struct ChunkReader<'a> {
    data: &'a [u8],
}

impl<'a> ChunkReader<'a> {
    /// Read chunks out of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl Iterator for ChunkReader<'_> {
    type Item = Result<Chunk, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < 3 {
            self.data = &[];
            return Some(Err(DecodeError::UnexpectedEof));
        }
        let ty = self.data[0];
        let len = u16::from_be_bytes([self.data[1], self.data[2]]) as usize;
        if self.data.len() < 3 + len {
            self.data = &[];
            return Some(Err(DecodeError::InvalidLength));
        }
        let body = &self.data[3..3 + len];
        self.data = &self.data[3 + len..];
        Some(decode_body(ty, body))
    }
}

fn decode_body(ty: u8, body: &[u8]) -> Result<Chunk, DecodeError> {
    let mut cur = Cursor::new(body);
    let chunk = match ty {
        types::IHELLO => Chunk::IHello {
            tag: cur.take_array()?,
            epd: cur.take_str()?,
        },
        types::RHELLO => Chunk::RHello {
            tag: cur.take_array()?,
            cookie: cur.take_array()?,
        },
        types::IIKEYING => {
            let cookie = cur.take_array()?;
            let public_key = cur.take_array()?;
            let count = cur.take_u8()? as usize;
            let mut connect_args = Vec::with_capacity(count);
            for _ in 0..count {
                let key = cur.take_str()?;
                let value = cur.take_str()?;
                connect_args.push((key, value));
            }
            Chunk::IIKeying {
                cookie,
                public_key,
                connect_args,
            }
        }
        types::RIKEYING => {
            let session_id = cur.take_u32()?;
            let public_key = cur.take_array()?;
            let refusal = match cur.take_u8()? {
                0 => None,
                _ => Some(cur.take_str()?),
            };
            Chunk::RIKeying {
                session_id,
                public_key,
                refusal,
            }
        }
        types::DATA => {
            let flow_id = cur.take_u32()?;
            let sequence = cur.take_u64()?;
            let flags = FragmentFlags::from_byte(cur.take_u8()?)?;
            let payload = cur.take_rest().to_vec();
            Chunk::Data(Fragment::new(flow_id, sequence, flags, payload))
        }
        types::ACK => {
            let flow_id = cur.take_u32()?;
            let ranges = take_ranges(&mut cur)?;
            let count = cur.take_u16()? as usize;
            let mut missing = Vec::with_capacity(count);
            for _ in 0..count {
                missing.push(cur.take_u64()?);
            }
            Chunk::Ack {
                flow_id,
                ranges,
                missing,
            }
        }
        types::PING => Chunk::Ping(cur.take_u64()?),
        types::PONG => Chunk::Pong(cur.take_u64()?),
        types::CLOSE => Chunk::Close,
        types::GROUP_AVAILABILITY => Chunk::GroupAvailability(take_ranges(&mut cur)?),
        types::GROUP_PULL => {
            let count = cur.take_u16()? as usize;
            let mut seqs = Vec::with_capacity(count);
            for _ in 0..count {
                seqs.push(cur.take_u64()?);
            }
            Chunk::GroupPull(seqs)
        }
        types::GROUP_PUSH => Chunk::GroupPush {
            sequence: cur.take_u64()?,
            payload: cur.take_rest().to_vec(),
        },
        other => return Err(DecodeError::UnknownChunk(other)),
    };
    Ok(chunk)
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_ranges(buf: &mut Vec<u8>, ranges: &AckRanges) {
    buf.extend_from_slice(&(ranges.len() as u16).to_be_bytes());
    for &(start, end) in ranges.ranges() {
        buf.extend_from_slice(&start.to_be_bytes());
        buf.extend_from_slice(&end.to_be_bytes());
    }
}

fn take_ranges(cur: &mut Cursor<'_>) -> Result<AckRanges, DecodeError> {
    let count = cur.take_u16()? as usize;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let start = cur.take_u64()?;
        let end = cur.take_u64()?;
        ranges.push((start, end));
    }
    AckRanges::from_pairs(ranges)
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

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        Ok(self.take(N)?.try_into().expect("exact length"))
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn take_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    fn take_str(&mut self) -> Result<String, DecodeError> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidLength)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}
