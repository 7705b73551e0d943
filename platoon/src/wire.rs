//! Wire format for the message envelope and its sixteen payload kinds.
//!
//! ## Envelope
//!
//! ```text
//! reserved (3) || type (1) || timestamp_ms (8) || payload_size (4)
//! || dest (6) || src (6) || payload (payload_size)
//!
//! type byte:
//! - bits 0-6: message kind (MSG_*)
//! - bit 7: group flag
//! ```
//!
//! All integers are big-endian. Positions are three f64 values. Address lists
//! are a two-byte count followed by that many six-byte addresses; a count
//! above [`MAX_ADDRESS_LIST`] is rejected on decode.

use crate::time::Timestamp;
use crate::types::{
    Address, Position, TaskId, GROUP_FLAG, MAX_ADDRESS_LIST, MSG_CHECK_LEADER,
    MSG_CHECK_LEADER_REPLY, MSG_CONSTRUCT, MSG_CONSTRUCT_CONFIRM, MSG_CONSTRUCT_REPLY, MSG_FOUND,
    MSG_HELLO, MSG_HELLO_R, MSG_MISSING, MSG_NEW_LEADER, MSG_NEW_LEADER_REPLY, MSG_OBSTACLE,
    MSG_RECEIVE, MSG_RECEIVE_REPLY, MSG_RETURN, MSG_SEARCH,
};

/// Size of the fixed envelope header in bytes.
pub const HEADER_SIZE: usize = 3 + 1 + 8 + 4 + 6 + 6;

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("unknown message type {0}")]
    InvalidMessageType(u8),
    #[error("payload size does not match frame length")]
    InvalidLength,
    #[error("address list longer than {MAX_ADDRESS_LIST}")]
    CapacityExceeded,
    #[error("invalid boolean byte")]
    InvalidValue,
}

/// Cursor over a received frame.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64_be(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64_be(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp, DecodeError> {
        Ok(Timestamp::from_millis(self.read_u64_be()?))
    }

    pub fn read_address(&mut self) -> Result<Address, DecodeError> {
        Ok(Address(self.read_array()?))
    }

    pub fn read_position(&mut self) -> Result<Position, DecodeError> {
        Ok(Position::new(
            self.read_f64_be()?,
            self.read_f64_be()?,
            self.read_f64_be()?,
        ))
    }

    pub fn read_address_list(&mut self) -> Result<Vec<Address>, DecodeError> {
        let count = self.read_u16_be()? as usize;
        if count > MAX_ADDRESS_LIST {
            return Err(DecodeError::CapacityExceeded);
        }
        (0..count).map(|_| self.read_address()).collect()
    }
}

/// Growable buffer for outgoing frames.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u64_be(&mut self, v: u64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f64_be(&mut self, v: f64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_timestamp(&mut self, t: Timestamp) {
        self.write_u64_be(t.as_millis());
    }

    pub fn write_address(&mut self, a: &Address) {
        self.write_bytes(&a.0);
    }

    pub fn write_position(&mut self, p: &Position) {
        self.write_f64_be(p.x);
        self.write_f64_be(p.y);
        self.write_f64_be(p.z);
    }

    /// Write an address list with its two-byte count.
    ///
    /// Lists longer than [`MAX_ADDRESS_LIST`] must be refused before encoding
    /// (see [`Body::longest_list`]); they would not decode.
    pub fn write_address_list(&mut self, list: &[Address]) {
        self.write_u16_be(u16::try_from(list.len()).unwrap_or(u16::MAX));
        for a in list {
            self.write_address(a);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice, rejecting trailing bytes.
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let value = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(value)
    }
}

/// Typed payload, one variant per message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Member heartbeat to its parent, announcing the member's routing keys.
    Hello {
        position: Position,
        routes: Vec<Address>,
    },
    HelloReply,
    /// Solicitation for new members.
    Construct { position: Position, task: TaskId },
    ConstructReply {
        position: Position,
        task: TaskId,
        routes: Vec<Address>,
    },
    ConstructConfirm {
        accept: bool,
        task: TaskId,
        level: u8,
        leader: Address,
        siblings: Vec<Address>,
    },
    Obstacle { position: Position },
    Search { missing: Address, deadline: Timestamp },
    /// Beacon of a node that lost its tree; the address is the envelope source.
    Return,
    /// Reattachment offer answering a RETURN.
    Receive {
        task: TaskId,
        leader: Address,
        level: u8,
        siblings: Vec<Address>,
    },
    ReceiveReply { routes: Vec<Address> },
    /// Root-to-root missing notice.
    Missing { missing: Address, deadline: Timestamp },
    CheckLeader,
    CheckLeaderReply,
    NewLeader { leader: Address },
    NewLeaderReply,
    /// Reattachment report sent toward the leader.
    Found { found: Address, parent: Address },
}

impl Body {
    /// Message kind code for the envelope type byte.
    pub fn kind(&self) -> u8 {
        match self {
            Body::Hello { .. } => MSG_HELLO,
            Body::HelloReply => MSG_HELLO_R,
            Body::Construct { .. } => MSG_CONSTRUCT,
            Body::ConstructReply { .. } => MSG_CONSTRUCT_REPLY,
            Body::ConstructConfirm { .. } => MSG_CONSTRUCT_CONFIRM,
            Body::Obstacle { .. } => MSG_OBSTACLE,
            Body::Search { .. } => MSG_SEARCH,
            Body::Return => MSG_RETURN,
            Body::Receive { .. } => MSG_RECEIVE,
            Body::ReceiveReply { .. } => MSG_RECEIVE_REPLY,
            Body::Missing { .. } => MSG_MISSING,
            Body::CheckLeader => MSG_CHECK_LEADER,
            Body::CheckLeaderReply => MSG_CHECK_LEADER_REPLY,
            Body::NewLeader { .. } => MSG_NEW_LEADER,
            Body::NewLeaderReply => MSG_NEW_LEADER_REPLY,
            Body::Found { .. } => MSG_FOUND,
        }
    }

    /// Human-readable kind for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Body::Hello { .. } => "HELLO",
            Body::HelloReply => "HELLO_R",
            Body::Construct { .. } => "CONSTRUCT",
            Body::ConstructReply { .. } => "CONSTRUCT_REPLY",
            Body::ConstructConfirm { .. } => "CONSTRUCT_CONFIRM",
            Body::Obstacle { .. } => "OBSTACLE",
            Body::Search { .. } => "SEARCH",
            Body::Return => "RETURN",
            Body::Receive { .. } => "RECEIVE",
            Body::ReceiveReply { .. } => "RECEIVE_REPLY",
            Body::Missing { .. } => "MISSING",
            Body::CheckLeader => "CHECK_LEADER",
            Body::CheckLeaderReply => "CHECK_LEADER_REPLY",
            Body::NewLeader { .. } => "NEW_LEADER",
            Body::NewLeaderReply => "NEW_LEADER_REPLY",
            Body::Found { .. } => "FOUND",
        }
    }

    /// Length of the longest address list carried, zero if none.
    pub fn longest_list(&self) -> usize {
        match self {
            Body::Hello { routes, .. }
            | Body::ConstructReply { routes, .. }
            | Body::ReceiveReply { routes } => routes.len(),
            Body::ConstructConfirm { siblings, .. } | Body::Receive { siblings, .. } => {
                siblings.len()
            }
            _ => 0,
        }
    }

    fn encode_payload(&self, w: &mut Writer) {
        match self {
            Body::Hello { position, routes } => {
                w.write_position(position);
                w.write_address_list(routes);
            }
            Body::Construct { position, task } => {
                w.write_position(position);
                w.write_u32_be(*task);
            }
            Body::ConstructReply {
                position,
                task,
                routes,
            } => {
                w.write_position(position);
                w.write_u32_be(*task);
                w.write_address_list(routes);
            }
            Body::ConstructConfirm {
                accept,
                task,
                level,
                leader,
                siblings,
            } => {
                w.write_bool(*accept);
                w.write_u32_be(*task);
                w.write_u8(*level);
                w.write_address(leader);
                w.write_address_list(siblings);
            }
            Body::Obstacle { position } => w.write_position(position),
            Body::Search { missing, deadline } | Body::Missing { missing, deadline } => {
                w.write_address(missing);
                w.write_timestamp(*deadline);
            }
            Body::Receive {
                task,
                leader,
                level,
                siblings,
            } => {
                w.write_u32_be(*task);
                w.write_address(leader);
                w.write_u8(*level);
                w.write_address_list(siblings);
            }
            Body::ReceiveReply { routes } => w.write_address_list(routes),
            Body::NewLeader { leader } => w.write_address(leader),
            Body::Found { found, parent } => {
                w.write_address(found);
                w.write_address(parent);
            }
            Body::HelloReply
            | Body::Return
            | Body::CheckLeader
            | Body::CheckLeaderReply
            | Body::NewLeaderReply => {}
        }
    }

    fn decode_payload(kind: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let body = match kind {
            MSG_HELLO => Body::Hello {
                position: r.read_position()?,
                routes: r.read_address_list()?,
            },
            MSG_HELLO_R => Body::HelloReply,
            MSG_CONSTRUCT => Body::Construct {
                position: r.read_position()?,
                task: r.read_u32_be()?,
            },
            MSG_CONSTRUCT_REPLY => Body::ConstructReply {
                position: r.read_position()?,
                task: r.read_u32_be()?,
                routes: r.read_address_list()?,
            },
            MSG_CONSTRUCT_CONFIRM => Body::ConstructConfirm {
                accept: r.read_bool()?,
                task: r.read_u32_be()?,
                level: r.read_u8()?,
                leader: r.read_address()?,
                siblings: r.read_address_list()?,
            },
            MSG_OBSTACLE => Body::Obstacle {
                position: r.read_position()?,
            },
            MSG_SEARCH => Body::Search {
                missing: r.read_address()?,
                deadline: r.read_timestamp()?,
            },
            MSG_RETURN => Body::Return,
            MSG_RECEIVE => Body::Receive {
                task: r.read_u32_be()?,
                leader: r.read_address()?,
                level: r.read_u8()?,
                siblings: r.read_address_list()?,
            },
            MSG_RECEIVE_REPLY => Body::ReceiveReply {
                routes: r.read_address_list()?,
            },
            MSG_MISSING => Body::Missing {
                missing: r.read_address()?,
                deadline: r.read_timestamp()?,
            },
            MSG_CHECK_LEADER => Body::CheckLeader,
            MSG_CHECK_LEADER_REPLY => Body::CheckLeaderReply,
            MSG_NEW_LEADER => Body::NewLeader {
                leader: r.read_address()?,
            },
            MSG_NEW_LEADER_REPLY => Body::NewLeaderReply,
            MSG_FOUND => Body::Found {
                found: r.read_address()?,
                parent: r.read_address()?,
            },
            other => return Err(DecodeError::InvalidMessageType(other)),
        };
        Ok(body)
    }
}

/// Envelope fields other than the kind and payload size, which derive from the body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub group: bool,
    pub timestamp: Timestamp,
    pub dest: Address,
    pub src: Address,
}

/// A complete frame: envelope plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }
}

impl Encode for Message {
    fn encode(&self, w: &mut Writer) {
        let mut payload = Writer::new();
        self.body.encode_payload(&mut payload);
        let payload = payload.finish();

        let mut kind = self.body.kind();
        if self.header.group {
            kind |= GROUP_FLAG;
        }
        w.write_bytes(&[0u8; 3]);
        w.write_u8(kind);
        w.write_timestamp(self.header.timestamp);
        w.write_u32_be(payload.len() as u32);
        w.write_address(&self.header.dest);
        w.write_address(&self.header.src);
        w.write_bytes(&payload);
    }
}

impl Decode for Message {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_bytes(3)?;
        let kind = r.read_u8()?;
        let timestamp = r.read_timestamp()?;
        let payload_size = r.read_u32_be()? as usize;
        let dest = r.read_address()?;
        let src = r.read_address()?;
        if r.remaining() != payload_size {
            return Err(DecodeError::InvalidLength);
        }
        let body = Body::decode_payload(kind & !GROUP_FLAG, r)?;
        Ok(Message {
            header: Header {
                group: kind & GROUP_FLAG != 0,
                timestamp,
                dest,
                src,
            },
            body,
        })
    }
}
