// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XRCE wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.
// Multi-byte integers are little-endian.

use std::fmt;

use crate::error::{Result, XrceError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Base message header size (session id, stream id, sequence number).
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Size of the optional client key that follows the base header.
pub const CLIENT_KEY_SIZE: usize = 4;

/// Largest possible message header (base + client key).
pub const MAX_MESSAGE_HEADER_SIZE: usize = MESSAGE_HEADER_SIZE + CLIENT_KEY_SIZE;

/// Submessage header size in bytes.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

/// Session ids at or above this value omit the client key from the header.
pub const SESSION_ID_WITHOUT_CLIENT_KEY: u8 = 0x80;

/// Cookie carried by CREATE_CLIENT.
pub const XRCE_COOKIE: [u8; 4] = *b"XRCE";

/// Protocol version carried by CREATE_CLIENT.
pub const XRCE_VERSION: [u8; 2] = [0x01, 0x00];

// Submessage IDs
pub const SUBMSG_CREATE_CLIENT: u8 = 0x00;
pub const SUBMSG_CREATE: u8 = 0x01;
pub const SUBMSG_DELETE: u8 = 0x03;
pub const SUBMSG_STATUS: u8 = 0x05;
pub const SUBMSG_WRITE_DATA: u8 = 0x07;
pub const SUBMSG_READ_DATA: u8 = 0x08;
pub const SUBMSG_DATA: u8 = 0x09;
pub const SUBMSG_ACKNACK: u8 = 0x0A;
pub const SUBMSG_HEARTBEAT: u8 = 0x0B;
pub const SUBMSG_FRAGMENT: u8 = 0x0D;

// Submessage flags
/// Set on every submessage of a message whose header carries the client key.
pub const FLAG_CLIENT_KEY: u8 = 0x01;
/// CREATE: reuse an equal existing entity.
pub const FLAG_REUSE: u8 = 0x02;
/// CREATE: replace an existing entity.
pub const FLAG_REPLACE: u8 = 0x04;
/// FRAGMENT: more fragments follow this one.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x02;

// Object kinds (low nibble of an ObjectId)
pub const OBJ_PARTICIPANT: u8 = 0x01;
pub const OBJ_TOPIC: u8 = 0x02;
pub const OBJ_PUBLISHER: u8 = 0x03;
pub const OBJ_SUBSCRIBER: u8 = 0x04;
pub const OBJ_DATAWRITER: u8 = 0x05;
pub const OBJ_DATAREADER: u8 = 0x06;
pub const OBJ_TYPE: u8 = 0x0A;
pub const OBJ_QOS_PROFILE: u8 = 0x0B;
pub const OBJ_APPLICATION: u8 = 0x0C;
pub const OBJ_CLIENT: u8 = 0x0E;

// Status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_OK_MATCHED: u8 = 0x01;
pub const STATUS_ERR_DDS_ERROR: u8 = 0x80;
pub const STATUS_ERR_MISMATCH: u8 = 0x81;
pub const STATUS_ERR_ALREADY_EXISTS: u8 = 0x82;
pub const STATUS_ERR_DENIED: u8 = 0x83;
pub const STATUS_ERR_UNKNOWN_REFERENCE: u8 = 0x84;
pub const STATUS_ERR_INVALID_DATA: u8 = 0x85;
pub const STATUS_ERR_INCOMPATIBLE: u8 = 0x86;
pub const STATUS_ERR_RESOURCES: u8 = 0x87;

// Representation formats
pub const REPRESENTATION_BY_REFERENCE: u8 = 0x01;
pub const REPRESENTATION_AS_XML_STRING: u8 = 0x02;
pub const REPRESENTATION_IN_BINARY: u8 = 0x03;

/// READ_DATA `max_samples` value meaning "no limit".
pub const MAX_SAMPLES_UNLIMITED: u16 = 0xFFFF;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// 4-byte key chosen by a client; unique within one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientKey(pub [u8; 4]);

impl From<u32> for ClientKey {
    fn from(v: u32) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Participant = OBJ_PARTICIPANT,
    Topic = OBJ_TOPIC,
    Publisher = OBJ_PUBLISHER,
    Subscriber = OBJ_SUBSCRIBER,
    DataWriter = OBJ_DATAWRITER,
    DataReader = OBJ_DATAREADER,
    Type = OBJ_TYPE,
    QosProfile = OBJ_QOS_PROFILE,
    Application = OBJ_APPLICATION,
    Client = OBJ_CLIENT,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            OBJ_PARTICIPANT => Ok(Self::Participant),
            OBJ_TOPIC => Ok(Self::Topic),
            OBJ_PUBLISHER => Ok(Self::Publisher),
            OBJ_SUBSCRIBER => Ok(Self::Subscriber),
            OBJ_DATAWRITER => Ok(Self::DataWriter),
            OBJ_DATAREADER => Ok(Self::DataReader),
            OBJ_TYPE => Ok(Self::Type),
            OBJ_QOS_PROFILE => Ok(Self::QosProfile),
            OBJ_APPLICATION => Ok(Self::Application),
            OBJ_CLIENT => Ok(Self::Client),
            _ => Err(XrceError::UnknownObjectKind(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Kind an entity of this kind must be attached to, if any.
    pub fn parent_kind(self) -> Option<ObjectKind> {
        match self {
            Self::Topic | Self::Publisher | Self::Subscriber | Self::Type => {
                Some(Self::Participant)
            }
            Self::DataWriter => Some(Self::Publisher),
            Self::DataReader => Some(Self::Subscriber),
            Self::Participant | Self::QosProfile | Self::Application | Self::Client => None,
        }
    }
}

/// 2-byte object identifier: 12-bit raw id in the high bits, kind in the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u16);

/// Object id addressing the client session itself (session close).
pub const OBJECTID_CLIENT: ObjectId = ObjectId(0xFFF0 | OBJ_CLIENT as u16);

impl ObjectId {
    /// Build an id from its raw part (12 bits significant) and kind.
    pub fn new(id: u16, kind: ObjectKind) -> Self {
        Self((id << 4) | u16::from(kind.as_u8()))
    }

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn id(self) -> u16 {
        self.0 >> 4
    }

    pub fn kind(self) -> Result<ObjectKind> {
        ObjectKind::from_u8((self.0 & 0x000F) as u8)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// 16-bit request identifier; `RequestId::INVALID` is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestId(pub u16);

impl RequestId {
    pub const INVALID: RequestId = RequestId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// 16-bit stream sequence number with modulo-2^16 ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNum(pub u16);

impl SeqNum {
    pub fn wrapping_add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    pub fn wrapping_sub(self, n: u16) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Signed distance `self - other` in the half-space sense.
    pub fn delta(self, other: SeqNum) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    /// `self` comes strictly before `other` modulo 2^16.
    pub fn precedes(self, other: SeqNum) -> bool {
        self.delta(other) < 0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Raw id 0: unsequenced control traffic.
    None,
    /// Raw ids 1..=127: fire-and-forget.
    BestEffort,
    /// Raw ids 128..=255: ordered, acknowledged delivery.
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Input,
    Output,
}

/// Logical stream identifier as seen from one side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub index: u8,
    pub kind: StreamKind,
    pub direction: StreamDirection,
}

impl StreamId {
    pub const MAX_BEST_EFFORT_INDEX: u8 = 126;
    pub const MAX_RELIABLE_INDEX: u8 = 127;

    pub fn new(index: u8, kind: StreamKind, direction: StreamDirection) -> Self {
        Self {
            index,
            kind,
            direction,
        }
    }

    pub fn none(direction: StreamDirection) -> Self {
        Self::new(0, StreamKind::None, direction)
    }

    pub fn from_raw(raw: u8, direction: StreamDirection) -> Self {
        match raw {
            0 => Self::none(direction),
            1..=127 => Self::new(raw - 1, StreamKind::BestEffort, direction),
            _ => Self::new(raw - 128, StreamKind::Reliable, direction),
        }
    }

    pub fn raw(self) -> u8 {
        match self.kind {
            StreamKind::None => 0,
            StreamKind::BestEffort => self.index + 1,
            StreamKind::Reliable => self.index + 128,
        }
    }

    /// Same stream seen from the peer (input <-> output).
    pub fn peer(self) -> Self {
        let direction = match self.direction {
            StreamDirection::Input => StreamDirection::Output,
            StreamDirection::Output => StreamDirection::Input,
        };
        Self { direction, ..self }
    }
}

// ---------------------------------------------------------------------------
// Status code enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = STATUS_OK,
    OkMatched = STATUS_OK_MATCHED,
    ErrDdsError = STATUS_ERR_DDS_ERROR,
    ErrMismatch = STATUS_ERR_MISMATCH,
    ErrAlreadyExists = STATUS_ERR_ALREADY_EXISTS,
    ErrDenied = STATUS_ERR_DENIED,
    ErrUnknownReference = STATUS_ERR_UNKNOWN_REFERENCE,
    ErrInvalidData = STATUS_ERR_INVALID_DATA,
    ErrIncompatible = STATUS_ERR_INCOMPATIBLE,
    ErrResources = STATUS_ERR_RESOURCES,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            STATUS_OK => Ok(Self::Ok),
            STATUS_OK_MATCHED => Ok(Self::OkMatched),
            STATUS_ERR_DDS_ERROR => Ok(Self::ErrDdsError),
            STATUS_ERR_MISMATCH => Ok(Self::ErrMismatch),
            STATUS_ERR_ALREADY_EXISTS => Ok(Self::ErrAlreadyExists),
            STATUS_ERR_DENIED => Ok(Self::ErrDenied),
            STATUS_ERR_UNKNOWN_REFERENCE => Ok(Self::ErrUnknownReference),
            STATUS_ERR_INVALID_DATA => Ok(Self::ErrInvalidData),
            STATUS_ERR_INCOMPATIBLE => Ok(Self::ErrIncompatible),
            STATUS_ERR_RESOURCES => Ok(Self::ErrResources),
            _ => Err(XrceError::UnknownStatusCode(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkMatched)
    }
}

// ---------------------------------------------------------------------------
// Creation mode and representation
// ---------------------------------------------------------------------------

/// REUSE / REPLACE bitmask governing CREATE on an occupied object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreationMode {
    pub reuse: bool,
    pub replace: bool,
}

impl CreationMode {
    pub const REUSE: u8 = 0x01;
    pub const REPLACE: u8 = 0x02;

    pub fn from_bits(bits: u8) -> Self {
        Self {
            reuse: bits & Self::REUSE != 0,
            replace: bits & Self::REPLACE != 0,
        }
    }

    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.reuse {
            bits |= Self::REUSE;
        }
        if self.replace {
            bits |= Self::REPLACE;
        }
        bits
    }

    fn from_flags(flags: u8) -> Self {
        Self::from_bits(flags >> 1)
    }

    fn flags(self) -> u8 {
        self.bits() << 1
    }
}

/// How an entity is described to the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    /// Name of a profile known to the middleware.
    Reference(String),
    /// Full XML description.
    Xml(String),
    /// Opaque binary description.
    Binary(Vec<u8>),
}

impl Representation {
    fn format(&self) -> u8 {
        match self {
            Self::Reference(_) => REPRESENTATION_BY_REFERENCE,
            Self::Xml(_) => REPRESENTATION_AS_XML_STRING,
            Self::Binary(_) => REPRESENTATION_IN_BINARY,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.format());
        match self {
            Self::Reference(s) | Self::Xml(s) => buf.extend_from_slice(&encode_string(s)?),
            Self::Binary(b) => {
                buf.extend_from_slice(&wire_len(b.len())?.to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
        Ok(())
    }

    fn read_from(r: &mut PayloadReader<'_>) -> Result<Self> {
        match r.u8()? {
            REPRESENTATION_BY_REFERENCE => Ok(Self::Reference(r.string()?)),
            REPRESENTATION_AS_XML_STRING => Ok(Self::Xml(r.string()?)),
            REPRESENTATION_IN_BINARY => {
                let len = r.u16()? as usize;
                Ok(Self::Binary(r.bytes(len)?.to_vec()))
            }
            other => Err(XrceError::UnknownRepresentation(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level XRCE message header (4 bytes, 8 with the client key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: u8,
    pub sequence_nr: u16,
    /// Present iff `session_id < SESSION_ID_WITHOUT_CLIENT_KEY`.
    pub client_key: Option<ClientKey>,
}

impl MessageHeader {
    /// Build a header; the key is kept only when the session id calls for it.
    pub fn new(session_id: u8, stream_id: u8, sequence_nr: u16, client_key: ClientKey) -> Self {
        let client_key = if session_id < SESSION_ID_WITHOUT_CLIENT_KEY {
            Some(client_key)
        } else {
            None
        };
        Self {
            session_id,
            stream_id,
            sequence_nr,
            client_key,
        }
    }

    pub fn size(&self) -> usize {
        if self.client_key.is_some() {
            MAX_MESSAGE_HEADER_SIZE
        } else {
            MESSAGE_HEADER_SIZE
        }
    }

    /// Parse a header. Returns the header and the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        let session_id = buf[0];
        let mut header = Self {
            session_id,
            stream_id: buf[1],
            sequence_nr: u16::from_le_bytes([buf[2], buf[3]]),
            client_key: None,
        };
        if session_id < SESSION_ID_WITHOUT_CLIENT_KEY {
            if buf.len() < MAX_MESSAGE_HEADER_SIZE {
                return Err(XrceError::BufferTooShort);
            }
            header.client_key = Some(ClientKey([buf[4], buf[5], buf[6], buf[7]]));
        }
        Ok((header, header.size()))
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.session_id);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.sequence_nr.to_le_bytes());
        if let Some(key) = self.client_key {
            buf.extend_from_slice(&key.0);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_to(&mut buf);
        buf
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        Ok(Self {
            submessage_id: buf[0],
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Submessage payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT (0x00) - opens a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub cookie: [u8; 4],
    pub version: [u8; 2],
    pub client_key: ClientKey,
    pub session_id: u8,
    pub mtu: u16,
}

impl CreateClientPayload {
    pub fn new(client_key: ClientKey, session_id: u8, mtu: u16) -> Self {
        Self {
            cookie: XRCE_COOKIE,
            version: XRCE_VERSION,
            client_key,
            session_id,
            mtu,
        }
    }
}

/// CREATE (0x01) - create an entity on the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub representation: Representation,
    /// Domain id for a participant, raw parent object id otherwise.
    pub parent: u16,
    /// Carried in the submessage flags.
    pub mode: CreationMode,
}

impl CreatePayload {
    pub fn parent_id(&self) -> ObjectId {
        ObjectId::from_raw(self.parent)
    }
}

/// DELETE (0x03)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
}

/// WRITE_DATA (0x07)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataPayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// READ_DATA (0x08) - opens a data subscription on a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDataPayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    /// Raw id of the stream DATA must be delivered on.
    pub stream_id: u8,
    pub max_samples: u16,
}

/// DATA (0x09) - agent -> client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// STATUS (0x05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub status: StatusCode,
    /// Middleware-specific detail code.
    pub implementation_status: u8,
}

/// HEARTBEAT (0x0B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub first_unacked_seq: u16,
    pub last_unacked_seq: u16,
    pub stream_id: u8,
}

/// ACKNACK (0x0A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknackPayload {
    pub first_unacked_seq: u16,
    /// Bit N set means `first_unacked_seq + N` is missing.
    pub nack_bitmap: u16,
    pub stream_id: u8,
}

/// FRAGMENT (0x0D) - one piece of an oversized submessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    pub header: FragmentHeader,
    /// Carried in the submessage flags.
    pub more: bool,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Unified submessage enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    CreateClient(CreateClientPayload),
    Create(CreatePayload),
    Delete(DeletePayload),
    WriteData(WriteDataPayload),
    ReadData(ReadDataPayload),
    Data(DataPayload),
    Status(StatusPayload),
    Heartbeat(HeartbeatPayload),
    Acknack(AcknackPayload),
    Fragment(FragmentPayload),
}

impl Submessage {
    pub fn id(&self) -> u8 {
        match self {
            Self::CreateClient(_) => SUBMSG_CREATE_CLIENT,
            Self::Create(_) => SUBMSG_CREATE,
            Self::Delete(_) => SUBMSG_DELETE,
            Self::WriteData(_) => SUBMSG_WRITE_DATA,
            Self::ReadData(_) => SUBMSG_READ_DATA,
            Self::Data(_) => SUBMSG_DATA,
            Self::Status(_) => SUBMSG_STATUS,
            Self::Heartbeat(_) => SUBMSG_HEARTBEAT,
            Self::Acknack(_) => SUBMSG_ACKNACK,
            Self::Fragment(_) => SUBMSG_FRAGMENT,
        }
    }

    /// Request id carried by request-type and reply submessages.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Create(p) => Some(p.request_id),
            Self::Delete(p) => Some(p.request_id),
            Self::WriteData(p) => Some(p.request_id),
            Self::ReadData(p) => Some(p.request_id),
            Self::Data(p) => Some(p.request_id),
            Self::Status(p) => Some(p.request_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Full XRCE message
// ---------------------------------------------------------------------------

/// A complete XRCE message: one header + one or more submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrceMessage {
    pub header: MessageHeader,
    pub submessages: Vec<Submessage>,
}

// ---------------------------------------------------------------------------
// Fragment header (first bytes of a FRAGMENT payload)
// ---------------------------------------------------------------------------

/// Fragment header (4 bytes): position of this piece and piece count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_nr: u16,
    pub total_fragments: u16,
}

pub const FRAGMENT_HEADER_SIZE: usize = 4;

impl FragmentHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        Ok(Self {
            fragment_nr: u16::from_le_bytes([buf[0], buf[1]]),
            total_fragments: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.fragment_nr.to_le_bytes());
        buf.extend_from_slice(&self.total_fragments.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers (little-endian)
// ---------------------------------------------------------------------------

struct PayloadReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .ok_or(XrceError::PayloadLengthMismatch)?;
        if end > self.buf.len() {
            return Err(XrceError::PayloadLengthMismatch);
        }
        let out = &self.buf[self.off..end];
        self.off = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn array4(&mut self) -> Result<[u8; 4]> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Length-prefixed UTF-8. The bytes are consumed even when they are
    /// not valid UTF-8.
    fn string(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| XrceError::InvalidString)
    }

    fn request_and_object(&mut self) -> Result<(RequestId, ObjectId)> {
        Ok((RequestId(self.u16()?), ObjectId::from_raw(self.u16()?)))
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.off..].to_vec();
        self.off = self.buf.len();
        out
    }
}

// ---------------------------------------------------------------------------
// Submessage parsing
// ---------------------------------------------------------------------------

/// Parse a single submessage (header + payload) starting at `buf`.
/// Returns (submessage, bytes_consumed).
pub fn parse_submessage(buf: &[u8]) -> Result<(Submessage, usize)> {
    let hdr = SubmessageHeader::parse(buf)?;
    let payload_end = SUBMESSAGE_HEADER_SIZE + hdr.length as usize;
    if buf.len() < payload_end {
        return Err(XrceError::BufferTooShort);
    }
    let mut r = PayloadReader::new(&buf[SUBMESSAGE_HEADER_SIZE..payload_end]);

    let submsg = match hdr.submessage_id {
        SUBMSG_CREATE_CLIENT => Submessage::CreateClient(CreateClientPayload {
            cookie: r.array4()?,
            version: [r.u8()?, r.u8()?],
            client_key: ClientKey(r.array4()?),
            session_id: r.u8()?,
            mtu: r.u16()?,
        }),
        SUBMSG_CREATE => {
            let (request_id, object_id) = r.request_and_object()?;
            // A representation that is not UTF-8 still frames correctly; it is
            // handed on empty so the object graph answers ERR_INVALID_DATA.
            let representation = match Representation::read_from(&mut r) {
                Err(XrceError::InvalidString) => {
                    log::warn!("[XRCE] CREATE {}: representation is not valid UTF-8", object_id);
                    Representation::Reference(String::new())
                }
                other => other?,
            };
            let parent = r.u16()?;
            Submessage::Create(CreatePayload {
                request_id,
                object_id,
                representation,
                parent,
                mode: CreationMode::from_flags(hdr.flags),
            })
        }
        SUBMSG_DELETE => {
            let (request_id, object_id) = r.request_and_object()?;
            Submessage::Delete(DeletePayload {
                request_id,
                object_id,
            })
        }
        SUBMSG_WRITE_DATA => {
            let (request_id, object_id) = r.request_and_object()?;
            Submessage::WriteData(WriteDataPayload {
                request_id,
                object_id,
                data: r.rest(),
            })
        }
        SUBMSG_READ_DATA => {
            let (request_id, object_id) = r.request_and_object()?;
            Submessage::ReadData(ReadDataPayload {
                request_id,
                object_id,
                stream_id: r.u8()?,
                max_samples: r.u16()?,
            })
        }
        SUBMSG_DATA => {
            let (request_id, object_id) = r.request_and_object()?;
            Submessage::Data(DataPayload {
                request_id,
                object_id,
                data: r.rest(),
            })
        }
        SUBMSG_STATUS => {
            let (request_id, object_id) = r.request_and_object()?;
            Submessage::Status(StatusPayload {
                request_id,
                object_id,
                status: StatusCode::from_u8(r.u8()?)?,
                implementation_status: r.u8()?,
            })
        }
        SUBMSG_HEARTBEAT => Submessage::Heartbeat(HeartbeatPayload {
            first_unacked_seq: r.u16()?,
            last_unacked_seq: r.u16()?,
            stream_id: r.u8()?,
        }),
        SUBMSG_ACKNACK => Submessage::Acknack(AcknackPayload {
            first_unacked_seq: r.u16()?,
            nack_bitmap: r.u16()?,
            stream_id: r.u8()?,
        }),
        SUBMSG_FRAGMENT => {
            let header = FragmentHeader::parse(r.bytes(FRAGMENT_HEADER_SIZE)?)?;
            Submessage::Fragment(FragmentPayload {
                header,
                more: hdr.flags & FLAG_MORE_FRAGMENTS != 0,
                data: r.rest(),
            })
        }
        other => return Err(XrceError::UnknownSubmessageId(other)),
    };
    Ok((submsg, payload_end))
}

/// Parse a run of back-to-back submessages (a message body).
pub fn parse_submessages(mut buf: &[u8]) -> Result<Vec<Submessage>> {
    let mut submessages = Vec::new();
    while !buf.is_empty() {
        let (submsg, consumed) = parse_submessage(buf)?;
        submessages.push(submsg);
        buf = &buf[consumed..];
    }
    if submessages.is_empty() {
        return Err(XrceError::BufferTooShort);
    }
    Ok(submessages)
}

// ---------------------------------------------------------------------------
// Full message parsing
// ---------------------------------------------------------------------------

/// Split a datagram into its header and raw submessage bytes.
pub fn split_message(buf: &[u8]) -> Result<(MessageHeader, &[u8])> {
    let (header, consumed) = MessageHeader::parse(buf)?;
    Ok((header, &buf[consumed..]))
}

/// Parse a complete XRCE message (header + one or more submessages).
pub fn parse_message(buf: &[u8]) -> Result<XrceMessage> {
    let (header, body) = split_message(buf)?;
    Ok(XrceMessage {
        header,
        submessages: parse_submessages(body)?,
    })
}

// ---------------------------------------------------------------------------
// Submessage serialization
// ---------------------------------------------------------------------------

fn put_request(pl: &mut Vec<u8>, request_id: RequestId, object_id: ObjectId) {
    pl.extend_from_slice(&request_id.0.to_le_bytes());
    pl.extend_from_slice(&object_id.raw().to_le_bytes());
}

/// Payload length as carried on the wire.
fn wire_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| XrceError::ExceedsMaxMessageSize {
        size: len,
        max: usize::from(u16::MAX),
    })
}

/// Append a submessage (header + payload) to `out`.
///
/// `with_client_key` marks the submessage as travelling in a keyed message.
/// Fails without touching `out` when the payload does not fit the u16
/// length field.
pub fn write_submessage(submsg: &Submessage, with_client_key: bool, out: &mut Vec<u8>) -> Result<()> {
    let mut flags = 0u8;
    let mut pl = Vec::new();
    match submsg {
        Submessage::CreateClient(p) => {
            pl.extend_from_slice(&p.cookie);
            pl.extend_from_slice(&p.version);
            pl.extend_from_slice(&p.client_key.0);
            pl.push(p.session_id);
            pl.extend_from_slice(&p.mtu.to_le_bytes());
        }
        Submessage::Create(p) => {
            put_request(&mut pl, p.request_id, p.object_id);
            p.representation.write_to(&mut pl)?;
            pl.extend_from_slice(&p.parent.to_le_bytes());
            flags |= p.mode.flags();
        }
        Submessage::Delete(p) => put_request(&mut pl, p.request_id, p.object_id),
        Submessage::WriteData(p) => {
            put_request(&mut pl, p.request_id, p.object_id);
            pl.extend_from_slice(&p.data);
        }
        Submessage::ReadData(p) => {
            put_request(&mut pl, p.request_id, p.object_id);
            pl.push(p.stream_id);
            pl.extend_from_slice(&p.max_samples.to_le_bytes());
        }
        Submessage::Data(p) => {
            put_request(&mut pl, p.request_id, p.object_id);
            pl.extend_from_slice(&p.data);
        }
        Submessage::Status(p) => {
            put_request(&mut pl, p.request_id, p.object_id);
            pl.push(p.status.as_u8());
            pl.push(p.implementation_status);
        }
        Submessage::Heartbeat(p) => {
            pl.extend_from_slice(&p.first_unacked_seq.to_le_bytes());
            pl.extend_from_slice(&p.last_unacked_seq.to_le_bytes());
            pl.push(p.stream_id);
        }
        Submessage::Acknack(p) => {
            pl.extend_from_slice(&p.first_unacked_seq.to_le_bytes());
            pl.extend_from_slice(&p.nack_bitmap.to_le_bytes());
            pl.push(p.stream_id);
        }
        Submessage::Fragment(p) => {
            p.header.write_to(&mut pl);
            pl.extend_from_slice(&p.data);
            if p.more {
                flags |= FLAG_MORE_FRAGMENTS;
            }
        }
    }
    if with_client_key {
        flags |= FLAG_CLIENT_KEY;
    }

    let hdr = SubmessageHeader {
        submessage_id: submsg.id(),
        flags,
        length: wire_len(pl.len())?,
    };
    out.reserve(SUBMESSAGE_HEADER_SIZE + pl.len());
    hdr.write_to(out);
    out.extend_from_slice(&pl);
    Ok(())
}

/// Serialize a submessage (header + payload) into bytes.
pub fn serialize_submessage(submsg: &Submessage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_submessage(submsg, false, &mut out)?;
    Ok(out)
}

/// Serialize a full message (header + submessages).
pub fn serialize_message(msg: &XrceMessage) -> Result<Vec<u8>> {
    let keyed = msg.header.client_key.is_some();
    let mut buf = Vec::new();
    msg.header.write_to(&mut buf);
    for sub in &msg.submessages {
        write_submessage(sub, keyed, &mut buf)?;
    }
    Ok(buf)
}

/// Frame pre-serialized submessage bytes behind a header.
pub fn frame_message(header: &MessageHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.size() + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(body);
    buf
}

// ---------------------------------------------------------------------------
// Length-prefixed strings (representations)
// ---------------------------------------------------------------------------

/// Encode a string as [len_u16_le][utf8_bytes].
pub fn encode_string(s: &str) -> Result<Vec<u8>> {
    let len = wire_len(s.len())?;
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(buf)
}

/// Decode a length-prefixed string. Returns (string, bytes_consumed).
pub fn decode_string(buf: &[u8]) -> Result<(String, usize)> {
    if buf.len() < 2 {
        return Err(XrceError::BufferTooShort);
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Err(XrceError::BufferTooShort);
    }
    let s = String::from_utf8(buf[2..2 + len].to_vec()).map_err(|_| XrceError::InvalidString)?;
    Ok((s, 2 + len))
}
