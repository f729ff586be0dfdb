//! Wire format encoding and decoding.
//!
//! Implements the fixed 8-byte record header:
//! ```text
//! ┌─────────┬──────┬────────────┬────────────────┬─────────┬──────────┐
//! │ Version │ Type │ Request ID │ Content Length │ Padding │ Reserved │
//! │ 1 byte  │1 byte│ uint16 BE  │ uint16 BE      │ 1 byte  │ 1 byte   │
//! └─────────┴──────┴────────────┴────────────────┴─────────┴──────────┘
//! ```
//!
//! Content is followed by `padding_length` zero bytes so that every record
//! ends on an 8-byte boundary.

use crate::error::{FcgiError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// The only protocol version this engine speaks.
pub const VERSION_1: u8 = 1;

/// Request id reserved for connection-management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = u16::MAX as usize;

/// Size of the BEGIN_REQUEST, END_REQUEST and UNKNOWN_TYPE bodies.
pub const BODY_SIZE: usize = 8;

/// BEGIN_REQUEST flag bits.
pub mod flags {
    /// Keep the connection open after this request ends.
    pub const KEEP_CONN: u8 = 0b0000_0001;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Names understood in GET_VALUES records.
pub mod values {
    /// Maximum concurrent transport connections.
    pub const MAX_CONNS: &str = "FCGI_MAX_CONNS";
    /// Maximum concurrent requests.
    pub const MAX_REQS: &str = "FCGI_MAX_REQS";
    /// Whether connections are multiplexed.
    pub const MPXS_CONNS: &str = "FCGI_MPXS_CONNS";
}

/// Record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    /// Any code outside 1..=11.
    Other(u8),
}

impl RecordType {
    /// Wire code of this type.
    pub fn code(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(code) => code,
        }
    }
}

impl From<u8> for RecordType {
    fn from(code: u8) -> Self {
        match code {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }
}

/// Application role requested by BEGIN_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    /// All roles, in slot order.
    pub const ALL: [Role; 3] = [Role::Responder, Role::Authorizer, Role::Filter];

    /// Wire code of this role.
    pub fn code(self) -> u16 {
        match self {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
        }
    }

    /// Decode a wire role code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }

    /// Index of this role's slot in a registry.
    #[inline]
    pub fn slot(self) -> usize {
        self.code() as usize - 1
    }
}

/// END_REQUEST protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    /// Decode a wire status byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ProtocolStatus::RequestComplete),
            1 => Some(ProtocolStatus::CantMpxConn),
            2 => Some(ProtocolStatus::Overloaded),
            3 => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// Padding needed to bring `content_length` to an 8-byte boundary.
#[inline]
pub fn padding_for(content_length: usize) -> u8 {
    ((8 - content_length % 8) % 8) as u8
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Protocol version.
    pub version: u8,
    /// Record type.
    pub record_type: RecordType,
    /// Request id (0 = management record).
    pub request_id: u16,
    /// Content length in bytes.
    pub content_length: u16,
    /// Padding length in bytes.
    pub padding_length: u8,
}

impl RecordHeader {
    /// Create a version 1 header with padding derived from the length.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use fcgi_mux::protocol::{RecordHeader, RecordType};
    ///
    /// let header = RecordHeader::new(RecordType::Stdout, 1, 5);
    /// assert_eq!(header.encode(), [1, 6, 0, 1, 0, 5, 3, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1] = self.record_type.code();
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            record_type: RecordType::from(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Reject headers of a foreign protocol version.
    pub fn validate(&self) -> Result<()> {
        if self.version != VERSION_1 {
            return Err(FcgiError::VersionMismatch {
                expected: VERSION_1,
                actual: self.version,
            });
        }
        Ok(())
    }

    /// Check if this is a connection-management record.
    #[inline]
    pub fn is_management(&self) -> bool {
        self.request_id == NULL_REQUEST_ID
    }

    /// Bytes that follow the header on the wire.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

/// BEGIN_REQUEST body: `role:u16 | flags:u8 | reserved[5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    /// Raw role code; may name a role this engine does not know.
    pub role: u16,
    /// Flag bits (see [`flags`]).
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn encode(&self) -> [u8; BODY_SIZE] {
        let mut buf = [0u8; BODY_SIZE];
        buf[0..2].copy_from_slice(&self.role.to_be_bytes());
        buf[2] = self.flags;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < BODY_SIZE {
            return None;
        }
        Some(Self {
            role: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
        })
    }

    /// True when the peer wants the connection kept open afterwards.
    #[inline]
    pub fn keep_conn(&self) -> bool {
        flags::has_flag(self.flags, flags::KEEP_CONN)
    }
}

/// END_REQUEST body: `app_status:u32 | protocol_status:u8 | reserved[3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    pub fn encode(&self) -> [u8; BODY_SIZE] {
        let mut buf = [0u8; BODY_SIZE];
        buf[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        buf[4] = self.protocol_status as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < BODY_SIZE {
            return None;
        }
        Some(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: ProtocolStatus::from_code(buf[4])?,
        })
    }
}

/// UNKNOWN_TYPE body: `type:u8 | reserved[7]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTypeBody {
    pub record_type: u8,
}

impl UnknownTypeBody {
    pub fn encode(&self) -> [u8; BODY_SIZE] {
        let mut buf = [0u8; BODY_SIZE];
        buf[0] = self.record_type;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        buf.first().map(|&record_type| Self { record_type })
    }
}
