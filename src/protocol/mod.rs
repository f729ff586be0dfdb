//! Protocol module - wire format, records and name-value pairs.
//!
//! This module implements the binary record codec:
//! - 8-byte header encoding/decoding and the fixed-size bodies
//! - Record reading from any [`ByteSource`] and writing to any `io::Write`
//! - Variable-length integers and name-value pair streams

mod name_value;
mod record;
mod wire_format;

pub use name_value::{
    decode_varint, encode_pair, encode_pairs, encode_varint, pair_len, read_lengths, read_pair,
    varint_len, MAX_VARINT,
};
pub use record::{encode_record, read_header, read_record, write_record, ByteSource, Record};
pub use wire_format::{
    flags, padding_for, values, BeginRequestBody, EndRequestBody, ProtocolStatus, RecordHeader,
    RecordType, Role, UnknownTypeBody, BODY_SIZE, HEADER_SIZE, MAX_CONTENT_LENGTH,
    NULL_REQUEST_ID, VERSION_1,
};
