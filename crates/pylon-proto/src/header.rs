//! Fixed 14-byte message header with zero-copy parsing.
//!
//! The header is small and fixed-size on purpose: a connection routes on
//! message type and size alone without touching the body, the same way the
//! source's frame header separates routing metadata from payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{ProtoError, Result};

/// Message type carried in the header's `msg_type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A two-way or one-way request.
    Request = 0,
    /// A batch of requests sharing one envelope.
    BatchRequest = 1,
    /// A reply to a previously sent request.
    Reply = 2,
    /// Sent once by each side to complete connection validation.
    ValidateConnection = 3,
    /// Graceful-close notification.
    CloseConnection = 4,
}

impl MessageType {
    /// Decode a message type from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::BatchRequest),
            2 => Ok(Self::Reply),
            3 => Ok(Self::ValidateConnection),
            4 => Ok(Self::CloseConnection),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }

    /// Encode to the wire byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Per-message compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    /// Message is not compressed.
    None = 0,
    /// Request uncompressed, but the reply may be compressed.
    NoneReplyCompressed = 1,
    /// Message body is compressed.
    Compressed = 2,
}

impl Compression {
    /// Decode a compression flag from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::NoneReplyCompressed),
            2 => Ok(Self::Compressed),
            other => Err(ProtoError::UnknownCompression(other)),
        }
    }

    /// Encode to the wire byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed 14-byte message header (magic, versions, type, compression, size).
///
/// All multi-byte fields except `size` are single bytes; `size` is a
/// 4-byte little-endian signed integer, per the bit-exact wire protocol.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MessageHeader {
    magic: [u8; 4],
    protocol_major: u8,
    protocol_minor: u8,
    encoding_major: u8,
    encoding_minor: u8,
    msg_type: u8,
    compression: u8,
    size: [u8; 4],
}

impl MessageHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 14;

    /// Magic prefix: `0x49 0x63 0x65 0x50`.
    pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

    /// Current protocol version this crate emits.
    pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

    /// Current encoding version this crate emits.
    pub const ENCODING_VERSION: (u8, u8) = (1, 1);

    /// Build a new header for a message of `size` total bytes (header +
    /// body), using this crate's current protocol/encoding versions.
    #[must_use]
    pub fn new(msg_type: MessageType, compression: Compression, size: i32) -> Self {
        Self {
            magic: Self::MAGIC,
            protocol_major: Self::PROTOCOL_VERSION.0,
            protocol_minor: Self::PROTOCOL_VERSION.1,
            encoding_major: Self::ENCODING_VERSION.0,
            encoding_minor: Self::ENCODING_VERSION.1,
            msg_type: msg_type.to_u8(),
            compression: compression.to_u8(),
            size: size.to_le_bytes(),
        }
    }

    /// Parse a header from the front of `bytes`, validating magic and the
    /// `size` field against `message_size_max`. Does not validate
    /// `msg_type`/`compression` eagerly so callers can report the precise
    /// error from typed accessors.
    pub fn from_bytes(bytes: &[u8], message_size_max: usize) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtoError::Truncated { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        if header.magic != Self::MAGIC {
            return Err(ProtoError::InvalidMagic);
        }

        let size = header.size();
        if size < 0 {
            return Err(ProtoError::NegativeSize);
        }
        if size as usize > message_size_max {
            return Err(ProtoError::MessageTooLarge { size: size as usize, max: message_size_max });
        }

        Ok(header)
    }

    /// Serialize to the 14-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol major/minor version.
    #[must_use]
    pub fn protocol_version(&self) -> (u8, u8) {
        (self.protocol_major, self.protocol_minor)
    }

    /// Encoding major/minor version.
    #[must_use]
    pub fn encoding_version(&self) -> (u8, u8) {
        (self.encoding_major, self.encoding_minor)
    }

    /// Typed message type. Errors if the byte is unrecognized.
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    /// Typed compression flag. Errors if the byte is unrecognized.
    pub fn compression(&self) -> Result<Compression> {
        Compression::from_u8(self.compression)
    }

    /// Total message size (header + body), as declared by the sender.
    #[must_use]
    pub fn size(&self) -> i32 {
        i32::from_le_bytes(self.size)
    }
}

impl std::fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHeader")
            .field("protocol_version", &self.protocol_version())
            .field("encoding_version", &self.encoding_version())
            .field("msg_type", &self.msg_type)
            .field("compression", &self.compression)
            .field("size", &self.size())
            .finish()
    }
}

impl PartialEq for MessageHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for MessageHeader {}
