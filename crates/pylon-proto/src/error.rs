//! Wire-level error taxonomy.
//!
//! Every failure a decoder can produce while walking a message header or
//! body lands here. These map onto the *Protocol* group of the error
//! taxonomy: callers one layer up (the connection state machine) decide
//! whether a `ProtoError` is fatal to the connection or just rejects one
//! message.

/// Errors produced while encoding or decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// Buffer too short to contain the declared structure.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Header magic did not match the protocol's fixed prefix.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Unsupported protocol major/minor version.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocolVersion {
        /// Major version read from the header.
        major: u8,
        /// Minor version read from the header.
        minor: u8,
    },

    /// Unsupported encoding major/minor version.
    #[error("unsupported encoding version {major}.{minor}")]
    UnsupportedEncodingVersion {
        /// Major version read from the header.
        major: u8,
        /// Minor version read from the header.
        minor: u8,
    },

    /// Message type byte did not match any known variant.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Compression flag byte did not match any known variant.
    #[error("unknown compression flag {0}")]
    UnknownCompression(u8),

    /// Declared message size exceeds the configured maximum.
    #[error("message size {size} exceeds MessageSizeMax {max}")]
    MessageTooLarge {
        /// Size claimed by the header.
        size: usize,
        /// Configured `MessageSizeMax`.
        max: usize,
    },

    /// A size prefix decoded to a negative count.
    #[error("negative size encountered while decoding")]
    NegativeSize,

    /// A sequence or dictionary length would read past the remaining
    /// buffer even at the minimum possible per-element size — rejected
    /// before allocating to avoid an allocator denial-of-service.
    #[error("sequence length {len} impossible given {remaining} bytes remaining")]
    ImpossibleLength {
        /// Claimed element count.
        len: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// String bytes were not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// An encapsulation read or write attempted to cross the
    /// encapsulation's own boundary.
    #[error("read crossed encapsulation boundary")]
    EncapsulationOverrun,

    /// A tagged member's wire-format descriptor byte was unrecognized.
    #[error("unknown tagged wire format {0}")]
    UnknownWireFormat(u8),

    /// Generic marshaling failure with a message, used for conditions
    /// the other variants don't name precisely (mirrors the source's
    /// single catch-all `MarshalError`).
    #[error("marshal error: {0}")]
    Marshal(String),
}

/// Convenience alias used throughout the wire codec.
pub type Result<T> = std::result::Result<T, ProtoError>;
