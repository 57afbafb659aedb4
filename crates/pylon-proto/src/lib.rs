//! Wire framing and encoding primitives for the Pylon RPC protocol.
//!
//! Nothing in this crate knows about servants, connections, or retries —
//! it is the bit-exact layer everything else is built on: the fixed
//! message header, the message-body grammar, and the growable-buffer
//! primitives (scalars, strings, sequences, dictionaries, encapsulations,
//! tagged optionals) that bodies and the value serializer share.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod header;
pub mod message;

pub use buffer::{EncapsMark, ReadBuf, WireFormat, WriteBuf, MAX_TAG};
pub use error::{ProtoError, Result};
pub use header::{Compression, MessageHeader, MessageType};
pub use message::{
    decode_identity_triple, encode_identity_triple, Body, Identity, InvocationMode, Message, ReplyBody, ReplyStatus,
    RequestBody,
};
