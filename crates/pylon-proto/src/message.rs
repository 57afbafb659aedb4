//! Message bodies: request, reply, batch-request, validate/close-connection.
//!
//! A [`Message`] is `(header, body)`. The body grammar for each message
//! type is fixed by the wire protocol; encapsulated parameter/return bytes
//! are opaque at this layer — the value serializer in `pylon-core` is the
//! only thing that interprets them.

#![allow(clippy::expect_used, reason = "these encode fixed, already-validated shapes and cannot fail in practice")]

use bytes::Bytes;

use crate::{
    buffer::{ReadBuf, WriteBuf},
    error::{ProtoError, Result},
    header::{Compression, MessageHeader, MessageType},
};

/// Invocation mode carried in a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvocationMode {
    /// Ordinary two-way or one-way call (the common case).
    Normal = 0,
    /// Deprecated alias for `Normal`; accepted on read, never emitted.
    NonmutatingDeprecated = 1,
    /// Call is safe to retry automatically.
    Idempotent = 2,
}

impl InvocationMode {
    /// Decode from the wire byte. `1` (`Nonmutating`) is accepted and
    /// folded into [`Self::Normal`] per the open-question resolution
    /// recorded in DESIGN.md.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 | 1 => Ok(Self::Normal),
            2 => Ok(Self::Idempotent),
            other => Err(ProtoError::Marshal(format!("unknown invocation mode {other}"))),
        }
    }

    /// Encode to the wire byte. Never emits `NonmutatingDeprecated`.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Normal | Self::NonmutatingDeprecated => 0,
            Self::Idempotent => 2,
        }
    }
}

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// Dispatch succeeded; body carries the encapsulated return values.
    Ok = 0,
    /// Servant raised a declared user exception.
    UserException = 1,
    /// No servant registered for the target identity.
    ObjectNotExist = 2,
    /// Identity exists but not the requested facet.
    FacetNotExist = 3,
    /// Servant exists but not the requested operation.
    OperationNotExist = 4,
    /// Dispatch failed with an unrecognized local error.
    UnknownLocal = 5,
    /// Dispatch failed with an unrecognized user exception type.
    UnknownUser = 6,
    /// Dispatch failed for an entirely unclassified reason.
    Unknown = 7,
}

impl ReplyStatus {
    /// Decode from the wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UserException),
            2 => Ok(Self::ObjectNotExist),
            3 => Ok(Self::FacetNotExist),
            4 => Ok(Self::OperationNotExist),
            5 => Ok(Self::UnknownLocal),
            6 => Ok(Self::UnknownUser),
            7 => Ok(Self::Unknown),
            other => Err(ProtoError::Marshal(format!("unknown reply status {other}"))),
        }
    }

    /// Encode to the wire byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Identity: `(category, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Servant category; empty string is the default category.
    pub category: String,
    /// Servant name; must be non-empty.
    pub name: String,
}

impl Identity {
    fn write(&self, w: &mut WriteBuf) {
        w.write_string(&self.category);
        w.write_string(&self.name);
    }

    fn read(r: &mut ReadBuf<'_>) -> Result<Self> {
        let category = r.read_string()?;
        let name = r.read_string()?;
        if name.is_empty() {
            return Err(ProtoError::Marshal("identity name must be non-empty".into()));
        }
        Ok(Self { category, name })
    }
}

fn write_context(w: &mut WriteBuf, context: &[(String, String)]) -> Result<()> {
    w.write_size(context.len())?;
    for (k, v) in context {
        w.write_string(k);
        w.write_string(v);
    }
    Ok(())
}

fn read_context(r: &mut ReadBuf<'_>) -> Result<Vec<(String, String)>> {
    let len = r.read_sequence_len(2)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let k = r.read_string()?;
        let v = r.read_string()?;
        out.push((k, v));
    }
    Ok(out)
}

/// Body of a `request` message (or one element of a batch request, minus
/// the leading `request_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    /// `0` for one-way/batch-oneway, otherwise a positive correlation id.
    pub request_id: i32,
    /// Target servant identity.
    pub identity: Identity,
    /// Optional facet name; empty means the default facet.
    pub facet: Option<String>,
    /// Operation name.
    pub operation: String,
    /// Invocation mode.
    pub mode: InvocationMode,
    /// Request context (arbitrary string key/value pairs).
    pub context: Vec<(String, String)>,
    /// Opaque encapsulated parameter bytes.
    pub params: Bytes,
}

impl RequestBody {
    /// Encode. When `with_request_id` is false, the leading request-id
    /// field is omitted, matching a batch request's per-element grammar.
    fn write(&self, w: &mut WriteBuf, with_request_id: bool) {
        if with_request_id {
            w.write_i32(self.request_id);
        }
        self.identity.write(w);
        match &self.facet {
            Some(f) => {
                w.write_size(1).expect("1 fits");
                w.write_string(f);
            },
            None => w.write_size(0).expect("0 fits"),
        }
        w.write_string(&self.operation);
        w.write_u8(self.mode.to_u8());
        write_context(w, &self.context).expect("context always encodable");
        w.write_bytes(&self.params);
    }

    fn read(r: &mut ReadBuf<'_>, with_request_id: bool) -> Result<Self> {
        let request_id = if with_request_id { r.read_i32()? } else { 0 };
        let identity = Identity::read(r)?;
        let facet_count = r.read_sequence_len(1)?;
        let facet = match facet_count {
            0 => None,
            1 => Some(r.read_string()?),
            other => {
                return Err(ProtoError::Marshal(format!("facet sequence length {other} must be 0 or 1")));
            },
        };
        let operation = r.read_string()?;
        let mode = InvocationMode::from_u8(r.read_u8()?)?;
        let context = read_context(r)?;
        let remaining = r.remaining();
        let params = Bytes::copy_from_slice(r.read_bytes(remaining)?);
        Ok(Self { request_id, identity, facet, operation, mode, context, params })
    }
}

/// Body of a `reply` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBody {
    /// Correlation id matching the original request.
    pub request_id: i32,
    /// Outcome of the dispatch.
    pub status: ReplyStatus,
    /// Status-specific payload: encapsulated return values for `Ok`,
    /// encapsulated exception for `UserException`, encoded identity triple
    /// for the `*NotExist` statuses, or a UTF-8 message for the unknown
    /// statuses.
    pub payload: Bytes,
}

impl ReplyBody {
    fn write(&self, w: &mut WriteBuf) {
        w.write_i32(self.request_id);
        w.write_u8(self.status.to_u8());
        w.write_bytes(&self.payload);
    }

    fn read(r: &mut ReadBuf<'_>) -> Result<Self> {
        let request_id = r.read_i32()?;
        let status = ReplyStatus::from_u8(r.read_u8()?)?;
        let remaining = r.remaining();
        let payload = Bytes::copy_from_slice(r.read_bytes(remaining)?);
        Ok(Self { request_id, status, payload })
    }
}

/// Encode the `(identity, facet, operation)` triple carried as the payload
/// of the `*NotExist` reply statuses, matching the grammar a request body
/// uses for the same fields. Shared by the server (which emits it in a
/// dispatch-error reply) and the client (which decodes it back into a rich
/// error on unmarshal).
#[must_use]
pub fn encode_identity_triple(identity: &Identity, facet: Option<&str>, operation: &str) -> Bytes {
    let mut w = WriteBuf::new();
    identity.write(&mut w);
    match facet {
        Some(f) => {
            w.write_size(1).expect("1 fits in a byte");
            w.write_string(f);
        },
        None => w.write_size(0).expect("0 fits in a byte"),
    }
    w.write_string(operation);
    w.into_bytes()
}

/// Inverse of [`encode_identity_triple`].
pub fn decode_identity_triple(payload: &[u8]) -> Result<(Identity, Option<String>, String)> {
    let mut r = ReadBuf::new(payload);
    let identity = Identity::read(&mut r)?;
    let facet_count = r.read_size()?;
    let facet = match facet_count {
        0 => None,
        1 => Some(r.read_string()?),
        other => return Err(ProtoError::Marshal(format!("facet sequence has {other} elements, expected 0 or 1"))),
    };
    let operation = r.read_string()?;
    Ok((identity, facet, operation))
}

/// Fully typed message body, keyed by the header's `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// A single two-way or one-way request.
    Request(RequestBody),
    /// A sequence of requests sharing one envelope.
    BatchRequest(Vec<RequestBody>),
    /// A reply to a prior request.
    Reply(ReplyBody),
    /// Connection-validation handshake frame; carries no body.
    ValidateConnection,
    /// Graceful-close notification; carries no body.
    CloseConnection,
}

impl Body {
    fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::BatchRequest(_) => MessageType::BatchRequest,
            Self::Reply(_) => MessageType::Reply,
            Self::ValidateConnection => MessageType::ValidateConnection,
            Self::CloseConnection => MessageType::CloseConnection,
        }
    }

    fn encode(&self) -> Bytes {
        let mut w = WriteBuf::new();
        match self {
            Self::Request(body) => body.write(&mut w, true),
            Self::BatchRequest(requests) => {
                w.write_i32(i32::try_from(requests.len()).unwrap_or(i32::MAX));
                for body in requests {
                    body.write(&mut w, false);
                }
            },
            Self::Reply(body) => body.write(&mut w),
            Self::ValidateConnection | Self::CloseConnection => {},
        }
        w.into_bytes()
    }

    fn decode(msg_type: MessageType, bytes: &[u8]) -> Result<Self> {
        match msg_type {
            MessageType::Request => {
                let mut r = ReadBuf::new(bytes);
                Ok(Self::Request(RequestBody::read(&mut r, true)?))
            },
            MessageType::BatchRequest => {
                let mut r = ReadBuf::new(bytes);
                let count = r.read_i32()?;
                if count < 0 {
                    return Err(ProtoError::NegativeSize);
                }
                let mut requests = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    requests.push(RequestBody::read(&mut r, false)?);
                }
                Ok(Self::BatchRequest(requests))
            },
            MessageType::Reply => {
                let mut r = ReadBuf::new(bytes);
                Ok(Self::Reply(ReplyBody::read(&mut r)?))
            },
            MessageType::ValidateConnection => Ok(Self::ValidateConnection),
            MessageType::CloseConnection => Ok(Self::CloseConnection),
        }
    }
}

/// A complete wire message: header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Body,
    compression: Compression,
}

impl Message {
    /// Build a message from a typed body.
    #[must_use]
    pub fn new(body: Body) -> Self {
        Self { body, compression: Compression::None }
    }

    /// The message's type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Borrow the typed body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Encode header + body to a flat byte vector.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body_bytes = self.body.encode();
        let total = MessageHeader::SIZE + body_bytes.len();
        let size = i32::try_from(total)
            .map_err(|_| ProtoError::Marshal("message size exceeds i32::MAX".into()))?;
        let header = MessageHeader::new(self.message_type(), self.compression, size);
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body_bytes);
        Ok(out)
    }

    /// Decode a complete message, validating that the header's declared
    /// size matches the buffer's actual length and does not exceed
    /// `message_size_max`.
    pub fn decode(bytes: &[u8], message_size_max: usize) -> Result<Self> {
        let header = MessageHeader::from_bytes(bytes, message_size_max)?;
        let declared = header.size() as usize;
        if declared != bytes.len() {
            return Err(ProtoError::Truncated { expected: declared, actual: bytes.len() });
        }
        let msg_type = header.message_type()?;
        let compression = header.compression()?;
        let body = Body::decode(msg_type, &bytes[MessageHeader::SIZE..])?;
        Ok(Self { body, compression })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(request_id: i32) -> RequestBody {
        RequestBody {
            request_id,
            identity: Identity { category: "MyCategory".into(), name: "MyObject".into() },
            facet: None,
            operation: "echo".into(),
            mode: InvocationMode::Normal,
            context: vec![("k".into(), "v".into())],
            params: Bytes::from_static(b"\x00\x00\x00\x0cmock-params"),
        }
    }

    #[test]
    fn request_round_trip() {
        let msg = Message::new(Body::Request(sample_request(7)));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes, 1 << 20).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn one_way_request_has_zero_id() {
        let msg = Message::new(Body::Request(sample_request(0)));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes, 1 << 20).unwrap();
        match decoded.body() {
            Body::Request(r) => assert_eq!(r.request_id, 0),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn batch_request_round_trip() {
        let batch = vec![sample_request(0), sample_request(0)];
        let msg = Message::new(Body::BatchRequest(batch.clone()));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes, 1 << 20).unwrap();
        match decoded.body() {
            Body::BatchRequest(requests) => assert_eq!(requests, &batch),
            _ => panic!("expected batch request"),
        }
    }

    #[test]
    fn reply_round_trip() {
        let reply = ReplyBody { request_id: 7, status: ReplyStatus::Ok, payload: Bytes::from_static(b"ok") };
        let msg = Message::new(Body::Reply(reply.clone()));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes, 1 << 20).unwrap();
        assert_eq!(decoded.body(), &Body::Reply(reply));
    }

    #[test]
    fn validate_and_close_are_header_only() {
        for body in [Body::ValidateConnection, Body::CloseConnection] {
            let msg = Message::new(body);
            let bytes = msg.encode().unwrap();
            assert_eq!(bytes.len(), MessageHeader::SIZE);
            let decoded = Message::decode(&bytes, 1 << 20).unwrap();
            assert_eq!(decoded.body(), msg.body());
        }
    }

    #[test]
    fn object_not_exist_identity_round_trips_through_params_style_payload() {
        let mut w = WriteBuf::new();
        Identity { category: String::new(), name: "missing".into() }.write(&mut w);
        w.write_size(1).unwrap();
        w.write_string("");
        w.write_string("echo");
        let payload = w.into_bytes();

        let reply = ReplyBody { request_id: 3, status: ReplyStatus::ObjectNotExist, payload };
        let msg = Message::new(Body::Reply(reply.clone()));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes, 1 << 20).unwrap();
        assert_eq!(decoded.body(), &Body::Reply(reply));
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let msg = Message::new(Body::ValidateConnection);
        let mut bytes = msg.encode().unwrap();
        bytes.push(0); // trailing garbage byte not reflected in header size
        assert!(Message::decode(&bytes, 1 << 20).is_err());
    }
}
