//! Growable byte buffer with explicit read/write cursors (C1).
//!
//! `WriteBuf` and `ReadBuf` are the encode/decode primitives every higher
//! layer (message bodies, the value serializer) is built from: fixed-endian
//! scalars, the wire size-encoding, strings, sequences, dictionaries,
//! encapsulations, and tagged-optional scanning.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

/// Wire format descriptor for a tagged optional member.
///
/// Written as the low 3 bits of the tag byte; determines how a reader that
/// doesn't know the member's type can skip past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireFormat {
    /// Fixed 1-byte datum.
    F1 = 0,
    /// Fixed 2-byte datum.
    F2 = 1,
    /// Fixed 4-byte datum.
    F4 = 2,
    /// Fixed 8-byte datum.
    F8 = 3,
    /// Variable-length datum prefixed by a wire-encoded size.
    VSize = 4,
    /// Variable-length datum prefixed by a fixed 4-byte length.
    FSize = 5,
    /// The datum is itself a bare wire-encoded size value.
    Size = 6,
    /// A class instance reference; only the value serializer can skip one.
    Class = 7,
}

impl WireFormat {
    /// Decode from the low 3 bits of a tag byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::F1),
            1 => Some(Self::F2),
            2 => Some(Self::F4),
            3 => Some(Self::F8),
            4 => Some(Self::VSize),
            5 => Some(Self::FSize),
            6 => Some(Self::Size),
            7 => Some(Self::Class),
            _ => None,
        }
    }

    /// Encode to the low 3 bits of a tag byte.
    #[must_use]
    pub fn to_bits(self) -> u8 {
        self as u8
    }
}

/// Maximum tag number representable in the single-byte tag/format encoding.
pub const MAX_TAG: u8 = 31;

/// Growable write buffer with a single append-only cursor.
#[derive(Debug, Default)]
pub struct WriteBuf {
    bytes: BytesMut,
}

/// Marker returned by [`WriteBuf::start_encaps`], consumed by
/// [`WriteBuf::end_encaps`].
#[derive(Debug, Clone, Copy)]
pub struct EncapsMark {
    size_offset: usize,
}

impl WriteBuf {
    /// Create an empty write buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { bytes: BytesMut::new() }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consume the buffer, returning the written bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes.freeze()
    }

    /// Borrow the written bytes without consuming the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.bytes.put_u8(value);
    }

    /// Write a boolean as one byte (0 or 1).
    pub fn write_bool(&mut self, value: bool) {
        self.bytes.put_u8(u8::from(value));
    }

    /// Write a little-endian `i16`.
    pub fn write_i16(&mut self, value: i16) {
        self.bytes.put_i16_le(value);
    }

    /// Write a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.bytes.put_i32_le(value);
    }

    /// Write a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.bytes.put_i64_le(value);
    }

    /// Write a little-endian `f32`.
    pub fn write_f32(&mut self, value: f32) {
        self.bytes.put_f32_le(value);
    }

    /// Write a little-endian `f64`.
    pub fn write_f64(&mut self, value: f64) {
        self.bytes.put_f64_le(value);
    }

    /// Write the wire size-encoding: a single byte if `count < 255`,
    /// otherwise `0xFF` followed by a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::NegativeSize`] if `count` doesn't fit a
    /// non-negative `i32` (sizes are carried as signed wire integers).
    pub fn write_size(&mut self, count: usize) -> Result<()> {
        if count < 255 {
            self.write_u8(count as u8);
        } else {
            let signed = i32::try_from(count).map_err(|_| ProtoError::NegativeSize)?;
            self.write_u8(0xFF);
            self.write_i32(signed);
        }
        Ok(())
    }

    /// Write a UTF-8 string as size-prefixed bytes.
    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        #[allow(clippy::expect_used)]
        self.write_size(bytes.len()).expect("string length always fits i32 in practice");
        self.bytes.put_slice(bytes);
    }

    /// Write a raw byte sequence with a size prefix (used for opaque
    /// encapsulated data already encoded elsewhere).
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.bytes.put_slice(value);
    }

    /// Begin a size+encoding-prefixed encapsulation. Returns a mark that
    /// must be passed to [`Self::end_encaps`] once the body is written.
    pub fn start_encaps(&mut self, encoding: (u8, u8)) -> EncapsMark {
        let size_offset = self.bytes.len();
        self.write_i32(0); // placeholder, back-patched in end_encaps
        self.write_u8(encoding.0);
        self.write_u8(encoding.1);
        EncapsMark { size_offset }
    }

    /// Back-patch the size placeholder written by [`Self::start_encaps`].
    /// The size covers the 4-byte size field itself, the 2-byte encoding
    /// version, and the body — matching how a reader validates it.
    pub fn end_encaps(&mut self, mark: EncapsMark) {
        let total = self.bytes.len() - mark.size_offset;
        let size = i32::try_from(total).unwrap_or(i32::MAX);
        self.bytes[mark.size_offset..mark.size_offset + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Write a tag/format byte for a tagged optional member.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Marshal`] if `tag` exceeds [`MAX_TAG`].
    pub fn write_tag(&mut self, tag: u8, format: WireFormat) -> Result<()> {
        if tag > MAX_TAG {
            return Err(ProtoError::Marshal(format!("tag {tag} exceeds max {MAX_TAG}")));
        }
        self.write_u8((tag << 3) | format.to_bits());
        Ok(())
    }
}

/// Read cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ReadBuf<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Active encapsulation end offsets, innermost last.
    encaps_limits: Vec<usize>,
}

impl<'a> ReadBuf<'a> {
    /// Wrap a byte slice for reading from the start.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0, encaps_limits: Vec::new() }
    }

    /// Current read position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes remaining before the nearest active boundary (encapsulation
    /// end if inside one, else the whole buffer).
    #[must_use]
    pub fn remaining(&self) -> usize {
        let limit = self.encaps_limits.last().copied().unwrap_or(self.bytes.len());
        limit.saturating_sub(self.pos)
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(ProtoError::Truncated { expected: n, actual: self.remaining() });
        }
        Ok(())
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let b = self.bytes[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Read a boolean byte (0 or 1; any nonzero value is treated as true).
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a little-endian `i16`.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.require(2)?;
        let mut buf = std::io::Cursor::new(&self.bytes[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(buf.get_i16_le())
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.require(4)?;
        let mut buf = std::io::Cursor::new(&self.bytes[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(buf.get_i32_le())
    }

    /// Read a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.require(8)?;
        let mut buf = std::io::Cursor::new(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(buf.get_i64_le())
    }

    /// Read a little-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.require(4)?;
        let mut buf = std::io::Cursor::new(&self.bytes[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(buf.get_f32_le())
    }

    /// Read a little-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.require(8)?;
        let mut buf = std::io::Cursor::new(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(buf.get_f64_le())
    }

    /// Read the wire size-encoding.
    ///
    /// A leading byte of `0xFF` is followed by a signed 4-byte count; any
    /// other byte value is the count directly. Per the source's one
    /// documented quirk, a literal byte value of `255` written as a single
    /// byte (rather than the five-byte extended form) is accepted for
    /// backward compatibility, but callers should prefer the five-byte
    /// form on write (`WriteBuf::write_size` already does).
    pub fn read_size(&mut self) -> Result<usize> {
        let first = self.read_u8()?;
        if first == 0xFF {
            let size = self.read_i32()?;
            if size < 0 {
                return Err(ProtoError::NegativeSize);
            }
            Ok(size as usize)
        } else {
            Ok(first as usize)
        }
    }

    /// Read a size-prefixed sequence length, rejecting lengths that could
    /// not possibly fit in the remaining bytes given each element's
    /// minimum wire size. Prevents allocator denial-of-service from a
    /// maliciously large length prefix.
    pub fn read_sequence_len(&mut self, min_element_size: usize) -> Result<usize> {
        let len = self.read_size()?;
        let remaining = self.remaining();
        if min_element_size > 0 && len > remaining / min_element_size.max(1) {
            return Err(ProtoError::ImpossibleLength { len, remaining });
        }
        Ok(len)
    }

    /// Read a size-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_sequence_len(1)?;
        self.require(len)?;
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(slice.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.require(len)?;
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Begin reading an encapsulation: reads its size and encoding
    /// version, validates the size against the remaining bytes, and
    /// pushes a boundary that later reads (including nested
    /// encapsulations) must not cross.
    pub fn start_encaps(&mut self) -> Result<(u8, u8)> {
        let size = self.read_i32()?;
        if size < 6 {
            return Err(ProtoError::Marshal(format!("encapsulation size {size} smaller than header")));
        }
        let encoding = (self.read_u8()?, self.read_u8()?);
        let body_len = size as usize - 6;
        self.require(body_len)?;
        self.encaps_limits.push(self.pos + body_len);
        Ok(encoding)
    }

    /// End the innermost encapsulation, seeking to its declared end
    /// (skipping any unread trailing bytes — the forward-compatible skip
    /// of an unknown body).
    pub fn end_encaps(&mut self) -> Result<()> {
        let limit = self
            .encaps_limits
            .pop()
            .ok_or_else(|| ProtoError::Marshal("end_encaps with no active encapsulation".into()))?;
        if self.pos > limit {
            return Err(ProtoError::EncapsulationOverrun);
        }
        self.pos = limit;
        Ok(())
    }

    /// Read a tag/format byte, returning `None` at end of the current
    /// scope (so callers can distinguish "no more tagged members" from a
    /// read error).
    pub fn read_tag(&mut self) -> Result<Option<(u8, WireFormat)>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let byte = self.read_u8()?;
        let tag = byte >> 3;
        let format = WireFormat::from_bits(byte & 0x07)
            .ok_or(ProtoError::UnknownWireFormat(byte & 0x07))?;
        Ok(Some((tag, format)))
    }

    /// Skip a tagged member's data given its wire format, for every format
    /// except [`WireFormat::Class`] (which only the value serializer can
    /// skip, since doing so correctly requires following the reference
    /// graph's patch-list bookkeeping).
    pub fn skip_tagged(&mut self, format: WireFormat) -> Result<()> {
        match format {
            WireFormat::F1 => {
                self.read_u8()?;
            },
            WireFormat::F2 => {
                self.read_i16()?;
            },
            WireFormat::F4 => {
                self.read_i32()?;
            },
            WireFormat::F8 => {
                self.read_i64()?;
            },
            WireFormat::VSize => {
                let len = self.read_sequence_len(1)?;
                self.read_bytes(len)?;
            },
            WireFormat::FSize => {
                let len = self.read_i32()?;
                if len < 0 {
                    return Err(ProtoError::NegativeSize);
                }
                self.read_bytes(len as usize)?;
            },
            WireFormat::Size => {
                self.read_size()?;
            },
            WireFormat::Class => {
                return Err(ProtoError::Marshal(
                    "cannot generically skip a Class-format tagged member".into(),
                ));
            },
        }
        Ok(())
    }
}
