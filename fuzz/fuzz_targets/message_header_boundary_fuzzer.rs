//! Fuzz target for `MessageHeader::from_bytes` boundary conditions.
//!
//! # Strategy
//!
//! - Magic bytes: valid, off-by-one, all-zeros, all-ones, random
//! - Declared size: zero, small, at-max, just-over-max, way-over-max, negative, `i32::MAX`
//! - `msg_type`/`compression`: valid range and out-of-range bytes
//!
//! # Invariants
//!
//! - Invalid magic bytes MUST return `ProtoError::InvalidMagic`
//! - A negative declared size MUST return `ProtoError::NegativeSize`
//! - `size > message_size_max` MUST return `ProtoError::MessageTooLarge`
//! - All decode errors MUST be structured (never panic)

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pylon_proto::MessageHeader;

const MESSAGE_SIZE_MAX: usize = 1 << 20;

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryHeader {
    magic: MagicBytes,
    declared_size: DeclaredSize,
    msg_type: u8,
    compression: u8,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    AllOnes,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum DeclaredSize {
    Zero,
    Small(u8),
    AtMax,
    JustOverMax,
    WayOverMax,
    Negative,
    MaxI32,
    Random(i32),
}

fuzz_target!(|boundary: BoundaryHeader| {
    let mut buffer = [0u8; MessageHeader::SIZE];

    match boundary.magic {
        MagicBytes::Valid => buffer[0..4].copy_from_slice(&MessageHeader::MAGIC),
        MagicBytes::OffByOne(offset) => {
            buffer[0..4].copy_from_slice(&MessageHeader::MAGIC);
            let idx = (offset % 4) as usize;
            buffer[idx] = buffer[idx].wrapping_add(1);
        },
        MagicBytes::AllZeros => buffer[0..4].fill(0),
        MagicBytes::AllOnes => buffer[0..4].fill(0xFF),
        MagicBytes::Random(bytes) => buffer[0..4].copy_from_slice(&bytes),
    }

    let size_value: i32 = match boundary.declared_size {
        DeclaredSize::Zero => 0,
        DeclaredSize::Small(s) => i32::from(s),
        DeclaredSize::AtMax => MESSAGE_SIZE_MAX as i32,
        DeclaredSize::JustOverMax => MESSAGE_SIZE_MAX as i32 + 1,
        DeclaredSize::WayOverMax => MESSAGE_SIZE_MAX as i32 + 1_000_000,
        DeclaredSize::Negative => -1,
        DeclaredSize::MaxI32 => i32::MAX,
        DeclaredSize::Random(r) => r,
    };
    buffer[10..14].copy_from_slice(&size_value.to_le_bytes());
    buffer[8] = boundary.msg_type;
    buffer[9] = boundary.compression;

    match MessageHeader::from_bytes(&buffer, MESSAGE_SIZE_MAX) {
        Ok(header) => {
            assert_eq!(buffer[0..4], MessageHeader::MAGIC);
            assert!(header.size() >= 0);
            assert!(header.size() as usize <= MESSAGE_SIZE_MAX);
            let _ = header.message_type();
            let _ = header.compression();
        },
        Err(_) => {},
    }
});
