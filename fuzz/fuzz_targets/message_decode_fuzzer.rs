//! Fuzz target for `Message::decode`.
//!
//! This fuzzer tests message decoding with arbitrary byte sequences to find:
//! - Parser crashes or panics
//! - Integer overflows or underflows in size calculations
//! - Buffer over-reads
//! - Malformed headers that bypass validation
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pylon_proto::Message;

const MESSAGE_SIZE_MAX: usize = 16 * 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    let _ = Message::decode(data, MESSAGE_SIZE_MAX);
});
