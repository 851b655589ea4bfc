// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Encoders for the handful of elements this engine synthesizes itself:
//! a rewritten Segment header (unknown length) and retimed Timecode
//! elements. Everything else the engine emits is copied from the
//! publisher's own bytes.

use bytes::Bytes;

use super::ids::{self, ElementId};
use super::vint;

/// A fresh Segment id+size header with unknown length, so subscribers
/// never need a byte offset that was only valid relative to the
/// publisher's own (possibly absent) size declaration.
pub fn segment_header_unknown_length() -> Bytes {
    let mut out = vint::encode_id(ids::ID_SEGMENT);
    out.extend_from_slice(&vint::unknown_size());
    Bytes::from(out)
}

/// Encodes `id` as a plain unsigned-integer leaf element: id, size, and
/// the minimal big-endian encoding of `value` (at least one byte, so a
/// zero value is still a well-formed element).
pub fn encode_uint_element(id: ElementId, value: u64) -> Vec<u8> {
    let be = value.to_be_bytes();
    let first_nonzero = be.iter().position(|&b| b != 0).unwrap_or(be.len() - 1);
    let value_bytes = &be[first_nonzero..];

    let mut out = vint::encode_id(id);
    out.extend(vint::encode_size(value_bytes.len() as u64));
    out.extend_from_slice(value_bytes);
    out
}

/// Decodes a Matroska "uint" element body: a plain big-endian integer
/// (not a VINT) of arbitrary length.
pub fn decode_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uint_element_strips_leading_zero_bytes() {
        let encoded = encode_uint_element(ids::ID_TIMECODE, 0);
        assert_eq!(encoded, vec![0xE7, 0x81, 0x00]);
    }

    #[test]
    fn decode_uint_round_trips_encode_uint_element() {
        for value in [0u64, 1, 255, 70000, u32::MAX as u64] {
            let encoded = encode_uint_element(ids::ID_TIMECODE, value);
            let id_len = vint::vint_length(encoded[0]).unwrap();
            let size_len = vint::vint_length(encoded[id_len]).unwrap();
            let body = &encoded[id_len + size_len..];
            assert_eq!(decode_uint(body), value);
        }
    }
}
