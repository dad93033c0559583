//! 176-byte drone radio frame unmasking and classification.
//!
//! Frames arrive as a hex string over the wire. Before a frame can be
//! routed it has to be demasked: XORed against a fixed mask, then
//! permuted according to a fixed index table. The first byte of the
//! result tells us whether we are holding a key packet (expensive, goes
//! through the dispatcher) or a data packet (cheap, served straight from
//! the affinity map).

use std::fmt;

const FRAME_LEN: usize = 176;

/// Permutation table: `out[PERMUTATION[i]] = tmp[i]`.
const PERMUTATION: [usize; FRAME_LEN] = [
    101, 48, 167, 63, 1, 40, 27, 171, 74, 28, 117, 159, 21, 126, 138, 175, 114, 125, 37, 149, 100,
    110, 122, 4, 116, 42, 111, 174, 50, 57, 86, 107, 83, 132, 95, 108, 47, 161, 148, 145, 141, 19,
    98, 44, 87, 24, 137, 173, 129, 55, 92, 163, 158, 153, 12, 93, 144, 103, 123, 155, 0, 30, 72,
    109, 79, 140, 61, 73, 99, 124, 118, 71, 146, 75, 166, 10, 39, 154, 14, 89, 150, 18, 156, 172,
    139, 151, 49, 59, 115, 7, 38, 58, 60, 128, 106, 162, 68, 113, 17, 91, 15, 76, 2, 120, 168, 9,
    84, 46, 131, 105, 85, 41, 3, 134, 20, 77, 8, 104, 56, 90, 64, 94, 160, 152, 142, 52, 45, 164,
    165, 70, 97, 29, 67, 54, 51, 80, 121, 147, 35, 69, 31, 33, 22, 11, 66, 96, 81, 130, 32, 25, 65,
    127, 82, 119, 102, 170, 16, 88, 62, 136, 6, 36, 5, 26, 34, 133, 43, 78, 112, 135, 143, 157,
    169, 23, 53, 13,
];

/// XOR mask applied before permutation.
const MASK: [u8; FRAME_LEN] = [
    0xf2, 0x3b, 0x9b, 0x7c, 0xe3, 0xc2, 0x74, 0x05, 0xd1, 0x71, 0x9d, 0xca, 0xeb, 0xbc, 0x2d, 0x67,
    0xef, 0xea, 0x69, 0xe4, 0x0f, 0x5a, 0xcf, 0x03, 0x23, 0x34, 0x33, 0x9a, 0x45, 0x33, 0x04, 0xbe,
    0x71, 0xee, 0x77, 0x6b, 0xd8, 0x86, 0x34, 0xab, 0xd6, 0x05, 0xae, 0x61, 0xd4, 0x80, 0xb5, 0x6d,
    0x4e, 0x30, 0x31, 0xae, 0x4d, 0x8a, 0x26, 0xb2, 0x60, 0xdb, 0xda, 0x97, 0x7f, 0xe5, 0xd2, 0xa4,
    0xd1, 0xa8, 0x57, 0x4a, 0x57, 0x88, 0xb9, 0x4f, 0xd6, 0x91, 0x5e, 0xb3, 0x8b, 0x71, 0xb1, 0x9e,
    0xcb, 0xf4, 0x85, 0xe0, 0x2c, 0xfa, 0x45, 0x40, 0xdf, 0xbc, 0x23, 0x03, 0xe4, 0x33, 0x4c, 0xa9,
    0x49, 0x78, 0x11, 0xfc, 0x95, 0x6c, 0x83, 0x55, 0x6e, 0x3a, 0x94, 0xc2, 0x87, 0xa3, 0x35, 0x61,
    0xc8, 0xae, 0x76, 0x91, 0xcb, 0x0f, 0x9a, 0x0d, 0x6a, 0x4e, 0xdf, 0x04, 0xc4, 0xf8, 0xfc, 0xc9,
    0x70, 0x7f, 0x37, 0xa4, 0x52, 0xf5, 0xb9, 0x69, 0xbe, 0x44, 0x70, 0xee, 0xae, 0x36, 0xd6, 0xa0,
    0x22, 0x35, 0x9b, 0xa1, 0x5e, 0x93, 0x73, 0x0b, 0x07, 0x50, 0x03, 0x62, 0xae, 0x18, 0x09, 0x9c,
    0x9b, 0x04, 0x04, 0x30, 0x96, 0x0f, 0x5e, 0xa1, 0xb7, 0xb1, 0x15, 0x74, 0x71, 0x5a, 0x27, 0xac,
];

const KEY_PACKET_MARKERS: [u8; 2] = [0xa3, 0xaa];
const DATA_PACKET_MARKERS: [u8; 2] = [0x80, 0x87];

/// A demasked 176-byte frame and its classification.
#[derive(Debug, Clone)]
pub struct Frame {
    demasked: [u8; FRAME_LEN],
    pub kind: FrameKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    Data,
    Useless,
}

impl Frame {
    /// Drone id: lowercase hex of bytes 6..10 of the demasked frame.
    ///
    /// Only meaningful for `Key`/`Data` frames; `Useless` frames still
    /// produce a value (the bytes exist regardless) but callers must not
    /// act on it.
    pub fn drone_id(&self) -> String {
        hex_lower(&self.demasked[6..10])
    }

    pub fn is_key(&self) -> bool {
        self.kind == FrameKind::Key
    }

    pub fn is_valid(&self) -> bool {
        self.kind != FrameKind::Useless
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// The hex string, once non-hex characters are stripped, does not
    /// decode to exactly 176 bytes.
    WrongLength { got: usize },
    /// The stripped string has an odd number of hex digits.
    OddHexDigits,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::WrongLength { got } => {
                write!(f, "packet must decode to 176 bytes, got {got}")
            }
            PacketError::OddHexDigits => write!(f, "odd number of hex digits"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Strips everything but hex digits, decodes, demasks and classifies.
pub fn parse(encrypted_hex: &str) -> Result<Frame, PacketError> {
    let raw = hex_to_bytes(encrypted_hex)?;
    if raw.len() != FRAME_LEN {
        return Err(PacketError::WrongLength { got: raw.len() });
    }

    let demasked = demask(&raw);
    let first = demasked[0];
    let kind = if KEY_PACKET_MARKERS.contains(&first) {
        FrameKind::Key
    } else if DATA_PACKET_MARKERS.contains(&first) {
        FrameKind::Data
    } else {
        FrameKind::Useless
    };

    Ok(Frame { demasked, kind })
}

fn hex_to_bytes(s: &str) -> Result<Vec<u8>, PacketError> {
    let clean: Vec<u8> = s
        .bytes()
        .filter(|b| b.is_ascii_hexdigit())
        .collect();

    if clean.len() % 2 != 0 {
        return Err(PacketError::OddHexDigits);
    }

    let mut out = Vec::with_capacity(clean.len() / 2);
    for pair in clean.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16).unwrap();
        let lo = (pair[1] as char).to_digit(16).unwrap();
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

fn demask(input: &[u8]) -> [u8; FRAME_LEN] {
    let mut tmp = [0u8; FRAME_LEN];
    for i in 0..FRAME_LEN {
        tmp[i] = input[i] ^ MASK[i];
    }

    let mut out = [0u8; FRAME_LEN];
    for i in 0..FRAME_LEN {
        out[PERMUTATION[i]] = tmp[i];
    }
    out
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HEX: &str = "2c,42,9b,f4,f3,52,59,be,8d,24,b0,ca,ba,c9,2d,f9,62,a5,6a,e4,66,30,4d,45,bc,0b,f0,da,ed,f2,39,14,fd,fe,c4,77,a5,86,34,ab,d6,05,84,a4,41,a9,7d,68,82,29,10,ae,4d,8a,eb,8e,60,e4,5f,97,f8,20,7a,4a,fe,a8,d2,d4,6a,46,b2,50,d6,1e,5e,1c,86,71,f7,a8,cb,99,85,33,2c,fa,33,72,33,b8,57,c9,76,71,ce,a9,d7,a9,7d,e9,c4,27,ca,ec,6e,d5,ce,10,87,c9,bf,19,86,e7,0e,f9,07,81,bc,15,e5,70,df,04,c4,0e,4a,c9,70,fd,2b,03,87,72,ad,3a,6e,44,96,c9,99,45,d9,2d,33,8d,62,81,15,ce,e3,a2,0f,45,ee,5a,68,1b,f4,f5,62,9a,54,9d,8a,36,b9,4d,fd,27,15,74,0b,68,50,9c";

    #[test]
    fn parses_reference_sample() {
        let frame = parse(SAMPLE_HEX).unwrap();
        assert!(frame.is_valid());
        assert_eq!(frame.drone_id().len(), 8);
    }

    #[test]
    fn strips_separators_before_decoding() {
        let compact: String = SAMPLE_HEX.chars().filter(|c| *c != ',').collect();
        let a = parse(SAMPLE_HEX).unwrap();
        let b = parse(&compact).unwrap();
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.drone_id(), b.drone_id());
    }

    #[test]
    fn wrong_length_rejected() {
        let err = parse("aabbcc").unwrap_err();
        assert!(matches!(err, PacketError::WrongLength { .. }));
    }

    #[test]
    fn odd_hex_digits_rejected() {
        let odd = "a".repeat(353);
        assert_eq!(hex_to_bytes(&odd).unwrap_err(), PacketError::OddHexDigits);
    }

    #[test]
    fn classification_covers_every_first_byte() {
        for first in 0u8..=255 {
            let mut raw = [0u8; FRAME_LEN];
            // Work backwards through demask to land `first` at out[0]:
            // out[PERMUTATION[i]] = tmp[i] = input[i] ^ MASK[i].
            // We want out[0] == first. Find i0 such that PERMUTATION[i0] == 0.
            let i0 = PERMUTATION.iter().position(|&p| p == 0).unwrap();
            raw[i0] = first ^ MASK[i0];
            let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
            let frame = parse(&hex).unwrap();
            let expect = if KEY_PACKET_MARKERS.contains(&first) {
                FrameKind::Key
            } else if DATA_PACKET_MARKERS.contains(&first) {
                FrameKind::Data
            } else {
                FrameKind::Useless
            };
            assert_eq!(frame.kind, expect, "first byte {first:#x}");
        }
    }
}
