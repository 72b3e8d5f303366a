//! Telemetry frames and the de-obfuscation transform.
//!
//! Most firmware revisions scramble every 8-byte report with a fixed
//! shuffle / XOR / rotate / subtract sequence. Newer revisions send the
//! report in clear and mark it with [`CLEAR_FRAME_SENTINEL`] at byte 4.

use std::array;
use std::fmt;

use thiserror::Error;

use super::constants::{
    CLEAR_FRAME_SENTINEL, CLEAR_FRAME_SENTINEL_INDEX, CSTATE, FRAME_SIZE, SHUFFLE,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// One frame exactly as delivered by the transport.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; FRAME_SIZE]);

/// A frame after de-obfuscation: opcode at byte 0, big-endian magnitude at 1..3.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame([u8; FRAME_SIZE]);

impl RawFrame {
    pub const fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    /// Whether the device already sent this frame in clear.
    pub fn is_clear(&self) -> bool {
        self.0[CLEAR_FRAME_SENTINEL_INDEX] == CLEAR_FRAME_SENTINEL
    }

    /// De-obfuscate this frame with `key`.
    pub fn decode(&self, key: &[u8; FRAME_SIZE]) -> DecodedFrame {
        decode(key, self)
    }
}

impl TryFrom<&[u8]> for RawFrame {
    type Error = FrameError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; FRAME_SIZE] = bytes.try_into().map_err(|_| FrameError::InvalidLength {
            expected: FRAME_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl DecodedFrame {
    pub const fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFrame({:02X?})", self.0)
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecodedFrame({:02X?})", self.0)
    }
}

/// CSTATE with each byte nibble-swapped.
fn swapped_cstate() -> [u8; FRAME_SIZE] {
    CSTATE.map(|c| c.rotate_left(4))
}

/// Turn a raw frame into its clear form.
///
/// Clear frames (sentinel at byte 4) pass through untouched.
pub fn decode(key: &[u8; FRAME_SIZE], frame: &RawFrame) -> DecodedFrame {
    if frame.is_clear() {
        return DecodedFrame(frame.0);
    }

    let mut phase1 = [0u8; FRAME_SIZE];
    for (&byte, &pos) in frame.0.iter().zip(SHUFFLE.iter()) {
        phase1[pos] = byte;
    }

    let phase2: [u8; FRAME_SIZE] = array::from_fn(|i| phase1[i] ^ key[i]);

    let phase3: [u8; FRAME_SIZE] = array::from_fn(|i| {
        let prev = phase2[(i + FRAME_SIZE - 1) % FRAME_SIZE];
        (phase2[i] >> 3) | (prev << 5)
    });

    let ctmp = swapped_cstate();
    DecodedFrame(array::from_fn(|i| phase3[i].wrapping_sub(ctmp[i])))
}

/// Inverse of [`decode`] for obfuscated frames.
///
/// Used to synthesise wire frames for simulated devices. If the result
/// happens to carry the sentinel at byte 4 the device could not have sent it
/// obfuscated, and [`decode`] would treat it as clear.
pub fn encode(key: &[u8; FRAME_SIZE], plain: &DecodedFrame) -> RawFrame {
    let ctmp = swapped_cstate();
    let phase3: [u8; FRAME_SIZE] = array::from_fn(|i| plain.0[i].wrapping_add(ctmp[i]));

    let phase2: [u8; FRAME_SIZE] = array::from_fn(|i| {
        let next = phase3[(i + 1) % FRAME_SIZE];
        (phase3[i] << 3) | (next >> 5)
    });

    let phase1: [u8; FRAME_SIZE] = array::from_fn(|i| phase2[i] ^ key[i]);

    RawFrame(SHUFFLE.map(|pos| phase1[pos]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::OBFUSCATION_KEY;

    // Captured from a device reporting 1000 ppm.
    const CO2_1000_WIRE: [u8; 8] = [0x30, 0xE4, 0x66, 0x20, 0x97, 0x46, 0xBF, 0x1A];
    const CO2_1000_CLEAR: [u8; 8] = [0x50, 0x03, 0xE8, 0x3B, 0x0D, 0x00, 0x00, 0x00];

    #[test]
    fn test_decode_golden_vector() {
        let frame = RawFrame::new(CO2_1000_WIRE);
        let decoded = frame.decode(&OBFUSCATION_KEY);
        assert_eq!(decoded.as_bytes(), &CO2_1000_CLEAR);
        assert_eq!(decoded.opcode(), 0x50);
    }

    #[test]
    fn test_decode_more_vectors() {
        let temp = RawFrame::new([0x77, 0xE4, 0xF6, 0x20, 0x0E, 0x46, 0xBF, 0xC2]);
        assert_eq!(
            decode(&OBFUSCATION_KEY, &temp).as_bytes(),
            &[0x42, 0x12, 0xC0, 0x14, 0x0D, 0x00, 0x00, 0x00]
        );

        let zeros = RawFrame::new([0; 8]);
        assert_eq!(
            decode(&OBFUSCATION_KEY, &zeros).as_bytes(),
            &[0x54, 0x51, 0x82, 0x3C, 0x41, 0x71, 0xE8, 0x3C]
        );
    }

    #[test]
    fn test_clear_frame_passes_through() {
        let frame = RawFrame::new(CO2_1000_CLEAR);
        assert!(frame.is_clear());
        assert_eq!(frame.decode(&OBFUSCATION_KEY).as_bytes(), &CO2_1000_CLEAR);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let frame = RawFrame::new([0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x23, 0x45, 0x67]);
        let a = frame.decode(&OBFUSCATION_KEY);
        let b = frame.decode(&OBFUSCATION_KEY);
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_inverts_decode() {
        let plain = DecodedFrame::new(CO2_1000_CLEAR);
        let wire = encode(&OBFUSCATION_KEY, &plain);
        assert_eq!(wire.as_bytes(), &CO2_1000_WIRE);
        assert_eq!(wire.decode(&OBFUSCATION_KEY), plain);
    }

    #[test]
    fn test_encode_inverts_decode_for_many_frames() {
        // xorshift32, so the run is repeatable.
        let mut state = 0x2545_F491u32;
        let mut next_byte = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        };

        let mut checked = 0;
        for _ in 0..20_000 {
            let plain = DecodedFrame::new(array::from_fn(|_| next_byte()));
            let wire = encode(&OBFUSCATION_KEY, &plain);
            if wire.is_clear() {
                continue;
            }
            assert_eq!(wire.decode(&OBFUSCATION_KEY), plain, "wire {:?}", wire);
            checked += 1;
        }
        // Roughly 1 in 256 encodings land on the sentinel.
        assert!(checked > 19_000, "only {} frames checked", checked);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = RawFrame::try_from(&[0u8; 7][..]).unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidLength {
                expected: 8,
                actual: 7
            }
        );
        assert!(RawFrame::try_from(&[0u8; 9][..]).is_err());
        assert!(RawFrame::try_from(&[0u8; 8][..]).is_ok());
    }
}
