//! Fixed-size telemetry frame exchanged on the multicast data plane
//!
//! Layout (20 bytes, little-endian, no padding):
//!
//! | Offset | Size | Field               |
//! |--------|------|---------------------|
//! | 0      | 4    | `id` (u32)          |
//! | 4      | 4    | `throttle` (f32)    |
//! | 8      | 4    | `steer` (f32)       |
//! | 12     | 4    | `brake` (f32)       |
//! | 16     | 1    | `hand_brake` (bool) |
//! | 17     | 1    | `reverse` (bool)    |
//! | 18     | 1    | `manual_gear_shift` (bool) |
//! | 19     | 1    | `gear` (u8)         |

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Size of an encoded frame in bytes
pub const FRAME_SIZE: usize = 20;

/// One vehicle control record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame sequence number or sender id
    pub id: u32,
    pub throttle: f32,
    pub steer: f32,
    pub brake: f32,
    pub hand_brake: bool,
    pub reverse: bool,
    pub manual_gear_shift: bool,
    pub gear: u8,
}

impl Frame {
    /// Encode into the fixed wire layout
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_u32_le(self.id);
        buf.put_f32_le(self.throttle);
        buf.put_f32_le(self.steer);
        buf.put_f32_le(self.brake);
        buf.put_u8(self.hand_brake as u8);
        buf.put_u8(self.reverse as u8);
        buf.put_u8(self.manual_gear_shift as u8);
        buf.put_u8(self.gear);

        let mut out = [0u8; FRAME_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode from exactly [`FRAME_SIZE`] bytes
    ///
    /// Any non-zero byte in a boolean slot decodes as `true`.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != FRAME_SIZE {
            return Err(CoreError::FrameSize {
                expected: FRAME_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        Ok(Self {
            id: buf.get_u32_le(),
            throttle: buf.get_f32_le(),
            steer: buf.get_f32_le(),
            brake: buf.get_f32_le(),
            hand_brake: buf.get_u8() != 0,
            reverse: buf.get_u8() != 0,
            manual_gear_shift: buf.get_u8() != 0,
            gear: buf.get_u8(),
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} throttle={:.3} steer={:.3} brake={:.3} hand_brake={} reverse={} manual={} gear={}",
            self.id,
            self.throttle,
            self.steer,
            self.brake,
            self.hand_brake,
            self.reverse,
            self.manual_gear_shift,
            self.gear
        )
    }
}

/// A decoded inbound frame stamped with the local receive time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReceivedFrame {
    pub frame: Frame,
    /// Milliseconds since the Unix epoch, from the configured clock source
    pub received_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Frame {
        Frame {
            id: 0xDEAD_BEEF,
            throttle: 0.75,
            steer: -0.25,
            brake: 0.0,
            hand_brake: false,
            reverse: true,
            manual_gear_shift: true,
            gear: 3,
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();

        assert_eq!(&bytes[0..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.75f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(-0.25f32).to_le_bytes());
        assert_eq!(&bytes[12..16], &0.0f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &[0, 1, 1, 3]);
    }

    #[test]
    fn test_round_trip_extremes() {
        let frame = Frame {
            id: u32::MAX,
            throttle: f32::MAX,
            steer: f32::MIN_POSITIVE,
            brake: -1.0e-30,
            hand_brake: true,
            reverse: true,
            manual_gear_shift: false,
            gear: u8::MAX,
        };

        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        assert_eq!(Frame::decode(&sample().encode()).unwrap(), sample());
    }

    #[test]
    fn test_nonzero_bool_bytes_decode_true() {
        let mut bytes = Frame::default().encode();
        bytes[16] = 0x7F;
        bytes[18] = 0xFF;

        let frame = Frame::decode(&bytes).unwrap();
        assert!(frame.hand_brake);
        assert!(!frame.reverse);
        assert!(frame.manual_gear_shift);
    }

    #[rstest]
    #[case(0)]
    #[case(18)]
    #[case(19)]
    #[case(21)]
    fn test_decode_rejects_wrong_size(#[case] len: usize) {
        let data = vec![0u8; len];
        assert_eq!(
            Frame::decode(&data),
            Err(CoreError::FrameSize {
                expected: FRAME_SIZE,
                actual: len
            })
        );
    }
}
