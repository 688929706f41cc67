//! MAVLink v2 frame layout.
//!
//! ## Frame Format
//!
//! | Field          | Size (bytes) | Description                                  |
//! |----------------|--------------|----------------------------------------------|
//! | magic          | 1            | Always `0xFD`.                               |
//! | payload length | 1            | 0 to 255.                                    |
//! | incompat flags | 1            | Bit 0 set when a signature is appended.      |
//! | compat flags   | 1            | Ignored by the bridge.                       |
//! | sequence       | 1            | Per-sender packet counter.                   |
//! | system id      | 1            |                                              |
//! | component id   | 1            |                                              |
//! | message id     | 3            | Little-endian.                               |
//! | payload        | 0 to 255     | Opaque to the bridge.                        |
//! | checksum       | 2            | CRC-16/MCRF4XX over bytes 1.. plus CRC extra.|
//! | signature      | 13 (signed)  | Link id, 48-bit timestamp, 48-bit signature. |
//!
//! The bridge never interprets payloads or verifies checksums; it only needs
//! the first three bytes to know how long a frame is.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, FrameResult};

/// Start-of-frame marker.
pub const MAGIC: u8 = 0xFD;

/// Header length, magic included.
pub const HEADER_LEN: usize = 10;

/// Checksum length.
pub const CHECKSUM_LEN: usize = 2;

/// Signature block length.
pub const SIGNATURE_LEN: usize = 13;

/// Incompat flag marking a signed frame.
pub const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Longest frame the bridge accepts. Anything claiming more is treated as a
/// false magic byte.
pub const MAX_FRAME_LEN: usize = 300;

/// Bytes needed before the total length is known.
pub const LENGTH_PREFIX_LEN: usize = 3;

/// Total frame length for a payload length and incompat flags.
pub fn frame_len(payload_len: u8, incompat_flags: u8) -> usize {
    let mut len = HEADER_LEN + payload_len as usize + CHECKSUM_LEN;
    if incompat_flags & INCOMPAT_FLAG_SIGNED != 0 {
        len += SIGNATURE_LEN;
    }
    len
}

/// Total length announced by the start of a frame.
///
/// Returns `None` if fewer than [`LENGTH_PREFIX_LEN`] bytes are given or the
/// first byte is not [`MAGIC`].
pub fn announced_len(prefix: &[u8]) -> Option<usize> {
    match prefix {
        [MAGIC, payload_len, flags, ..] => Some(frame_len(*payload_len, *flags)),
        _ => None,
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length.
    pub payload_len: u8,
    /// Incompat flags.
    pub incompat_flags: u8,
    /// Compat flags.
    pub compat_flags: u8,
    /// Sequence number.
    pub sequence: u8,
    /// Sending system.
    pub system_id: u8,
    /// Sending component.
    pub component_id: u8,
    /// 24-bit message id.
    pub message_id: u32,
}

impl FrameHeader {
    /// Read the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> FrameResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0] != MAGIC {
            return Err(FrameError::BadMagic(bytes[0]));
        }
        Ok(FrameHeader {
            payload_len: bytes[1],
            incompat_flags: bytes[2],
            compat_flags: bytes[3],
            sequence: bytes[4],
            system_id: bytes[5],
            component_id: bytes[6],
            message_id: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], 0]),
        })
    }

    /// Whether a signature block follows the checksum.
    pub fn is_signed(&self) -> bool {
        self.incompat_flags & INCOMPAT_FLAG_SIGNED != 0
    }

    /// Total frame length.
    pub fn frame_len(&self) -> usize {
        frame_len(self.payload_len, self.incompat_flags)
    }
}

/// CRC-16/MCRF4XX accumulation step used by MAVLink.
pub fn crc_accumulate(crc: u16, byte: u8) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    let tmp = tmp as u16;
    (crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4)
}

/// MAVLink checksum over `data` followed by the message's CRC extra byte.
pub fn checksum(data: &[u8], crc_extra: u8) -> u16 {
    let crc = data.iter().fold(0xFFFF, |crc, &b| crc_accumulate(crc, b));
    crc_accumulate(crc, crc_extra)
}

/// Signature block of a signed frame.
///
/// The bridge forwards signatures untouched; computing one needs the link's
/// secret key, which is outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Link id.
    pub link_id: u8,
    /// 48-bit timestamp in 10 µs units.
    pub timestamp: u64,
    /// 48-bit signature.
    pub signature: [u8; 6],
}

/// Builds MAVLink v2 frames for one sender.
///
/// Used by the telemetry simulator and the tests; the bridge itself only
/// forwards frames.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    system_id: u8,
    component_id: u8,
    sequence: u8,
}

impl FrameBuilder {
    /// Create a builder for a system and component id.
    pub fn new(system_id: u8, component_id: u8) -> Self {
        FrameBuilder {
            system_id,
            component_id,
            sequence: 0,
        }
    }

    /// Sequence number the next frame will carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Build an unsigned frame.
    pub fn build(&mut self, message_id: u32, payload: &[u8], crc_extra: u8) -> FrameResult<Bytes> {
        self.encode(message_id, payload, crc_extra, None)
    }

    /// Build a signed frame carrying `signature`.
    pub fn build_signed(
        &mut self,
        message_id: u32,
        payload: &[u8],
        crc_extra: u8,
        signature: Signature,
    ) -> FrameResult<Bytes> {
        self.encode(message_id, payload, crc_extra, Some(signature))
    }

    fn encode(
        &mut self,
        message_id: u32,
        payload: &[u8],
        crc_extra: u8,
        signature: Option<Signature>,
    ) -> FrameResult<Bytes> {
        let payload_len =
            u8::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLong { len: payload.len() })?;
        let flags = if signature.is_some() {
            INCOMPAT_FLAG_SIGNED
        } else {
            0
        };

        let mut frame = BytesMut::with_capacity(frame_len(payload_len, flags));
        frame.put_u8(MAGIC);
        frame.put_u8(payload_len);
        frame.put_u8(flags);
        frame.put_u8(0);
        frame.put_u8(self.sequence);
        frame.put_u8(self.system_id);
        frame.put_u8(self.component_id);
        frame.put_slice(&message_id.to_le_bytes()[..3]);
        frame.put_slice(payload);
        let crc = checksum(&frame[1..], crc_extra);
        frame.put_u16_le(crc);

        if let Some(sig) = signature {
            frame.put_u8(sig.link_id);
            frame.put_slice(&sig.timestamp.to_le_bytes()[..6]);
            frame.put_slice(&sig.signature);
        }

        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame.freeze())
    }
}

/// `HEARTBEAT` message id.
pub const HEARTBEAT_ID: u32 = 0;

/// `HEARTBEAT` CRC extra byte.
pub const HEARTBEAT_CRC_EXTRA: u8 = 50;

/// `HEARTBEAT` payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Autopilot-specific mode.
    pub custom_mode: u32,
    /// Vehicle type (`MAV_TYPE`).
    pub mav_type: u8,
    /// Autopilot type (`MAV_AUTOPILOT`).
    pub autopilot: u8,
    /// `MAV_MODE_FLAG` bits.
    pub base_mode: u8,
    /// `MAV_STATE`.
    pub system_status: u8,
}

impl Heartbeat {
    /// Serialized payload (9 bytes, wire order).
    pub fn payload(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[..4].copy_from_slice(&self.custom_mode.to_le_bytes());
        out[4] = self.mav_type;
        out[5] = self.autopilot;
        out[6] = self.base_mode;
        out[7] = self.system_status;
        out[8] = 3; // MAVLink protocol version
        out
    }
}

impl FrameBuilder {
    /// Build a `HEARTBEAT` frame.
    pub fn heartbeat(&mut self, heartbeat: &Heartbeat) -> Bytes {
        // A 9-byte payload always fits.
        self.encode(HEARTBEAT_ID, &heartbeat.payload(), HEARTBEAT_CRC_EXTRA, None)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(9, 0), 21);
        assert_eq!(frame_len(0, INCOMPAT_FLAG_SIGNED), 25);
        assert_eq!(frame_len(255, INCOMPAT_FLAG_SIGNED), 280);
        // Other incompat bits do not change the length.
        assert_eq!(frame_len(9, 0x02), 21);
    }

    #[test]
    fn test_announced_len() {
        assert_eq!(announced_len(&[MAGIC, 9, 0]), Some(21));
        assert_eq!(announced_len(&[MAGIC, 9]), None);
        assert_eq!(announced_len(&[0xFE, 9, 0]), None);
    }

    #[test]
    fn test_checksum_vector() {
        // CRC-16/MCRF4XX check value.
        let crc = b"123456789".iter().fold(0xFFFF, |c, &b| crc_accumulate(c, b));
        assert_eq!(crc, 0x6F91);
    }

    #[test]
    fn test_heartbeat_frame() {
        let mut builder = FrameBuilder::new(1, 1);
        let heartbeat = Heartbeat {
            custom_mode: 0,
            mav_type: 2,
            autopilot: 3,
            base_mode: 0x51,
            system_status: 4,
        };
        let frame = builder.heartbeat(&heartbeat);

        assert_eq!(frame.len(), 21);
        let header = FrameHeader::parse(&frame).expect("header");
        assert_eq!(header.payload_len, 9);
        assert_eq!(header.message_id, HEARTBEAT_ID);
        assert_eq!(header.sequence, 0);
        assert!(!header.is_signed());
        assert_eq!(&frame[10..19], &heartbeat.payload());

        let crc = checksum(&frame[1..19], HEARTBEAT_CRC_EXTRA);
        assert_eq!(&frame[19..], &crc.to_le_bytes());
        assert_eq!(builder.sequence(), 1);
    }

    #[test]
    fn test_signed_frame() {
        let mut builder = FrameBuilder::new(255, 190);
        let signature = Signature {
            link_id: 7,
            timestamp: 0x0102_0304_0506,
            signature: [0xAA; 6],
        };
        let frame = builder
            .build_signed(300, &[], 0, signature)
            .expect("frame");

        assert_eq!(frame.len(), 25);
        let header = FrameHeader::parse(&frame).expect("header");
        assert!(header.is_signed());
        assert_eq!(header.message_id, 300);
        assert_eq!(header.frame_len(), 25);
        assert_eq!(frame[12], 7);
        assert_eq!(&frame[13..19], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[19..], &[0xAA; 6]);
    }

    #[test]
    fn test_builder_rejects_long_payload() {
        let mut builder = FrameBuilder::new(1, 1);
        assert_eq!(
            builder.build(0, &[0u8; 256], 0),
            Err(FrameError::PayloadTooLong { len: 256 })
        );
        assert_eq!(builder.sequence(), 0);
    }

    #[test]
    fn test_header_parse_errors() {
        assert_eq!(
            FrameHeader::parse(&[MAGIC, 0, 0]),
            Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: 3
            })
        );
        assert_eq!(
            FrameHeader::parse(&[0xFE; 12]),
            Err(FrameError::BadMagic(0xFE))
        );
    }
}
