//! FT 1.2 framing for the serial profile.

use crate::common::LinkLayerParameters;

/// Start byte of a fixed-length frame.
pub const START_FIXED: u8 = 0x10;
/// Start byte of a variable-length frame.
pub const START_VARIABLE: u8 = 0x68;
/// Terminating byte of both frame shapes.
pub const END_BYTE: u8 = 0x16;
/// Single-character positive acknowledgement.
pub const SINGLE_CHAR_ACK: u8 = 0xE5;

/// One FT 1.2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ft12Frame {
    /// The one-byte ACK accepted in place of a short frame
    SingleChar,
    /// Fixed-length frame: control and address only
    Fixed { control: u8, address: u16 },
    /// Variable-length frame carrying link user data (an ASDU)
    Variable {
        control: u8,
        address: u16,
        user_data: Vec<u8>,
    },
}

/// Result of trying to take one frame off the front of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Complete { frame: Ft12Frame, consumed: usize },
    /// More bytes are needed
    Incomplete,
    /// Unusable bytes to drop for resynchronisation
    Garbage { skip: usize, reason: String },
}

fn address_bytes(address: u16, length: u8, out: &mut Vec<u8>) {
    if length >= 1 {
        out.push((address & 0xFF) as u8);
    }
    if length == 2 {
        out.push((address >> 8) as u8);
    }
}

fn read_address(data: &[u8], length: u8) -> u16 {
    match length {
        0 => 0,
        1 => data[0] as u16,
        _ => data[0] as u16 | ((data[1] as u16) << 8),
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl Ft12Frame {
    pub fn fixed(control: u8, address: u16) -> Self {
        Ft12Frame::Fixed { control, address }
    }

    pub fn variable(control: u8, address: u16, user_data: Vec<u8>) -> Self {
        Ft12Frame::Variable {
            control,
            address,
            user_data,
        }
    }

    /// Link control byte, if the frame carries one.
    pub fn control(&self) -> Option<u8> {
        match self {
            Ft12Frame::SingleChar => None,
            Ft12Frame::Fixed { control, .. } | Ft12Frame::Variable { control, .. } => {
                Some(*control)
            }
        }
    }

    /// Link address, if the frame carries one.
    pub fn address(&self) -> Option<u16> {
        match self {
            Ft12Frame::SingleChar => None,
            Ft12Frame::Fixed { address, .. } | Ft12Frame::Variable { address, .. } => {
                Some(*address)
            }
        }
    }

    pub fn encode(&self, params: &LinkLayerParameters) -> Vec<u8> {
        match self {
            Ft12Frame::SingleChar => vec![SINGLE_CHAR_ACK],
            Ft12Frame::Fixed { control, address } => {
                let mut body = vec![*control];
                address_bytes(*address, params.address_length, &mut body);
                let cs = checksum(&body);
                let mut out = vec![START_FIXED];
                out.extend_from_slice(&body);
                out.push(cs);
                out.push(END_BYTE);
                out
            }
            Ft12Frame::Variable {
                control,
                address,
                user_data,
            } => {
                let mut body = vec![*control];
                address_bytes(*address, params.address_length, &mut body);
                body.extend_from_slice(user_data);
                let cs = checksum(&body);
                let length = body.len() as u8;
                // The start and length bytes are duplicated so a receiver
                // can resynchronise after corruption.
                let mut out = vec![START_VARIABLE, length, length, START_VARIABLE];
                out.extend_from_slice(&body);
                out.push(cs);
                out.push(END_BYTE);
                out
            }
        }
    }

    /// Decode the frame at the start of `data`.
    pub fn decode(params: &LinkLayerParameters, data: &[u8]) -> Decoded {
        let addr_len = params.address_length as usize;
        let Some(&first) = data.first() else {
            return Decoded::Incomplete;
        };
        match first {
            SINGLE_CHAR_ACK => Decoded::Complete {
                frame: Ft12Frame::SingleChar,
                consumed: 1,
            },
            START_FIXED => {
                let total = 1 + 1 + addr_len + 2;
                if data.len() < total {
                    return Decoded::Incomplete;
                }
                let body = &data[1..1 + 1 + addr_len];
                let cs = data[total - 2];
                if data[total - 1] != END_BYTE {
                    return Decoded::Garbage {
                        skip: 1,
                        reason: "fixed frame without end byte".to_string(),
                    };
                }
                if checksum(body) != cs {
                    return Decoded::Garbage {
                        skip: total,
                        reason: "fixed frame checksum mismatch".to_string(),
                    };
                }
                Decoded::Complete {
                    frame: Ft12Frame::Fixed {
                        control: body[0],
                        address: read_address(&body[1..], params.address_length),
                    },
                    consumed: total,
                }
            }
            START_VARIABLE => {
                if data.len() < 4 {
                    return Decoded::Incomplete;
                }
                let length = data[1] as usize;
                if data[1] != data[2] || data[3] != START_VARIABLE {
                    return Decoded::Garbage {
                        skip: 1,
                        reason: "corrupt variable frame header".to_string(),
                    };
                }
                if length < 1 + addr_len {
                    return Decoded::Garbage {
                        skip: 4,
                        reason: format!("variable frame length {length} too small"),
                    };
                }
                let total = 4 + length + 2;
                if data.len() < total {
                    return Decoded::Incomplete;
                }
                let body = &data[4..4 + length];
                let cs = data[total - 2];
                if data[total - 1] != END_BYTE {
                    return Decoded::Garbage {
                        skip: 1,
                        reason: "variable frame without end byte".to_string(),
                    };
                }
                if checksum(body) != cs {
                    return Decoded::Garbage {
                        skip: total,
                        reason: "variable frame checksum mismatch".to_string(),
                    };
                }
                Decoded::Complete {
                    frame: Ft12Frame::Variable {
                        control: body[0],
                        address: read_address(&body[1..], params.address_length),
                        user_data: body[1 + addr_len..].to_vec(),
                    },
                    consumed: total,
                }
            }
            other => Decoded::Garbage {
                skip: 1,
                reason: format!("unexpected start byte {other:#04x}"),
            },
        }
    }
}

/// Accumulates stream bytes and yields complete FT 1.2 frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame, discarding garbage along the way.
    pub fn next(&mut self, params: &LinkLayerParameters) -> Option<Ft12Frame> {
        loop {
            match Ft12Frame::decode(params, &self.buffer) {
                Decoded::Complete { frame, consumed } => {
                    self.buffer.drain(..consumed);
                    return Some(frame);
                }
                Decoded::Incomplete => return None,
                Decoded::Garbage { skip, reason } => {
                    tracing::warn!(skip, %reason, "discarding unusable link bytes");
                    self.buffer.drain(..skip);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> LinkLayerParameters {
        LinkLayerParameters::default()
    }

    #[test]
    fn fixed_frame_layout() {
        let frame = Ft12Frame::fixed(0x49, 3);
        let bytes = frame.encode(&params());
        assert_eq!(bytes, vec![0x10, 0x49, 0x03, 0x4C, 0x16]);
    }

    #[test]
    fn fixed_frame_round_trip() {
        for address in [0u16, 1, 3, 255] {
            for control in [0x40u8, 0x49, 0x53, 0x7B] {
                let frame = Ft12Frame::fixed(control, address);
                let bytes = frame.encode(&params());
                match Ft12Frame::decode(&params(), &bytes) {
                    Decoded::Complete { frame: decoded, consumed } => {
                        assert_eq!(consumed, bytes.len());
                        assert_eq!(decoded, frame);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn variable_frame_round_trip() {
        let frame = Ft12Frame::variable(0x73, 5, vec![0x64, 0x01, 0x06, 0x00, 0x01, 0x00]);
        let bytes = frame.encode(&params());
        assert_eq!(bytes[0], 0x68);
        assert_eq!(bytes[1], bytes[2]);
        assert_eq!(bytes[3], 0x68);
        assert_eq!(*bytes.last().unwrap(), 0x16);
        match Ft12Frame::decode(&params(), &bytes) {
            Decoded::Complete { frame: decoded, .. } => assert_eq!(decoded, frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn two_byte_addresses() {
        let wide = LinkLayerParameters {
            address_length: 2,
            ..Default::default()
        };
        let frame = Ft12Frame::variable(0x53, 0x1234, vec![0xAA]);
        let bytes = frame.encode(&wide);
        match Ft12Frame::decode(&wide, &bytes) {
            Decoded::Complete { frame: decoded, .. } => assert_eq!(decoded, frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_is_garbage_not_fatal() {
        let mut bytes = Ft12Frame::fixed(0x49, 3).encode(&params());
        bytes[2] ^= 0xFF;
        match Ft12Frame::decode(&params(), &bytes) {
            Decoded::Garbage { skip, .. } => assert_eq!(skip, bytes.len()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_waits_for_more() {
        let bytes = Ft12Frame::variable(0x73, 1, vec![1, 2, 3]).encode(&params());
        for cut in 0..bytes.len() {
            assert_eq!(
                Ft12Frame::decode(&params(), &bytes[..cut]),
                Decoded::Incomplete,
                "prefix of {cut} bytes"
            );
        }
    }

    #[test]
    fn reader_resynchronises_after_noise() {
        let mut reader = FrameReader::new();
        reader.push(&[0x00, 0xFF]);
        reader.push(&Ft12Frame::SingleChar.encode(&params()));
        reader.push(&Ft12Frame::fixed(0x40, 1).encode(&params()));
        assert_eq!(reader.next(&params()), Some(Ft12Frame::SingleChar));
        assert_eq!(
            reader.next(&params()),
            Some(Ft12Frame::fixed(0x40, 1))
        );
        assert_eq!(reader.next(&params()), None);
    }

    #[test]
    fn corrupted_duplicate_length_is_garbage() {
        let mut bytes = Ft12Frame::variable(0x73, 1, vec![1, 2, 3]).encode(&params());
        bytes[2] = bytes[2].wrapping_add(1);
        match Ft12Frame::decode(&params(), &bytes) {
            Decoded::Garbage { skip: 1, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
