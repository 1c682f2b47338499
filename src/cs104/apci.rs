//! APCI framing for CS104: I/S/U control formats over TCP.

use crate::asdu::Asdu;
use crate::common::AppLayerParameters;
use crate::error::{Iec60870Error, Iec60870Result};

/// APDU start byte.
pub const START_BYTE: u8 = 0x68;
/// Fixed APCI length: four control octets.
pub const APCI_LENGTH: usize = 4;
/// Smallest legal value of the APDU length octet.
pub const MIN_LENGTH: u8 = 4;
/// Largest legal value of the APDU length octet.
pub const MAX_LENGTH: u8 = 253;

/// Sequence numbers are 15 bits wide.
pub const SEQ_MODULO: u16 = 1 << 15;

/// Increment a send/receive sequence number modulo 2^15.
pub fn next_seq(seq: u16) -> u16 {
    (seq + 1) & (SEQ_MODULO - 1)
}

/// `(a - b) mod 2^15`, the number of frames `a` is ahead of `b`.
pub fn seq_distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b) & (SEQ_MODULO - 1)
}

/// Half-window ordering: true when `a` is at or after `b`.
pub fn seq_at_or_after(a: u16, b: u16) -> bool {
    seq_distance(a, b) < (SEQ_MODULO / 2)
}

/// Unnumbered control functions, one active bit per direction and pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFrame {
    StartDtAct,
    StartDtCon,
    StopDtAct,
    StopDtCon,
    TestFrAct,
    TestFrCon,
}

impl UFrame {
    pub fn to_byte(self) -> u8 {
        match self {
            UFrame::StartDtAct => 0x07,
            UFrame::StartDtCon => 0x0B,
            UFrame::StopDtAct => 0x13,
            UFrame::StopDtCon => 0x23,
            UFrame::TestFrAct => 0x43,
            UFrame::TestFrCon => 0x83,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(UFrame::StartDtAct),
            0x0B => Some(UFrame::StartDtCon),
            0x13 => Some(UFrame::StopDtAct),
            0x23 => Some(UFrame::StopDtCon),
            0x43 => Some(UFrame::TestFrAct),
            0x83 => Some(UFrame::TestFrCon),
            _ => None,
        }
    }
}

/// Control-field formats of an APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// Information transfer: both sequence numbers
    I { send_seq: u16, recv_seq: u16 },
    /// Supervisory: receive sequence only
    S { recv_seq: u16 },
    /// Unnumbered control
    U(UFrame),
}

/// Payload state of a received I-frame.
///
/// An I-frame whose ASDU cannot be decoded still advances the receive
/// sequence and gets acknowledged; only the dispatch upward is skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum AsduSlot {
    /// S and U frames carry no ASDU
    None,
    Decoded(Asdu),
    /// Unknown type or malformed payload, kept for the trace only
    Undecodable { reason: String },
}

/// One APDU: control information plus the optional ASDU.
#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    pub apci: Apci,
    pub asdu: AsduSlot,
}

impl Apdu {
    pub fn i_frame(send_seq: u16, recv_seq: u16, asdu: Asdu) -> Self {
        Self {
            apci: Apci::I { send_seq, recv_seq },
            asdu: AsduSlot::Decoded(asdu),
        }
    }

    pub fn s_frame(recv_seq: u16) -> Self {
        Self {
            apci: Apci::S { recv_seq },
            asdu: AsduSlot::None,
        }
    }

    pub fn u_frame(function: UFrame) -> Self {
        Self {
            apci: Apci::U(function),
            asdu: AsduSlot::None,
        }
    }

    /// Encode into start byte, length octet and control fields.
    pub fn encode(&self, params: &AppLayerParameters) -> Iec60870Result<Vec<u8>> {
        let mut buffer = vec![START_BYTE, 0];
        match self.apci {
            Apci::I { send_seq, recv_seq } => {
                buffer.push(((send_seq << 1) & 0xFE) as u8);
                buffer.push((send_seq >> 7) as u8);
                buffer.push(((recv_seq << 1) & 0xFE) as u8);
                buffer.push((recv_seq >> 7) as u8);
                match &self.asdu {
                    AsduSlot::Decoded(asdu) => {
                        buffer.extend_from_slice(&asdu.encode(params)?);
                    }
                    _ => {
                        return Err(Iec60870Error::Protocol(
                            "an I-frame must carry an ASDU".to_string(),
                        ))
                    }
                }
            }
            Apci::S { recv_seq } => {
                buffer.push(0x01);
                buffer.push(0x00);
                buffer.push(((recv_seq << 1) & 0xFE) as u8);
                buffer.push((recv_seq >> 7) as u8);
            }
            Apci::U(function) => {
                buffer.push(function.to_byte());
                buffer.push(0x00);
                buffer.push(0x00);
                buffer.push(0x00);
            }
        }
        let length = buffer.len() - 2;
        if length > MAX_LENGTH as usize {
            return Err(Iec60870Error::Protocol(format!(
                "APDU length {length} exceeds {MAX_LENGTH}"
            )));
        }
        buffer[1] = length as u8;
        Ok(buffer)
    }
}

/// Result of trying to take one APDU off the front of a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// A complete APDU occupying `consumed` bytes
    Complete { apdu: Apdu, consumed: usize },
    /// More bytes are needed
    Incomplete,
    /// Unusable bytes to discard for resynchronisation
    Invalid { skip: usize, reason: String },
}

/// Decode the APDU at the start of `data`.
pub fn decode(params: &AppLayerParameters, data: &[u8]) -> DecodeOutcome {
    if data.is_empty() {
        return DecodeOutcome::Incomplete;
    }
    if data[0] != START_BYTE {
        return DecodeOutcome::Invalid {
            skip: 1,
            reason: format!("expected start byte 0x68, got {:#04x}", data[0]),
        };
    }
    if data.len() < 2 {
        return DecodeOutcome::Incomplete;
    }
    let length = data[1];
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return DecodeOutcome::Invalid {
            skip: 2,
            reason: format!("APDU length octet {length} outside 4..=253"),
        };
    }
    let total = length as usize + 2;
    if data.len() < total {
        return DecodeOutcome::Incomplete;
    }

    let control = &data[2..6];
    let body = &data[6..total];
    let apdu = if control[0] & 0x01 == 0 {
        let send_seq = (((control[1] as u16) << 7) | ((control[0] as u16) >> 1)) & 0x7FFF;
        let recv_seq = (((control[3] as u16) << 7) | ((control[2] as u16) >> 1)) & 0x7FFF;
        if body.is_empty() {
            return DecodeOutcome::Invalid {
                skip: total,
                reason: "I-frame without an ASDU".to_string(),
            };
        }
        let asdu = match Asdu::decode(params, body) {
            Ok(asdu) => AsduSlot::Decoded(asdu),
            Err(e) => AsduSlot::Undecodable {
                reason: e.to_string(),
            },
        };
        Apdu {
            apci: Apci::I { send_seq, recv_seq },
            asdu,
        }
    } else if control[0] & 0x03 == 0x01 {
        let recv_seq = (((control[3] as u16) << 7) | ((control[2] as u16) >> 1)) & 0x7FFF;
        Apdu::s_frame(recv_seq)
    } else {
        match UFrame::from_byte(control[0]) {
            Some(function) => Apdu::u_frame(function),
            None => {
                return DecodeOutcome::Invalid {
                    skip: total,
                    reason: format!("unknown U-frame control {:#04x}", control[0]),
                }
            }
        }
    };
    DecodeOutcome::Complete {
        apdu,
        consumed: total,
    }
}

/// Accumulates stream bytes and yields complete APDUs.
#[derive(Debug, Default)]
pub struct ApduReader {
    buffer: Vec<u8>,
}

impl ApduReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete APDU, discarding garbage along the way.
    /// Returns `None` when more bytes are needed.
    pub fn next(&mut self, params: &AppLayerParameters) -> Option<Apdu> {
        loop {
            match decode(params, &self.buffer) {
                DecodeOutcome::Complete { apdu, consumed } => {
                    self.buffer.drain(..consumed);
                    return Some(apdu);
                }
                DecodeOutcome::Incomplete => return None,
                DecodeOutcome::Invalid { skip, reason } => {
                    tracing::warn!(skip, %reason, "discarding unusable APCI bytes");
                    self.buffer.drain(..skip);
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Cause, TypeId};
    use crate::information::InformationObject;
    use pretty_assertions::assert_eq;

    fn params() -> AppLayerParameters {
        AppLayerParameters::default()
    }

    #[test]
    fn startdt_handshake_bytes() {
        let act = Apdu::u_frame(UFrame::StartDtAct).encode(&params()).unwrap();
        assert_eq!(act, vec![0x68, 0x04, 0x07, 0x00, 0x00, 0x00]);
        let con = Apdu::u_frame(UFrame::StartDtCon).encode(&params()).unwrap();
        assert_eq!(con, vec![0x68, 0x04, 0x0B, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn s_frame_round_trip() {
        for recv_seq in [0u16, 1, 127, 128, 32767] {
            let encoded = Apdu::s_frame(recv_seq).encode(&params()).unwrap();
            match decode(&params(), &encoded) {
                DecodeOutcome::Complete { apdu, consumed } => {
                    assert_eq!(consumed, encoded.len());
                    assert_eq!(apdu.apci, Apci::S { recv_seq });
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn i_frame_round_trip_with_asdu() {
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }],
        )
        .unwrap();
        let apdu = Apdu::i_frame(5, 9, asdu.clone());
        let encoded = apdu.encode(&params()).unwrap();
        match decode(&params(), &encoded) {
            DecodeOutcome::Complete { apdu: decoded, .. } => {
                assert_eq!(
                    decoded.apci,
                    Apci::I {
                        send_seq: 5,
                        recv_seq: 9
                    }
                );
                assert_eq!(decoded.asdu, AsduSlot::Decoded(asdu));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn sequence_field_layout() {
        // N(S)=1, N(R)=2 shifted left by one across two octets each.
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::TestCommand { ioa: 0 }],
        )
        .unwrap();
        let encoded = Apdu::i_frame(1, 2, asdu).encode(&params()).unwrap();
        assert_eq!(&encoded[2..6], &[0x02, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }],
        )
        .unwrap();
        let encoded = Apdu::i_frame(0, 0, asdu).encode(&params()).unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(
                decode(&params(), &encoded[..cut]),
                DecodeOutcome::Incomplete,
                "prefix of {cut} bytes"
            );
        }
    }

    #[test]
    fn garbage_is_skipped_for_resync() {
        let mut reader = ApduReader::new();
        reader.push(&[0xFF, 0x00]);
        reader.push(&Apdu::u_frame(UFrame::TestFrAct).encode(&params()).unwrap());
        let apdu = reader.next(&params()).unwrap();
        assert_eq!(apdu.apci, Apci::U(UFrame::TestFrAct));
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn unknown_u_control_is_discarded() {
        let bytes = [0x68, 0x04, 0x33, 0x00, 0x00, 0x00];
        match decode(&params(), &bytes) {
            DecodeOutcome::Invalid { skip, .. } => assert_eq!(skip, 6),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn undecodable_asdu_keeps_sequence_numbers() {
        // Type id 200 is outside the catalog.
        let bytes = [
            0x68, 0x0E, 0x02, 0x00, 0x00, 0x00, 200, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x14,
        ];
        match decode(&params(), &bytes) {
            DecodeOutcome::Complete { apdu, .. } => {
                assert_eq!(
                    apdu.apci,
                    Apci::I {
                        send_seq: 1,
                        recv_seq: 0
                    }
                );
                assert!(matches!(apdu.asdu, AsduSlot::Undecodable { .. }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn reader_handles_coalesced_frames() {
        let mut reader = ApduReader::new();
        let mut bytes = Apdu::u_frame(UFrame::StartDtAct).encode(&params()).unwrap();
        bytes.extend(Apdu::s_frame(7).encode(&params()).unwrap());
        reader.push(&bytes);
        assert_eq!(
            reader.next(&params()).unwrap().apci,
            Apci::U(UFrame::StartDtAct)
        );
        assert_eq!(reader.next(&params()).unwrap().apci, Apci::S { recv_seq: 7 });
        assert!(reader.next(&params()).is_none());
    }

    #[test]
    fn modular_sequence_helpers() {
        assert_eq!(next_seq(32767), 0);
        assert_eq!(seq_distance(0, 32767), 1);
        assert_eq!(seq_distance(5, 2), 3);
        assert!(seq_at_or_after(3, 2));
        assert!(seq_at_or_after(1, 32760));
        assert!(!seq_at_or_after(32760, 1));
    }

    #[test]
    fn interrogation_length_octet() {
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }],
        )
        .unwrap();
        let encoded = Apdu::i_frame(0, 0, asdu).encode(&params()).unwrap();
        // 4 control octets + 10 ASDU bytes.
        assert_eq!(encoded[1], 14);
        assert_eq!(
            &encoded[6..],
            &[0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x14]
        );
    }
}
