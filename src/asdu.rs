//! ASDU - Application Service Data Unit codec.

use byteorder::ReadBytesExt;
use std::io::Cursor;

use crate::common::{AppLayerParameters, CauseOfTransmission, TypeId};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::information::InformationObject;

/// An application service data unit: header fields plus the typed
/// information objects it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: TypeId,
    /// VSQ sequence flag: one leading IOA followed by consecutive elements
    pub sequence: bool,
    pub cot: CauseOfTransmission,
    /// Originator address (second COT octet when size_of_cot is 2)
    pub originator: u8,
    pub common_address: u16,
    pub objects: Vec<InformationObject>,
}

impl Asdu {
    /// Build a non-sequence ASDU. The type is taken from the first object.
    pub fn new(
        cot: impl Into<CauseOfTransmission>,
        originator: u8,
        common_address: u16,
        objects: Vec<InformationObject>,
    ) -> Iec60870Result<Self> {
        let first = objects.first().ok_or_else(|| {
            Iec60870Error::Config("an ASDU needs at least one information object".to_string())
        })?;
        Ok(Self {
            type_id: first.type_id(),
            sequence: false,
            cot: cot.into(),
            originator,
            common_address,
            objects,
        })
    }

    /// Number of information objects (the VSQ count field).
    pub fn count(&self) -> usize {
        self.objects.len()
    }

    /// Type identification of the raw bytes without a full decode, used to
    /// skip unsupported types while still acknowledging the transport.
    pub fn peek_type(data: &[u8]) -> Option<TypeId> {
        data.first().and_then(|b| TypeId::from_byte(*b))
    }

    /// Encode with the given field widths.
    pub fn encode(&self, params: &AppLayerParameters) -> Iec60870Result<Vec<u8>> {
        if self.objects.is_empty() || self.objects.len() > 127 {
            return Err(Iec60870Error::Config(format!(
                "ASDU object count must be 1..=127, got {}",
                self.objects.len()
            )));
        }
        if self.common_address == 0
            || (params.size_of_ca == 1 && self.common_address > 0xFF)
        {
            return Err(Iec60870Error::Config(format!(
                "common address {} does not fit size_of_ca {}",
                self.common_address, params.size_of_ca
            )));
        }
        let base_ioa = self.objects[0].ioa();
        for (i, object) in self.objects.iter().enumerate() {
            if object.type_id() != self.type_id {
                return Err(Iec60870Error::Config(format!(
                    "mixed object types in one ASDU: {:?} and {:?}",
                    self.type_id,
                    object.type_id()
                )));
            }
            if self.sequence && object.ioa() != base_ioa + i as u32 {
                return Err(Iec60870Error::Config(
                    "sequence ASDU requires consecutive object addresses".to_string(),
                ));
            }
            check_ioa_width(object.ioa(), params)?;
        }

        let mut buffer = Vec::new();
        buffer.push(self.type_id.to_byte());
        buffer.push(self.objects.len() as u8 | if self.sequence { 0x80 } else { 0 });
        buffer.push(self.cot.to_byte());
        if params.size_of_cot == 2 {
            buffer.push(self.originator);
        }
        buffer.push((self.common_address & 0xFF) as u8);
        if params.size_of_ca == 2 {
            buffer.push((self.common_address >> 8) as u8);
        }

        if self.sequence {
            write_ioa(&mut buffer, base_ioa, params);
            for object in &self.objects {
                object.encode_element(&mut buffer);
            }
        } else {
            for object in &self.objects {
                write_ioa(&mut buffer, object.ioa(), params);
                object.encode_element(&mut buffer);
            }
        }

        if buffer.len() > params.max_asdu_size as usize {
            return Err(Iec60870Error::Config(format!(
                "encoded ASDU is {} bytes, limit {}",
                buffer.len(),
                params.max_asdu_size
            )));
        }
        Ok(buffer)
    }

    /// Decode with the given field widths. The slice must hold exactly one
    /// ASDU (the APCI/FT 1.2 length field delimits it on the wire).
    pub fn decode(params: &AppLayerParameters, data: &[u8]) -> Iec60870Result<Self> {
        if data.len() < params.header_size() {
            return Err(Iec60870Error::Frame(format!(
                "ASDU shorter than its {}-byte header",
                params.header_size()
            )));
        }
        let mut cursor = Cursor::new(data);

        let type_byte = cursor.read_u8()?;
        let type_id = TypeId::from_byte(type_byte)
            .ok_or_else(|| Iec60870Error::Protocol(format!("unknown type id {type_byte}")))?;

        let vsq = cursor.read_u8()?;
        let sequence = (vsq & 0x80) != 0;
        let count = (vsq & 0x7F) as usize;

        let cot_byte = cursor.read_u8()?;
        let cot = CauseOfTransmission::from_byte(cot_byte)
            .ok_or_else(|| Iec60870Error::Protocol(format!("unknown COT {cot_byte}")))?;
        let originator = if params.size_of_cot == 2 {
            cursor.read_u8()?
        } else {
            0
        };

        let mut common_address = cursor.read_u8()? as u16;
        if params.size_of_ca == 2 {
            common_address |= (cursor.read_u8()? as u16) << 8;
        }

        let element_size = InformationObject::element_size(type_id);
        let ioa_size = params.size_of_ioa as usize;
        let mut position = cursor.position() as usize;
        let mut objects = Vec::with_capacity(count);

        if sequence {
            let base_ioa = read_ioa(&data[position..], params)?;
            position += ioa_size;
            for i in 0..count {
                let object = InformationObject::decode_element(
                    type_id,
                    base_ioa + i as u32,
                    &data[position..],
                )?;
                position += element_size;
                objects.push(object);
            }
        } else {
            for _ in 0..count {
                let ioa = read_ioa(&data[position..], params)?;
                position += ioa_size;
                let object =
                    InformationObject::decode_element(type_id, ioa, &data[position..])?;
                position += element_size;
                objects.push(object);
            }
        }

        if position != data.len() {
            return Err(Iec60870Error::Frame(format!(
                "{} trailing bytes after the last information object",
                data.len() - position
            )));
        }

        Ok(Self {
            type_id,
            sequence,
            cot,
            originator,
            common_address,
            objects,
        })
    }
}

fn check_ioa_width(ioa: u32, params: &AppLayerParameters) -> Iec60870Result<()> {
    let max = match params.size_of_ioa {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFF_FFFF,
    };
    if ioa > max {
        return Err(Iec60870Error::Config(format!(
            "information object address {ioa} does not fit size_of_ioa {}",
            params.size_of_ioa
        )));
    }
    Ok(())
}

fn write_ioa(buffer: &mut Vec<u8>, ioa: u32, params: &AppLayerParameters) {
    buffer.push((ioa & 0xFF) as u8);
    if params.size_of_ioa >= 2 {
        buffer.push(((ioa >> 8) & 0xFF) as u8);
    }
    if params.size_of_ioa == 3 {
        buffer.push(((ioa >> 16) & 0xFF) as u8);
    }
}

fn read_ioa(data: &[u8], params: &AppLayerParameters) -> Iec60870Result<u32> {
    let size = params.size_of_ioa as usize;
    if data.len() < size {
        return Err(Iec60870Error::Frame(
            "ASDU truncated inside an object address".to_string(),
        ));
    }
    let mut ioa = data[0] as u32;
    if size >= 2 {
        ioa |= (data[1] as u32) << 8;
    }
    if size == 3 {
        ioa |= (data[2] as u32) << 16;
    }
    Ok(ioa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Cause, Quality};
    use crate::time::Cp56Time2a;
    use pretty_assertions::assert_eq;

    fn params() -> AppLayerParameters {
        AppLayerParameters::default()
    }

    fn round_trip(asdu: Asdu) {
        let encoded = asdu.encode(&params()).unwrap();
        let decoded = Asdu::decode(&params(), &encoded).unwrap();
        assert_eq!(decoded, asdu);
    }

    #[test]
    fn interrogation_command_wire_bytes() {
        // C_IC_NA_1, COT activation, CA 1, IOA 0, QOI 20 with widths 1/1/2/2/3.
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }],
        )
        .unwrap();
        let encoded = asdu.encode(&params()).unwrap();
        assert_eq!(
            encoded,
            vec![0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x14]
        );
    }

    #[test]
    fn non_sequence_round_trip() {
        round_trip(
            Asdu::new(
                Cause::Spontaneous,
                3,
                42,
                vec![
                    InformationObject::MeasuredShort {
                        ioa: 7001,
                        value: 230.5,
                        quality: Quality::GOOD,
                    },
                    InformationObject::MeasuredShort {
                        ioa: 9999,
                        value: -48.2,
                        quality: Quality {
                            invalid: true,
                            ..Quality::GOOD
                        },
                    },
                ],
            )
            .unwrap(),
        );
    }

    #[test]
    fn sequence_round_trip() {
        let objects = (0..5)
            .map(|i| InformationObject::MeasuredScaled {
                ioa: 2000 + i,
                value: (i as i16) * 100 - 50,
                quality: Quality::GOOD,
            })
            .collect();
        let mut asdu = Asdu::new(Cause::InterrogatedByStation, 0, 1, objects).unwrap();
        asdu.sequence = true;
        round_trip(asdu);
    }

    #[test]
    fn sequence_encoding_is_denser() {
        let objects: Vec<_> = (0..10)
            .map(|i| InformationObject::SinglePoint {
                ioa: 100 + i,
                value: i % 2 == 0,
                quality: Quality::GOOD,
            })
            .collect();
        let plain = Asdu::new(Cause::Spontaneous, 0, 1, objects.clone()).unwrap();
        let mut packed = plain.clone();
        packed.sequence = true;
        let plain_len = plain.encode(&params()).unwrap().len();
        let packed_len = packed.encode(&params()).unwrap().len();
        // 10 addresses collapse into one.
        assert_eq!(plain_len - packed_len, 9 * 3);
    }

    #[test]
    fn sequence_requires_consecutive_addresses() {
        let mut asdu = Asdu::new(
            Cause::Spontaneous,
            0,
            1,
            vec![
                InformationObject::SinglePoint {
                    ioa: 1,
                    value: true,
                    quality: Quality::GOOD,
                },
                InformationObject::SinglePoint {
                    ioa: 5,
                    value: false,
                    quality: Quality::GOOD,
                },
            ],
        )
        .unwrap();
        asdu.sequence = true;
        assert!(asdu.encode(&params()).is_err());
    }

    #[test]
    fn mixed_types_are_rejected() {
        let mut asdu = Asdu::new(
            Cause::Spontaneous,
            0,
            1,
            vec![InformationObject::SinglePoint {
                ioa: 1,
                value: true,
                quality: Quality::GOOD,
            }],
        )
        .unwrap();
        asdu.objects.push(InformationObject::DoublePoint {
            ioa: 2,
            value: 1,
            quality: Quality::GOOD,
        });
        assert!(asdu.encode(&params()).is_err());
    }

    #[test]
    fn narrow_widths_round_trip() {
        let narrow = AppLayerParameters {
            size_of_cot: 1,
            size_of_ca: 1,
            size_of_ioa: 1,
            ..Default::default()
        };
        let asdu = Asdu::new(
            Cause::Request,
            9,
            200,
            vec![InformationObject::SinglePoint {
                ioa: 17,
                value: true,
                quality: Quality::GOOD,
            }],
        )
        .unwrap();
        let encoded = asdu.encode(&narrow).unwrap();
        // type + vsq + cot + ca + ioa + siq
        assert_eq!(encoded.len(), 6);
        let decoded = Asdu::decode(&narrow, &encoded).unwrap();
        // A one-byte COT cannot carry the originator.
        assert_eq!(decoded.originator, 0);
        assert_eq!(decoded.objects, asdu.objects);
    }

    #[test]
    fn ioa_must_fit_configured_width(){
        let narrow = AppLayerParameters {
            size_of_ioa: 2,
            ..Default::default()
        };
        let asdu = Asdu::new(
            Cause::Activation,
            0,
            1,
            vec![InformationObject::SingleCommand {
                ioa: 0x1_0000,
                value: true,
                select: false,
                ql: 0,
            }],
        )
        .unwrap();
        assert!(asdu.encode(&narrow).is_err());
    }

    #[test]
    fn unknown_type_id_is_a_protocol_error() {
        let bytes = [200u8, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x14];
        assert!(Asdu::peek_type(&bytes).is_none());
        assert!(matches!(
            Asdu::decode(&params(), &bytes),
            Err(Iec60870Error::Protocol(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_frame_error() {
        let asdu = Asdu::new(
            Cause::Spontaneous,
            0,
            1,
            vec![InformationObject::MeasuredShort {
                ioa: 1,
                value: 1.0,
                quality: Quality::GOOD,
            }],
        )
        .unwrap();
        let mut encoded = asdu.encode(&params()).unwrap();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            Asdu::decode(&params(), &encoded),
            Err(Iec60870Error::Frame(_))
        ));
    }

    #[test]
    fn clock_sync_round_trip() {
        round_trip(
            Asdu::new(
                Cause::Activation,
                0,
                1,
                vec![InformationObject::ClockSyncCommand {
                    ioa: 0,
                    time: Cp56Time2a::from_millis(1_705_321_496_789).unwrap(),
                }],
            )
            .unwrap(),
        );
    }
}
