//! Outbound command and data-point construction.
//!
//! Every role's `send_commands` takes a list of [`CommandSpec`]s. One
//! builder validates the value domain and produces the information object
//! for every type in the catalog, so the per-type rules live in a single
//! place instead of one branch per call site.

use crate::common::{Cause, Quality, TypeId};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::information::{normalized_from_f32, InformationObject};
use crate::time::Cp56Time2a;

/// Value carried by a command or monitoring point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// For types that carry no value (read, test)
    None,
}

impl From<bool> for CommandValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for CommandValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// One entry of a `send_commands` call.
///
/// The same specification type serves the control direction (client and
/// master roles, command types) and the monitoring direction (server and
/// slave roles, measurement types); fields that do not apply to the type
/// are ignored by the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub type_id: TypeId,
    pub ioa: u32,
    pub value: CommandValue,
    /// Select-before-operate flag (commands)
    pub select: bool,
    /// Qualifier of command, 0..=31 (commands)
    pub ql: u8,
    /// Quality descriptor (monitoring points)
    pub quality: Quality,
    /// Epoch milliseconds; required for CP56-tagged types
    pub timestamp: Option<u64>,
    /// Cause override; defaults per type (activation for commands,
    /// request for interrogation/read, spontaneous for monitoring)
    pub cause: Option<Cause>,
    /// Common address override; defaults to the role's configured address
    pub asdu_address: Option<u16>,
}

impl CommandSpec {
    pub fn new(type_id: TypeId, ioa: u32, value: impl Into<CommandValue>) -> Self {
        Self {
            type_id,
            ioa,
            value: value.into(),
            select: false,
            ql: 0,
            quality: Quality::GOOD,
            timestamp: None,
            cause: None,
            asdu_address: None,
        }
    }

    pub fn with_select(mut self, select: bool) -> Self {
        self.select = select;
        self
    }

    pub fn with_ql(mut self, ql: u8) -> Self {
        self.ql = ql;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timestamp(mut self, ms: u64) -> Self {
        self.timestamp = Some(ms);
        self
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_asdu_address(mut self, address: u16) -> Self {
        self.asdu_address = Some(address);
        self
    }

    /// The cause used when none is given explicitly.
    pub fn effective_cause(&self) -> Cause {
        self.cause.unwrap_or(match self.type_id {
            TypeId::InterrogationCommand
            | TypeId::CounterInterrogationCommand
            | TypeId::ReadCommand => Cause::Request,
            t if t.is_command() || t.is_system() => Cause::Activation,
            _ => Cause::Spontaneous,
        })
    }

    /// Validate the spec and build its information object.
    pub fn to_object(&self) -> Iec60870Result<InformationObject> {
        let t = self.type_id;
        if t.is_command() && self.ql > 31 {
            return Err(Iec60870Error::ValueOutOfRange {
                type_id: t,
                detail: format!("ql must be 0..=31, got {}", self.ql),
            });
        }
        let time = if t.has_cp56() || t == TypeId::ClockSyncCommand {
            let ms = match (self.timestamp, t) {
                // Clock sync takes the time as its value when no separate
                // timestamp is supplied.
                (None, TypeId::ClockSyncCommand) => self.int_value("timestamp")? as u64,
                (Some(ms), _) => ms,
                (None, _) => {
                    return Err(Iec60870Error::Config(format!(
                        "{t:?} requires a timestamp"
                    )))
                }
            };
            Some(Cp56Time2a::from_millis(ms)?)
        } else {
            None
        };
        let type_id = self.type_id;
        let tag = move |t: Option<Cp56Time2a>| {
            t.ok_or_else(|| Iec60870Error::Config(format!("{type_id:?} requires a time tag")))
        };

        use TypeId as T;
        let object = match t {
            T::SingleCommand => InformationObject::SingleCommand {
                ioa: self.ioa,
                value: self.bool_value()?,
                select: self.select,
                ql: self.ql,
            },
            T::SingleCommandWithCp56 => InformationObject::SingleCommandWithCp56 {
                ioa: self.ioa,
                value: self.bool_value()?,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::DoubleCommand => InformationObject::DoubleCommand {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                select: self.select,
                ql: self.ql,
            },
            T::DoubleCommandWithCp56 => InformationObject::DoubleCommandWithCp56 {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::StepCommand => InformationObject::StepCommand {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                select: self.select,
                ql: self.ql,
            },
            T::StepCommandWithCp56 => InformationObject::StepCommandWithCp56 {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::SetpointNormalized => InformationObject::SetpointNormalized {
                ioa: self.ioa,
                value: self.normalized_value()?,
                select: self.select,
                ql: self.ql,
            },
            T::SetpointNormalizedWithCp56 => InformationObject::SetpointNormalizedWithCp56 {
                ioa: self.ioa,
                value: self.normalized_value()?,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::SetpointScaled => InformationObject::SetpointScaled {
                ioa: self.ioa,
                value: self.int_in(-32768, 32767)? as i16,
                select: self.select,
                ql: self.ql,
            },
            T::SetpointScaledWithCp56 => InformationObject::SetpointScaledWithCp56 {
                ioa: self.ioa,
                value: self.int_in(-32768, 32767)? as i16,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::SetpointShort => InformationObject::SetpointShort {
                ioa: self.ioa,
                value: self.float_value()?,
                select: self.select,
                ql: self.ql,
            },
            T::SetpointShortWithCp56 => InformationObject::SetpointShortWithCp56 {
                ioa: self.ioa,
                value: self.float_value()?,
                select: self.select,
                ql: self.ql,
                time: tag(time)?,
            },
            T::Bitstring32Command => InformationObject::Bitstring32Command {
                ioa: self.ioa,
                value: self.int_in(0, u32::MAX as i64)? as u32,
            },
            T::Bitstring32CommandWithCp56 => InformationObject::Bitstring32CommandWithCp56 {
                ioa: self.ioa,
                value: self.int_in(0, u32::MAX as i64)? as u32,
                time: tag(time)?,
            },
            T::InterrogationCommand => InformationObject::InterrogationCommand {
                ioa: self.ioa,
                qoi: self.int_in(0, 255)? as u8,
            },
            T::CounterInterrogationCommand => InformationObject::CounterInterrogationCommand {
                ioa: self.ioa,
                qcc: self.int_in(0, 255)? as u8,
            },
            T::ReadCommand => InformationObject::ReadCommand { ioa: self.ioa },
            T::ClockSyncCommand => InformationObject::ClockSyncCommand {
                ioa: self.ioa,
                time: tag(time)?,
            },
            T::TestCommand => InformationObject::TestCommand { ioa: self.ioa },

            T::SinglePoint => InformationObject::SinglePoint {
                ioa: self.ioa,
                value: self.bool_value()?,
                quality: self.quality,
            },
            T::SinglePointWithCp56 => InformationObject::SinglePointWithCp56 {
                ioa: self.ioa,
                value: self.bool_value()?,
                quality: self.quality,
                time: tag(time)?,
            },
            T::DoublePoint => InformationObject::DoublePoint {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                quality: self.quality,
            },
            T::DoublePointWithCp56 => InformationObject::DoublePointWithCp56 {
                ioa: self.ioa,
                value: self.int_in(0, 3)? as u8,
                quality: self.quality,
                time: tag(time)?,
            },
            T::StepPosition => InformationObject::StepPosition {
                ioa: self.ioa,
                value: self.int_in(-64, 63)? as i8,
                transient: false,
                quality: self.quality,
            },
            T::StepPositionWithCp56 => InformationObject::StepPositionWithCp56 {
                ioa: self.ioa,
                value: self.int_in(-64, 63)? as i8,
                transient: false,
                quality: self.quality,
                time: tag(time)?,
            },
            T::Bitstring32 => InformationObject::Bitstring32 {
                ioa: self.ioa,
                value: self.int_in(0, u32::MAX as i64)? as u32,
                quality: self.quality,
            },
            T::Bitstring32WithCp56 => InformationObject::Bitstring32WithCp56 {
                ioa: self.ioa,
                value: self.int_in(0, u32::MAX as i64)? as u32,
                quality: self.quality,
                time: tag(time)?,
            },
            T::MeasuredNormalized => InformationObject::MeasuredNormalized {
                ioa: self.ioa,
                value: self.normalized_value()?,
                quality: self.quality,
            },
            T::MeasuredNormalizedWithCp56 => InformationObject::MeasuredNormalizedWithCp56 {
                ioa: self.ioa,
                value: self.normalized_value()?,
                quality: self.quality,
                time: tag(time)?,
            },
            T::MeasuredNormalizedNoQuality => InformationObject::MeasuredNormalizedNoQuality {
                ioa: self.ioa,
                value: self.normalized_value()?,
            },
            T::MeasuredScaled => InformationObject::MeasuredScaled {
                ioa: self.ioa,
                value: self.int_in(-32768, 32767)? as i16,
                quality: self.quality,
            },
            T::MeasuredScaledWithCp56 => InformationObject::MeasuredScaledWithCp56 {
                ioa: self.ioa,
                value: self.int_in(-32768, 32767)? as i16,
                quality: self.quality,
                time: tag(time)?,
            },
            T::MeasuredShort => InformationObject::MeasuredShort {
                ioa: self.ioa,
                value: self.float_value()?,
                quality: self.quality,
            },
            T::MeasuredShortWithCp56 => InformationObject::MeasuredShortWithCp56 {
                ioa: self.ioa,
                value: self.float_value()?,
                quality: self.quality,
                time: tag(time)?,
            },
            T::IntegratedTotals => InformationObject::IntegratedTotals {
                ioa: self.ioa,
                reading: self.counter_reading()?,
            },
            T::IntegratedTotalsWithCp56 => InformationObject::IntegratedTotalsWithCp56 {
                ioa: self.ioa,
                reading: self.counter_reading()?,
                time: tag(time)?,
            },
            other => {
                return Err(Iec60870Error::Config(format!(
                    "{other:?} cannot be built from a command spec"
                )))
            }
        };
        Ok(object)
    }

    fn bool_value(&self) -> Iec60870Result<bool> {
        match self.value {
            CommandValue::Bool(v) => Ok(v),
            CommandValue::Int(0) => Ok(false),
            CommandValue::Int(1) => Ok(true),
            _ => Err(self.bad_value("a boolean")),
        }
    }

    fn int_value(&self, what: &str) -> Iec60870Result<i64> {
        match self.value {
            CommandValue::Int(v) => Ok(v),
            _ => Err(self.bad_value(what)),
        }
    }

    fn int_in(&self, min: i64, max: i64) -> Iec60870Result<i64> {
        let v = self.int_value("an integer")?;
        if !(min..=max).contains(&v) {
            return Err(Iec60870Error::ValueOutOfRange {
                type_id: self.type_id,
                detail: format!("{v} outside {min}..={max}"),
            });
        }
        Ok(v)
    }

    fn float_value(&self) -> Iec60870Result<f32> {
        match self.value {
            CommandValue::Float(v) if v.is_finite() => Ok(v as f32),
            CommandValue::Int(v) => Ok(v as f32),
            _ => Err(self.bad_value("a finite number")),
        }
    }

    fn normalized_value(&self) -> Iec60870Result<i16> {
        let v = match self.value {
            CommandValue::Float(v) => v as f32,
            CommandValue::Int(v) => v as f32,
            _ => return Err(self.bad_value("a number in [-1.0, +1.0]")),
        };
        normalized_from_f32(v).map_err(|_| Iec60870Error::ValueOutOfRange {
            type_id: self.type_id,
            detail: format!("{v} outside [-1.0, +1.0]"),
        })
    }

    fn counter_reading(&self) -> Iec60870Result<crate::information::CounterReading> {
        let v = self.int_in(i32::MIN as i64, i32::MAX as i64)?;
        Ok(crate::information::CounterReading {
            value: v as i32,
            invalid: self.quality.invalid,
            ..Default::default()
        })
    }

    fn bad_value(&self, expected: &str) -> Iec60870Error {
        Iec60870Error::ValueOutOfRange {
            type_id: self.type_id,
            detail: format!("{:?} is not {expected}", self.value),
        }
    }
}

/// Partition specs by `(type_id, asdu_address)` preserving first-seen order,
/// so one ASDU never mixes types or stations. Validation of every spec
/// happens before any ASDU is assembled: either the whole list is good or
/// nothing is produced.
pub fn build_grouped_asdus(
    specs: &[CommandSpec],
    originator: u8,
    default_address: u16,
) -> Iec60870Result<Vec<crate::asdu::Asdu>> {
    let mut groups: Vec<((TypeId, u16, Cause), Vec<InformationObject>)> = Vec::new();
    for spec in specs {
        let object = spec.to_object()?;
        let key = (
            spec.type_id,
            spec.asdu_address.unwrap_or(default_address),
            spec.effective_cause(),
        );
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, objects)) => objects.push(object),
            None => groups.push((key, vec![object])),
        }
    }
    groups
        .into_iter()
        .map(|((_, address, cause), objects)| {
            crate::asdu::Asdu::new(cause, originator, address, objects)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_command_defaults() {
        let spec = CommandSpec::new(TypeId::SingleCommand, 1000, true);
        assert_eq!(spec.effective_cause(), Cause::Activation);
        assert_eq!(
            spec.to_object().unwrap(),
            InformationObject::SingleCommand {
                ioa: 1000,
                value: true,
                select: false,
                ql: 0,
            }
        );
    }

    #[test]
    fn interrogation_defaults_to_request_cause() {
        let spec = CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64);
        assert_eq!(spec.effective_cause(), Cause::Request);
        let explicit = spec.clone().with_cause(Cause::Activation);
        assert_eq!(explicit.effective_cause(), Cause::Activation);
    }

    #[test]
    fn ql_range_is_enforced() {
        let spec = CommandSpec::new(TypeId::SingleCommand, 1, true).with_ql(32);
        assert!(matches!(
            spec.to_object(),
            Err(Iec60870Error::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn double_command_value_range() {
        assert!(CommandSpec::new(TypeId::DoubleCommand, 1, 3i64)
            .to_object()
            .is_ok());
        assert!(CommandSpec::new(TypeId::DoubleCommand, 1, 4i64)
            .to_object()
            .is_err());
        assert!(CommandSpec::new(TypeId::DoubleCommand, 1, true)
            .to_object()
            .is_err());
    }

    #[test]
    fn normalized_setpoint_saturates_plus_one() {
        let object = CommandSpec::new(TypeId::SetpointNormalized, 1, 1.0)
            .to_object()
            .unwrap();
        assert_eq!(
            object,
            InformationObject::SetpointNormalized {
                ioa: 1,
                value: 32767,
                select: false,
                ql: 0,
            }
        );
        assert!(CommandSpec::new(TypeId::SetpointNormalized, 1, 1.5)
            .to_object()
            .is_err());
    }

    #[test]
    fn timed_command_requires_timestamp() {
        let missing = CommandSpec::new(TypeId::SingleCommandWithCp56, 1, true);
        assert!(missing.to_object().is_err());
        let with = missing.with_timestamp(1_705_321_496_789);
        assert!(with.to_object().is_ok());
    }

    #[test]
    fn clock_sync_takes_value_as_time() {
        let object = CommandSpec::new(TypeId::ClockSyncCommand, 0, 1_705_321_496_789i64)
            .to_object()
            .unwrap();
        match object {
            InformationObject::ClockSyncCommand { time, .. } => {
                assert_eq!(time.to_millis(), Some(1_705_321_496_789));
            }
            other => panic!("unexpected object {other:?}"),
        }
    }

    #[test]
    fn grouping_partitions_by_type_and_address() {
        let specs = vec![
            CommandSpec::new(TypeId::SinglePoint, 100, true),
            CommandSpec::new(TypeId::SinglePoint, 101, false),
            CommandSpec::new(TypeId::MeasuredScaled, 200, 42i64),
            CommandSpec::new(TypeId::SinglePoint, 102, true).with_asdu_address(9),
        ];
        let asdus = build_grouped_asdus(&specs, 0, 1).unwrap();
        assert_eq!(asdus.len(), 3);
        assert_eq!(asdus[0].objects.len(), 2);
        assert_eq!(asdus[0].common_address, 1);
        assert_eq!(asdus[1].type_id, TypeId::MeasuredScaled);
        assert_eq!(asdus[2].common_address, 9);
    }

    #[test]
    fn grouping_is_all_or_nothing() {
        let specs = vec![
            CommandSpec::new(TypeId::SinglePoint, 100, true),
            CommandSpec::new(TypeId::DoubleCommand, 1, 9i64),
        ];
        assert!(build_grouped_asdus(&specs, 0, 1).is_err());
    }

    #[test]
    fn monitoring_spec_carries_quality() {
        let bad = Quality {
            not_topical: true,
            ..Quality::GOOD
        };
        let object = CommandSpec::new(TypeId::MeasuredShort, 5, 12.5)
            .with_quality(bad)
            .to_object()
            .unwrap();
        assert_eq!(
            object,
            InformationObject::MeasuredShort {
                ioa: 5,
                value: 12.5,
                quality: bad,
            }
        );
    }
}
