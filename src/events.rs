//! Event delivery towards the host application.
//!
//! The engine never calls back into the host directly; every observable
//! state change and every decoded batch goes through an [`EventSink`]
//! capability held as `Arc<dyn EventSink>`. Sinks must be thread safe:
//! calls arrive from whichever connection worker produced the event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::asdu::Asdu;
use crate::common::TypeId;
use crate::information::{normalized_to_f32, InformationObject};

/// Lifecycle events of a connection or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlEvent {
    Opened,
    Closed,
    Activated,
    Deactivated,
    Reconnecting,
    Failed,
    Busy,
    Error,
}

/// One decoded information object, flattened for the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "typeId")]
    pub type_id: TypeId,
    pub ioa: u32,
    pub value: f64,
    pub quality: u8,
    /// Milliseconds since epoch, present for CP56-tagged types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Select flag, present for command types
    #[serde(rename = "bselCmd", skip_serializing_if = "Option::is_none")]
    pub bsel_cmd: Option<bool>,
    /// Qualifier of command, present for command types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ql: Option<u8>,
    #[serde(rename = "asduAddress")]
    pub asdu_address: u16,
}

impl DataPoint {
    /// Flatten every object of an ASDU into data points.
    pub fn from_asdu(asdu: &Asdu) -> Vec<DataPoint> {
        asdu.objects
            .iter()
            .map(|object| Self::from_object(object, asdu.common_address))
            .collect()
    }

    fn from_object(object: &InformationObject, asdu_address: u16) -> DataPoint {
        use InformationObject::*;
        let type_id = object.type_id();
        let ioa = object.ioa();
        let mut point = DataPoint {
            type_id,
            ioa,
            value: 0.0,
            quality: 0,
            timestamp: None,
            bsel_cmd: None,
            ql: None,
            asdu_address,
        };
        match object {
            SinglePoint { value, quality, .. } => {
                point.value = f64::from(u8::from(*value));
                point.quality = quality.to_byte();
            }
            SinglePointWithCp24 { value, quality, .. } => {
                point.value = f64::from(u8::from(*value));
                point.quality = quality.to_byte();
            }
            SinglePointWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(u8::from(*value));
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            DoublePoint { value, quality, .. } | DoublePointWithCp24 { value, quality, .. } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
            }
            DoublePointWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            StepPosition { value, quality, .. }
            | StepPositionWithCp24 { value, quality, .. } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
            }
            StepPositionWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            Bitstring32 { value, quality, .. } | Bitstring32WithCp24 { value, quality, .. } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
            }
            Bitstring32WithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            MeasuredNormalized { value, quality, .. }
            | MeasuredNormalizedWithCp24 { value, quality, .. } => {
                point.value = f64::from(normalized_to_f32(*value));
                point.quality = quality.to_byte();
            }
            MeasuredNormalizedWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(normalized_to_f32(*value));
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            MeasuredNormalizedNoQuality { value, .. } => {
                point.value = f64::from(normalized_to_f32(*value));
            }
            MeasuredScaled { value, quality, .. }
            | MeasuredScaledWithCp24 { value, quality, .. } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
            }
            MeasuredScaledWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            MeasuredShort { value, quality, .. }
            | MeasuredShortWithCp24 { value, quality, .. } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
            }
            MeasuredShortWithCp56 {
                value,
                quality,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.quality = quality.to_byte();
                point.timestamp = time.to_millis();
            }
            IntegratedTotals { reading, .. } | IntegratedTotalsWithCp24 { reading, .. } => {
                point.value = f64::from(reading.value);
            }
            IntegratedTotalsWithCp56 { reading, time, .. } => {
                point.value = f64::from(reading.value);
                point.timestamp = time.to_millis();
            }
            SingleCommand {
                value, select, ql, ..
            } => {
                point.value = f64::from(u8::from(*value));
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
            }
            SingleCommandWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            } => {
                point.value = f64::from(u8::from(*value));
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
                point.timestamp = time.to_millis();
            }
            DoubleCommand {
                value, select, ql, ..
            }
            | StepCommand {
                value, select, ql, ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
            }
            DoubleCommandWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            }
            | StepCommandWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
                point.timestamp = time.to_millis();
            }
            SetpointNormalized {
                value, select, ql, ..
            } => {
                point.value = f64::from(normalized_to_f32(*value));
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
            }
            SetpointNormalizedWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            } => {
                point.value = f64::from(normalized_to_f32(*value));
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
                point.timestamp = time.to_millis();
            }
            SetpointScaled {
                value, select, ql, ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
            }
            SetpointScaledWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
                point.timestamp = time.to_millis();
            }
            SetpointShort {
                value, select, ql, ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
            }
            SetpointShortWithCp56 {
                value,
                select,
                ql,
                time,
                ..
            } => {
                point.value = f64::from(*value);
                point.bsel_cmd = Some(*select);
                point.ql = Some(*ql);
                point.timestamp = time.to_millis();
            }
            Bitstring32Command { value, .. } => {
                point.value = f64::from(*value);
            }
            Bitstring32CommandWithCp56 { value, time, .. } => {
                point.value = f64::from(*value);
                point.timestamp = time.to_millis();
            }
            InterrogationCommand { qoi, .. } => point.value = f64::from(*qoi),
            CounterInterrogationCommand { qcc, .. } => point.value = f64::from(*qcc),
            ReadCommand { .. } | TestCommand { .. } => {}
            ClockSyncCommand { time, .. } => {
                point.value = time.to_millis().map(|ms| ms as f64).unwrap_or(0.0);
                point.timestamp = time.to_millis();
            }
        }
        point
    }
}

/// Capability through which the engine reports to the host.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A lifecycle event on the identified connection or link.
    async fn control(&self, endpoint: &str, event: ControlEvent, reason: &str);

    /// A batch of decoded information objects from one ASDU.
    async fn data(&self, endpoint: &str, points: Vec<DataPoint>);

    /// An internal fault that is not a lifecycle transition.
    async fn error(&self, endpoint: &str, reason: &str);
}

/// One delivered sink call, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Control {
        endpoint: String,
        event: ControlEvent,
        reason: String,
    },
    Data {
        endpoint: String,
        points: Vec<DataPoint>,
    },
    Error {
        endpoint: String,
        reason: String,
    },
}

/// Sink that forwards every event into an unbounded channel. Useful for
/// hosts that consume events from a single task, and for tests.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn control(&self, endpoint: &str, event: ControlEvent, reason: &str) {
        let _ = self.tx.send(EngineEvent::Control {
            endpoint: endpoint.to_string(),
            event,
            reason: reason.to_string(),
        });
    }

    async fn data(&self, endpoint: &str, points: Vec<DataPoint>) {
        let _ = self.tx.send(EngineEvent::Data {
            endpoint: endpoint.to_string(),
            points,
        });
    }

    async fn error(&self, endpoint: &str, reason: &str) {
        let _ = self.tx.send(EngineEvent::Error {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        });
    }
}
