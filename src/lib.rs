//! # iec60870
//!
//! An implementation of the IEC 60870-5 telecontrol protocols for SCADA
//! communications: the serial profile CS101 (IEC 60870-5-101) and the
//! TCP/IP profile CS104 (IEC 60870-5-104), in both the controlling-station
//! and controlled-station roles.
//!
//! ## Features
//!
//! - CS104 client and server with the full APCI window and timer
//!   discipline (k/w, t0..t3, STARTDT/STOPDT/TESTFR)
//! - CS104 server redundancy groups with at most one activated peer each
//! - CS101 unbalanced master (polled multi-drop), balanced endpoint and
//!   slave over any byte transport
//! - Typed ASDU codec covering the monitoring, command and system catalog
//!   with CP24Time2a/CP56Time2a tags
//! - Event delivery through a thread-safe sink capability
//!
//! ## Example
//!
//! ```rust,no_run
//! use iec60870::cs104::{Iec104Client, Iec104ClientConfig};
//! use iec60870::command::CommandSpec;
//! use iec60870::common::TypeId;
//! use iec60870::events::ChannelSink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, mut events) = ChannelSink::new();
//!     let config = Iec104ClientConfig::new()
//!         .with_host("192.168.1.100")
//!         .with_port(2404);
//!
//!     let client = Iec104Client::new(config, Arc::new(sink))?;
//!     client.connect().await?;
//!     client.send_start_dt().await?;
//!
//!     // Wait for the activation event, then interrogate the station.
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!         if matches!(
//!             event,
//!             iec60870::events::EngineEvent::Control {
//!                 event: iec60870::events::ControlEvent::Activated,
//!                 ..
//!             }
//!         ) {
//!             client
//!                 .send_commands(vec![CommandSpec::new(
//!                     TypeId::InterrogationCommand,
//!                     0,
//!                     20i64,
//!                 )])
//!                 .await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod asdu;
pub mod command;
pub mod common;
pub mod cs101;
pub mod cs104;
pub mod error;
pub mod events;
pub mod information;
pub mod time;
pub mod transport;

// Re-export the types almost every user touches.
pub use crate::asdu::Asdu;
pub use crate::command::{CommandSpec, CommandValue};
pub use crate::common::{
    ApciParameters, AppLayerParameters, Cause, CauseOfTransmission, LinkLayerParameters, Quality,
    TypeId,
};
pub use crate::error::{Iec60870Error, Iec60870Result};
pub use crate::events::{ChannelSink, ControlEvent, DataPoint, EngineEvent, EventSink};
pub use crate::information::InformationObject;
pub use crate::time::{Cp24Time2a, Cp56Time2a};
