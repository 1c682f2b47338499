//! IEC 60870-5-104: the TCP/IP profile.

pub mod apci;
pub mod client;
pub mod connection;
pub mod server;

pub use apci::{Apci, Apdu, UFrame};
pub use client::{ClientStatus, Iec104Client, Iec104ClientConfig};
pub use connection::ApciEngine;
pub use server::{
    ConnectionStatus, Iec104Server, Iec104ServerConfig, RedundancyGroupConfig, ServerMode,
    ServerStatus,
};
