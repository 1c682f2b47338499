//! Error taxonomy shared by both protocol profiles.

use thiserror::Error;

/// Errors surfaced by the IEC 60870-5 engine.
///
/// Only configuration mistakes and caller invariant violations are returned
/// synchronously from the public API. Transient transport and protocol
/// faults are absorbed by the connection workers and reported through the
/// [`EventSink`](crate::events::EventSink).
#[derive(Error, Debug)]
pub enum Iec60870Error {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error in connection establishment or use
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded wait elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer violated the protocol rules
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame failed to parse (checksum, framing, length)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Command value outside the range representable for its type
    #[error("Value out of range for {type_id:?}: {detail}")]
    ValueOutOfRange {
        type_id: crate::common::TypeId,
        detail: String,
    },

    /// The bounded outbound queue is full
    #[error("Outbound queue full")]
    QueueFull,

    /// Operation requires an open connection
    #[error("Not connected")]
    NotConnected,

    /// Operation requires a confirmed STARTDT (or software activation)
    #[error("Data transfer not activated")]
    NotActivated,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Iec60870Result<T> = Result<T, Iec60870Error>;
