//! Byte-stream transport abstraction for the serial profile.
//!
//! The CS101 roles own their channel through this seam so the same link
//! layer runs over a serial port, a TCP terminal server or an in-memory
//! pipe. The CS104 roles speak TCP natively and do not go through it.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Iec60870Error, Iec60870Result};

/// Result of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed in the buffer
    Data(usize),
    /// Nothing arrived within the timeout
    TimedOut,
    /// The peer closed the channel
    Closed,
}

/// A bidirectional byte stream owned by exactly one link-layer worker.
#[async_trait]
pub trait Transport: Send {
    /// (Re)open the channel. Idempotent when already open.
    async fn open(&mut self) -> Iec60870Result<()>;

    /// Close the channel. Safe to call when already closed.
    async fn close(&mut self);

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Iec60870Result<ReadOutcome>;

    /// Write the whole buffer.
    async fn write_all(&mut self, data: &[u8]) -> Iec60870Result<()>;

    fn is_open(&self) -> bool;

    /// Human-readable peer identifier for logs and events.
    fn peer(&self) -> String;
}

async fn read_stream<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
) -> Iec60870Result<ReadOutcome>
where
    S: AsyncRead + Unpin + Send,
{
    match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(0)) => Ok(ReadOutcome::Closed),
        Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(ReadOutcome::TimedOut),
    }
}

/// Transport over an already-established stream (an accepted socket, an
/// in-memory duplex pipe, an opened serial port). Cannot reopen itself.
pub struct StreamTransport<S> {
    stream: Option<S>,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn open(&mut self) -> Iec60870Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(Iec60870Error::Connection(format!(
                "stream to {} cannot be reopened",
                self.peer
            )))
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Iec60870Result<ReadOutcome> {
        match self.stream.as_mut() {
            Some(stream) => read_stream(stream, buf, timeout).await,
            None => Ok(ReadOutcome::Closed),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Iec60870Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Iec60870Error::NotConnected)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// TCP transport that knows how to (re)connect, for CS101 over a
/// serial-to-ethernet gateway.
pub struct TcpClientTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpClientTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    async fn open(&mut self) -> Iec60870Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let address = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Iec60870Error::Timeout(format!("connect to {address}")))?
            .map_err(|e| Iec60870Error::Connection(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Iec60870Result<ReadOutcome> {
        match self.stream.as_mut() {
            Some(stream) => {
                let outcome = read_stream(stream, buf, timeout).await;
                if matches!(outcome, Ok(ReadOutcome::Closed) | Err(_)) {
                    self.stream = None;
                }
                outcome
            }
            None => Ok(ReadOutcome::Closed),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Iec60870Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Iec60870Error::NotConnected)?;
        stream.write_all(data).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serial-port transport over `tokio-serial`.
#[cfg(feature = "serial")]
pub mod serial {
    use super::*;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};

    pub struct SerialTransport {
        path: String,
        baud_rate: u32,
        stream: Option<SerialStream>,
    }

    impl SerialTransport {
        pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                path: path.into(),
                baud_rate,
                stream: None,
            }
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn open(&mut self) -> Iec60870Result<()> {
            if self.stream.is_some() {
                return Ok(());
            }
            let stream = tokio_serial::new(&self.path, self.baud_rate)
                .open_native_async()
                .map_err(|e| {
                    Iec60870Error::Connection(format!("open serial {}: {e}", self.path))
                })?;
            self.stream = Some(stream);
            Ok(())
        }

        async fn close(&mut self) {
            self.stream = None;
        }

        async fn read(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Iec60870Result<ReadOutcome> {
            match self.stream.as_mut() {
                Some(stream) => read_stream(stream, buf, timeout).await,
                None => Ok(ReadOutcome::Closed),
            }
        }

        async fn write_all(&mut self, data: &[u8]) -> Iec60870Result<()> {
            let stream = self
                .stream
                .as_mut()
                .ok_or(Iec60870Error::NotConnected)?;
            stream.write_all(data).await?;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }

        fn peer(&self) -> String {
            self.path.clone()
        }
    }
}
