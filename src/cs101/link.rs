//! Link-layer control fields and the half-duplex channel shared by the
//! CS101 roles.

use std::time::{Duration, Instant};

use crate::common::LinkLayerParameters;
use crate::cs101::frame::{FrameReader, Ft12Frame};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::transport::{ReadOutcome, Transport};

/// Function codes sent by the primary (initiating) station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimaryFunction {
    /// Reset of remote link
    ResetRemoteLink = 0,
    /// Test function for link
    TestFunction = 2,
    /// User data, confirm expected
    UserDataConfirmed = 3,
    /// User data, no confirm
    UserDataUnconfirmed = 4,
    /// Request status of link
    RequestLinkStatus = 9,
    /// Request user data class 1
    RequestClass1 = 10,
    /// Request user data class 2
    RequestClass2 = 11,
}

impl PrimaryFunction {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ResetRemoteLink),
            2 => Some(Self::TestFunction),
            3 => Some(Self::UserDataConfirmed),
            4 => Some(Self::UserDataUnconfirmed),
            9 => Some(Self::RequestLinkStatus),
            10 => Some(Self::RequestClass1),
            11 => Some(Self::RequestClass2),
            _ => None,
        }
    }
}

/// Function codes sent by the secondary (responding) station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecondaryFunction {
    /// Positive acknowledgement
    Ack = 0,
    /// Negative acknowledgement
    Nack = 1,
    /// Requested user data
    UserData = 8,
    /// No user data available
    NackNoData = 9,
    /// Status of link or access demand
    StatusOfLink = 11,
    /// Link service not functioning / not implemented
    NotFunctioning = 14,
}

impl SecondaryFunction {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ack),
            1 => Some(Self::Nack),
            8 => Some(Self::UserData),
            9 => Some(Self::NackNoData),
            11 => Some(Self::StatusOfLink),
            14 => Some(Self::NotFunctioning),
            _ => None,
        }
    }
}

/// Decoded link control octet.
///
/// Bit 6 (PRM) decides whether `fcb_acd`/`fcv_dfc` mean FCB/FCV (primary
/// to secondary) or ACD/DFC (secondary to primary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkControl {
    /// DIR bit, used by the balanced mode
    pub dir: bool,
    /// PRM bit: message from a primary station
    pub prm: bool,
    /// FCB (primary) or ACD (secondary)
    pub fcb_acd: bool,
    /// FCV (primary) or DFC (secondary)
    pub fcv_dfc: bool,
    /// Function code, 0..=15
    pub function: u8,
}

impl LinkControl {
    pub fn primary(function: PrimaryFunction, fcb: bool, fcv: bool) -> Self {
        Self {
            dir: false,
            prm: true,
            fcb_acd: fcb,
            fcv_dfc: fcv,
            function: function as u8,
        }
    }

    pub fn secondary(function: SecondaryFunction, acd: bool, dfc: bool) -> Self {
        Self {
            dir: false,
            prm: false,
            fcb_acd: acd,
            fcv_dfc: dfc,
            function: function as u8,
        }
    }

    pub fn with_dir(mut self, dir: bool) -> Self {
        self.dir = dir;
        self
    }

    pub fn from_byte(value: u8) -> Self {
        Self {
            dir: (value & 0x80) != 0,
            prm: (value & 0x40) != 0,
            fcb_acd: (value & 0x20) != 0,
            fcv_dfc: (value & 0x10) != 0,
            function: value & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut value = self.function & 0x0F;
        if self.fcv_dfc {
            value |= 0x10;
        }
        if self.fcb_acd {
            value |= 0x20;
        }
        if self.prm {
            value |= 0x40;
        }
        if self.dir {
            value |= 0x80;
        }
        value
    }

    pub fn primary_function(self) -> Option<PrimaryFunction> {
        self.prm.then(|| PrimaryFunction::from_byte(self.function)).flatten()
    }

    pub fn secondary_function(self) -> Option<SecondaryFunction> {
        (!self.prm)
            .then(|| SecondaryFunction::from_byte(self.function))
            .flatten()
    }
}

/// Half-duplex FT 1.2 channel over an owned transport.
pub struct LinkChannel {
    transport: Box<dyn Transport>,
    reader: FrameReader,
    params: LinkLayerParameters,
}

impl LinkChannel {
    pub fn new(transport: Box<dyn Transport>, params: LinkLayerParameters) -> Self {
        Self {
            transport,
            reader: FrameReader::new(),
            params,
        }
    }

    pub fn params(&self) -> &LinkLayerParameters {
        &self.params
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub async fn open(&mut self) -> Iec60870Result<()> {
        self.transport.open().await
    }

    pub async fn close(&mut self) {
        self.reader.clear();
        self.transport.close().await;
    }

    pub async fn send(&mut self, frame: &Ft12Frame) -> Iec60870Result<()> {
        let bytes = frame.encode(&self.params);
        tracing::trace!(?frame, "link tx");
        self.transport.write_all(&bytes).await
    }

    /// Wait up to `timeout` for the next complete frame. `Ok(None)` means
    /// the deadline passed quietly; a closed transport is an error.
    pub async fn recv(&mut self, timeout: Duration) -> Iec60870Result<Option<Ft12Frame>> {
        if let Some(frame) = self.reader.next(&self.params) {
            return Ok(Some(frame));
        }
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.read(&mut buf, remaining).await? {
                ReadOutcome::Data(n) => {
                    self.reader.push(&buf[..n]);
                    if let Some(frame) = self.reader.next(&self.params) {
                        tracing::trace!(?frame, "link rx");
                        return Ok(Some(frame));
                    }
                }
                ReadOutcome::TimedOut => return Ok(None),
                ReadOutcome::Closed => {
                    return Err(Iec60870Error::Connection(
                        "link transport closed".to_string(),
                    ))
                }
            }
        }
    }

    /// One confirmed exchange: send, then wait for the reply.
    pub async fn request(
        &mut self,
        frame: &Ft12Frame,
        timeout: Duration,
    ) -> Iec60870Result<Option<Ft12Frame>> {
        self.send(frame).await?;
        self.recv(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_byte_round_trip() {
        for byte in 0x00..=0xFFu8 {
            assert_eq!(LinkControl::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn primary_request_class2_layout() {
        // PRM + FCB + FCV + function 11 -> 0x7B
        let control = LinkControl::primary(PrimaryFunction::RequestClass2, true, true);
        assert_eq!(control.to_byte(), 0x7B);
        assert_eq!(
            control.primary_function(),
            Some(PrimaryFunction::RequestClass2)
        );
        assert_eq!(control.secondary_function(), None);
    }

    #[test]
    fn secondary_status_of_link_is_0x0b() {
        let control = LinkControl::secondary(SecondaryFunction::StatusOfLink, false, false);
        assert_eq!(control.to_byte(), 0x0B);
    }

    #[test]
    fn acd_bit_signals_class1_demand() {
        let control = LinkControl::secondary(SecondaryFunction::UserData, true, false);
        let decoded = LinkControl::from_byte(control.to_byte());
        assert!(decoded.fcb_acd);
        assert_eq!(decoded.secondary_function(), Some(SecondaryFunction::UserData));
    }

    #[tokio::test]
    async fn channel_exchange_over_duplex_pipe() {
        use crate::transport::StreamTransport;
        let (a, b) = tokio::io::duplex(1024);
        let params = LinkLayerParameters::default();
        let mut left = LinkChannel::new(Box::new(StreamTransport::new(a, "left")), params);
        let mut right = LinkChannel::new(Box::new(StreamTransport::new(b, "right")), params);

        let poll = Ft12Frame::fixed(
            LinkControl::primary(PrimaryFunction::RequestClass2, false, true).to_byte(),
            3,
        );
        left.send(&poll).await.unwrap();
        let seen = right.recv(Duration::from_millis(200)).await.unwrap();
        assert_eq!(seen, Some(poll));

        right.send(&Ft12Frame::SingleChar).await.unwrap();
        let ack = left.recv(Duration::from_millis(200)).await.unwrap();
        assert_eq!(ack, Some(Ft12Frame::SingleChar));
    }
}
