//! Constants and data types shared by the CS101 and CS104 profiles.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Iec60870Error, Iec60870Result};

/// Defines a C-like enum together with its byte conversions, so the
/// catalog tables stay in one place instead of three parallel matches.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(u8)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant = $value,
            )*
        }

        impl $name {
            /// Decode from the wire byte.
            pub fn from_byte(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$variant), )*
                    _ => None,
                }
            }

            /// Encode to the wire byte.
            pub fn to_byte(self) -> u8 {
                self as u8
            }
        }
    };
}

wire_enum! {
    /// Cause of Transmission (low six bits of the COT field).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Cause {
        /// Periodic, cyclic
        Periodic = 1,
        /// Background scan
        Background = 2,
        /// Spontaneous
        Spontaneous = 3,
        /// Initialized
        Initialized = 4,
        /// Request or requested
        Request = 5,
        /// Activation
        Activation = 6,
        /// Activation confirmation
        ActivationConfirmation = 7,
        /// Deactivation
        Deactivation = 8,
        /// Deactivation confirmation
        DeactivationConfirmation = 9,
        /// Activation termination
        ActivationTermination = 10,
        /// Return information caused by a remote command
        RemoteCommand = 11,
        /// Return information caused by a local command
        LocalCommand = 12,
        /// File transfer
        FileTransfer = 13,
        /// Interrogated by station interrogation
        InterrogatedByStation = 20,
        /// Interrogated by group 1 interrogation
        InterrogatedByGroup1 = 21,
        InterrogatedByGroup2 = 22,
        InterrogatedByGroup3 = 23,
        InterrogatedByGroup4 = 24,
        InterrogatedByGroup5 = 25,
        InterrogatedByGroup6 = 26,
        InterrogatedByGroup7 = 27,
        InterrogatedByGroup8 = 28,
        InterrogatedByGroup9 = 29,
        InterrogatedByGroup10 = 30,
        InterrogatedByGroup11 = 31,
        InterrogatedByGroup12 = 32,
        InterrogatedByGroup13 = 33,
        InterrogatedByGroup14 = 34,
        InterrogatedByGroup15 = 35,
        InterrogatedByGroup16 = 36,
        /// Requested by general counter request
        RequestedByCounterRequest = 37,
        RequestedByCounterGroup1 = 38,
        RequestedByCounterGroup2 = 39,
        RequestedByCounterGroup3 = 40,
        RequestedByCounterGroup4 = 41,
        /// Unknown type identification
        UnknownTypeId = 44,
        /// Unknown cause of transmission
        UnknownCause = 45,
        /// Unknown common address of ASDU
        UnknownCommonAddress = 46,
        /// Unknown information object address
        UnknownObjectAddress = 47,
    }
}

/// Full cause-of-transmission field: cause plus the P/N and test bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseOfTransmission {
    pub cause: Cause,
    /// P/N bit: set for a negative confirmation
    pub negative: bool,
    /// T bit: set when the ASDU was generated under test conditions
    pub test: bool,
}

impl CauseOfTransmission {
    pub fn new(cause: Cause) -> Self {
        Self {
            cause,
            negative: false,
            test: false,
        }
    }

    pub fn negative(cause: Cause) -> Self {
        Self {
            cause,
            negative: true,
            test: false,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        Cause::from_byte(value & 0x3F).map(|cause| Self {
            cause,
            negative: (value & 0x40) != 0,
            test: (value & 0x80) != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut value = self.cause.to_byte();
        if self.negative {
            value |= 0x40;
        }
        if self.test {
            value |= 0x80;
        }
        value
    }
}

impl From<Cause> for CauseOfTransmission {
    fn from(cause: Cause) -> Self {
        Self::new(cause)
    }
}

impl fmt::Display for CauseOfTransmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.cause)?;
        if self.negative {
            write!(f, "/neg")?;
        }
        if self.test {
            write!(f, "/test")?;
        }
        Ok(())
    }
}

wire_enum! {
    /// Type identification of an ASDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum TypeId {
        /// Single-point information (M_SP_NA_1)
        SinglePoint = 1,
        /// Single-point information with CP24Time2a (M_SP_TA_1)
        SinglePointWithCp24 = 2,
        /// Double-point information (M_DP_NA_1)
        DoublePoint = 3,
        /// Double-point information with CP24Time2a (M_DP_TA_1)
        DoublePointWithCp24 = 4,
        /// Step position information (M_ST_NA_1)
        StepPosition = 5,
        /// Step position information with CP24Time2a (M_ST_TA_1)
        StepPositionWithCp24 = 6,
        /// Bitstring of 32 bits (M_BO_NA_1)
        Bitstring32 = 7,
        /// Bitstring of 32 bits with CP24Time2a (M_BO_TA_1)
        Bitstring32WithCp24 = 8,
        /// Measured value, normalized (M_ME_NA_1)
        MeasuredNormalized = 9,
        /// Measured value, normalized, with CP24Time2a (M_ME_TA_1)
        MeasuredNormalizedWithCp24 = 10,
        /// Measured value, scaled (M_ME_NB_1)
        MeasuredScaled = 11,
        /// Measured value, scaled, with CP24Time2a (M_ME_TB_1)
        MeasuredScaledWithCp24 = 12,
        /// Measured value, short float (M_ME_NC_1)
        MeasuredShort = 13,
        /// Measured value, short float, with CP24Time2a (M_ME_TC_1)
        MeasuredShortWithCp24 = 14,
        /// Integrated totals (M_IT_NA_1)
        IntegratedTotals = 15,
        /// Integrated totals with CP24Time2a (M_IT_TA_1)
        IntegratedTotalsWithCp24 = 16,
        /// Measured value, normalized, without quality (M_ME_ND_1)
        MeasuredNormalizedNoQuality = 21,
        /// Single-point information with CP56Time2a (M_SP_TB_1)
        SinglePointWithCp56 = 30,
        /// Double-point information with CP56Time2a (M_DP_TB_1)
        DoublePointWithCp56 = 31,
        /// Step position information with CP56Time2a (M_ST_TB_1)
        StepPositionWithCp56 = 32,
        /// Bitstring of 32 bits with CP56Time2a (M_BO_TB_1)
        Bitstring32WithCp56 = 33,
        /// Measured value, normalized, with CP56Time2a (M_ME_TD_1)
        MeasuredNormalizedWithCp56 = 34,
        /// Measured value, scaled, with CP56Time2a (M_ME_TE_1)
        MeasuredScaledWithCp56 = 35,
        /// Measured value, short float, with CP56Time2a (M_ME_TF_1)
        MeasuredShortWithCp56 = 36,
        /// Integrated totals with CP56Time2a (M_IT_TB_1)
        IntegratedTotalsWithCp56 = 37,
        /// Single command (C_SC_NA_1)
        SingleCommand = 45,
        /// Double command (C_DC_NA_1)
        DoubleCommand = 46,
        /// Regulating step command (C_RC_NA_1)
        StepCommand = 47,
        /// Set-point command, normalized (C_SE_NA_1)
        SetpointNormalized = 48,
        /// Set-point command, scaled (C_SE_NB_1)
        SetpointScaled = 49,
        /// Set-point command, short float (C_SE_NC_1)
        SetpointShort = 50,
        /// Bitstring command (C_BO_NA_1)
        Bitstring32Command = 51,
        /// Single command with CP56Time2a (C_SC_TA_1)
        SingleCommandWithCp56 = 58,
        /// Double command with CP56Time2a (C_DC_TA_1)
        DoubleCommandWithCp56 = 59,
        /// Regulating step command with CP56Time2a (C_RC_TA_1)
        StepCommandWithCp56 = 60,
        /// Set-point command, normalized, with CP56Time2a (C_SE_TA_1)
        SetpointNormalizedWithCp56 = 61,
        /// Set-point command, scaled, with CP56Time2a (C_SE_TB_1)
        SetpointScaledWithCp56 = 62,
        /// Set-point command, short float, with CP56Time2a (C_SE_TC_1)
        SetpointShortWithCp56 = 63,
        /// Bitstring command with CP56Time2a (C_BO_TA_1)
        Bitstring32CommandWithCp56 = 64,
        /// Interrogation command (C_IC_NA_1)
        InterrogationCommand = 100,
        /// Counter interrogation command (C_CI_NA_1)
        CounterInterrogationCommand = 101,
        /// Read command (C_RD_NA_1)
        ReadCommand = 102,
        /// Clock synchronization command (C_CS_NA_1)
        ClockSyncCommand = 103,
        /// Test command (C_TS_NA_1)
        TestCommand = 104,
    }
}

impl TypeId {
    /// True for the control-direction command family (45..=64).
    pub fn is_command(self) -> bool {
        let v = self as u8;
        (45..=64).contains(&v)
    }

    /// True for the system command family (100..=104).
    pub fn is_system(self) -> bool {
        let v = self as u8;
        (100..=104).contains(&v)
    }

    /// True for the monitoring direction (process information).
    pub fn is_monitoring(self) -> bool {
        let v = self as u8;
        (1..=37).contains(&v)
    }

    /// True when the element layout ends in a CP56Time2a tag.
    pub fn has_cp56(self) -> bool {
        let v = self as u8;
        (30..=37).contains(&v) || (58..=64).contains(&v)
    }

    /// True when the element layout ends in a CP24Time2a tag.
    pub fn has_cp24(self) -> bool {
        matches!(self as u8, 2 | 4 | 6 | 8 | 10 | 12 | 14 | 16)
    }
}

/// Quality descriptor bits carried by most monitoring types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quality {
    /// Overflow (QDS only)
    pub overflow: bool,
    /// Blocked for transmission
    pub blocked: bool,
    /// Substituted by an operator
    pub substituted: bool,
    /// Not topical (stale)
    pub not_topical: bool,
    /// Invalid
    pub invalid: bool,
}

impl Quality {
    pub const GOOD: Quality = Quality {
        overflow: false,
        blocked: false,
        substituted: false,
        not_topical: false,
        invalid: false,
    };

    pub fn from_byte(value: u8) -> Self {
        Self {
            overflow: (value & 0x01) != 0,
            blocked: (value & 0x10) != 0,
            substituted: (value & 0x20) != 0,
            not_topical: (value & 0x40) != 0,
            invalid: (value & 0x80) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut value = 0u8;
        if self.overflow {
            value |= 0x01;
        }
        if self.blocked {
            value |= 0x10;
        }
        if self.substituted {
            value |= 0x20;
        }
        if self.not_topical {
            value |= 0x40;
        }
        if self.invalid {
            value |= 0x80;
        }
        value
    }
}

/// Application-layer field widths and limits.
///
/// Fixed at engine construction. The defaults are the CS104 companion
/// standard values (COT 2, CA 2, IOA 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLayerParameters {
    /// Size of the type identification field (always 1)
    pub size_of_type_id: u8,
    /// Size of the variable structure qualifier (always 1)
    pub size_of_vsq: u8,
    /// Size of the cause-of-transmission field (1 or 2; 2 adds originator)
    pub size_of_cot: u8,
    /// Size of the common address (1 or 2)
    pub size_of_ca: u8,
    /// Size of the information object address (1, 2 or 3)
    pub size_of_ioa: u8,
    /// Originator address placed in the second COT octet
    pub originator_address: u8,
    /// Maximum encoded ASDU size in bytes
    pub max_asdu_size: u8,
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self {
            size_of_type_id: 1,
            size_of_vsq: 1,
            size_of_cot: 2,
            size_of_ca: 2,
            size_of_ioa: 3,
            originator_address: 0,
            max_asdu_size: 249,
        }
    }
}

impl AppLayerParameters {
    /// Validate the field widths against the companion standard limits.
    pub fn validate(&self) -> Iec60870Result<()> {
        if self.size_of_type_id != 1 || self.size_of_vsq != 1 {
            return Err(Iec60870Error::Config(
                "size_of_type_id and size_of_vsq must be 1".to_string(),
            ));
        }
        if !(1..=2).contains(&self.size_of_cot) {
            return Err(Iec60870Error::Config(format!(
                "size_of_cot must be 1 or 2, got {}",
                self.size_of_cot
            )));
        }
        if !(1..=2).contains(&self.size_of_ca) {
            return Err(Iec60870Error::Config(format!(
                "size_of_ca must be 1 or 2, got {}",
                self.size_of_ca
            )));
        }
        if !(1..=3).contains(&self.size_of_ioa) {
            return Err(Iec60870Error::Config(format!(
                "size_of_ioa must be 1, 2 or 3, got {}",
                self.size_of_ioa
            )));
        }
        if self.max_asdu_size > 249 {
            return Err(Iec60870Error::Config(format!(
                "max_asdu_size must be <= 249, got {}",
                self.max_asdu_size
            )));
        }
        Ok(())
    }

    /// Bytes occupied by the ASDU header with these widths.
    pub fn header_size(&self) -> usize {
        (self.size_of_type_id + self.size_of_vsq + self.size_of_cot + self.size_of_ca) as usize
    }
}

/// CS104 APCI window and timer parameters (k/w, t0..t3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApciParameters {
    /// Maximum number of unacknowledged outgoing I-frames
    pub k: u16,
    /// Latest acknowledgement after receiving w I-frames
    pub w: u16,
    /// Connection establishment timeout, seconds
    pub t0: u16,
    /// Acknowledgement timeout for sent I/U frames, seconds
    pub t1: u16,
    /// Supervisory acknowledgement interval, seconds
    pub t2: u16,
    /// Idle test-frame period, seconds
    pub t3: u16,
}

impl Default for ApciParameters {
    fn default() -> Self {
        Self {
            k: 12,
            w: 8,
            t0: 30,
            t1: 15,
            t2: 10,
            t3: 20,
        }
    }
}

impl ApciParameters {
    pub fn validate(&self) -> Iec60870Result<()> {
        if self.k == 0 || self.k > 32767 {
            return Err(Iec60870Error::Config(format!(
                "k must be in 1..=32767, got {}",
                self.k
            )));
        }
        if self.w == 0 || self.w > self.k {
            return Err(Iec60870Error::Config(format!(
                "w must be in 1..=k ({}), got {}",
                self.k, self.w
            )));
        }
        if self.t0 == 0 || self.t1 == 0 || self.t2 == 0 || self.t3 == 0 {
            return Err(Iec60870Error::Config(
                "timer parameters t0..t3 must be positive".to_string(),
            ));
        }
        if self.t2 >= self.t1 {
            return Err(Iec60870Error::Config(format!(
                "t2 ({}) must be less than t1 ({})",
                self.t2, self.t1
            )));
        }
        Ok(())
    }
}

/// CS101 FT 1.2 link-layer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLayerParameters {
    /// Link address field width in bytes (0, 1 or 2)
    pub address_length: u8,
    /// Timeout waiting for an acknowledgement to a confirmed request, ms
    pub timeout_for_ack_ms: u64,
    /// Delay before a retransmission, ms
    pub timeout_repeat_ms: u64,
    /// Timeout bounding the link-status negotiation, ms
    pub timeout_link_state_ms: u64,
    /// Retransmissions before the link is declared failed
    pub max_retries: u8,
    /// Accept/emit the single character 0xE5 in place of a short ACK frame
    pub use_single_char_ack: bool,
}

impl Default for LinkLayerParameters {
    fn default() -> Self {
        Self {
            address_length: 1,
            timeout_for_ack_ms: 1000,
            timeout_repeat_ms: 2000,
            timeout_link_state_ms: 5000,
            max_retries: 3,
            use_single_char_ack: true,
        }
    }
}

impl LinkLayerParameters {
    pub fn validate(&self) -> Iec60870Result<()> {
        if self.address_length > 2 {
            return Err(Iec60870Error::Config(format!(
                "address_length must be 0, 1 or 2, got {}",
                self.address_length
            )));
        }
        if self.timeout_for_ack_ms == 0 || self.timeout_link_state_ms == 0 {
            return Err(Iec60870Error::Config(
                "link layer timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cot_round_trip_preserves_flags() {
        let cot = CauseOfTransmission {
            cause: Cause::Activation,
            negative: true,
            test: true,
        };
        let byte = cot.to_byte();
        assert_eq!(byte, 6 | 0x40 | 0x80);
        assert_eq!(CauseOfTransmission::from_byte(byte), Some(cot));
    }

    #[test]
    fn cot_rejects_unknown_cause() {
        assert_eq!(CauseOfTransmission::from_byte(0), None);
        assert_eq!(CauseOfTransmission::from_byte(63), None);
    }

    #[test]
    fn type_id_classification() {
        assert!(TypeId::SingleCommand.is_command());
        assert!(TypeId::Bitstring32CommandWithCp56.is_command());
        assert!(!TypeId::SinglePoint.is_command());
        assert!(TypeId::InterrogationCommand.is_system());
        assert!(TypeId::MeasuredShortWithCp56.is_monitoring());
        assert!(TypeId::MeasuredShortWithCp56.has_cp56());
        assert!(TypeId::MeasuredScaledWithCp24.has_cp24());
        assert!(!TypeId::MeasuredScaled.has_cp24());
    }

    #[test]
    fn quality_round_trip() {
        for byte in [0x00u8, 0x01, 0x10, 0x20, 0x40, 0x80, 0xF1] {
            assert_eq!(Quality::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn apci_parameters_validation() {
        assert!(ApciParameters::default().validate().is_ok());

        let bad_w = ApciParameters {
            w: 13,
            ..Default::default()
        };
        assert!(bad_w.validate().is_err());

        let bad_t2 = ApciParameters {
            t1: 5,
            t2: 10,
            ..Default::default()
        };
        assert!(bad_t2.validate().is_err());
    }

    #[test]
    fn app_layer_parameters_validation() {
        assert!(AppLayerParameters::default().validate().is_ok());
        let bad = AppLayerParameters {
            size_of_ioa: 4,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert_eq!(AppLayerParameters::default().header_size(), 6);
    }
}
