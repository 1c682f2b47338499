//! CP56Time2a and CP24Time2a binary time tags.
//!
//! Timestamps travel through the public API as milliseconds since the Unix
//! epoch. No zone conversion is applied anywhere in the engine: the caller
//! decides whether those milliseconds are UTC or station-local wall time,
//! which matches how the protocol itself treats the seven-octet tag.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::io::Cursor;

use crate::error::{Iec60870Error, Iec60870Result};

/// Seven-octet binary time: millisecond-of-minute, minute, hour,
/// day-of-month + day-of-week, month, two-digit year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp56Time2a {
    /// Milliseconds within the minute, 0..=59999
    pub millisecond: u16,
    /// Minute, 0..=59
    pub minute: u8,
    /// Hour, 0..=23
    pub hour: u8,
    /// Day of month, 1..=31
    pub day_of_month: u8,
    /// Day of week, 1 (Monday) ..= 7 (Sunday); 0 when not used
    pub day_of_week: u8,
    /// Month, 1..=12
    pub month: u8,
    /// Two-digit year, 0..=99 (< 70 means 20xx, otherwise 19xx)
    pub year: u8,
    /// IV flag: the time tag is invalid
    pub invalid: bool,
    /// SU flag: summer time
    pub summer_time: bool,
}

pub const CP56_SIZE: usize = 7;
pub const CP24_SIZE: usize = 3;

impl Cp56Time2a {
    /// Build a time tag from milliseconds since the Unix epoch.
    pub fn from_millis(ms: u64) -> Iec60870Result<Self> {
        let dt = DateTime::from_timestamp_millis(ms as i64)
            .ok_or_else(|| Iec60870Error::Config(format!("timestamp {ms} not representable")))?
            .naive_utc();
        Self::from_naive(dt)
    }

    /// Build a time tag from a broken-down date and time.
    pub fn from_naive(dt: NaiveDateTime) -> Iec60870Result<Self> {
        let year = dt.year();
        if !(1970..=2069).contains(&year) {
            return Err(Iec60870Error::Config(format!(
                "year {year} outside the CP56Time2a range 1970..=2069"
            )));
        }
        Ok(Self {
            millisecond: (dt.second() * 1000 + dt.nanosecond() / 1_000_000) as u16,
            minute: dt.minute() as u8,
            hour: dt.hour() as u8,
            day_of_month: dt.day() as u8,
            day_of_week: dt.weekday().number_from_monday() as u8,
            month: dt.month() as u8,
            year: (year % 100) as u8,
            invalid: false,
            summer_time: false,
        })
    }

    /// Full four-digit year (two-digit years below 70 are 20xx).
    pub fn full_year(&self) -> i32 {
        if self.year < 70 {
            2000 + self.year as i32
        } else {
            1900 + self.year as i32
        }
    }

    /// Broken-down date and time, if the fields form a valid date.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.full_year(), self.month as u32, self.day_of_month as u32)?
            .and_hms_milli_opt(
                self.hour as u32,
                self.minute as u32,
                (self.millisecond / 1000) as u32,
                (self.millisecond % 1000) as u32,
            )
    }

    /// Milliseconds since the Unix epoch, if the fields form a valid date.
    pub fn to_millis(&self) -> Option<u64> {
        let dt = self.to_naive()?;
        let ms = dt.and_utc().timestamp_millis();
        (ms >= 0).then_some(ms as u64)
    }

    /// Encode into the seven-octet wire layout.
    pub fn encode(&self) -> [u8; CP56_SIZE] {
        let mut out = [0u8; CP56_SIZE];
        out[0] = (self.millisecond & 0xFF) as u8;
        out[1] = (self.millisecond >> 8) as u8;
        out[2] = (self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 };
        out[3] = (self.hour & 0x1F) | if self.summer_time { 0x80 } else { 0 };
        out[4] = (self.day_of_month & 0x1F) | ((self.day_of_week & 0x07) << 5);
        out[5] = self.month & 0x0F;
        out[6] = self.year & 0x7F;
        out
    }

    /// Decode from the seven-octet wire layout.
    pub fn decode(data: &[u8]) -> Iec60870Result<Self> {
        if data.len() < CP56_SIZE {
            return Err(Iec60870Error::Frame(format!(
                "CP56Time2a needs {CP56_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let millisecond = cursor.read_u16::<LittleEndian>()?;
        let minute_byte = cursor.read_u8()?;
        let hour_byte = cursor.read_u8()?;
        let day_byte = cursor.read_u8()?;
        let month = cursor.read_u8()? & 0x0F;
        let year = cursor.read_u8()? & 0x7F;
        Ok(Self {
            millisecond,
            minute: minute_byte & 0x3F,
            hour: hour_byte & 0x1F,
            day_of_month: day_byte & 0x1F,
            day_of_week: (day_byte >> 5) & 0x07,
            month,
            year,
            invalid: (minute_byte & 0x80) != 0,
            summer_time: (hour_byte & 0x80) != 0,
        })
    }

    pub fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.encode());
    }
}

/// Three-octet binary time: millisecond-of-minute and minute only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp24Time2a {
    /// Milliseconds within the minute, 0..=59999
    pub millisecond: u16,
    /// Minute, 0..=59
    pub minute: u8,
    /// IV flag
    pub invalid: bool,
}

impl Cp24Time2a {
    /// Keep only the minute-relative part of an epoch-millisecond value.
    pub fn from_millis(ms: u64) -> Self {
        let within_hour = ms % 3_600_000;
        Self {
            millisecond: (within_hour % 60_000) as u16,
            minute: (within_hour / 60_000) as u8,
            invalid: false,
        }
    }

    pub fn encode(&self) -> [u8; CP24_SIZE] {
        [
            (self.millisecond & 0xFF) as u8,
            (self.millisecond >> 8) as u8,
            (self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 },
        ]
    }

    pub fn decode(data: &[u8]) -> Iec60870Result<Self> {
        if data.len() < CP24_SIZE {
            return Err(Iec60870Error::Frame(format!(
                "CP24Time2a needs {CP24_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let millisecond = cursor.read_u16::<LittleEndian>()?;
        let minute_byte = cursor.read_u8()?;
        Ok(Self {
            millisecond,
            minute: minute_byte & 0x3F,
            invalid: (minute_byte & 0x80) != 0,
        })
    }

    pub fn write_to(&self, buffer: &mut Vec<u8>) {
        let _ = buffer.write_u16::<LittleEndian>(self.millisecond);
        buffer.push((self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 });
    }

    /// Minute-relative milliseconds; a CP24 tag carries no date.
    pub fn to_millis_of_hour(&self) -> u64 {
        self.minute as u64 * 60_000 + self.millisecond as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cp56_encodes_known_instant() {
        // 2024-01-15 12:34:56.789, a Monday.
        let dt = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_milli_opt(12, 34, 56, 789)
            .unwrap();
        let tag = Cp56Time2a::from_naive(dt).unwrap();
        assert_eq!(tag.encode(), [0xD5, 0xDD, 0x22, 0x0C, 0x2F, 0x01, 0x18]);
        assert_eq!(tag.day_of_week, 1);
        assert_eq!(tag.full_year(), 2024);
    }

    #[test]
    fn cp56_round_trip_preserves_all_fields() {
        let mut tag = Cp56Time2a::from_millis(1_705_321_496_789).unwrap();
        tag.invalid = true;
        tag.summer_time = true;
        let decoded = Cp56Time2a::decode(&tag.encode()).unwrap();
        assert_eq!(decoded, tag);
        assert!(decoded.invalid);
        assert!(decoded.summer_time);
    }

    #[test]
    fn cp56_millis_round_trip() {
        for ms in [0u64, 1_000, 86_400_000, 1_705_321_496_789, 3_123_456_789_012] {
            let tag = Cp56Time2a::from_millis(ms).unwrap();
            assert_eq!(tag.to_millis(), Some(ms));
        }
    }

    #[test]
    fn cp56_century_window() {
        let epoch = Cp56Time2a::from_millis(0).unwrap();
        assert_eq!(epoch.year, 70);
        assert_eq!(epoch.full_year(), 1970);

        let y2024 = Cp56Time2a::from_millis(1_705_321_496_789).unwrap();
        assert_eq!(y2024.year, 24);
        assert_eq!(y2024.full_year(), 2024);
    }

    #[test]
    fn cp56_rejects_out_of_range_year() {
        let dt = NaiveDate::from_ymd_opt(2070, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(Cp56Time2a::from_naive(dt).is_err());
    }

    #[test]
    fn cp56_decode_needs_seven_bytes() {
        assert!(Cp56Time2a::decode(&[0; 6]).is_err());
    }

    #[test]
    fn cp24_round_trip() {
        let tag = Cp24Time2a {
            millisecond: 56_789,
            minute: 34,
            invalid: true,
        };
        assert_eq!(Cp24Time2a::decode(&tag.encode()).unwrap(), tag);
        assert_eq!(tag.to_millis_of_hour(), 34 * 60_000 + 56_789);
    }
}
