//! Fixed-layout binary codecs for characteristic values
//!
//! All multi-byte integers are little-endian, as GATT requires.
//!
//! # Short float (IEEE-11073 FLOAT)
//!
//! ```text
//! byte 0..3: mantissa, 24-bit two's complement, little-endian
//! byte 3:    exponent, signed 8-bit
//! value = mantissa * 10^exponent
//! ```
//!
//! # Current Time (10 bytes)
//!
//! ```text
//! year:u16 month:u8 day:u8 hour:u8 minute:u8 second:u8
//! day_of_week:u8 (1 = Monday .. 7 = Sunday, 0 = unknown)
//! fractions256:u8 adjust_reason:u8
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{PeripheralError, Result};

/// Encoded size of a short float
pub const FLOAT_LEN: usize = 4;

/// Encoded size of a Current Time value
pub const CURRENT_TIME_LEN: usize = 10;

/// Encoded size of a date-time without day-of-week and fractions
pub const DATE_TIME_LEN: usize = 7;

const MANTISSA_MASK: u32 = 0x00FF_FFFF;
const MANTISSA_NAN: u32 = 0x007F_FFFF;
const MANTISSA_NRES: u32 = 0x0080_0000;
const MANTISSA_POS_INFINITY: u32 = 0x007F_FFFE;
const MANTISSA_NEG_INFINITY: u32 = 0x0080_0002;
const MANTISSA_RESERVED: u32 = 0x0080_0001;

/// Largest finite mantissa
pub const MANTISSA_MAX: i32 = 0x007F_FFFD;
/// Smallest finite mantissa
pub const MANTISSA_MIN: i32 = -MANTISSA_MAX;

/// Current Time adjust reason: no adjustment
pub const ADJUST_NONE: u8 = 0x00;
/// Current Time adjust reason bit: manual time update
pub const ADJUST_MANUAL: u8 = 0x01;
/// Current Time adjust reason bit: external reference time update
pub const ADJUST_EXTERNAL_REFERENCE: u8 = 0x02;
/// Current Time adjust reason bit: change of time zone
pub const ADJUST_TIME_ZONE: u8 = 0x04;
/// Current Time adjust reason bit: change of DST
pub const ADJUST_DST: u8 = 0x08;

fn bit_mask(n: u8) -> u8 {
    1u8.checked_shl(u32::from(n)).unwrap_or(0)
}

/// Set bit `n` of `byte`; `n >= 8` leaves `byte` unchanged
pub fn set_bit(byte: u8, n: u8) -> u8 {
    byte | bit_mask(n)
}

/// Clear bit `n` of `byte`; `n >= 8` leaves `byte` unchanged
pub fn unset_bit(byte: u8, n: u8) -> u8 {
    byte & !bit_mask(n)
}

/// Test bit `n` of a byte sequence, counted from the LSB of byte 0
///
/// Bits beyond the end of `bytes` read as unset.
pub fn test_bit(bytes: &[u8], n: usize) -> bool {
    bytes
        .get(n >> 3)
        .map(|byte| byte & (1 << (n & 7)) != 0)
        .unwrap_or(false)
}

/// Encode a short float from its raw parts
pub fn encode_float_parts(mantissa: i32, exponent: i8) -> [u8; FLOAT_LEN] {
    let m = (mantissa as u32) & MANTISSA_MASK;
    [m as u8, (m >> 8) as u8, (m >> 16) as u8, exponent as u8]
}

/// Encode `value` with `precision` decimal digits
///
/// The mantissa is `value * 10^precision` truncated toward zero, the
/// exponent is `-precision`. NaN encodes as the NaN code; a mantissa
/// outside the finite range saturates to +INF or -INF.
pub fn encode_float(value: f64, precision: i8) -> [u8; FLOAT_LEN] {
    let exponent = precision.wrapping_neg();
    if value.is_nan() {
        return encode_raw_mantissa(MANTISSA_NAN, exponent);
    }

    // Narrow through f32 so representation noise (71.6 * 100 = 7159.999..)
    // does not drop a step on truncation.
    let scaled = f64::from((value * 10f64.powi(i32::from(precision))) as f32).trunc();
    if scaled > f64::from(MANTISSA_MAX) {
        encode_raw_mantissa(MANTISSA_POS_INFINITY, exponent)
    } else if scaled < f64::from(MANTISSA_MIN) {
        encode_raw_mantissa(MANTISSA_NEG_INFINITY, exponent)
    } else {
        encode_float_parts(scaled as i32, exponent)
    }
}

fn encode_raw_mantissa(raw: u32, exponent: i8) -> [u8; FLOAT_LEN] {
    [raw as u8, (raw >> 8) as u8, (raw >> 16) as u8, exponent as u8]
}

/// Decode a short float
///
/// Reserved mantissas decode to NaN or infinity.
pub fn decode_float(bytes: &[u8]) -> Result<f64> {
    if bytes.len() < FLOAT_LEN {
        return Err(PeripheralError::PayloadTooShort {
            needed: FLOAT_LEN,
            got: bytes.len(),
        });
    }

    let raw = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
    match raw {
        MANTISSA_NAN | MANTISSA_NRES | MANTISSA_RESERVED => return Ok(f64::NAN),
        MANTISSA_POS_INFINITY => return Ok(f64::INFINITY),
        MANTISSA_NEG_INFINITY => return Ok(f64::NEG_INFINITY),
        _ => {}
    }

    let mantissa = if raw & 0x0080_0000 != 0 {
        raw as i32 - 0x0100_0000
    } else {
        raw as i32
    };
    let exponent = bytes[3] as i8 as i32;

    // Divide for negative exponents; 10^-n is not exact in binary.
    Ok(if exponent < 0 {
        f64::from(mantissa) / 10f64.powi(-exponent)
    } else {
        f64::from(mantissa) * 10f64.powi(exponent)
    })
}

/// Day of week as GATT numbers it (1 = Monday .. 7 = Sunday)
fn day_of_week(date_time: &NaiveDateTime) -> u8 {
    date_time.weekday().number_from_monday() as u8
}

/// 1/256 fractions of the current second
fn fractions256(date_time: &NaiveDateTime) -> u8 {
    ((u64::from(date_time.nanosecond() % 1_000_000_000) * 256) / 1_000_000_000) as u8
}

/// Encode a Current Time value
pub fn encode_current_time(date_time: &NaiveDateTime, adjust_reason: u8) -> [u8; CURRENT_TIME_LEN] {
    let mut writer = BytesWriter::with_capacity(CURRENT_TIME_LEN);
    writer
        .date_time(date_time)
        .u8(day_of_week(date_time))
        .u8(fractions256(date_time))
        .u8(adjust_reason);

    let mut out = [0u8; CURRENT_TIME_LEN];
    out.copy_from_slice(&writer.into_bytes());
    out
}

/// A decoded Current Time value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTime {
    /// Wall-clock date and time, sub-second part from the fractions byte
    pub date_time: NaiveDateTime,
    /// Day of week as transmitted
    pub day_of_week: u8,
    /// Adjust reason bit field
    pub adjust_reason: u8,
}

/// Decode a Current Time value
pub fn decode_current_time(bytes: &[u8]) -> Result<CurrentTime> {
    let mut reader = BytesReader::new(bytes);
    let date_time = reader.date_time()?;
    let day_of_week = reader.u8()?;
    let fractions = reader.u8()?;
    let adjust_reason = reader.u8()?;

    let nanos = ((u64::from(fractions) * 1_000_000_000) / 256) as u32;
    let date_time = date_time
        .with_nanosecond(nanos)
        .ok_or_else(|| PeripheralError::InvalidPayload(format!("invalid fractions {}", fractions)))?;

    Ok(CurrentTime {
        date_time,
        day_of_week,
        adjust_reason,
    })
}

/// Sequential little-endian writer
#[derive(Debug, Default)]
pub struct BytesWriter {
    buf: BytesMut,
}

impl BytesWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append a uint8
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a uint16
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    /// Append a short float with `precision` decimal digits
    pub fn float(&mut self, value: f64, precision: i8) -> &mut Self {
        self.buf.put_slice(&encode_float(value, precision));
        self
    }

    /// Append a 7-byte date-time (year through second)
    pub fn date_time(&mut self, date_time: &NaiveDateTime) -> &mut Self {
        self.u16(date_time.year() as u16)
            .u8(date_time.month() as u8)
            .u8(date_time.day() as u8)
            .u8(date_time.hour() as u8)
            .u8(date_time.minute() as u8)
            .u8(date_time.second() as u8)
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential little-endian reader
#[derive(Debug)]
pub struct BytesReader<'a> {
    buf: &'a [u8],
}

impl<'a> BytesReader<'a> {
    /// Read from `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { buf: bytes }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(PeripheralError::PayloadTooShort {
                needed: n,
                got: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Read a uint8
    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a uint16
    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Read a short float
    pub fn float(&mut self) -> Result<f64> {
        self.need(FLOAT_LEN)?;
        let value = decode_float(&self.buf[..FLOAT_LEN])?;
        self.buf.advance(FLOAT_LEN);
        Ok(value)
    }

    /// Read a 7-byte date-time
    pub fn date_time(&mut self) -> Result<NaiveDateTime> {
        self.need(DATE_TIME_LEN)?;
        let year = self.u16()?;
        let month = self.u8()?;
        let day = self.u8()?;
        let hour = self.u8()?;
        let minute = self.u8()?;
        let second = self.u8()?;

        NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
            .and_then(|date| date.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second)))
            .ok_or_else(|| {
                PeripheralError::InvalidPayload(format!(
                    "invalid date-time {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                ))
            })
    }
}
