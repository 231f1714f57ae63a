//! Temporal decode targets and the binary temporal encodings.
//!
//! Binary rows length-prefix temporal cells; the payload length picks the
//! precision: DATE is 0 or 4 bytes, TIME 0/8/12, DATETIME 0/4/7/11.

#![allow(clippy::cast_possible_truncation)]

use std::time::Duration;

use marlin_core::{Date, DateTime, Error, Result, Time};

use crate::codec::{unsupported, DataType, Decodable};
use crate::message::server::ColumnDefinition;
use crate::protocol::PacketWriter;

fn utf8<'a>(raw: &'a [u8], target: &'static str) -> Result<&'a str> {
    std::str::from_utf8(raw).map_err(|_| Error::bad_value(String::from_utf8_lossy(raw), target))
}

fn is_string(t: DataType) -> bool {
    matches!(t, DataType::VarChar | DataType::VarString | DataType::Text)
}

fn decode_binary_date(raw: &[u8], target: &'static str) -> Result<Date> {
    match raw.len() {
        0 => Ok(Date::zero()),
        n if n >= 4 => Ok(Date::new(
            u16::from_le_bytes([raw[0], raw[1]]),
            raw[2],
            raw[3],
        )),
        n => Err(Error::bad_value(format!("<{n} bytes>"), target)),
    }
}

fn decode_binary_datetime(raw: &[u8], target: &'static str) -> Result<DateTime> {
    let date = decode_binary_date(raw, target)?;
    let (hour, minute, second) = if raw.len() >= 7 {
        (raw[4], raw[5], raw[6])
    } else {
        (0, 0, 0)
    };
    let micros = if raw.len() >= 11 {
        u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]])
    } else {
        0
    };
    Ok(DateTime::new(date, hour, minute, second, micros))
}

fn decode_binary_time(raw: &[u8], target: &'static str) -> Result<Time> {
    match raw.len() {
        0 => Ok(Time::new(false, 0, 0, 0, 0)),
        n if n >= 8 => {
            let negative = raw[0] != 0;
            let days = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
            let hours = days * 24 + u32::from(raw[5]);
            let micros = if n >= 12 {
                u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]])
            } else {
                0
            };
            Ok(Time::new(negative, hours, raw[6], raw[7], micros))
        }
        n => Err(Error::bad_value(format!("<{n} bytes>"), target)),
    }
}

impl Decodable for Date {
    const TARGET: &'static str = "Date";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Date | DataType::NewDate => utf8(raw, Self::TARGET)?.parse(),
            DataType::DateTime | DataType::Timestamp => {
                let dt: DateTime = utf8(raw, Self::TARGET)?.parse()?;
                Ok(dt.date)
            }
            DataType::Year => {
                let year = utf8(raw, Self::TARGET)?
                    .parse::<u16>()
                    .map_err(|_| Error::bad_value(String::from_utf8_lossy(raw), Self::TARGET))?;
                Ok(Date::new(year, 1, 1))
            }
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Date | DataType::NewDate => decode_binary_date(raw, Self::TARGET),
            DataType::DateTime | DataType::Timestamp => {
                Ok(decode_binary_datetime(raw, Self::TARGET)?.date)
            }
            DataType::Year => {
                let year = u16::from_le_bytes(
                    raw.try_into()
                        .map_err(|_| Error::bad_value(format!("<{} bytes>", raw.len()), Self::TARGET))?,
                );
                Ok(Date::new(year, 1, 1))
            }
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }
}

impl Decodable for Time {
    const TARGET: &'static str = "Time";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Time => utf8(raw, Self::TARGET)?.parse(),
            DataType::DateTime | DataType::Timestamp => {
                let dt: DateTime = utf8(raw, Self::TARGET)?.parse()?;
                Ok(Time::new(
                    false,
                    u32::from(dt.hour),
                    dt.minute,
                    dt.second,
                    dt.micros,
                ))
            }
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Time => decode_binary_time(raw, Self::TARGET),
            DataType::DateTime | DataType::Timestamp => {
                let dt = decode_binary_datetime(raw, Self::TARGET)?;
                Ok(Time::new(
                    false,
                    u32::from(dt.hour),
                    dt.minute,
                    dt.second,
                    dt.micros,
                ))
            }
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }
}

impl Decodable for DateTime {
    const TARGET: &'static str = "DateTime";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::DateTime | DataType::Timestamp => utf8(raw, Self::TARGET)?.parse(),
            DataType::Date | DataType::NewDate => {
                let date: Date = utf8(raw, Self::TARGET)?.parse()?;
                Ok(DateTime::new(date, 0, 0, 0, 0))
            }
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::DateTime | DataType::Timestamp => decode_binary_datetime(raw, Self::TARGET),
            DataType::Date | DataType::NewDate => Ok(DateTime::new(
                decode_binary_date(raw, Self::TARGET)?,
                0,
                0,
                0,
                0,
            )),
            t if is_string(t) => utf8(raw, Self::TARGET)?.parse(),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }
}

impl Decodable for Duration {
    const TARGET: &'static str = "Duration";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Time => {
                let t: Time = utf8(raw, Self::TARGET)?.parse()?;
                t.to_duration()
            }
            DataType::DateTime | DataType::Timestamp => {
                let dt: DateTime = utf8(raw, Self::TARGET)?.parse()?;
                Ok(dt.to_duration())
            }
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Time => decode_binary_time(raw, Self::TARGET)?.to_duration(),
            DataType::DateTime | DataType::Timestamp => {
                Ok(decode_binary_datetime(raw, Self::TARGET)?.to_duration())
            }
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }
}

/// DATE parameter: empty for the zero date, else year/month/day.
pub fn encode_binary_date(w: &mut PacketWriter, date: Date) {
    if date.is_zero() {
        w.write_u8(0);
    } else {
        w.write_u8(4);
        w.write_u16_le(date.year);
        w.write_u8(date.month);
        w.write_u8(date.day);
    }
}

/// TIME parameter: sign, days, h/m/s, optional microseconds.
pub fn encode_binary_time(w: &mut PacketWriter, time: Time) {
    if !time.negative && time.abs_micros() == 0 {
        w.write_u8(0);
        return;
    }
    let days = time.hours / 24;
    let hours = time.hours % 24;
    if time.micros == 0 {
        w.write_u8(8);
        w.write_u8(u8::from(time.negative));
        w.write_u32_le(days);
        w.write_u8(hours as u8);
        w.write_u8(time.minutes);
        w.write_u8(time.seconds);
    } else {
        w.write_u8(12);
        w.write_u8(u8::from(time.negative));
        w.write_u32_le(days);
        w.write_u8(hours as u8);
        w.write_u8(time.minutes);
        w.write_u8(time.seconds);
        w.write_u32_le(time.micros);
    }
}

/// DATETIME parameter at the narrowest precision that loses nothing.
pub fn encode_binary_datetime(w: &mut PacketWriter, dt: DateTime) {
    if dt.is_zero() {
        w.write_u8(0);
        return;
    }
    if dt.hour == 0 && dt.minute == 0 && dt.second == 0 && dt.micros == 0 {
        encode_binary_date(w, dt.date);
        return;
    }
    if dt.micros == 0 {
        w.write_u8(7);
    } else {
        w.write_u8(11);
    }
    w.write_u16_le(dt.date.year);
    w.write_u8(dt.date.month);
    w.write_u8(dt.date.day);
    w.write_u8(dt.hour);
    w.write_u8(dt.minute);
    w.write_u8(dt.second);
    if dt.micros != 0 {
        w.write_u32_le(dt.micros);
    }
}
