//! Caller-facing value model.
//!
//! Temporal types mirror the wire encoding: the protocol transmits calendar
//! components (year/month/day, hour/minute/second/microsecond), not an epoch
//! offset, so the types store components and convert to epoch values on
//! demand.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::geometry::Geometry;

/// A dynamically-typed parameter or cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// All signed integer widths widen to i64.
    Int(i64),
    /// Unsigned BIGINT values above `i64::MAX`.
    UInt(u64),
    Float(f32),
    Double(f64),
    /// DECIMAL/NEWDECIMAL kept as text to preserve precision.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Json(serde_json::Value),
    Geometry(Geometry),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident via $conv:expr),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant($conv(v))
            }
        })*
    };
}

impl_from! {
    i8 => Int via i64::from,
    i16 => Int via i64::from,
    i32 => Int via i64::from,
    i64 => Int via std::convert::identity,
    u8 => Int via i64::from,
    u16 => Int via i64::from,
    u32 => Int via i64::from,
    u64 => UInt via std::convert::identity,
    f32 => Float via std::convert::identity,
    f64 => Double via std::convert::identity,
    String => Text via std::convert::identity,
    Vec<u8> => Bytes via std::convert::identity,
    Date => Date via std::convert::identity,
    Time => Time via std::convert::identity,
    DateTime => DateTime via std::convert::identity,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(i64::from(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Calendar date as transmitted by the DATE binary layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// The `0000-00-00` zero date the server emits for invalid dates.
    pub fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }

    /// Days since 1970-01-01, via the civil-calendar algorithm.
    pub fn days_from_epoch(&self) -> i64 {
        let y = i64::from(self.year) - i64::from(self.month <= 2);
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = y - era * 400;
        let m = i64::from(self.month);
        let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(self.day) - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146_097 + doe - 719_468
    }

    /// Seconds since the Unix epoch at midnight UTC of this date.
    pub fn unix_timestamp(&self) -> i64 {
        self.days_from_epoch() * 86_400
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for Date {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parse = || -> Option<Date> {
            let mut parts = s.splitn(3, '-');
            let year = parts.next()?.parse().ok()?;
            let month = parts.next()?.parse().ok()?;
            let day = parts.next()?.parse().ok()?;
            Some(Date { year, month, day })
        };
        parse().ok_or_else(|| Error::bad_value(s, "Date"))
    }
}

/// Time of day or signed interval, as transmitted by the TIME layout.
///
/// TIME values are intervals: hours range over `0..=838` and the value may be
/// negative, so this is distinct from a wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

impl Time {
    pub fn new(negative: bool, hours: u32, minutes: u8, seconds: u8, micros: u32) -> Self {
        Self {
            negative,
            hours,
            minutes,
            seconds,
            micros,
        }
    }

    /// Magnitude in microseconds (sign carried separately).
    pub fn abs_micros(&self) -> u64 {
        (u64::from(self.hours) * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds))
            * 1_000_000
            + u64::from(self.micros)
    }

    /// As a std `Duration`; fails for negative intervals.
    pub fn to_duration(&self) -> Result<Duration, Error> {
        if self.negative {
            return Err(Error::bad_value(self, "Duration"));
        }
        Ok(Duration::from_micros(self.abs_micros()))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.micros != 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

impl FromStr for Time {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parse = || -> Option<Time> {
            let (negative, body) = match s.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, s),
            };
            let (hms, frac) = match body.split_once('.') {
                Some((h, f)) => (h, Some(f)),
                None => (body, None),
            };
            let mut parts = hms.splitn(3, ':');
            let hours = parts.next()?.parse().ok()?;
            let minutes = parts.next()?.parse().ok()?;
            let seconds = parts.next().unwrap_or("0").parse().ok()?;
            let micros = frac.map_or(Some(0), parse_micros)?;
            Some(Time::new(negative, hours, minutes, seconds, micros))
        };
        parse().ok_or_else(|| Error::bad_value(s, "Time"))
    }
}

/// Calendar timestamp, as transmitted by the DATETIME/TIMESTAMP layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTime {
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

impl DateTime {
    pub fn new(date: Date, hour: u8, minute: u8, second: u8, micros: u32) -> Self {
        Self {
            date,
            hour,
            minute,
            second,
            micros,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.date.is_zero()
            && self.hour == 0
            && self.minute == 0
            && self.second == 0
            && self.micros == 0
    }

    /// Microseconds since the Unix epoch, treating the components as UTC.
    pub fn unix_timestamp_micros(&self) -> i64 {
        let secs = self.date.unix_timestamp()
            + i64::from(self.hour) * 3600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        secs * 1_000_000 + i64::from(self.micros)
    }

    /// Interpreted as an elapsed interval since the first day of the month
    /// at midnight: day 12 at 01:55 is 11 days and 1:55 in.
    pub fn to_duration(&self) -> Duration {
        let hours =
            u64::from(self.date.day.saturating_sub(1)) * 24 + u64::from(self.hour);
        Duration::from_micros(
            (hours * 3600 + u64::from(self.minute) * 60 + u64::from(self.second)) * 1_000_000
                + u64::from(self.micros),
        )
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date, self.hour, self.minute, self.second
        )?;
        if self.micros != 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

impl FromStr for DateTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parse = || -> Option<DateTime> {
            let (date_part, time_part) = match s.split_once([' ', 'T']) {
                Some((d, t)) => (d, Some(t)),
                None => (s, None),
            };
            let date = date_part.parse().ok()?;
            let Some(time_part) = time_part else {
                return Some(DateTime::new(date, 0, 0, 0, 0));
            };
            let (hms, frac) = match time_part.split_once('.') {
                Some((h, f)) => (h, Some(f)),
                None => (time_part, None),
            };
            let mut parts = hms.splitn(3, ':');
            let hour = parts.next()?.parse().ok()?;
            let minute = parts.next()?.parse().ok()?;
            let second = parts.next().unwrap_or("0").parse().ok()?;
            let micros = frac.map_or(Some(0), parse_micros)?;
            Some(DateTime::new(date, hour, minute, second, micros))
        };
        parse().ok_or_else(|| Error::bad_value(s, "DateTime"))
    }
}

/// Parse a fractional-seconds suffix of up to six digits into microseconds.
fn parse_micros(frac: &str) -> Option<u32> {
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut micros: u32 = frac.parse().ok()?;
    for _ in frac.len()..6 {
        micros *= 10;
    }
    Some(micros)
}
