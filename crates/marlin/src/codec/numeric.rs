//! Numeric decode targets.
//!
//! Integer targets truncate fractional sources toward zero; values outside
//! the target range are decode failures, not wrap-arounds.

use marlin_core::{Error, Result};

use crate::codec::{unsupported, DataType, Decodable};
use crate::message::server::ColumnDefinition;

fn utf8<'a>(raw: &'a [u8], target: &'static str) -> Result<&'a str> {
    std::str::from_utf8(raw).map_err(|_| Error::bad_value(String::from_utf8_lossy(raw), target))
}

/// BIT cells arrive big-endian.
fn bit_to_u64(raw: &[u8], target: &'static str) -> Result<u64> {
    if raw.len() > 8 {
        return Err(Error::numeric_overflow(format!("BIT({})", raw.len() * 8), target));
    }
    Ok(raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Parse a text cell into i64, truncating a fractional representation.
fn parse_text_i64(raw: &[u8], target: &'static str) -> Result<i64> {
    let s = utf8(raw, target)?.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    // FLOAT/DOUBLE/DECIMAL text representations carry a fraction.
    let f = s
        .parse::<f64>()
        .map_err(|_| Error::bad_value(s, target))?;
    let truncated = f.trunc();
    if !truncated.is_finite() || truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 + 1.0 {
        return Err(Error::numeric_overflow(s, target));
    }
    Ok(truncated as i64)
}

/// Whether `i64`-family targets accept this column type.
fn integer_compatible(t: DataType) -> bool {
    t.is_numeric()
        || matches!(
            t,
            DataType::VarChar | DataType::VarString | DataType::Text | DataType::Enum
        )
}

/// Signed widening decode used by every integer target.
pub(crate) fn decode_i64_text(
    column: &ColumnDefinition,
    raw: &[u8],
    target: &'static str,
) -> Result<i64> {
    if !integer_compatible(column.data_type()) {
        return Err(unsupported(column, target));
    }
    if column.data_type() == DataType::Bit {
        let v = bit_to_u64(raw, target)?;
        return i64::try_from(v).map_err(|_| Error::numeric_overflow(v, target));
    }
    parse_text_i64(raw, target)
}

pub(crate) fn decode_i64_binary(
    column: &ColumnDefinition,
    raw: &[u8],
    target: &'static str,
) -> Result<i64> {
    if !integer_compatible(column.data_type()) {
        return Err(unsupported(column, target));
    }
    let unsigned = column.is_unsigned();
    let truncated = |len: usize| Error::bad_value(format!("<{len} bytes>"), target);

    match column.data_type() {
        DataType::TinyInt => {
            let b = *raw.first().ok_or_else(|| truncated(raw.len()))?;
            Ok(if unsigned { i64::from(b) } else { i64::from(b as i8) })
        }
        DataType::SmallInt | DataType::Year => {
            let v = u16::from_le_bytes(raw.try_into().map_err(|_| truncated(raw.len()))?);
            Ok(if unsigned { i64::from(v) } else { i64::from(v as i16) })
        }
        DataType::Int | DataType::MediumInt => {
            let v = u32::from_le_bytes(raw.try_into().map_err(|_| truncated(raw.len()))?);
            Ok(if unsigned { i64::from(v) } else { i64::from(v as i32) })
        }
        DataType::BigInt => {
            let v = u64::from_le_bytes(raw.try_into().map_err(|_| truncated(raw.len()))?);
            if unsigned {
                i64::try_from(v).map_err(|_| Error::numeric_overflow(v, target))
            } else {
                Ok(v as i64)
            }
        }
        DataType::Float => {
            let f = f32::from_le_bytes(raw.try_into().map_err(|_| truncated(raw.len()))?);
            let t = f.trunc();
            if t < i64::MIN as f32 || t >= i64::MAX as f32 {
                return Err(Error::numeric_overflow(f, target));
            }
            Ok(t as i64)
        }
        DataType::Double => {
            let f = f64::from_le_bytes(raw.try_into().map_err(|_| truncated(raw.len()))?);
            let t = f.trunc();
            if !t.is_finite() || t < i64::MIN as f64 || t >= i64::MAX as f64 + 1.0 {
                return Err(Error::numeric_overflow(f, target));
            }
            Ok(t as i64)
        }
        DataType::Bit => {
            let v = bit_to_u64(raw, target)?;
            i64::try_from(v).map_err(|_| Error::numeric_overflow(v, target))
        }
        // DECIMAL and string types stay text-encoded in binary rows.
        _ => parse_text_i64(raw, target),
    }
}

macro_rules! narrow_int {
    ($ty:ty, $target:literal) => {
        impl Decodable for $ty {
            const TARGET: &'static str = $target;

            fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
                let wide = decode_i64_text(column, raw, Self::TARGET)?;
                <$ty>::try_from(wide).map_err(|_| Error::numeric_overflow(wide, Self::TARGET))
            }

            fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
                let wide = decode_i64_binary(column, raw, Self::TARGET)?;
                <$ty>::try_from(wide).map_err(|_| Error::numeric_overflow(wide, Self::TARGET))
            }
        }
    };
}

narrow_int!(i8, "Byte");
narrow_int!(i16, "Short");
narrow_int!(i32, "Integer");
narrow_int!(u8, "UnsignedByte");
narrow_int!(u16, "UnsignedShort");
narrow_int!(u32, "UnsignedInteger");

impl Decodable for i64 {
    const TARGET: &'static str = "Long";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        decode_i64_text(column, raw, Self::TARGET)
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        decode_i64_binary(column, raw, Self::TARGET)
    }
}

impl Decodable for u64 {
    const TARGET: &'static str = "UnsignedLong";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if !integer_compatible(column.data_type()) {
            return Err(unsupported(column, Self::TARGET));
        }
        if column.data_type() == DataType::Bit {
            return bit_to_u64(raw, Self::TARGET);
        }
        let s = utf8(raw, Self::TARGET)?.trim();
        if let Ok(v) = s.parse::<u64>() {
            return Ok(v);
        }
        let wide = parse_text_i64(raw, Self::TARGET)?;
        u64::try_from(wide).map_err(|_| Error::numeric_overflow(wide, Self::TARGET))
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if column.data_type() == DataType::BigInt && column.is_unsigned() {
            let bytes: [u8; 8] = raw
                .try_into()
                .map_err(|_| Error::bad_value(format!("<{} bytes>", raw.len()), Self::TARGET))?;
            return Ok(u64::from_le_bytes(bytes));
        }
        let wide = decode_i64_binary(column, raw, Self::TARGET)?;
        u64::try_from(wide).map_err(|_| Error::numeric_overflow(wide, Self::TARGET))
    }
}

fn float_compatible(t: DataType) -> bool {
    integer_compatible(t)
}

impl Decodable for f32 {
    const TARGET: &'static str = "Float";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if !float_compatible(column.data_type()) {
            return Err(unsupported(column, Self::TARGET));
        }
        let s = utf8(raw, Self::TARGET)?.trim();
        s.parse::<f32>().map_err(|_| Error::bad_value(s, Self::TARGET))
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Float => {
                let bytes: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| Error::bad_value(format!("<{} bytes>", raw.len()), Self::TARGET))?;
                Ok(f32::from_le_bytes(bytes))
            }
            DataType::Double => Ok(f64::decode_binary(column, raw)? as f32),
            _ => Ok(decode_i64_binary(column, raw, Self::TARGET)? as f32),
        }
    }
}

impl Decodable for f64 {
    const TARGET: &'static str = "Double";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if !float_compatible(column.data_type()) {
            return Err(unsupported(column, Self::TARGET));
        }
        let s = utf8(raw, Self::TARGET)?.trim();
        s.parse::<f64>().map_err(|_| Error::bad_value(s, Self::TARGET))
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Double => {
                let bytes: [u8; 8] = raw
                    .try_into()
                    .map_err(|_| Error::bad_value(format!("<{} bytes>", raw.len()), Self::TARGET))?;
                Ok(f64::from_le_bytes(bytes))
            }
            DataType::Float => Ok(f64::from(f32::decode_binary(column, raw)?)),
            _ => Ok(decode_i64_binary(column, raw, Self::TARGET)? as f64),
        }
    }
}

/// Arbitrary-precision decimal kept as its text representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal(pub String);

impl Decodable for Decimal {
    const TARGET: &'static str = "Decimal";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if !column.data_type().is_numeric() {
            return Err(unsupported(column, Self::TARGET));
        }
        let s = utf8(raw, Self::TARGET)?.trim();
        // Validate the shape without losing precision.
        s.parse::<f64>().map_err(|_| Error::bad_value(s, Self::TARGET))?;
        Ok(Decimal(s.to_owned()))
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Decimal | DataType::OldDecimal => {
                Ok(Decimal(utf8(raw, Self::TARGET)?.to_owned()))
            }
            t if t.is_numeric() => {
                if matches!(t, DataType::Float | DataType::Double) {
                    Ok(Decimal(f64::decode_binary(column, raw)?.to_string()))
                } else {
                    Ok(Decimal(
                        decode_i64_binary(column, raw, Self::TARGET)?.to_string(),
                    ))
                }
            }
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }
}

impl Decodable for bool {
    const TARGET: &'static str = "Boolean";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Bit => Ok(bit_to_u64(raw, Self::TARGET)? != 0),
            t if t.is_numeric() => {
                // Any non-zero numeric is true.
                let s = utf8(raw, Self::TARGET)?.trim();
                let f = s.parse::<f64>().map_err(|_| Error::bad_value(s, Self::TARGET))?;
                Ok(f != 0.0)
            }
            DataType::VarChar | DataType::VarString | DataType::Text => {
                let s = utf8(raw, Self::TARGET)?.trim();
                match s {
                    "0" | "false" | "FALSE" => Ok(false),
                    "1" | "true" | "TRUE" => Ok(true),
                    other => Err(Error::bad_value(other, Self::TARGET)),
                }
            }
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Bit => Ok(bit_to_u64(raw, Self::TARGET)? != 0),
            DataType::Float | DataType::Double => Ok(f64::decode_binary(column, raw)? != 0.0),
            t if t.is_numeric() => Ok(decode_i64_binary(column, raw, Self::TARGET)? != 0),
            _ => Self::decode_text(column, raw),
        }
    }
}
