//! Data-type codecs.
//!
//! Each target type implements [`Decodable`]: it declares which server data
//! types it accepts and parses both the text and binary row encodings.
//! Anything else fails with `"Data type X cannot be decoded as Y"`.
//! Parameters implement [`Parameter`]: a text literal for client-side
//! substitution and a binary encoding with its wire type code.

pub mod binary;
pub mod geometry;
pub mod numeric;
pub mod temporal;
pub mod text;

use marlin_core::{Error, Result};

use crate::message::server::ColumnDefinition;
use crate::protocol::PacketWriter;

/// Server-side data type tags (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    OldDecimal = 0x00,
    TinyInt = 0x01,
    SmallInt = 0x02,
    Int = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    BigInt = 0x08,
    MediumInt = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    Decimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    Text = 0xFE,
    Geometry = 0xFF,
}

impl DataType {
    pub fn from_tag(value: u8) -> Self {
        match value {
            0x00 => DataType::OldDecimal,
            0x01 => DataType::TinyInt,
            0x02 => DataType::SmallInt,
            0x03 => DataType::Int,
            0x04 => DataType::Float,
            0x05 => DataType::Double,
            0x06 => DataType::Null,
            0x07 => DataType::Timestamp,
            0x08 => DataType::BigInt,
            0x09 => DataType::MediumInt,
            0x0A => DataType::Date,
            0x0B => DataType::Time,
            0x0C => DataType::DateTime,
            0x0D => DataType::Year,
            0x0E => DataType::NewDate,
            0x0F => DataType::VarChar,
            0x10 => DataType::Bit,
            0xF5 => DataType::Json,
            0xF6 => DataType::Decimal,
            0xF7 => DataType::Enum,
            0xF8 => DataType::Set,
            0xF9 => DataType::TinyBlob,
            0xFA => DataType::MediumBlob,
            0xFB => DataType::LongBlob,
            0xFC => DataType::Blob,
            0xFD => DataType::VarString,
            0xFE => DataType::Text,
            // Unknown tags decode as opaque strings.
            _ => DataType::Geometry,
        }
    }

    /// Server type name as used in decode-failure messages.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::OldDecimal | DataType::Decimal => "DECIMAL",
            DataType::TinyInt => "TINYINT",
            DataType::SmallInt => "SMALLINT",
            DataType::Int => "INTEGER",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Null => "NULL",
            DataType::Timestamp => "TIMESTAMP",
            DataType::BigInt => "BIGINT",
            DataType::MediumInt => "MEDIUMINT",
            DataType::Date | DataType::NewDate => "DATE",
            DataType::Time => "TIME",
            DataType::DateTime => "DATETIME",
            DataType::Year => "YEAR",
            DataType::VarChar | DataType::VarString => "VARCHAR",
            DataType::Bit => "BIT",
            DataType::Json => "JSON",
            DataType::Enum => "ENUM",
            DataType::Set => "SET",
            DataType::TinyBlob => "TINYBLOB",
            DataType::MediumBlob => "MEDIUMBLOB",
            DataType::LongBlob => "LONGBLOB",
            DataType::Blob => "BLOB",
            DataType::Text => "CHAR",
            DataType::Geometry => "GEOMETRY",
        }
    }

    /// Binary-row cells of these types are fixed-width; everything else is
    /// length-encoded.
    pub const fn binary_width(self) -> Option<usize> {
        match self {
            DataType::TinyInt => Some(1),
            DataType::SmallInt | DataType::Year => Some(2),
            DataType::Int | DataType::MediumInt | DataType::Float => Some(4),
            DataType::BigInt | DataType::Double => Some(8),
            _ => None,
        }
    }

    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            DataType::TinyInt
                | DataType::SmallInt
                | DataType::Int
                | DataType::MediumInt
                | DataType::BigInt
                | DataType::Float
                | DataType::Double
                | DataType::OldDecimal
                | DataType::Decimal
                | DataType::Year
                | DataType::Bit
        )
    }
}

/// Column definition flag bits.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
}

/// A type decodable from row cells.
///
/// `raw` is the cell body: the lenenc string content for text rows, the
/// fixed-width or lenenc content for binary rows. NULL cells never reach
/// these methods; the row decoder handles them.
pub trait Decodable: Sized {
    /// Target name used in failure messages.
    const TARGET: &'static str;

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self>;

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self>;
}

/// Reject a column's data type for a target.
pub(crate) fn unsupported(column: &ColumnDefinition, target: &'static str) -> Error {
    Error::cannot_decode(column.data_type().name(), target)
}

/// Binary wire type codes and encodings for statement parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(marlin_core::Date),
    Time(marlin_core::Time),
    DateTime(marlin_core::DateTime),
    Json(serde_json::Value),
}

impl ParamValue {
    /// Wire type code sent in the EXECUTE type block.
    pub fn binary_type(&self) -> DataType {
        match self {
            ParamValue::Null => DataType::Null,
            ParamValue::Int(_) | ParamValue::UInt(_) => DataType::BigInt,
            ParamValue::Float(_) => DataType::Float,
            ParamValue::Double(_) => DataType::Double,
            ParamValue::Text(_) | ParamValue::Json(_) => DataType::VarString,
            ParamValue::Bytes(_) => DataType::Blob,
            ParamValue::Date(_) => DataType::Date,
            ParamValue::Time(_) => DataType::Time,
            ParamValue::DateTime(_) => DataType::DateTime,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    /// Unsigned flag in the EXECUTE type block.
    pub fn is_unsigned(&self) -> bool {
        matches!(self, ParamValue::UInt(_))
    }

    /// Binary parameter encoding (EXECUTE value block).
    pub fn encode_binary(&self, writer: &mut PacketWriter) {
        match self {
            ParamValue::Null => {}
            ParamValue::Int(v) => writer.write_u64_le(*v as u64),
            ParamValue::UInt(v) => writer.write_u64_le(*v),
            ParamValue::Float(v) => writer.write_f32_le(*v),
            ParamValue::Double(v) => writer.write_f64_le(*v),
            ParamValue::Text(v) => writer.write_lenenc_str(v),
            ParamValue::Json(v) => writer.write_lenenc_str(&v.to_string()),
            ParamValue::Bytes(v) => writer.write_lenenc_bytes(v),
            ParamValue::Date(v) => temporal::encode_binary_date(writer, *v),
            ParamValue::Time(v) => temporal::encode_binary_time(writer, *v),
            ParamValue::DateTime(v) => temporal::encode_binary_datetime(writer, *v),
        }
    }

    /// SQL text literal for client-side substitution.
    pub fn encode_text(&self, out: &mut String) {
        match self {
            ParamValue::Null => out.push_str("NULL"),
            ParamValue::Int(v) => out.push_str(&v.to_string()),
            ParamValue::UInt(v) => out.push_str(&v.to_string()),
            ParamValue::Float(v) => out.push_str(&v.to_string()),
            ParamValue::Double(v) => out.push_str(&v.to_string()),
            ParamValue::Text(v) => text::escape_into(v, out),
            ParamValue::Json(v) => text::escape_into(&v.to_string(), out),
            ParamValue::Bytes(v) => {
                out.push_str("X'");
                for b in v {
                    out.push_str(&format!("{b:02X}"));
                }
                out.push('\'');
            }
            ParamValue::Date(v) => {
                out.push('\'');
                out.push_str(&v.to_string());
                out.push('\'');
            }
            ParamValue::Time(v) => {
                out.push('\'');
                out.push_str(&v.to_string());
                out.push('\'');
            }
            ParamValue::DateTime(v) => {
                out.push('\'');
                out.push_str(&v.to_string());
                out.push('\'');
            }
        }
    }
}

impl From<marlin_core::Value> for ParamValue {
    fn from(v: marlin_core::Value) -> Self {
        use marlin_core::Value;
        match v {
            Value::Null => ParamValue::Null,
            Value::Int(i) => ParamValue::Int(i),
            Value::UInt(u) => ParamValue::UInt(u),
            Value::Float(f) => ParamValue::Float(f),
            Value::Double(d) => ParamValue::Double(d),
            Value::Decimal(s) | Value::Text(s) => ParamValue::Text(s),
            Value::Bytes(b) => ParamValue::Bytes(b),
            Value::Date(d) => ParamValue::Date(d),
            Value::Time(t) => ParamValue::Time(t),
            Value::DateTime(dt) => ParamValue::DateTime(dt),
            Value::Json(j) => ParamValue::Json(j),
            Value::Geometry(g) => ParamValue::Bytes(geometry::encode_wkb(&g)),
        }
    }
}

impl ParamValue {
    /// Convert anything that converts into a [`marlin_core::Value`].
    pub fn of(v: impl Into<marlin_core::Value>) -> Self {
        v.into().into()
    }
}
