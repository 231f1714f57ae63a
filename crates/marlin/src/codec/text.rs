//! String and JSON decode targets, plus SQL literal escaping.

use marlin_core::{Error, Result};

use crate::codec::{numeric, temporal, unsupported, DataType, Decodable};
use crate::message::server::ColumnDefinition;

/// Escape a string into a quoted SQL literal.
pub fn escape_into(s: &str, out: &mut String) {
    out.reserve(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
}

impl Decodable for String {
    const TARGET: &'static str = "String";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        if column.data_type() == DataType::Geometry {
            return Err(unsupported(column, Self::TARGET));
        }
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Geometry => Err(unsupported(column, Self::TARGET)),
            // Fixed-width numerics need re-rendering as text.
            DataType::TinyInt
            | DataType::SmallInt
            | DataType::MediumInt
            | DataType::Int
            | DataType::BigInt
            | DataType::Year => {
                if column.is_unsigned() {
                    Ok(u64::decode_binary(column, raw)?.to_string())
                } else {
                    Ok(numeric::decode_i64_binary(column, raw, Self::TARGET)?.to_string())
                }
            }
            DataType::Float => Ok(f32::decode_binary(column, raw)?.to_string()),
            DataType::Double => Ok(f64::decode_binary(column, raw)?.to_string()),
            DataType::Date | DataType::NewDate => {
                Ok(marlin_core::Date::decode_binary(column, raw)?.to_string())
            }
            DataType::Time => Ok(marlin_core::Time::decode_binary(column, raw)?.to_string()),
            DataType::DateTime | DataType::Timestamp => {
                Ok(marlin_core::DateTime::decode_binary(column, raw)?.to_string())
            }
            _ => Ok(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

impl Decodable for serde_json::Value {
    const TARGET: &'static str = "Json";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        let is_json = column.data_type() == DataType::Json
            || column.ext_type_name() == Some("json")
            || matches!(
                column.data_type(),
                DataType::VarChar
                    | DataType::VarString
                    | DataType::Text
                    | DataType::Blob
                    | DataType::TinyBlob
                    | DataType::MediumBlob
                    | DataType::LongBlob
            );
        if !is_json {
            return Err(unsupported(column, Self::TARGET));
        }
        serde_json::from_slice(raw)
            .map_err(|_| Error::bad_value(String::from_utf8_lossy(raw), Self::TARGET))
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        Self::decode_text(column, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::column_flags;
    use crate::message::server::tests::column;

    #[test]
    fn escape_doubles_quotes() {
        let mut out = String::new();
        escape_into("a'b\\c\nd", &mut out);
        assert_eq!(out, "'a''b\\\\c\\nd'");
    }

    #[test]
    fn string_from_anything_textual() {
        let col = column("v", DataType::VarString, 0);
        assert_eq!(String::decode_text(&col, b"hello").unwrap(), "hello");

        let col = column("n", DataType::Int, 0);
        assert_eq!(String::decode_text(&col, b"42").unwrap(), "42");
        assert_eq!(
            String::decode_binary(&col, &42i32.to_le_bytes()).unwrap(),
            "42"
        );

        let col = column("n", DataType::BigInt, column_flags::UNSIGNED);
        assert_eq!(
            String::decode_binary(&col, &u64::MAX.to_le_bytes()).unwrap(),
            u64::MAX.to_string()
        );
    }

    #[test]
    fn string_from_binary_temporal() {
        let col = column("d", DataType::DateTime, 0);
        let raw = [0xDA, 0x07, 1, 12, 1, 55, 12];
        assert_eq!(
            String::decode_binary(&col, &raw).unwrap(),
            "2010-01-12 01:55:12"
        );
    }

    #[test]
    fn string_rejects_geometry() {
        let col = column("g", DataType::Geometry, 0);
        let err = String::decode_text(&col, &[0, 0, 0, 0]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Data type GEOMETRY cannot be decoded as String"
        );
    }

    #[test]
    fn json_decode() {
        let col = column("j", DataType::Json, 0);
        let v = serde_json::Value::decode_text(&col, br#"{"a":[1,2]}"#).unwrap();
        assert_eq!(v["a"][1], 2);

        let err = serde_json::Value::decode_text(&col, b"{oops").unwrap_err();
        assert_eq!(err.sql_state(), "22018");

        let num = column("n", DataType::Int, 0);
        let err = serde_json::Value::decode_text(&num, b"1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Data type INTEGER cannot be decoded as Json"
        );
    }

    #[test]
    fn mariadb_json_as_longtext() {
        // MariaDB sends JSON columns as LONGBLOB with extended type "json".
        let mut w = crate::protocol::PacketWriter::new();
        w.write_lenenc_str("def");
        w.write_lenenc_str("s");
        w.write_lenenc_str("t");
        w.write_lenenc_str("t");
        w.write_lenenc_str("j");
        w.write_lenenc_str("j");
        let mut ext = crate::protocol::PacketWriter::new();
        ext.write_u8(0);
        ext.write_lenenc_str("json");
        w.write_lenenc_bytes(ext.as_bytes());
        w.write_u8(0x0C);
        w.write_u16_le(33);
        w.write_u32_le(0);
        w.write_u8(DataType::LongBlob as u8);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_u16_le(0);
        let col = ColumnDefinition::decode(w.into_bytes(), true).unwrap();
        let v = serde_json::Value::decode_text(&col, b"[true]").unwrap();
        assert_eq!(v[0], true);
    }
}
