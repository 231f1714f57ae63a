//! Raw byte decode target.

use marlin_core::Result;

use crate::codec::{unsupported, DataType, Decodable};
use crate::message::server::ColumnDefinition;

impl Decodable for Vec<u8> {
    const TARGET: &'static str = "Bytes";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        match column.data_type() {
            DataType::Blob
            | DataType::TinyBlob
            | DataType::MediumBlob
            | DataType::LongBlob
            | DataType::VarChar
            | DataType::VarString
            | DataType::Text
            | DataType::Bit
            | DataType::Geometry => Ok(raw.to_vec()),
            _ => Err(unsupported(column, Self::TARGET)),
        }
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        Self::decode_text(column, raw)
    }
}
