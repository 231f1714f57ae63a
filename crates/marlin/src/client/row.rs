//! Row materialization for both wire encodings.
//!
//! A row keeps its raw packet and a per-column cell index computed once at
//! construction, so by-index access is O(1) and nothing is decoded until a
//! caller asks for it.

use std::sync::Arc;

use marlin_core::{Error, Result};

use crate::codec::Decodable;
use crate::message::server::ColumnDefinition;
use crate::protocol::reader::NULL_MARKER;
use crate::protocol::PacketReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEncoding {
    Text,
    Binary,
}

/// One decoded-on-demand result row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[ColumnDefinition]>,
    payload: Vec<u8>,
    encoding: RowEncoding,
    /// Byte range of each cell within `payload`; `None` is NULL.
    cells: Vec<Option<(usize, usize)>>,
}

impl Row {
    /// Index a text-protocol row: every cell is a lenenc string, NULL is the
    /// 0xFB marker byte.
    pub fn parse_text(columns: Arc<[ColumnDefinition]>, payload: Vec<u8>) -> Result<Self> {
        let mut cells = Vec::with_capacity(columns.len());
        {
            let mut buf = PacketReader::new(&payload);
            for _ in columns.iter() {
                if buf.peek() == Some(NULL_MARKER) {
                    buf.skip(1);
                    cells.push(None);
                    continue;
                }
                let len = buf
                    .read_lenenc_int()
                    .ok_or_else(|| Error::handshake("truncated text row"))?
                    as usize;
                let start = buf.pos();
                if !buf.skip(len) {
                    return Err(Error::handshake("truncated text row"));
                }
                cells.push(Some((start, len)));
            }
        }
        Ok(Self {
            columns,
            payload,
            encoding: RowEncoding::Text,
            cells,
        })
    }

    /// Index a binary-protocol row: 0x00 header, NULL bitmap with a two-bit
    /// offset, then cells packed by type.
    pub fn parse_binary(columns: Arc<[ColumnDefinition]>, payload: Vec<u8>) -> Result<Self> {
        let mut cells = Vec::with_capacity(columns.len());
        {
            let mut buf = PacketReader::new(&payload);
            if buf.read_u8() != Some(0x00) {
                return Err(Error::handshake("malformed binary row header"));
            }
            let bitmap_len = (columns.len() + 2).div_ceil(8);
            let bitmap = buf
                .read_bytes(bitmap_len)
                .ok_or_else(|| Error::handshake("truncated binary row"))?
                .to_vec();

            for (i, column) in columns.iter().enumerate() {
                let bit = i + 2;
                if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                    cells.push(None);
                    continue;
                }
                let (start, len) = match column.data_type().binary_width() {
                    Some(width) => {
                        let start = buf.pos();
                        if !buf.skip(width) {
                            return Err(Error::handshake("truncated binary row"));
                        }
                        (start, width)
                    }
                    None => {
                        let len = buf
                            .read_lenenc_int()
                            .ok_or_else(|| Error::handshake("truncated binary row"))?
                            as usize;
                        let start = buf.pos();
                        if !buf.skip(len) {
                            return Err(Error::handshake("truncated binary row"));
                        }
                        (start, len)
                    }
                };
                cells.push(Some((start, len)));
            }
        }
        Ok(Self {
            columns,
            payload,
            encoding: RowEncoding::Binary,
            cells,
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn encoding(&self) -> RowEncoding {
        self.encoding
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.columns.len() {
            return Err(Error::Usage(format!(
                "no column at index {index}: row has {} columns",
                self.columns.len()
            )));
        }
        Ok(())
    }

    /// Case-insensitive label lookup on the column alias.
    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(label))
            .ok_or_else(|| Error::Usage(format!("no column named '{label}' in result set")))
    }

    pub fn is_null(&self, index: usize) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.cells[index].is_none())
    }

    /// Raw cell bytes; `None` for NULL.
    pub fn raw(&self, index: usize) -> Result<Option<&[u8]>> {
        self.check_index(index)?;
        Ok(self.cells[index].map(|(start, len)| &self.payload[start..start + len]))
    }

    /// Decode the cell at `index` as `T`; NULL into a bare target fails.
    pub fn get<T: Decodable>(&self, index: usize) -> Result<T> {
        match self.get_opt(index)? {
            Some(v) => Ok(v),
            None => Err(Error::unexpected_null(T::TARGET)),
        }
    }

    /// Decode the cell at `index`, mapping NULL to `None`.
    pub fn get_opt<T: Decodable>(&self, index: usize) -> Result<Option<T>> {
        let Some(raw) = self.raw(index)? else {
            return Ok(None);
        };
        let column = &self.columns[index];
        let value = match self.encoding {
            RowEncoding::Text => T::decode_text(column, raw)?,
            RowEncoding::Binary => T::decode_binary(column, raw)?,
        };
        Ok(Some(value))
    }

    pub fn get_by_name<T: Decodable>(&self, label: &str) -> Result<T> {
        let index = self.index_of(label)?;
        self.get(index)
    }

    pub fn get_opt_by_name<T: Decodable>(&self, label: &str) -> Result<Option<T>> {
        let index = self.index_of(label)?;
        self.get_opt(index)
    }
}
