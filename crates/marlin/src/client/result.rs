//! Command results.

use std::sync::Arc;

use marlin_core::{Error, Result};

use crate::client::row::Row;
use crate::message::server::ColumnDefinition;
use crate::protocol::{server_status, OkPacket};

/// Summary of a row-less completion (OK packet).
#[derive(Debug, Clone)]
pub struct OkInfo {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl From<&OkPacket> for OkInfo {
    fn from(ok: &OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status: ok.status_flags,
            warnings: ok.warnings,
        }
    }
}

impl OkInfo {
    pub fn in_transaction(&self) -> bool {
        self.status & server_status::IN_TRANSACTION != 0
    }
}

/// One completion of a (possibly multi-result) command.
#[derive(Debug)]
pub enum QueryResult {
    Ok(OkInfo),
    ResultSet(CompleteResult),
}

impl QueryResult {
    pub fn as_result_set(&self) -> Option<&CompleteResult> {
        match self {
            QueryResult::ResultSet(rs) => Some(rs),
            QueryResult::Ok(_) => None,
        }
    }

    pub fn into_result_set(self) -> Result<CompleteResult> {
        match self {
            QueryResult::ResultSet(rs) => Ok(rs),
            QueryResult::Ok(_) => Err(Error::Usage(
                "statement did not produce a result set".into(),
            )),
        }
    }

    pub fn as_ok(&self) -> Option<&OkInfo> {
        match self {
            QueryResult::Ok(ok) => Some(ok),
            QueryResult::ResultSet(_) => None,
        }
    }
}

/// A fully-buffered result set.
#[derive(Debug)]
pub struct CompleteResult {
    columns: Arc<[ColumnDefinition]>,
    rows: Vec<Row>,
    cursor: usize,
    /// Status/warnings from the terminating OK/EOF.
    pub status: u16,
    pub warnings: u16,
}

impl CompleteResult {
    pub(crate) fn new(
        columns: Arc<[ColumnDefinition]>,
        rows: Vec<Row>,
        status: u16,
        warnings: u16,
    ) -> Self {
        Self {
            columns,
            rows,
            cursor: 0,
            status,
            warnings,
        }
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cursor-style access; `None` past the last row.
    pub fn next_row(&mut self) -> Option<&Row> {
        let row = self.rows.get(self.cursor)?;
        self.cursor += 1;
        Some(row)
    }

    /// First row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Force label lookups to use the column alias for the table name too.
    pub fn use_alias_as_name(&mut self) {
        let mut columns: Vec<ColumnDefinition> = self.columns.to_vec();
        for c in &mut columns {
            c.set_use_alias_as_name(true);
        }
        self.columns = Arc::from(columns);
    }
}

impl IntoIterator for CompleteResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a CompleteResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
