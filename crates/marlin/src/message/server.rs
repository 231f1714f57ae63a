//! Server-originated messages.

#![allow(clippy::cast_possible_truncation)]

use marlin_core::{Error, Result};

use crate::codec::{column_flags, DataType};
use crate::protocol::{capabilities, PacketReader};

/// Decoded initial handshake (protocol version 10).
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// 20-byte auth seed (part 1 + part 2).
    pub seed: Vec<u8>,
    /// Full advertised capability set, including MariaDB extended bits.
    pub capabilities: u64,
    pub default_collation: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = PacketReader::new(payload);

        let protocol_version = buf
            .read_u8()
            .ok_or_else(|| Error::handshake("missing protocol version"))?;
        if protocol_version != 10 {
            return Err(Error::handshake(format!(
                "unsupported protocol version {protocol_version}, expected 10"
            )));
        }

        let server_version = buf
            .read_null_string()
            .ok_or_else(|| Error::handshake("missing server version"))?;
        let thread_id = buf
            .read_u32_le()
            .ok_or_else(|| Error::handshake("missing thread id"))?;
        let seed1 = buf
            .read_bytes(8)
            .ok_or_else(|| Error::handshake("missing auth seed"))?
            .to_vec();
        buf.skip(1); // filler

        let caps_low = u64::from(
            buf.read_u16_le()
                .ok_or_else(|| Error::handshake("missing capability flags"))?,
        );
        let default_collation = buf.read_u8().unwrap_or(0);
        let status = buf.read_u16_le().unwrap_or(0);
        let caps_high = u64::from(buf.read_u16_le().unwrap_or(0));
        let mut caps = caps_low | (caps_high << 16);

        let seed_len = if caps & capabilities::PLUGIN_AUTH != 0 {
            usize::from(buf.read_u8().unwrap_or(0))
        } else {
            buf.skip(1);
            0
        };
        buf.skip(6); // reserved

        // MariaDB advertises extended capabilities where MySQL keeps filler.
        if caps & capabilities::CLIENT_MYSQL == 0 {
            caps |= u64::from(buf.read_u32_le().unwrap_or(0)) << 32;
        } else {
            buf.skip(4);
        }

        let mut seed = seed1;
        if caps & capabilities::SECURE_CONNECTION != 0 {
            let len2 = seed_len.saturating_sub(9).max(12);
            if let Some(part2) = buf.read_bytes(len2) {
                seed.extend_from_slice(part2);
            }
            buf.skip(1); // trailing NUL of the seed
        }

        let auth_plugin = if caps & capabilities::PLUGIN_AUTH != 0 {
            buf.read_null_string().unwrap_or_default()
        } else {
            crate::auth::NATIVE_PASSWORD.to_owned()
        };

        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            seed,
            capabilities: caps,
            default_collation,
            status,
            auth_plugin,
        })
    }
}

/// AuthSwitchRequest: 0xFE marker, plugin name, fresh seed.
#[derive(Debug, Clone)]
pub struct AuthSwitch {
    pub plugin: String,
    pub seed: Vec<u8>,
}

impl AuthSwitch {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = PacketReader::new(payload);
        if buf.read_u8() != Some(0xFE) {
            return Err(Error::handshake("malformed auth switch packet"));
        }
        let plugin = buf
            .read_null_string()
            .ok_or_else(|| Error::handshake("auth switch without plugin name"))?;
        let mut seed = buf.read_rest().to_vec();
        if seed.last() == Some(&0) {
            seed.pop();
        }
        Ok(Self { plugin, seed })
    }
}

/// COM_STMT_PREPARE_OK header packet.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = PacketReader::new(payload);
        if buf.read_u8() != Some(0x00) {
            return Err(Error::handshake("malformed prepare response"));
        }
        let statement_id = buf
            .read_u32_le()
            .ok_or_else(|| Error::handshake("prepare response missing statement id"))?;
        let num_columns = buf.read_u16_le().unwrap_or(0);
        let num_params = buf.read_u16_le().unwrap_or(0);
        buf.skip(1); // filler
        let warnings = buf.read_u16_le().unwrap_or(0);
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// A column definition, kept as the raw packet plus offsets into it.
///
/// The six name strings are lazily decoded from the backing bytes; rows only
/// touch the precomputed type/flag fields, so result decoding never pays for
/// names it does not read.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    buf: Vec<u8>,
    /// Start offsets of the six lenenc strings: catalog, schema, table
    /// alias, table, column alias, column.
    string_pos: [usize; 6],
    charset: u16,
    length: u32,
    data_type: DataType,
    decimals: u8,
    flags: u16,
    ext_type_name: Option<String>,
    ext_type_format: Option<String>,
    use_alias_as_name: bool,
}

impl ColumnDefinition {
    /// Parse a column definition packet. `extended` selects the MariaDB
    /// extended-metadata layout (an extra lenenc block before the fixed
    /// fields).
    pub fn decode(payload: Vec<u8>, extended: bool) -> Result<Self> {
        let mut buf = PacketReader::new(&payload);
        // catalog, schema, table alias, table, column alias, column
        let mut string_pos = [0usize; 6];
        for pos in &mut string_pos {
            *pos = buf.pos();
            if !buf.skip_lenenc() {
                return Err(Error::handshake("truncated column definition"));
            }
        }

        let mut ext_type_name = None;
        let mut ext_type_format = None;
        if extended {
            let ext = buf
                .read_lenenc_bytes()
                .ok_or_else(|| Error::handshake("truncated extended column metadata"))?;
            let mut sub = PacketReader::new(ext);
            while let Some(kind) = sub.read_u8() {
                let data = sub
                    .read_lenenc_bytes()
                    .ok_or_else(|| Error::handshake("truncated extended column metadata"))?;
                match kind {
                    0 => ext_type_name = Some(String::from_utf8_lossy(data).into_owned()),
                    1 => ext_type_format = Some(String::from_utf8_lossy(data).into_owned()),
                    _ => {}
                }
            }
        }

        buf.skip(1); // fixed-fields length, always 0x0C
        let charset = buf
            .read_u16_le()
            .ok_or_else(|| Error::handshake("column definition missing charset"))?;
        let length = buf
            .read_u32_le()
            .ok_or_else(|| Error::handshake("column definition missing length"))?;
        let data_type = DataType::from_tag(
            buf.read_u8()
                .ok_or_else(|| Error::handshake("column definition missing type"))?,
        );
        let flags = buf
            .read_u16_le()
            .ok_or_else(|| Error::handshake("column definition missing flags"))?;
        let decimals = buf
            .read_u8()
            .ok_or_else(|| Error::handshake("column definition missing decimals"))?;

        Ok(Self {
            buf: payload,
            string_pos,
            charset,
            length,
            data_type,
            decimals,
            flags,
            ext_type_name,
            ext_type_format,
            use_alias_as_name: false,
        })
    }

    /// Synthesize a definition for internally-generated result sets.
    pub fn synthetic(name: &str, data_type: DataType) -> Self {
        let mut buf = Vec::with_capacity(16 + 2 * name.len());
        let mut string_pos = [0usize; 6];

        string_pos[0] = buf.len();
        buf.extend_from_slice(&[3, b'D', b'E', b'F']);
        for pos in string_pos.iter_mut().take(4).skip(1) {
            *pos = buf.len();
            buf.push(0);
        }
        for pos in string_pos.iter_mut().skip(4) {
            *pos = buf.len();
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }

        Self {
            buf,
            string_pos,
            charset: 33,
            length: 64,
            data_type,
            decimals: 0,
            flags: 0,
            ext_type_name: None,
            ext_type_format: None,
            use_alias_as_name: false,
        }
    }

    fn string_at(&self, idx: usize) -> String {
        let mut buf = PacketReader::new(&self.buf);
        buf.seek(self.string_pos[idx]);
        buf.read_lenenc_string().unwrap_or_default()
    }

    pub fn schema(&self) -> String {
        self.string_at(1)
    }

    pub fn table_alias(&self) -> String {
        self.string_at(2)
    }

    pub fn table(&self) -> String {
        self.string_at(if self.use_alias_as_name { 2 } else { 3 })
    }

    pub fn name(&self) -> String {
        self.string_at(4)
    }

    pub fn org_name(&self) -> String {
        self.string_at(5)
    }

    pub fn set_use_alias_as_name(&mut self, use_alias: bool) {
        self.use_alias_as_name = use_alias;
    }

    pub fn charset(&self) -> u16 {
        self.charset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn ext_type_name(&self) -> Option<&str> {
        self.ext_type_name.as_deref()
    }

    pub fn ext_type_format(&self) -> Option<&str> {
        self.ext_type_format.as_deref()
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    pub fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }

    /// Binary collation id: the column holds bytes, not text.
    pub fn is_binary_charset(&self) -> bool {
        self.charset == 63
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    /// Build a column definition payload the way a server would.
    pub(crate) fn column_payload(
        schema: &str,
        table: &str,
        name: &str,
        data_type: DataType,
        flags: u16,
        decimals: u8,
    ) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_str("def");
        w.write_lenenc_str(schema);
        w.write_lenenc_str(table); // table alias
        w.write_lenenc_str(table);
        w.write_lenenc_str(name); // column alias
        w.write_lenenc_str(name);
        w.write_u8(0x0C);
        w.write_u16_le(33);
        w.write_u32_le(11);
        w.write_u8(data_type as u8);
        w.write_u16_le(flags);
        w.write_u8(decimals);
        w.write_u16_le(0); // filler
        w.into_bytes()
    }

    pub(crate) fn column(name: &str, data_type: DataType, flags: u16) -> ColumnDefinition {
        ColumnDefinition::decode(column_payload("test", "t", name, data_type, flags, 0), false)
            .unwrap()
    }

    #[test]
    fn handshake_decode() {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_str("10.6.12-MariaDB");
        w.write_u32_le(42); // thread id
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]); // seed part 1
        w.write_u8(0); // filler
        let caps: u64 = capabilities::PROTOCOL_41
            | capabilities::SECURE_CONNECTION
            | capabilities::PLUGIN_AUTH
            | (capabilities::MARIADB_EXTENDED_METADATA);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(45); // collation
        w.write_u16_le(0x0002); // status
        w.write_u16_le(((caps >> 16) & 0xFFFF) as u16);
        w.write_u8(21); // seed length
        w.write_zeros(6);
        w.write_u32_le((caps >> 32) as u32); // MariaDB extended caps
        w.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]); // seed part 2
        w.write_u8(0);
        w.write_null_str("mysql_native_password");

        let hs = InitialHandshake::decode(w.as_bytes()).unwrap();
        assert_eq!(hs.thread_id, 42);
        assert_eq!(hs.server_version, "10.6.12-MariaDB");
        assert_eq!(hs.seed.len(), 20);
        assert_eq!(hs.seed[0], 1);
        assert_eq!(hs.seed[19], 20);
        assert_eq!(hs.auth_plugin, "mysql_native_password");
        assert_ne!(hs.capabilities & capabilities::MARIADB_EXTENDED_METADATA, 0);
    }

    #[test]
    fn handshake_rejects_other_protocols() {
        let err = InitialHandshake::decode(&[9, 0]).unwrap_err();
        assert!(err.to_string().contains("protocol version"));
    }

    #[test]
    fn auth_switch_decode() {
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_null_str("client_ed25519");
        w.write_bytes(b"freshseedfreshseed\0");
        let switch = AuthSwitch::decode(w.as_bytes()).unwrap();
        assert_eq!(switch.plugin, "client_ed25519");
        assert_eq!(switch.seed, b"freshseedfreshseed");
    }

    #[test]
    fn prepare_ok_decode() {
        let data = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
        ];
        let ok = PrepareOk::decode(&data).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 3);
        assert_eq!(ok.num_params, 2);
        assert_eq!(ok.warnings, 0);
    }

    #[test]
    fn column_definition_offsets() {
        let col = column("total", DataType::Decimal, column_flags::NOT_NULL);
        assert_eq!(col.schema(), "test");
        assert_eq!(col.table(), "t");
        assert_eq!(col.name(), "total");
        assert_eq!(col.data_type(), DataType::Decimal);
        assert!(!col.is_nullable());
        assert!(!col.is_unsigned());
    }

    #[test]
    fn column_definition_alias_switch() {
        let mut w = PacketWriter::new();
        w.write_lenenc_str("def");
        w.write_lenenc_str("s");
        w.write_lenenc_str("alias_t");
        w.write_lenenc_str("real_t");
        w.write_lenenc_str("c");
        w.write_lenenc_str("c");
        w.write_u8(0x0C);
        w.write_u16_le(33);
        w.write_u32_le(0);
        w.write_u8(DataType::Int as u8);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_u16_le(0);
        let mut col = ColumnDefinition::decode(w.into_bytes(), false).unwrap();
        assert_eq!(col.table(), "real_t");
        col.set_use_alias_as_name(true);
        assert_eq!(col.table(), "alias_t");
    }

    #[test]
    fn column_definition_extended_metadata() {
        let mut w = PacketWriter::new();
        w.write_lenenc_str("def");
        w.write_lenenc_str("s");
        w.write_lenenc_str("t");
        w.write_lenenc_str("t");
        w.write_lenenc_str("g");
        w.write_lenenc_str("g");
        // extended metadata block: type 0 => type name
        let mut ext = PacketWriter::new();
        ext.write_u8(0);
        ext.write_lenenc_str("point");
        w.write_lenenc_bytes(ext.as_bytes());
        w.write_u8(0x0C);
        w.write_u16_le(63);
        w.write_u32_le(0);
        w.write_u8(DataType::Geometry as u8);
        w.write_u16_le(column_flags::BINARY);
        w.write_u8(0);
        w.write_u16_le(0);
        let col = ColumnDefinition::decode(w.into_bytes(), true).unwrap();
        assert_eq!(col.ext_type_name(), Some("point"));
        assert_eq!(col.data_type(), DataType::Geometry);
        assert!(col.is_binary_charset());
    }

    #[test]
    fn synthetic_column() {
        let col = ColumnDefinition::synthetic("Variable_name", DataType::VarString);
        assert_eq!(col.name(), "Variable_name");
        assert_eq!(col.data_type(), DataType::VarString);
    }
}
