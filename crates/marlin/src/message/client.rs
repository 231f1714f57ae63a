//! Client-originated messages.
//!
//! Commands are one enum: each variant knows its payload encoding, how many
//! server responses it expects (pipelining reads exactly that many), a human
//! description for error attachment, and whether it can be replayed inside a
//! transaction. Handshake-phase packets (SSL request, handshake response)
//! are separate structs since they never travel through the command cycle.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use crate::codec::ParamValue;
use crate::protocol::{capabilities, Command, PacketWriter};

/// Max-packet value announced in the handshake response (1 GiB).
pub const ANNOUNCED_MAX_PACKET: u32 = 1 << 30;

/// A command in the request/response cycle.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Query {
        sql: String,
    },
    Prepare {
        sql: String,
    },
    Execute {
        statement_id: u32,
        /// Original SQL, kept for re-prepare during transaction replay.
        sql: String,
        params: Vec<ParamValue>,
    },
    LongData {
        statement_id: u32,
        param_index: u16,
        data: Vec<u8>,
    },
    CloseStatement {
        statement_id: u32,
    },
    ResetStatement {
        statement_id: u32,
    },
    ChangeDb {
        database: String,
    },
    Ping,
    Quit,
    ResetConnection,
    SetOption {
        option: u16,
    },
}

impl ClientMessage {
    /// Command payload, ready for framing.
    pub fn payload(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        match self {
            ClientMessage::Query { sql } => {
                w.write_u8(Command::Query as u8);
                w.write_bytes(sql.as_bytes());
            }
            ClientMessage::Prepare { sql } => {
                w.write_u8(Command::StmtPrepare as u8);
                w.write_bytes(sql.as_bytes());
            }
            ClientMessage::Execute {
                statement_id,
                params,
                ..
            } => {
                w.write_u8(Command::StmtExecute as u8);
                w.write_u32_le(*statement_id);
                w.write_u8(0x00); // CURSOR_TYPE_NO_CURSOR
                w.write_u32_le(1); // iteration count

                if !params.is_empty() {
                    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
                    for (i, param) in params.iter().enumerate() {
                        if param.is_null() {
                            null_bitmap[i / 8] |= 1 << (i % 8);
                        }
                    }
                    w.write_bytes(&null_bitmap);

                    w.write_u8(1); // new params bound
                    for param in params {
                        w.write_u8(param.binary_type() as u8);
                        w.write_u8(if param.is_unsigned() { 0x80 } else { 0x00 });
                    }
                    for param in params {
                        param.encode_binary(&mut w);
                    }
                }
            }
            ClientMessage::LongData {
                statement_id,
                param_index,
                data,
            } => {
                w.write_u8(Command::StmtSendLongData as u8);
                w.write_u32_le(*statement_id);
                w.write_u16_le(*param_index);
                w.write_bytes(data);
            }
            ClientMessage::CloseStatement { statement_id } => {
                w.write_u8(Command::StmtClose as u8);
                w.write_u32_le(*statement_id);
            }
            ClientMessage::ResetStatement { statement_id } => {
                w.write_u8(Command::StmtReset as u8);
                w.write_u32_le(*statement_id);
            }
            ClientMessage::ChangeDb { database } => {
                w.write_u8(Command::InitDb as u8);
                w.write_bytes(database.as_bytes());
            }
            ClientMessage::Ping => w.write_u8(Command::Ping as u8),
            ClientMessage::Quit => w.write_u8(Command::Quit as u8),
            ClientMessage::ResetConnection => w.write_u8(Command::ResetConnection as u8),
            ClientMessage::SetOption { option } => {
                w.write_u8(Command::SetOption as u8);
                w.write_u16_le(*option);
            }
        }
        w.into_bytes()
    }

    /// Number of server responses this command produces. Pipelining relies
    /// on reading exactly this many per message.
    pub fn expected_responses(&self) -> usize {
        match self {
            ClientMessage::Quit
            | ClientMessage::CloseStatement { .. }
            | ClientMessage::LongData { .. } => 0,
            _ => 1,
        }
    }

    /// Human description attached to errors.
    pub fn description(&self) -> String {
        match self {
            ClientMessage::Query { sql } => sql.clone(),
            ClientMessage::Prepare { sql } => format!("PREPARE {sql}"),
            ClientMessage::Execute { sql, .. } => format!("EXECUTE {sql}"),
            ClientMessage::LongData { statement_id, .. } => {
                format!("SEND_LONG_DATA for statement {statement_id}")
            }
            ClientMessage::CloseStatement { statement_id } => {
                format!("CLOSE statement {statement_id}")
            }
            ClientMessage::ResetStatement { statement_id } => {
                format!("RESET statement {statement_id}")
            }
            ClientMessage::ChangeDb { database } => format!("USE {database}"),
            ClientMessage::Ping => "PING".into(),
            ClientMessage::Quit => "QUIT".into(),
            ClientMessage::ResetConnection => "RESET CONNECTION".into(),
            ClientMessage::SetOption { option } => format!("SET_OPTION {option}"),
        }
    }

    /// Can this message be replayed on a fresh connection inside a
    /// transaction?
    pub fn redoable(&self) -> bool {
        matches!(
            self,
            ClientMessage::Query { .. }
                | ClientMessage::Execute { .. }
                | ClientMessage::LongData { .. }
                | ClientMessage::ChangeDb { .. }
        )
    }

    /// Replay form of this message with a substituted statement id (a fresh
    /// connection re-prepares and gets new ids).
    pub fn with_statement_id(&self, new_id: u32) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            ClientMessage::Execute { statement_id, .. }
            | ClientMessage::LongData { statement_id, .. }
            | ClientMessage::CloseStatement { statement_id }
            | ClientMessage::ResetStatement { statement_id } => *statement_id = new_id,
            _ => {}
        }
        msg
    }

    /// SQL to re-prepare during replay, for messages bound to a statement id.
    pub fn prepared_sql(&self) -> Option<&str> {
        match self {
            ClientMessage::Execute { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

/// Short SSL request: the first half of the handshake response, sent before
/// the TLS upgrade.
#[derive(Debug)]
pub struct SslRequest {
    pub capabilities: u64,
    pub collation: u8,
}

impl SslRequest {
    pub fn payload(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(32);
        w.write_u32_le((self.capabilities | capabilities::SSL) as u32);
        w.write_u32_le(ANNOUNCED_MAX_PACKET);
        w.write_u8(self.collation);
        w.write_zeros(19);
        w.write_u32_le((self.capabilities >> 32) as u32);
        w.into_bytes()
    }
}

/// Full handshake response.
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u64,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: Vec<u8>,
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub connection_attributes: &'a BTreeMap<String, String>,
}

impl HandshakeResponse<'_> {
    pub fn payload(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut w = PacketWriter::new();
        w.write_u32_le(caps as u32);
        w.write_u32_le(ANNOUNCED_MAX_PACKET);
        w.write_u8(self.collation);
        w.write_zeros(19);
        // MariaDB extended capabilities live in the tail of the reserved
        // block; MySQL servers ignore it.
        w.write_u32_le((caps >> 32) as u32);

        w.write_null_str(self.user);

        if caps & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(&self.auth_response);
        } else {
            w.write_u8(self.auth_response.len() as u8);
            w.write_bytes(&self.auth_response);
        }

        if caps & capabilities::CONNECT_WITH_DB != 0 {
            w.write_null_str(self.database.unwrap_or(""));
        }

        if caps & capabilities::PLUGIN_AUTH != 0 {
            w.write_null_str(self.auth_plugin);
        }

        if caps & capabilities::CONNECT_ATTRS != 0 {
            // Attributes are written after a mark so the lenenc length
            // prefix can be fixed up once the block size is known.
            w.mark();
            for (key, value) in self.connection_attributes {
                w.write_lenenc_str(key);
                w.write_lenenc_str(value);
            }
            let block = w.reset_mark();
            w.write_lenenc_bytes(&block);
        }

        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;

    #[test]
    fn query_payload() {
        let msg = ClientMessage::Query {
            sql: "SELECT 1".into(),
        };
        let payload = msg.payload();
        assert_eq!(payload[0], 0x03);
        assert_eq!(&payload[1..], b"SELECT 1");
        assert_eq!(msg.expected_responses(), 1);
        assert!(msg.redoable());
    }

    #[test]
    fn quit_and_close_expect_no_response() {
        assert_eq!(ClientMessage::Quit.expected_responses(), 0);
        assert_eq!(
            ClientMessage::CloseStatement { statement_id: 3 }.expected_responses(),
            0
        );
        assert_eq!(
            ClientMessage::LongData {
                statement_id: 3,
                param_index: 0,
                data: vec![1],
            }
            .expected_responses(),
            0
        );
    }

    #[test]
    fn execute_payload_layout() {
        let msg = ClientMessage::Execute {
            statement_id: 1,
            sql: "SELECT ?".into(),
            params: vec![ParamValue::of(42_i32), ParamValue::of("hello")],
        };
        let p = msg.payload();
        assert_eq!(p[0], 0x17);
        assert_eq!(u32::from_le_bytes([p[1], p[2], p[3], p[4]]), 1);
        assert_eq!(p[5], 0x00); // flags
        assert_eq!(u32::from_le_bytes([p[6], p[7], p[8], p[9]]), 1);
        assert_eq!(p[10], 0x00); // null bitmap, no NULLs
        assert_eq!(p[11], 1); // new params bound
        assert_eq!(p[12], crate::codec::DataType::BigInt as u8);
        assert_eq!(p[13], 0x00);
        assert_eq!(p[14], crate::codec::DataType::VarString as u8);
        assert_eq!(p[15], 0x00);
        // first value: i64 42 little-endian
        assert_eq!(&p[16..24], &42u64.to_le_bytes());
        // second value: lenenc "hello"
        assert_eq!(p[24], 5);
        assert_eq!(&p[25..30], b"hello");
    }

    #[test]
    fn execute_null_bitmap() {
        let msg = ClientMessage::Execute {
            statement_id: 9,
            sql: "SELECT ?, ?".into(),
            params: vec![ParamValue::Null, ParamValue::of(1_i32)],
        };
        let p = msg.payload();
        assert_eq!(p[10], 0b0000_0001);
    }

    #[test]
    fn statement_id_substitution() {
        let msg = ClientMessage::Execute {
            statement_id: 5,
            sql: "UPDATE t SET a=?".into(),
            params: vec![ParamValue::of(1_i32)],
        };
        let replayed = msg.with_statement_id(11);
        match replayed {
            ClientMessage::Execute { statement_id, .. } => assert_eq!(statement_id, 11),
            other => panic!("unexpected variant {other:?}"),
        }
        assert_eq!(msg.prepared_sql(), Some("UPDATE t SET a=?"));
    }

    #[test]
    fn long_data_payload() {
        let msg = ClientMessage::LongData {
            statement_id: 2,
            param_index: 1,
            data: b"chunk".to_vec(),
        };
        let p = msg.payload();
        assert_eq!(p[0], 0x18);
        assert_eq!(u32::from_le_bytes([p[1], p[2], p[3], p[4]]), 2);
        assert_eq!(u16::from_le_bytes([p[5], p[6]]), 1);
        assert_eq!(&p[7..], b"chunk");
    }

    #[test]
    fn handshake_response_layout() {
        let attrs = BTreeMap::from([("program_name".to_owned(), "marlin".to_owned())]);
        let caps = capabilities::MANDATORY
            | capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA
            | capabilities::CONNECT_WITH_DB
            | capabilities::CONNECT_ATTRS;
        let response = HandshakeResponse {
            capabilities: caps,
            collation: 45,
            user: "app",
            auth_response: vec![0xAA; 20],
            database: Some("orders"),
            auth_plugin: "mysql_native_password",
            connection_attributes: &attrs,
        };
        let p = response.payload();
        let mut r = PacketReader::new(&p);
        assert_eq!(u64::from(r.read_u32_le().unwrap()), caps & 0xFFFF_FFFF);
        assert_eq!(r.read_u32_le().unwrap(), ANNOUNCED_MAX_PACKET);
        assert_eq!(r.read_u8().unwrap(), 45);
        r.skip(23);
        assert_eq!(r.read_null_string().as_deref(), Some("app"));
        assert_eq!(r.read_lenenc_bytes().unwrap(), &[0xAA; 20][..]);
        assert_eq!(r.read_null_string().as_deref(), Some("orders"));
        assert_eq!(
            r.read_null_string().as_deref(),
            Some("mysql_native_password")
        );
        let attr_block = r.read_lenenc_bytes().unwrap();
        let mut sub = PacketReader::new(attr_block);
        assert_eq!(sub.read_lenenc_string().as_deref(), Some("program_name"));
        assert_eq!(sub.read_lenenc_string().as_deref(), Some("marlin"));
        assert!(r.is_empty());
    }
}
