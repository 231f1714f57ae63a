//! Positional reader over a packet payload.
//!
//! Provides the protocol's primitive decodings: fixed-width little-endian
//! integers, length-encoded integers and strings, NUL-terminated strings,
//! and zero-copy slicing.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// NULL marker in text rows and lenenc positions.
pub const NULL_MARKER: u8 = 0xFB;

#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Reposition; used by offset-indexed column definitions.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(3)?;
        Some(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Some(u64::from_le_bytes(arr))
    }

    /// Length-encoded integer: 1-byte value for 0..=0xFA, or a prefix byte
    /// selecting a 2, 3 or 8-byte little-endian value. `0xFB` is the NULL
    /// marker and yields `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            v @ 0x00..=0xFA => Some(u64::from(v)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            _ => None,
        }
    }

    /// Length-encoded byte run; `None` for the NULL marker or truncation.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        let bytes = self.read_lenenc_bytes()?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Skip a length-encoded value (integer prefix plus body).
    pub fn skip_lenenc(&mut self) -> bool {
        match self.read_lenenc_int() {
            Some(len) => self.skip(len as usize),
            None => false,
        }
    }

    pub fn read_null_terminated(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        let nul = self.data[start..].iter().position(|&b| b == 0)?;
        let bytes = &self.data[start..start + nul];
        self.pos = start + nul + 1;
        Some(bytes)
    }

    pub fn read_null_string(&mut self) -> Option<String> {
        self.read_null_terminated()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK body, consuming the 0x00 header byte when present.
    pub fn parse_ok_packet(&mut self, session_track: bool) -> Option<OkPacket> {
        if self.peek() == Some(0x00) || self.peek() == Some(0xFE) {
            self.skip(1);
        }
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;

        let session_state = if session_track && self.remaining() > 0 {
            // info string, then the state-change block
            self.skip_lenenc();
            if status_flags & crate::protocol::server_status::SESSION_STATE_CHANGED != 0 {
                self.read_lenenc_bytes().map(<[u8]>::to_vec)
            } else {
                None
            }
        } else {
            None
        };

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            session_state,
        })
    }

    /// Parse an ERR body, consuming the 0xFF header byte when present.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }
        let code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            "HY000".to_owned()
        };
        let message = self.read_rest_string();
        Some(ErrPacket {
            code,
            sql_state,
            message,
        })
    }

    /// Parse an EOF body, consuming the 0xFE header byte when present.
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;
        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}
