//! MySQL payload reading utilities.
//!
//! `PacketReader` walks a single reassembled payload. Every read is bounds
//! checked; running past the end of a payload is a protocol error naming
//! the field that was being read.

#![allow(clippy::cast_possible_truncation)]

use taskwire_core::{Error, ProtocolError, Result};

use crate::protocol::capabilities::{CLIENT_PROTOCOL_41, CLIENT_TRANSACTIONS};
use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// Marker byte of a NULL length-encoded value.
pub const NULL_MARKER: u8 = 0xFB;

/// A reader over one packet payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn truncated(field: &str, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("packet truncated while reading {field}"),
        raw_data: Some(data.to_vec()),
        source: None,
    })
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the payload.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the payload.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read exactly `N` bytes.
    fn read_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.read_array::<1>(field)?[0])
    }

    pub fn read_u16_le(&mut self, field: &str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_u24_le(&mut self, field: &str) -> Result<u32> {
        let [a, b, c] = self.read_array(field)?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_u64_le(&mut self, field: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array(field)?))
    }

    /// Read a length-encoded integer; `None` is the NULL marker.
    ///
    /// MySQL uses a variable-length integer encoding:
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB: NULL (only meaningful in text rows)
    pub fn read_lenenc_int_or_null(&mut self, field: &str) -> Result<Option<u64>> {
        let first = self.read_u8(field)?;
        match first {
            0x00..=0xFA => Ok(Some(u64::from(first))),
            NULL_MARKER => Ok(None),
            0xFC => self.read_u16_le(field).map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le(field).map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le(field).map(Some),
            0xFF => Err(Error::protocol(format!(
                "invalid length-encoded integer prefix 0xFF in {field}"
            ))),
        }
    }

    /// Read a length-encoded integer that must not be NULL.
    pub fn read_lenenc_int(&mut self, field: &str) -> Result<u64> {
        self.read_lenenc_int_or_null(field)?
            .ok_or_else(|| Error::protocol(format!("unexpected NULL in {field}")))
    }

    /// Read a length-encoded byte slice without copying.
    pub fn read_lenenc_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int(field)?;
        let len = usize::try_from(len).map_err(|_| truncated(field, self.data))?;
        self.read_bytes(len, field)
    }

    /// Read a length-encoded value that may be NULL (text row cells).
    pub fn read_lenenc_bytes_or_null(&mut self, field: &str) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int_or_null(field)? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len).map_err(|_| truncated(field, self.data))?;
                self.read_bytes(len, field).map(Some)
            }
        }
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self, field: &str) -> Result<String> {
        self.read_lenenc_bytes(field)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a NUL-terminated string; a missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> String {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        s
    }

    /// Read a NUL-terminated byte string.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        &rest[..end]
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize, field: &str) -> Result<String> {
        self.read_bytes(len, field)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(truncated(field, self.data));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize, field: &str) -> Result<()> {
        self.read_bytes(n, field).map(|_| ())
    }

    /// Parse an OK packet (header byte 0x00, or 0xFE when it replaces EOF).
    ///
    /// Status flags and warnings are present with CLIENT_PROTOCOL_41; pre-4.1
    /// servers send only the status flags and only with CLIENT_TRANSACTIONS.
    pub fn parse_ok_packet(&mut self, capabilities: u32) -> Result<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.pos += 1;
        }

        let affected_rows = self.read_lenenc_int("OK affected rows")?;
        let last_insert_id = self.read_lenenc_int("OK last insert id")?;
        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            (
                self.read_u16_le("OK status flags")?,
                self.read_u16_le("OK warnings")?,
            )
        } else if capabilities & CLIENT_TRANSACTIONS != 0 {
            (self.read_u16_le("OK status flags")?, 0)
        } else {
            (0, 0)
        };
        let info = self.read_rest_string();

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet.
    ///
    /// The `#` marker and 5-byte SQL state are only present with
    /// CLIENT_PROTOCOL_41; handshake-time errors may omit them.
    pub fn parse_err_packet(&mut self) -> Result<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.pos += 1;
        }

        let error_code = self.read_u16_le("ERR code")?;
        let sql_state = if self.peek() == Some(b'#') {
            self.pos += 1;
            self.read_string(5, "ERR sql state")?
        } else {
            "HY000".to_string()
        };
        let error_message = self.read_rest_string();

        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse a protocol-41 EOF packet.
    pub fn parse_eof_packet(&mut self) -> Result<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.pos += 1;
        }

        Ok(EofPacket {
            warnings: self.read_u16_le("EOF warnings")?,
            status_flags: self.read_u16_le("EOF status flags")?,
        })
    }
}
