//! Scripted server traffic, shared by the unit and integration tests.

use taskwire_mysql::FieldType;
use taskwire_mysql::protocol::{PacketHeader, PacketWriter};

pub const AUTOCOMMIT: u16 = 0x0002;
pub const MORE_RESULTS: u16 = 0x0008;
pub const CURSOR_EXISTS: u16 = 0x0040;
pub const LAST_ROW_SENT: u16 = 0x0080;

/// Server packets framed with consecutive sequence ids.
pub struct Server {
    next: u8,
    bytes: Vec<u8>,
}

impl Server {
    pub fn new(start: u8) -> Self {
        Self {
            next: start,
            bytes: Vec::new(),
        }
    }

    pub fn packet(&mut self, payload: impl AsRef<[u8]>) -> &mut Self {
        let payload = payload.as_ref();
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            sequence_id: self.next,
        };
        self.bytes.extend_from_slice(&header.to_bytes());
        self.bytes.extend_from_slice(payload);
        self.next = self.next.wrapping_add(1);
        self
    }

    pub fn ok(&mut self, affected: u64, last_insert_id: u64, status: u16) -> &mut Self {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(last_insert_id);
        w.write_u16_le(status);
        w.write_u16_le(0);
        self.packet(w.into_bytes())
    }

    /// OK with the 0xFE header, ending rows under CLIENT_DEPRECATE_EOF.
    pub fn ok_eof(&mut self, status: u16) -> &mut Self {
        self.packet([0xFE, 0, 0, status as u8, (status >> 8) as u8, 0, 0])
    }

    pub fn eof(&mut self, status: u16) -> &mut Self {
        self.packet([0xFE, 0, 0, status as u8, (status >> 8) as u8])
    }

    pub fn err(&mut self, code: u16, sqlstate: &str, message: &str) -> &mut Self {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(sqlstate.as_bytes());
        w.write_bytes(message.as_bytes());
        self.packet(w.into_bytes())
    }

    pub fn column_count(&mut self, count: u64) -> &mut Self {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(count);
        self.packet(w.into_bytes())
    }

    /// Column definition in table `t`; text types carry utf8mb4, the rest binary.
    pub fn column(&mut self, name: &str, field_type: FieldType) -> &mut Self {
        let collation: u16 = match field_type {
            FieldType::VarChar | FieldType::VarString | FieldType::String | FieldType::Json => 255,
            _ => 63,
        };
        let mut w = PacketWriter::new();
        for part in ["def", "app", "t", "t", name, name] {
            w.write_lenenc_string(part);
        }
        w.write_u8(0x0c);
        w.write_u16_le(collation);
        w.write_u32_le(11);
        w.write_u8(field_type as u8);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_zeros(2);
        self.packet(w.into_bytes())
    }

    pub fn text_row(&mut self, values: &[Option<&str>]) -> &mut Self {
        let mut w = PacketWriter::new();
        for value in values {
            match value {
                Some(text) => w.write_lenenc_string(text),
                None => w.write_u8(0xFB),
            }
        }
        self.packet(w.into_bytes())
    }

    /// Binary row of one non-null INT column.
    pub fn binary_int_row(&mut self, value: i32) -> &mut Self {
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&value.to_le_bytes());
        self.packet(payload)
    }

    /// COM_STMT_PREPARE_OK header.
    pub fn prepare_ok(&mut self, statement_id: u32, columns: u16, params: u16) -> &mut Self {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(statement_id);
        w.write_u16_le(columns);
        w.write_u16_le(params);
        w.write_u8(0);
        w.write_u16_le(0);
        self.packet(w.into_bytes())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Protocol-10 greeting announcing `capabilities`, seed of twenty 7s.
pub fn greeting(capabilities: u32, plugin: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36");
    w.write_u32_le(42);
    w.write_bytes(&[7; 8]);
    w.write_u8(0);
    w.write_u16_le((capabilities & 0xFFFF) as u16);
    w.write_u8(255);
    w.write_u16_le(AUTOCOMMIT);
    w.write_u16_le((capabilities >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&[7; 12]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}
