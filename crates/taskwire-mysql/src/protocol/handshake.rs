//! Connection-phase packets.
//!
//! The server greeting is either a protocol-10 handshake (capability
//! negotiation, auth plugins) or the legacy protocol-9 one (scramble only).
//! Both are represented by one [`HandshakePacket`] sum type.

#![allow(clippy::cast_possible_truncation)]

use taskwire_core::{AuthenticationError, AuthenticationErrorKind, Error, Result};

use super::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_SECURE_CONNECTION,
};
use super::reader::PacketReader;
use super::writer::PacketWriter;

/// Legacy protocol-9 greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeV9 {
    pub server_version: String,
    pub thread_id: u32,
    /// 8-byte scramble
    pub scramble: Vec<u8>,
}

/// Protocol-10 greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeV10 {
    pub server_version: String,
    pub thread_id: u32,
    /// Auth-plugin seed (both parts concatenated, trailing NUL removed)
    pub auth_plugin_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Present when the server announces CLIENT_PLUGIN_AUTH
    pub auth_plugin_name: Option<String>,
}

/// The server greeting, parsed once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePacket {
    V9(HandshakeV9),
    V10(HandshakeV10),
}

impl HandshakePacket {
    /// Parse the first packet the server sends.
    ///
    /// An ERR packet in place of a greeting (too many connections, host
    /// blocked) is an authentication failure.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        match reader.peek() {
            Some(10) => {
                reader.read_u8("protocol version")?;
                parse_v10(&mut reader).map(HandshakePacket::V10)
            }
            Some(9) => {
                reader.read_u8("protocol version")?;
                parse_v9(&mut reader).map(HandshakePacket::V9)
            }
            Some(0xFF) => {
                let err = reader.parse_err_packet()?;
                Err(Error::Authentication(AuthenticationError {
                    kind: AuthenticationErrorKind::Rejected,
                    message: err.error_message,
                    code: Some(err.error_code),
                    sqlstate: Some(err.sql_state),
                }))
            }
            Some(other) => Err(Error::unsupported(format!(
                "unsupported protocol version {other}"
            ))),
            None => Err(Error::protocol("empty handshake packet")),
        }
    }

    pub fn protocol_version(&self) -> u8 {
        match self {
            HandshakePacket::V9(_) => 9,
            HandshakePacket::V10(_) => 10,
        }
    }

    pub fn server_version(&self) -> &str {
        match self {
            HandshakePacket::V9(h) => &h.server_version,
            HandshakePacket::V10(h) => &h.server_version,
        }
    }

    pub fn thread_id(&self) -> u32 {
        match self {
            HandshakePacket::V9(h) => h.thread_id,
            HandshakePacket::V10(h) => h.thread_id,
        }
    }

    /// Seed bytes for the auth plugin.
    pub fn seed(&self) -> &[u8] {
        match self {
            HandshakePacket::V9(h) => &h.scramble,
            HandshakePacket::V10(h) => &h.auth_plugin_data,
        }
    }

    /// Server capability flags; protocol 9 negotiates none.
    pub fn capabilities(&self) -> u32 {
        match self {
            HandshakePacket::V9(_) => 0,
            HandshakePacket::V10(h) => h.capabilities,
        }
    }

    pub fn charset(&self) -> Option<u8> {
        match self {
            HandshakePacket::V9(_) => None,
            HandshakePacket::V10(h) => Some(h.charset),
        }
    }

    pub fn status_flags(&self) -> u16 {
        match self {
            HandshakePacket::V9(_) => 0,
            HandshakePacket::V10(h) => h.status_flags,
        }
    }

    pub fn auth_plugin_name(&self) -> Option<&str> {
        match self {
            HandshakePacket::V9(_) => None,
            HandshakePacket::V10(h) => h.auth_plugin_name.as_deref(),
        }
    }
}

fn parse_v9(reader: &mut PacketReader<'_>) -> Result<HandshakeV9> {
    let server_version = reader.read_null_string();
    let thread_id = reader.read_u32_le("thread id")?;
    let scramble = reader.read_null_bytes().to_vec();
    Ok(HandshakeV9 {
        server_version,
        thread_id,
        scramble,
    })
}

fn parse_v10(reader: &mut PacketReader<'_>) -> Result<HandshakeV10> {
    let server_version = reader.read_null_string();
    let thread_id = reader.read_u32_le("thread id")?;
    let mut auth_plugin_data = reader.read_bytes(8, "auth plugin data part 1")?.to_vec();
    reader.skip(1, "filler")?;
    let caps_lower = reader.read_u16_le("capability flags")?;

    // Servers older than 4.1 may end the greeting here.
    if reader.is_empty() {
        return Ok(HandshakeV10 {
            server_version,
            thread_id,
            auth_plugin_data,
            capabilities: u32::from(caps_lower),
            charset: 0,
            status_flags: 0,
            auth_plugin_name: None,
        });
    }

    let charset = reader.read_u8("character set")?;
    let status_flags = reader.read_u16_le("status flags")?;
    let caps_upper = reader.read_u16_le("capability flags (upper)")?;
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
    let auth_data_len = reader.read_u8("auth plugin data length")?;
    reader.skip(10, "reserved")?;

    if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let len2 = usize::from(auth_data_len).saturating_sub(8).max(13);
        let len2 = len2.min(reader.remaining());
        let part2 = reader.read_bytes(len2, "auth plugin data part 2")?;
        let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
        auth_plugin_data.extend_from_slice(part2);
    }

    let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        Some(reader.read_null_string())
    } else {
        None
    };

    Ok(HandshakeV10 {
        server_version,
        thread_id,
        auth_plugin_data,
        capabilities,
        charset,
        status_flags,
        auth_plugin_name,
    })
}

/// Fields of a handshake response that do not depend on the wire format.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// HandshakeResponse41 payload.
    pub fn encode_41(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.collation);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
        }

        if caps & CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }
        if caps & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if caps & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }
        writer.into_bytes()
    }

    /// HandshakeResponse320 payload, used without CLIENT_PROTOCOL_41.
    pub fn encode_320(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(64);
        writer.write_u16_le((self.capabilities & 0xFFFF) as u16);
        writer.write_u24_le(self.max_packet_size.min(0xFF_FFFF));
        writer.write_null_string(self.user);
        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
            writer.write_null_string(self.database.unwrap_or(""));
        } else {
            writer.write_bytes(self.auth_response);
        }
        writer.into_bytes()
    }
}

/// SSLRequest payload: the first 32 bytes of HandshakeResponse41.
pub fn build_ssl_request(capabilities: u32, max_packet_size: u32, collation: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(capabilities);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(collation);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// A parsed AuthSwitchRequest (0xFE during authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub seed: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse the payload, including the 0xFE header.
    ///
    /// A bare 0xFE is the pre-4.1 "old auth switch": the client must answer
    /// with the `mysql_old_password` scramble of the original seed.
    pub fn parse(payload: &[u8], original_seed: &[u8]) -> Self {
        let mut reader = PacketReader::new(payload.get(1..).unwrap_or_default());
        if reader.is_empty() {
            return Self {
                plugin: crate::auth::plugins::MYSQL_OLD_PASSWORD.to_string(),
                seed: original_seed.get(..8).unwrap_or(original_seed).to_vec(),
            };
        }
        let plugin = reader.read_null_string();
        let seed = reader.read_rest();
        let seed = seed.strip_suffix(&[0]).unwrap_or(seed).to_vec();
        Self { plugin, seed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::{CLIENT_PROTOCOL_41, CLIENT_SSL};

    fn v10_greeting(capabilities: u32, plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(42);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le((capabilities & 0xFFFF) as u16);
        w.write_u8(255);
        w.write_u16_le(0x0002);
        w.write_u16_le((capabilities >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(b"ijklmnopqrst\0");
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn parse_v10_greeting() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH | CLIENT_SSL;
        let packet = HandshakePacket::parse(&v10_greeting(caps, "caching_sha2_password")).unwrap();
        assert_eq!(packet.protocol_version(), 10);
        assert_eq!(packet.server_version(), "8.0.36");
        assert_eq!(packet.thread_id(), 42);
        assert_eq!(packet.seed(), b"abcdefghijklmnopqrst");
        assert_eq!(packet.capabilities(), caps);
        assert_eq!(packet.charset(), Some(255));
        assert_eq!(packet.status_flags(), 0x0002);
        assert_eq!(packet.auth_plugin_name(), Some("caching_sha2_password"));
    }

    #[test]
    fn parse_v9_greeting() {
        let mut w = PacketWriter::new();
        w.write_u8(9);
        w.write_null_string("3.22.32");
        w.write_u32_le(7);
        w.write_null_string("12345678");
        let packet = HandshakePacket::parse(w.as_bytes()).unwrap();
        assert_eq!(packet.protocol_version(), 9);
        assert_eq!(packet.seed(), b"12345678");
        assert_eq!(packet.capabilities(), 0);
        assert_eq!(packet.auth_plugin_name(), None);
    }

    #[test]
    fn err_instead_of_greeting() {
        let mut payload = vec![0xFF, 0x10, 0x04];
        payload.extend_from_slice(b"Too many connections");
        match HandshakePacket::parse(&payload) {
            Err(Error::Authentication(e)) => {
                assert_eq!(e.code, Some(1040));
                assert_eq!(e.kind, AuthenticationErrorKind::Rejected);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_protocol_version() {
        assert!(matches!(
            HandshakePacket::parse(&[11, 0]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn ssl_request_is_32_bytes() {
        let req = build_ssl_request(CLIENT_SSL | CLIENT_PROTOCOL_41, 0x0100_0000, 255);
        assert_eq!(req.len(), 32);
        assert_eq!(&req[..4], &(CLIENT_SSL | CLIENT_PROTOCOL_41).to_le_bytes());
        assert_eq!(req[8], 255);
    }

    #[test]
    fn response_41_layout() {
        let attrs = vec![("_client_name".to_string(), "taskwire".to_string())];
        let response = HandshakeResponse {
            capabilities: CLIENT_PROTOCOL_41
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH
                | CLIENT_CONNECT_WITH_DB
                | CLIENT_CONNECT_ATTRS,
            max_packet_size: 1024,
            collation: 45,
            user: "app",
            auth_response: &[1, 2, 3],
            database: Some("shop"),
            auth_plugin: "mysql_native_password",
            attributes: &attrs,
        };
        let bytes = response.encode_41();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u32_le("caps").unwrap();
        assert_eq!(reader.read_u32_le("max").unwrap(), 1024);
        assert_eq!(reader.read_u8("collation").unwrap(), 45);
        reader.skip(23, "reserved").unwrap();
        assert_eq!(reader.read_null_string(), "app");
        assert_eq!(reader.read_u8("len").unwrap(), 3);
        assert_eq!(reader.read_bytes(3, "auth").unwrap(), &[1, 2, 3]);
        assert_eq!(reader.read_null_string(), "shop");
        assert_eq!(reader.read_null_string(), "mysql_native_password");
        let attrs = reader.read_lenenc_bytes("attrs").unwrap();
        assert_eq!(attrs[0] as usize, "_client_name".len());
        assert!(reader.is_empty());
    }

    #[test]
    fn response_320_layout() {
        let response = HandshakeResponse {
            capabilities: CLIENT_CONNECT_WITH_DB | 1,
            max_packet_size: 0x0100_0000,
            collation: 8,
            user: "old",
            auth_response: b"scrambl8",
            database: Some("db"),
            auth_plugin: "",
            attributes: &[],
        };
        let bytes = response.encode_320();
        assert_eq!(&bytes[..2], &[0x09, 0x00]);
        assert_eq!(&bytes[2..5], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[5..], b"old\0scrambl8\0db\0");
    }

    #[test]
    fn auth_switch_parsing() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(b"01234567890123456789\0");
        let switch = AuthSwitchRequest::parse(&payload, b"ignored");
        assert_eq!(switch.plugin, "mysql_native_password");
        assert_eq!(switch.seed, b"01234567890123456789");

        let old = AuthSwitchRequest::parse(&[0xFE], b"abcdefghijkl");
        assert_eq!(old.plugin, "mysql_old_password");
        assert_eq!(old.seed, b"abcdefgh");
    }
}
