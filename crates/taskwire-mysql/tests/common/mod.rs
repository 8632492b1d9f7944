//! Synthetic server traffic shared by the integration tests.

#![allow(dead_code)]

use taskwire_mysql::protocol::capabilities::DEFAULT_CLIENT_FLAGS;
use taskwire_mysql::protocol::{CumulateBuffer, PacketHeader};
use taskwire_mysql::{AuthStep, AuthenticateTask, MySqlConfig, ProtocolEngine, SessionState};

mod server;

pub use server::{AUTOCOMMIT, CURSOR_EXISTS, LAST_ROW_SENT, MORE_RESULTS, Server, greeting};

/// Client output split into (sequence id, payload).
pub fn frames(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while rest.len() >= PacketHeader::SIZE {
        let header = PacketHeader::from_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let end = PacketHeader::SIZE + header.payload_length as usize;
        out.push((header.sequence_id, rest[PacketHeader::SIZE..end].to_vec()));
        rest = &rest[end..];
    }
    assert!(rest.is_empty(), "trailing partial frame");
    out
}

pub fn config() -> MySqlConfig {
    MySqlConfig::new().user("app").password("secret").database("app")
}

/// Run the connection phase against a server announcing `server_caps`
/// and return an engine over the resulting session.
pub fn connect_engine(config: &MySqlConfig, server_caps: u32) -> ProtocolEngine {
    let mut task = AuthenticateTask::new(config);
    let mut buf = CumulateBuffer::new();
    let mut hello = Server::new(0);
    hello.packet(greeting(server_caps, "mysql_native_password"));
    buf.extend(&hello.into_bytes());
    match task.decode(&mut buf).expect("greeting accepted") {
        AuthStep::Write(_) => {}
        other => panic!("expected handshake response, got {other:?}"),
    }

    let mut ok = Server::new(2);
    ok.ok(0, 0, AUTOCOMMIT);
    buf.extend(&ok.into_bytes());
    match task.decode(&mut buf).expect("auth ok accepted") {
        AuthStep::Done(result) => ProtocolEngine::new(SessionState::established(config, result)),
        other => panic!("expected authentication to finish, got {other:?}"),
    }
}

/// Full-featured modern server.
pub fn modern_server() -> u32 {
    DEFAULT_CLIENT_FLAGS | taskwire_mysql::protocol::capabilities::CLIENT_CONNECT_WITH_DB
}

pub fn drain(engine: &mut ProtocolEngine) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| engine.poll_transmit()).collect()
}
