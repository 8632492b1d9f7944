//! Fixtures for the unit tests. Server traffic comes from the script
//! the integration tests share.

use std::sync::{Arc, Mutex};

use taskwire_core::ConsumerError;

use crate::protocol::handshake::HandshakeV10;
use crate::protocol::{HandshakePacket, PacketHeader};
use crate::session::SessionState;
use crate::task::{CancelFlag, ResultRow, ResultSink, ResultStates};
use crate::types::{ColumnMeta, FieldType};

pub(crate) use crate::server_script::{Server, greeting};

pub(crate) fn column(name: &str, column_type: FieldType) -> ColumnMeta {
    let stringy = matches!(
        column_type,
        FieldType::VarChar | FieldType::VarString | FieldType::String | FieldType::Json
    );
    ColumnMeta {
        catalog: "def".to_string(),
        schema: "test".to_string(),
        table: "t".to_string(),
        org_table: "t".to_string(),
        alias: name.to_string(),
        org_name: name.to_string(),
        collation: if stringy { 255 } else { 63 },
        column_length: 11,
        column_type,
        flags: 0,
        decimals: 0,
    }
}

/// An authenticated session with the given negotiated capabilities.
pub(crate) fn session_with(capabilities: u32) -> SessionState {
    let mut session = SessionState::new(255, 1 << 24);
    let handshake = HandshakePacket::V10(HandshakeV10 {
        server_version: "8.0.36".to_string(),
        thread_id: 7,
        auth_plugin_data: vec![7; 20],
        capabilities,
        charset: 255,
        status_flags: 0,
        auth_plugin_name: Some("mysql_native_password".to_string()),
    });
    session.apply_handshake(handshake, capabilities);
    session
}

/// Split client output back into (header, payload) frames.
pub(crate) fn split_frames(bytes: &[u8]) -> Vec<(PacketHeader, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while rest.len() >= PacketHeader::SIZE {
        let header = PacketHeader::from_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let end = PacketHeader::SIZE + header.payload_length as usize;
        frames.push((header, rest[PacketHeader::SIZE..end].to_vec()));
        rest = &rest[end..];
    }
    assert!(rest.is_empty(), "trailing partial frame");
    frames
}

/// Sink that records everything and can be told to fail or stall.
#[derive(Default)]
pub(crate) struct CollectingSink {
    pub columns: Vec<Arc<[ColumnMeta]>>,
    pub rows: Vec<ResultRow>,
    pub states: Vec<ResultStates>,
    /// Fail once this many rows were accepted
    pub fail_after: Option<usize>,
    /// Report no demand once this many rows were accepted
    pub demand: Option<usize>,
    pub mirror: Arc<Mutex<Vec<ResultRow>>>,
    /// Raise this flag once this many rows were accepted
    pub cancel_on_row: Option<(usize, CancelFlag)>,
}

impl CollectingSink {
    /// Rows as seen from outside once the sink has been moved into a task.
    pub(crate) fn shared_rows(&self) -> Arc<Mutex<Vec<ResultRow>>> {
        Arc::clone(&self.mirror)
    }
}

impl ResultSink for CollectingSink {
    fn on_columns(&mut self, _result_index: usize, columns: &Arc<[ColumnMeta]>) -> Result<(), ConsumerError> {
        self.columns.push(Arc::clone(columns));
        Ok(())
    }

    fn on_row(&mut self, row: ResultRow) -> Result<(), ConsumerError> {
        if self.fail_after.is_some_and(|n| self.rows.len() >= n) {
            return Err(ConsumerError::new("sink refused row"));
        }
        if let Ok(mut mirror) = self.mirror.lock() {
            mirror.push(row.clone());
        }
        self.rows.push(row);
        if let Some((n, flag)) = &self.cancel_on_row {
            if self.rows.len() == *n {
                flag.cancel();
            }
        }
        Ok(())
    }

    fn on_states(&mut self, states: ResultStates) -> Result<(), ConsumerError> {
        self.states.push(states);
        Ok(())
    }

    fn has_demand(&self) -> bool {
        self.demand.map_or(true, |d| self.rows.len() < d)
    }
}
