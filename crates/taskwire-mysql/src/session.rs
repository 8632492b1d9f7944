//! Per-connection protocol state shared by every task.
//!
//! Populated once by the handshake, then refreshed only from the status
//! flags of OK and EOF packets while a task is active. Tasks read it
//! through `&SessionState`; only the engine hands out `&mut`.

use crate::collation::CollationMap;
use crate::config::MySqlConfig;
use crate::protocol::HandshakePacket;
use crate::protocol::capabilities::{
    CLIENT_DEPRECATE_EOF, CLIENT_MULTI_STATEMENTS, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41,
    CLIENT_SSL,
};
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
};
use crate::task::AuthenticateResult;

pub fn supports_ssl(capabilities: u32) -> bool {
    capabilities & CLIENT_SSL != 0
}

pub fn supports_multi_statement(capabilities: u32) -> bool {
    capabilities & CLIENT_MULTI_STATEMENTS != 0
}

pub fn supports_protocol41(capabilities: u32) -> bool {
    capabilities & CLIENT_PROTOCOL_41 != 0
}

pub fn supports_deprecate_eof(capabilities: u32) -> bool {
    capabilities & CLIENT_DEPRECATE_EOF != 0
}

pub fn supports_plugin_auth(capabilities: u32) -> bool {
    capabilities & CLIENT_PLUGIN_AUTH != 0
}

/// Negotiated connection state.
#[derive(Debug, Clone)]
pub struct SessionState {
    capabilities: u32,
    server_status: u16,
    collation: u16,
    max_packet_size: u32,
    authenticated: bool,
    handshake: Option<HandshakePacket>,
    collations: CollationMap,
}

impl SessionState {
    /// Fresh state for a connection that has not authenticated yet.
    pub fn new(collation: u16, max_packet_size: u32) -> Self {
        Self {
            capabilities: 0,
            server_status: 0,
            collation,
            max_packet_size,
            authenticated: false,
            handshake: None,
            collations: CollationMap::new(),
        }
    }

    /// State of a connection whose handshake has just succeeded.
    pub fn established(config: &MySqlConfig, result: AuthenticateResult) -> Self {
        let mut session = Self::new(config.collation, config.max_packet_size);
        session.apply_handshake(result.handshake, result.negotiated_capability);
        session.update_status(result.server_status);
        session
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn collation(&self) -> u16 {
        self.collation
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn handshake(&self) -> Option<&HandshakePacket> {
        self.handshake.as_ref()
    }

    pub fn collations(&self) -> &CollationMap {
        &self.collations
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.server_status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn more_results(&self) -> bool {
        self.server_status & SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.handshake.as_ref().map(HandshakePacket::thread_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.handshake.as_ref().map(HandshakePacket::server_version)
    }

    pub fn supports_ssl(&self) -> bool {
        supports_ssl(self.capabilities)
    }

    pub fn supports_multi_statement(&self) -> bool {
        supports_multi_statement(self.capabilities)
    }

    pub fn supports_protocol41(&self) -> bool {
        supports_protocol41(self.capabilities)
    }

    pub fn supports_deprecate_eof(&self) -> bool {
        supports_deprecate_eof(self.capabilities)
    }

    /// Freeze the handshake outcome.
    pub(crate) fn apply_handshake(&mut self, handshake: HandshakePacket, negotiated: u32) {
        self.server_status = handshake.status_flags();
        self.handshake = Some(handshake);
        self.capabilities = negotiated;
        self.authenticated = true;
    }

    /// Refresh status flags from an OK/EOF packet.
    pub(crate) fn update_status(&mut self, status: u16) {
        self.server_status = status;
    }

    /// Connection is going away.
    pub(crate) fn mark_closed(&mut self) {
        self.authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HandshakeV10;

    fn v10(capabilities: u32) -> HandshakePacket {
        HandshakePacket::V10(HandshakeV10 {
            server_version: "8.0.36".to_string(),
            thread_id: 7,
            auth_plugin_data: vec![1; 20],
            capabilities,
            charset: 255,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: Some("caching_sha2_password".to_string()),
        })
    }

    #[test]
    fn capability_helpers() {
        assert!(supports_ssl(CLIENT_SSL));
        assert!(!supports_ssl(CLIENT_PROTOCOL_41));
        assert!(supports_multi_statement(CLIENT_MULTI_STATEMENTS));
        assert!(supports_protocol41(CLIENT_PROTOCOL_41 | CLIENT_SSL));
        assert!(supports_deprecate_eof(CLIENT_DEPRECATE_EOF));
        assert!(supports_plugin_auth(CLIENT_PLUGIN_AUTH));
        assert!(!supports_plugin_auth(0));
    }

    #[test]
    fn handshake_populates_state() {
        let mut session = SessionState::new(255, 1 << 24);
        assert!(!session.is_authenticated());
        assert_eq!(session.thread_id(), None);

        session.apply_handshake(v10(u32::MAX), CLIENT_PROTOCOL_41);
        assert!(session.is_authenticated());
        assert!(session.supports_protocol41());
        assert!(!session.supports_ssl());
        assert!(session.autocommit());
        assert_eq!(session.thread_id(), Some(7));
        assert_eq!(session.server_version(), Some("8.0.36"));
    }

    #[test]
    fn status_refresh() {
        let mut session = SessionState::new(255, 1 << 24);
        session.update_status(SERVER_STATUS_IN_TRANS | SERVER_MORE_RESULTS_EXISTS);
        assert!(session.in_transaction());
        assert!(session.more_results());
        session.update_status(0);
        assert!(!session.in_transaction());
        session.mark_closed();
        assert!(!session.is_authenticated());
    }
}
