//! Connection-phase task: handshake, optional SSL upgrade, authentication.
//!
//! The task is a pure state machine. The connection feeds it received
//! bytes and performs whatever [`AuthStep`] it returns: write bytes, or
//! upgrade the transport to TLS and then call
//! [`AuthenticateTask::after_ssl_upgrade`].

use taskwire_core::{AuthenticationError, AuthenticationErrorKind, Error, Result};

use crate::auth::{AuthPlugin, caching_sha2, cleartext_password, encrypt_password_rsa, plugin_error};
use crate::config::MySqlConfig;
use crate::protocol::capabilities::{CLIENT_PROTOCOL_41, CLIENT_SSL};
use crate::protocol::handshake::{AuthSwitchRequest, HandshakeResponse, build_ssl_request};
use crate::protocol::reader::PacketReader;
use crate::protocol::{CumulateBuffer, HandshakePacket, SequenceTracker, encode_frames, read_payload};

/// What the connection must do next.
#[derive(Debug)]
pub enum AuthStep {
    /// Wait for more bytes.
    NeedMore,
    /// Send these framed bytes, then keep reading.
    Write(Vec<u8>),
    /// Send this framed SSLRequest, upgrade the transport, then call
    /// [`AuthenticateTask::after_ssl_upgrade`].
    UpgradeSsl(Vec<u8>),
    /// Authentication succeeded.
    Done(AuthenticateResult),
}

/// Outcome of a successful connection phase.
#[derive(Debug, Clone)]
pub struct AuthenticateResult {
    pub handshake: HandshakePacket,
    /// Client flags that both sides support
    pub negotiated_capability: u32,
    /// Status flags from the final OK packet
    pub server_status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHandshake,
    AwaitSslUpgrade,
    AwaitAuthResult,
    /// caching_sha2/sha256 asked for the server's RSA key
    AwaitPublicKey,
    Done,
    Failed,
}

/// Drives one connection through the handshake and authentication.
#[derive(Debug)]
pub struct AuthenticateTask {
    config: MySqlConfig,
    sequence: SequenceTracker,
    phase: Phase,
    handshake: Option<HandshakePacket>,
    negotiated: u32,
    plugin: AuthPlugin,
    seed: Vec<u8>,
    switches: u8,
    secure: bool,
}

impl AuthenticateTask {
    pub fn new(config: &MySqlConfig) -> Self {
        Self {
            config: config.clone(),
            sequence: SequenceTracker::new(),
            phase: Phase::AwaitHandshake,
            handshake: None,
            negotiated: 0,
            plugin: AuthPlugin::NativePassword,
            seed: Vec::new(),
            switches: 0,
            secure: false,
        }
    }

    /// Plugin currently answering the server.
    pub fn plugin(&self) -> AuthPlugin {
        self.plugin
    }

    /// Whether the transport has been upgraded to TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Consume buffered packets until a step is required.
    pub fn decode(&mut self, buf: &mut CumulateBuffer) -> Result<AuthStep> {
        match self.phase {
            Phase::Failed => return Err(Error::illegal_state("authentication already failed")),
            Phase::Done => return Err(Error::illegal_state("authentication already finished")),
            Phase::AwaitSslUpgrade => {
                return Err(Error::illegal_state("waiting for the SSL upgrade"));
            }
            _ => {}
        }
        let result = self.decode_inner(buf);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// Continue after the transport has switched to TLS.
    pub fn after_ssl_upgrade(&mut self) -> Result<AuthStep> {
        if self.phase != Phase::AwaitSslUpgrade {
            self.phase = Phase::Failed;
            return Err(Error::illegal_state("no SSL upgrade was requested"));
        }
        self.secure = true;
        tracing::debug!("transport upgraded to TLS");
        let result = self.send_handshake_response();
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn decode_inner(&mut self, buf: &mut CumulateBuffer) -> Result<AuthStep> {
        loop {
            let Some(payload) = read_payload(buf, &mut self.sequence)? else {
                return Ok(AuthStep::NeedMore);
            };
            let step = match self.phase {
                Phase::AwaitHandshake => Some(self.on_handshake(&payload)?),
                Phase::AwaitAuthResult => self.on_auth_result(&payload)?,
                Phase::AwaitPublicKey => Some(self.on_public_key(&payload)?),
                Phase::AwaitSslUpgrade | Phase::Done | Phase::Failed => {
                    return Err(Error::protocol("unexpected packet during authentication"));
                }
            };
            if let Some(step) = step {
                return Ok(step);
            }
        }
    }

    fn on_handshake(&mut self, payload: &[u8]) -> Result<AuthStep> {
        let handshake = HandshakePacket::parse(payload)?;
        tracing::debug!(
            protocol = handshake.protocol_version(),
            server_version = handshake.server_version(),
            thread_id = handshake.thread_id(),
            server_plugin = ?handshake.auth_plugin_name(),
            "received server handshake"
        );

        self.negotiated = self.config.capability_flags() & handshake.capabilities();
        self.seed = handshake.seed().to_vec();
        self.plugin = self.select_plugin(&handshake);

        let ssl_wanted = self.config.ssl_mode.should_try_ssl();
        let handshake_supports_ssl = self.negotiated & CLIENT_SSL != 0;
        self.handshake = Some(handshake);

        if ssl_wanted && handshake_supports_ssl {
            let request = build_ssl_request(
                self.negotiated,
                self.config.max_packet_size,
                self.config.handshake_collation(),
            );
            let framed = encode_frames(&request, &mut self.sequence)?;
            self.phase = Phase::AwaitSslUpgrade;
            return Ok(AuthStep::UpgradeSsl(framed));
        }
        if self.config.ssl_mode.is_required() {
            return Err(Error::Authentication(AuthenticationError {
                kind: AuthenticationErrorKind::Ssl,
                message: "server does not support SSL but ssl_mode requires it".to_string(),
                code: None,
                sqlstate: None,
            }));
        }
        self.negotiated &= !CLIENT_SSL;
        self.send_handshake_response()
    }

    fn select_plugin(&self, handshake: &HandshakePacket) -> AuthPlugin {
        if self.negotiated & CLIENT_PROTOCOL_41 == 0 {
            return AuthPlugin::OldPassword;
        }
        if let Some(plugin) = self.config.auth_plugin {
            return plugin;
        }
        match handshake.auth_plugin_name() {
            Some(name) => AuthPlugin::from_name(name).unwrap_or_else(|_| {
                // the server will switch us to something we speak
                tracing::debug!(server_plugin = name, "unknown plugin, answering with native password");
                AuthPlugin::NativePassword
            }),
            None => AuthPlugin::NativePassword,
        }
    }

    fn password(&self) -> &str {
        self.config.password.as_deref().unwrap_or("")
    }

    fn send_handshake_response(&mut self) -> Result<AuthStep> {
        let auth_response = self.plugin.initial_response(
            self.password(),
            &self.seed,
            self.secure,
            self.config.server_public_key.as_deref(),
        )?;
        let response = HandshakeResponse {
            capabilities: self.negotiated,
            max_packet_size: self.config.max_packet_size,
            collation: self.config.handshake_collation(),
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: self.plugin.name(),
            attributes: &self.config.attributes,
        };
        let payload = if self.negotiated & CLIENT_PROTOCOL_41 != 0 {
            response.encode_41()
        } else {
            response.encode_320()
        };
        tracing::debug!(
            plugin = self.plugin.name(),
            capabilities = self.negotiated,
            secure = self.secure,
            "sending handshake response"
        );
        let framed = encode_frames(&payload, &mut self.sequence)?;
        self.phase = Phase::AwaitAuthResult;
        Ok(AuthStep::Write(framed))
    }

    /// `None` means keep reading.
    fn on_auth_result(&mut self, payload: &[u8]) -> Result<Option<AuthStep>> {
        match payload.first() {
            Some(0x00) => {
                let ok = PacketReader::new(payload).parse_ok_packet(self.negotiated)?;
                let handshake = self
                    .handshake
                    .take()
                    .ok_or_else(|| Error::illegal_state("authenticated without a handshake"))?;
                self.phase = Phase::Done;
                tracing::debug!(plugin = self.plugin.name(), "authentication succeeded");
                Ok(Some(AuthStep::Done(AuthenticateResult {
                    handshake,
                    negotiated_capability: self.negotiated,
                    server_status: ok.status_flags,
                })))
            }
            Some(0xFF) => {
                let err = PacketReader::new(payload).parse_err_packet()?;
                Err(Error::Authentication(AuthenticationError {
                    kind: AuthenticationErrorKind::Rejected,
                    message: err.error_message,
                    code: Some(err.error_code),
                    sqlstate: Some(err.sql_state),
                }))
            }
            Some(0xFE) => self.on_auth_switch(payload).map(Some),
            Some(0x01) => self.on_more_data(&payload[1..]),
            Some(other) => Err(Error::protocol(format!(
                "unexpected authentication packet {other:#04x}"
            ))),
            None => Err(Error::protocol("empty authentication packet")),
        }
    }

    fn on_auth_switch(&mut self, payload: &[u8]) -> Result<AuthStep> {
        self.switches = self.switches.saturating_add(1);
        if self.switches > self.config.auth_switch_limit {
            return Err(Error::Authentication(AuthenticationError {
                kind: AuthenticationErrorKind::SwitchLimitExceeded,
                message: format!(
                    "server requested more than {} authentication switches",
                    self.config.auth_switch_limit
                ),
                code: None,
                sqlstate: None,
            }));
        }
        let request = AuthSwitchRequest::parse(payload, &self.seed);
        let plugin = AuthPlugin::from_name(&request.plugin)?;
        tracing::debug!(from = self.plugin.name(), to = plugin.name(), "auth switch");
        self.plugin = plugin;
        self.seed = request.seed;
        let response = plugin.initial_response(
            self.password(),
            &self.seed,
            self.secure,
            self.config.server_public_key.as_deref(),
        )?;
        if plugin == AuthPlugin::Sha256Password
            && response == [caching_sha2::SHA256_REQUEST_PUBLIC_KEY]
        {
            self.phase = Phase::AwaitPublicKey;
        }
        Ok(AuthStep::Write(encode_frames(&response, &mut self.sequence)?))
    }

    fn on_more_data(&mut self, data: &[u8]) -> Result<Option<AuthStep>> {
        match (self.plugin, data.first()) {
            (AuthPlugin::CachingSha2Password, Some(&caching_sha2::FAST_AUTH_SUCCESS)) => {
                tracing::debug!("caching_sha2 fast auth succeeded");
                Ok(None)
            }
            (AuthPlugin::CachingSha2Password, Some(&caching_sha2::PERFORM_FULL_AUTH)) => {
                self.full_authentication().map(Some)
            }
            // sha256_password answered our key request inside AuthMoreData
            (AuthPlugin::Sha256Password, Some(_)) => self.on_public_key_data(data).map(Some),
            (plugin, first) => Err(plugin_error(format!(
                "unexpected auth-more-data {first:?} for {}",
                plugin.name()
            ))),
        }
    }

    fn full_authentication(&mut self) -> Result<AuthStep> {
        let response = if self.secure {
            cleartext_password(self.password())
        } else if let Some(pem) = self.config.server_public_key.as_deref() {
            encrypt_password_rsa(self.password(), &self.seed, pem)?
        } else if self.config.allow_public_key_retrieval {
            self.phase = Phase::AwaitPublicKey;
            vec![caching_sha2::REQUEST_PUBLIC_KEY]
        } else {
            return Err(plugin_error(
                "full authentication over an insecure connection needs a server public key \
                 or allow_public_key_retrieval",
            ));
        };
        tracing::debug!(secure = self.secure, "caching_sha2 full authentication");
        Ok(AuthStep::Write(encode_frames(&response, &mut self.sequence)?))
    }

    fn on_public_key(&mut self, payload: &[u8]) -> Result<AuthStep> {
        match payload.first() {
            Some(0x01) => self.on_public_key_data(&payload[1..]),
            Some(0xFF) => {
                let err = PacketReader::new(payload).parse_err_packet()?;
                Err(Error::Authentication(AuthenticationError {
                    kind: AuthenticationErrorKind::Rejected,
                    message: err.error_message,
                    code: Some(err.error_code),
                    sqlstate: Some(err.sql_state),
                }))
            }
            _ => Err(Error::protocol("expected the server public key")),
        }
    }

    fn on_public_key_data(&mut self, pem: &[u8]) -> Result<AuthStep> {
        let encrypted = encrypt_password_rsa(self.password(), &self.seed, pem)?;
        self.phase = Phase::AwaitAuthResult;
        Ok(AuthStep::Write(encode_frames(&encrypted, &mut self.sequence)?))
    }
}
