//! Error types for protocol engine operations.
//!
//! Errors are split by how they affect the connection. Framing, protocol,
//! unsupported-configuration and authentication errors leave the connection
//! unusable. Server and consumer errors fail only the task that produced
//! them; the connection keeps serving queued tasks.

use std::fmt;

/// The primary error type for all protocol engine operations.
#[derive(Debug)]
pub enum Error {
    /// Packet header, length or sequence-id mismatch
    Framing(FramingError),
    /// A capability or plugin the engine cannot work with
    Unsupported(UnsupportedError),
    /// The server rejected the connection attempt
    Authentication(AuthenticationError),
    /// ERR packet received while executing a command
    Server(ServerError),
    /// The row consumer failed while receiving decoded data
    Consumer(ConsumerError),
    /// Malformed packet body
    Protocol(ProtocolError),
    /// Transport-level failures (connect, disconnect, broken engine)
    Connection(ConnectionError),
    /// Value conversion or parameter binding errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// An operation was invoked in a state that does not allow it
    IllegalState(String),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct FramingError {
    pub kind: FramingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingErrorKind {
    /// Received sequence id differs from the expected next id
    SequenceMismatch { expected: u8, actual: u8 },
    /// Declared payload length disagrees with the bytes that make up the packet
    Truncated,
    /// Payload larger than the negotiated maximum
    Oversized,
}

#[derive(Debug)]
pub struct UnsupportedError {
    pub message: String,
}

#[derive(Debug)]
pub struct AuthenticationError {
    pub kind: AuthenticationErrorKind,
    pub message: String,
    /// MySQL error code when the failure came from an ERR packet
    pub code: Option<u16>,
    pub sqlstate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationErrorKind {
    /// Server answered with ERR
    Rejected,
    /// Too many auth-switch requests
    SwitchLimitExceeded,
    /// The auth plugin could not produce a response (missing key, cleartext over plain TCP)
    Plugin,
    /// SSL was required but could not be negotiated
    Ssl,
}

#[derive(Debug)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
    /// SQL text of the command that failed, when known
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct ConsumerError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS upgrade failed
    Ssl,
    /// A previous fatal error left the connection unusable
    Broken,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    /// Column or parameter the value belongs to
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Does this error leave the connection unusable?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Framing(_)
                | Error::Unsupported(_)
                | Error::Authentication(_)
                | Error::Protocol(_)
                | Error::Connection(_)
                | Error::Io(_)
                | Error::Timeout
        )
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Ssl
                    | ConnectionErrorKind::Broken
            ),
            Error::Io(_) | Error::Timeout => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for integrity violations)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(e.sqlstate.as_str()),
            Error::Authentication(e) => e.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a framing error for an unexpected sequence id.
    pub fn sequence_mismatch(expected: u8, actual: u8) -> Self {
        Error::Framing(FramingError {
            kind: FramingErrorKind::SequenceMismatch { expected, actual },
            message: format!("packet sequence mismatch: expected {expected}, got {actual}"),
        })
    }

    /// Build an unsupported-configuration error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(UnsupportedError {
            message: message.into(),
        })
    }

    /// Build a protocol error for a malformed packet.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Build an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }
}

impl ServerError {
    /// Is this a duplicate key error?
    pub fn is_duplicate_key(&self) -> bool {
        // ER_DUP_ENTRY / ER_DUP_ENTRY_WITH_KEY_NAME
        self.code == 1062 || self.code == 1586
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        // ER_NO_REFERENCED_ROW_2 / ER_ROW_IS_REFERENCED_2
        self.code == 1452 || self.code == 1451
    }
}

impl ConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Framing(e) => write!(f, "Framing error: {}", e.message),
            Error::Unsupported(e) => write!(f, "Unsupported: {}", e.message),
            Error::Authentication(e) => write!(f, "Authentication failed: {}", e),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Consumer(e) => write!(f, "Row consumer error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Consumer(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.sqlstate) {
            (Some(code), Some(state)) => write!(f, "{} ({}, {})", self.message, code, state),
            (Some(code), None) => write!(f, "{} ({})", self.message, code),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (error {}, SQLSTATE {})",
            self.message, self.code, self.sqlstate
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return Error::Timeout;
        }
        Error::Io(err)
    }
}

impl From<FramingError> for Error {
    fn from(err: FramingError) -> Self {
        Error::Framing(err)
    }
}

impl From<AuthenticationError> for Error {
    fn from(err: AuthenticationError) -> Self {
        Error::Authentication(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ConsumerError> for Error {
    fn from(err: ConsumerError) -> Self {
        Error::Consumer(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for protocol engine operations.
pub type Result<T> = std::result::Result<T, Error>;
