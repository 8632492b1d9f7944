//! Client side of the MySQL wire protocol, built as a task engine.
//!
//! Each command is a [`Task`]: it frames its own packets, tracks sequence
//! ids and decodes the server's response into states a driver can act
//! on. The crate provides:
//!
//! - Packet framing with sequence numbers and the long-data window
//! - Handshake and authentication (native, caching_sha2, sha256, clear,
//!   old-password) as a pure state machine
//! - Text and binary result set decoding with multi-result and cursor
//!   support
//! - Prepared statements with long-data parameters
//! - A sans-I/O [`ProtocolEngine`] and an async [`MySqlConnection`] on
//!   asupersync
//!
//! # Example
//!
//! ```rust,ignore
//! use taskwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(&cx, config).await?;
//! let stmt = conn.prepare(&cx, "SELECT ? + 1").await?;
//! let results = conn.execute(&cx, &stmt, &[Value::Int(41)]).await?;
//! ```

pub mod auth;
pub mod collation;
pub mod config;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod session;
pub mod task;
pub mod types;

// lets the shared server script name this crate by its public path
#[cfg(test)]
extern crate self as taskwire_mysql;

#[cfg(test)]
#[allow(dead_code)]
#[path = "../tests/common/server.rs"]
mod server_script;
#[cfg(test)]
mod test_support;

pub use auth::AuthPlugin;
pub use config::{MySqlConfig, SslMode};
pub use connection::{MySqlConnection, ResultCollector, ResultSet, SharedMySqlConnection, Transport};
pub use engine::{ProtocolEngine, TaskCompletion};
pub use session::SessionState;
pub use task::{
    AuthStep, AuthenticateResult, AuthenticateTask, CancelFlag, PreparedStatement, ResultRow,
    ResultSink, ResultStates, States, Task, TaskId, TaskKind, TaskOutput,
};
pub use types::{BindValue, ColumnMeta, FieldType};

pub use taskwire_core::{Error, Result, Value};
