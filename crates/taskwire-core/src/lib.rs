//! Core types shared by the taskwire protocol crates.
//!
//! - `Error` with one variant per failure class of the wire protocol
//! - `Value` for decoded row values and bound statement parameters
//! - `Outcome` / `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod value;

pub use error::{
    AuthenticationError, AuthenticationErrorKind, ConfigError, ConnectionError,
    ConnectionErrorKind, ConsumerError, Error, FramingError, FramingErrorKind, ProtocolError,
    Result, ServerError, TypeError, UnsupportedError,
};
pub use value::{Date, DateTime, Time, Value};
