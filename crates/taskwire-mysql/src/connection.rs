//! Async MySQL connection over an asupersync stream.
//!
//! [`MySqlConnection`] runs the connection phase with [`AuthenticateTask`],
//! then hands the authenticated session to a [`ProtocolEngine`] and moves
//! bytes between it and the transport for every command.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new().host("localhost").user("root").database("app");
//! let mut conn = MySqlConnection::connect(&cx, config).await?;
//! let results = conn.query(&cx, "SELECT 1").await?;
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::mpsc;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
use asupersync::sync::Mutex;
use asupersync::types::{CancelKind, CancelReason};
use asupersync::{Cx, Outcome};

use taskwire_core::{ConnectionError, ConnectionErrorKind, ConsumerError, Error, Result, Value};

use crate::config::{MySqlConfig, SslMode};
use crate::engine::ProtocolEngine;
use crate::protocol::CumulateBuffer;
use crate::session::SessionState;
use crate::task::{
    AuthStep, AuthenticateTask, PreparedStatement, ResultRow, ResultSink, ResultStates, Task,
    TaskOutput,
};
use crate::types::{BindValue, ColumnMeta};

const READ_CHUNK: usize = 16 * 1024;

/// Byte stream a connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Whether [`Transport::upgrade_to_ssl`] can succeed.
    fn supports_ssl(&self) -> bool {
        false
    }

    /// Switch the stream to TLS in place, after the SSLRequest was sent.
    fn upgrade_to_ssl(&mut self, config: &MySqlConfig) -> impl Future<Output = Result<()>> + Send;
}

impl Transport for TcpStream {
    fn upgrade_to_ssl(&mut self, _config: &MySqlConfig) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Ssl,
                message: "TLS is not available on a plain TCP transport".to_string(),
                source: None,
            }))
        }
    }
}

/// One complete result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Arc<[ColumnMeta]>,
    pub rows: Vec<ResultRow>,
    pub states: ResultStates,
}

impl ResultSet {
    pub fn affected_rows(&self) -> u64 {
        self.states.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.states.last_insert_id
    }

    pub fn first(&self) -> Option<&ResultRow> {
        self.rows.first()
    }
}

/// Sink that assembles [`ResultSet`]s and sends each one down a channel
/// as soon as its terminal packet arrives.
#[derive(Debug)]
pub struct ResultCollector {
    columns: Option<Arc<[ColumnMeta]>>,
    rows: Vec<ResultRow>,
    tx: mpsc::Sender<ResultSet>,
}

impl ResultCollector {
    pub fn channel() -> (Self, mpsc::Receiver<ResultSet>) {
        let (tx, rx) = mpsc::channel();
        let collector = Self {
            columns: None,
            rows: Vec::new(),
            tx,
        };
        (collector, rx)
    }
}

impl ResultSink for ResultCollector {
    fn on_columns(&mut self, _result_index: usize, columns: &Arc<[ColumnMeta]>) -> std::result::Result<(), ConsumerError> {
        self.columns = Some(Arc::clone(columns));
        Ok(())
    }

    fn on_row(&mut self, row: ResultRow) -> std::result::Result<(), ConsumerError> {
        self.rows.push(row);
        Ok(())
    }

    fn on_states(&mut self, states: ResultStates) -> std::result::Result<(), ConsumerError> {
        let set = ResultSet {
            columns: self.columns.take().unwrap_or_else(|| Arc::from(Vec::new())),
            rows: std::mem::take(&mut self.rows),
            states,
        };
        // the receiver is gone when the caller stopped waiting; the rest
        // of the response is still drained
        let _ = self.tx.send(set);
        Ok(())
    }
}

/// Async MySQL connection.
pub struct MySqlConnection<T: Transport = TcpStream> {
    transport: T,
    engine: ProtocolEngine,
    config: MySqlConfig,
    read_buf: Box<[u8]>,
    closed: bool,
}

impl<T: Transport> std::fmt::Debug for MySqlConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("thread_id", &self.engine.session().thread_id())
            .field("broken", &self.engine.is_broken())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<TcpStream> {
    /// Open a TCP connection and authenticate.
    #[tracing::instrument(level = "debug", skip(cx, config), fields(addr = %config.socket_addr()))]
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        if cx.is_cancel_requested() {
            return Outcome::Cancelled(cancel_reason(cx));
        }
        let addr = config.socket_addr();
        let socket_addr: std::net::SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                return Outcome::Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("Invalid socket address: {}", e),
                    source: None,
                }));
            }
        };
        let stream = match TcpStream::connect_timeout(socket_addr, config.connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                return Outcome::Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("Failed to connect to {}: {}", addr, e),
                    source: Some(Box::new(e)),
                }));
            }
        };
        stream.set_nodelay(true).ok();
        Self::connect_with(cx, stream, config).await
    }
}

impl<T: Transport> MySqlConnection<T> {
    /// Authenticate over an already connected transport.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %config.user))]
    pub async fn connect_with(cx: &Cx, mut transport: T, config: MySqlConfig) -> Outcome<Self, Error> {
        if cx.is_cancel_requested() {
            return Outcome::Cancelled(cancel_reason(cx));
        }
        let mut config = config;
        if config.ssl_mode == SslMode::Preferred && !transport.supports_ssl() {
            tracing::debug!("transport cannot upgrade to TLS, continuing without SSL");
            config = config.ssl_mode(SslMode::Disable);
        }
        let mut read_buf = vec![0u8; READ_CHUNK].into_boxed_slice();
        let session = match authenticate(&mut transport, &config, &mut read_buf).await {
            Ok(session) => session,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(
            server_version = session.server_version().unwrap_or(""),
            thread_id = session.thread_id().unwrap_or(0),
            "connection established"
        );
        Outcome::Ok(Self {
            transport,
            engine: ProtocolEngine::new(session),
            config,
            read_buf,
            closed: false,
        })
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionState {
        self.engine.session()
    }

    pub fn server_version(&self) -> Option<&str> {
        self.engine.session().server_version()
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.engine.session().thread_id()
    }

    /// A fatal protocol or transport error has made the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.engine.is_broken()
    }

    /// Run a text query and collect every result set it produces.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<ResultSet>, Error> {
        let (sink, rx) = ResultCollector::channel();
        match self.run(cx, Task::query(sql, sink)).await {
            Outcome::Ok(_) => Outcome::Ok(rx.try_iter().collect()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a text query, streaming rows into `sink`.
    #[tracing::instrument(level = "debug", skip(self, cx, sink))]
    pub async fn query_with(
        &mut self,
        cx: &Cx,
        sql: &str,
        sink: impl ResultSink + 'static,
    ) -> Outcome<(), Error> {
        match self.run(cx, Task::query(sql, sink)).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        match self.run(cx, Task::prepare(sql)).await {
            Outcome::Ok(TaskOutput::Prepared(stmt)) => Outcome::Ok(stmt),
            Outcome::Ok(TaskOutput::Done) => {
                Outcome::Err(Error::illegal_state("prepare finished without a statement"))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute a prepared statement with untyped parameters.
    pub async fn execute(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<Vec<ResultSet>, Error> {
        let binds = params.iter().cloned().map(BindValue::from).collect();
        self.execute_with(cx, statement, binds, 0).await
    }

    /// Execute with explicit binds; `fetch_size > 0` reads through a cursor.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, binds), fields(statement = statement.id()))]
    pub async fn execute_with(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        binds: Vec<BindValue>,
        fetch_size: u32,
    ) -> Outcome<Vec<ResultSet>, Error> {
        let (sink, rx) = ResultCollector::channel();
        let task = Task::execute(statement.clone(), binds, sink).with_fetch_size(fetch_size);
        match self.run(cx, task).await {
            Outcome::Ok(_) => Outcome::Ok(rx.try_iter().collect()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Deallocate a statement on the server. No reply is expected.
    pub async fn close_statement(&mut self, cx: &Cx, statement: &PreparedStatement) -> Outcome<(), Error> {
        self.run_unit(cx, Task::close_statement(statement.clone())).await
    }

    /// COM_RESET_CONNECTION: drop session variables, temporary tables and
    /// prepared statements without re-authenticating.
    ///
    /// Every [`PreparedStatement`] from this connection reports
    /// `is_closed()` afterwards and can no longer be executed.
    pub async fn reset(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.run_unit(cx, Task::reset()).await
    }

    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.run_unit(cx, Task::ping()).await
    }

    /// Send COM_QUIT and shut the transport down.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.engine.is_broken() && !self.closed {
            if let Outcome::Err(e) = self.run_unit(cx, Task::quit()).await {
                tracing::warn!(error = %e, "COM_QUIT failed");
            }
        }
        self.closed = true;
        let transport = &mut self.transport;
        match std::future::poll_fn(|task_cx| std::pin::Pin::new(&mut *transport).poll_shutdown(task_cx)).await {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(disconnected("Failed to shut down stream", e)),
        }
    }

    async fn run_unit(&mut self, cx: &Cx, task: Task) -> Outcome<(), Error> {
        match self.run(cx, task).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Submit `task` and move bytes until it completes.
    ///
    /// When cancellation is requested the task is cancelled in the engine
    /// and left there; its response is drained by later calls.
    async fn run(&mut self, cx: &Cx, task: Task) -> Outcome<TaskOutput, Error> {
        if cx.is_cancel_requested() {
            return Outcome::Cancelled(cancel_reason(cx));
        }
        if self.closed {
            return Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "connection is closed".to_string(),
                source: None,
            }));
        }
        let id = self.engine.submit(task);
        loop {
            if let Err(e) = self.flush().await {
                self.engine.fail_all(e);
            }
            while let Some(done) = self.engine.poll_completion() {
                if done.id == id {
                    return match done.result {
                        Ok(output) => Outcome::Ok(output),
                        Err(Error::Cancelled) => Outcome::Cancelled(cancel_reason(cx)),
                        Err(e) => Outcome::Err(e),
                    };
                }
                tracing::trace!(task = %done.id, "dropping completion of an abandoned task");
            }
            if cx.is_cancel_requested() {
                self.engine.cancel(id);
                return Outcome::Cancelled(cancel_reason(cx));
            }
            if let Err(e) = self.fill().await {
                self.engine.fail_all(e);
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        while let Some(bytes) = self.engine.poll_transmit() {
            write_all(&mut self.transport, &bytes).await?;
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        if self.engine.is_idle() {
            return Ok(());
        }
        let n = read_some(&mut self.transport, &mut self.read_buf).await?;
        self.engine.receive(&self.read_buf[..n])
    }
}

/// Drive the connection phase to completion.
async fn authenticate<T: Transport>(
    transport: &mut T,
    config: &MySqlConfig,
    read_buf: &mut [u8],
) -> Result<SessionState> {
    let mut task = AuthenticateTask::new(config);
    let mut buf = CumulateBuffer::new();
    let mut step = task.decode(&mut buf)?;
    loop {
        step = match step {
            AuthStep::NeedMore => {
                let n = read_some(transport, read_buf).await?;
                buf.extend(&read_buf[..n]);
                task.decode(&mut buf)?
            }
            AuthStep::Write(bytes) => {
                write_all(transport, &bytes).await?;
                task.decode(&mut buf)?
            }
            AuthStep::UpgradeSsl(request) => {
                write_all(transport, &request).await?;
                if !buf.is_empty() {
                    return Err(Error::protocol("server sent data before the TLS handshake"));
                }
                transport.upgrade_to_ssl(config).await?;
                task.after_ssl_upgrade()?
            }
            AuthStep::Done(result) => {
                if !buf.is_empty() {
                    return Err(Error::protocol("unexpected data after authentication"));
                }
                return Ok(SessionState::established(config, result));
            }
        };
    }
}

async fn write_all<T: Transport>(stream: &mut T, bytes: &[u8]) -> Result<()> {
    tracing::trace!(len = bytes.len(), "writing packets");
    let mut written = 0;
    while written < bytes.len() {
        match std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_write(cx, &bytes[written..])).await {
            Ok(0) => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "Connection closed while writing packet".to_string(),
                    source: None,
                }));
            }
            Ok(n) => written += n,
            Err(e) => return Err(disconnected("Failed to write packet", e)),
        }
    }
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_flush(cx))
        .await
        .map_err(|e| disconnected("Failed to flush stream", e))
}

async fn read_some<T: Transport>(stream: &mut T, buf: &mut [u8]) -> Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    match std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf)).await {
        Ok(()) => {
            let n = read_buf.filled().len();
            if n == 0 {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "Connection closed by server".to_string(),
                    source: None,
                }));
            }
            tracing::trace!(len = n, "read bytes");
            Ok(n)
        }
        Err(e) => Err(disconnected("Failed to read from stream", e)),
    }
}

fn disconnected(context: &str, e: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{}: {}", context, e),
        source: Some(Box::new(e)),
    })
}

fn cancel_reason(cx: &Cx) -> CancelReason {
    cx.cancel_reason()
        .unwrap_or_else(|| CancelReason::new(CancelKind::User))
}

fn lock_error() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: "Failed to acquire connection lock".to_string(),
        source: None,
    })
}

/// A connection shared between callers.
///
/// Each operation holds the lock for its whole request/response exchange,
/// so concurrent callers are served one at a time in lock order.
pub struct SharedMySqlConnection<T: Transport = TcpStream> {
    inner: Arc<Mutex<MySqlConnection<T>>>,
}

impl<T: Transport> SharedMySqlConnection<T> {
    pub fn new(conn: MySqlConnection<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn inner(&self) -> &Arc<Mutex<MySqlConnection<T>>> {
        &self.inner
    }

    pub async fn query(&self, cx: &Cx, sql: &str) -> Outcome<Vec<ResultSet>, Error> {
        let mut guard = match self.inner.lock(cx).await {
            Ok(g) => g,
            Err(_) => return Outcome::Err(lock_error()),
        };
        guard.query(cx, sql).await
    }

    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        let mut guard = match self.inner.lock(cx).await {
            Ok(g) => g,
            Err(_) => return Outcome::Err(lock_error()),
        };
        guard.prepare(cx, sql).await
    }

    pub async fn execute(
        &self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<Vec<ResultSet>, Error> {
        let mut guard = match self.inner.lock(cx).await {
            Ok(g) => g,
            Err(_) => return Outcome::Err(lock_error()),
        };
        guard.execute(cx, statement, params).await
    }

    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut guard = match self.inner.lock(cx).await {
            Ok(g) => g,
            Err(_) => return Outcome::Err(lock_error()),
        };
        guard.ping(cx).await
    }
}

impl SharedMySqlConnection<TcpStream> {
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        match MySqlConnection::connect(cx, config).await {
            Outcome::Ok(conn) => Outcome::Ok(Self::new(conn)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

impl<T: Transport> Clone for SharedMySqlConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for SharedMySqlConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMySqlConnection")
            .field("inner", &"Arc<Mutex<MySqlConnection>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_groups_rows_per_result() {
        let (mut sink, rx) = ResultCollector::channel();
        let columns: Arc<[ColumnMeta]> =
            Arc::from(vec![crate::test_support::column("a", crate::types::FieldType::Long)]);
        sink.on_columns(0, &columns).unwrap();
        sink.on_row(ResultRow::new(0, Arc::clone(&columns), vec![Value::Int(1)])).unwrap();
        sink.on_states(ResultStates::default()).unwrap();
        sink.on_states(ResultStates {
            result_index: 1,
            affected_rows: 2,
            ..ResultStates::default()
        })
        .unwrap();

        let sets: Vec<ResultSet> = rx.try_iter().collect();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].rows.len(), 1);
        assert_eq!(sets[0].columns.len(), 1);
        assert!(sets[1].columns.is_empty());
        assert_eq!(sets[1].affected_rows(), 2);
    }

    #[test]
    fn collector_tolerates_dropped_receiver() {
        let (mut sink, rx) = ResultCollector::channel();
        drop(rx);
        assert!(sink.on_states(ResultStates::default()).is_ok());
    }
}
