//! Command tasks.
//!
//! A [`Task`] is one command together with everything needed to see its
//! response through: the packets to send, a sequence tracker, the decoder
//! for the response and the sink rows go to. The engine activates one task
//! at a time and feeds it received bytes until [`Task::decode`] reports a
//! terminal state.

pub mod auth;
pub mod command;
pub mod prepared;
pub mod queue;
pub mod result;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use taskwire_core::{Error, Result};

use crate::protocol::reader::PacketReader;
use crate::protocol::{CumulateBuffer, SequenceTracker, read_header, read_payload};
use crate::session::SessionState;
use crate::types::BindValue;

pub use auth::{AuthStep, AuthenticateResult, AuthenticateTask};
pub use prepared::{PrepareOk, PrepareResponseReader, PreparedStatement, StatementTracker};
pub use queue::{TaskId, TaskQueue};
pub use result::{
    DiscardSink, ResultRow, ResultSetReader, ResultSink, ResultStates, RowFormat, States,
};

/// Shared cancellation flag, checked before each row and each result set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The command a task carries.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// COM_QUERY; rows come back in the text format
    Query { sql: String },
    /// COM_STMT_PREPARE
    Prepare { sql: String },
    /// COM_STMT_EXECUTE, preceded by long data; rows in the binary format
    Execute {
        statement: PreparedStatement,
        params: Vec<BindValue>,
        fetch_size: u32,
    },
    /// COM_STMT_CLOSE; no response
    CloseStatement { statement: PreparedStatement },
    Ping,
    /// COM_RESET_CONNECTION
    Reset,
    /// COM_QUIT; no response
    Quit,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Query { .. } => "query",
            TaskKind::Prepare { .. } => "prepare",
            TaskKind::Execute { .. } => "execute",
            TaskKind::CloseStatement { .. } => "close_statement",
            TaskKind::Ping => "ping",
            TaskKind::Reset => "reset",
            TaskKind::Quit => "quit",
        }
    }
}

/// What a successful task produced besides the rows sent to its sink.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    Done,
    Prepared(PreparedStatement),
}

enum Decoder {
    Idle,
    Results(ResultSetReader),
    Prepare(PrepareResponseReader),
    /// Bare OK/ERR reply (ping, reset)
    Simple,
}

/// One command and the state needed to decode its response.
pub struct Task {
    kind: TaskKind,
    sequence: SequenceTracker,
    cancel: CancelFlag,
    sink: Box<dyn ResultSink>,
    decoder: Decoder,
    statement: Option<StatementTracker>,
    outbound: Vec<Vec<u8>>,
    failure: Option<Error>,
    output: Option<TaskOutput>,
    started: bool,
}

impl Task {
    fn new(kind: TaskKind, sink: Box<dyn ResultSink>) -> Self {
        Self {
            kind,
            sequence: SequenceTracker::new(),
            cancel: CancelFlag::new(),
            sink,
            decoder: Decoder::Idle,
            statement: None,
            outbound: Vec::new(),
            failure: None,
            output: None,
            started: false,
        }
    }

    pub fn query(sql: impl Into<String>, sink: impl ResultSink + 'static) -> Self {
        Self::new(TaskKind::Query { sql: sql.into() }, Box::new(sink))
    }

    pub fn prepare(sql: impl Into<String>) -> Self {
        Self::new(TaskKind::Prepare { sql: sql.into() }, Box::new(DiscardSink))
    }

    pub fn execute(
        statement: PreparedStatement,
        params: Vec<BindValue>,
        sink: impl ResultSink + 'static,
    ) -> Self {
        Self::new(
            TaskKind::Execute {
                statement,
                params,
                fetch_size: 0,
            },
            Box::new(sink),
        )
    }

    /// Read the rows of an execute through a cursor, `rows` at a time.
    pub fn with_fetch_size(mut self, rows: u32) -> Self {
        if let TaskKind::Execute { fetch_size, .. } = &mut self.kind {
            *fetch_size = rows;
        }
        self
    }

    pub fn close_statement(statement: PreparedStatement) -> Self {
        Self::new(TaskKind::CloseStatement { statement }, Box::new(DiscardSink))
    }

    pub fn ping() -> Self {
        Self::new(TaskKind::Ping, Box::new(DiscardSink))
    }

    /// COM_RESET_CONNECTION. Once it succeeds the engine closes the
    /// handles of every statement it prepared.
    pub fn reset() -> Self {
        Self::new(TaskKind::Reset, Box::new(DiscardSink))
    }

    pub fn quit() -> Self {
        Self::new(TaskKind::Quit, Box::new(DiscardSink))
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Handle for cancelling this task from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the server answers this command at all.
    pub fn expects_response(&self) -> bool {
        !matches!(self.kind, TaskKind::CloseStatement { .. } | TaskKind::Quit)
    }

    /// Prepared-statement state, once the task has started.
    pub fn statement_tracker(&self) -> Option<&StatementTracker> {
        self.statement.as_ref()
    }

    /// Build the outbound packets and the response decoder.
    ///
    /// Errors are raised before anything is queued for sending, so a
    /// failed start leaves the connection usable.
    #[tracing::instrument(level = "debug", skip(self, session), fields(kind = self.kind.name()))]
    pub fn start(&mut self, session: &SessionState) -> Result<()> {
        if self.started {
            return Err(Error::illegal_state("task already started"));
        }
        if !session.is_authenticated() {
            return Err(Error::illegal_state("connection is not authenticated"));
        }
        self.started = true;
        let max_packet = session.max_packet_size();

        match &self.kind {
            TaskKind::Query { sql } => {
                let packet = command::write_query(sql, &mut self.sequence, max_packet)?;
                self.outbound.push(packet);
                self.decoder = Decoder::Results(ResultSetReader::new(RowFormat::Text).with_sql(sql.clone()));
            }
            TaskKind::Prepare { sql } => {
                let packet = command::write_prepare(sql, &mut self.sequence, max_packet)?;
                self.outbound.push(packet);
                self.statement = Some(StatementTracker::preparing(self.cancel.clone()));
                self.decoder = Decoder::Prepare(PrepareResponseReader::new(sql.clone()));
            }
            TaskKind::Execute {
                statement,
                params,
                fetch_size,
            } => {
                let tracker = StatementTracker::for_statement(statement.clone(), *fetch_size, self.cancel.clone());
                let packets = command::write_execute(&tracker, params, &mut self.sequence, max_packet)?;
                self.outbound.extend(packets);
                self.decoder = Decoder::Results(
                    ResultSetReader::new(RowFormat::Binary)
                        .with_sql(statement.sql())
                        .with_cursor(tracker.support_fetch()),
                );
                self.statement = Some(tracker);
            }
            TaskKind::CloseStatement { statement } => {
                let mut tracker = StatementTracker::for_statement(statement.clone(), 0, self.cancel.clone());
                let id = tracker.obtain_statement_id()?;
                self.outbound.push(command::write_close(id, &mut self.sequence)?);
                tracker.mark_closed();
                self.statement = Some(tracker);
                self.output = Some(TaskOutput::Done);
            }
            TaskKind::Ping => {
                self.outbound.push(command::write_ping(&mut self.sequence)?);
                self.decoder = Decoder::Simple;
            }
            TaskKind::Reset => {
                self.outbound.push(command::write_reset(&mut self.sequence)?);
                self.decoder = Decoder::Simple;
            }
            TaskKind::Quit => {
                self.outbound.push(command::write_quit(&mut self.sequence)?);
                self.output = Some(TaskOutput::Done);
            }
        }
        tracing::debug!(packets = self.outbound.len(), "task started");
        Ok(())
    }

    /// True once a packet header is buffered.
    pub fn can_decode(&self, buf: &CumulateBuffer) -> bool {
        read_header(buf.readable()).is_some()
    }

    /// Framed packets waiting to be sent, in order.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Decode as much of the response as is buffered.
    ///
    /// `Err` means the connection can no longer be trusted; a failing
    /// command instead ends with [`States::EndOnError`] and
    /// [`Task::take_failure`].
    pub fn decode(&mut self, buf: &mut CumulateBuffer, session: &mut SessionState) -> Result<States> {
        let state = match &mut self.decoder {
            Decoder::Idle => return Err(Error::illegal_state("task has no response to decode")),
            Decoder::Results(reader) => {
                let state = reader.decode(buf, &mut self.sequence, session, self.sink.as_mut(), &self.cancel)?;
                self.outbound.extend(reader.take_outbound());
                match state {
                    States::MoreResult => {
                        if let Some(tracker) = &mut self.statement {
                            tracker.next_result();
                        }
                    }
                    States::MoreFetch => reader.resume_fetch(),
                    States::NoMoreResult => self.output = Some(TaskOutput::Done),
                    States::EndOnError => self.failure = reader.take_failure(),
                    States::MoreCumulate => {}
                }
                state
            }
            Decoder::Prepare(reader) => {
                let (state, statement) = reader.decode(buf, &mut self.sequence, session)?;
                match state {
                    States::NoMoreResult => {
                        let statement = statement
                            .ok_or_else(|| Error::illegal_state("prepare finished without a statement"))?;
                        if let Some(tracker) = &mut self.statement {
                            tracker.mark_prepared(statement.clone());
                        }
                        self.output = Some(TaskOutput::Prepared(statement));
                    }
                    States::EndOnError => self.failure = reader.take_failure(),
                    _ => {}
                }
                state
            }
            Decoder::Simple => self.decode_simple(buf, session)?,
        };
        if state == States::MoreFetch {
            self.next_fetch()?;
        }
        Ok(state)
    }

    fn decode_simple(&mut self, buf: &mut CumulateBuffer, session: &mut SessionState) -> Result<States> {
        let Some(payload) = read_payload(buf, &mut self.sequence)? else {
            return Ok(States::MoreCumulate);
        };
        let mut reader = PacketReader::new(&payload);
        match payload.first() {
            Some(0x00) => {
                let ok = reader.parse_ok_packet(session.capabilities())?;
                session.update_status(ok.status_flags);
                self.output = Some(TaskOutput::Done);
                Ok(States::NoMoreResult)
            }
            Some(0xFF) => {
                let err = reader.parse_err_packet()?;
                self.failure = Some(Error::Server(err.into_server_error(None)));
                Ok(States::EndOnError)
            }
            _ => Err(Error::protocol(format!(
                "{} expects an OK or ERR reply",
                self.kind.name()
            ))),
        }
    }

    /// Queue COM_STMT_FETCH for the next batch of cursor rows.
    pub fn next_fetch(&mut self) -> Result<()> {
        let tracker = self
            .statement
            .as_ref()
            .ok_or_else(|| Error::illegal_state("fetch without a prepared statement"))?;
        if !tracker.support_fetch() {
            return Err(Error::illegal_state("statement was not executed with a cursor"));
        }
        let packet = command::write_fetch(tracker.obtain_statement_id()?, tracker.fetch_size(), &mut self.sequence)?;
        tracing::debug!(fetch_size = tracker.fetch_size(), "requesting next cursor batch");
        self.outbound.push(packet);
        Ok(())
    }

    /// Failure recorded by the last decode.
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    /// The task's result, once it has finished.
    ///
    /// A task without a response completes as soon as it has started.
    pub fn take_result(&mut self) -> Option<Result<TaskOutput>> {
        if let Some(error) = self.failure.take() {
            return Some(Err(error));
        }
        self.output.take().map(Ok)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind.name())
            .field("started", &self.started)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("next_sequence_id", &self.sequence.next_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_PROTOCOL_41};
    use crate::test_support::{CollectingSink, Server, column, session_with, split_frames};
    use crate::types::FieldType;
    use taskwire_core::Value;

    #[test]
    fn start_requires_authentication() {
        let session = SessionState::new(255, 1 << 24);
        let mut task = Task::ping();
        assert!(matches!(task.start(&session), Err(Error::IllegalState(_))));
    }

    #[test]
    fn ping_ok() {
        let mut session = session_with(CLIENT_PROTOCOL_41);
        let mut task = Task::ping();
        task.start(&session).unwrap();
        let out = task.take_outbound();
        assert_eq!(out, vec![vec![1, 0, 0, 0, 0x0e]]);

        let mut script = Server::new(1);
        script.ok(0, 0, 0x0002);
        let mut buf = CumulateBuffer::new();
        assert!(!task.can_decode(&buf));
        buf.extend(&script.into_bytes());
        assert!(task.can_decode(&buf));
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::NoMoreResult);
        assert!(matches!(task.take_result(), Some(Ok(TaskOutput::Done))));
    }

    #[test]
    fn reset_error_is_recoverable() {
        let mut session = session_with(CLIENT_PROTOCOL_41);
        let mut task = Task::reset();
        task.start(&session).unwrap();
        let mut script = Server::new(1);
        script.err(1047, "08S01", "Unknown command");
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::EndOnError);
        match task.take_result() {
            Some(Err(e)) => assert!(!e.is_fatal()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn quit_and_close_complete_on_start() {
        let session = session_with(CLIENT_PROTOCOL_41);
        let mut quit = Task::quit();
        assert!(!quit.expects_response());
        quit.start(&session).unwrap();
        assert!(matches!(quit.take_result(), Some(Ok(TaskOutput::Done))));

        let stmt = PreparedStatement::new("SELECT 1".into(), 4, Vec::new(), Vec::new());
        let mut close = Task::close_statement(stmt.clone());
        close.start(&session).unwrap();
        assert!(stmt.is_closed());
        assert!(close.take_result().is_some());

        // a closed statement cannot be executed
        let mut exec = Task::execute(stmt, Vec::new(), DiscardSink);
        assert!(matches!(exec.start(&session), Err(Error::IllegalState(_))));
        assert!(exec.take_outbound().is_empty());
    }

    #[test]
    fn cursor_execute_requests_fetches() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let stmt = PreparedStatement::new(
            "SELECT a FROM t".into(),
            8,
            Vec::new(),
            vec![column("a", FieldType::Long)],
        );
        let mut task = Task::execute(stmt, Vec::new(), CollectingSink::default()).with_fetch_size(1);
        task.start(&session).unwrap();
        let execute = task.take_outbound();
        // cursor flag set
        assert_eq!(split_frames(&execute[0])[0].1[5], 0x01);

        let mut first = Server::new(1);
        first.column_count(1);
        first.column("a", FieldType::Long);
        first.ok_eof(crate::protocol::server_status::SERVER_STATUS_CURSOR_EXISTS);
        let mut buf = CumulateBuffer::new();
        buf.extend(&first.into_bytes());
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::MoreFetch);
        let fetch = task.take_outbound();
        let frames = split_frames(&fetch[0]);
        assert_eq!(frames[0].0.sequence_id, 0);
        assert_eq!(frames[0].1, vec![0x1c, 8, 0, 0, 0, 1, 0, 0, 0]);

        let mut batch = Server::new(1);
        batch.packet(vec![0x00, 0x00, 5, 0, 0, 0]);
        batch.ok_eof(
            crate::protocol::server_status::SERVER_STATUS_CURSOR_EXISTS
                | crate::protocol::server_status::SERVER_STATUS_LAST_ROW_SENT,
        );
        buf.extend(&batch.into_bytes());
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::NoMoreResult);
        assert!(matches!(task.take_result(), Some(Ok(TaskOutput::Done))));
    }

    #[test]
    fn prepare_task_yields_statement() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut task = Task::prepare("SELECT ?");
        task.start(&session).unwrap();
        assert!(task.statement_tracker().unwrap().obtain_statement_id().is_err());

        let mut script = Server::new(1);
        script.packet(vec![0x00, 2, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        script.column("?", FieldType::VarString);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::NoMoreResult);
        assert_eq!(task.statement_tracker().unwrap().obtain_statement_id().unwrap(), 2);
        match task.take_result() {
            Some(Ok(TaskOutput::Prepared(stmt))) => {
                assert_eq!(stmt.param_count(), 1);
                assert_eq!(stmt.sql(), "SELECT ?");
            }
            other => panic!("expected statement, got {other:?}"),
        }
    }

    #[test]
    fn query_rows_reach_sink() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let sink = CollectingSink::default();
        let rows = sink.shared_rows();
        let mut task = Task::query("SELECT 1", sink);
        task.start(&session).unwrap();

        let mut script = Server::new(1);
        script.column_count(1);
        script.column("1", FieldType::LongLong);
        script.text_row(&[Some("1")]);
        script.ok_eof(0);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        assert_eq!(task.decode(&mut buf, &mut session).unwrap(), States::NoMoreResult);
        assert_eq!(rows.lock().unwrap()[0].values(), &[Value::BigInt(1)]);
    }
}
