//! Prepared-statement state.
//!
//! [`PreparedStatement`] is the caller's handle to a server-side statement.
//! [`StatementTracker`] follows one prepare or execute through its task:
//! it owns the statement metadata once the PREPARE response completes and
//! brackets the long-data window on the task's sequence tracker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use taskwire_core::{Error, Result};

use crate::protocol::reader::PacketReader;
use crate::protocol::{CumulateBuffer, PacketType, SequenceTracker, read_payload};
use crate::session::SessionState;
use crate::types::ColumnMeta;

use super::CancelFlag;
use super::result::States;

/// Parsed COM_STMT_PREPARE_OK header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let status = reader.read_u8("status")?;
        if status != 0x00 {
            return Err(Error::protocol(format!(
                "prepare response must start with 0x00, got {status:#04x}"
            )));
        }
        let statement_id = reader.read_u32_le("statement id")?;
        let num_columns = reader.read_u16_le("column count")?;
        let num_params = reader.read_u16_le("parameter count")?;
        // reserved filler, then warnings on 4.1+ servers
        let warnings = if reader.remaining() >= 3 {
            reader.skip(1, "filler")?;
            reader.read_u16_le("warnings")?
        } else {
            0
        };
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

struct StatementInner {
    sql: String,
    id: u32,
    params: Vec<ColumnMeta>,
    columns: Vec<ColumnMeta>,
    closed: AtomicBool,
}

/// A statement prepared on one connection.
///
/// Cheap to clone; every clone refers to the same server-side statement.
#[derive(Clone)]
pub struct PreparedStatement {
    inner: Arc<StatementInner>,
}

impl PreparedStatement {
    pub(crate) fn new(
        sql: String,
        id: u32,
        params: Vec<ColumnMeta>,
        columns: Vec<ColumnMeta>,
    ) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                sql,
                id,
                params,
                columns,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Metadata for each `?` placeholder, in order.
    pub fn params(&self) -> &[ColumnMeta] {
        &self.inner.params
    }

    /// Result columns, empty for statements that return no rows.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.inner.columns
    }

    pub fn param_count(&self) -> usize {
        self.inner.params.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("id", &self.inner.id)
            .field("sql", &self.inner.sql)
            .field("params", &self.inner.params.len())
            .field("columns", &self.inner.columns.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum StatementState {
    Preparing,
    Prepared(PreparedStatement),
    Closed,
}

/// Per-task view of a prepared statement.
#[derive(Debug)]
pub struct StatementTracker {
    state: StatementState,
    fetch_size: u32,
    result_index: usize,
    cancel: CancelFlag,
}

impl StatementTracker {
    /// Tracker for a PREPARE still waiting on its response.
    pub fn preparing(cancel: CancelFlag) -> Self {
        Self {
            state: StatementState::Preparing,
            fetch_size: 0,
            result_index: 0,
            cancel,
        }
    }

    /// Tracker for executing an already prepared statement.
    ///
    /// A non-zero `fetch_size` opens a read-only cursor.
    pub fn for_statement(statement: PreparedStatement, fetch_size: u32, cancel: CancelFlag) -> Self {
        let state = if statement.is_closed() {
            StatementState::Closed
        } else {
            StatementState::Prepared(statement)
        };
        Self {
            state,
            fetch_size,
            result_index: 0,
            cancel,
        }
    }

    pub(crate) fn mark_prepared(&mut self, statement: PreparedStatement) {
        self.state = StatementState::Prepared(statement);
    }

    pub(crate) fn mark_closed(&mut self) {
        if let StatementState::Prepared(stmt) = &self.state {
            stmt.mark_closed();
        }
        self.state = StatementState::Closed;
    }

    pub fn statement(&self) -> Result<&PreparedStatement> {
        match &self.state {
            StatementState::Prepared(stmt) => Ok(stmt),
            StatementState::Preparing => Err(Error::illegal_state(
                "statement is still being prepared",
            )),
            StatementState::Closed => Err(Error::illegal_state("statement is closed")),
        }
    }

    pub fn obtain_statement_id(&self) -> Result<u32> {
        self.statement().map(PreparedStatement::id)
    }

    pub fn obtain_parameter_metas(&self) -> Result<&[ColumnMeta]> {
        self.statement().map(PreparedStatement::params)
    }

    /// Whether MORE_FETCH may be answered with COM_STMT_FETCH.
    pub fn support_fetch(&self) -> bool {
        self.fetch_size > 0
            && matches!(&self.state, StatementState::Prepared(s) if !s.columns().is_empty())
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    pub fn result_index(&self) -> usize {
        self.result_index
    }

    pub(crate) fn next_result(&mut self) -> usize {
        self.result_index += 1;
        self.result_index
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Open the long-data window. Only valid once the statement is prepared.
    pub fn start_safe_sequence_id(&self, sequence: &mut SequenceTracker) -> Result<u8> {
        self.statement()?;
        sequence.open_window()
    }

    /// Start numbering the next long-data message from the window start.
    pub fn start_long_data_message(&self, sequence: &mut SequenceTracker) -> Result<()> {
        sequence.begin_windowed_message()
    }

    /// The only way to draw a sequence id while the window is open.
    pub fn safely_add_and_get_sequence_id(&self, sequence: &mut SequenceTracker) -> Result<u8> {
        sequence.windowed_add_and_get()
    }

    /// Close the window; returns the id the execute packet will carry.
    pub fn end_safe_sequence_id(&self, sequence: &mut SequenceTracker) -> Result<u8> {
        sequence.close_window()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreparePhase {
    Header,
    Params { remaining: u16 },
    ParamEof,
    Columns { remaining: u16 },
    ColumnEof,
    Done,
}

/// Reads a COM_STMT_PREPARE response.
///
/// The response is PREPARE_OK, then one definition per parameter, then one
/// per result column. Each definition group is followed by EOF unless
/// `CLIENT_DEPRECATE_EOF` is negotiated.
#[derive(Debug)]
pub struct PrepareResponseReader {
    sql: String,
    phase: PreparePhase,
    ok: Option<PrepareOk>,
    params: Vec<ColumnMeta>,
    columns: Vec<ColumnMeta>,
    failure: Option<Error>,
}

impl PrepareResponseReader {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            phase: PreparePhase::Header,
            ok: None,
            params: Vec::new(),
            columns: Vec::new(),
            failure: None,
        }
    }

    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    /// Decode buffered packets. Returns the statement once complete.
    pub fn decode(
        &mut self,
        buf: &mut CumulateBuffer,
        sequence: &mut SequenceTracker,
        session: &SessionState,
    ) -> Result<(States, Option<PreparedStatement>)> {
        if !session.supports_protocol41() {
            return Err(Error::unsupported("COM_STMT_PREPARE requires CLIENT_PROTOCOL_41"));
        }
        let deprecate_eof = session.supports_deprecate_eof();
        loop {
            if self.phase == PreparePhase::Done {
                return Ok((States::NoMoreResult, self.finish()));
            }
            let Some(payload) = read_payload(buf, sequence)? else {
                return Ok((States::MoreCumulate, None));
            };
            match self.phase {
                PreparePhase::Header => {
                    if payload.first() == Some(&0xFF) {
                        let err = PacketReader::new(&payload).parse_err_packet()?;
                        self.failure = Some(Error::Server(err.into_server_error(Some(&self.sql))));
                        self.phase = PreparePhase::Done;
                        return Ok((States::EndOnError, None));
                    }
                    let ok = PrepareOk::parse(&payload)?;
                    tracing::debug!(
                        statement_id = ok.statement_id,
                        params = ok.num_params,
                        columns = ok.num_columns,
                        "statement prepared"
                    );
                    self.params.reserve(usize::from(ok.num_params));
                    self.columns.reserve(usize::from(ok.num_columns));
                    self.ok = Some(ok);
                    self.phase = if ok.num_params > 0 {
                        PreparePhase::Params {
                            remaining: ok.num_params,
                        }
                    } else {
                        self.columns_phase()
                    };
                }
                PreparePhase::Params { remaining } => {
                    self.params.push(ColumnMeta::parse(&payload)?);
                    self.phase = if remaining > 1 {
                        PreparePhase::Params { remaining: remaining - 1 }
                    } else if deprecate_eof {
                        self.columns_phase()
                    } else {
                        PreparePhase::ParamEof
                    };
                }
                PreparePhase::ParamEof => {
                    expect_eof(&payload)?;
                    self.phase = self.columns_phase();
                }
                PreparePhase::Columns { remaining } => {
                    self.columns.push(ColumnMeta::parse(&payload)?);
                    self.phase = if remaining > 1 {
                        PreparePhase::Columns { remaining: remaining - 1 }
                    } else if deprecate_eof {
                        PreparePhase::Done
                    } else {
                        PreparePhase::ColumnEof
                    };
                }
                PreparePhase::ColumnEof => {
                    expect_eof(&payload)?;
                    self.phase = PreparePhase::Done;
                }
                PreparePhase::Done => return Ok((States::NoMoreResult, self.finish())),
            }
        }
    }

    fn columns_phase(&self) -> PreparePhase {
        match self.ok {
            Some(ok) if ok.num_columns > 0 => PreparePhase::Columns {
                remaining: ok.num_columns,
            },
            _ => PreparePhase::Done,
        }
    }

    fn finish(&mut self) -> Option<PreparedStatement> {
        let ok = self.ok.take()?;
        Some(PreparedStatement::new(
            std::mem::take(&mut self.sql),
            ok.statement_id,
            std::mem::take(&mut self.params),
            std::mem::take(&mut self.columns),
        ))
    }
}

fn expect_eof(payload: &[u8]) -> Result<()> {
    if PacketType::classify(payload, false) != PacketType::Eof {
        return Err(Error::protocol("expected EOF after prepare definitions"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    fn statement(params: usize, columns: usize) -> PreparedStatement {
        let meta = crate::test_support::column("c", crate::types::FieldType::Long);
        PreparedStatement::new(
            "SELECT ?".to_string(),
            7,
            vec![meta.clone(); params],
            vec![meta; columns],
        )
    }

    #[test]
    fn prepare_ok_parse() {
        let mut w = PacketWriter::new();
        w.write_u8(0);
        w.write_u32_le(9);
        w.write_u16_le(2);
        w.write_u16_le(1);
        w.write_u8(0);
        w.write_u16_le(3);
        let ok = PrepareOk::parse(w.as_bytes()).unwrap();
        assert_eq!(ok.statement_id, 9);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
        assert_eq!(ok.warnings, 3);

        assert!(PrepareOk::parse(&[0xFF, 0, 0]).is_err());
    }

    #[test]
    fn obtain_before_prepared_is_illegal() {
        let tracker = StatementTracker::preparing(CancelFlag::default());
        assert!(matches!(tracker.obtain_statement_id(), Err(Error::IllegalState(_))));
        assert!(matches!(tracker.obtain_parameter_metas(), Err(Error::IllegalState(_))));

        let mut seq = SequenceTracker::new();
        assert!(tracker.start_safe_sequence_id(&mut seq).is_err());
        assert!(!seq.is_window_open());
    }

    #[test]
    fn prepared_tracker_exposes_metadata() {
        let mut tracker = StatementTracker::preparing(CancelFlag::default());
        tracker.mark_prepared(statement(2, 1));
        assert_eq!(tracker.obtain_statement_id().unwrap(), 7);
        assert_eq!(tracker.obtain_parameter_metas().unwrap().len(), 2);
        assert!(!tracker.support_fetch());
    }

    #[test]
    fn fetch_support_needs_cursor_and_columns() {
        let cancel = CancelFlag::default();
        assert!(StatementTracker::for_statement(statement(0, 1), 10, cancel.clone()).support_fetch());
        assert!(!StatementTracker::for_statement(statement(0, 0), 10, cancel.clone()).support_fetch());
        assert!(!StatementTracker::for_statement(statement(0, 1), 0, cancel).support_fetch());
    }

    #[test]
    fn safe_window_brackets_long_data() {
        let tracker = StatementTracker::for_statement(statement(1, 0), 0, CancelFlag::default());
        let mut seq = SequenceTracker::new();
        assert_eq!(tracker.start_safe_sequence_id(&mut seq).unwrap(), 0);
        assert!(seq.add_and_get().is_err());
        tracker.start_long_data_message(&mut seq).unwrap();
        assert_eq!(tracker.safely_add_and_get_sequence_id(&mut seq).unwrap(), 0);
        tracker.start_long_data_message(&mut seq).unwrap();
        assert_eq!(tracker.safely_add_and_get_sequence_id(&mut seq).unwrap(), 0);
        assert_eq!(tracker.safely_add_and_get_sequence_id(&mut seq).unwrap(), 1);
        assert_eq!(tracker.end_safe_sequence_id(&mut seq).unwrap(), 0);
        assert_eq!(seq.add_and_get().unwrap(), 0);
    }

    #[test]
    fn closed_statement_cannot_execute() {
        let stmt = statement(0, 0);
        let mut tracker = StatementTracker::for_statement(stmt.clone(), 0, CancelFlag::default());
        tracker.mark_closed();
        assert!(stmt.is_closed());
        assert!(tracker.obtain_statement_id().is_err());

        let again = StatementTracker::for_statement(stmt, 0, CancelFlag::default());
        assert!(again.obtain_statement_id().is_err());
    }

    #[test]
    fn tracker_observes_cancellation() {
        let cancel = CancelFlag::default();
        let mut tracker = StatementTracker::for_statement(statement(0, 1), 0, cancel.clone());
        assert!(!tracker.is_cancelled());
        cancel.cancel();
        assert!(tracker.is_cancelled());
        assert_eq!(tracker.next_result(), 1);
        assert_eq!(tracker.result_index(), 1);
    }

    #[test]
    fn prepare_response_with_eofs() {
        use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
        use crate::test_support::{Server, session_with};
        use crate::types::FieldType;

        let session = session_with(CLIENT_PROTOCOL_41);
        let mut script = Server::new(1);
        script.prepare_ok(12, 1, 2);
        script.column("?", FieldType::VarString);
        script.column("?", FieldType::LongLong);
        script.eof(0);
        script.column("name", FieldType::VarString);
        script.eof(0);
        let bytes = script.into_bytes();

        let mut reader = PrepareResponseReader::new("SELECT name FROM t WHERE a = ? AND b = ?");
        let mut buf = CumulateBuffer::new();
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();

        // everything but the last byte leaves the statement pending
        buf.extend(&bytes[..bytes.len() - 1]);
        let (state, stmt) = reader.decode(&mut buf, &mut seq, &session).unwrap();
        assert_eq!(state, States::MoreCumulate);
        assert!(stmt.is_none());

        buf.extend(&bytes[bytes.len() - 1..]);
        let (state, stmt) = reader.decode(&mut buf, &mut seq, &session).unwrap();
        assert_eq!(state, States::NoMoreResult);
        let stmt = stmt.unwrap();
        assert_eq!(stmt.id(), 12);
        assert_eq!(stmt.param_count(), 2);
        assert_eq!(stmt.columns()[0].name(), "name");
        assert!(buf.is_empty());
    }

    #[test]
    fn prepare_response_deprecate_eof_no_params() {
        use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_PROTOCOL_41};
        use crate::test_support::{Server, session_with};

        let session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.prepare_ok(3, 0, 0);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();

        let mut reader = PrepareResponseReader::new("DO 1");
        let (state, stmt) = reader.decode(&mut buf, &mut seq, &session).unwrap();
        assert_eq!(state, States::NoMoreResult);
        assert_eq!(stmt.unwrap().param_count(), 0);
    }

    #[test]
    fn prepare_error_keeps_sql() {
        use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
        use crate::test_support::{Server, session_with};

        let session = session_with(CLIENT_PROTOCOL_41);
        let mut script = Server::new(1);
        script.err(1064, "42000", "You have an error in your SQL syntax");
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();

        let mut reader = PrepareResponseReader::new("SELEC 1");
        let (state, stmt) = reader.decode(&mut buf, &mut seq, &session).unwrap();
        assert_eq!(state, States::EndOnError);
        assert!(stmt.is_none());
        assert_eq!(reader.take_failure().unwrap().sql(), Some("SELEC 1"));
    }
}
