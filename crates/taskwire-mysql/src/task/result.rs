//! Result set decoding.
//!
//! A response is read in phases: a header packet (OK, ERR, LOCAL INFILE
//! request or column count), the column definitions, an EOF after them
//! unless `CLIENT_DEPRECATE_EOF` is negotiated, then rows until a
//! terminator. Rows are pushed to the [`ResultSink`] as soon as each one
//! is decoded.

use std::sync::Arc;

use taskwire_core::{ConsumerError, Error, Result, Value};

use crate::protocol::reader::PacketReader;
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_CURSOR_EXISTS, SERVER_STATUS_LAST_ROW_SENT,
};
use crate::protocol::{CumulateBuffer, PacketType, SequenceTracker, encode_frames, read_payload};
use crate::session::SessionState;
use crate::types::{ColumnMeta, decode_binary_row, decode_text_row};

use super::CancelFlag;

/// Outcome of one decode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum States {
    /// Not enough input buffered; call again after more bytes arrive.
    MoreCumulate,
    /// A result set finished and another one follows.
    MoreResult,
    /// A cursor returned its batch; issue COM_STMT_FETCH for more rows.
    MoreFetch,
    /// The response is complete.
    NoMoreResult,
    /// The response is complete and the task failed.
    EndOnError,
}

impl States {
    pub fn is_terminal(self) -> bool {
        matches!(self, States::NoMoreResult | States::EndOnError)
    }
}

/// Summary of one completed result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultStates {
    /// Position of this result within the response, starting at 0
    pub result_index: usize,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub server_status: u16,
    pub warnings: u16,
    pub info: String,
}

impl ResultStates {
    pub fn has_more_results(&self) -> bool {
        self.server_status & SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn has_more_fetch(&self) -> bool {
        self.server_status & SERVER_STATUS_CURSOR_EXISTS != 0
            && self.server_status & SERVER_STATUS_LAST_ROW_SENT == 0
    }
}

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    result_index: usize,
    columns: Arc<[ColumnMeta]>,
    values: Vec<Value>,
}

impl ResultRow {
    pub fn new(result_index: usize, columns: Arc<[ColumnMeta]>, values: Vec<Value>) -> Self {
        Self {
            result_index,
            columns,
            values,
        }
    }

    pub fn result_index(&self) -> usize {
        self.result_index
    }

    pub fn columns(&self) -> &Arc<[ColumnMeta]> {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.alias == name)?;
        self.values.get(index)
    }

    /// Convert the value at `index` into a Rust type.
    pub fn get_as<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self
            .values
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Custom(format!("column index {index} out of range")))?;
        T::try_from(value)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Receives what a result set reader decodes.
///
/// Returning an error stops delivery for the rest of the response; the
/// reader keeps consuming packets so the connection stays in sync, and
/// the task then fails with that error.
pub trait ResultSink: Send {
    /// Column definitions of a result set, before its first row.
    fn on_columns(&mut self, result_index: usize, columns: &Arc<[ColumnMeta]>) -> std::result::Result<(), ConsumerError> {
        let _ = (result_index, columns);
        Ok(())
    }

    fn on_row(&mut self, row: ResultRow) -> std::result::Result<(), ConsumerError>;

    /// Terminal summary of a result set.
    fn on_states(&mut self, states: ResultStates) -> std::result::Result<(), ConsumerError>;

    /// `false` pauses row decoding; buffered bytes are kept.
    fn has_demand(&self) -> bool {
        true
    }
}

/// Sink that discards everything, for commands without rows.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl ResultSink for DiscardSink {
    fn on_row(&mut self, _row: ResultRow) -> std::result::Result<(), ConsumerError> {
        Ok(())
    }

    fn on_states(&mut self, _states: ResultStates) -> std::result::Result<(), ConsumerError> {
        Ok(())
    }
}

/// Row encoding of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY: every value a length-encoded string
    Text,
    /// COM_STMT_EXECUTE: NULL bitmap plus typed values
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    ColumnDefs { remaining: u64 },
    ColumnEof,
    Rows,
    Done,
}

/// Decodes one command response into the sink.
#[derive(Debug)]
pub struct ResultSetReader {
    format: RowFormat,
    phase: Phase,
    result_index: usize,
    pending_columns: Vec<ColumnMeta>,
    columns: Option<Arc<[ColumnMeta]>>,
    cursor: bool,
    sql: Option<String>,
    failure: Option<Error>,
    outbound: Vec<Vec<u8>>,
}

impl ResultSetReader {
    pub fn new(format: RowFormat) -> Self {
        Self {
            format,
            phase: Phase::Header,
            result_index: 0,
            pending_columns: Vec::new(),
            columns: None,
            cursor: false,
            sql: None,
            failure: None,
            outbound: Vec::new(),
        }
    }

    /// SQL text attached to server errors.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Treat CURSOR_EXISTS terminators as MORE_FETCH.
    pub fn with_cursor(mut self, cursor: bool) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn result_index(&self) -> usize {
        self.result_index
    }

    /// Columns of the result set being read, once complete.
    pub fn columns(&self) -> Option<&Arc<[ColumnMeta]>> {
        self.columns.as_ref()
    }

    /// First error recorded while decoding (server, consumer or cancellation).
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    pub(crate) fn record_failure(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Framed packets the reader needs sent (LOCAL INFILE refusal).
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Prepare to read the rows of the next COM_STMT_FETCH.
    pub(crate) fn resume_fetch(&mut self) {
        self.phase = Phase::Rows;
    }

    /// Decode as many packets as are buffered.
    ///
    /// `Err` is reserved for failures that break the connection; server
    /// errors end the response with [`States::EndOnError`].
    pub fn decode(
        &mut self,
        buf: &mut CumulateBuffer,
        sequence: &mut SequenceTracker,
        session: &mut SessionState,
        sink: &mut dyn ResultSink,
        cancel: &CancelFlag,
    ) -> Result<States> {
        if !session.supports_protocol41() {
            return Err(Error::unsupported(
                "result sets require CLIENT_PROTOCOL_41",
            ));
        }
        let deprecate_eof = session.supports_deprecate_eof();

        loop {
            if self.phase == Phase::Done {
                return Ok(self.finish());
            }
            // checked before every header and row; the rest is drained unseen
            if cancel.is_cancelled() {
                self.record_failure(Error::Cancelled);
            }
            if self.phase == Phase::Rows && self.failure.is_none() && !sink.has_demand() {
                return Ok(States::MoreCumulate);
            }
            let Some(payload) = read_payload(buf, sequence)? else {
                return Ok(States::MoreCumulate);
            };

            match self.phase {
                Phase::Header => {
                    if let Some(state) = self.read_header(&payload, sequence, session, sink)? {
                        return Ok(state);
                    }
                }
                Phase::ColumnDefs { remaining } => {
                    if payload.first() == Some(&0xFF) {
                        return Ok(self.server_error(&payload));
                    }
                    self.pending_columns.push(ColumnMeta::parse(&payload)?);
                    if remaining > 1 {
                        self.phase = Phase::ColumnDefs {
                            remaining: remaining - 1,
                        };
                    } else {
                        self.complete_columns(sink);
                        self.phase = if deprecate_eof { Phase::Rows } else { Phase::ColumnEof };
                    }
                }
                Phase::ColumnEof => {
                    if PacketType::classify(&payload, false) != PacketType::Eof {
                        return Err(Error::protocol("expected EOF after column definitions"));
                    }
                    let eof = PacketReader::new(&payload).parse_eof_packet()?;
                    session.update_status(eof.status_flags);
                    self.phase = Phase::Rows;
                    if self.cursor && eof.status_flags & SERVER_STATUS_CURSOR_EXISTS != 0 {
                        return Ok(self.more_fetch());
                    }
                }
                Phase::Rows => {
                    if payload.first() == Some(&0xFF) {
                        return Ok(self.server_error(&payload));
                    }
                    if PacketType::classify(&payload, deprecate_eof) == PacketType::Eof {
                        return self.read_terminator(&payload, session, sink, deprecate_eof);
                    }
                    self.read_row(&payload, session, sink)?;
                }
                Phase::Done => return Ok(self.finish()),
            }
        }
    }

    /// Returns `Some(state)` when the header packet ends this result.
    fn read_header(
        &mut self,
        payload: &[u8],
        sequence: &mut SequenceTracker,
        session: &mut SessionState,
        sink: &mut dyn ResultSink,
    ) -> Result<Option<States>> {
        match payload.first() {
            Some(0x00) => {
                let ok = PacketReader::new(payload).parse_ok_packet(session.capabilities())?;
                session.update_status(ok.status_flags);
                let states = ResultStates {
                    result_index: self.result_index,
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                    server_status: ok.status_flags,
                    warnings: ok.warnings,
                    info: ok.info,
                };
                Ok(Some(self.end_result(states, sink)))
            }
            Some(0xFF) => Ok(Some(self.server_error(payload))),
            Some(0xFB) => {
                let file = String::from_utf8_lossy(&payload[1..]).into_owned();
                tracing::debug!(file = %file, "declining LOCAL INFILE request");
                self.outbound.push(encode_frames(&[], sequence)?);
                Ok(None)
            }
            Some(_) => {
                let count = PacketReader::new(payload).read_lenenc_int("column count")?;
                if count == 0 {
                    return Err(Error::protocol("result set with zero columns"));
                }
                self.pending_columns = Vec::with_capacity(count.min(4096) as usize);
                self.phase = Phase::ColumnDefs { remaining: count };
                Ok(None)
            }
            None => Err(Error::protocol("empty result set header")),
        }
    }

    fn complete_columns(&mut self, sink: &mut dyn ResultSink) {
        let columns: Arc<[ColumnMeta]> = std::mem::take(&mut self.pending_columns).into();
        if self.failure.is_none() {
            if let Err(e) = sink.on_columns(self.result_index, &columns) {
                self.record_failure(Error::Consumer(e));
            }
        }
        self.columns = Some(columns);
    }

    fn read_row(
        &mut self,
        payload: &[u8],
        session: &SessionState,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        // keep consuming, but stop delivering, once the task has failed
        if self.failure.is_some() {
            return Ok(());
        }
        let columns = self
            .columns
            .clone()
            .ok_or_else(|| Error::protocol("row received before column definitions"))?;
        let values = match self.format {
            RowFormat::Text => decode_text_row(payload, &columns, session.collations())?,
            RowFormat::Binary => decode_binary_row(payload, &columns, session.collations())?,
        };
        if let Err(e) = sink.on_row(ResultRow::new(self.result_index, columns, values)) {
            self.record_failure(Error::Consumer(e));
        }
        Ok(())
    }

    fn read_terminator(
        &mut self,
        payload: &[u8],
        session: &mut SessionState,
        sink: &mut dyn ResultSink,
        deprecate_eof: bool,
    ) -> Result<States> {
        let mut reader = PacketReader::new(payload);
        let states = if deprecate_eof {
            let ok = reader.parse_ok_packet(session.capabilities())?;
            ResultStates {
                result_index: self.result_index,
                affected_rows: ok.affected_rows,
                last_insert_id: ok.last_insert_id,
                server_status: ok.status_flags,
                warnings: ok.warnings,
                info: ok.info,
            }
        } else {
            let eof = reader.parse_eof_packet()?;
            ResultStates {
                result_index: self.result_index,
                server_status: eof.status_flags,
                warnings: eof.warnings,
                ..ResultStates::default()
            }
        };
        session.update_status(states.server_status);

        if self.cursor && states.has_more_fetch() {
            return Ok(self.more_fetch());
        }
        Ok(self.end_result(states, sink))
    }

    fn more_fetch(&mut self) -> States {
        // a cancelled cursor is abandoned rather than fetched
        if self.failure.is_some() {
            self.phase = Phase::Done;
            return States::EndOnError;
        }
        States::MoreFetch
    }

    fn end_result(&mut self, states: ResultStates, sink: &mut dyn ResultSink) -> States {
        let more = states.has_more_results();
        if self.failure.is_none() {
            if let Err(e) = sink.on_states(states) {
                self.record_failure(Error::Consumer(e));
            }
        }
        self.columns = None;
        if more {
            self.result_index += 1;
            self.phase = Phase::Header;
            States::MoreResult
        } else {
            self.phase = Phase::Done;
            self.finish()
        }
    }

    fn server_error(&mut self, payload: &[u8]) -> States {
        let error = match PacketReader::new(payload).parse_err_packet() {
            Ok(err) => Error::Server(err.into_server_error(self.sql.as_deref())),
            Err(e) => e,
        };
        self.record_failure(error);
        self.phase = Phase::Done;
        States::EndOnError
    }

    fn finish(&self) -> States {
        if self.failure.is_some() {
            States::EndOnError
        } else {
            States::NoMoreResult
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_PROTOCOL_41};
    use crate::test_support::{CollectingSink, Server, session_with};
    use crate::types::FieldType;

    fn decode_all(
        reader: &mut ResultSetReader,
        bytes: &[u8],
        session: &mut SessionState,
        sink: &mut CollectingSink,
    ) -> Vec<States> {
        let mut buf = CumulateBuffer::new();
        buf.extend(bytes);
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();
        let mut states = Vec::new();
        loop {
            let state = reader.decode(&mut buf, &mut seq, session, sink, &CancelFlag::default()).unwrap();
            states.push(state);
            if state != States::MoreResult {
                return states;
            }
        }
    }

    #[test]
    fn ok_only_response() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.ok(3, 9, 0x0002);
        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let states = decode_all(&mut reader, &script.into_bytes(), &mut session, &mut sink);
        assert_eq!(states, vec![States::NoMoreResult]);
        assert_eq!(sink.states.len(), 1);
        assert_eq!(sink.states[0].affected_rows, 3);
        assert_eq!(sink.states[0].last_insert_id, 9);
        assert!(session.autocommit());
    }

    #[test]
    fn legacy_eof_result_set() {
        let mut session = session_with(CLIENT_PROTOCOL_41);
        let mut script = Server::new(1);
        script.column_count(2);
        script.column("id", FieldType::Long);
        script.column("name", FieldType::VarString);
        script.eof(0);
        script.text_row(&[Some("1"), Some("a")]);
        script.text_row(&[Some("2"), None]);
        script.eof(0);

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let states = decode_all(&mut reader, &script.into_bytes(), &mut session, &mut sink);
        assert_eq!(states, vec![States::NoMoreResult]);
        assert_eq!(sink.columns[0].len(), 2);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.rows[1].values(), &[Value::Int(2), Value::Null]);
        assert_eq!(sink.rows[0].get_by_name("name"), Some(&Value::Text("a".to_string())));
    }

    #[test]
    fn more_results_then_done() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        script.text_row(&[Some("1")]);
        script.ok_eof(SERVER_MORE_RESULTS_EXISTS);
        script.ok(0, 0, 0);

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let states = decode_all(&mut reader, &script.into_bytes(), &mut session, &mut sink);
        assert_eq!(states, vec![States::MoreResult, States::NoMoreResult]);
        assert_eq!(sink.states.len(), 2);
        assert_eq!(sink.states[1].result_index, 1);
        assert_eq!(reader.result_index(), 1);
    }

    #[test]
    fn server_error_mid_rows_ends_on_error() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        script.text_row(&[Some("1")]);
        script.err(1317, "70100", "Query execution was interrupted");

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text).with_sql("SELECT a FROM t");
        let states = decode_all(&mut reader, &script.into_bytes(), &mut session, &mut sink);
        assert_eq!(states, vec![States::EndOnError]);
        match reader.take_failure() {
            Some(Error::Server(e)) => {
                assert_eq!(e.code, 1317);
                assert_eq!(e.sql.as_deref(), Some("SELECT a FROM t"));
            }
            other => panic!("expected server error, got {other:?}"),
        }
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn consumer_error_drains_and_fails() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        for i in 0..3 {
            script.text_row(&[Some(i.to_string().as_str())]);
        }
        script.ok_eof(0);

        let mut sink = CollectingSink {
            fail_after: Some(1),
            ..CollectingSink::default()
        };
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();
        let state = reader
            .decode(&mut buf, &mut seq, &mut session, &mut sink, &CancelFlag::default())
            .unwrap();
        assert_eq!(state, States::EndOnError);
        assert!(buf.is_empty());
        assert_eq!(sink.rows.len(), 1);
        assert!(sink.states.is_empty());
        assert!(matches!(reader.take_failure(), Some(Error::Consumer(_))));
    }

    #[test]
    fn no_demand_pauses_without_consuming() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        script.text_row(&[Some("1")]);
        script.ok_eof(0);

        let mut sink = CollectingSink {
            demand: Some(0),
            ..CollectingSink::default()
        };
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();

        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &CancelFlag::default()).unwrap();
        assert_eq!(state, States::MoreCumulate);
        assert_eq!(sink.columns.len(), 1);
        let buffered = buf.len();
        assert!(buffered > 0);

        sink.demand = None;
        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &CancelFlag::default()).unwrap();
        assert_eq!(state, States::NoMoreResult);
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn cancellation_drains_remaining_rows() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        script.text_row(&[Some("1")]);
        script.ok_eof(0);

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &cancel).unwrap();
        assert_eq!(state, States::EndOnError);
        assert!(buf.is_empty());
        assert!(sink.rows.is_empty());
        assert!(matches!(reader.take_failure(), Some(Error::Cancelled)));
    }

    #[test]
    fn cancel_raised_mid_batch_stops_delivery() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        for value in ["1", "2", "3", "4", "5"] {
            script.text_row(&[Some(value)]);
        }
        script.ok_eof(0);

        let cancel = CancelFlag::new();
        let mut sink = CollectingSink {
            cancel_on_row: Some((2, cancel.clone())),
            ..CollectingSink::default()
        };
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();

        // the whole response is buffered; the flag flips inside this call
        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &cancel).unwrap();
        assert_eq!(state, States::EndOnError);
        assert_eq!(sink.rows.len(), 2);
        assert!(sink.states.is_empty());
        assert!(buf.is_empty());
        assert!(matches!(reader.take_failure(), Some(Error::Cancelled)));
    }

    #[test]
    fn cursor_terminator_requests_fetch() {
        let mut session = session_with(CLIENT_PROTOCOL_41);
        let mut script = Server::new(1);
        script.column_count(1);
        script.column("a", FieldType::Long);
        script.eof(SERVER_STATUS_CURSOR_EXISTS);

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Binary).with_cursor(true);
        let states = decode_all(&mut reader, &script.into_bytes(), &mut session, &mut sink);
        assert_eq!(states, vec![States::MoreFetch]);
        assert!(sink.states.is_empty());
    }

    #[test]
    fn local_infile_is_declined() {
        let mut session = session_with(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        let mut script = Server::new(1);
        let mut request = vec![0xFB];
        request.extend_from_slice(b"/etc/passwd");
        script.packet(request);

        let mut sink = CollectingSink::default();
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut buf = CumulateBuffer::new();
        buf.extend(&script.into_bytes());
        let mut seq = SequenceTracker::new();
        seq.add_and_get().unwrap();
        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &CancelFlag::default()).unwrap();
        assert_eq!(state, States::MoreCumulate);
        // empty packet at sequence id 2
        assert_eq!(reader.take_outbound(), vec![vec![0, 0, 0, 2]]);

        let mut reply = Server::new(3);
        reply.err(1148, "42000", "The used command is not allowed with this MySQL version");
        buf.extend(&reply.into_bytes());
        let state = reader.decode(&mut buf, &mut seq, &mut session, &mut sink, &CancelFlag::default()).unwrap();
        assert_eq!(state, States::EndOnError);
    }

    #[test]
    fn protocol41_is_required() {
        let mut session = session_with(0);
        let mut reader = ResultSetReader::new(RowFormat::Text);
        let mut sink = CollectingSink::default();
        let err = reader
            .decode(
                &mut CumulateBuffer::new(),
                &mut SequenceTracker::new(),
                &mut session,
                &mut sink,
                &CancelFlag::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
