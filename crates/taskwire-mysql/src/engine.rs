//! Push-based protocol engine.
//!
//! The engine owns everything a connection shares between commands: the
//! session state, the cumulative receive buffer and the FIFO of waiting
//! tasks. It performs no I/O. The caller moves bytes in both directions:
//!
//! ```rust,ignore
//! let id = engine.submit(Task::query("SELECT 1", sink));
//! while let Some(bytes) = engine.poll_transmit() {
//!     transport.write_all(&bytes)?;
//! }
//! engine.receive(&transport.read()?);
//! while let Some(done) = engine.poll_completion() { /* ... */ }
//! ```
//!
//! Exactly one task is active at a time. A task leaves the engine when its
//! decoder reaches a terminal state; the next queued task is then started
//! and its packets become available from [`ProtocolEngine::poll_transmit`].
//!
//! The engine also remembers the statements prepared through it. A
//! successful COM_RESET_CONNECTION deallocates them on the server, so their
//! handles are marked closed; the same happens when the engine breaks.

use std::collections::VecDeque;

use taskwire_core::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::protocol::CumulateBuffer;
use crate::session::SessionState;
use crate::task::{PreparedStatement, States, Task, TaskId, TaskKind, TaskOutput, TaskQueue};

/// A finished task and its result.
#[derive(Debug)]
pub struct TaskCompletion {
    pub id: TaskId,
    pub result: Result<TaskOutput>,
}

/// Sans-I/O driver for the command phase of one connection.
#[derive(Debug)]
pub struct ProtocolEngine {
    session: SessionState,
    buffer: CumulateBuffer,
    queue: TaskQueue,
    active: Option<(TaskId, Task)>,
    outbound: VecDeque<Vec<u8>>,
    completions: VecDeque<TaskCompletion>,
    /// Statements prepared here and not closed yet
    statements: Vec<PreparedStatement>,
    next_id: u64,
    broken: bool,
}

impl ProtocolEngine {
    /// Engine over an authenticated session.
    pub fn new(session: SessionState) -> Self {
        Self {
            session,
            buffer: CumulateBuffer::new(),
            queue: TaskQueue::new(),
            active: None,
            outbound: VecDeque::new(),
            completions: VecDeque::new(),
            statements: Vec::new(),
            next_id: 1,
            broken: false,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Set once a fatal error has been seen; every later task fails.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// No task active or waiting.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Tasks that have not finished yet, the active one included.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    /// Prepared statements whose handles are still open.
    pub fn open_statements(&self) -> usize {
        self.statements.len()
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.active.as_ref().map(|(id, _)| *id)
    }

    /// Queue a task. It starts as soon as every earlier task has finished.
    pub fn submit(&mut self, task: Task) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        tracing::debug!(task = %id, kind = task.kind_name(), "task submitted");

        if self.broken {
            self.complete(id, Err(broken_error()));
            return id;
        }
        self.queue.push(id, task);
        self.activate_next();
        id
    }

    /// Next framed bytes to write to the transport.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    pub fn has_transmit(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Next finished task, in completion order.
    pub fn poll_completion(&mut self) -> Option<TaskCompletion> {
        self.completions.pop_front()
    }

    /// Feed bytes read from the transport.
    ///
    /// Fatal decode errors break the engine and are reported through the
    /// completions of the affected tasks; the returned error only says the
    /// engine can no longer accept input.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        if self.broken {
            return Err(broken_error());
        }
        tracing::trace!(len = bytes.len(), "received bytes");
        self.buffer.extend(bytes);
        if self.active.is_none() {
            if !self.buffer.is_empty() {
                self.fail_all(Error::protocol(format!(
                    "received {} unexpected bytes while no command is active",
                    self.buffer.len()
                )));
            }
            return Ok(());
        }
        self.pump();
        Ok(())
    }

    /// Decode again after a sink regained demand.
    pub fn resume(&mut self) {
        if !self.broken {
            self.pump();
        }
    }

    /// Request cancellation of a task.
    ///
    /// A queued task is removed and fails with [`Error::Cancelled`]. The
    /// active task keeps reading so the response is drained off the wire,
    /// but its remaining rows are discarded.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if self.queue.remove(id).is_some() {
            tracing::debug!(task = %id, "queued task cancelled");
            self.complete(id, Err(Error::Cancelled));
            return true;
        }
        match &self.active {
            Some((active, task)) if *active == id => {
                tracing::debug!(task = %id, "active task cancelled");
                task.cancel_flag().cancel();
                true
            }
            _ => false,
        }
    }

    /// Fail the active task with `error` and every queued task with a
    /// broken-connection error. The engine accepts no further work.
    pub fn fail_all(&mut self, error: Error) {
        tracing::warn!(error = %error, pending = self.pending(), "protocol engine broken");
        self.broken = true;
        self.session.mark_closed();
        self.outbound.clear();
        self.buffer.take();
        self.invalidate_statements();

        if let Some((id, _)) = self.active.take() {
            self.complete(id, Err(error));
        }
        let queued: Vec<TaskId> = self.queue.drain().map(|(id, _)| id).collect();
        for id in queued {
            self.complete(id, Err(broken_error()));
        }
    }

    /// Record what a finished task did to the server-side statements,
    /// then report it.
    fn finish(&mut self, id: TaskId, mut task: Task) {
        let result = task
            .take_result()
            .unwrap_or_else(|| Err(Error::illegal_state("task finished without a result")));
        match (task.kind(), &result) {
            (_, Ok(TaskOutput::Prepared(statement))) => self.statements.push(statement.clone()),
            (TaskKind::CloseStatement { statement }, _) => {
                let closed = statement.id();
                self.statements.retain(|s| s.id() != closed);
            }
            (TaskKind::Reset, Ok(_)) => self.invalidate_statements(),
            _ => {}
        }
        self.complete(id, result);
    }

    fn invalidate_statements(&mut self) {
        if !self.statements.is_empty() {
            tracing::debug!(count = self.statements.len(), "prepared statements invalidated");
        }
        for statement in self.statements.drain(..) {
            statement.mark_closed();
        }
    }

    fn complete(&mut self, id: TaskId, result: Result<TaskOutput>) {
        match &result {
            Ok(_) => tracing::debug!(task = %id, "task completed"),
            Err(e) => tracing::debug!(task = %id, error = %e, "task failed"),
        }
        self.completions.push_back(TaskCompletion { id, result });
    }

    /// Start queued tasks until one is waiting for a response.
    fn activate_next(&mut self) {
        while self.active.is_none() {
            let Some((id, mut task)) = self.queue.pop() else {
                return;
            };
            if task.is_cancelled() {
                self.complete(id, Err(Error::Cancelled));
                continue;
            }
            if let Err(e) = task.start(&self.session) {
                self.complete(id, Err(e));
                continue;
            }
            self.outbound.extend(task.take_outbound());
            if task.expects_response() {
                self.active = Some((id, task));
            } else {
                self.finish(id, task);
            }
        }
    }

    fn pump(&mut self) {
        loop {
            let Some((_, task)) = self.active.as_mut() else {
                return;
            };
            if !task.can_decode(&self.buffer) {
                return;
            }
            let state = match task.decode(&mut self.buffer, &mut self.session) {
                Ok(state) => state,
                Err(e) => {
                    self.fail_all(e);
                    return;
                }
            };
            self.outbound.extend(task.take_outbound());
            tracing::trace!(?state, "decode step");

            if state.is_terminal() {
                let Some((id, task)) = self.active.take() else {
                    return;
                };
                self.finish(id, task);
                self.activate_next();
                if self.active.is_none() && !self.buffer.is_empty() {
                    self.fail_all(Error::protocol(format!(
                        "{} bytes left over after the response completed",
                        self.buffer.len()
                    )));
                    return;
                }
            } else if state == States::MoreCumulate {
                return;
            }
        }
    }
}

fn broken_error() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Broken,
        message: "connection broken by an earlier error".to_string(),
        source: None,
    })
}
