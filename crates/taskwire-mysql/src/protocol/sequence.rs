//! Packet sequence-id tracking.
//!
//! Every command starts at sequence id 0 and each packet sent or received
//! afterwards uses the next id (mod 256). A received id that differs from
//! the expected one is a framing error.
//!
//! While long-parameter data is streamed ahead of a statement execute, the
//! tracker is placed in a *safe window*: the ordinary mutators refuse to
//! run, and only the windowed mutator (driven by the prepared-statement
//! tracker) may hand out ids. Each long-data message restarts at the window
//! start; its continuation frames take consecutive ids from there.

use taskwire_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SafeWindow {
    start: u8,
    packets: usize,
    /// Frames drawn for the current message.
    frame: u8,
}

/// Tracks the next expected/assigned sequence id for one task.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    next: u8,
    window: Option<SafeWindow>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next packet (in either direction) must carry.
    pub fn next_id(&self) -> u8 {
        self.next
    }

    /// Start a new command: the next packet is sent with id 0.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_closed("reset")?;
        self.next = 0;
        Ok(())
    }

    /// Take the id for an outbound packet and advance.
    pub fn add_and_get(&mut self) -> Result<u8> {
        self.ensure_closed("add_and_get")?;
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        Ok(id)
    }

    /// Check the id of an inbound packet and advance.
    pub fn expect(&mut self, actual: u8) -> Result<()> {
        if self.window.is_some() {
            return Err(Error::illegal_state(
                "received a packet while the long-data window is open",
            ));
        }
        if actual != self.next {
            return Err(Error::sequence_mismatch(self.next, actual));
        }
        self.next = self.next.wrapping_add(1);
        Ok(())
    }

    pub fn is_window_open(&self) -> bool {
        self.window.is_some()
    }

    /// Number of packets sent inside the currently open window.
    pub fn window_packets(&self) -> usize {
        self.window.map_or(0, |w| w.packets)
    }

    /// Open the safe window. Windowed packets are standalone commands, so
    /// the window always begins at id 0.
    pub(crate) fn open_window(&mut self) -> Result<u8> {
        if self.window.is_some() {
            return Err(Error::illegal_state("long-data window already open"));
        }
        self.next = 0;
        self.window = Some(SafeWindow {
            start: 0,
            packets: 0,
            frame: 0,
        });
        Ok(0)
    }

    /// Begin the next windowed message.
    ///
    /// The server never answers COM_STMT_SEND_LONG_DATA, so every message
    /// is a standalone command numbered from the window start.
    pub(crate) fn begin_windowed_message(&mut self) -> Result<()> {
        let window = self
            .window
            .as_mut()
            .ok_or_else(|| Error::illegal_state("long-data window is not open"))?;
        window.frame = 0;
        Ok(())
    }

    /// Hand out the id for one frame of the current windowed message.
    pub(crate) fn windowed_add_and_get(&mut self) -> Result<u8> {
        let window = self
            .window
            .as_mut()
            .ok_or_else(|| Error::illegal_state("long-data window is not open"))?;
        let id = window.start.wrapping_add(window.frame);
        window.frame = window.frame.wrapping_add(1);
        window.packets += 1;
        Ok(id)
    }

    /// Close the window, returning the id reserved for the packet that follows it.
    pub(crate) fn close_window(&mut self) -> Result<u8> {
        let window = self
            .window
            .take()
            .ok_or_else(|| Error::illegal_state("long-data window is not open"))?;
        self.next = window.start;
        Ok(window.start)
    }

    fn ensure_closed(&self, op: &str) -> Result<()> {
        if self.window.is_some() {
            return Err(Error::illegal_state(format!(
                "{op} is not allowed while the long-data window is open"
            )));
        }
        Ok(())
    }
}
