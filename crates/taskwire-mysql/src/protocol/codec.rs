//! Packet framing over a cumulative byte buffer.
//!
//! Inbound bytes are appended to a [`CumulateBuffer`] as the transport
//! delivers them. [`read_payload`] only consumes bytes once every packet
//! of a logical message is buffered, so a caller can retry after any
//! partial delivery without losing or re-reading data.

#![allow(clippy::cast_possible_truncation)]

use taskwire_core::Result;

use super::sequence::SequenceTracker;
use super::{MAX_PACKET_SIZE, PacketHeader};

/// Accumulates inbound bytes until complete packets can be decoded.
#[derive(Debug, Default)]
pub struct CumulateBuffer {
    data: Vec<u8>,
    start: usize,
}

impl CumulateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.data.len() / 2 {
            self.data.drain(..self.start);
            self.start = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Bytes not yet consumed.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `n` readable bytes as consumed.
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// Take every unconsumed byte, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        let rest = self.readable().to_vec();
        self.data.clear();
        self.start = 0;
        rest
    }
}

/// Peek at the next packet header without consuming it.
///
/// Returns `None` when fewer than four bytes are available.
pub fn read_header(buf: &[u8]) -> Option<PacketHeader> {
    let bytes: [u8; 4] = buf.get(..PacketHeader::SIZE)?.try_into().ok()?;
    Some(PacketHeader::from_bytes(bytes))
}

/// Consume the next packet header.
pub fn consume_header(buf: &mut CumulateBuffer) -> Option<PacketHeader> {
    let header = read_header(buf.readable())?;
    buf.advance(PacketHeader::SIZE);
    Some(header)
}

/// Locate one complete logical message at the front of `buf`.
///
/// Returns the headers of its packets and the total number of bytes
/// (headers included) it occupies, or `None` if more input is needed.
fn scan_message(buf: &[u8]) -> Option<(Vec<PacketHeader>, usize)> {
    let mut headers = Vec::with_capacity(1);
    let mut offset = 0;
    loop {
        let header = read_header(&buf[offset..])?;
        let end = offset + PacketHeader::SIZE + header.payload_length as usize;
        if buf.len() < end {
            return None;
        }
        headers.push(header);
        offset = end;
        if !header.is_continued() {
            return Some((headers, offset));
        }
    }
}

/// Reassemble the next logical payload, checking each packet's sequence id.
///
/// Packets of `0xFFFFFF` bytes are continued by the next packet; the
/// message ends at the first shorter packet (possibly empty). Returns
/// `Ok(None)` and consumes nothing while the message is incomplete.
pub fn read_payload(
    buf: &mut CumulateBuffer,
    sequence: &mut SequenceTracker,
) -> Result<Option<Vec<u8>>> {
    let Some((headers, total)) = scan_message(buf.readable()) else {
        return Ok(None);
    };

    let payload_len = headers.iter().map(|h| h.payload_length as usize).sum();
    let mut payload = Vec::with_capacity(payload_len);
    let mut offset = 0;
    for header in &headers {
        sequence.expect(header.sequence_id)?;
        let body_start = offset + PacketHeader::SIZE;
        let body_end = body_start + header.payload_length as usize;
        payload.extend_from_slice(&buf.readable()[body_start..body_end]);
        offset = body_end;
    }
    buf.advance(total);

    tracing::trace!(
        packets = headers.len(),
        payload_len = payload.len(),
        "assembled payload"
    );
    Ok(Some(payload))
}

/// Split a payload into wire packets, drawing one sequence id per packet.
///
/// A payload whose length is a multiple of `0xFFFFFF` ends with a
/// zero-length packet; the empty payload is a single empty packet.
pub fn frame_packets(payload: &[u8], mut next_id: impl FnMut() -> Result<u8>) -> Result<Vec<u8>> {
    let packets = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + packets * PacketHeader::SIZE);
    let mut last_len = MAX_PACKET_SIZE;
    for chunk in payload.chunks(MAX_PACKET_SIZE) {
        write_packet(&mut out, chunk, next_id()?);
        last_len = chunk.len();
    }
    if last_len == MAX_PACKET_SIZE {
        write_packet(&mut out, &[], next_id()?);
    }
    Ok(out)
}

/// Frame a payload using the ordinary sequence mutator.
pub fn encode_frames(payload: &[u8], sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    frame_packets(payload, || sequence.add_and_get())
}

fn write_packet(out: &mut Vec<u8>, body: &[u8], sequence_id: u8) {
    let header = PacketHeader {
        payload_length: body.len() as u32,
        sequence_id,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(body);
}
