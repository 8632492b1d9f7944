//! Command packet writers.
//!
//! Each writer builds one command payload and frames it with the task's
//! sequence tracker. Validation happens before anything is framed, so a
//! rejected command leaves the connection untouched.

use taskwire_core::{Error, FramingError, FramingErrorKind, Result};

use crate::protocol::{
    Command, MAX_PACKET_SIZE, PacketWriter, SequenceTracker, codec::frame_packets, encode_frames,
};
use crate::types::{BindValue, encode_binary_param};

use super::prepared::StatementTracker;

/// Statement id (4) + parameter index (2) + command byte (1).
const LONG_DATA_HEADER: usize = 7;

const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;
const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

fn oversized(len: usize, max_packet_size: u32) -> Error {
    Error::Framing(FramingError {
        kind: FramingErrorKind::Oversized,
        message: format!("packet of {len} bytes exceeds max_packet_size {max_packet_size}"),
    })
}

fn check_size(payload: &[u8], max_packet_size: u32) -> Result<()> {
    if payload.len() > max_packet_size as usize {
        return Err(oversized(payload.len(), max_packet_size));
    }
    Ok(())
}

fn frame_command(writer: PacketWriter, sequence: &mut SequenceTracker, max_packet_size: u32) -> Result<Vec<u8>> {
    check_size(writer.as_bytes(), max_packet_size)?;
    sequence.reset()?;
    encode_frames(writer.as_bytes(), sequence)
}

/// COM_QUERY.
pub fn write_query(sql: &str, sequence: &mut SequenceTracker, max_packet_size: u32) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::Query, sql.len());
    writer.write_bytes(sql.as_bytes());
    frame_command(writer, sequence, max_packet_size)
}

/// COM_STMT_PREPARE.
pub fn write_prepare(sql: &str, sequence: &mut SequenceTracker, max_packet_size: u32) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtPrepare, sql.len());
    writer.write_bytes(sql.as_bytes());
    frame_command(writer, sequence, max_packet_size)
}

/// COM_STMT_FETCH for the next `rows` rows of an open cursor.
pub fn write_fetch(statement_id: u32, rows: u32, sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtFetch, 8);
    writer.write_u32_le(statement_id);
    writer.write_u32_le(rows);
    frame_command(writer, sequence, u32::MAX)
}

/// COM_STMT_CLOSE. The server sends no reply.
pub fn write_close(statement_id: u32, sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtClose, 4);
    writer.write_u32_le(statement_id);
    frame_command(writer, sequence, u32::MAX)
}

/// COM_RESET_CONNECTION.
pub fn write_reset(sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    frame_command(PacketWriter::command(Command::ResetConnection, 0), sequence, u32::MAX)
}

/// COM_PING.
pub fn write_ping(sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    frame_command(PacketWriter::command(Command::Ping, 0), sequence, u32::MAX)
}

/// COM_QUIT. The server closes the connection without replying.
pub fn write_quit(sequence: &mut SequenceTracker) -> Result<Vec<u8>> {
    frame_command(PacketWriter::command(Command::Quit, 0), sequence, u32::MAX)
}

/// Write a statement execute, streaming long parameters ahead of it.
///
/// Returns the framed packets in send order: every COM_STMT_SEND_LONG_DATA
/// chunk (each starting at sequence id 0, continuation frames counting up
/// from there), then the COM_STMT_EXECUTE, which also starts at 0 because
/// the server answers none of the long-data packets.
#[tracing::instrument(level = "debug", skip(tracker, binds, sequence))]
pub fn write_execute(
    tracker: &StatementTracker,
    binds: &[BindValue],
    sequence: &mut SequenceTracker,
    max_packet_size: u32,
) -> Result<Vec<Vec<u8>>> {
    let statement_id = tracker.obtain_statement_id()?;
    let params = tracker.obtain_parameter_metas()?;
    if params.len() != binds.len() {
        return Err(Error::Custom(format!(
            "statement {statement_id} expects {} parameters, got {}",
            params.len(),
            binds.len()
        )));
    }
    for (index, bind) in binds.iter().enumerate() {
        bind.check(index)?;
    }

    // build the execute payload first so a bad value fails before any send
    let execute = execute_payload(statement_id, binds, tracker.fetch_size())?;
    check_size(&execute, max_packet_size)?;

    let mut packets = Vec::new();
    let long_params: Vec<(usize, &BindValue)> = binds
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_long_data())
        .collect();

    if long_params.is_empty() {
        sequence.reset()?;
    } else {
        let chunk_size = (max_packet_size as usize).min(MAX_PACKET_SIZE) - LONG_DATA_HEADER;
        tracker.start_safe_sequence_id(sequence)?;
        let written = write_long_data(tracker, statement_id, &long_params, chunk_size, sequence, &mut packets);
        let closed = tracker.end_safe_sequence_id(sequence);
        written?;
        closed?;
        tracing::debug!(
            statement_id,
            long_data_packets = packets.len(),
            "streamed long parameters"
        );
    }

    packets.push(encode_frames(&execute, sequence)?);
    Ok(packets)
}

fn write_long_data(
    tracker: &StatementTracker,
    statement_id: u32,
    long_params: &[(usize, &BindValue)],
    chunk_size: usize,
    sequence: &mut SequenceTracker,
    packets: &mut Vec<Vec<u8>>,
) -> Result<()> {
    for &(index, bind) in long_params {
        let data = bind.long_data();
        // an empty value still needs one packet so the server marks it as sent
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(chunk_size.max(1)).collect()
        };
        for chunk in chunks {
            let mut writer = PacketWriter::command(Command::StmtSendLongData, LONG_DATA_HEADER - 1 + chunk.len());
            writer.write_u32_le(statement_id);
            let param_id = u16::try_from(index)
                .map_err(|_| Error::Custom(format!("parameter index {index} out of range")))?;
            writer.write_u16_le(param_id);
            writer.write_bytes(chunk);
            tracker.start_long_data_message(sequence)?;
            packets.push(frame_packets(writer.as_bytes(), || {
                tracker.safely_add_and_get_sequence_id(sequence)
            })?);
        }
    }
    Ok(())
}

fn execute_payload(statement_id: u32, binds: &[BindValue], fetch_size: u32) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtExecute, 10 + binds.len() * 9);
    writer.write_u32_le(statement_id);
    writer.write_u8(if fetch_size > 0 {
        CURSOR_TYPE_READ_ONLY
    } else {
        CURSOR_TYPE_NO_CURSOR
    });
    // iteration count
    writer.write_u32_le(1);

    if binds.is_empty() {
        return Ok(writer.into_bytes());
    }

    let mut null_bitmap = vec![0u8; binds.len().div_ceil(8)];
    for (i, bind) in binds.iter().enumerate() {
        if bind.value.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);

    // new-params-bound flag
    writer.write_u8(1);
    for bind in binds {
        writer.write_u8(bind.field_type as u8);
        writer.write_u8(if bind.unsigned { 0x80 } else { 0x00 });
    }
    for (index, bind) in binds.iter().enumerate() {
        encode_binary_param(&mut writer, bind, index)?;
    }
    Ok(writer.into_bytes())
}
