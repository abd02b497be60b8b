//! Framing for the process backend.
//!
//! Wire format: [u32 big-endian length][bincode payload]
//! Tasks flow parent -> child and result envelopes child -> parent over one
//! socket pair per worker, using the same framing in both directions.

use crate::dataloader::workers::{Payload, ResultEnvelope};
use crate::error::WorkerFailure;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

/// Reject any single frame larger than 1 GiB.
pub(crate) const MAX_FRAME_BYTES: usize = 1024 * 1024 * 1024;

/// Serializes `value` into a complete frame, length header included.
pub(crate) fn encode_frame<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {MAX_FRAME_BYTES}", body.len()),
        ));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub(crate) fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    writer.write_all(&encode_frame(value)?)?;
    writer.flush()
}

/// Frames a worker's answer to task `seq`.
///
/// A batch that cannot be encoded (a serializer error, or a frame over
/// `MAX_FRAME_BYTES`) is replaced by an `Encode` failure for the same `seq`,
/// so the consumer still receives exactly one answer per task.
pub(crate) fn encode_envelope<B: Serialize>(envelope: &ResultEnvelope<B>) -> io::Result<Vec<u8>> {
    encode_frame(envelope).or_else(|e| {
        encode_frame(&ResultEnvelope::<B> {
            seq: envelope.seq,
            worker_id: envelope.worker_id,
            payload: Payload::Failed(WorkerFailure::encode(
                format!("failed to encode batch {}: {e}", envelope.seq),
                Some(envelope.worker_id),
            )),
        })
    })
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream, that is when
/// the peer closed the connection between frames.
pub(crate) fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let (value, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(Some(value))
}
