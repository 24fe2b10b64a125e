//! The parent/child message protocol: length-prefixed, `serde_json`-framed
//! envelopes written by the child to a pipe the parent reads. This stands
//! in for a multiprocessing queue in a language whose runtime doesn't give
//! us one across a `fork()` boundary for free.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// A single log line a job wants routed through the parent's reporter
/// rather than printed directly to the console (the child has no console
/// of its own once its stdio is redirected into the channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Fail,
}

/// A terminal error classification, carried alongside the taxonomy in
/// `kiln_types` so a test harness can assert on `(domain, reason)` without
/// needing to downcast a `thiserror` enum across the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub domain: String,
    pub reason: String,
    pub message: String,
}

/// One frame on the child-to-parent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Forward a log line to the parent for UI/log routing.
    Message(LogRecord),
    /// The serializable return value of the job's action.
    Result(serde_json::Value),
    /// Terminal error classification.
    Error(ErrorEnvelope),
    /// Auxiliary data to propagate to the parent post-run (artifact size,
    /// workspace state updates).
    ChildData(serde_json::Value),
}

/// Writes one length-prefixed frame: a 4-byte big-endian length followed by
/// the value's JSON encoding. Used for both directions of the channel — the
/// child's `Envelope` stream and the parent's initial task payload.
pub fn write_json_frame<W: Write, T: Serialize>(mut w: W, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(io::Error::other)?;
    let len = u32::try_from(bytes.len()).map_err(io::Error::other)?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&bytes)?;
    w.flush()
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on clean EOF (the
/// writer closed its end, e.g. the child exited).
pub fn read_json_frame<R: Read, T: for<'de> Deserialize<'de>>(mut r: R) -> io::Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match r.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let value: T = serde_json::from_slice(&buf).map_err(io::Error::other)?;
    Ok(Some(value))
}

/// Writes one `Envelope` frame (child-to-parent direction).
pub fn write_frame<W: Write>(w: W, envelope: &Envelope) -> io::Result<()> {
    write_json_frame(w, envelope)
}

/// Reads one `Envelope` frame (child-to-parent direction).
pub fn read_frame<R: Read>(r: R) -> io::Result<Option<Envelope>> {
    read_json_frame(r)
}
