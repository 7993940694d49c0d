//! Uuencoded snapshot framing for bulk export and import of table rows.
//!
//! # Format
//!
//! ```text
//! begin 0755 <name>\n
//! M<60 chars>\n          one line per 45 source bytes
//! <len><chars>\n         final partial line
//! `\n                    zero-length line
//! end\n
//! ```
//!
//! Each line starts with a length character (`' ' + n`, or `` ` `` for
//! zero) followed by groups of four characters per three source bytes.
//! Every character carries six bits offset from `' '`; a zero sextet is
//! written as `` ` `` and either form is accepted on input.
//!
//! The payload of a table snapshot is its rows in the table's own row
//! encoding, so an export is also a readable listing once decoded.
//!
//! # Zero-panic guarantee
//!
//! Malformed input of any shape is reported through [`SnapshotError`].


use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::debug;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Source bytes per full line.
pub const LINE_BYTES: usize = 45;

/// File mode written into the header.
pub const MODE: &str = "0755";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by the snapshot codec.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying reader or writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The first line is not `begin <mode> <name>`.
    #[error("missing 'begin' header")]
    MissingHeader,

    /// Input ended before the zero-length line and `end`.
    #[error("missing 'end' marker")]
    MissingEnd,

    /// A body line could not be decoded.
    #[error("invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

// ------------------------------------------------------------------------------------------------
// Lines
// ------------------------------------------------------------------------------------------------

fn encode_char(sextet: u8) -> u8 {
    match sextet & 0x3f {
        0 => b'`',
        v => b' ' + v,
    }
}

fn decode_char(c: u8) -> Option<u8> {
    (b' '..=b'`').contains(&c).then(|| (c - b' ') & 0x3f)
}

/// Encodes up to [`LINE_BYTES`] bytes as one line, without the newline.
pub fn encode_line(chunk: &[u8]) -> Vec<u8> {
    let chunk = &chunk[..chunk.len().min(LINE_BYTES)];
    let mut line = Vec::with_capacity(1 + chunk.len().div_ceil(3) * 4);
    line.push(encode_char(chunk.len() as u8));

    for group in chunk.chunks(3) {
        let b0 = group[0];
        let b1 = group.get(1).copied().unwrap_or(0);
        let b2 = group.get(2).copied().unwrap_or(0);
        line.extend_from_slice(&[
            encode_char(b0 >> 2),
            encode_char((b0 << 4) | (b1 >> 4)),
            encode_char((b1 << 2) | (b2 >> 6)),
            encode_char(b2),
        ]);
    }
    line
}

/// Decodes one body line (newline already stripped).
///
/// `line_no` is only used in error reports.
pub fn decode_line(line: &[u8], line_no: usize) -> Result<Vec<u8>, SnapshotError> {
    let invalid = |reason: &str| SnapshotError::InvalidLine {
        line: line_no,
        reason: reason.to_string(),
    };

    let (&first, body) = line.split_first().ok_or_else(|| invalid("empty line"))?;
    let len = decode_char(first).ok_or_else(|| invalid("bad length character"))? as usize;
    if len > LINE_BYTES {
        return Err(invalid("length exceeds 45 bytes"));
    }
    let needed = len.div_ceil(3) * 4;
    if body.len() < needed {
        return Err(invalid("line shorter than its length"));
    }

    let mut out = Vec::with_capacity(len.div_ceil(3) * 3);
    for group in body[..needed].chunks_exact(4) {
        let mut s = [0u8; 4];
        for (slot, &c) in s.iter_mut().zip(group) {
            *slot = decode_char(c).ok_or_else(|| invalid("character out of range"))?;
        }
        out.extend_from_slice(&[
            (s[0] << 2) | (s[1] >> 4),
            (s[1] << 4) | (s[2] >> 2),
            (s[2] << 6) | s[3],
        ]);
    }
    out.truncate(len);
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Whole documents
// ------------------------------------------------------------------------------------------------

/// Writes `data` as a complete snapshot named `name`.
pub fn encode<W: Write>(writer: &mut W, name: &str, data: &[u8]) -> Result<(), SnapshotError> {
    writeln!(writer, "begin {MODE} {name}")?;
    for chunk in data.chunks(LINE_BYTES) {
        writer.write_all(&encode_line(chunk))?;
        writer.write_all(b"\n")?;
    }
    writer.write_all(b"`\nend\n")?;
    writer.flush()?;

    debug!(name, bytes = data.len(), "snapshot encoded");
    Ok(())
}

/// Reads a complete snapshot and returns `(name, data)`.
pub fn decode<R: BufRead>(reader: R) -> Result<(String, Vec<u8>), SnapshotError> {
    let mut lines = reader.split(b'\n');

    let header = lines.next().transpose()?.ok_or(SnapshotError::MissingHeader)?;
    let name = parse_header(&header).ok_or(SnapshotError::MissingHeader)?;

    let mut data = Vec::new();
    let mut line_no = 1;
    loop {
        line_no += 1;
        let line = lines.next().transpose()?.ok_or(SnapshotError::MissingEnd)?;
        let line = strip_cr(&line);
        if line.is_empty() {
            return Err(SnapshotError::InvalidLine {
                line: line_no,
                reason: "empty line".into(),
            });
        }
        let chunk = decode_line(line, line_no)?;
        if chunk.is_empty() {
            break;
        }
        data.extend_from_slice(&chunk);
    }

    match lines.next().transpose()? {
        Some(end) if strip_cr(&end) == b"end" => {}
        _ => return Err(SnapshotError::MissingEnd),
    }

    debug!(name = %name, bytes = data.len(), "snapshot decoded");
    Ok((name, data))
}

/// `begin <mode> <name>` → `name`.
fn parse_header(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(strip_cr(line)).ok()?;
    let rest = line.strip_prefix("begin ")?;
    let (mode, name) = rest.split_once(' ')?;
    if mode.is_empty() || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) || name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
