//! Row encoding shared by the SSTable, the WAL payloads, and snapshots.
//!
//! ```text
//! key "::" value ";\n"
//! ```
//!
//! A row log is parsed front to back: the key runs to the first `"::"`,
//! the value to the first `";\n"` after it. Keys therefore must not contain
//! `"::"` or a newline nor end with `':'`, values must not contain `";\n"`,
//! and a key must not start with a NUL byte (zeroed ballast marks the end of
//! a log).

use super::SSTableError;

/// Separates key from value.
pub const DELIMITER: &[u8] = b"::";

/// Ends a row.
pub const TERMINATOR: &[u8] = b";\n";

/// Encodes one row.
pub fn encode(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + value.len() + DELIMITER.len() + TERMINATOR.len());
    row.extend_from_slice(key);
    row.extend_from_slice(DELIMITER);
    row.extend_from_slice(value);
    row.extend_from_slice(TERMINATOR);
    row
}

/// Splits one complete row into `(key, value)`.
///
/// Returns `None` for anything that is not exactly one well-formed row.
pub fn decode(row: &[u8]) -> Option<(&[u8], &[u8])> {
    let body = row.strip_suffix(TERMINATOR)?;
    let split = find(body, DELIMITER)?;
    Some((&body[..split], &body[split + DELIMITER.len()..]))
}

/// Rejects keys and values the row format cannot represent.
pub fn validate(key: &[u8], value: &[u8]) -> Result<(), SSTableError> {
    if key.is_empty() {
        return Err(SSTableError::InvalidRow("key must not be empty".into()));
    }
    if key[0] == 0 {
        return Err(SSTableError::InvalidRow("key must not start with NUL".into()));
    }
    if find(key, DELIMITER).is_some() || key.contains(&b'\n') || key.ends_with(b":") {
        return Err(SSTableError::InvalidRow(
            "key must not contain \"::\" or a newline, or end with ':'".into(),
        ));
    }
    if find(value, TERMINATOR).is_some() {
        return Err(SSTableError::InvalidRow(
            "value must not contain \";\\n\"".into(),
        ));
    }
    Ok(())
}

/// Length of the complete row at the start of `buf`, if there is one.
pub fn row_len(buf: &[u8]) -> Option<usize> {
    if buf.first().is_none_or(|&b| b == 0) {
        return None;
    }
    let split = find(buf, DELIMITER)?;
    if split == 0 || buf[..split].contains(&b'\n') {
        return None;
    }
    let value_start = split + DELIMITER.len();
    let end = find(&buf[value_start..], TERMINATOR)?;
    Some(value_start + end + TERMINATOR.len())
}

/// Iterates the complete rows at the front of a row log.
pub fn rows(buf: &[u8]) -> Rows<'_> {
    Rows { buf, pos: 0 }
}

/// A row found by [`rows`].
pub struct RawRow<'a> {
    /// Offset of the row within the scanned buffer.
    pub offset: usize,
    pub len: usize,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Iterator returned by [`rows`]. Stops at the first incomplete row.
pub struct Rows<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Rows<'a> {
    /// Bytes consumed by the rows yielded so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Rows<'a> {
    type Item = RawRow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        let len = row_len(rest)?;
        let (key, value) = decode(&rest[..len])?;
        let row = RawRow {
            offset: self.pos,
            len,
            key,
            value,
        };
        self.pos += len;
        Some(row)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
