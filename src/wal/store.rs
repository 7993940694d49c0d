//! Record store: one file of length-prefixed records.
//!
//! ```text
//! [u64 BE length][payload][u64 BE length][payload] ...
//! ```
//!
//! Appends go through a buffered writer under a mutex. Reads flush that
//! buffer first and then read through a second handle at an absolute
//! position, so they never disturb the append position.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, trace};

use super::WalError;

/// Width of the length prefix.
pub const LEN_WIDTH: u64 = 8;

pub struct Store {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    reader: File,

    /// Bytes appended so far, including bytes still in the buffer.
    size: AtomicU64,
}

impl Store {
    /// Opens or creates the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();
        let reader = file.try_clone()?;

        debug!(path = %path.display(), size, "store opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            reader,
            size: AtomicU64::new(size),
        })
    }

    /// Appends one record.
    ///
    /// Returns `(bytes written including the prefix, position of the record)`.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64), WalError> {
        let mut writer = self.lock()?;
        let pos = self.size.load(Ordering::Acquire);

        writer.write_all(&(payload.len() as u64).to_be_bytes())?;
        writer.write_all(payload)?;

        let written = LEN_WIDTH + payload.len() as u64;
        self.size.store(pos + written, Ordering::Release);
        trace!(pos, written, "store append");
        Ok((written, pos))
    }

    /// Reads the record starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>, WalError> {
        let mut prefix = [0u8; LEN_WIDTH as usize];
        self.read_at(&mut prefix, pos)?;
        let len = u64::from_be_bytes(prefix);

        let end = pos
            .checked_add(LEN_WIDTH)
            .and_then(|p| p.checked_add(len))
            .ok_or_else(|| WalError::Corrupt(format!("record length {len} at {pos} overflows")))?;
        if end > self.size() {
            return Err(WalError::Corrupt(format!(
                "record at {pos} claims {len} bytes past the end of the store"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.read_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Fills `buf` from absolute position `off`.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, WalError> {
        self.lock()?.flush()?;
        if off.saturating_add(buf.len() as u64) > self.size() {
            return Err(WalError::Eof);
        }
        read_exact_at(&self.reader, buf, off)?;
        Ok(buf.len())
    }

    /// Drops everything from `len` on.
    pub fn truncate(&self, len: u64) -> Result<(), WalError> {
        let mut writer = self.lock()?;
        writer.flush()?;
        writer.get_ref().set_len(len)?;
        self.size.store(len, Ordering::Release);
        debug!(path = %self.path.display(), len, "store truncated");
        Ok(())
    }

    /// Flushes the buffer and syncs the file's data.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut writer = self.lock()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flushes the buffer and syncs the file.
    pub fn close(&self) -> Result<(), WalError> {
        let mut writer = self.lock()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufWriter<File>>, WalError> {
        self.writer.lock().map_err(|_| {
            error!("store writer lock poisoned");
            WalError::Internal("Mutex poisoned".into())
        })
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, off)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, off)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}
