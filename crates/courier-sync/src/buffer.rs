//! Append-only entry buffer used while a package is being filled.
//!
//! Small packages stay in memory. Once the buffer grows past its threshold
//! the contents move to an anonymous temp file, which the OS removes when the
//! buffer is dropped, including on error and cancellation paths.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use courier_core::canonical::encode_entry;
use courier_core::Entry;

use crate::error::Result;

/// Append-only entry bytes, kept in memory until they pass a threshold.
pub struct SpillBuffer {
    memory: Vec<u8>,
    file: Option<File>,
    threshold: usize,
    len: usize,
    entries: u64,
    hasher: blake3::Hasher,
}

impl SpillBuffer {
    /// Buffer that spills to a temp file past `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            threshold,
            len: 0,
            entries: 0,
            hasher: blake3::Hasher::new(),
        }
    }

    /// Append one encoded entry.
    pub fn push(&mut self, entry: &Entry) -> Result<()> {
        let mut encoded = Vec::new();
        encode_entry(entry, &mut encoded)?;
        self.write_all(&encoded)?;
        self.entries += 1;
        Ok(())
    }

    /// Number of entries appended.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the bytes moved to disk.
    pub fn spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Digest of everything written so far.
    pub fn digest(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }

    /// Read the whole buffer back.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.file {
            None => Ok(self.memory),
            Some(mut file) => {
                let mut bytes = Vec::with_capacity(self.len);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
        }
    }
}

impl Write for SpillBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none() && self.memory.len() + buf.len() > self.threshold {
            let mut file = tempfile::tempfile()?;
            file.write_all(&self.memory)?;
            self.memory = Vec::new();
            self.file = Some(file);
        }
        match &mut self.file {
            Some(file) => file.write_all(buf)?,
            None => self.memory.extend_from_slice(buf),
        }
        self.hasher.update(buf);
        self.len += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
