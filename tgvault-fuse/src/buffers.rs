use std::collections::HashMap;

use thiserror::Error;

/// Largest size a buffered file may grow to.
pub const MAX_BUFFER_LEN: u64 = 4 << 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("no write buffer for this name")]
    Missing,
    #[error("file would grow past {MAX_BUFFER_LEN} bytes")]
    TooLarge,
    #[error("not enough memory to grow the write buffer")]
    OutOfMemory,
}

#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    pub data: Vec<u8>,
    /// Bumped on every mutation; a flush only clears `dirty` for the
    /// version it uploaded.
    pub version: u64,
    pub dirty: bool,
}

/// In-memory pending content per name, uploaded on flush.
#[derive(Default)]
pub struct WriteBuffers {
    buffers: HashMap<String, WriteBuffer>,
}

impl WriteBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.buffers.get(name).map(|buffer| buffer.data.len())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    /// Empty buffer that will be uploaded even if nothing is written.
    pub fn create(&mut self, name: &str) {
        self.buffers.insert(
            name.to_string(),
            WriteBuffer {
                data: Vec::new(),
                version: 1,
                dirty: true,
            },
        );
    }

    /// Seeds a clean buffer with already stored content.
    pub fn promote(&mut self, name: &str, data: Vec<u8>) {
        self.buffers.entry(name.to_string()).or_insert(WriteBuffer {
            data,
            version: 0,
            dirty: false,
        });
    }

    /// Writes at `offset`, zero-filling any gap past the current end.
    pub fn write(&mut self, name: &str, offset: u64, bytes: &[u8]) -> Result<usize, BufferError> {
        let buffer = self.buffers.get_mut(name).ok_or(BufferError::Missing)?;
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(BufferError::TooLarge)?;
        if (buffer.data.len() as u64) < end {
            resize_checked(&mut buffer.data, end)?;
        }
        // end fits in the buffer, so both bounds fit in usize
        let start = offset as usize;
        buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        buffer.version += 1;
        buffer.dirty = true;
        Ok(bytes.len())
    }

    pub fn truncate(&mut self, name: &str, size: u64) -> Result<(), BufferError> {
        let buffer = self.buffers.get_mut(name).ok_or(BufferError::Missing)?;
        resize_checked(&mut buffer.data, size)?;
        buffer.version += 1;
        buffer.dirty = true;
        Ok(())
    }

    pub fn read(&self, name: &str, offset: u64, size: usize) -> Option<Vec<u8>> {
        self.buffers
            .get(name)
            .map(|buffer| slice_at(&buffer.data, offset, size).to_vec())
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.buffers.get(name).is_some_and(|buffer| buffer.dirty)
    }

    /// Contents to upload, if the buffer has unflushed changes.
    pub fn dirty_snapshot(&self, name: &str) -> Option<(Vec<u8>, u64)> {
        self.buffers
            .get(name)
            .filter(|buffer| buffer.dirty)
            .map(|buffer| (buffer.data.clone(), buffer.version))
    }

    pub fn mark_clean(&mut self, name: &str, version: u64) {
        if let Some(buffer) = self.buffers.get_mut(name)
            && buffer.version == version
        {
            buffer.dirty = false;
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<WriteBuffer> {
        self.buffers.remove(name)
    }

    /// Moves a buffer to a new name, replacing whatever buffer was there.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.buffers.remove(from) {
            Some(buffer) => {
                self.buffers.insert(to.to_string(), buffer);
                true
            }
            None => false,
        }
    }
}

/// Resizes `data` to `len`, zero-filling, without aborting on huge sizes.
fn resize_checked(data: &mut Vec<u8>, len: u64) -> Result<(), BufferError> {
    if len > MAX_BUFFER_LEN {
        return Err(BufferError::TooLarge);
    }
    let len = usize::try_from(len).map_err(|_| BufferError::TooLarge)?;
    if len > data.len() {
        data.try_reserve_exact(len - data.len())
            .map_err(|_| BufferError::OutOfMemory)?;
    }
    data.resize(len, 0);
    Ok(())
}

pub(crate) fn slice_at(data: &[u8], offset: u64, size: usize) -> &[u8] {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(size).min(data.len());
    &data[start..end]
}
