//! Chunker: split a blob into fixed-size pieces, addressable by index.

use bytes::Bytes;

/// Default chunk size in bytes. Sized for an unordered data channel.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// One slice of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Bytes,
    pub is_last: bool,
    pub index: u32,
}

/// Number of chunks for `total_len` bytes: `ceil(total_len / chunk_size)`.
pub fn chunk_count(total_len: usize, chunk_size: usize) -> u32 {
    let size = effective_size(chunk_size);
    total_len.div_ceil(size) as u32
}

fn effective_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// A blob split at fixed offsets. Slicing is zero-copy; iteration can be restarted
/// any number of times with [`Chunker::iter`].
#[derive(Debug, Clone)]
pub struct Chunker {
    blob: Bytes,
    chunk_size: usize,
}

impl Chunker {
    /// A zero `chunk_size` falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn new(blob: Bytes, chunk_size: usize) -> Self {
        Self {
            blob,
            chunk_size: effective_size(chunk_size),
        }
    }

    pub fn len(&self) -> u32 {
        chunk_count(self.blob.len(), self.chunk_size)
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.blob.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunk at `index`, or `None` past the end.
    pub fn get(&self, index: u32) -> Option<Chunk> {
        let start = (index as usize).checked_mul(self.chunk_size)?;
        if start >= self.blob.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.blob.len());
        Some(Chunk {
            bytes: self.blob.slice(start..end),
            is_last: end == self.blob.len(),
            index,
        })
    }

    pub fn iter(&self) -> Chunks<'_> {
        Chunks {
            chunker: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Chunker {
    type Item = Chunk;
    type IntoIter = Chunks<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over a [`Chunker`].
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    next: u32,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.chunker.get(self.next)?;
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.chunker.len().saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}
