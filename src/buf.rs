//! The buffer data model: constant and mutable byte ranges, a chain of
//! fixed-capacity chunks ("blob") owned by a [`BlobFactory`], and a
//! file-backed range for zero-copy transmission.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// The default chunk capacity used by [`BlobFactory::default`].
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A single fixed-capacity chunk, reused across blobs via the owning
/// [`BlobFactory`]'s free list.
#[derive(Debug)]
pub struct Chunk {
    data: Vec<u8>,
    len: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Chunk {
        Chunk {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn spare_capacity(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.spare_capacity());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}

/// A thread-safe pool handing out fixed-capacity [`Chunk`]s, matching
/// spec.md §3's "chunk factory". Chunks returned to the pool via `Drop`
/// are recycled rather than freed.
#[derive(Clone, Debug)]
pub struct BlobFactory {
    chunk_size: usize,
    free: Arc<Mutex<Vec<Chunk>>>,
}

impl BlobFactory {
    pub fn new(chunk_size: usize) -> BlobFactory {
        BlobFactory {
            chunk_size,
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn allocate(&self) -> Chunk {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Chunk::new(self.chunk_size))
    }

    pub fn release(&self, mut chunk: Chunk) {
        chunk.reset();
        self.free.lock().push(chunk);
    }

    pub fn new_blob(&self) -> Blob {
        Blob {
            factory: self.clone(),
            chunks: Vec::new(),
        }
    }
}

impl Default for BlobFactory {
    fn default() -> Self {
        BlobFactory::new(DEFAULT_CHUNK_SIZE)
    }
}

/// A chain of fixed-capacity chunks, the write queue's representation of a
/// large outbound payload that should not require one large contiguous
/// allocation.
#[derive(Debug)]
pub struct Blob {
    factory: BlobFactory,
    chunks: Vec<Chunk>,
}

impl Blob {
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::as_slice).map(<[u8]>::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.chunks.last().map_or(true, |c| c.spare_capacity() == 0) {
                self.chunks.push(self.factory.allocate());
            }
            let chunk = self.chunks.last_mut().unwrap();
            let n = chunk.extend_from_slice(bytes);
            bytes = &bytes[n..];
        }
    }

    /// Drop `n` bytes from the front of the blob, recycling any
    /// fully-consumed chunks back to the factory.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.chunks.first_mut() else {
                break;
            };
            let avail = front.len;
            if n < avail {
                front.data.copy_within(n..avail, 0);
                front.len -= n;
                break;
            }
            n -= avail;
            let chunk = self.chunks.remove(0);
            self.factory.release(chunk);
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Chunk::as_slice)
    }

    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.chunks().map(IoSlice::new).collect()
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.factory.release(chunk);
        }
    }
}

/// A file descriptor plus offset and length, used for zero-copy
/// transmission via `sendfile`-style APIs.
#[derive(Debug, Clone)]
pub struct FileRange {
    pub file: Arc<File>,
    pub offset: u64,
    pub len: u64,
}

/// The buffer data model of spec.md §3: a constant range, a mutable range,
/// a [`Blob`], or a [`FileRange`].
pub enum IoBuf<'a> {
    Const(&'a [u8]),
    Mut(&'a mut [u8]),
    Blob(Blob),
    File(FileRange),
}

impl<'a> IoBuf<'a> {
    pub fn len(&self) -> usize {
        match self {
            IoBuf::Const(b) => b.len(),
            IoBuf::Mut(b) => b.len(),
            IoBuf::Blob(b) => b.len(),
            IoBuf::File(f) => f.len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scatter/gather helpers over the standard I/O slice types, used by
/// `send`/`receive` when given arrays of buffers rather than one.
pub fn gather<'a>(bufs: &'a [&'a [u8]]) -> Vec<IoSlice<'a>> {
    bufs.iter().map(|b| IoSlice::new(b)).collect()
}

pub fn scatter<'a>(bufs: &'a mut [&'a mut [u8]]) -> Vec<IoSliceMut<'a>> {
    bufs.iter_mut().map(|b| IoSliceMut::new(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_push_and_consume_round_trips() {
        let factory = BlobFactory::new(4);
        let mut blob = factory.new_blob();
        blob.push(b"hello world");
        assert_eq!(blob.len(), 11);
        let collected: Vec<u8> = blob.chunks().flatten().copied().collect();
        assert_eq!(collected, b"hello world");
        blob.consume(6);
        let collected: Vec<u8> = blob.chunks().flatten().copied().collect();
        assert_eq!(collected, b"world");
    }

    #[test]
    fn factory_recycles_chunks() {
        let factory = BlobFactory::new(8);
        {
            let mut blob = factory.new_blob();
            blob.push(b"12345678");
        }
        assert_eq!(factory.free.lock().len(), 1);
    }
}
