//! The chunked byte source: a backing buffer that fills in over time.

use crate::error::{Error, Result};
use log::error;
use std::sync::RwLock;

/// How a resident run ends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RunEnd {
    /// The run stops at unresident data.
    Hole,
    /// The run reaches the end of the document.
    DocumentEnd,
    /// The run was truncated by the caller's cap; more resident data
    /// follows.
    Cap,
}

/// A contiguous span of readable bytes copied out of the source.
#[derive(Debug, Clone)]
pub(crate) struct ResidentRun {
    /// Copy of the readable bytes.
    pub(crate) bytes: Vec<u8>,
    /// Absolute offset of the first byte.
    pub(crate) start: usize,
    /// How the run ends.
    pub(crate) terminator: RunEnd,
}

impl ResidentRun {
    /// Absolute offset one past the last byte.
    pub(crate) fn end(&self) -> usize {
        self.start + self.bytes.len()
    }
}

/// A byte source of known total length, filled in chunk-sized pieces.
///
/// The backing buffer is allocated once at the declared document length and
/// never shrinks. A byte at position `p` is readable iff `p` lies below the
/// progressive watermark or the chunk `p / chunk_size` is resident. Reads of
/// unreadable bytes fail with [`Error::Unavailable`]; callers are expected
/// to be restartable.
#[derive(Debug)]
pub struct ChunkedSource {
    chunk_size: usize,
    len: usize,
    inner: RwLock<Buf>,
}

#[derive(Debug)]
struct Buf {
    data: Vec<u8>,
    resident: Vec<bool>,
    resident_count: usize,
    /// Bytes received in streaming order before random access began.
    progressive: usize,
}

impl ChunkedSource {
    /// Create an empty source for a document of `len` bytes.
    pub fn new(len: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");

        let num_chunks = len.div_ceil(chunk_size);

        Self {
            chunk_size,
            len,
            inner: RwLock::new(Buf {
                data: vec![0; len],
                resident: vec![false; num_chunks],
                resident_count: 0,
                progressive: 0,
            }),
        }
    }

    /// Create a fully resident source from an in-memory document.
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let source = Self::new(data.len(), chunk_size);
        source.receive_progressive(data);

        source
    }

    /// The declared total length of the document.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the document is declared empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The chunk size of the source.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The number of chunks the document spans.
    pub fn num_chunks(&self) -> usize {
        self.len.div_ceil(self.chunk_size)
    }

    /// The byte bounds of chunk `idx`, clamped to the document length.
    pub fn chunk_bounds(&self, idx: usize) -> (usize, usize) {
        let begin = idx * self.chunk_size;
        let end = ((idx + 1) * self.chunk_size).min(self.len);

        (begin, end)
    }

    /// The chunk indices spanning the byte range `begin..end`.
    pub fn chunks_spanning(&self, begin: usize, end: usize) -> std::ops::Range<usize> {
        let end = end.min(self.len);

        if begin >= end {
            return 0..0;
        }

        (begin / self.chunk_size)..end.div_ceil(self.chunk_size)
    }

    /// Whether chunk `idx` is resident.
    pub fn is_resident(&self, idx: usize) -> bool {
        let buf = self.inner.read().unwrap();
        buf.is_chunk_readable(idx, self.chunk_size, self.len)
    }

    /// How many chunks are currently readable.
    pub fn resident_chunks(&self) -> usize {
        let buf = self.inner.read().unwrap();
        (0..self.num_chunks())
            .filter(|&i| buf.is_chunk_readable(i, self.chunk_size, self.len))
            .count()
    }

    /// Whether every byte of the document has been received.
    pub fn is_fully_loaded(&self) -> bool {
        let buf = self.inner.read().unwrap();
        buf.progressive >= self.len || buf.resident_count == self.num_chunks()
    }

    /// Read a single byte.
    pub fn read_byte(&self, pos: usize) -> Result<u8> {
        let buf = self.inner.read().unwrap();

        if pos >= self.len {
            return Err(Error::Format("read past the end of the document"));
        }

        if buf.readable_until(pos, self.chunk_size, self.len) > pos {
            Ok(buf.data[pos])
        } else {
            let (begin, end) = self.chunk_bounds(pos / self.chunk_size);
            Err(Error::Unavailable { begin, end })
        }
    }

    /// Read the byte range `begin..end`, clamping `end` to the document
    /// length. Fails with [`Error::Unavailable`] naming the full requested
    /// range if any byte of it is unresident.
    pub fn read_range(&self, begin: usize, end: usize) -> Result<Vec<u8>> {
        let end = end.min(self.len);

        if begin >= end {
            return Ok(vec![]);
        }

        let buf = self.inner.read().unwrap();

        let mut pos = begin;
        while pos < end {
            let readable = buf.readable_until(pos, self.chunk_size, self.len);
            if readable == pos {
                return Err(Error::Unavailable { begin, end });
            }
            pos = readable;
        }

        Ok(buf.data[begin..end].to_vec())
    }

    /// Copy out the longest readable span starting at `start`, up to `cap`
    /// bytes, along with how it terminated.
    pub(crate) fn resident_run(&self, start: usize, cap: usize) -> Result<ResidentRun> {
        if start >= self.len {
            return Err(Error::Format("object offset past the end of the document"));
        }

        let buf = self.inner.read().unwrap();

        let mut end = start;
        loop {
            let readable = buf.readable_until(end, self.chunk_size, self.len);
            if readable == end {
                break;
            }
            end = readable;
            // Explore one step past the cap so a cap-sized run is not
            // mistaken for one that ends at a hole.
            if end - start > cap {
                break;
            }
        }

        if end == start {
            let (begin, cend) = self.chunk_bounds(start / self.chunk_size);
            return Err(Error::Unavailable { begin, end: cend });
        }

        let readable_end = end;
        let end = readable_end.min(start.saturating_add(cap));

        let terminator = if end < readable_end {
            RunEnd::Cap
        } else if readable_end >= self.len {
            RunEnd::DocumentEnd
        } else {
            RunEnd::Hole
        };

        Ok(ResidentRun {
            bytes: buf.data[start..end].to_vec(),
            start,
            terminator,
        })
    }

    /// Copy out the last `max` bytes of the document (fewer if the document
    /// is shorter).
    pub(crate) fn tail_window(&self, max: usize) -> Result<ResidentRun> {
        let start = self.len.saturating_sub(max);
        let bytes = self.read_range(start, self.len)?;

        Ok(ResidentRun {
            bytes,
            start,
            terminator: RunEnd::DocumentEnd,
        })
    }

    /// Deliver a chunk-aligned range of bytes.
    ///
    /// `begin` must be a chunk-size multiple and the delivery must cover
    /// whole chunks, except for a final partial chunk at the document tail.
    /// Covered chunks become resident; delivering a chunk twice is
    /// harmless.
    pub fn receive_chunk(&self, begin: usize, bytes: &[u8]) {
        let end = begin + bytes.len();

        if begin % self.chunk_size != 0 {
            error!("chunk delivery at {begin} is not aligned to the chunk size");

            return;
        }

        if end > self.len || (end % self.chunk_size != 0 && end != self.len) {
            error!("chunk delivery {begin}..{end} is not a whole number of chunks");

            return;
        }

        let mut buf = self.inner.write().unwrap();
        buf.data[begin..end].copy_from_slice(bytes);

        for idx in self.chunks_spanning(begin, end) {
            if !buf.resident[idx] {
                buf.resident[idx] = true;
                buf.resident_count += 1;
            }
        }
    }

    /// Append bytes arriving in streaming order, advancing the progressive
    /// watermark. Chunks fully below the watermark become resident.
    pub fn receive_progressive(&self, bytes: &[u8]) {
        let mut buf = self.inner.write().unwrap();

        let begin = buf.progressive;
        let end = (begin + bytes.len()).min(self.len);

        if end > begin {
            buf.data[begin..end].copy_from_slice(&bytes[..end - begin]);
            buf.progressive = end;
        }

        // The watermark alone makes these readable, but marking them
        // resident keeps the gap enumeration and the coordinator's dedup
        // accurate.
        let covered = if buf.progressive == self.len {
            self.num_chunks()
        } else {
            buf.progressive / self.chunk_size
        };

        for idx in 0..covered {
            if !buf.resident[idx] {
                buf.resident[idx] = true;
                buf.resident_count += 1;
            }
        }
    }

    /// Enumerate the chunks that still need to be requested.
    pub fn missing_chunks(&self) -> Vec<usize> {
        let buf = self.inner.read().unwrap();

        (0..self.num_chunks())
            .filter(|&i| !buf.is_chunk_readable(i, self.chunk_size, self.len))
            .collect()
    }

    /// The next unreadable chunk at or after `from`, wrapping around to the
    /// start.
    pub fn next_missing_chunk(&self, from: usize) -> Option<usize> {
        let buf = self.inner.read().unwrap();
        let n = self.num_chunks();

        (0..n)
            .map(|i| (from + i) % n)
            .find(|&i| !buf.is_chunk_readable(i, self.chunk_size, self.len))
    }
}

impl Buf {
    /// The end of the readable region containing `pos`, or `pos` itself if
    /// that byte is not readable.
    fn readable_until(&self, pos: usize, chunk_size: usize, len: usize) -> usize {
        let mut end = pos;

        loop {
            if end >= len {
                return len;
            }

            let chunk = end / chunk_size;

            if self.resident[chunk] {
                end = ((chunk + 1) * chunk_size).min(len);
            } else if end < self.progressive {
                end = self.progressive;
            } else {
                return end;
            }
        }
    }

    fn is_chunk_readable(&self, idx: usize, chunk_size: usize, len: usize) -> bool {
        self.resident[idx] || ((idx + 1) * chunk_size).min(len) <= self.progressive
    }
}
