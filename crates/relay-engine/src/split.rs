//! Partitions an unbounded byte stream into bounded-size parts.
//!
//! The splitter makes a single pass over its source. Each part is streamed
//! into a caller-provided sink (typically the write half of a pipe whose
//! read half is already being consumed by the delivery stage), so delivery
//! of part N starts before the part has fully arrived.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default per-part ceiling when none is configured (the common chat-bot
/// upload limit).
pub const DEFAULT_MAX_PART_BYTES: u64 = 48 * 1024 * 1024;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Record of one completed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based position in the sequence.
    pub index: u64,
    /// Bytes copied into this part. The last part may be short.
    pub len: u64,
    /// Set on exactly one part: the one during which the source ended.
    pub is_last: bool,
}

/// Number of parts a source of `total_bytes` will produce.
pub fn expected_parts(total_bytes: u64, max_part_bytes: u64) -> u64 {
    total_bytes.div_ceil(max_part_bytes)
}

/// Splits `source` into parts of at most `max_part_bytes` bytes.
///
/// Not restartable; the sequence is finite and ends with the part marked
/// [`Part::is_last`]. An empty source still yields exactly one empty part,
/// so the caller always has something to deliver and report.
pub struct PartSplitter<R> {
    source: R,
    max_part_bytes: u64,
    next_index: u64,
    /// Bytes read past the previous part's boundary while probing for
    /// end-of-source; they belong to the next part.
    pending: Vec<u8>,
    exhausted: bool,
    done: bool,
}

impl<R: AsyncRead + Unpin> PartSplitter<R> {
    pub fn new(source: R, max_part_bytes: u64) -> Self {
        debug_assert!(max_part_bytes > 0);
        Self {
            source,
            max_part_bytes,
            next_index: 1,
            pending: Vec::new(),
            exhausted: false,
            done: false,
        }
    }

    /// Copy the next part into `sink`, returning its completed record, or
    /// `None` once the sequence has ended.
    ///
    /// A read error from the source aborts the sequence with that error and
    /// no part record; the bytes already written to `sink` must not be
    /// treated as a delivered part.
    pub async fn copy_next<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> io::Result<Option<Part>> {
        if self.done {
            return Ok(None);
        }

        let mut copied: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        if !self.pending.is_empty() {
            let take = (self.pending.len() as u64).min(self.max_part_bytes) as usize;
            sink.write_all(&self.pending[..take]).await?;
            self.pending.drain(..take);
            copied += take as u64;
        }

        while !self.exhausted && copied < self.max_part_bytes {
            let want = (buf.len() as u64).min(self.max_part_bytes - copied) as usize;
            let n = self.source.read(&mut buf[..want]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            sink.write_all(&buf[..n]).await?;
            copied += n as u64;
        }

        // A part that exactly fills the budget must still be marked last
        // when nothing follows it, so probe the source once more.
        if !self.exhausted && self.pending.is_empty() && copied == self.max_part_bytes {
            let n = self.source.read(&mut buf).await?;
            if n == 0 {
                self.exhausted = true;
            } else {
                self.pending.extend_from_slice(&buf[..n]);
            }
        }

        let is_last = self.exhausted && self.pending.is_empty();
        if is_last {
            self.done = true;
        }
        let part = Part {
            index: self.next_index,
            len: copied,
            is_last,
        };
        self.next_index += 1;
        sink.flush().await?;
        Ok(Some(part))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    async fn collect_parts<R: AsyncRead + Unpin>(mut splitter: PartSplitter<R>) -> Vec<Part> {
        let mut parts = Vec::new();
        let mut sink = tokio::io::sink();
        while let Some(part) = splitter.copy_next(&mut sink).await.unwrap() {
            parts.push(part);
        }
        parts
    }

    #[tokio::test]
    async fn exact_multiple_yields_ceil_parts_without_trailing_empty() {
        let source = tokio::io::repeat(0xAB).take(150_000_000);
        let parts = collect_parts(PartSplitter::new(source, 50_000_000)).await;

        assert_eq!(parts.len(), 3);
        assert_eq!(expected_parts(150_000_000, 50_000_000), 3);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.index, i as u64 + 1);
            assert_eq!(part.len, 50_000_000);
            assert_eq!(part.is_last, i == 2);
        }
    }

    #[tokio::test]
    async fn short_source_yields_single_last_part() {
        let source = tokio::io::repeat(0x01).take(12_345_678);
        let parts = collect_parts(PartSplitter::new(source, 50_000_000)).await;

        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0],
            Part {
                index: 1,
                len: 12_345_678,
                is_last: true
            }
        );
    }

    #[tokio::test]
    async fn lengths_sum_to_source_length() {
        let source = tokio::io::repeat(0x77).take(123_457);
        let parts = collect_parts(PartSplitter::new(source, 10_000)).await;

        assert_eq!(parts.len(), 13);
        assert_eq!(parts.iter().map(|p| p.len).sum::<u64>(), 123_457);
        let last_flags: Vec<bool> = parts.iter().map(|p| p.is_last).collect();
        assert_eq!(last_flags.iter().filter(|&&l| l).count(), 1);
        assert!(last_flags[12]);
    }

    #[tokio::test]
    async fn empty_source_yields_exactly_one_empty_part() {
        let parts = collect_parts(PartSplitter::new(tokio::io::empty(), 1_000)).await;
        assert_eq!(
            parts,
            vec![Part {
                index: 1,
                len: 0,
                is_last: true
            }]
        );
    }

    #[tokio::test]
    async fn boundary_probe_keeps_bytes_in_order() {
        let mut splitter = PartSplitter::new(&b"0123456789"[..], 4);
        let mut contents = Vec::new();
        loop {
            let mut sink: Vec<u8> = Vec::new();
            match splitter.copy_next(&mut sink).await.unwrap() {
                Some(part) => {
                    assert_eq!(part.len as usize, sink.len());
                    contents.push(sink);
                    if part.is_last {
                        break;
                    }
                }
                None => break,
            }
        }
        assert_eq!(contents, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);
    }

    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::other("source broke")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn source_error_aborts_without_part_record() {
        let mut splitter = PartSplitter::new(FailingReader { remaining: 100 }, 1_000);
        let mut sink = tokio::io::sink();
        let err = splitter.copy_next(&mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "source broke");
    }
}
