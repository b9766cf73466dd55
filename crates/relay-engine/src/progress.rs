//! Thread-safe byte counter with elapsed-time-based ETA estimation.
//!
//! The counter observes a byte stream as a tee: every chunk read by the
//! downstream consumer is tallied on its way through, so observation never
//! affects backpressure. Reads of the counter come from concurrent status
//! queries; a read may land between two writes, which is acceptable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio_util::io::InspectReader;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("total size is unknown")]
    UnknownTotal,

    #[error("no bytes transferred yet")]
    NoProgressYet,
}

#[derive(Debug)]
struct ProgressInner {
    transferred: u64,
    started_at: Instant,
}

/// Progress state for one transfer.
///
/// `total_bytes` is immutable post-construction and needs no lock; the
/// mutable pair lives under a single mutex, written on every observed chunk
/// and read far less often by status queries.
#[derive(Debug)]
pub struct ProgressCounter {
    total_bytes: u64,
    inner: Mutex<ProgressInner>,
}

impl ProgressCounter {
    /// `total_bytes == 0` means the total is unknown.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            inner: Mutex::new(ProgressInner {
                transferred: 0,
                started_at: Instant::now(),
            }),
        }
    }

    /// Tally `n` observed bytes.
    pub fn record(&self, n: u64) {
        self.inner.lock().transferred += n;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.lock().transferred
    }

    /// Percentage of the transfer completed.
    ///
    /// Fails with [`ProgressError::UnknownTotal`] when the total is unknown
    /// instead of returning a meaningless ratio.
    pub fn percentage(&self) -> Result<f64, ProgressError> {
        if self.total_bytes == 0 {
            return Err(ProgressError::UnknownTotal);
        }
        let transferred = self.inner.lock().transferred;
        Ok(transferred as f64 / self.total_bytes as f64 * 100.0)
    }

    /// Estimated time remaining, from the average throughput since start.
    ///
    /// Intentionally unsmoothed; early in a transfer this is noisy.
    pub fn estimated_time_remaining(&self) -> Result<Duration, ProgressError> {
        if self.total_bytes == 0 {
            return Err(ProgressError::UnknownTotal);
        }
        let inner = self.inner.lock();
        if inner.transferred == 0 {
            return Err(ProgressError::NoProgressYet);
        }
        let elapsed = inner.started_at.elapsed().as_secs_f64();
        let rate = inner.transferred as f64 / elapsed;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ProgressError::NoProgressYet);
        }
        let remaining = self.total_bytes.saturating_sub(inner.transferred) as f64 / rate;
        Ok(Duration::from_secs_f64(remaining))
    }
}

/// Wrap `reader` so every chunk read through it is recorded in `counter`.
pub fn observe<R: AsyncRead>(
    reader: R,
    counter: Arc<ProgressCounter>,
) -> InspectReader<R, impl FnMut(&[u8])> {
    InspectReader::new(reader, move |chunk: &[u8]| {
        counter.record(chunk.len() as u64)
    })
}
