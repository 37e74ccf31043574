//! Read decorators: rate limiting, progress reporting and checksumming.
//!
//! Each decorator wraps a [`Read`] and is itself a [`Read`], so they nest.
//! [`StreamPipeline`] fixes the nesting order per transfer direction:
//!
//! - upload: file → checksum → progress → rate limit (outermost)
//! - download: network → rate limit → checksum → progress (outermost)

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crc::Digest;
use partwise_protocol::constants::MIB;
use partwise_protocol::{ProgressEvent, ProgressListener};

use crate::checksum::CRC64;
use crate::ratelimit::RateLimiter;

/// Pending bytes the parallel reporter accumulates before emitting an `Rw` event.
pub const PARALLEL_FLUSH_THRESHOLD: u64 = 4 * MIB;

/// Floor for the limiter's wait hint so a zero hint cannot spin.
const MIN_LIMITER_WAIT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Blocks each read until the limiter grants the requested byte count.
pub struct RateLimitedReader<R> {
    limiter: Arc<dyn RateLimiter>,
    inner: R,
}

impl<R: Read> RateLimitedReader<R> {
    pub fn new(limiter: Arc<dyn RateLimiter>, inner: R) -> Self {
        Self { limiter, inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for RateLimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.read(buf);
        }
        let want = buf.len() as u64;
        loop {
            let (granted, wait) = self.limiter.acquire(want);
            if granted {
                break;
            }
            std::thread::sleep(wait.max(MIN_LIMITER_WAIT));
        }
        self.inner.read(buf)
    }
}

// ---------------------------------------------------------------------------
// Single-stream progress
// ---------------------------------------------------------------------------

/// Reports progress of one stream to its own listener.
pub struct ProgressReader<R> {
    listener: ProgressListener,
    inner: R,
    consumed: u64,
    total: u64,
    started: bool,
}

impl<R: Read> ProgressReader<R> {
    /// Wraps `inner`, which is expected to yield exactly `total` bytes.
    pub fn new(listener: ProgressListener, inner: R, total: u64) -> Self {
        Self {
            listener,
            inner,
            consumed: 0,
            total,
            started: false,
        }
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.started {
            self.started = true;
            (self.listener)(ProgressEvent::Started);
        }

        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                (self.listener)(ProgressEvent::Failed);
                return Err(e);
            }
        };
        if n == 0 {
            return Ok(0);
        }

        self.consumed += n as u64;
        (self.listener)(ProgressEvent::Rw {
            rw_once_bytes: n as u64,
            consumed_bytes: self.consumed,
            total_bytes: self.total,
        });
        if self.consumed == self.total {
            (self.listener)(ProgressEvent::Succeeded {
                consumed_bytes: self.consumed,
                total_bytes: self.total,
            });
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Parallel progress
// ---------------------------------------------------------------------------

/// Progress state shared by every part stream of one transfer.
///
/// Counters are lock-free. Reads only ever produce `Rw` events; `Succeeded`
/// is emitted at most once, by [`ParallelProgress::complete`], after the
/// transfer has been finalized.
pub struct ParallelProgress {
    listener: ProgressListener,
    total: u64,
    consumed: AtomicU64,
    subtotal: AtomicU64,
    /// Rewound bytes that were already flushed; later reads repay them
    /// before adding to `subtotal`.
    rewound: AtomicU64,
    succeeded: AtomicBool,
}

impl ParallelProgress {
    /// `already_consumed` seeds the counter with bytes of parts completed by
    /// an earlier run.
    pub fn new(listener: ProgressListener, total: u64, already_consumed: u64) -> Self {
        Self {
            listener,
            total,
            consumed: AtomicU64::new(already_consumed),
            subtotal: AtomicU64::new(0),
            rewound: AtomicU64::new(0),
            succeeded: AtomicBool::new(false),
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns `true` once `Succeeded` has been emitted.
    pub fn is_succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }

    fn record(&self, n: u64) {
        let repaid = take_up_to(&self.rewound, n);
        let fresh = n - repaid;
        // Sub-total first: whoever brings `consumed` to the total then sees
        // every other reader's bytes already pending.
        let subtotal = self.subtotal.fetch_add(fresh, Ordering::AcqRel) + fresh;
        let consumed = self.consumed.fetch_add(n, Ordering::AcqRel) + n;

        if subtotal >= PARALLEL_FLUSH_THRESHOLD || consumed >= self.total {
            self.flush(consumed);
        }
    }

    fn flush(&self, consumed: u64) {
        let pending = self.subtotal.swap(0, Ordering::AcqRel);
        if pending > 0 {
            (self.listener)(ProgressEvent::Rw {
                rw_once_bytes: pending,
                consumed_bytes: consumed,
                total_bytes: self.total,
            });
        }
    }

    fn fail(&self) {
        (self.listener)(ProgressEvent::Failed);
    }

    /// Takes back bytes counted by a part attempt that is about to be retried.
    pub fn rewind(&self, n: u64) {
        let _ = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            });
        let unflushed = take_up_to(&self.subtotal, n);
        self.rewound.fetch_add(n - unflushed, Ordering::AcqRel);
    }

    /// Flushes pending bytes and emits `Succeeded`. Later calls do nothing.
    pub fn complete(&self) {
        if self
            .succeeded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let consumed = self.consumed().max(self.total);
        self.flush(consumed);
        (self.listener)(ProgressEvent::Succeeded {
            consumed_bytes: consumed,
            total_bytes: self.total,
        });
    }
}

/// Subtracts up to `n` from `counter` and returns the amount taken.
fn take_up_to(counter: &AtomicU64, n: u64) -> u64 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
        Some(c.saturating_sub(n))
    }) {
        Ok(prev) | Err(prev) => prev.min(n),
    }
}

/// Reports one part stream into a shared [`ParallelProgress`].
pub struct ParallelProgressReader<R> {
    shared: Arc<ParallelProgress>,
    inner: R,
}

impl<R: Read> ParallelProgressReader<R> {
    pub fn new(shared: Arc<ParallelProgress>, inner: R) -> Self {
        Self { shared, inner }
    }
}

impl<R: Read> Read for ParallelProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                self.shared.fail();
                return Err(e);
            }
        };
        if n > 0 {
            self.shared.record(n as u64);
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Shared access to a streaming CRC-64 digest.
#[derive(Clone)]
pub struct ChecksumHandle(Arc<Mutex<Digest<'static, u64>>>);

impl Default for ChecksumHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(CRC64.digest())))
    }

    fn update(&self, data: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(data);
    }

    /// Returns the digest of everything fed so far and resets the state.
    ///
    /// Call once, after the stream is exhausted.
    pub fn finalize(&self) -> u64 {
        let mut digest = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *digest, CRC64.digest()).finalize()
    }
}

/// Feeds every successfully read chunk into a CRC-64 digest.
pub struct ChecksumReader<R> {
    digest: ChecksumHandle,
    inner: R,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_handle(ChecksumHandle::new(), inner)
    }

    pub fn with_handle(digest: ChecksumHandle, inner: R) -> Self {
        Self { digest, inner }
    }

    pub fn handle(&self) -> ChecksumHandle {
        self.digest.clone()
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.digest.update(&buf[..n]);
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Transfer direction; selects the decorator nesting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Per-transfer decorator configuration, applied identically to every part.
#[derive(Clone)]
pub struct StreamPipeline {
    direction: Direction,
    limiter: Option<Arc<dyn RateLimiter>>,
    progress: Option<Arc<ParallelProgress>>,
}

impl StreamPipeline {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            limiter: None,
            progress: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<ParallelProgress>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn progress(&self) -> Option<&Arc<ParallelProgress>> {
        self.progress.as_ref()
    }

    /// Wraps one part stream.
    pub fn wrap<'a, R>(&self, source: R) -> DecoratedStream<'a>
    where
        R: Read + Send + 'a,
    {
        let checksum = ChecksumHandle::new();
        let reader: Box<dyn Read + Send + 'a> = match self.direction {
            Direction::Upload => {
                let r: Box<dyn Read + Send + 'a> =
                    Box::new(ChecksumReader::with_handle(checksum.clone(), source));
                let r = self.add_progress(r);
                self.add_limiter(r)
            }
            Direction::Download => {
                let r: Box<dyn Read + Send + 'a> = Box::new(source);
                let r = self.add_limiter(r);
                let r: Box<dyn Read + Send + 'a> =
                    Box::new(ChecksumReader::with_handle(checksum.clone(), r));
                self.add_progress(r)
            }
        };
        DecoratedStream {
            reader,
            checksum,
            bytes_read: 0,
        }
    }

    fn add_limiter<'a>(&self, r: Box<dyn Read + Send + 'a>) -> Box<dyn Read + Send + 'a> {
        match &self.limiter {
            Some(l) => Box::new(RateLimitedReader::new(Arc::clone(l), r)),
            None => r,
        }
    }

    fn add_progress<'a>(&self, r: Box<dyn Read + Send + 'a>) -> Box<dyn Read + Send + 'a> {
        match &self.progress {
            Some(p) => Box::new(ParallelProgressReader::new(Arc::clone(p), r)),
            None => r,
        }
    }
}

/// A part stream wrapped by a [`StreamPipeline`].
pub struct DecoratedStream<'a> {
    reader: Box<dyn Read + Send + 'a>,
    checksum: ChecksumHandle,
    bytes_read: u64,
}

impl DecoratedStream<'_> {
    /// Bytes delivered to the caller so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// CRC-64 of the bytes delivered; call once the stream is exhausted.
    pub fn crc64(&self) -> u64 {
        self.checksum.finalize()
    }
}

impl Read for DecoratedStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}
