//! Transfer speed over a sliding window of progress events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use partwise_protocol::{ProgressEvent, ProgressListener};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

struct Sample {
    bytes: u64,
    at: Instant,
}

/// Estimates speed and time remaining from `Rw` events.
///
/// Feed it through [`ThroughputMeter::listener`], alone or chained in
/// front of another listener.
pub struct ThroughputMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    samples: Vec<Sample>,
    window: Duration,
    max_samples: usize,
    consumed: u64,
    total: u64,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ThroughputMeter {
    /// `window` defaults to 5 s and `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: Vec::new(),
                window: window.unwrap_or(DEFAULT_WINDOW),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
                consumed: 0,
                total: 0,
            }),
        }
    }

    /// Listener that records into this meter, then forwards to `next`.
    pub fn listener(self: &Arc<Self>, next: Option<ProgressListener>) -> ProgressListener {
        let meter = Arc::clone(self);
        Arc::new(move |event| {
            meter.observe(&event);
            if let Some(next) = &next {
                next(event);
            }
        })
    }

    pub fn observe(&self, event: &ProgressEvent) {
        let mut m = self.lock();
        match *event {
            ProgressEvent::Started => {
                m.samples.clear();
                m.samples.push(Sample {
                    bytes: 0,
                    at: Instant::now(),
                });
            }
            ProgressEvent::Rw {
                rw_once_bytes,
                consumed_bytes,
                total_bytes,
            } => {
                m.consumed = consumed_bytes;
                m.total = total_bytes;
                let now = Instant::now();
                m.samples.push(Sample {
                    bytes: rw_once_bytes,
                    at: now,
                });
                let cutoff = now.checked_sub(m.window).unwrap_or(now);
                m.samples.retain(|s| s.at >= cutoff);
                if m.samples.len() > m.max_samples {
                    let excess = m.samples.len() - m.max_samples;
                    m.samples.drain(..excess);
                }
            }
            ProgressEvent::Succeeded {
                consumed_bytes,
                total_bytes,
            } => {
                m.consumed = consumed_bytes;
                m.total = total_bytes;
            }
            ProgressEvent::Failed => {}
        }
    }

    /// Average bytes per second in the window, 0 with fewer than two samples.
    pub fn bytes_per_second(&self) -> f64 {
        self.lock().rate()
    }

    /// Time left at the current rate, `None` while the rate is unknown.
    pub fn eta(&self) -> Option<Duration> {
        let m = self.lock();
        let rate = m.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = m.total.saturating_sub(m.consumed);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn reset(&self) {
        let mut m = self.lock();
        m.samples.clear();
        m.consumed = 0;
        m.total = 0;
    }

    fn lock(&self) -> MutexGuard<'_, MeterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MeterInner {
    fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.at.duration_since(first.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The first sample only anchors the window start.
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw(n: u64, consumed: u64, total: u64) -> ProgressEvent {
        ProgressEvent::Rw {
            rw_once_bytes: n,
            consumed_bytes: consumed,
            total_bytes: total,
        }
    }

    #[test]
    fn no_samples_means_no_rate() {
        let meter = ThroughputMeter::default();
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert!(meter.eta().is_none());
    }

    #[test]
    fn rate_and_eta_from_events() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(10)), None);
        meter.observe(&ProgressEvent::Started);
        std::thread::sleep(Duration::from_millis(50));
        meter.observe(&rw(1000, 1000, 10_000));
        assert!(meter.bytes_per_second() > 0.0);
        let eta = meter.eta().unwrap();
        assert!(eta > Duration::ZERO);
    }

    #[test]
    fn sample_count_is_bounded() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            meter.observe(&rw(10, i * 10, 1000));
        }
        assert!(meter.lock().samples.len() <= 5);
    }

    #[test]
    fn listener_forwards_events() {
        let meter = Arc::new(ThroughputMeter::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let next: ProgressListener = Arc::new(move |e| sink.lock().unwrap().push(e));
        let listener = meter.listener(Some(next));
        listener(ProgressEvent::Started);
        listener(rw(5, 5, 5));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(meter.lock().consumed, 5);
    }

    #[test]
    fn reset_clears_state() {
        let meter = ThroughputMeter::default();
        meter.observe(&ProgressEvent::Started);
        meter.observe(&rw(5, 5, 10));
        meter.reset();
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert!(meter.eta().is_none());
    }
}
