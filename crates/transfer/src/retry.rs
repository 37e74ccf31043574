//! Bounded, deadline-aware retries.

use std::fmt::Display;
use std::time::{Duration, Instant};

use partwise_protocol::TransportError;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;

/// Cap for a single exponential backoff step.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Default number of re-attempts after the first try.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default first backoff step.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default jitter factor.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    NoRetry,
    Retry,
}

/// Maps an error to a retry decision.
pub trait Classifier<E> {
    fn classify(&self, err: &E) -> RetryAction;
}

/// Retries network failures, throttling (429) and server errors (5xx).
///
/// Every other status and every client-side failure is permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCodeClassifier;

impl Classifier<TransportError> for StatusCodeClassifier {
    fn classify(&self, err: &TransportError) -> RetryAction {
        match err {
            TransportError::Network(_) => RetryAction::Retry,
            TransportError::Server { status_code, .. }
                if *status_code == 429 || *status_code >= 500 =>
            {
                RetryAction::Retry
            }
            _ => RetryAction::NoRetry,
        }
    }
}

impl Classifier<TransferError> for StatusCodeClassifier {
    fn classify(&self, err: &TransferError) -> RetryAction {
        match err {
            TransferError::Transport(e) => self.classify(e),
            _ => RetryAction::NoRetry,
        }
    }
}

/// Cancellation and deadline shared by the calls of one transfer.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Returns `false` if the context is cancelled or sleeping `wait` would
    /// run past the deadline.
    pub fn worth_retrying(&self, wait: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.deadline {
            Some(deadline) => Instant::now() + wait <= deadline,
            None => true,
        }
    }
}

/// Ordered backoff schedule plus jitter.
///
/// The schedule length is the maximum number of re-attempts, so a policy
/// runs its work at most `1 + backoff.len()` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_BASE).with_jitter(DEFAULT_JITTER)
    }
}

impl RetryPolicy {
    /// Uses `backoff` verbatim, without jitter.
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self {
            backoff,
            jitter: 0.0,
        }
    }

    /// Never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// `n` steps starting at `base`, doubling each step, capped at [`MAX_BACKOFF`].
    pub fn exponential(n: usize, base: Duration) -> Self {
        let mut step = base;
        let backoff = (0..n)
            .map(|_| {
                let current = step.min(MAX_BACKOFF);
                step = step.saturating_mul(2);
                current
            })
            .collect();
        Self::new(backoff)
    }

    /// Sets the jitter factor. Values outside `[0, 1]` are ignored.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        if (0.0..=1.0).contains(&jitter) {
            self.jitter = jitter;
        }
        self
    }

    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn max_retries(&self) -> usize {
        self.backoff.len()
    }

    /// Sleep before re-attempt `i` (0-based), perturbed by up to
    /// `±jitter × base`.
    pub fn sleep_for(&self, i: usize) -> Duration {
        let base = self.backoff.get(i).copied().unwrap_or_default();
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let factor = (1.0 + self.jitter * offset).max(0.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// Runs `work`, re-running it while the classifier says `Retry`, the
    /// schedule has steps left and the context allows the next sleep.
    ///
    /// `work` receives the 0-based attempt number. The last result is
    /// returned as-is.
    pub fn run<T, E, W, C>(&self, ctx: &CallContext, mut work: W, classifier: &C) -> Result<T, E>
    where
        W: FnMut(usize) -> Result<T, E>,
        C: Classifier<E> + ?Sized,
        E: Display,
    {
        let mut result = work(0);
        for i in 0..self.backoff.len() {
            let err = match &result {
                Ok(_) => break,
                Err(e) => e,
            };
            if classifier.classify(err) != RetryAction::Retry {
                break;
            }

            let sleep = self.sleep_for(i);
            if !ctx.worth_retrying(sleep) {
                debug!(
                    attempt = i + 1,
                    sleep_ms = sleep.as_millis() as u64,
                    "retry skipped: context cancelled or deadline too close"
                );
                break;
            }

            warn!(
                attempt = i + 1,
                max = self.backoff.len(),
                sleep_ms = sleep.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            std::thread::sleep(sleep);
            result = work(i + 1);
        }
        result
    }
}
