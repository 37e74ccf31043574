//! State shared by the part tasks of one transfer.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::TransferError;
use crate::cancel::CancelHook;
use crate::retry::{CallContext, RetryPolicy, StatusCodeClassifier};
use crate::scheduler::{SchedulerOutcome, Task, TaskScheduler};
use crate::state::{TransferPhase, TransferState};
use crate::stream::StreamPipeline;
use crate::transport::ObjectTransport;
use crate::types::{EventListener, PartEventInfo, TransferEvent, TransferEventType};

/// Sends [`TransferEvent`]s for one transfer.
#[derive(Clone, Default)]
pub(crate) struct EventEmitter {
    listener: Option<EventListener>,
    bucket: String,
    key: String,
    upload_id: String,
    checkpoint_file: Option<PathBuf>,
}

impl EventEmitter {
    pub(crate) fn new(listener: Option<EventListener>, bucket: &str, key: &str) -> Self {
        Self {
            listener,
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn with_upload_id(mut self, upload_id: &str) -> Self {
        self.upload_id = upload_id.to_string();
        self
    }

    pub(crate) fn with_checkpoint(mut self, path: Option<PathBuf>) -> Self {
        self.checkpoint_file = path;
        self
    }

    pub(crate) fn emit(
        &self,
        kind: TransferEventType,
        part: Option<PartEventInfo>,
        error: Option<&TransferError>,
    ) {
        let Some(listener) = &self.listener else {
            return;
        };
        debug!(event = %kind, key = %self.key, "transfer event");
        listener(&TransferEvent {
            kind,
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            checkpoint_file: self.checkpoint_file.clone(),
            part,
            error: error.map(ToString::to_string),
        });
    }
}

/// Everything a part task needs besides its own part.
pub(crate) struct PartContext {
    pub transport: Arc<dyn ObjectTransport>,
    pub retry: RetryPolicy,
    pub call: CallContext,
    pub cancel: CancelHook,
    pub pipeline: StreamPipeline,
    pub events: EventEmitter,
    pub enable_crc: bool,
}

impl PartContext {
    /// Runs one part attempt under the retry policy.
    ///
    /// Each attempt first checks the cancel hook, so a cancel during a
    /// backoff sleep ends the part instead of retrying it.
    pub(crate) fn run_attempts<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        self.retry.run(
            &self.call,
            |_| {
                if self.cancel.is_cancelled() {
                    return Err(self.cancel.stop_error());
                }
                attempt()
            },
            &StatusCodeClassifier,
        )
    }

    /// Takes back progress of a failed attempt that may be retried.
    pub(crate) fn rewind_progress(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(progress) = self.pipeline.progress() {
            progress.rewind(bytes);
        }
    }

    /// Picks the Failed or Aborted event for a failed part.
    pub(crate) fn failure_kind(
        &self,
        failed: TransferEventType,
        aborted: TransferEventType,
    ) -> TransferEventType {
        if self.cancel.is_aborted() { aborted } else { failed }
    }
}

/// Runs `tasks` on up to `task_num` workers and waits for all of them.
pub(crate) fn run_tasks<T: Task>(
    tasks: Vec<T>,
    task_num: usize,
    cancel: &CancelHook,
) -> Result<SchedulerOutcome<T::Output>, TransferError> {
    if tasks.is_empty() {
        return Ok(SchedulerOutcome {
            completed: Vec::new(),
            failure: None,
            skipped: Vec::new(),
            cancelled: cancel.is_cancelled(),
        });
    }
    let mut scheduler = TaskScheduler::new(task_num.min(tasks.len()), Some(cancel.clone()));
    scheduler.run()?;
    for task in tasks {
        scheduler.add_task(task)?;
    }
    scheduler.finish_add()
}

/// Turns a drained scheduler into the transfer result.
///
/// A cancel wins over any part failure it caused. A real failure keeps the
/// checkpoint and reports where it is.
pub(crate) fn settle<O>(
    outcome: SchedulerOutcome<O>,
    cancel: &CancelHook,
    checkpoint: Option<PathBuf>,
    state: &mut TransferState,
) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        let err = cancel.stop_error();
        warn!(
            aborted = cancel.is_aborted(),
            skipped = outcome.skipped.len(),
            "transfer stopped by cancel"
        );
        state.advance(TransferPhase::Aborted)?;
        return Err(err);
    }
    if let Some(failure) = outcome.failure {
        state.fail();
        error!(
            part = failure.part_number,
            error = %failure.error,
            checkpoint = ?checkpoint,
            "transfer failed"
        );
        return Err(TransferError::PartFailed {
            part_number: failure.part_number,
            source: Box::new(failure.error),
            checkpoint,
        });
    }
    if !outcome.skipped.is_empty() {
        state.fail();
        return Err(TransferError::InvalidState(format!(
            "{} parts were never started",
            outcome.skipped.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskFailure;
    use std::sync::Mutex;

    fn outcome(failure: Option<TaskFailure>, skipped: Vec<u32>) -> SchedulerOutcome<u32> {
        SchedulerOutcome {
            completed: vec![1],
            failure,
            skipped,
            cancelled: false,
        }
    }

    fn in_flight() -> TransferState {
        let mut state = TransferState::new("b/k");
        state.advance(TransferPhase::Fresh).unwrap();
        state.advance(TransferPhase::Scheduling).unwrap();
        state.advance(TransferPhase::PartsInFlight).unwrap();
        state
    }

    #[test]
    fn clean_outcome_settles() {
        let mut state = in_flight();
        settle(outcome(None, vec![]), &CancelHook::new(), None, &mut state).unwrap();
        assert_eq!(state.phase(), TransferPhase::PartsInFlight);
    }

    #[test]
    fn failure_names_part_and_checkpoint() {
        let mut state = in_flight();
        let failure = TaskFailure {
            part_number: 4,
            error: TransferError::invalid("boom"),
        };
        let path = PathBuf::from("/tmp/f.abc.upload");
        let err = settle(
            outcome(Some(failure), vec![5]),
            &CancelHook::new(),
            Some(path.clone()),
            &mut state,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::PartFailed { part_number: 4, .. }));
        assert_eq!(err.checkpoint_path(), Some(path.as_path()));
        assert_eq!(state.phase(), TransferPhase::Failed);
    }

    #[test]
    fn cancel_wins_over_failure() {
        let mut state = in_flight();
        let hook = CancelHook::new();
        hook.cancel(true);
        let failure = TaskFailure {
            part_number: 2,
            error: TransferError::Aborted,
        };
        let err = settle(outcome(Some(failure), vec![3]), &hook, None, &mut state).unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
        assert_eq!(state.phase(), TransferPhase::Aborted);
    }

    #[test]
    fn skipped_parts_without_cause_are_an_error() {
        let mut state = in_flight();
        let err = settle(outcome(None, vec![2]), &CancelHook::new(), None, &mut state).unwrap_err();
        assert!(matches!(err, TransferError::InvalidState(_)));
    }

    #[test]
    fn emitter_fills_transfer_fields() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: EventListener = Arc::new(move |e: &TransferEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        let emitter = EventEmitter::new(Some(listener), "b", "k")
            .with_upload_id("u1")
            .with_checkpoint(Some(PathBuf::from("/tmp/cp")));
        emitter.emit(
            TransferEventType::UploadPartFailed,
            Some(PartEventInfo {
                part_number: 1,
                ..Default::default()
            }),
            Some(&TransferError::Cancelled),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].upload_id, "u1");
        assert_eq!(seen[0].checkpoint_file, Some(PathBuf::from("/tmp/cp")));
        assert_eq!(seen[0].error.as_deref(), Some("transfer cancelled"));
    }

    #[test]
    fn empty_task_list_needs_no_workers() {
        struct Never;
        impl Task for Never {
            type Output = ();
            fn part_number(&self) -> u32 {
                0
            }
            fn run(&self) -> Result<(), TransferError> {
                unreachable!()
            }
        }
        let outcome = run_tasks(Vec::<Never>::new(), 4, &CancelHook::new()).unwrap();
        assert!(outcome.is_success());
        assert!(outcome.completed.is_empty());
    }
}
