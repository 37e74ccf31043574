//! Lifecycle of one transfer.

use std::fmt;

use tracing::debug;

use crate::TransferError;

/// Phase of a transfer.
///
/// `Planning → Fresh | Resuming → Scheduling → PartsInFlight →
/// AllPartsComplete → Finalizing → Done`, with `Aborted` and `Failed`
/// reachable from every non-terminal phase (`Aborted` only until
/// finalization starts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Planning,
    Fresh,
    Resuming,
    Scheduling,
    PartsInFlight,
    AllPartsComplete,
    Finalizing,
    Done,
    Aborted,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }

    fn can_advance_to(self, next: Self) -> bool {
        use TransferPhase::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Finalizing, Aborted) => false,
            (_, Aborted) => true,
            (Planning, Fresh | Resuming) => true,
            (Fresh | Resuming, Scheduling) => true,
            (Scheduling, PartsInFlight) => true,
            (PartsInFlight, AllPartsComplete) => true,
            (AllPartsComplete, Finalizing) => true,
            (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks and enforces the phase graph of one transfer.
#[derive(Debug)]
pub struct TransferState {
    label: String,
    phase: TransferPhase,
}

impl TransferState {
    /// `label` identifies the transfer in logs, e.g. `bucket/key`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            phase: TransferPhase::Planning,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Moves to `next`, rejecting edges outside the phase graph.
    pub fn advance(&mut self, next: TransferPhase) -> Result<(), TransferError> {
        if !self.phase.can_advance_to(next) {
            return Err(TransferError::InvalidState(format!(
                "{}: cannot move from {} to {}",
                self.label, self.phase, next
            )));
        }
        debug!(transfer = %self.label, from = %self.phase, to = %next, "transfer state");
        self.phase = next;
        Ok(())
    }

    /// Moves to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            let _ = self.advance(TransferPhase::Failed);
        }
    }
}
