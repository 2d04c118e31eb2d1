//! Error taxonomy for trace replay and event synthesis.

use std::path::PathBuf;
use thiserror::Error;

use crate::event::SourceId;
use crate::models::ResourceKind;

#[derive(Error, Debug)]
pub enum SynthError {
    /// A trace row could not be decoded. The row is skipped.
    #[error("Malformed trace row at line {line}: {reason}")]
    Parse { line: u64, reason: String },

    /// The utilization FSM reached a combination with no defined rule.
    #[error("Unexpected {kind} state transition from {from} to {to}")]
    UnexpectedStateTransition {
        kind: ResourceKind,
        from: String,
        to: String,
    },

    /// The session FSM received an event it cannot interpret in its current state.
    #[error("Unexpected transition for session {session} in state {status} on event {event}")]
    UnexpectedSessionTransition {
        session: String,
        status: String,
        event: String,
    },

    #[error("Pending buffer of session {session} is full")]
    PendingOverflow { session: String },

    /// Upstream produced a training-ended/session-stopped pair in the wrong
    /// creation order. Continuing would corrupt the simulated history.
    #[error("Fatal ordering inconsistency: {training_ended} was created after {session_stopped}")]
    FatalInconsistency {
        training_ended: String,
        session_stopped: String,
    },

    #[error("Failed to set up {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A workload template names impossible sessions or trainings.
    #[error("Invalid workload template: {0}")]
    InvalidTemplate(String),

    #[error("Session {0} has no event queue")]
    UnregisteredSession(String),

    /// A driver ended its stream with an error sentinel.
    #[error("Source {id} failed: {message}")]
    SourceFailed { id: SourceId, message: String },

    #[error("Synthesis canceled")]
    Canceled,

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SynthError {
    pub fn setup(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        SynthError::Setup {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Structural violations abort the run instead of being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SynthError::FatalInconsistency { .. } | SynthError::Setup { .. } | SynthError::Canceled
        )
    }
}

pub type Result<T, E = SynthError> = std::result::Result<T, E>;
