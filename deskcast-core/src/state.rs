//! Lifecycle state of the delivery loop.
//!
//! Transitions are validated and return `Result` instead of panicking.

use crate::error::CastError;

/// The current phase of a streaming session.
///
/// ```text
///  Stopped ──► Running ──► Stopping ──► Stopped
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Nothing running. Initial and terminal state.
    #[default]
    Stopped,

    /// Capture and encoder are up; frames are being delivered.
    Running,

    /// Stop requested; capture, encoder and socket are being released.
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Stopped`.
    pub fn start(&mut self) -> Result<(), CastError> {
        match self {
            Self::Stopped => {
                *self = Self::Running;
                Ok(())
            }
            _ => Err(CastError::InvalidTransition(
                "cannot start: not in Stopped state",
            )),
        }
    }

    /// Valid from: `Running`.
    pub fn begin_stop(&mut self) -> Result<(), CastError> {
        match self {
            Self::Running => {
                *self = Self::Stopping;
                Ok(())
            }
            _ => Err(CastError::InvalidTransition(
                "cannot stop: not in Running state",
            )),
        }
    }

    /// Valid from: `Stopping`.
    pub fn finish_stop(&mut self) -> Result<(), CastError> {
        match self {
            Self::Stopping => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(CastError::InvalidTransition(
                "cannot finish stop: not in Stopping state",
            )),
        }
    }

    /// Back to `Stopped` regardless of current state, for startup failures.
    pub fn force_stop(&mut self) {
        *self = Self::Stopped;
    }
}
