//! Structured progress stream.
//!
//! Instead of printing to a shared console, the pipeline reports what it is
//! doing as [`BuildEvent`] values delivered to an [`EventSink`] chosen by the
//! caller. [`TracingSink`] forwards them to `tracing`; an
//! `mpsc::Sender<BuildEvent>` hands the raw stream back to the caller.

use std::path::PathBuf;
use std::sync::mpsc::Sender;

use crate::state::BuildStep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Started {
        build_id: String,
        config_name: String,
        resumed: bool,
    },
    WorkDir {
        path: PathBuf,
        reused: bool,
    },
    StepStarted {
        step: BuildStep,
    },
    StepSkipped {
        step: BuildStep,
        reason: String,
    },
    StepCompleted {
        step: BuildStep,
    },
    StepFailed {
        step: BuildStep,
        message: String,
    },
    MirrorAttempt {
        mirror: String,
        attempt: usize,
        total: usize,
    },
    MirrorFailed {
        mirror: String,
        error: String,
    },
    Warning {
        message: String,
    },
    Finished {
        build_id: String,
        artifact: PathBuf,
    },
}

/// Receiver of build events.
pub trait EventSink {
    fn emit(&self, event: BuildEvent);
}

impl EventSink for Sender<BuildEvent> {
    fn emit(&self, event: BuildEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}

impl<F> EventSink for F
where
    F: Fn(&BuildEvent),
{
    fn emit(&self, event: BuildEvent) {
        self(&event)
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BuildEvent) {
        match event {
            BuildEvent::Started {
                build_id,
                config_name,
                resumed,
            } => {
                tracing::info!(%build_id, config = %config_name, resumed, "build started")
            }
            BuildEvent::WorkDir { path, reused } => {
                tracing::info!(path = %path.display(), reused, "build directory")
            }
            BuildEvent::StepStarted { step } => tracing::info!(%step, "executing step"),
            BuildEvent::StepSkipped { step, reason } => {
                tracing::info!(%step, %reason, "step skipped")
            }
            BuildEvent::StepCompleted { step } => tracing::info!(%step, "step completed"),
            BuildEvent::StepFailed { step, message } => {
                tracing::error!(%step, error = %message, "step failed")
            }
            BuildEvent::MirrorAttempt {
                mirror,
                attempt,
                total,
            } => tracing::info!(%mirror, attempt, total, "trying mirror"),
            BuildEvent::MirrorFailed { mirror, error } => {
                tracing::warn!(%mirror, %error, "mirror failed")
            }
            BuildEvent::Warning { message } => tracing::warn!("{message}"),
            BuildEvent::Finished { build_id, artifact } => {
                tracing::info!(%build_id, artifact = %artifact.display(), "image built")
            }
        }
    }
}
