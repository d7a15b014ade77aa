//! Error types for the runner.
//!
//! Replace failures carry a [`Severity`] so the caller decides whether to
//! terminate the process or log and wait for the next update.

use std::fmt;

use thiserror::Error;

use crate::images::ImageStoreError;
use crate::launch::Role;
use crate::runtime::RuntimeError;

/// How the caller must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The role is in an unknown state; the process must terminate.
    Fatal,
    /// The role is down or stale but known; retry on the next update.
    Recoverable,
}

/// Step of the replace protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStep {
    Terminate,
    ConfirmExit,
    Prune,
    ConfirmPrune,
    EnsureImage,
    StartCommand,
    ConfirmStart,
}

impl ReplaceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplaceStep::Terminate => "terminate",
            ReplaceStep::ConfirmExit => "confirm exit",
            ReplaceStep::Prune => "prune",
            ReplaceStep::ConfirmPrune => "confirm prune",
            ReplaceStep::EnsureImage => "ensure image",
            ReplaceStep::StartCommand => "start",
            ReplaceStep::ConfirmStart => "confirm start",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ReplaceStep::ConfirmExit
            | ReplaceStep::Prune
            | ReplaceStep::ConfirmPrune
            | ReplaceStep::ConfirmStart => Severity::Fatal,
            ReplaceStep::Terminate | ReplaceStep::EnsureImage | ReplaceStep::StartCommand => {
                Severity::Recoverable
            }
        }
    }
}

impl fmt::Display for ReplaceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed replace of one role.
#[derive(Debug, Error)]
#[error(
    "failed to replace {role} ({step} failed, image={image_ref}, container={}): {source}",
    .container_id.as_deref().unwrap_or("none")
)]
pub struct ReplaceError {
    pub role: Role,
    pub step: ReplaceStep,
    pub image_ref: String,
    pub container_id: Option<String>,
    #[source]
    pub source: RuntimeError,
}

impl ReplaceError {
    pub fn severity(&self) -> Severity {
        self.step.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Start-up precondition failures, one per check.
#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("docker check failed (get containers): {0}")]
    Docker(#[source] RuntimeError),

    #[error("scan api check failed: {0}")]
    ScanApi(#[source] anyhow::Error),

    #[error("trace api check failed: {0}")]
    TraceApi(#[source] anyhow::Error),

    #[error("batch api check failed: {0}")]
    BatchApi(#[source] anyhow::Error),
}

/// Top-level runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("start-up check failed: {0}")]
    StartupCheck(#[from] StartupCheckError),

    #[error("failed to nuke leftover containers at start: {0}")]
    Nuke(#[source] RuntimeError),

    #[error("failed to launch embedded {role}: {source}")]
    EmbeddedLaunch {
        role: Role,
        #[source]
        source: ReplaceError,
    },

    #[error(transparent)]
    Replace(#[from] ReplaceError),

    #[error("image updates unavailable: {0}")]
    ImageStream(#[from] ImageStoreError),
}

impl RunnerError {
    pub fn severity(&self) -> Severity {
        match self {
            RunnerError::Replace(e) => e.severity(),
            _ => Severity::Fatal,
        }
    }
}
