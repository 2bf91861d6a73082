//! Run status as seen by the nomination engine.
//!
//! The Run state machine itself lives elsewhere; the engine only needs to know
//! whether a run has finished successfully and, for tag derivation, whether
//! its outputs are still being produced or were abandoned.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Deactivated,
    Waiting,
    Ready,
    Starting,
    Running,
    Completing,
    Aborting,
    Done,
    Failed,
    Invalidated,
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        RunStatus::Deactivated,
        RunStatus::Waiting,
        RunStatus::Ready,
        RunStatus::Starting,
        RunStatus::Running,
        RunStatus::Completing,
        RunStatus::Aborting,
        RunStatus::Done,
        RunStatus::Failed,
        RunStatus::Invalidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Deactivated => "deactivated",
            RunStatus::Waiting => "waiting",
            RunStatus::Ready => "ready",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Completing => "completing",
            RunStatus::Aborting => "aborting",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Invalidated => "invalidated",
        }
    }

    /// Only outputs of runs in this state take part in nomination.
    pub fn is_done(&self) -> bool {
        matches!(self, RunStatus::Done)
    }

    /// Outputs of these runs carry `knit#transient:processing`.
    pub fn is_unterminated(&self) -> bool {
        matches!(
            self,
            RunStatus::Deactivated
                | RunStatus::Waiting
                | RunStatus::Ready
                | RunStatus::Starting
                | RunStatus::Running
                | RunStatus::Completing
                | RunStatus::Aborting
        )
    }

    /// Outputs of these runs carry `knit#transient:failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Invalidated)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("'{}' is not a run status", s))
    }
}
