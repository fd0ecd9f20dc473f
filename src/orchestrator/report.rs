use crate::sync::RecordError;
use serde::Serialize;

/// What asked for a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Interval timer; honours `min_records_for_sync`
    Periodic,
    /// Operator request from the dashboard
    Manual,
    /// Last pass before the process exits
    Shutdown,
}

impl DrainTrigger {
    pub fn honours_threshold(&self) -> bool {
        matches!(self, DrainTrigger::Periodic)
    }
}

impl std::fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainTrigger::Periodic => write!(f, "periodic"),
            DrainTrigger::Manual => write!(f, "manual"),
            DrainTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Why a drain did no delivery work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    NothingPending,
    BelowThreshold,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DrainReport {
    pub trigger: DrainTrigger,
    /// Result of this pass's connectivity check
    pub online: bool,
    pub skipped: Option<SkipReason>,
    /// Unsynced records seen at the start of the pass
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records flipped to synced
    pub marked: usize,
    /// Synced records removed by cleanup
    pub cleared: usize,
    pub errors: Vec<RecordError>,
}

impl DrainReport {
    pub(crate) fn skipped(trigger: DrainTrigger, online: bool, reason: SkipReason, pending: usize) -> Self {
        Self {
            trigger,
            online,
            skipped: Some(reason),
            pending,
            succeeded: 0,
            failed: 0,
            marked: 0,
            cleared: 0,
            errors: Vec::new(),
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}
