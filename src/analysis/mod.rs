//! Three-phase schema analysis.
//!
//! Phase 1 explains tables, phase 2 explains columns, phase 3 writes
//! example queries. Progress lives in per-phase messages; a phase is done
//! when its message carries [`COMPLETE_MARKER`], and any message carrying
//! [`FAILURE_MARKER`] makes the job terminal.

mod manager;
mod worker;

pub use manager::{AnalysisJobManager, PhaseLog};
pub use worker::{AnalysisWorker, LlmAnalysisWorker, PhaseOutput};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Appended to a phase message when the phase committed its output.
pub const COMPLETE_MARKER: &str = "[done]";

/// Appended to a phase message when the phase failed or was cancelled.
pub const FAILURE_MARKER: &str = "[failed]";

/// Terminal phase number, for success and failure alike.
pub const TERMINAL_PHASE: u8 = 4;

/// The three units of analysis work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisPhase {
    Tables,
    Columns,
    Examples,
}

impl AnalysisPhase {
    /// Phases in execution order.
    pub const ALL: [AnalysisPhase; 3] = [Self::Tables, Self::Columns, Self::Examples];

    /// 1-based position, as reported in `currentPhase`.
    pub fn number(&self) -> u8 {
        match self {
            Self::Tables => 1,
            Self::Columns => 2,
            Self::Examples => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Tables => "table explanations",
            Self::Columns => "column explanations",
            Self::Examples => "SQL examples",
        }
    }
}

/// Progress text of each phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMessages {
    pub phase1: String,
    pub phase2: String,
    pub phase3: String,
}

impl PhaseMessages {
    pub fn get(&self, phase: AnalysisPhase) -> &str {
        match phase {
            AnalysisPhase::Tables => &self.phase1,
            AnalysisPhase::Columns => &self.phase2,
            AnalysisPhase::Examples => &self.phase3,
        }
    }

    fn get_mut(&mut self, phase: AnalysisPhase) -> &mut String {
        match phase {
            AnalysisPhase::Tables => &mut self.phase1,
            AnalysisPhase::Columns => &mut self.phase2,
            AnalysisPhase::Examples => &mut self.phase3,
        }
    }

    /// Appends a line to a phase's message.
    pub fn append(&mut self, phase: AnalysisPhase, line: &str) {
        let message = self.get_mut(phase);
        if !message.is_empty() {
            message.push('\n');
        }
        message.push_str(line);
    }

    fn all(&self) -> [&str; 3] {
        [
            self.phase1.as_str(),
            self.phase2.as_str(),
            self.phase3.as_str(),
        ]
    }

    /// True once any phase logged the failure marker.
    pub fn has_failure(&self) -> bool {
        self.all().iter().any(|m| m.contains(FAILURE_MARKER))
    }

    /// Phase number implied by the markers.
    ///
    /// 0 before any work, the phase in progress while running, and
    /// [`TERMINAL_PHASE`] once every phase completed or any failed.
    pub fn current_phase(&self) -> u8 {
        if self.has_failure() {
            return TERMINAL_PHASE;
        }
        for (i, message) in self.all().iter().enumerate() {
            if !message.contains(COMPLETE_MARKER) {
                return if message.is_empty() { i as u8 } else { i as u8 + 1 };
            }
        }
        TERMINAL_PHASE
    }
}

/// One analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisJob {
    pub session_id: String,
    pub connection_id: i64,
    pub phase_messages: PhaseMessages,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn current_phase(&self) -> u8 {
        self.phase_messages.current_phase()
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        self.current_phase() == TERMINAL_PHASE
    }
}

/// Polling view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStatus {
    pub found: bool,
    pub current_phase: u8,
    pub phases: PhaseMessages,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
}

impl AnalysisStatus {
    /// Status for a session with no job, or one past retention.
    pub fn not_found() -> Self {
        Self {
            found: false,
            current_phase: 0,
            phases: PhaseMessages::default(),
            cancelled: None,
            elapsed_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.found && self.current_phase == TERMINAL_PHASE
    }
}
