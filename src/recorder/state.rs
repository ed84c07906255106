//! Session state management
//!
//! Defines the session state machine, the events a session publishes and the
//! summary produced once it is torn down.

use super::consumer::ConsumerReport;
use super::switcher::{SwitchPhase, SwitchStrategy};
use crate::capture::types::Resolution;
use crate::graph::GraphSnapshot;
use crate::utils::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current state of a pipeline session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Nothing created
    #[default]
    Idle,
    /// Graph built, nothing streaming yet
    Configured,
    /// Captures streaming, consumers running
    Streaming,
    /// A resolution switch is in progress or was left unfinished
    Switching,
    /// Teardown in progress
    TearingDown,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Idle, Configured) => true,
            (Configured, Streaming) => true,
            (Streaming, Switching) => true,
            (Switching, Streaming) => true,

            // Teardown is reachable from anywhere something may exist
            (Configured | Streaming | Switching, TearingDown) => true,
            (TearingDown, Idle) => true,

            // Setup failed midway
            (Idle, TearingDown) => true,

            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Configured => "Configured",
            SessionState::Streaming => "Streaming",
            SessionState::Switching => "Switching",
            SessionState::TearingDown => "TearingDown",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Events emitted during a session
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Session state changed
    StateChanged { from: SessionState, to: SessionState },
    /// A consumer was started for an encode channel
    ConsumerStarted(u32),
    /// A consumer was joined
    ConsumerStopped(ConsumerReport),
    /// A resolution switch completed a phase
    SwitchPhase { capture: u32, phase: SwitchPhase },
    /// Error occurred
    Error(ErrorRecord),
}

/// One completed resolution switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRecord {
    pub capture: u32,
    pub from: Resolution,
    pub to: Resolution,
    pub strategy: SwitchStrategy,
    pub rebuilt: Vec<u32>,
    pub completed_at: DateTime<Utc>,
}

/// Result of a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub sensor: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub switches: Vec<SwitchRecord>,
    pub consumers: Vec<ConsumerReport>,
    /// Graph as it stood when the summary was taken
    pub graph: GraphSnapshot,
    pub errors: Vec<ErrorRecord>,
}

impl SessionSummary {
    /// Total units consumed across all consumers
    pub fn total_frames(&self) -> u64 {
        self.consumers.iter().map(|c| c.frames).sum()
    }

    /// Whether every consumer ended by cancellation or frame limit
    pub fn all_consumers_clean(&self) -> bool {
        self.consumers.iter().all(|c| c.exit.is_clean())
    }

    /// Session duration in milliseconds, if it has ended
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
