// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observable events published while a project is being synthesized.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentId, AgentSnapshot};

/// Capacity of the event channel. Slow subscribers see `Lagged` rather than
/// slowing down the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A phase of the wave loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavePhase {
    /// Interface artifacts for every source file.
    Spec,
    /// A test file for every source file.
    Test,
    /// Implementations that make the tests pass.
    Impl,
}

impl WavePhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Test => "test",
            Self::Impl => "impl",
        }
    }
}

impl fmt::Display for WavePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the project as a whole stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "wave", rename_all = "snake_case")]
pub enum ProjectPhase {
    Clarification,
    Structure,
    Wave(WavePhase),
    Converged,
    Failed,
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clarification => f.write_str("clarification"),
            Self::Structure => f.write_str("structure"),
            Self::Wave(phase) => write!(f, "wave:{phase}"),
            Self::Converged => f.write_str("converged"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Event published on the orchestrator's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeEvent {
    /// A node changed lifecycle state.
    Transition(AgentSnapshot),
    PhaseChanged { phase: ProjectPhase },
    /// The master asked the human a question.
    HumanPromptRequested { agent: AgentId, question: String },
    /// Repeated root failures; the controller wants human guidance.
    GuidanceRequested { diagnostics: String },
    WaveCompleted {
        wave: u32,
        phase: WavePhase,
        passed: bool,
        diagnostics: String,
    },
    ConvergenceFailure {
        waves: u32,
        phase: WavePhase,
        diagnostics: String,
    },
}

/// Create the event channel.
pub fn channel() -> broadcast::Sender<TreeEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish `event`, ignoring the case where nobody is listening.
pub(crate) fn publish(events: &broadcast::Sender<TreeEvent>, event: TreeEvent) {
    let _ = events.send(event);
}
