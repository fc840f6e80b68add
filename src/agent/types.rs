// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent identity, roles and lifecycle types.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::message::Outcome;

// ============================================================================
// Identity
// ============================================================================

/// Stable identifier of a node in the agent tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u32);

impl AgentId {
    /// Bus endpoint reserved for the wave controller.
    ///
    /// The controller is not a tree node; it only sends phase tasks to the root
    /// and receives the root's RESULT.
    pub const CONTROLLER: AgentId = AgentId(0);

    pub fn is_controller(self) -> bool {
        self == Self::CONTROLLER
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_controller() {
            write!(f, "controller")
        } else {
            write!(f, "agent-{}", self.0)
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Role of a node in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Owns the project root.
    Master,
    /// Owns one directory.
    Manager,
    /// Owns one file.
    Coder,
    /// Short-lived test runner, never part of the persistent tree.
    Tester,
}

/// What a role is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// May issue DELEGATE / WAIT and own children.
    pub can_delegate: bool,
    /// May CREATE / DELETE paths and rewrite its directory README.
    pub can_restructure: bool,
    /// May CHANGE the content of the file it owns.
    pub can_write_file: bool,
    /// May RUN an ephemeral tester.
    pub can_run_tests: bool,
    /// Removed from the tree as soon as its run ends.
    pub is_ephemeral: bool,
}

const MASTER_CAPS: Capabilities = Capabilities {
    can_delegate: true,
    can_restructure: true,
    can_write_file: false,
    can_run_tests: true,
    is_ephemeral: false,
};

const MANAGER_CAPS: Capabilities = MASTER_CAPS;

const CODER_CAPS: Capabilities = Capabilities {
    can_delegate: false,
    can_restructure: false,
    can_write_file: true,
    can_run_tests: true,
    is_ephemeral: false,
};

const TESTER_CAPS: Capabilities = Capabilities {
    can_delegate: false,
    can_restructure: false,
    can_write_file: false,
    can_run_tests: false,
    is_ephemeral: true,
};

impl AgentRole {
    /// Look up the capability table entry for this role.
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Master => MASTER_CAPS,
            Self::Manager => MANAGER_CAPS,
            Self::Coder => CODER_CAPS,
            Self::Tester => TESTER_CAPS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Manager => "manager",
            Self::Coder => "coder",
            Self::Tester => "tester",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Inactive,
    Active,
    Delegating,
    Waiting,
    Completed,
    Failed,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Waiting -> Failed` is listed here but additionally requires an empty
    /// outstanding set, which the node checks.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Delegating)
                | (Active, Completed)
                | (Active, Failed)
                | (Delegating, Waiting)
                | (Delegating, Active)
                | (Waiting, Delegating)
                | (Waiting, Active)
                | (Waiting, Failed)
                | (Completed, Inactive)
                | (Failed, Inactive)
        )
    }

    /// Anything other than `Inactive` owns its scope path.
    pub fn is_busy(self) -> bool {
        self != Self::Inactive
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Delegating => "delegating",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Context history
// ============================================================================

/// One entry of a node's working context for the current activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextEntry {
    /// Raw model output of one turn.
    Response { text: String },
    /// Summarized RESULT from a child.
    ChildResult {
        child: PathBuf,
        outcome: Outcome,
        summary: String,
    },
    /// Outcome of a directive the coordinator executed on the node's behalf.
    Observation { text: String },
    /// A directive the coordinator refused to execute.
    Rejected { directive: String, reason: String },
    /// Text typed by the human operator.
    HumanReply { text: String },
}

impl ContextEntry {
    pub fn observation(text: impl Into<String>) -> Self {
        Self::Observation { text: text.into() }
    }

    pub fn rejected(directive: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            directive: directive.into(),
            reason: reason.into(),
        }
    }
}

/// Bounded, ordered buffer of context entries. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct ContextHistory {
    entries: VecDeque<ContextEntry>,
    capacity: usize,
}

impl ContextHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: ContextEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_display() {
        assert_eq!(AgentId(7).to_string(), "agent-7");
        assert_eq!(AgentId::CONTROLLER.to_string(), "controller");
    }

    #[test]
    fn test_capability_table() {
        assert!(AgentRole::Master.capabilities().can_delegate);
        assert!(AgentRole::Manager.capabilities().can_restructure);
        assert!(!AgentRole::Manager.capabilities().can_write_file);
        assert!(AgentRole::Coder.capabilities().can_write_file);
        assert!(!AgentRole::Coder.capabilities().can_delegate);
        assert!(AgentRole::Tester.capabilities().is_ephemeral);
        assert!(!AgentRole::Tester.capabilities().can_run_tests);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Inactive.can_transition_to(Active));
        assert!(Active.can_transition_to(Delegating));
        assert!(Delegating.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Active));
        assert!(Completed.can_transition_to(Inactive));

        assert!(!Inactive.can_transition_to(Completed));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Inactive));
    }

    #[test]
    fn test_context_history_evicts_oldest() {
        let mut history = ContextHistory::with_capacity(2);
        history.push(ContextEntry::observation("one"));
        history.push(ContextEntry::observation("two"));
        history.push(ContextEntry::observation("three"));

        let texts: Vec<_> = history
            .iter()
            .map(|e| match e {
                ContextEntry::Observation { text } => text.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn test_context_history_zero_capacity_clamped() {
        let mut history = ContextHistory::with_capacity(0);
        history.push(ContextEntry::observation("only"));
        assert_eq!(history.len(), 1);
    }
}
