// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent nodes of the hierarchy.
//!
//! An [`AgentNode`] is pure state: identity, role, the path it owns, its
//! lifecycle state and what it remembers for the current activation. It does
//! not talk to providers or the file system itself; the coordinator drives it
//! through the explicit transitions defined here.
//!
//! Forgetting is a transition: [`AgentNode::deactivate`] drops context history,
//! memory and the pending task, so the next activation always starts clean.

mod types;

pub use types::{
    AgentId, AgentRole, Capabilities, ContextEntry, ContextHistory, LifecycleState,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::message::TaskMessage;

/// A lifecycle contract violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{agent}: cannot {action} while {from}")]
    InvalidTransition {
        agent: AgentId,
        from: LifecycleState,
        action: String,
    },
}

/// Resolution status of a task a manager handed to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildTaskStatus {
    Issued,
    ResultReceived,
    TimedOut,
    Abandoned,
}

/// Bookkeeping for one task issued to a child and not yet resolved.
#[derive(Debug, Clone)]
pub struct OutstandingTask {
    pub task_id: Uuid,
    pub task_text: String,
    pub issued_at: Instant,
    pub status: ChildTaskStatus,
}

/// Observable view of a node, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub path: PathBuf,
    pub state: LifecycleState,
    pub last_result_summary: Option<String>,
}

/// A node of the agent tree.
#[derive(Debug)]
pub struct AgentNode {
    id: AgentId,
    role: AgentRole,
    scope_path: PathBuf,
    state: LifecycleState,
    pub(crate) parent: Option<AgentId>,
    pub(crate) children: Vec<AgentId>,
    memory: BTreeMap<String, PathBuf>,
    context: ContextHistory,
    pending_task: Option<TaskMessage>,
    briefing: Option<String>,
    pub(crate) outstanding: BTreeMap<AgentId, OutstandingTask>,
    last_result: Option<String>,
    activations: u32,
}

impl AgentNode {
    pub fn new(
        id: AgentId,
        role: AgentRole,
        scope_path: impl Into<PathBuf>,
        parent: Option<AgentId>,
        context_capacity: usize,
    ) -> Self {
        Self {
            id,
            role,
            scope_path: scope_path.into(),
            state: LifecycleState::Inactive,
            parent,
            children: Vec::new(),
            memory: BTreeMap::new(),
            context: ContextHistory::with_capacity(context_capacity),
            pending_task: None,
            briefing: None,
            outstanding: BTreeMap::new(),
            last_result: None,
            activations: 0,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn capabilities(&self) -> Capabilities {
        self.role.capabilities()
    }

    pub fn scope_path(&self) -> &Path {
        &self.scope_path
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn parent(&self) -> Option<AgentId> {
        self.parent
    }

    pub fn children(&self) -> &[AgentId] {
        &self.children
    }

    pub fn memory(&self) -> &BTreeMap<String, PathBuf> {
        &self.memory
    }

    pub fn context(&self) -> &ContextHistory {
        &self.context
    }

    pub fn pending_task(&self) -> Option<&TaskMessage> {
        self.pending_task.as_ref()
    }

    /// What the node saw of its scope when it was activated.
    pub fn briefing(&self) -> Option<&str> {
        self.briefing.as_deref()
    }

    pub fn outstanding(&self) -> &BTreeMap<AgentId, OutstandingTask> {
        &self.outstanding
    }

    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    pub fn activations(&self) -> u32 {
        self.activations
    }

    /// Start working on `task`.
    ///
    /// Only valid from `Inactive`. `memory` is the logical-name to path map the
    /// caller prepared for this role (own file for coders, directory listing
    /// for managers). The context history stays empty; the task itself is
    /// available through [`AgentNode::pending_task`].
    pub fn activate(
        &mut self,
        task: TaskMessage,
        memory: BTreeMap<String, PathBuf>,
    ) -> Result<(), LifecycleError> {
        self.ensure(LifecycleState::Active, "activate")?;
        self.pending_task = Some(task);
        self.memory = memory;
        self.activations += 1;
        self.state = LifecycleState::Active;
        Ok(())
    }

    /// Forget the finished activation and go back to `Inactive`.
    pub fn deactivate(&mut self) -> Result<(), LifecycleError> {
        self.ensure(LifecycleState::Inactive, "deactivate")?;
        self.context.clear();
        self.memory.clear();
        self.pending_task = None;
        self.briefing = None;
        self.state = LifecycleState::Inactive;
        Ok(())
    }

    /// Add an entry to the current activation's context.
    pub fn append_context(&mut self, entry: ContextEntry) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Active | LifecycleState::Delegating | LifecycleState::Waiting => {
                self.context.push(entry);
                Ok(())
            }
            from => Err(LifecycleError::InvalidTransition {
                agent: self.id,
                from,
                action: "append context".to_string(),
            }),
        }
    }

    /// Move to `next` if the transition table allows it.
    pub(crate) fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        self.ensure(next, &format!("become {next}"))?;
        if self.state == LifecycleState::Waiting
            && next == LifecycleState::Failed
            && !self.outstanding.is_empty()
        {
            return Err(LifecycleError::InvalidTransition {
                agent: self.id,
                from: self.state,
                action: "fail with outstanding child tasks".to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Attach the scope description loaded for this activation.
    pub(crate) fn set_briefing(&mut self, text: impl Into<String>) {
        self.briefing = Some(text.into());
    }

    /// Remember the summary of the RESULT this node produced.
    pub(crate) fn set_last_result(&mut self, summary: impl Into<String>) {
        self.last_result = Some(summary.into());
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.id,
            role: self.role,
            path: self.scope_path.clone(),
            state: self.state,
            last_result_summary: self.last_result.clone(),
        }
    }

    fn ensure(&self, next: LifecycleState, action: &str) -> Result<(), LifecycleError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                agent: self.id,
                from: self.state,
                action: action.to_string(),
            })
        }
    }
}
