// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! DELEGATION and RESULT messages exchanged between parents and children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;

/// Whether a child reports success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// A task handed down from a parent to one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub sender_id: AgentId,
    pub recipient_id: AgentId,
    pub task_text: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(sender: AgentId, recipient: AgentId, text: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            sender_id: sender,
            recipient_id: recipient,
            task_text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A child's answer to a [`TaskMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub task_id: Uuid,
    pub sender_id: AgentId,
    pub recipient_id: AgentId,
    pub result_text: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl ResultMessage {
    /// Build the reply to `task`, sent by its recipient back to its sender.
    pub fn reply_to(task: &TaskMessage, outcome: Outcome, text: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            sender_id: task.recipient_id,
            recipient_id: task.sender_id,
            result_text: text.into(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// A failure fabricated by the coordinator on the child's behalf
    /// (timeout, abandonment, undeliverable task).
    pub fn synthetic_failure(task: &TaskMessage, reason: impl Into<String>) -> Self {
        Self::reply_to(task, Outcome::Failure, reason)
    }

    /// One-line summary suitable for context history and snapshots.
    pub fn summary(&self, max_chars: usize) -> String {
        summarize(&self.result_text, max_chars)
    }
}

/// What travels on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Delegation(TaskMessage),
    Result(ResultMessage),
}

impl Envelope {
    pub fn sender(&self) -> AgentId {
        match self {
            Self::Delegation(t) => t.sender_id,
            Self::Result(r) => r.sender_id,
        }
    }

    pub fn recipient(&self) -> AgentId {
        match self {
            Self::Delegation(t) => t.recipient_id,
            Self::Result(r) => r.recipient_id,
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Delegation(t) => t.task_id,
            Self::Result(r) => r.task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delegation(_) => "delegation",
            Self::Result(_) => "result",
        }
    }
}

/// Collapse whitespace and cut `text` to at most `max_chars` characters.
pub fn summarize(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_swaps_endpoints() {
        let task = TaskMessage::new(AgentId(1), AgentId(2), "build it");
        let result = ResultMessage::reply_to(&task, Outcome::Success, "built");
        assert_eq!(result.task_id, task.task_id);
        assert_eq!(result.sender_id, AgentId(2));
        assert_eq!(result.recipient_id, AgentId(1));
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("  all\n good  ", 20), "all good");
        assert_eq!(summarize("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let task = TaskMessage::new(AgentId(1), AgentId(2), "x");
        let result = ResultMessage::synthetic_failure(&task, "timed out");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert!(json.get("resultText").is_some());
    }
}
