// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structural prompts.
//!
//! The prompt only tells an agent who it is, which directives it may use and
//! what happened so far in this activation. Wording is deliberately plain.

use std::fmt::Write as _;

use crate::agent::{AgentNode, AgentRole, ContextEntry};
use crate::providers::{PromptContext, PromptMessage};

/// Which stage of the project a turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// Master talks to the human; no delegation, no structure yet.
    Clarification,
    /// Master lays out files and directories directly; no delegation.
    Structure,
    /// Full hierarchy at work.
    Waves,
}

impl TurnMode {
    pub fn allows_delegation(self) -> bool {
        self == Self::Waves
    }
}

/// Build the provider input for `node`'s next turn.
pub fn build_prompt(node: &AgentNode, mode: TurnMode) -> PromptContext {
    let mut messages = Vec::with_capacity(node.context().len() + 2);
    if let Some(task) = node.pending_task() {
        messages.push(PromptMessage::user(format!("TASK: {}", task.task_text)));
    }
    if let Some(briefing) = node.briefing().filter(|b| !b.is_empty()) {
        messages.push(PromptMessage::user(briefing.to_string()));
    }
    messages.extend(node.context().iter().map(context_message));

    PromptContext {
        agent_id: node.id(),
        role: node.role(),
        scope_path: node.scope_path().to_path_buf(),
        system: system_text(node, mode),
        messages,
    }
}

fn context_message(entry: &ContextEntry) -> PromptMessage {
    match entry {
        ContextEntry::Response { text } => PromptMessage::assistant(text.clone()),
        ContextEntry::ChildResult {
            child,
            outcome,
            summary,
        } => PromptMessage::user(format!(
            "RESULT from {} ({}): {summary}",
            child.display(),
            outcome.name()
        )),
        ContextEntry::Observation { text } => PromptMessage::user(text.clone()),
        ContextEntry::Rejected { directive, reason } => {
            PromptMessage::user(format!("REJECTED {directive}: {reason}"))
        }
        ContextEntry::HumanReply { text } => PromptMessage::user(format!("HUMAN: {text}")),
    }
}

fn system_text(node: &AgentNode, mode: TurnMode) -> String {
    let scope = if node.scope_path().as_os_str().is_empty() {
        "the project root".to_string()
    } else {
        node.scope_path().display().to_string()
    };

    let mut out = match node.role() {
        AgentRole::Master => format!("You are the master agent and own {scope}.\n"),
        AgentRole::Manager => format!("You are the manager of directory {scope}.\n"),
        AgentRole::Coder => format!("You are the coder responsible for the file {scope}.\n"),
        AgentRole::Tester => format!("You run the tests for {scope}.\n"),
    };

    if mode == TurnMode::Clarification {
        out.push_str(
            "Ask the human one question at a time in plain text (no directives). \
             When the requirements are clear, reply with FINISH: <summary of the requirements>.\n",
        );
        return out;
    }

    out.push_str("Reply with directives, one per line. Other lines are ignored.\n");
    let caps = node.capabilities();
    if caps.can_restructure {
        out.push_str("CREATE <path> (trailing / for a directory)\nDELETE <path>\n");
        out.push_str("UPDATE_README <<< ... >>>\n");
    }
    out.push_str("READ <path>\n");
    if caps.can_delegate && mode.allows_delegation() {
        out.push_str("DELEGATE <child> [AFTER <sibling>]: <task>\nWAIT\n");
    }
    if caps.can_write_file {
        out.push_str("CHANGE <path> <<< new content >>>\n");
    }
    if caps.can_run_tests {
        out.push_str("RUN <scope hint>\n");
    }
    out.push_str("FINISH [SUCCESS|FAILURE][: summary]\n");

    if !node.memory().is_empty() {
        out.push_str("Known paths:\n");
        for (name, path) in node.memory() {
            let _ = writeln!(out, "- {name}: {}", path.display());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use crate::message::{Outcome, TaskMessage};
    use crate::providers::PromptRole;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[test]
    fn test_manager_prompt_maps_context() {
        let mut node = AgentNode::new(AgentId(2), AgentRole::Manager, "src", Some(AgentId(1)), 16);
        let mut memory = BTreeMap::new();
        memory.insert("calc.py".to_string(), PathBuf::from("src/calc.py"));
        node.activate(TaskMessage::new(AgentId(1), AgentId(2), "build calc"), memory)
            .unwrap();
        node.append_context(ContextEntry::Response {
            text: "DELEGATE calc.py: write it".to_string(),
        })
        .unwrap();
        node.append_context(ContextEntry::ChildResult {
            child: PathBuf::from("src/calc.py"),
            outcome: Outcome::Success,
            summary: "done".to_string(),
        })
        .unwrap();

        let prompt = build_prompt(&node, TurnMode::Waves);
        assert_eq!(prompt.messages.len(), 3);
        assert_eq!(prompt.messages[0].content, "TASK: build calc");
        assert_eq!(prompt.messages[1].role, PromptRole::Assistant);
        assert_eq!(prompt.last_user_message(), Some("RESULT from src/calc.py (SUCCESS): done"));
        assert!(prompt.system.contains("DELEGATE"));
        assert!(prompt.system.contains("- calc.py: src/calc.py"));
        assert!(!prompt.system.contains("CHANGE"));
    }

    #[test]
    fn test_structure_mode_hides_delegation() {
        let node = AgentNode::new(AgentId(1), AgentRole::Master, "", None, 16);
        let prompt = build_prompt(&node, TurnMode::Structure);
        assert!(prompt.system.contains("project root"));
        assert!(prompt.system.contains("CREATE"));
        assert!(!prompt.system.contains("DELEGATE"));
    }

    #[test]
    fn test_coder_prompt() {
        let mut node = AgentNode::new(AgentId(3), AgentRole::Coder, "src/calc.py", Some(AgentId(2)), 16);
        node.activate(TaskMessage::new(AgentId(2), AgentId(3), "add add()"), BTreeMap::new())
            .unwrap();
        node.set_briefing("Current content of src/calc.py:\nA = 1");

        let prompt = build_prompt(&node, TurnMode::Waves);
        assert!(node.context().is_empty());
        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].content, "TASK: add add()");
        assert!(prompt.messages[1].content.ends_with("A = 1"));
        assert!(prompt.system.contains("CHANGE"));
        assert!(!prompt.system.contains("CREATE"));
    }
}
