// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Codetree - a tree of agents that mirrors a project's file layout.
//!
//! Every directory is owned by a manager agent, every file by a coder agent,
//! and the project root by a master. Agents talk only to their parent and
//! children through typed task and result messages; an external controller
//! drives the whole tree through Spec, Test and Impl waves until the tests
//! pass.
//!
//! # Architecture
//!
//! - [`agent`] - Node identity, roles, lifecycle state machine and context history
//! - [`tree`] - Path-indexed arena of nodes, including ephemeral testers
//! - [`message`] / [`bus`] - Task and result envelopes and their FIFO queue
//! - [`directive`] - Parsing of model replies into structured directives
//! - [`coordinator`] - Applies deliveries, turns and directives to the tree
//! - [`engine`] - Async loop running concurrent agent turns
//! - [`wave`] - Phase controller with exit criteria and convergence limits
//! - [`orchestrator`] - Project lifecycle from clarification to convergence
//! - [`providers`] - Completion providers (OpenAI-compatible, scripted)
//! - [`workspace`] / [`tester`] - File system and test runner seams
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing, metrics, and observability infrastructure
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use codetree::config::{load_config, CliOptions};
//! use codetree::coordinator::Services;
//! use codetree::orchestrator::Orchestrator;
//! use codetree::providers::create_provider;
//! use codetree::tester::CommandTester;
//! use codetree::workspace::LocalFileSystem;
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let services = Services::new(
//!     create_provider(&config)?,
//!     Arc::new(LocalFileSystem::new(".")),
//!     Arc::new(CommandTester::new(config.testing.command.clone(), ".")),
//! );
//! let mut orchestrator = Orchestrator::create_project(".", services, config);
//! let report = orchestrator.run_to_completion("a calculator package").await?;
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod directive;
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod telemetry;
pub mod tester;
pub mod tree;
pub mod wave;
pub mod workspace;

// Re-export commonly used types at crate root
pub use agent::{AgentId, AgentRole, AgentSnapshot, LifecycleState};
pub use coordinator::{Coordinator, Services};
pub use directive::{Directive, DirectiveInterpreter, LineInterpreter};
pub use engine::{Engine, EngineError, RunOutcome};
pub use error::{ConfigError, FsError, ParseError, ProviderError, Result, TesterError};
pub use events::{ProjectPhase, TreeEvent, WavePhase};
pub use message::{Outcome, ResultMessage, TaskMessage};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle};
pub use providers::{create_provider, CompletionProvider, ProviderType, ScriptedProvider};
pub use tester::{CommandTester, TesterAgentRunner, TesterReport};
pub use tree::AgentTree;
pub use wave::{WaveController, WaveError, WaveReport};
pub use workspace::{FileSystem, LocalFileSystem, MemoryFileSystem};

/// Codetree version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let tree = AgentTree::new(8);
        assert_eq!(tree.len(), 1);
        assert_eq!(Outcome::Success.name(), "SUCCESS");
        assert_eq!(ProjectPhase::Wave(WavePhase::Impl).to_string(), "wave:impl");
    }
}
