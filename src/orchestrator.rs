// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Top-level project runner.
//!
//! [`Orchestrator::run_to_completion`] takes a project brief through three
//! phases:
//!
//! 1. **Clarification**: the master asks the human questions (no delegation)
//!    and finishes with a requirements summary.
//! 2. **Structure**: the master creates directories and files directly; the
//!    agent tree is then populated from the file system.
//! 3. **Waves**: [`WaveController`] until convergence or the wave cap.
//!
//! Human replies and cancellation reach a running orchestrator through a
//! cloneable [`OrchestratorHandle`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{info, instrument, warn};

use crate::agent::AgentSnapshot;
use crate::config::ResolvedConfig;
use crate::coordinator::{Coordinator, CoordinatorError, Services};
use crate::engine::{Engine, EngineError, RunOutcome};
use crate::events::{self, ProjectPhase, TreeEvent, WavePhase};
use crate::prompt::TurnMode;
use crate::providers::RetryPolicy;
use crate::tree::{AgentTree, TreeError};
use crate::wave::{GuidanceSource, WaveController, WaveError, WaveReport};

/// Reply sent for the master once the clarification rounds are used up.
const CLARIFICATION_CUTOFF: &str =
    "No more questions. Reply now with FINISH: followed by the requirements as you understand them.";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Wave(WaveError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => Self::Cancelled,
            other => Self::Engine(other),
        }
    }
}

impl From<WaveError> for OrchestratorError {
    fn from(err: WaveError) -> Self {
        match err {
            WaveError::Engine(EngineError::Cancelled) => Self::Cancelled,
            other => Self::Wave(other),
        }
    }
}

/// Cloneable control surface of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    replies: mpsc::UnboundedSender<String>,
    cancel: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<TreeEvent>,
}

impl OrchestratorHandle {
    /// Queue a human reply. Returns false once the orchestrator is gone.
    pub fn submit_human_reply(&self, text: impl Into<String>) -> bool {
        self.replies.send(text.into()).is_ok()
    }

    /// Ask the run to stop; outstanding work is abandoned.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }
}

/// Human replies shared by the clarification loop and the wave controller.
struct HumanChannel {
    replies: Mutex<mpsc::UnboundedReceiver<String>>,
    cancel: watch::Receiver<bool>,
}

impl HumanChannel {
    /// Next reply, or `None` when cancelled first.
    async fn next_reply(&self) -> Option<String> {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow_and_update() {
            return None;
        }
        let mut replies = self.replies.lock().await;
        tokio::select! {
            reply = replies.recv() => reply,
            _ = cancel.wait_for(|cancelled| *cancelled) => None,
        }
    }
}

#[async_trait]
impl GuidanceSource for HumanChannel {
    async fn guidance(&self, _diagnostics: &str) -> Option<String> {
        self.next_reply().await
    }
}

pub struct Orchestrator {
    root_path: PathBuf,
    config: ResolvedConfig,
    engine: Engine,
    human: Arc<HumanChannel>,
    handle: OrchestratorHandle,
    phase: ProjectPhase,
}

impl Orchestrator {
    /// Set up an orchestrator for the project at `root_path`.
    ///
    /// The tree starts with only an inactive master owning the project root.
    pub fn create_project(root_path: impl Into<PathBuf>, services: Services, config: ResolvedConfig) -> Self {
        let events = events::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let tree = AgentTree::new(config.agents.max_context_entries);
        let coordinator = Coordinator::new(tree, services, config.agents.clone(), events.clone());
        let engine = Engine::new(coordinator, RetryPolicy::from_config(&config.retry), cancel_rx.clone());

        Self {
            root_path: root_path.into(),
            config,
            engine,
            human: Arc::new(HumanChannel {
                replies: Mutex::new(reply_rx),
                cancel: cancel_rx,
            }),
            handle: OrchestratorHandle {
                replies: reply_tx,
                cancel: Arc::new(cancel_tx),
                events,
            },
            phase: ProjectPhase::Clarification,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    pub fn phase(&self) -> ProjectPhase {
        self.phase
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.handle.subscribe()
    }

    pub fn submit_human_reply(&self, text: impl Into<String>) -> bool {
        self.handle.submit_human_reply(text)
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Current state of every node, depth first.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.engine.coordinator().snapshot()
    }

    /// Take `brief` from clarification through structure to converged waves.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, brief), fields(root = %self.root_path.display())))]
    pub async fn run_to_completion(&mut self, brief: &str) -> Result<WaveReport, OrchestratorError> {
        let outcome = self.run_phases(brief).await;
        match &outcome {
            Ok(report) => info!(waves = report.waves, "Project complete"),
            Err(OrchestratorError::Cancelled) => {
                let coordinator = self.engine.coordinator_mut();
                coordinator.abandon_all("run cancelled");
                coordinator.force_idle();
                self.set_phase(ProjectPhase::Failed);
            }
            Err(OrchestratorError::Wave(WaveError::ConvergenceFailure { .. })) => {
                self.phase = ProjectPhase::Failed;
            }
            Err(err) => {
                warn!(error = %err, "Project failed");
                self.set_phase(ProjectPhase::Failed);
            }
        }
        outcome
    }

    async fn run_phases(&mut self, brief: &str) -> Result<WaveReport, OrchestratorError> {
        let requirements = if self.config.phases.skip_clarification {
            brief.to_string()
        } else {
            self.clarify(brief).await?
        };

        self.structure(&requirements).await?;

        // The wave controller publishes its own phase changes.
        self.phase = ProjectPhase::Wave(WavePhase::Spec);
        self.engine.coordinator_mut().set_mode(TurnMode::Waves);
        let controller = WaveController::new(self.config.waves.clone())?.with_guidance(self.human.clone());
        let report = controller.run(&mut self.engine, &requirements).await?;
        self.phase = ProjectPhase::Converged;
        Ok(report)
    }

    /// Phase 1: question rounds between the master and the human.
    async fn clarify(&mut self, brief: &str) -> Result<String, OrchestratorError> {
        self.set_phase(ProjectPhase::Clarification);
        self.engine.coordinator_mut().set_mode(TurnMode::Clarification);

        let task = self.engine.dispatch(format!(
            "Project brief: {brief}\nAsk whatever you need to know before the project is laid out."
        ))?;
        let mut rounds = 0;
        loop {
            match self.engine.run_until_result(task.task_id).await? {
                RunOutcome::Result(result) => {
                    if !result.outcome.is_success() {
                        warn!(reason = %result.result_text, "Clarification ended without requirements");
                    }
                    let summary = result.result_text.trim();
                    if summary.is_empty() {
                        return Ok(brief.to_string());
                    }
                    return Ok(format!("{brief}\n\nRequirements:\n{summary}"));
                }
                RunOutcome::NeedsHuman { question, .. } => {
                    rounds += 1;
                    let reply = if rounds > self.config.phases.max_clarification_rounds {
                        info!(rounds, "Clarification rounds used up");
                        CLARIFICATION_CUTOFF.to_string()
                    } else {
                        info!(question = %question, "Waiting for the human");
                        self.human.next_reply().await.ok_or(OrchestratorError::Cancelled)?
                    };
                    self.engine.coordinator_mut().submit_human_reply(reply);
                }
            }
        }
    }

    /// Phase 2: the master lays out the project, then the tree mirrors it.
    async fn structure(&mut self, requirements: &str) -> Result<(), OrchestratorError> {
        self.set_phase(ProjectPhase::Structure);
        self.engine.coordinator_mut().set_mode(TurnMode::Structure);

        let task = self.engine.dispatch(format!(
            "Requirements:\n{requirements}\nCreate the directories and source files of the project. \
             Test files come later."
        ))?;
        loop {
            match self.engine.run_until_result(task.task_id).await? {
                RunOutcome::Result(result) => {
                    if !result.outcome.is_success() {
                        warn!(reason = %result.result_text, "Structure phase reported failure");
                    }
                    break;
                }
                RunOutcome::NeedsHuman { .. } => {
                    let reply = self.human.next_reply().await.ok_or(OrchestratorError::Cancelled)?;
                    self.engine.coordinator_mut().submit_human_reply(reply);
                }
            }
        }

        let fs = Arc::clone(&self.engine.coordinator().services().fs);
        let created = self
            .engine
            .coordinator_mut()
            .tree_mut()
            .populate_from_fs(fs.as_ref())
            .await?;
        info!(created, nodes = self.engine.coordinator().tree().len(), "Tree populated");
        Ok(())
    }

    fn set_phase(&mut self, phase: ProjectPhase) {
        self.phase = phase;
        events::publish(&self.handle.events, TreeEvent::PhaseChanged { phase });
    }
}
