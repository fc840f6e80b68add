// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delegation and lifecycle coordination.
//!
//! The [`Coordinator`] is the single writer of the agent tree. It activates
//! nodes when a DELEGATION arrives, executes the directives their turns
//! produce, keeps each manager's outstanding child tasks, and sends RESULTs
//! back up when a node finishes.
//!
//! It never calls the provider itself. Turns are handed to the engine as
//! [`TurnRequest`]s and come back as [`TurnOutcome`]s, so sibling turns run
//! concurrently while every state change happens here, in arrival order.
//!
//! # Wait modes
//!
//! After a manager delegates, what happens when a RESULT arrives depends on
//! how its turn ended:
//!
//! | Turn ended with            | On each RESULT                                  |
//! |----------------------------|-------------------------------------------------|
//! | nothing (reactive)         | schedule a turn (re-tasking path)               |
//! | `WAIT` mid-stream          | resume the remaining directives                 |
//! | `WAIT` last (barrier)      | once nothing is outstanding, schedule a turn    |
//! | `FINISH` with open tasks   | once nothing is outstanding, complete           |

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{
    AgentId, AgentRole, AgentSnapshot, ChildTaskStatus, ContextEntry, LifecycleError,
    LifecycleState, OutstandingTask,
};
use crate::bus::{BusError, MessageBus};
use crate::config::AgentsConfig;
use crate::directive::{DelegationRequest, Directive, DirectiveInterpreter, LineInterpreter};
use crate::error::{FsError, ParseError, ProviderError};
use crate::events::{self, TreeEvent};
use crate::message::{summarize, Envelope, Outcome, ResultMessage, TaskMessage};
use crate::prompt::{build_prompt, TurnMode};
use crate::providers::{BoxedProvider, PromptContext};
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;
use crate::tester::{truncate_output, TesterAgentRunner, TesterReport};
use crate::tree::{AgentTree, TreeError, README_FILE};
use crate::workspace::{FileKind, FileSystem};

/// Lines of tester output kept in an agent's context.
const RUN_OUTPUT_LINES: usize = 40;

// ============================================================================
// Collaborators
// ============================================================================

/// External collaborators the coordinator and engine work through.
#[derive(Clone)]
pub struct Services {
    pub provider: BoxedProvider,
    pub interpreter: Arc<dyn DirectiveInterpreter>,
    pub fs: Arc<dyn FileSystem>,
    pub tester: Arc<dyn TesterAgentRunner>,
}

impl Services {
    /// Services using the default line interpreter.
    pub fn new(
        provider: BoxedProvider,
        fs: Arc<dyn FileSystem>,
        tester: Arc<dyn TesterAgentRunner>,
    ) -> Self {
        Self {
            provider,
            interpreter: Arc::new(LineInterpreter::new()),
            fs,
            tester,
        }
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn DirectiveInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Errors and turn plumbing
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("{agent} is a {role} and cannot delegate")]
    CannotDelegate { agent: AgentId, role: AgentRole },

    #[error("delegation is disabled during {0:?}")]
    DelegationDisabled(TurnMode),

    #[error("{manager} has no outstanding task for {child}")]
    NoOutstandingTask { manager: AgentId, child: AgentId },

    #[error("{manager} still has {outstanding} child tasks outstanding")]
    ChildrenOutstanding { manager: AgentId, outstanding: usize },
}

/// Why a turn produced no usable directives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("could not parse directives: {0}")]
    Parse(#[from] ParseError),
}

/// A turn the engine should run.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub agent: AgentId,
    pub prompt: PromptContext,
}

/// What came back from a turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub agent: AgentId,
    /// Raw model output, when the provider answered.
    pub response: Option<String>,
    pub result: Result<Vec<Directive>, TurnError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum WaitMode {
    #[default]
    Reactive,
    Suspended,
    Barrier,
    Finishing,
}

/// A DELEGATE held back until its child (or its AFTER sibling) is free.
#[derive(Debug, Clone)]
struct DeferredTask {
    child: AgentId,
    path: PathBuf,
    task: String,
    after: Option<AgentId>,
}

/// Per-activation scheduling state of one node.
#[derive(Debug, Default)]
struct Agenda {
    directives: VecDeque<Directive>,
    wait: WaitMode,
    deferred: VecDeque<DeferredTask>,
    finish: Option<(Outcome, String)>,
    turns_taken: u32,
    /// Results that arrived while a turn was in flight.
    unseen_results: u32,
    turn_in_flight: bool,
    turn_requested: bool,
    awaiting_human: bool,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Single writer of the tree and the bus.
pub struct Coordinator {
    tree: AgentTree,
    bus: MessageBus,
    agendas: HashMap<AgentId, Agenda>,
    services: Services,
    config: AgentsConfig,
    mode: TurnMode,
    events: broadcast::Sender<TreeEvent>,
    controller_inbox: VecDeque<ResultMessage>,
    human_question: Option<(AgentId, String)>,
}

impl Coordinator {
    pub fn new(
        tree: AgentTree,
        services: Services,
        config: AgentsConfig,
        events: broadcast::Sender<TreeEvent>,
    ) -> Self {
        let mut bus = MessageBus::new();
        bus.register(AgentId::CONTROLLER);
        for id in tree.ids() {
            bus.register(id);
        }

        Self {
            tree,
            bus,
            agendas: HashMap::new(),
            services,
            config,
            mode: TurnMode::Waves,
            events,
            controller_inbox: VecDeque::new(),
            human_question: None,
        }
    }

    pub fn tree(&self) -> &AgentTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut AgentTree {
        &mut self.tree
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &AgentsConfig {
        &self.config
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TurnMode) {
        self.mode = mode;
    }

    pub fn events(&self) -> &broadcast::Sender<TreeEvent> {
        &self.events
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.tree.snapshot()
    }

    // ------------------------------------------------------------------------
    // Controller endpoint
    // ------------------------------------------------------------------------

    /// Queue a task from the controller to the root agent.
    pub fn dispatch_root_task(
        &mut self,
        text: impl Into<String>,
    ) -> Result<TaskMessage, CoordinatorError> {
        let root = self.tree.root();
        let task = TaskMessage::new(AgentId::CONTROLLER, root, text);
        self.bus.register(root);
        self.bus.send(Envelope::Delegation(task.clone()))?;
        Ok(task)
    }

    /// Take the root's RESULT for `task_id`, discarding stale ones.
    pub fn take_controller_result(&mut self, task_id: uuid::Uuid) -> Option<ResultMessage> {
        while let Some(result) = self.controller_inbox.pop_front() {
            if result.task_id == task_id {
                return Some(result);
            }
            warn!(task_id = %result.task_id, "Discarding stale root result");
        }
        None
    }

    /// Question the master parked on, if any.
    pub fn take_human_question(&mut self) -> Option<(AgentId, String)> {
        self.human_question.take()
    }

    /// Hand a human reply to the agent waiting for one.
    ///
    /// Returns false when nobody is waiting.
    pub fn submit_human_reply(&mut self, text: impl Into<String>) -> bool {
        let Some(id) = self
            .agendas
            .iter()
            .find(|(_, agenda)| agenda.awaiting_human)
            .map(|(id, _)| *id)
        else {
            return false;
        };

        self.agenda(id).awaiting_human = false;
        self.append(id, ContextEntry::HumanReply { text: text.into() });
        self.request_turn(id);
        true
    }

    /// Whether deliveries or turns are waiting to be processed.
    pub fn has_pending_work(&self) -> bool {
        !self.bus.is_idle()
            || self
                .agendas
                .values()
                .any(|agenda| agenda.turn_requested && !agenda.awaiting_human)
    }

    pub fn next_delivery(&mut self) -> Option<Envelope> {
        self.bus.next_delivery()
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Process one envelope taken from the bus.
    pub async fn deliver(&mut self, envelope: Envelope) {
        debug!(
            kind = envelope.kind(),
            sender = %envelope.sender(),
            recipient = %envelope.recipient(),
            "Delivering envelope"
        );
        match envelope {
            Envelope::Delegation(task) => self.on_delegation(task).await,
            Envelope::Result(result) if result.recipient_id.is_controller() => {
                self.controller_inbox.push_back(result);
            }
            Envelope::Result(result) => self.on_result(result).await,
        }
    }

    async fn on_delegation(&mut self, task: TaskMessage) {
        let id = task.recipient_id;
        let (role, scope) = match self.tree.get(id) {
            Some(node) if node.state() == LifecycleState::Inactive => {
                (node.role(), node.scope_path().to_path_buf())
            }
            Some(node) => {
                let reason = format!("{id} is {}", node.state());
                self.send_synthetic(&task, reason);
                return;
            }
            None => {
                self.send_synthetic(&task, format!("{id} no longer exists"));
                return;
            }
        };

        let (memory, observation) = self.load_memory(role, &scope).await;
        let activated = self
            .tree
            .node_mut(id)
            .map_err(CoordinatorError::from)
            .and_then(|node| node.activate(task.clone(), memory).map_err(Into::into));
        if let Err(err) = activated {
            self.send_synthetic(&task, err.to_string());
            return;
        }

        if let Some(node) = self.tree.get_mut(id) {
            node.set_briefing(observation);
        }
        self.agendas.insert(id, Agenda::default());
        info!(agent = %id, role = %role, scope = %scope.display(), "Agent activated");
        self.emit(id);
        self.request_turn(id);
    }

    /// Memory for a fresh activation, plus a briefing describing the scope.
    async fn load_memory(
        &self,
        role: AgentRole,
        scope: &Path,
    ) -> (BTreeMap<String, PathBuf>, String) {
        let mut memory = BTreeMap::new();
        match role {
            AgentRole::Coder => {
                memory.insert("self".to_string(), scope.to_path_buf());
                let observation = match self.services.fs.read(scope).await {
                    Ok(content) if content.is_empty() => format!("{} is empty.", scope.display()),
                    Ok(content) => format!("Current content of {}:\n{content}", scope.display()),
                    Err(FsError::NotFound(_)) => format!("{} does not exist yet.", scope.display()),
                    Err(err) => format!("Could not read {}: {err}", scope.display()),
                };
                (memory, observation)
            }
            AgentRole::Master | AgentRole::Manager => {
                let listing = match self.services.fs.list(scope).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        return (memory, format!("Could not list {}: {err}", display_scope(scope)));
                    }
                };
                let mut names = Vec::new();
                for entry in listing {
                    if crate::workspace::is_hidden(&entry.path) {
                        continue;
                    }
                    let mut name = entry.name();
                    if entry.kind == FileKind::Directory {
                        name.push('/');
                    }
                    memory.insert(name.clone(), entry.path);
                    names.push(name);
                }
                let observation = if names.is_empty() {
                    format!("{} is empty.", display_scope(scope))
                } else {
                    format!("Contents of {}: {}", display_scope(scope), names.join(", "))
                };
                (memory, observation)
            }
            AgentRole::Tester => (memory, String::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------------

    /// Collect the turns that can start now.
    ///
    /// A node past its turn budget is failed instead of scheduled.
    pub fn take_ready(&mut self) -> Vec<TurnRequest> {
        let mut ready: Vec<AgentId> = self
            .agendas
            .iter()
            .filter(|(_, a)| a.turn_requested && !a.turn_in_flight && !a.awaiting_human)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let limit = self.config.max_turns_per_activation;
        let mut requests = Vec::with_capacity(ready.len());
        for id in ready {
            let runnable = self
                .tree
                .get(id)
                .map(|n| matches!(n.state(), LifecycleState::Active | LifecycleState::Waiting))
                .unwrap_or(false);
            let agenda = self.agenda(id);
            agenda.turn_requested = false;
            if !runnable {
                continue;
            }
            if agenda.turns_taken >= limit {
                warn!(agent = %id, limit, "Turn budget exhausted");
                self.fail_activation(id, format!("turn budget of {limit} exhausted"));
                continue;
            }
            agenda.turns_taken += 1;
            agenda.turn_in_flight = true;
            if agenda.unseen_results > 0 {
                debug!(agent = %id, results = agenda.unseen_results, "Results arrived during the previous turn");
                agenda.unseen_results = 0;
            }

            if let Some(node) = self.tree.get(id) {
                requests.push(TurnRequest {
                    agent: id,
                    prompt: build_prompt(node, self.mode),
                });
            }
        }
        requests
    }

    /// Apply what a turn produced.
    pub async fn on_turn_complete(&mut self, outcome: TurnOutcome) {
        let id = outcome.agent;
        if let Some(agenda) = self.agendas.get_mut(&id) {
            agenda.turn_in_flight = false;
        }
        let runnable = self
            .tree
            .get(id)
            .map(|n| matches!(n.state(), LifecycleState::Active | LifecycleState::Waiting))
            .unwrap_or(false);
        if !runnable {
            debug!(agent = %id, "Discarding turn of an idle agent");
            return;
        }

        if let Some(text) = &outcome.response {
            self.append(id, ContextEntry::Response { text: text.clone() });
        }

        match outcome.result {
            Err(err) => {
                warn!(agent = %id, error = %err, "Turn failed");
                self.fail_activation(id, err.to_string());
            }
            Ok(directives) if directives.is_empty() => {
                self.on_empty_reply(id, outcome.response.unwrap_or_default());
            }
            Ok(directives) => {
                debug!(agent = %id, count = directives.len(), "Running directives");
                self.agenda(id).directives = directives.into();
                self.run_agenda(id).await;
            }
        }
    }

    /// Fail the activation once its children have reported back.
    ///
    /// Tasks still deferred are dropped, tasks already running are awaited.
    fn fail_activation(&mut self, id: AgentId, summary: String) {
        let outstanding = self
            .tree
            .get(id)
            .map(|n| n.outstanding().len())
            .unwrap_or(0);
        if outstanding == 0 {
            self.complete_node(id, Outcome::Failure, summary);
            return;
        }
        debug!(agent = %id, outstanding, "Failure held until children report");
        let agenda = self.agenda(id);
        agenda.directives.clear();
        agenda.deferred.clear();
        agenda.finish = Some((Outcome::Failure, summary));
        agenda.wait = WaitMode::Finishing;
        agenda.turn_requested = false;
    }

    fn on_empty_reply(&mut self, id: AgentId, text: String) {
        let is_master = self.tree.get(id).map(|n| n.role()) == Some(AgentRole::Master);
        if self.mode == TurnMode::Clarification && is_master {
            let question = text.trim().to_string();
            self.agenda(id).awaiting_human = true;
            self.human_question = Some((id, question.clone()));
            events::publish(&self.events, TreeEvent::HumanPromptRequested { agent: id, question });
            return;
        }

        self.append(
            id,
            ContextEntry::observation("No directives found. Reply with directives and end with FINISH."),
        );
        if !self.has_open_children(id) {
            self.request_turn(id);
        }
    }

    /// Execute queued directives until they run out or a WAIT / FINISH stops them.
    async fn run_agenda(&mut self, id: AgentId) {
        while let Some(directive) = self.agendas.get_mut(&id).and_then(|a| a.directives.pop_front()) {
            let label = directive.describe();
            match directive {
                Directive::Delegate(first) => {
                    let mut batch = vec![first];
                    while matches!(self.agenda(id).directives.front(), Some(Directive::Delegate(_))) {
                        if let Some(Directive::Delegate(next)) = self.agenda(id).directives.pop_front() {
                            batch.push(next);
                        }
                    }
                    if let Err(err) = self.delegate_many(id, batch).await {
                        self.reject(id, &label, err.to_string());
                    }
                }
                Directive::Wait => {
                    if !self.has_open_children(id) {
                        debug!(agent = %id, "WAIT with nothing outstanding");
                        continue;
                    }
                    let agenda = self.agenda(id);
                    agenda.wait = if agenda.directives.is_empty() {
                        WaitMode::Barrier
                    } else {
                        WaitMode::Suspended
                    };
                    agenda.turn_requested = false;
                    return;
                }
                Directive::Finish { outcome, summary } => {
                    let agenda = self.agenda(id);
                    if !agenda.directives.is_empty() {
                        debug!(agent = %id, dropped = agenda.directives.len(), "Directives after FINISH ignored");
                        agenda.directives.clear();
                    }
                    if self.has_open_children(id) {
                        let agenda = self.agenda(id);
                        agenda.finish = Some((outcome, summary));
                        agenda.wait = WaitMode::Finishing;
                        agenda.turn_requested = false;
                    } else {
                        self.complete_node(id, outcome, summary);
                    }
                    return;
                }
                Directive::Create { path, is_dir } => self.create_path(id, &label, &path, is_dir).await,
                Directive::Delete { path } => self.delete_path(id, &label, &path).await,
                Directive::Read { path } => self.read_path(id, &path).await,
                Directive::Run { scope_hint } => self.run_directive(id, &label, &scope_hint).await,
                Directive::Change { path, content } => self.change_file(id, &label, &path, &content).await,
                Directive::UpdateReadme { content } => self.update_readme(id, &label, &content).await,
            }
        }

        if self.has_open_children(id) {
            self.agenda(id).wait = WaitMode::Reactive;
        } else {
            self.request_turn(id);
        }
    }

    // ------------------------------------------------------------------------
    // Structural and file directives
    // ------------------------------------------------------------------------

    async fn create_path(&mut self, id: AgentId, label: &str, path: &Path, is_dir: bool) {
        let Some(target) = self.structural_target(id, label, path) else {
            return;
        };

        let kind = if is_dir { FileKind::Directory } else { FileKind::File };
        if let Err(err) = self.services.fs.create(&target, kind).await {
            self.reject(id, label, err.to_string());
            return;
        }

        let is_readme = kind == FileKind::File
            && target.file_name().map(|n| n == README_FILE).unwrap_or(false);
        if !is_readme {
            if let Err(err) = self.tree.ensure_node(&target, kind) {
                warn!(path = %target.display(), error = %err, "Created path has no owner");
            }
        }
        self.append(id, ContextEntry::observation(format!("Created {}", target.display())));
    }

    async fn delete_path(&mut self, id: AgentId, label: &str, path: &Path) {
        let Some(target) = self.structural_target(id, label, path) else {
            return;
        };

        if let Err(err) = self.services.fs.delete(&target).await {
            self.reject(id, label, err.to_string());
            return;
        }

        if let Some(owner) = self.tree.by_path(&target) {
            match self.tree.remove_subtree(owner) {
                Ok(removed) => {
                    for gone in removed {
                        self.agendas.remove(&gone);
                        for envelope in self.bus.unregister(gone) {
                            match envelope {
                                Envelope::Delegation(task) => {
                                    self.send_synthetic(&task, format!("{} was deleted", target.display()));
                                }
                                Envelope::Result(result) => {
                                    warn!(task_id = %result.task_id, "Dropping result addressed to a deleted agent");
                                }
                            }
                        }
                    }
                }
                Err(err) => warn!(path = %target.display(), error = %err, "Could not remove subtree"),
            }
        }
        self.append(id, ContextEntry::observation(format!("Deleted {}", target.display())));
    }

    /// Resolve a CREATE/DELETE target, rejecting it when not allowed.
    fn structural_target(&mut self, id: AgentId, label: &str, path: &Path) -> Option<PathBuf> {
        let node = self.tree.get(id)?;
        if !node.capabilities().can_restructure {
            let reason = format!("a {} cannot change the structure", node.role());
            self.reject(id, label, reason);
            return None;
        }
        let scope = node.scope_path().to_path_buf();
        let Some(target) = resolve_in_scope(&scope, path) else {
            self.reject(id, label, format!("outside of {}", display_scope(&scope)));
            return None;
        };
        if self.path_reserved(&target) {
            self.reject(id, label, "path is owned by an agent that is still working");
            return None;
        }
        Some(target)
    }

    /// A path is reserved while any node at or below it is working or has
    /// a task on its way to it.
    fn path_reserved(&self, path: &Path) -> bool {
        if self.tree.scope_busy(path) {
            return true;
        }
        self.tree
            .ids()
            .filter_map(|id| self.tree.get(id))
            .flat_map(|node| node.outstanding().keys())
            .filter_map(|child| self.tree.get(*child))
            .any(|child| child.scope_path().starts_with(path))
    }

    async fn read_path(&mut self, id: AgentId, path: &Path) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        let base = if node.role() == AgentRole::Coder {
            node.scope_path().parent().unwrap_or(Path::new("")).to_path_buf()
        } else {
            node.scope_path().to_path_buf()
        };
        let mut candidates = vec![path.to_path_buf()];
        let joined = base.join(path);
        if joined != path {
            candidates.push(joined);
        }

        let fs = Arc::clone(&self.services.fs);
        for candidate in candidates {
            match fs.kind(&candidate).await {
                Ok(Some(FileKind::File)) => {
                    let text = match fs.read(&candidate).await {
                        Ok(content) => format!("READ {}:\n{content}", candidate.display()),
                        Err(err) => format!("READ {}: {err}", candidate.display()),
                    };
                    self.append(id, ContextEntry::observation(text));
                    return;
                }
                Ok(Some(FileKind::Directory)) => {
                    let text = match fs.list(&candidate).await {
                        Ok(entries) => {
                            let names: Vec<String> = entries.iter().map(|e| e.name()).collect();
                            format!("READ {}: directory containing {}", candidate.display(), names.join(", "))
                        }
                        Err(err) => format!("READ {}: {err}", candidate.display()),
                    };
                    self.append(id, ContextEntry::observation(text));
                    return;
                }
                Ok(None) | Err(_) => {}
            }
        }
        self.append(id, ContextEntry::observation(format!("READ {}: not found", path.display())));
    }

    async fn change_file(&mut self, id: AgentId, label: &str, path: &Path, content: &str) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if !node.capabilities().can_write_file {
            let reason = format!("a {} never writes file content", node.role());
            self.reject(id, label, reason);
            return;
        }
        let scope = node.scope_path().to_path_buf();
        let sibling = scope.parent().map(|dir| dir.join(path));
        if path != scope && sibling.as_deref() != Some(scope.as_path()) {
            self.reject(id, label, format!("only {} may be changed", scope.display()));
            return;
        }

        match self.services.fs.write(&scope, content).await {
            Ok(()) => {
                let text = format!("Wrote {} bytes to {}", content.len(), scope.display());
                self.append(id, ContextEntry::observation(text));
            }
            Err(err) => self.reject(id, label, err.to_string()),
        }
    }

    async fn update_readme(&mut self, id: AgentId, label: &str, content: &str) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if !node.capabilities().can_restructure {
            let reason = format!("a {} has no README", node.role());
            self.reject(id, label, reason);
            return;
        }
        let target = node.scope_path().join(README_FILE);
        match self.services.fs.write(&target, content).await {
            Ok(()) => {
                self.append(id, ContextEntry::observation(format!("Updated {}", target.display())));
            }
            Err(err) => self.reject(id, label, err.to_string()),
        }
    }

    /// A coder's tester is attached to its manager; coders own no children.
    async fn run_directive(&mut self, id: AgentId, label: &str, scope_hint: &str) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if !node.capabilities().can_run_tests {
            let reason = format!("a {} cannot run tests", node.role());
            self.reject(id, label, reason);
            return;
        }
        let hint = if scope_hint.trim().is_empty() {
            display_scope(node.scope_path())
        } else {
            scope_hint.trim().to_string()
        };
        let owner = match (node.role(), node.parent()) {
            (AgentRole::Coder, Some(parent)) => parent,
            _ => id,
        };

        match self.run_tester(owner, &hint).await {
            Ok(report) => {
                let verdict = if report.passed { "passed" } else { "failed" };
                let text = format!(
                    "RUN {hint}: {verdict}\n{}",
                    truncate_output(&report.diagnostics, RUN_OUTPUT_LINES)
                );
                self.append(id, ContextEntry::observation(text));
            }
            Err(err) => self.reject(id, label, err.to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Delegation
    // ------------------------------------------------------------------------

    /// Issue a batch of DELEGATE requests from `manager`.
    ///
    /// Independent requests are all issued. A request is deferred while its
    /// child already has a task or is still busy, or while its AFTER sibling
    /// is outstanding. Targets that do not exist come back as failures in the
    /// manager's context. Returns the number of tasks issued now.
    pub async fn delegate_many(
        &mut self,
        manager: AgentId,
        requests: Vec<DelegationRequest>,
    ) -> Result<usize, CoordinatorError> {
        let node = self.tree.node(manager)?;
        let role = node.role();
        if !role.capabilities().can_delegate {
            return Err(CoordinatorError::CannotDelegate { agent: manager, role });
        }
        if !self.mode.allows_delegation() {
            return Err(CoordinatorError::DelegationDisabled(self.mode));
        }
        let state = node.state();
        if !matches!(state, LifecycleState::Active | LifecycleState::Waiting) {
            return Err(LifecycleError::InvalidTransition {
                agent: manager,
                from: state,
                action: "delegate".to_string(),
            }
            .into());
        }

        let mut issued = 0;
        for request in requests {
            let label = format!("DELEGATE {}", request.target.display());
            let Some(path) = self.tree.resolve_child(manager, &request.target) else {
                self.reject(manager, &label, "not a direct child of this scope");
                continue;
            };
            let Some(child) = self.child_for(&path).await else {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_synthetic_failure();
                warn!(manager = %manager, path = %path.display(), "Delegation to a missing path");
                self.append(
                    manager,
                    ContextEntry::ChildResult {
                        child: path.clone(),
                        outcome: Outcome::Failure,
                        summary: format!("unknown recipient: {} does not exist", path.display()),
                    },
                );
                continue;
            };

            let after = match &request.after {
                Some(sibling) => {
                    let found = self
                        .tree
                        .resolve_child(manager, sibling)
                        .and_then(|p| self.tree.by_path(&p));
                    if found.is_none() {
                        let text = format!("AFTER {}: no such sibling, ignored", sibling.display());
                        self.append(manager, ContextEntry::observation(text));
                    }
                    found
                }
                None => None,
            };

            let task = DeferredTask {
                child,
                path,
                task: request.task,
                after,
            };
            if self.must_defer(manager, &task) {
                debug!(manager = %manager, child = %child, "Delegation deferred");
                self.agenda(manager).deferred.push_back(task);
                continue;
            }
            match self.issue(manager, task.child, task.task) {
                Ok(()) => issued += 1,
                Err(err) => self.reject(manager, &label, err.to_string()),
            }
        }

        self.settle_delegating(manager)?;
        Ok(issued)
    }

    /// Node owning `path`, created lazily when the path exists on disk.
    async fn child_for(&mut self, path: &Path) -> Option<AgentId> {
        if let Some(id) = self.tree.by_path(path) {
            return Some(id);
        }
        match self.services.fs.kind(path).await {
            Ok(Some(kind)) => match self.tree.ensure_node(path, kind) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Could not create node");
                    None
                }
            },
            Ok(None) | Err(_) => None,
        }
    }

    fn must_defer(&self, manager: AgentId, task: &DeferredTask) -> bool {
        let Some(node) = self.tree.get(manager) else {
            return false;
        };
        let deferred = self.agendas.get(&manager).map(|a| &a.deferred);
        let queued = |id: AgentId| deferred.map(|d| d.iter().any(|t| t.child == id)).unwrap_or(false);
        let child_busy = self
            .tree
            .get(task.child)
            .map(|c| c.state().is_busy())
            .unwrap_or(false);

        node.outstanding().contains_key(&task.child)
            || child_busy
            || queued(task.child)
            || task
                .after
                .map(|sibling| node.outstanding().contains_key(&sibling) || queued(sibling))
                .unwrap_or(false)
    }

    /// Send one task and record it as outstanding.
    fn issue(&mut self, manager: AgentId, child: AgentId, text: String) -> Result<(), CoordinatorError> {
        if self.tree.node(manager)?.state() != LifecycleState::Delegating {
            self.transition(manager, LifecycleState::Delegating)?;
        }
        let task = TaskMessage::new(manager, child, text);
        self.bus.register(child);
        self.bus.send(Envelope::Delegation(task.clone()))?;
        self.tree.node_mut(manager)?.outstanding.insert(
            child,
            OutstandingTask {
                task_id: task.task_id,
                task_text: task.task_text,
                issued_at: Instant::now(),
                status: ChildTaskStatus::Issued,
            },
        );

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_delegation();
        info!(manager = %manager, child = %child, task_id = %task.task_id, "Task delegated");
        Ok(())
    }

    /// Leave `Delegating`: wait if anything is outstanding, otherwise go back to work.
    fn settle_delegating(&mut self, manager: AgentId) -> Result<(), CoordinatorError> {
        let node = self.tree.node(manager)?;
        if node.state() != LifecycleState::Delegating {
            return Ok(());
        }
        let next = if node.outstanding().is_empty() {
            LifecycleState::Active
        } else {
            LifecycleState::Waiting
        };
        self.transition(manager, next)
    }

    /// Issue deferred tasks that are no longer blocked, in order.
    fn release_deferred(&mut self, manager: AgentId) {
        let Some(agenda) = self.agendas.get_mut(&manager) else {
            return;
        };
        if agenda.deferred.is_empty() {
            return;
        }
        let pending: Vec<DeferredTask> = agenda.deferred.drain(..).collect();
        for task in pending {
            if self.must_defer(manager, &task) {
                self.agenda(manager).deferred.push_back(task);
                continue;
            }
            let label = format!("DELEGATE {}", task.path.display());
            if let Err(err) = self.issue(manager, task.child, task.task) {
                self.reject(manager, &label, err.to_string());
            }
        }
        if let Err(err) = self.settle_delegating(manager) {
            warn!(manager = %manager, error = %err, "Could not settle after releasing tasks");
        }
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    /// Handle a RESULT addressed to a manager.
    pub async fn on_result(&mut self, result: ResultMessage) {
        self.resolve_child_task(result, ChildTaskStatus::ResultReceived).await;
    }

    async fn resolve_child_task(&mut self, result: ResultMessage, status: ChildTaskStatus) {
        let manager = result.recipient_id;
        let child = result.sender_id;
        let Some(node) = self.tree.get_mut(manager) else {
            warn!(recipient = %manager, "Result for an agent that no longer exists");
            return;
        };

        let matches = node
            .outstanding
            .get(&child)
            .map(|task| task.task_id == result.task_id)
            .unwrap_or(false);
        if !matches {
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_stale_result();
            warn!(manager = %manager, child = %child, task_id = %result.task_id, "Stale result ignored");
            // The child is free again; anything queued behind it may go.
            if node.state().is_busy() {
                self.release_deferred(manager);
            }
            return;
        }

        if let Some(mut task) = node.outstanding.remove(&child) {
            task.status = status;
            debug!(manager = %manager, child = %child, status = ?task.status, "Child task resolved");
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_result(result.outcome.is_success());

        let child_path = self
            .tree
            .get(child)
            .map(|c| c.scope_path().to_path_buf())
            .unwrap_or_default();
        self.append(
            manager,
            ContextEntry::ChildResult {
                child: child_path,
                outcome: result.outcome,
                summary: result.summary(self.config.summary_chars),
            },
        );

        self.release_deferred(manager);
        self.apply_wait_mode(manager).await;
    }

    async fn apply_wait_mode(&mut self, manager: AgentId) {
        let Some(node) = self.tree.get(manager) else {
            return;
        };
        if node.state() == LifecycleState::Waiting && node.outstanding().is_empty() {
            if let Err(err) = self.transition(manager, LifecycleState::Active) {
                warn!(manager = %manager, error = %err, "Could not resume");
            }
        }

        let open = self.has_open_children(manager);
        let wait = self.agenda(manager).wait;
        match wait {
            WaitMode::Finishing if !open => {
                let agenda = self.agenda(manager);
                agenda.wait = WaitMode::Reactive;
                let (outcome, summary) = agenda.finish.take().unwrap_or((Outcome::Success, String::new()));
                self.complete_node(manager, outcome, summary);
            }
            WaitMode::Finishing => {}
            WaitMode::Suspended => {
                self.agenda(manager).wait = WaitMode::Reactive;
                self.run_agenda(manager).await;
            }
            WaitMode::Barrier if !open => {
                self.agenda(manager).wait = WaitMode::Reactive;
                self.request_turn(manager);
            }
            WaitMode::Barrier => {}
            WaitMode::Reactive => {
                let agenda = self.agenda(manager);
                if agenda.turn_in_flight {
                    agenda.unseen_results += 1;
                }
                self.request_turn(manager);
            }
        }
    }

    /// Fail `child`'s outstanding task on `manager`'s behalf.
    pub async fn abandon(
        &mut self,
        manager: AgentId,
        child: AgentId,
        reason: &str,
    ) -> Result<(), CoordinatorError> {
        self.fail_child_task(manager, child, reason, ChildTaskStatus::Abandoned)
            .await
    }

    async fn fail_child_task(
        &mut self,
        manager: AgentId,
        child: AgentId,
        reason: &str,
        status: ChildTaskStatus,
    ) -> Result<(), CoordinatorError> {
        let task = self
            .tree
            .node(manager)?
            .outstanding()
            .get(&child)
            .cloned()
            .ok_or(CoordinatorError::NoOutstandingTask { manager, child })?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_synthetic_failure();
        warn!(manager = %manager, child = %child, status = ?status, reason, "Child task failed synthetically");

        let result = ResultMessage {
            task_id: task.task_id,
            sender_id: child,
            recipient_id: manager,
            result_text: reason.to_string(),
            outcome: Outcome::Failure,
            timestamp: Utc::now(),
        };
        self.resolve_child_task(result, status).await;
        Ok(())
    }

    /// Surface child tasks older than the configured limit as failures.
    pub async fn check_timeouts(&mut self) {
        let Some(secs) = self.config.child_task_timeout_secs else {
            return;
        };
        let limit = Duration::from_secs(secs);
        let now = Instant::now();
        let mut expired = Vec::new();
        for id in self.tree.ids() {
            if let Some(node) = self.tree.get(id) {
                for (child, task) in node.outstanding() {
                    if now.duration_since(task.issued_at) >= limit {
                        expired.push((id, *child));
                    }
                }
            }
        }

        let reason = format!("timed out after {secs}s");
        for (manager, child) in expired {
            if let Err(err) = self
                .fail_child_task(manager, child, &reason, ChildTaskStatus::TimedOut)
                .await
            {
                debug!(error = %err, "Timeout raced with a result");
            }
        }
    }

    /// Abandon every outstanding task in the tree and stop further scheduling.
    ///
    /// Each manager gets a failure entry per abandoned child. Returns the
    /// number of tasks abandoned.
    pub fn abandon_all(&mut self, reason: &str) -> usize {
        let mut count = 0;
        for id in self.tree.dfs() {
            let abandoned: Vec<(AgentId, OutstandingTask)> = match self.tree.get_mut(id) {
                Some(node) => std::mem::take(&mut node.outstanding).into_iter().collect(),
                None => continue,
            };
            for (child, task) in abandoned {
                count += 1;
                warn!(manager = %id, child = %child, task_id = %task.task_id, reason, "Task abandoned");
                let path = self
                    .tree
                    .get(child)
                    .map(|c| c.scope_path().to_path_buf())
                    .unwrap_or_default();
                self.append(
                    id,
                    ContextEntry::ChildResult {
                        child: path,
                        outcome: Outcome::Failure,
                        summary: reason.to_string(),
                    },
                );
            }
            if let Some(agenda) = self.agendas.get_mut(&id) {
                agenda.directives.clear();
                agenda.deferred.clear();
                agenda.finish = None;
                agenda.wait = WaitMode::Reactive;
                agenda.turn_requested = false;
            }
            let state = self.tree.get(id).map(|n| n.state());
            if matches!(state, Some(LifecycleState::Delegating | LifecycleState::Waiting)) {
                if let Err(err) = self.transition(id, LifecycleState::Active) {
                    warn!(agent = %id, error = %err, "Could not resume after abandoning tasks");
                }
            }
        }
        count
    }

    /// Drop all queued traffic and return every node to `Inactive`.
    pub fn force_idle(&mut self) {
        while self.bus.next_delivery().is_some() {}
        self.controller_inbox.clear();
        self.human_question = None;
        self.agendas.clear();

        for id in self.tree.dfs() {
            let Some(node) = self.tree.get_mut(id) else {
                continue;
            };
            node.outstanding.clear();
            let steps: &[LifecycleState] = match node.state() {
                LifecycleState::Inactive => continue,
                LifecycleState::Active => &[LifecycleState::Failed],
                LifecycleState::Delegating | LifecycleState::Waiting => {
                    &[LifecycleState::Active, LifecycleState::Failed]
                }
                LifecycleState::Completed | LifecycleState::Failed => &[],
            };
            let mut result = steps.iter().try_for_each(|step| node.transition(*step));
            if result.is_ok() {
                result = node.deactivate();
            }
            if let Err(err) = result {
                warn!(agent = %id, error = %err, "Could not idle agent");
            }
            self.emit(id);
        }
    }

    // ------------------------------------------------------------------------
    // Completion and testers
    // ------------------------------------------------------------------------

    /// Finish `id`'s activation and send its RESULT to whoever tasked it.
    fn complete_node(&mut self, id: AgentId, outcome: Outcome, summary: impl Into<String>) {
        let summary = summary.into();
        if let Err(err) = self.try_complete(id, outcome, &summary) {
            warn!(agent = %id, error = %err, "Could not complete agent");
        }
    }

    fn try_complete(&mut self, id: AgentId, outcome: Outcome, summary: &str) -> Result<(), CoordinatorError> {
        let outstanding = self.tree.node(id)?.outstanding().len();
        if outstanding > 0 {
            return Err(CoordinatorError::ChildrenOutstanding { manager: id, outstanding });
        }
        self.agendas.remove(&id);

        if matches!(
            self.tree.node(id)?.state(),
            LifecycleState::Delegating | LifecycleState::Waiting
        ) {
            self.transition(id, LifecycleState::Active)?;
        }
        let terminal = if outcome.is_success() {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        };
        let short = summarize(summary, self.config.summary_chars);
        let node = self.tree.node_mut(id)?;
        node.transition(terminal)?;
        node.set_last_result(short);
        let task = node.pending_task().cloned();
        self.emit(id);

        if let Some(task) = task {
            let reply = ResultMessage::reply_to(&task, outcome, summary);
            if let Err(err) = self.bus.send(Envelope::Result(reply)) {
                warn!(agent = %id, error = %err, "Result could not be sent");
            }
        }

        self.tree.node_mut(id)?.deactivate()?;
        self.emit(id);
        info!(agent = %id, outcome = outcome.name(), "Agent finished");
        Ok(())
    }

    /// Run an ephemeral tester below `parent`; the tester is gone when this returns.
    pub async fn run_tester(
        &mut self,
        parent: AgentId,
        scope_hint: &str,
    ) -> Result<TesterReport, CoordinatorError> {
        let tester = self.tree.spawn_ephemeral(parent)?;
        let outcome = self.drive_tester(parent, tester, scope_hint).await;
        let dismissed = self.tree.dismiss_ephemeral(tester);
        let report = outcome?;
        dismissed?;
        Ok(report)
    }

    async fn drive_tester(
        &mut self,
        parent: AgentId,
        tester: AgentId,
        scope_hint: &str,
    ) -> Result<TesterReport, CoordinatorError> {
        let task = TaskMessage::new(parent, tester, format!("RUN {scope_hint}"));
        self.tree.node_mut(tester)?.activate(task, BTreeMap::new())?;
        self.emit(tester);

        let runner = Arc::clone(&self.services.tester);
        let report = match runner.run(scope_hint).await {
            Ok(report) => report,
            Err(err) => {
                warn!(scope = scope_hint, error = %err, "Tester could not run");
                TesterReport::fail(err.to_string())
            }
        };
        info!(scope = scope_hint, passed = report.passed, "Tester finished");

        let verdict = if report.passed { "passed" } else { "failed" };
        let summary = format!("{verdict}: {}", summarize(&report.diagnostics, self.config.summary_chars));
        let node = self.tree.node_mut(tester)?;
        node.transition(if report.passed {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        })?;
        node.set_last_result(summary);
        self.emit(tester);
        self.tree.node_mut(tester)?.deactivate()?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn agenda(&mut self, id: AgentId) -> &mut Agenda {
        self.agendas.entry(id).or_default()
    }

    fn request_turn(&mut self, id: AgentId) {
        self.agenda(id).turn_requested = true;
    }

    fn has_open_children(&self, id: AgentId) -> bool {
        let outstanding = self
            .tree
            .get(id)
            .map(|n| !n.outstanding().is_empty())
            .unwrap_or(false);
        let deferred = self
            .agendas
            .get(&id)
            .map(|a| !a.deferred.is_empty())
            .unwrap_or(false);
        outstanding || deferred
    }

    fn transition(&mut self, id: AgentId, next: LifecycleState) -> Result<(), CoordinatorError> {
        self.tree.node_mut(id)?.transition(next)?;
        self.emit(id);
        Ok(())
    }

    fn append(&mut self, id: AgentId, entry: ContextEntry) {
        if let Some(node) = self.tree.get_mut(id) {
            if let Err(err) = node.append_context(entry) {
                debug!(agent = %id, error = %err, "Context entry dropped");
            }
        }
    }

    fn reject(&mut self, id: AgentId, directive: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(agent = %id, directive, reason = %reason, "Directive rejected");
        self.append(id, ContextEntry::rejected(directive, reason));
    }

    fn send_synthetic(&mut self, task: &TaskMessage, reason: impl Into<String>) {
        let reason = reason.into();
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_synthetic_failure();
        warn!(task_id = %task.task_id, recipient = %task.recipient_id, reason = %reason, "Task failed before activation");
        let result = ResultMessage::synthetic_failure(task, reason);
        if let Err(err) = self.bus.send(Envelope::Result(result)) {
            warn!(error = %err, "Synthetic failure could not be sent");
        }
    }

    fn emit(&self, id: AgentId) {
        if let Some(node) = self.tree.get(id) {
            events::publish(&self.events, TreeEvent::Transition(node.snapshot()));
        }
    }
}

/// `path` made project-relative inside `scope`; `None` when it escapes or is the scope itself.
fn resolve_in_scope(scope: &Path, path: &Path) -> Option<PathBuf> {
    let candidate = if path.starts_with(scope) {
        path.to_path_buf()
    } else {
        scope.join(path)
    };
    (candidate != scope && candidate.starts_with(scope)).then_some(candidate)
}

fn display_scope(scope: &Path) -> String {
    if scope.as_os_str().is_empty() {
        ".".to_string()
    } else {
        scope.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TesterError;
    use crate::providers::ScriptedProvider;
    use crate::workspace::MemoryFileSystem;
    use async_trait::async_trait;

    struct FixedTester(bool);

    #[async_trait]
    impl TesterAgentRunner for FixedTester {
        async fn run(&self, scope_hint: &str) -> Result<TesterReport, TesterError> {
            Ok(TesterReport {
                passed: self.0,
                diagnostics: format!("ran {scope_hint}"),
            })
        }
    }

    fn coordinator_with(fs: MemoryFileSystem, config: AgentsConfig) -> (Coordinator, Arc<MemoryFileSystem>) {
        let fs = Arc::new(fs);
        let services = Services::new(
            Arc::new(ScriptedProvider::new()),
            fs.clone(),
            Arc::new(FixedTester(true)),
        );
        let tree = AgentTree::new(config.max_context_entries);
        (Coordinator::new(tree, services, config, events::channel()), fs)
    }

    fn coordinator(fs: MemoryFileSystem) -> (Coordinator, Arc<MemoryFileSystem>) {
        coordinator_with(fs, AgentsConfig::default())
    }

    async fn pump(c: &mut Coordinator) {
        while let Some(envelope) = c.next_delivery() {
            c.deliver(envelope).await;
        }
    }

    fn ready_ids(c: &mut Coordinator) -> Vec<AgentId> {
        c.take_ready().into_iter().map(|r| r.agent).collect()
    }

    async fn reply(c: &mut Coordinator, agent: AgentId, text: &str) {
        let result = LineInterpreter::new().parse(text).map_err(TurnError::from);
        c.on_turn_complete(TurnOutcome {
            agent,
            response: Some(text.to_string()),
            result,
        })
        .await;
    }

    fn id_of(c: &Coordinator, path: &str) -> AgentId {
        c.tree().by_path(Path::new(path)).unwrap()
    }

    fn state_of(c: &Coordinator, id: AgentId) -> LifecycleState {
        c.tree().node(id).unwrap().state()
    }

    /// Root is active and its first turn has been taken.
    async fn start_root(c: &mut Coordinator) -> (AgentId, TaskMessage) {
        let task = c.dispatch_root_task("build it").unwrap();
        pump(c).await;
        let root = c.tree().root();
        assert_eq!(ready_ids(c), vec![root]);
        (root, task)
    }

    fn three_files() -> MemoryFileSystem {
        MemoryFileSystem::with_files([("a.py", ""), ("b.py", ""), ("c.py", "")])
    }

    #[tokio::test]
    async fn test_fan_out_then_results_in_any_order() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;

        reply(&mut c, root, "DELEGATE a.py: one\nDELEGATE b.py: two\nDELEGATE c.py: three").await;
        assert_eq!(state_of(&c, root), LifecycleState::Waiting);
        assert_eq!(c.tree().node(root).unwrap().outstanding().len(), 3);

        pump(&mut c).await;
        let (a, b, cc) = (id_of(&c, "a.py"), id_of(&c, "b.py"), id_of(&c, "c.py"));
        assert_eq!(ready_ids(&mut c), vec![a, b, cc]);

        for child in [cc, a, b] {
            reply(&mut c, child, "FINISH SUCCESS: done").await;
            assert_eq!(state_of(&c, child), LifecycleState::Inactive);
            pump(&mut c).await;
        }

        let node = c.tree().node(root).unwrap();
        assert!(node.outstanding().is_empty());
        assert_eq!(node.state(), LifecycleState::Active);
        let results = node
            .context()
            .iter()
            .filter(|e| matches!(e, ContextEntry::ChildResult { .. }))
            .count();
        assert_eq!(results, 3);
    }

    #[tokio::test]
    async fn test_retasking_leaves_siblings_untouched() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: one\nDELEGATE b.py: two").await;
        pump(&mut c).await;
        let (a, b) = (id_of(&c, "a.py"), id_of(&c, "b.py"));
        ready_ids(&mut c);
        let b_task = c.tree().node(root).unwrap().outstanding()[&b].task_id;

        reply(&mut c, a, "FINISH SUCCESS: first pass").await;
        pump(&mut c).await;
        assert_eq!(state_of(&c, root), LifecycleState::Waiting);
        assert_eq!(ready_ids(&mut c), vec![root]);

        reply(&mut c, root, "DELEGATE a.py: second pass").await;
        let root_node = c.tree().node(root).unwrap();
        assert_eq!(root_node.outstanding().len(), 2);
        assert_eq!(root_node.outstanding()[&b].task_id, b_task);

        pump(&mut c).await;
        assert_eq!(state_of(&c, a), LifecycleState::Active);
        assert_eq!(c.tree().node(a).unwrap().activations(), 2);
        // Fresh activation: nothing from the first pass is remembered.
        let a_node = c.tree().node(a).unwrap();
        assert!(a_node.context().is_empty());
        assert_eq!(a_node.pending_task().map(|t| t.task_text.as_str()), Some("second pass"));
        assert!(a_node.briefing().is_some());
    }

    #[tokio::test]
    async fn test_wait_with_nothing_outstanding_is_noop() {
        let (mut c, _) = coordinator(three_files());
        let (root, task) = start_root(&mut c).await;

        reply(&mut c, root, "WAIT\nFINISH SUCCESS: nothing to do").await;
        assert_eq!(state_of(&c, root), LifecycleState::Inactive);

        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.result_text, "nothing to do");
    }

    #[tokio::test]
    async fn test_mid_stream_wait_resumes_on_result() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;

        reply(&mut c, root, "DELEGATE a.py: one\nWAIT\nDELEGATE b.py: two").await;
        assert_eq!(c.tree().node(root).unwrap().outstanding().len(), 1);

        pump(&mut c).await;
        let a = id_of(&c, "a.py");
        ready_ids(&mut c);
        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;

        let b = id_of(&c, "b.py");
        let outstanding = c.tree().node(root).unwrap().outstanding();
        assert_eq!(outstanding.keys().copied().collect::<Vec<_>>(), vec![b]);
        // Suspended directives resumed; no extra turn was scheduled.
        pump(&mut c).await;
        assert_eq!(ready_ids(&mut c), vec![b]);
    }

    #[tokio::test]
    async fn test_barrier_wait_turns_once_all_arrive() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: one\nDELEGATE b.py: two\nWAIT").await;
        pump(&mut c).await;
        let (a, b) = (id_of(&c, "a.py"), id_of(&c, "b.py"));
        ready_ids(&mut c);

        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;
        assert!(ready_ids(&mut c).is_empty());

        reply(&mut c, b, "FINISH").await;
        pump(&mut c).await;
        assert_eq!(state_of(&c, root), LifecycleState::Active);
        assert_eq!(ready_ids(&mut c), vec![root]);
    }

    #[tokio::test]
    async fn test_finish_waits_for_outstanding_children() {
        let (mut c, _) = coordinator(three_files());
        let (root, task) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: one\nFINISH SUCCESS: all done").await;
        assert_eq!(state_of(&c, root), LifecycleState::Waiting);

        pump(&mut c).await;
        let a = id_of(&c, "a.py");
        ready_ids(&mut c);
        reply(&mut c, a, "FINISH FAILURE: could not").await;
        pump(&mut c).await;
        assert_eq!(state_of(&c, root), LifecycleState::Inactive);

        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_after_defers_until_sibling_result() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: write\nDELEGATE b.py AFTER a.py: read a").await;

        let a = id_of(&c, "a.py");
        let outstanding: Vec<_> = c.tree().node(root).unwrap().outstanding().keys().copied().collect();
        assert_eq!(outstanding, vec![a]);

        pump(&mut c).await;
        ready_ids(&mut c);
        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;

        let b = id_of(&c, "b.py");
        assert!(c.tree().node(root).unwrap().outstanding().contains_key(&b));
    }

    #[tokio::test]
    async fn test_second_task_to_same_child_is_deferred() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: first\nDELEGATE a.py: second").await;
        assert_eq!(c.tree().node(root).unwrap().outstanding().len(), 1);

        pump(&mut c).await;
        let a = id_of(&c, "a.py");
        ready_ids(&mut c);
        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;
        // The result came back and released the second task.
        assert!(c.tree().node(root).unwrap().outstanding().contains_key(&a));
        pump(&mut c).await;
        let prompt_task = c.tree().node(a).unwrap().pending_task().unwrap().task_text.clone();
        assert_eq!(prompt_task, "second");
    }

    #[tokio::test]
    async fn test_delegate_to_missing_path_is_failure_in_context() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE nope.py: write").await;

        let node = c.tree().node(root).unwrap();
        assert_eq!(node.state(), LifecycleState::Active);
        assert!(node.context().iter().any(|e| matches!(
            e,
            ContextEntry::ChildResult { outcome: Outcome::Failure, summary, .. } if summary.contains("unknown recipient")
        )));
    }

    #[tokio::test]
    async fn test_write_then_read_between_coders() {
        let (mut c, fs) = coordinator(MemoryFileSystem::with_files([("lib/util.py", ""), ("lib/main.py", "")]));
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE lib: build").await;
        pump(&mut c).await;
        let lib = id_of(&c, "lib");
        ready_ids(&mut c);
        reply(&mut c, lib, "DELEGATE util.py: write\nDELEGATE main.py AFTER util.py: use util").await;
        pump(&mut c).await;
        let util = id_of(&c, "lib/util.py");
        ready_ids(&mut c);

        reply(&mut c, util, "CHANGE util.py <<<\ndef add(a, b):\n    return a + b\n>>>\nFINISH").await;
        pump(&mut c).await;
        pump(&mut c).await;
        let main = id_of(&c, "lib/main.py");
        assert!(ready_ids(&mut c).contains(&main));

        reply(&mut c, main, "READ util.py").await;
        let seen = c.tree().node(main).unwrap().context().iter().any(|e| {
            matches!(e, ContextEntry::Observation { text } if text.contains("return a + b"))
        });
        assert!(seen);
        assert!(fs.files().await[Path::new("lib/util.py")].contains("def add"));
    }

    #[tokio::test]
    async fn test_capability_rejections() {
        let (mut c, fs) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;

        reply(&mut c, root, "CHANGE a.py <<<\nx = 1\n>>>").await;
        assert!(c.tree().node(root).unwrap().context().iter().any(|e| matches!(e, ContextEntry::Rejected { .. })));
        ready_ids(&mut c);

        reply(&mut c, root, "DELEGATE a.py: go").await;
        pump(&mut c).await;
        let a = id_of(&c, "a.py");
        ready_ids(&mut c);
        reply(&mut c, a, "CREATE extra.py\nCHANGE b.py <<<\nstolen\n>>>\nDELEGATE b.py: no").await;
        let rejected = c
            .tree()
            .node(a)
            .unwrap()
            .context()
            .iter()
            .filter(|e| matches!(e, ContextEntry::Rejected { .. }))
            .count();
        assert_eq!(rejected, 3);
        assert_eq!(fs.files().await[Path::new("b.py")], "");
        assert!(c.tree().by_path(Path::new("extra.py")).is_none());
    }

    #[tokio::test]
    async fn test_create_and_delete_structure() {
        let (mut c, fs) = coordinator(MemoryFileSystem::new());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "CREATE pkg/\nCREATE pkg/core.py\nUPDATE_README <<<\n# demo\n>>>").await;

        let core = id_of(&c, "pkg/core.py");
        assert_eq!(c.tree().node(core).unwrap().role(), AgentRole::Coder);
        assert_eq!(fs.files().await[Path::new("README.md")], "# demo");

        ready_ids(&mut c);
        reply(&mut c, root, "DELETE pkg").await;
        assert!(c.tree().by_path(Path::new("pkg")).is_none());
        assert!(c.tree().get(core).is_none());
    }

    #[tokio::test]
    async fn test_delete_of_working_path_rejected() {
        let (mut c, fs) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: go\nDELETE a.py").await;
        assert!(fs.files().await.contains_key(Path::new("a.py")));
        assert!(c.tree().by_path(Path::new("a.py")).is_some());
    }

    #[tokio::test]
    async fn test_parse_error_fails_node() {
        let (mut c, _) = coordinator(three_files());
        let (root, task) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE").await;
        assert_eq!(state_of(&c, root), LifecycleState::Inactive);

        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Failure);
        assert!(result.result_text.contains("parse"));
        assert!(c.tree().node(root).unwrap().last_result().is_some());
    }

    #[tokio::test]
    async fn test_turn_budget_fails_node() {
        let config = AgentsConfig {
            max_turns_per_activation: 2,
            ..AgentsConfig::default()
        };
        let (mut c, _) = coordinator_with(three_files(), config);
        let (root, task) = start_root(&mut c).await;
        reply(&mut c, root, "READ a.py").await;
        assert_eq!(ready_ids(&mut c), vec![root]);
        reply(&mut c, root, "READ b.py").await;
        assert!(ready_ids(&mut c).is_empty());

        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Failure);
        assert!(result.result_text.contains("turn budget"));
    }

    #[tokio::test]
    async fn test_parse_error_waits_for_running_children() {
        let (mut c, _) = coordinator(three_files());
        let (root, task) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: one\nDELEGATE b.py: two").await;
        pump(&mut c).await;
        let (a, b) = (id_of(&c, "a.py"), id_of(&c, "b.py"));
        ready_ids(&mut c);

        reply(&mut c, a, "FINISH SUCCESS: first").await;
        pump(&mut c).await;
        assert_eq!(ready_ids(&mut c), vec![root]);

        reply(&mut c, root, "DELEGATE").await;
        assert_eq!(state_of(&c, root), LifecycleState::Waiting);
        assert_eq!(state_of(&c, b), LifecycleState::Active);
        assert!(c.tree().node(root).unwrap().outstanding().contains_key(&b));
        pump(&mut c).await;
        assert!(c.take_controller_result(task.task_id).is_none());
        assert!(ready_ids(&mut c).is_empty());

        reply(&mut c, b, "FINISH SUCCESS: second").await;
        pump(&mut c).await;
        assert_eq!(state_of(&c, root), LifecycleState::Inactive);
        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Failure);
        assert!(result.result_text.contains("parse"));
    }

    #[tokio::test]
    async fn test_turn_budget_waits_for_running_children() {
        let config = AgentsConfig {
            max_turns_per_activation: 2,
            ..AgentsConfig::default()
        };
        let (mut c, _) = coordinator_with(three_files(), config);
        let (root, task) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: one\nDELEGATE b.py: two\nDELEGATE c.py: three").await;
        pump(&mut c).await;
        let (a, b, cc) = (id_of(&c, "a.py"), id_of(&c, "b.py"), id_of(&c, "c.py"));
        assert_eq!(ready_ids(&mut c), vec![a, b, cc]);

        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;
        assert_eq!(ready_ids(&mut c), vec![root]);
        reply(&mut c, root, "READ a.py").await;

        reply(&mut c, b, "FINISH").await;
        pump(&mut c).await;
        // Budget spent while c.py is still working.
        assert!(ready_ids(&mut c).is_empty());
        assert_eq!(state_of(&c, root), LifecycleState::Waiting);
        assert_eq!(state_of(&c, cc), LifecycleState::Active);
        pump(&mut c).await;
        assert!(c.take_controller_result(task.task_id).is_none());

        reply(&mut c, cc, "FINISH").await;
        pump(&mut c).await;
        pump(&mut c).await;
        let result = c.take_controller_result(task.task_id).unwrap();
        assert_eq!(result.outcome, Outcome::Failure);
        assert!(result.result_text.contains("turn budget"));
        assert!(c.tree().node(root).unwrap().outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_surfaces_failure() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: go\nWAIT").await;
        let a = id_of(&c, "a.py");

        c.abandon(root, a, "operator gave up").await.unwrap();
        let node = c.tree().node(root).unwrap();
        assert!(node.outstanding().is_empty());
        assert_eq!(node.state(), LifecycleState::Active);
        assert!(c.abandon(root, a, "again").await.is_err());

        // The child's late answer is stale.
        pump(&mut c).await;
        ready_ids(&mut c);
        reply(&mut c, a, "FINISH").await;
        pump(&mut c).await;
        assert!(c.tree().node(root).unwrap().outstanding().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_failure() {
        let config = AgentsConfig {
            child_task_timeout_secs: Some(5),
            ..AgentsConfig::default()
        };
        let (mut c, _) = coordinator_with(three_files(), config);
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: slow\nWAIT").await;

        c.check_timeouts().await;
        assert_eq!(c.tree().node(root).unwrap().outstanding().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        c.check_timeouts().await;
        let node = c.tree().node(root).unwrap();
        assert!(node.outstanding().is_empty());
        assert!(node.context().iter().any(|e| matches!(
            e,
            ContextEntry::ChildResult { summary, .. } if summary.contains("timed out")
        )));
    }

    #[tokio::test]
    async fn test_run_leaves_no_ephemeral_child() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "RUN .").await;

        let node = c.tree().node(root).unwrap();
        assert!(node.children().is_empty());
        assert!(node.context().iter().any(|e| matches!(
            e,
            ContextEntry::Observation { text } if text.starts_with("RUN .: passed")
        )));
    }

    #[tokio::test]
    async fn test_coder_run_attaches_tester_to_manager() {
        let (mut c, _) = coordinator(three_files());
        let mut events = c.events().subscribe();
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: check yourself").await;
        pump(&mut c).await;
        let a = id_of(&c, "a.py");
        ready_ids(&mut c);

        reply(&mut c, a, "RUN").await;
        let node = c.tree().node(a).unwrap();
        assert!(node.children().is_empty());
        assert!(node.context().iter().any(|e| matches!(
            e,
            ContextEntry::Observation { text } if text.starts_with("RUN a.py: passed")
        )));

        let mut tester_paths = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TreeEvent::Transition(snapshot) = event {
                if snapshot.role == AgentRole::Tester {
                    tester_paths.push(snapshot.path);
                }
            }
        }
        assert!(!tester_paths.is_empty());
        assert!(tester_paths.iter().all(|p| p.as_os_str().is_empty()));
        assert!(c.snapshot().iter().all(|s| s.role != AgentRole::Tester));
    }

    #[tokio::test]
    async fn test_clarification_parks_for_human() {
        let (mut c, _) = coordinator(MemoryFileSystem::new());
        c.set_mode(TurnMode::Clarification);
        let (root, _) = start_root(&mut c).await;

        reply(&mut c, root, "Which language should the project use?").await;
        let (agent, question) = c.take_human_question().unwrap();
        assert_eq!(agent, root);
        assert!(question.starts_with("Which language"));
        assert!(ready_ids(&mut c).is_empty());

        assert!(c.submit_human_reply("Python"));
        assert!(!c.submit_human_reply("again"));
        assert_eq!(ready_ids(&mut c), vec![root]);
    }

    #[tokio::test]
    async fn test_delegation_disabled_outside_waves() {
        let (mut c, _) = coordinator(three_files());
        c.set_mode(TurnMode::Structure);
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: go").await;
        assert!(c.tree().node(root).unwrap().outstanding().is_empty());
        assert!(c.tree().by_path(Path::new("a.py")).is_none());
    }

    #[tokio::test]
    async fn test_abandon_all_and_force_idle() {
        let (mut c, _) = coordinator(three_files());
        let (root, _) = start_root(&mut c).await;
        reply(&mut c, root, "DELEGATE a.py: go\nDELEGATE b.py: go").await;
        pump(&mut c).await;

        assert_eq!(c.abandon_all("cancelled"), 2);
        assert_eq!(state_of(&c, root), LifecycleState::Active);
        assert!(c
            .tree()
            .dfs()
            .into_iter()
            .filter_map(|id| c.tree().get(id))
            .all(|n| n.state() != LifecycleState::Waiting || !n.outstanding().is_empty()));
        let failures = c
            .tree()
            .node(root)
            .unwrap()
            .context()
            .iter()
            .filter(|e| matches!(e, ContextEntry::ChildResult { outcome: Outcome::Failure, .. }))
            .count();
        assert_eq!(failures, 2);
        c.force_idle();
        assert!(c.snapshot().iter().all(|s| s.state == LifecycleState::Inactive));
        assert!(!c.has_pending_work());
    }
}
