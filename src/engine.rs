// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async driver for the coordinator.
//!
//! The engine owns the [`Coordinator`] and a set of in-flight turns. Each
//! loop iteration delivers everything queued on the bus, starts every turn
//! that became ready, then waits for the first of: a turn finishing, the
//! cancel signal, or the timeout tick. Turns of different agents overlap;
//! their outcomes are applied one at a time.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::coordinator::{Coordinator, CoordinatorError, Services, TurnError, TurnOutcome, TurnRequest};
use crate::message::{ResultMessage, TaskMessage};
use crate::providers::{complete_with_retry, RetryPolicy};
use crate::telemetry::TurnSpan;

/// How often outstanding child tasks are checked for timeouts.
const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no agent can make progress and no result arrived")]
    Stalled,

    #[error("run cancelled")]
    Cancelled,

    #[error("agent turn panicked: {0}")]
    TurnPanicked(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Why [`Engine::run_until_result`] returned.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The root answered the controller's task.
    Result(ResultMessage),
    /// The master asked the human something and is parked until a reply.
    NeedsHuman { agent: AgentId, question: String },
}

enum Wake {
    Cancelled,
    Turn(Option<Result<TurnOutcome, tokio::task::JoinError>>),
    Tick,
}

pub struct Engine {
    coordinator: Coordinator,
    turns: JoinSet<TurnOutcome>,
    retry: RetryPolicy,
    cancel: watch::Receiver<bool>,
    ticker: Interval,
}

impl Engine {
    pub fn new(coordinator: Coordinator, retry: RetryPolicy, cancel: watch::Receiver<bool>) -> Self {
        Self {
            coordinator,
            turns: JoinSet::new(),
            retry,
            cancel,
            ticker: ticker(DEFAULT_TICK),
        }
    }

    /// Change how often timeouts are checked.
    pub fn with_tick(mut self, period: Duration) -> Self {
        self.ticker = ticker(period);
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    /// Number of turns currently running.
    pub fn turns_in_flight(&self) -> usize {
        self.turns.len()
    }

    /// Queue a task for the root agent.
    pub fn dispatch(&mut self, text: impl Into<String>) -> Result<TaskMessage, EngineError> {
        Ok(self.coordinator.dispatch_root_task(text)?)
    }

    /// Dispatch `text` to the root and drive the tree until it answers.
    pub async fn run_task(&mut self, text: impl Into<String>) -> Result<RunOutcome, EngineError> {
        let task = self.dispatch(text)?;
        self.run_until_result(task.task_id).await
    }

    /// Drive the tree until the root answers `task_id` or a human is needed.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(task_id = %task_id)))]
    pub async fn run_until_result(&mut self, task_id: Uuid) -> Result<RunOutcome, EngineError> {
        loop {
            if *self.cancel.borrow() {
                return Err(self.shut_down().await);
            }

            while let Some(envelope) = self.coordinator.next_delivery() {
                self.coordinator.deliver(envelope).await;
            }
            if let Some(result) = self.coordinator.take_controller_result(task_id) {
                debug!(task_id = %task_id, outcome = result.outcome.name(), "Root answered");
                return Ok(RunOutcome::Result(result));
            }
            if let Some((agent, question)) = self.coordinator.take_human_question() {
                return Ok(RunOutcome::NeedsHuman { agent, question });
            }

            for request in self.coordinator.take_ready() {
                self.spawn_turn(request);
            }

            if self.turns.is_empty() {
                if self.coordinator.has_pending_work() {
                    continue;
                }
                warn!(task_id = %task_id, "Engine stalled");
                return Err(EngineError::Stalled);
            }

            let wake = tokio::select! {
                _ = wait_for_cancel(&mut self.cancel) => Wake::Cancelled,
                joined = self.turns.join_next() => Wake::Turn(joined),
                _ = self.ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => return Err(self.shut_down().await),
                Wake::Turn(Some(Ok(outcome))) => self.coordinator.on_turn_complete(outcome).await,
                Wake::Turn(Some(Err(err))) => {
                    warn!(error = %err, "Turn task failed");
                    return Err(EngineError::TurnPanicked(err.to_string()));
                }
                Wake::Turn(None) => {}
                Wake::Tick => self.coordinator.check_timeouts().await,
            }
        }
    }

    fn spawn_turn(&mut self, request: TurnRequest) {
        let services = self.coordinator.services().clone();
        let retry = self.retry.clone();
        self.turns.spawn(run_turn(services, retry, request));
    }

    /// Abandon outstanding work, let running turns end and idle the tree.
    ///
    /// Turns are awaited rather than aborted; what they return is dropped.
    async fn shut_down(&mut self) -> EngineError {
        let abandoned = self.coordinator.abandon_all("run cancelled");
        let mut discarded = 0usize;
        while let Some(joined) = self.turns.join_next().await {
            match joined {
                Ok(outcome) => {
                    debug!(agent = %outcome.agent, "Discarding turn that ended after cancel");
                    discarded += 1;
                }
                Err(err) => warn!(error = %err, "Turn task failed during cancel"),
            }
        }
        self.coordinator.force_idle();
        info!(abandoned, discarded, "Run cancelled");
        EngineError::Cancelled
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Resolves once the flag is set; never resolves if the sender is gone.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One provider call plus parsing, off the coordinator's task.
async fn run_turn(services: Services, retry: RetryPolicy, request: TurnRequest) -> TurnOutcome {
    let TurnRequest { agent, prompt } = request;
    let span = TurnSpan::start(agent, prompt.role, &prompt.scope_path);

    let reply = complete_with_retry(services.provider.as_ref(), &prompt, &retry)
        .instrument(span.span().clone())
        .await;

    let (response, result) = match reply {
        Ok(text) => {
            let parsed = services.interpreter.parse(&text).map_err(TurnError::from);
            (Some(text), parsed)
        }
        Err(err) => (None, Err(TurnError::Provider(err))),
    };

    if let Ok(directives) = &result {
        span.record_directives(directives.len());
    }
    span.finish(result.is_ok());

    TurnOutcome {
        agent,
        response,
        result,
    }
}
