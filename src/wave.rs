// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spec → Test → Impl convergence loop.
//!
//! Each wave sends one phase task to the root agent and runs the engine until
//! the root answers. The controller then checks the phase's exit criterion
//! against the file system (and, for Impl, against tester reports) and decides
//! whether to advance, repeat, or go back.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::WavesConfig;
use crate::coordinator::CoordinatorError;
use crate::engine::{Engine, EngineError, RunOutcome};
use crate::error::FsError;
use crate::events::{self, ProjectPhase, TreeEvent, WavePhase};
use crate::message::{Outcome, ResultMessage};
use crate::tester::truncate_output;
use crate::timed;
use crate::tree::TreeError;

/// Lines of tester output kept per directory in phase diagnostics.
const TESTER_OUTPUT_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum WaveError {
    #[error("no convergence after {waves} waves (stuck in {phase}): {diagnostics}")]
    ConvergenceFailure {
        waves: u32,
        phase: WavePhase,
        diagnostics: String,
    },

    #[error("invalid test pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Where the controller gets human input during the waves.
#[async_trait]
pub trait GuidanceSource: Send + Sync {
    /// Ask for guidance after `diagnostics`; `None` means continue without.
    async fn guidance(&self, diagnostics: &str) -> Option<String>;
}

/// Never answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuidance;

#[async_trait]
impl GuidanceSource for NoGuidance {
    async fn guidance(&self, _diagnostics: &str) -> Option<String> {
        None
    }
}

/// Result of one exit-criterion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCheck {
    pub passed: bool,
    pub diagnostics: String,
}

impl PhaseCheck {
    fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: String::new(),
        }
    }

    fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// One wave as it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRun {
    pub wave: u32,
    pub phase: WavePhase,
    pub root_outcome: Outcome,
    pub passed: bool,
    pub diagnostics: String,
}

/// Summary of a converged run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveReport {
    pub waves: u32,
    pub runs: Vec<PhaseRun>,
}

// ============================================================================
// Test file classification
// ============================================================================

/// Decides which coder-owned files are tests.
#[derive(Debug, Clone)]
pub struct TestFileMatcher {
    prefix: String,
    patterns: GlobSet,
}

impl TestFileMatcher {
    pub fn new(prefix: impl Into<String>, patterns: &[String]) -> Result<Self, WaveError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| WaveError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let patterns = builder.build().map_err(|e| WaveError::InvalidPattern {
            pattern: "<set>".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            prefix: prefix.into(),
            patterns,
        })
    }

    pub fn from_config(config: &WavesConfig) -> Result<Self, WaveError> {
        Self::new(config.test_file_prefix.clone(), &config.test_patterns)
    }

    pub fn is_test(&self, path: &Path) -> bool {
        let prefixed = !self.prefix.is_empty()
            && path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(&self.prefix))
                .unwrap_or(false);
        prefixed || self.patterns.is_match(path)
    }

    /// Sibling test file expected for `source`.
    pub fn test_path_for(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = format!("{}{name}", self.prefix);
        match source.parent() {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Drives the waves until convergence or the wave cap.
pub struct WaveController {
    config: WavesConfig,
    matcher: TestFileMatcher,
    guidance: Arc<dyn GuidanceSource>,
}

impl WaveController {
    pub fn new(config: WavesConfig) -> Result<Self, WaveError> {
        let matcher = TestFileMatcher::from_config(&config)?;
        Ok(Self {
            config,
            matcher,
            guidance: Arc::new(NoGuidance),
        })
    }

    pub fn with_guidance(mut self, guidance: Arc<dyn GuidanceSource>) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn matcher(&self) -> &TestFileMatcher {
        &self.matcher
    }

    /// Run waves for `brief` until every exit criterion holds.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, engine, brief), fields(max_waves = self.config.max_waves)))]
    pub async fn run(&self, engine: &mut Engine, brief: &str) -> Result<WaveReport, WaveError> {
        let mut report = WaveReport::default();
        let mut phase = WavePhase::Spec;
        let mut notes: Option<String> = None;
        let mut guidance: Option<String> = None;
        let mut impl_failures = 0u32;
        let mut root_failures = 0u32;
        let mut revising_tests = false;

        loop {
            if report.waves >= self.config.max_waves {
                let diagnostics = notes.unwrap_or_else(|| "wave limit reached".to_string());
                return Err(self.give_up(engine, report.waves, phase, diagnostics));
            }
            report.waves += 1;
            let wave = report.waves;
            events::publish(
                engine.coordinator().events(),
                TreeEvent::PhaseChanged {
                    phase: ProjectPhase::Wave(phase),
                },
            );
            info!(wave, phase = %phase, "Wave started");

            let timer = timed!(&format!("wave.{phase}"));
            let task = self.phase_task(phase, wave, brief, notes.as_deref(), guidance.take());
            let result = self.run_phase(engine, task).await?;
            timer.finish();

            if result.outcome.is_success() {
                root_failures = 0;
            } else {
                root_failures += 1;
                warn!(wave, phase = %phase, failures = root_failures, "Root reported failure");
                if self.config.max_consecutive_root_failures > 0
                    && root_failures >= self.config.max_consecutive_root_failures
                {
                    root_failures = 0;
                    guidance = self.ask_guidance(engine, &result.result_text).await;
                }
            }

            let check = self.check_exit_criteria(engine, phase).await?;
            events::publish(
                engine.coordinator().events(),
                TreeEvent::WaveCompleted {
                    wave,
                    phase,
                    passed: check.passed,
                    diagnostics: check.diagnostics.clone(),
                },
            );
            info!(wave, phase = %phase, passed = check.passed, "Wave finished");
            report.runs.push(PhaseRun {
                wave,
                phase,
                root_outcome: result.outcome,
                passed: check.passed,
                diagnostics: check.diagnostics.clone(),
            });

            if !check.passed {
                notes = Some(check.diagnostics);
                if phase == WavePhase::Impl {
                    impl_failures += 1;
                    if self.config.test_revision_after > 0
                        && impl_failures >= self.config.test_revision_after
                    {
                        debug!(impl_failures, "Revisiting tests");
                        impl_failures = 0;
                        revising_tests = true;
                        phase = WavePhase::Test;
                    }
                }
                continue;
            }

            match phase {
                WavePhase::Spec => {
                    notes = None;
                    phase = WavePhase::Test;
                }
                WavePhase::Test => {
                    // Diagnostics from the failed Impl waves stay for the next one.
                    if !revising_tests {
                        notes = None;
                    }
                    revising_tests = false;
                    phase = WavePhase::Impl;
                }
                WavePhase::Impl => {
                    impl_failures = 0;
                    if let Some((regressed, check)) = self.recheck(engine).await? {
                        info!(phase = %regressed, "Earlier phase regressed");
                        notes = Some(check.diagnostics);
                        phase = regressed;
                        continue;
                    }
                    events::publish(
                        engine.coordinator().events(),
                        TreeEvent::PhaseChanged {
                            phase: ProjectPhase::Converged,
                        },
                    );
                    info!(waves = report.waves, "Project converged");
                    return Ok(report);
                }
            }
        }
    }

    /// Send one phase task to the root and wait for its answer.
    async fn run_phase(&self, engine: &mut Engine, task: String) -> Result<ResultMessage, WaveError> {
        let sent = engine.dispatch(task)?;
        loop {
            match engine.run_until_result(sent.task_id).await? {
                RunOutcome::Result(result) => return Ok(result),
                RunOutcome::NeedsHuman { agent, question } => {
                    debug!(agent = %agent, "Agent asked a question during the waves");
                    let reply = self
                        .guidance
                        .guidance(&question)
                        .await
                        .unwrap_or_else(|| "No answer; decide yourself and continue.".to_string());
                    engine.coordinator_mut().submit_human_reply(reply);
                }
            }
        }
    }

    async fn ask_guidance(&self, engine: &Engine, diagnostics: &str) -> Option<String> {
        events::publish(
            engine.coordinator().events(),
            TreeEvent::GuidanceRequested {
                diagnostics: diagnostics.to_string(),
            },
        );
        let reply = self.guidance.guidance(diagnostics).await;
        if reply.is_none() {
            debug!("No guidance received");
        }
        reply
    }

    fn give_up(&self, engine: &mut Engine, waves: u32, phase: WavePhase, diagnostics: String) -> WaveError {
        let coordinator = engine.coordinator_mut();
        let abandoned = coordinator.abandon_all("wave limit reached");
        coordinator.force_idle();
        warn!(waves, phase = %phase, abandoned, "Convergence failure");
        events::publish(
            coordinator.events(),
            TreeEvent::ConvergenceFailure {
                waves,
                phase,
                diagnostics: diagnostics.clone(),
            },
        );
        events::publish(
            coordinator.events(),
            TreeEvent::PhaseChanged {
                phase: ProjectPhase::Failed,
            },
        );
        WaveError::ConvergenceFailure {
            waves,
            phase,
            diagnostics,
        }
    }

    fn phase_task(
        &self,
        phase: WavePhase,
        wave: u32,
        brief: &str,
        notes: Option<&str>,
        guidance: Option<String>,
    ) -> String {
        let mut task = format!("Wave {wave}, {} phase.\nProject brief: {brief}\n", phase.name().to_uppercase());
        task.push_str(match phase {
            WavePhase::Spec => {
                "Give every source file its interface: signatures, types and doc comments, no bodies yet. \
                 Delegate each file to its owner."
            }
            WavePhase::Test => {
                "Every source file needs a sibling test file. Create missing ones and delegate \
                 writing the tests to their owners."
            }
            WavePhase::Impl => "Implement every source file so that its tests pass. Delegate to the owners.",
        });
        if phase == WavePhase::Test {
            let _ = write!(task, " Test files are named {}<source name>.", self.matcher.prefix);
        }
        task.push('\n');
        if let Some(notes) = notes {
            let _ = writeln!(task, "Problems from the last check:\n{notes}");
        }
        if let Some(guidance) = guidance {
            let _ = writeln!(task, "Guidance from the human:\n{guidance}");
        }
        task
    }

    /// Re-check Spec and Test after a passing Impl wave.
    async fn recheck(&self, engine: &mut Engine) -> Result<Option<(WavePhase, PhaseCheck)>, WaveError> {
        for phase in [WavePhase::Spec, WavePhase::Test] {
            let check = self.check_exit_criteria(engine, phase).await?;
            if !check.passed {
                return Ok(Some((phase, check)));
            }
        }
        Ok(None)
    }

    /// Evaluate `phase`'s exit criterion against the current project.
    pub async fn check_exit_criteria(
        &self,
        engine: &mut Engine,
        phase: WavePhase,
    ) -> Result<PhaseCheck, WaveError> {
        let fs = Arc::clone(&engine.coordinator().services().fs);
        engine
            .coordinator_mut()
            .tree_mut()
            .populate_from_fs(fs.as_ref())
            .await?;

        let (sources, tests): (Vec<PathBuf>, Vec<PathBuf>) = engine
            .coordinator()
            .tree()
            .coder_paths()
            .into_iter()
            .partition(|p| !self.matcher.is_test(p));

        match phase {
            WavePhase::Spec => {
                if sources.is_empty() {
                    return Ok(PhaseCheck::fail("no source files"));
                }
                let mut missing = Vec::new();
                for source in &sources {
                    if !has_content(fs.as_ref(), source).await? {
                        missing.push(format!("{} has no content", source.display()));
                    }
                }
                Ok(check_from(missing))
            }
            WavePhase::Test => {
                if sources.is_empty() {
                    return Ok(PhaseCheck::fail("no source files"));
                }
                let mut missing = Vec::new();
                for source in &sources {
                    let test = self.matcher.test_path_for(source);
                    if !has_content(fs.as_ref(), &test).await? {
                        missing.push(format!("{} needs tests in {}", source.display(), test.display()));
                    }
                }
                Ok(check_from(missing))
            }
            WavePhase::Impl => self.run_testers(engine, &tests).await,
        }
    }

    /// One tester per directory that holds test files.
    async fn run_testers(&self, engine: &mut Engine, tests: &[PathBuf]) -> Result<PhaseCheck, WaveError> {
        let dirs: BTreeSet<PathBuf> = tests
            .iter()
            .map(|t| t.parent().map(Path::to_path_buf).unwrap_or_default())
            .collect();
        if dirs.is_empty() {
            return Ok(PhaseCheck::fail("no test files"));
        }

        let mut passed = true;
        let mut diagnostics = String::new();
        for dir in dirs {
            let coordinator = engine.coordinator_mut();
            let owner = coordinator
                .tree()
                .by_path(&dir)
                .ok_or_else(|| TreeError::Fs(FsError::NotFound(dir.display().to_string())))?;
            let hint = if dir.as_os_str().is_empty() {
                ".".to_string()
            } else {
                dir.display().to_string()
            };
            let report = coordinator.run_tester(owner, &hint).await?;
            if !report.passed {
                passed = false;
                let _ = writeln!(
                    diagnostics,
                    "{hint}: failed\n{}",
                    truncate_output(&report.diagnostics, TESTER_OUTPUT_LINES)
                );
            }
        }
        Ok(PhaseCheck {
            passed,
            diagnostics,
        })
    }
}

fn check_from(problems: Vec<String>) -> PhaseCheck {
    if problems.is_empty() {
        PhaseCheck::pass()
    } else {
        PhaseCheck::fail(problems.join("\n"))
    }
}

async fn has_content(fs: &dyn crate::workspace::FileSystem, path: &Path) -> Result<bool, FsError> {
    match fs.read(path).await {
        Ok(content) => Ok(!content.trim().is_empty()),
        Err(FsError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
