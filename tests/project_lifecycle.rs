// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Whole-project runs through the orchestrator.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use tempfile::TempDir;

use codetree::config::{self, CliOptions, ResolvedConfig};
use codetree::coordinator::Services;
use codetree::error::TesterError;
use codetree::events::{ProjectPhase, TreeEvent, WavePhase};
use codetree::orchestrator::{Orchestrator, OrchestratorError};
use codetree::providers::{create_provider, ScriptedProvider};
use codetree::tester::{TesterAgentRunner, TesterReport};
use codetree::wave::WaveError;
use codetree::workspace::{LocalFileSystem, MemoryFileSystem};
use codetree::LifecycleState;

mock! {
    pub Tester {}

    #[async_trait]
    impl TesterAgentRunner for Tester {
        async fn run(&self, scope_hint: &str) -> Result<TesterReport, TesterError>;
    }
}

const ROOT_SCRIPT: [&str; 5] = [
    "CREATE calc.py\nFINISH SUCCESS: laid out",
    "DELEGATE calc.py: write the interface of add\nWAIT",
    "FINISH SUCCESS: interfaces written",
    "CREATE test_calc.py\nDELEGATE test_calc.py: test add\nWAIT",
    "FINISH SUCCESS: tests written",
];

fn calculator_script() -> ScriptedProvider {
    ScriptedProvider::new()
        .on(".", ROOT_SCRIPT)
        .on("calc.py", ["CHANGE calc.py <<<\ndef add(a, b):\n    return a + b\n>>>\nFINISH"])
        .on("test_calc.py", ["CHANGE test_calc.py <<<\nassert add(1, 2) == 3\n>>>\nFINISH"])
}

fn skip_clarification() -> ResolvedConfig {
    let mut config = ResolvedConfig::default();
    config.phases.skip_clarification = true;
    config
}

#[tokio::test]
async fn test_project_converges_without_clarification() {
    let mut tester = MockTester::new();
    tester
        .expect_run()
        .withf(|hint: &str| hint == ".")
        .times(1..)
        .returning(|_| Ok(TesterReport::pass("1 passed")));

    let fs = Arc::new(MemoryFileSystem::new());
    let services = Services::new(Arc::new(calculator_script()), fs.clone(), Arc::new(tester));
    let mut orch = Orchestrator::create_project("/tmp/calc", services, skip_clarification());
    let mut events = orch.subscribe();

    let report = orch.run_to_completion("a calculator").await.unwrap();

    assert_eq!(orch.phase(), ProjectPhase::Converged);
    assert!(report.runs.iter().any(|r| r.phase == WavePhase::Spec && r.passed));
    assert!(report.runs.last().is_some_and(|r| r.phase == WavePhase::Impl && r.passed));

    let files = fs.files().await;
    assert!(files[Path::new("calc.py")].contains("return a + b"));

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TreeEvent::PhaseChanged { phase } = event {
            phases.push(phase);
        }
    }
    assert!(!phases.contains(&ProjectPhase::Clarification));
    assert_eq!(phases.first(), Some(&ProjectPhase::Structure));
    assert_eq!(phases.last(), Some(&ProjectPhase::Converged));
    assert!(orch.snapshot().iter().all(|s| s.state == LifecycleState::Inactive));
}

#[tokio::test]
async fn test_project_gives_up_when_tests_never_pass() {
    let mut tester = MockTester::new();
    tester
        .expect_run()
        .returning(|_| Ok(TesterReport::fail("test_calc.py::test_add FAILED")));

    let mut config = skip_clarification();
    config.waves.max_waves = 5;

    let fs = Arc::new(MemoryFileSystem::new());
    let services = Services::new(Arc::new(calculator_script()), fs, Arc::new(tester));
    let mut orch = Orchestrator::create_project("/tmp/calc", services, config);
    let mut events = orch.subscribe();

    let err = orch.run_to_completion("a calculator").await.unwrap_err();
    let OrchestratorError::Wave(WaveError::ConvergenceFailure { waves, diagnostics, .. }) = err else {
        panic!("expected convergence failure, got {err}");
    };
    assert_eq!(waves, 5);
    assert!(diagnostics.contains("test_add FAILED"));
    assert_eq!(orch.phase(), ProjectPhase::Failed);

    let mut failed_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TreeEvent::PhaseChanged { phase: ProjectPhase::Failed }) {
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 1);
    assert!(orch.snapshot().iter().all(|s| s.state == LifecycleState::Inactive));
}

#[tokio::test]
async fn test_scripted_project_on_disk() {
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("script.yaml");
    std::fs::write(
        &script,
        r#"agents:
  ".":
    - "CREATE calc.py\nFINISH SUCCESS: laid out"
    - "DELEGATE calc.py: write add\nWAIT"
    - "FINISH SUCCESS: spec done"
    - "CREATE test_calc.py\nDELEGATE test_calc.py: test add\nWAIT"
    - "FINISH SUCCESS: tests done"
  calc.py:
    - "CHANGE calc.py <<<\ndef add(a, b):\n    return a + b\n>>>\nFINISH"
  test_calc.py:
    - "CHANGE test_calc.py <<<\nfrom calc import add\nassert add(1, 2) == 3\n>>>\nFINISH"
"#,
    )
    .unwrap();
    std::fs::write(temp.path().join(".codetree.json"), r#"{"phases": {"skipClarification": true}}"#).unwrap();

    let cli = CliOptions {
        provider: Some("scripted".to_string()),
        script: Some(script),
        ..Default::default()
    };
    let config = config::load_config(temp.path(), cli).unwrap();
    assert!(config.phases.skip_clarification);

    let mut tester = MockTester::new();
    tester
        .expect_run()
        .returning(|_| Ok(TesterReport::pass("1 passed")));

    let project = temp.path().join("project");
    std::fs::create_dir(&project).unwrap();
    let services = Services::new(
        create_provider(&config).unwrap(),
        Arc::new(LocalFileSystem::new(&project)),
        Arc::new(tester),
    );
    let mut orch = Orchestrator::create_project(&project, services, config);

    orch.run_to_completion("a calculator").await.unwrap();

    assert_eq!(orch.phase(), ProjectPhase::Converged);
    let written = std::fs::read_to_string(project.join("test_calc.py")).unwrap();
    assert!(written.contains("from calc import add"));
    assert!(orch.engine().coordinator().tree().by_path(Path::new("calc.py")).is_some());
}
